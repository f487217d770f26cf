//! Framing for the reliable path.
//!
//! Bulk payloads are split into fragments of at most 1 KiB, each carried in a
//! frame headed by the ASCII pair `MN`, a 32-bit sequence and a 16-bit
//! length. Acknowledgements are three magic bytes (`ACK` / `NCK`) followed by
//! the acknowledged sequence. A fragment shorter than the maximum terminates
//! a message; an exact-multiple payload is closed by an empty fragment.

use std::collections::HashMap;

use thiserror::Error;

/// Fragment-frame magic, ASCII `MN`.
pub const FRAGMENT_MAGIC: [u8; 2] = [0x4D, 0x4E];
/// Positive-acknowledgement magic, ASCII `ACK`.
pub const ACK_MAGIC: [u8; 3] = [0x41, 0x43, 0x4B];
/// Negative-acknowledgement magic, ASCII `NCK`.
pub const NACK_MAGIC: [u8; 3] = [0x4E, 0x43, 0x4B];
/// Maximum fragment body size in bytes.
pub const MAX_FRAGMENT_DATA: usize = 1024;
/// Fragment header size: magic + sequence + length.
pub const FRAGMENT_HEADER_LEN: usize = 8;

/// Errors from parsing a reliable frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than any valid encoding.
    #[error("reliable frame too short: {0} bytes")]
    TooShort(usize),
    /// Leading bytes match no known frame magic.
    #[error("unknown reliable frame magic")]
    BadMagic,
    /// Declared fragment length disagrees with the frame size.
    #[error("fragment length {declared} does not match body of {actual} bytes")]
    LengthMismatch {
        /// Length from the frame header.
        declared: usize,
        /// Bytes actually present after the header.
        actual: usize,
    },
    /// Declared fragment length exceeds [`MAX_FRAGMENT_DATA`].
    #[error("fragment length {0} exceeds maximum of {MAX_FRAGMENT_DATA}")]
    Oversized(usize),
}

/// A frame of the reliable path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReliableFrame {
    /// One fragment of a (possibly multi-fragment) message.
    Fragment {
        /// Fragment sequence number.
        sequence: u32,
        /// Fragment body, at most [`MAX_FRAGMENT_DATA`] bytes.
        data: Vec<u8>,
    },
    /// Positive acknowledgement of a fragment.
    Ack {
        /// Acknowledged sequence.
        sequence: u32,
    },
    /// Negative acknowledgement requesting an immediate resend.
    Nack {
        /// Rejected sequence.
        sequence: u32,
    },
}

impl ReliableFrame {
    /// Whether `bytes` starts with one of the reliable-frame magics.
    ///
    /// Used by the datagram receive path to tell reliable frames apart from
    /// mesh data packets sharing the socket.
    pub fn is_reliable_frame(bytes: &[u8]) -> bool {
        bytes.starts_with(&FRAGMENT_MAGIC)
            || bytes.starts_with(&ACK_MAGIC)
            || bytes.starts_with(&NACK_MAGIC)
    }

    /// Append the wire encoding to `buf`.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            ReliableFrame::Fragment { sequence, data } => {
                buf.reserve(FRAGMENT_HEADER_LEN + data.len());
                buf.extend_from_slice(&FRAGMENT_MAGIC);
                buf.extend_from_slice(&sequence.to_be_bytes());
                buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                buf.extend_from_slice(data);
            }
            ReliableFrame::Ack { sequence } => {
                buf.extend_from_slice(&ACK_MAGIC);
                buf.extend_from_slice(&sequence.to_be_bytes());
            }
            ReliableFrame::Nack { sequence } => {
                buf.extend_from_slice(&NACK_MAGIC);
                buf.extend_from_slice(&sequence.to_be_bytes());
            }
        }
    }

    /// The wire encoding as a fresh vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize(&mut buf);
        buf
    }

    /// Parse a reliable frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.starts_with(&ACK_MAGIC) || bytes.starts_with(&NACK_MAGIC) {
            if bytes.len() < 7 {
                return Err(FrameError::TooShort(bytes.len()));
            }
            let sequence = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
            return Ok(if bytes.starts_with(&ACK_MAGIC) {
                ReliableFrame::Ack { sequence }
            } else {
                ReliableFrame::Nack { sequence }
            });
        }
        if !bytes.starts_with(&FRAGMENT_MAGIC) {
            if bytes.len() < 2 {
                return Err(FrameError::TooShort(bytes.len()));
            }
            return Err(FrameError::BadMagic);
        }
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let sequence = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let declared = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;
        if declared > MAX_FRAGMENT_DATA {
            return Err(FrameError::Oversized(declared));
        }
        let body = &bytes[FRAGMENT_HEADER_LEN..];
        if body.len() != declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        Ok(ReliableFrame::Fragment {
            sequence,
            data: body.to_vec(),
        })
    }
}

/// Split a payload into sequenced fragments.
///
/// The first fragment takes `first_sequence`; successors are consecutive
/// (wrapping). A payload that fills its last fragment exactly is closed with
/// an empty terminating fragment.
pub fn fragment(payload: &[u8], first_sequence: u32) -> Vec<ReliableFrame> {
    let mut frames = Vec::with_capacity(payload.len() / MAX_FRAGMENT_DATA + 1);
    let mut sequence = first_sequence;
    for chunk in payload.chunks(MAX_FRAGMENT_DATA) {
        frames.push(ReliableFrame::Fragment {
            sequence,
            data: chunk.to_vec(),
        });
        sequence = sequence.wrapping_add(1);
    }
    let needs_terminator = payload.is_empty() || payload.len() % MAX_FRAGMENT_DATA == 0;
    if needs_terminator {
        frames.push(ReliableFrame::Fragment {
            sequence,
            data: Vec::new(),
        });
    }
    frames
}

/// Reassembles fragmented messages by sequence number.
///
/// Fragments may arrive in any order. A message is complete once its
/// terminating fragment (body shorter than the maximum) and every
/// predecessor back to the start of the message are present; full-size
/// fragments always belong to the message still in progress, so the walk
/// back stops at the previous message's terminator.
#[derive(Debug, Default)]
pub struct Reassembler {
    fragments: HashMap<u32, Vec<u8>>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fragments currently buffered.
    pub fn pending_fragments(&self) -> usize {
        self.fragments.len()
    }

    /// Accept one fragment; returns the reassembled message when complete.
    pub fn accept(&mut self, sequence: u32, data: Vec<u8>) -> Option<Vec<u8>> {
        let terminal = data.len() < MAX_FRAGMENT_DATA;
        self.fragments.insert(sequence, data);
        if !terminal {
            return None;
        }

        let mut start = sequence;
        loop {
            let prev = start.wrapping_sub(1);
            match self.fragments.get(&prev) {
                Some(body) if body.len() == MAX_FRAGMENT_DATA => start = prev,
                _ => break,
            }
        }

        let mut message = Vec::new();
        let mut seq = start;
        loop {
            if let Some(body) = self.fragments.remove(&seq) {
                message.extend_from_slice(&body);
            }
            if seq == sequence {
                break;
            }
            seq = seq.wrapping_add(1);
        }
        Some(message)
    }

    /// Drop all buffered fragments.
    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}
