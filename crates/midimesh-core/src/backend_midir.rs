//! Midir-backed hardware seam.
//!
//! The core only ever sees byte slices; this module is the one place that
//! talks to platform MIDI. Input callbacks run on midir's driver thread and
//! must stay allocation-light: the closures installed by the boundary only
//! classify the message and push it into the ring or the bulk channel.

use std::collections::HashMap;

use anyhow::Context;
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

use crate::port::OutputSink;

/// Callback invoked with each raw message from an opened input.
pub type InputCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Identifier of an open hardware input connection.
pub type InputId = u64;

/// Backend abstraction over platform MIDI.
///
/// Tests substitute a dummy implementation; production uses
/// [`MidirBackend`].
pub trait HardwareBackend: Send {
    /// Names of available input ports.
    fn input_ports(&self) -> anyhow::Result<Vec<String>>;
    /// Names of available output ports.
    fn output_ports(&self) -> anyhow::Result<Vec<String>>;
    /// Open an input and start delivering messages to `callback`.
    fn open_input(&mut self, port_index: usize, callback: InputCallback)
        -> anyhow::Result<InputId>;
    /// Close a previously opened input.
    fn close_input(&mut self, id: InputId);
    /// Open an output as a sink for the port layer.
    fn open_output(&mut self, port_index: usize) -> anyhow::Result<Box<dyn OutputSink>>;
}

/// Production backend over the `midir` crate.
pub struct MidirBackend {
    client_name: String,
    inputs: HashMap<InputId, MidiInputConnection<()>>,
    next_input: InputId,
}

impl MidirBackend {
    /// Create a backend advertising `client_name` to the platform.
    pub fn new(client_name: impl Into<String>) -> Self {
        MidirBackend {
            client_name: client_name.into(),
            inputs: HashMap::new(),
            next_input: 1,
        }
    }

    fn midi_input(&self) -> anyhow::Result<MidiInput> {
        MidiInput::new(&self.client_name).context("failed to create MIDI input client")
    }

    fn midi_output(&self) -> anyhow::Result<MidiOutput> {
        MidiOutput::new(&self.client_name).context("failed to create MIDI output client")
    }
}

impl HardwareBackend for MidirBackend {
    fn input_ports(&self) -> anyhow::Result<Vec<String>> {
        let input = self.midi_input()?;
        Ok(input
            .ports()
            .iter()
            .enumerate()
            .map(|(index, port)| {
                input
                    .port_name(port)
                    .unwrap_or_else(|_| format!("Input {index}"))
            })
            .collect())
    }

    fn output_ports(&self) -> anyhow::Result<Vec<String>> {
        let output = self.midi_output()?;
        Ok(output
            .ports()
            .iter()
            .enumerate()
            .map(|(index, port)| {
                output
                    .port_name(port)
                    .unwrap_or_else(|_| format!("Output {index}"))
            })
            .collect())
    }

    fn open_input(
        &mut self,
        port_index: usize,
        mut callback: InputCallback,
    ) -> anyhow::Result<InputId> {
        let input = self.midi_input()?;
        let ports = input.ports();
        let port = ports
            .get(port_index)
            .with_context(|| format!("MIDI input index {port_index} out of range"))?;
        let name = input
            .port_name(port)
            .unwrap_or_else(|_| format!("Input {port_index}"));
        let connection = input
            .connect(
                port,
                &name,
                move |_timestamp, message, _data| callback(message),
                (),
            )
            .map_err(|err| anyhow::anyhow!("failed to open MIDI input '{name}': {err}"))?;

        let id = self.next_input;
        self.next_input += 1;
        self.inputs.insert(id, connection);
        Ok(id)
    }

    fn close_input(&mut self, id: InputId) {
        if let Some(connection) = self.inputs.remove(&id) {
            connection.close();
        }
    }

    fn open_output(&mut self, port_index: usize) -> anyhow::Result<Box<dyn OutputSink>> {
        let output = self.midi_output()?;
        let ports = output.ports();
        let port = ports
            .get(port_index)
            .with_context(|| format!("MIDI output index {port_index} out of range"))?;
        let name = output
            .port_name(port)
            .unwrap_or_else(|_| format!("Output {port_index}"));
        let connection = output
            .connect(port, &name)
            .map_err(|err| anyhow::anyhow!("failed to open MIDI output '{name}': {err}"))?;
        Ok(Box::new(MidirOutputSink { connection }))
    }
}

struct MidirOutputSink {
    connection: MidiOutputConnection,
}

impl OutputSink for MidirOutputSink {
    fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.connection
            .send(bytes)
            .map_err(|err| anyhow::anyhow!("MIDI send failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hardware enumeration is environment-dependent; assert only that the
    // calls complete against whatever the host exposes.
    #[test]
    fn enumeration_does_not_fail() {
        let backend = MidirBackend::new("midimesh-test");
        if let Ok(ports) = backend.input_ports() {
            assert!(ports.iter().all(|name| !name.is_empty()));
        }
        let _ = backend.output_ports();
    }
}
