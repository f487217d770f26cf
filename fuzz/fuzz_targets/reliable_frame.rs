#![no_main]

use libfuzzer_sys::fuzz_target;

use midimesh_proto::{Reassembler, ReliableFrame};

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = ReliableFrame::parse(data) {
        assert_eq!(ReliableFrame::parse(&frame.to_bytes()), Ok(frame.clone()));
        if let ReliableFrame::Fragment { sequence, data } = frame {
            let mut reassembler = Reassembler::new();
            let _ = reassembler.accept(sequence, data);
        }
    }
});
