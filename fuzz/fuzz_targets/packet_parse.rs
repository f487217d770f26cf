#![no_main]

use libfuzzer_sys::fuzz_target;

use midimesh_proto::MeshPacket;

// Malformed datagrams must fail cleanly, and anything that parses must
// round-trip byte-for-byte.
fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = MeshPacket::parse(data) {
        let bytes = packet.to_bytes();
        let reparsed = MeshPacket::parse(&bytes).expect("reserialized packet must parse");
        assert_eq!(reparsed, packet);
    }
});
