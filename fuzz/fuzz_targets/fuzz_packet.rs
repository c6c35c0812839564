#![no_main]

use libfuzzer_sys::fuzz_target;
use tagwire::Packet;

fuzz_target!(|data: &[u8]| {
    // Any frame that decodes must encode back to the same bytes
    if let Ok(packet) = Packet::from_bytes(data) {
        if let Ok(encoded) = packet.to_bytes() {
            assert_eq!(Packet::from_bytes(&encoded).ok(), Some(packet));
        }
    }
});
