#![no_main]

use libfuzzer_sys::fuzz_target;
use tagwire::core::reassembly::FrameAssembler;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    // First byte picks the chunk size, the rest is the stream
    let chunk = usize::from(data[0]).max(1);
    let mut assembler = FrameAssembler::new();
    for piece in data[1..].chunks(chunk) {
        let _ = assembler.feed(piece);
    }
    assert!(assembler.buffered() <= data.len());
});
