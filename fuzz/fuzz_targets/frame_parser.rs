#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_stream::{build_frame, parse_frame};

fuzz_target!(|data: &[u8]| {
    let mut input = data;
    while let Ok((rest, frame)) = parse_frame(input) {
        // Whatever parses must encode back to the bytes it came from.
        let consumed = &input[..input.len() - rest.len()];
        let encoded = build_frame(&frame);
        if frame.kind() != relay_stream::FrameKind::Data {
            assert_eq!(&encoded[..], consumed);
        }
        if rest.len() == input.len() {
            break;
        }
        input = rest;
    }
});
