#![no_main]

use libfuzzer_sys::fuzz_target;
use lens_http::{build_frame, parse_frame, FrameParse, WsDirection};

fuzz_target!(|data: &[u8]| {
    for direction in [WsDirection::ClientToServer, WsDirection::ServerToClient] {
        let Ok(FrameParse::Frame { frame, consumed }) = parse_frame(data, direction) else {
            continue;
        };
        assert!(consumed <= data.len());

        // Decode/encode round trip preserves the frame.
        let mask = if frame.masked { Some([1, 2, 3, 4]) } else { None };
        let rebuilt = build_frame(frame.fin, frame.opcode, &frame.payload, mask);
        match parse_frame(&rebuilt, direction).expect("rebuilt frame must parse") {
            FrameParse::Frame {
                frame: reparsed, ..
            } => {
                assert_eq!(reparsed.fin, frame.fin);
                assert_eq!(reparsed.opcode, frame.opcode);
                assert_eq!(reparsed.payload, frame.payload);
            }
            FrameParse::Incomplete => panic!("rebuilt frame must be complete"),
        }
    }
});
