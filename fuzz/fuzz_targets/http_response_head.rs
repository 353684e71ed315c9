#![no_main]

use libfuzzer_sys::fuzz_target;
use lens_http::ResponseHead;

fuzz_target!(|data: &[u8]| {
    let Ok(head) = ResponseHead::parse(data) else {
        return;
    };
    assert!(head.raw.len() <= data.len() || head.raw == data);
    for method in ["GET", "HEAD", "POST"] {
        let _ = head.body_mode(method);
    }
    let _ = head.wants_close();
    let _ = head.confirms_websocket_upgrade("dGhlIHNhbXBsZSBub25jZQ==");
});
