#![no_main]

use libfuzzer_sys::fuzz_target;
use lens_http::RequestHead;

fuzz_target!(|data: &[u8]| {
    let Ok(head) = RequestHead::parse(data) else {
        return;
    };

    // Whatever parsed must re-encode to a parseable head with the same
    // method, target, and header set.
    let reencoded = head.encode();
    let reparsed = RequestHead::parse(&reencoded).expect("re-encoded head must parse");
    assert_eq!(reparsed.method, head.method);
    assert_eq!(reparsed.target_raw, head.target_raw);
    assert_eq!(reparsed.headers, head.headers);

    // Host derivation and body mode must never panic on parseable input.
    let _ = head.effective_host_port();
    let _ = head.body_mode();
    let _ = head.is_websocket_upgrade();
});
