#![no_main]

use libfuzzer_sys::fuzz_target;
use lens_pki::der;

fuzz_target!(|data: &[u8]| {
    // Primitive encoders never panic and always emit self-describing TLVs.
    let encoded = der::octet_string(data);
    assert!(encoded.len() >= data.len() + 2);

    let int = der::integer(data);
    // INTEGER content is minimal: no redundant leading zero byte.
    if int.len() > 3 {
        let content_start = if int[1] < 0x80 { 2 } else { 2 + (int[1] & 0x7F) as usize };
        let content = &int[content_start..];
        if content.len() > 1 {
            assert!(!(content[0] == 0x00 && content[1] < 0x80));
        }
    }

    let wrapped = der::sequence(&encoded);
    assert_eq!(wrapped[0], 0x30);
    let bits = der::bit_string(data);
    assert_eq!(bits[bits.len() - data.len() - 1], 0x00);
});
