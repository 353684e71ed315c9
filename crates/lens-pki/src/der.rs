//! Primitive ASN.1 DER encoders per ITU-T X.690.
//!
//! Every function returns a complete tag-length-value byte sequence. The
//! certificate builder composes these bottom-up; nothing here allocates a
//! writer or carries state.

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_UTF8_STRING: u8 = 0x0C;
const TAG_PRINTABLE_STRING: u8 = 0x13;
const TAG_IA5_STRING: u8 = 0x16;
const TAG_UTC_TIME: u8 = 0x17;
const TAG_GENERALIZED_TIME: u8 = 0x18;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;

const CLASS_CONTEXT: u8 = 0x80;
const CONSTRUCTED: u8 = 0x20;

/// Length octets: short form below 128, long form `0x80 | n` plus n
/// big-endian bytes otherwise.
pub fn encode_length(len: usize) -> Vec<u8> {
    if len < 128 {
        return vec![len as u8];
    }
    let be = len.to_be_bytes();
    let skip = be.iter().take_while(|byte| **byte == 0).count();
    let mut out = Vec::with_capacity(1 + be.len() - skip);
    out.push(0x80 | (be.len() - skip) as u8);
    out.extend_from_slice(&be[skip..]);
    out
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let length = encode_length(content.len());
    let mut out = Vec::with_capacity(1 + length.len() + content.len());
    out.push(tag);
    out.extend_from_slice(&length);
    out.extend_from_slice(content);
    out
}

pub fn sequence(content: &[u8]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, content)
}

pub fn set(content: &[u8]) -> Vec<u8> {
    tlv(TAG_SET, content)
}

/// INTEGER from unsigned big-endian magnitude bytes. Leading zeros are
/// stripped to the minimal form; a `0x00` pad is prepended when the top bit
/// is set so the value stays positive.
pub fn integer(magnitude: &[u8]) -> Vec<u8> {
    let mut start = 0;
    while start + 1 < magnitude.len() && magnitude[start] == 0 && magnitude[start + 1] < 0x80 {
        start += 1;
    }
    let mut trimmed = &magnitude[start..];
    if trimmed.is_empty() {
        trimmed = &[0];
    }
    if trimmed[0] & 0x80 != 0 {
        let mut content = Vec::with_capacity(trimmed.len() + 1);
        content.push(0);
        content.extend_from_slice(trimmed);
        tlv(TAG_INTEGER, &content)
    } else {
        tlv(TAG_INTEGER, trimmed)
    }
}

pub fn boolean(value: bool) -> Vec<u8> {
    tlv(TAG_BOOLEAN, &[if value { 0xFF } else { 0x00 }])
}

pub fn null() -> Vec<u8> {
    tlv(TAG_NULL, &[])
}

/// BIT STRING with zero unused bits.
pub fn bit_string(bits: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(bits.len() + 1);
    content.push(0);
    content.extend_from_slice(bits);
    tlv(TAG_BIT_STRING, &content)
}

pub fn octet_string(bytes: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, bytes)
}

/// OBJECT IDENTIFIER. The first two arcs collapse into `40 * a + b`; every
/// later arc is base-128 with the continuation bit on all non-final bytes.
pub fn oid(arcs: &[u64]) -> Vec<u8> {
    debug_assert!(arcs.len() >= 2, "an OID needs at least two arcs");
    let mut content = Vec::new();
    content.push((arcs[0] * 40 + arcs[1]) as u8);
    for &arc in &arcs[2..] {
        content.extend_from_slice(&base128(arc));
    }
    tlv(TAG_OID, &content)
}

fn base128(mut value: u64) -> Vec<u8> {
    let mut out = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        out.push(0x80 | (value & 0x7F) as u8);
        value >>= 7;
    }
    out.reverse();
    out
}

pub fn printable_string(text: &str) -> Vec<u8> {
    tlv(TAG_PRINTABLE_STRING, text.as_bytes())
}

pub fn utf8_string(text: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, text.as_bytes())
}

pub fn ia5_string(text: &str) -> Vec<u8> {
    tlv(TAG_IA5_STRING, text.as_bytes())
}

/// UTCTime `YYMMDDHHMMSSZ`. Callers must not pass dates at or past 2050;
/// those take [`generalized_time`].
pub fn utc_time(year: i32, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Vec<u8> {
    let text = format!(
        "{:02}{:02}{:02}{:02}{:02}{:02}Z",
        year.rem_euclid(100),
        month,
        day,
        hour,
        minute,
        second
    );
    tlv(TAG_UTC_TIME, text.as_bytes())
}

/// GeneralizedTime `YYYYMMDDHHMMSSZ`, required for validity instants in 2050
/// or later.
pub fn generalized_time(year: i32, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Vec<u8> {
    let text = format!("{year:04}{month:02}{day:02}{hour:02}{minute:02}{second:02}Z");
    tlv(TAG_GENERALIZED_TIME, text.as_bytes())
}

/// EXPLICIT context tag: constructed, class bits `0b10`.
pub fn context_explicit(tag: u8, inner: &[u8]) -> Vec<u8> {
    tlv(CLASS_CONTEXT | CONSTRUCTED | tag, inner)
}

/// IMPLICIT context tag over a primitive value: the content bytes are kept,
/// only the tag byte is replaced.
pub fn context_implicit(tag: u8, content: &[u8]) -> Vec<u8> {
    tlv(CLASS_CONTEXT | tag, content)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Minimal TLV reader used to check that emitted structures are
    /// well-formed and self-describing.
    fn read_tlv(buf: &[u8]) -> Option<(u8, &[u8], usize)> {
        let tag = *buf.first()?;
        let first = *buf.get(1)?;
        let (len, header) = if first < 0x80 {
            (first as usize, 2)
        } else {
            let count = (first & 0x7F) as usize;
            if count == 0 || count > 8 || buf.len() < 2 + count {
                return None;
            }
            let mut len = 0usize;
            for byte in &buf[2..2 + count] {
                len = len.checked_mul(256)?.checked_add(*byte as usize)?;
            }
            (len, 2 + count)
        };
        let content = buf.get(header..header + len)?;
        Some((tag, content, header + len))
    }

    #[test]
    fn short_and_long_form_lengths() {
        assert_eq!(encode_length(0), vec![0x00]);
        assert_eq!(encode_length(127), vec![0x7F]);
        assert_eq!(encode_length(128), vec![0x81, 0x80]);
        assert_eq!(encode_length(256), vec![0x82, 0x01, 0x00]);
        assert_eq!(encode_length(65_535), vec![0x82, 0xFF, 0xFF]);
    }

    #[test]
    fn integer_pads_high_bit_and_strips_leading_zeros() {
        assert_eq!(integer(&[0x80]), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer(&[0x7F]), vec![0x02, 0x01, 0x7F]);
        assert_eq!(integer(&[0x00, 0x00, 0x01]), vec![0x02, 0x01, 0x01]);
        assert_eq!(integer(&[0x00, 0x84]), vec![0x02, 0x02, 0x00, 0x84]);
        assert_eq!(integer(&[0x00]), vec![0x02, 0x01, 0x00]);
    }

    #[test]
    fn known_oid_encodings() {
        // id-ce-basicConstraints
        assert_eq!(oid(&[2, 5, 29, 19]), vec![0x06, 0x03, 0x55, 0x1D, 0x13]);
        // sha256WithRSAEncryption
        assert_eq!(
            oid(&[1, 2, 840, 113_549, 1, 1, 11]),
            vec![0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B]
        );
        // id-kp-serverAuth
        assert_eq!(
            oid(&[1, 3, 6, 1, 5, 5, 7, 3, 1]),
            vec![0x06, 0x08, 0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x01]
        );
    }

    #[test]
    fn bit_string_prepends_zero_unused_bits() {
        assert_eq!(bit_string(&[0x06]), vec![0x03, 0x02, 0x00, 0x06]);
        assert_eq!(bit_string(&[0xA0]), vec![0x03, 0x02, 0x00, 0xA0]);
    }

    #[test]
    fn boolean_and_null_forms() {
        assert_eq!(boolean(true), vec![0x01, 0x01, 0xFF]);
        assert_eq!(boolean(false), vec![0x01, 0x01, 0x00]);
        assert_eq!(null(), vec![0x05, 0x00]);
    }

    #[test]
    fn time_rendering() {
        assert_eq!(
            utc_time(2026, 8, 2, 12, 30, 5),
            [&[0x17, 0x0D][..], b"260802123005Z"].concat()
        );
        assert_eq!(
            generalized_time(2050, 1, 1, 0, 0, 0),
            [&[0x18, 0x0F][..], b"20500101000000Z"].concat()
        );
    }

    #[test]
    fn context_tags_set_class_and_constructed_bits() {
        let inner = integer(&[2]);
        let explicit = context_explicit(0, &inner);
        assert_eq!(explicit[0], 0xA0);
        let implicit = context_implicit(2, b"example.com");
        assert_eq!(implicit[0], 0x82);
        assert_eq!(&implicit[2..], b"example.com");
    }

    proptest! {
        #[test]
        fn every_tlv_is_self_describing(content in proptest::collection::vec(any::<u8>(), 0..512)) {
            let encoded = octet_string(&content);
            let (tag, parsed, consumed) = read_tlv(&encoded).expect("well-formed TLV");
            prop_assert_eq!(tag, 0x04);
            prop_assert_eq!(parsed, &content[..]);
            prop_assert_eq!(consumed, encoded.len());
        }

        #[test]
        fn integer_reencode_is_stable(magnitude in proptest::collection::vec(any::<u8>(), 1..20)) {
            let first = integer(&magnitude);
            let (_, content, _) = read_tlv(&first).expect("well-formed INTEGER");
            let second = integer(content);
            prop_assert_eq!(first, second);
        }
    }
}
