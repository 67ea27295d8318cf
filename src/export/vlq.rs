//! MIDI variable-length quantities: seven data bits per byte, most
//! significant group first, continuation bit set on every byte but the last.

/// Largest value a four-byte quantity can hold.
pub const MAX_VLQ: u32 = 0x0FFF_FFFF;

/// Encode `value`, or `None` if it needs more than four bytes.
pub fn encode_vlq(value: u32) -> Option<Vec<u8>> {
    if value > MAX_VLQ {
        return None;
    }
    let mut groups = [0u8; 4];
    let mut n = 0;
    let mut v = value;
    loop {
        groups[n] = (v & 0x7F) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    Some(
        (0..n)
            .rev()
            .map(|i| if i == 0 { groups[i] } else { groups[i] | 0x80 })
            .collect(),
    )
}

/// Decode a quantity at the start of `bytes`, returning it with the number
/// of bytes consumed.  `None` if it is truncated or longer than four bytes.
pub fn decode_vlq(bytes: &[u8]) -> Option<(u32, usize)> {
    let mut value = 0u32;
    for (i, &b) in bytes.iter().take(4).enumerate() {
        value = (value << 7) | u32::from(b & 0x7F);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings() {
        let cases: [(u32, &[u8]); 8] = [
            (0x00,        &[0x00]),
            (0x40,        &[0x40]),
            (0x7F,        &[0x7F]),
            (0x80,        &[0x81, 0x00]),
            (0x2000,      &[0xC0, 0x00]),
            (0x3FFF,      &[0xFF, 0x7F]),
            (0x10_0000,   &[0xC0, 0x80, 0x00]),
            (MAX_VLQ,     &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];
        for (value, bytes) in cases {
            assert_eq!(encode_vlq(value).unwrap(), bytes, "{value:#x}");
            assert_eq!(decode_vlq(bytes), Some((value, bytes.len())));
        }
    }

    #[test]
    fn out_of_range() {
        assert_eq!(encode_vlq(MAX_VLQ + 1), None);
        assert_eq!(decode_vlq(&[0x81]), None);
        assert_eq!(decode_vlq(&[0x80, 0x80, 0x80, 0x80, 0x00]), None);
    }
}
