//! Signed power values as carried in a single 16-bit holding register.

use byteorder::{BigEndian, ByteOrder};

/// Encodes signed Watts as the two's-complement register word.
pub fn encode_signed_power(value: i16) -> u16 {
    let mut buf = [0u8; 2];
    BigEndian::write_i16(&mut buf, value);
    BigEndian::read_u16(&buf)
}

/// Decodes a register word back to signed Watts.
pub fn decode_signed_power(value: u16) -> i16 {
    BigEndian::read_i16(&value.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_values() {
        assert_eq!(encode_signed_power(0), 0);
        assert_eq!(encode_signed_power(1000), 1000);
        assert_eq!(encode_signed_power(32767), 32767);
        assert_eq!(encode_signed_power(-1), 65535);
        assert_eq!(encode_signed_power(-1000), 64536);
        assert_eq!(encode_signed_power(-32768), 32768);
    }

    #[test]
    fn decodes_known_values() {
        assert_eq!(decode_signed_power(64536), -1000);
        assert_eq!(decode_signed_power(32767), 32767);
        assert_eq!(decode_signed_power(32768), -32768);
    }

    #[test]
    fn full_range_round_trips() {
        for v in i16::MIN..=i16::MAX {
            assert_eq!(decode_signed_power(encode_signed_power(v)), v);
        }
    }
}
