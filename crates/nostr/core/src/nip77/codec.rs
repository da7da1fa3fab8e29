use super::error::{Nip77Error, Result};

/// Longest varint that still fits a `u64`.
const MAX_VARINT_LEN: usize = 10;

/// Encode a varint (variable-length unsigned integer)
///
/// Varints are represented as base-128 digits, most significant digit first.
/// Bit 7 (high bit) is set on each byte except the last.
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_VARINT_LEN);
    write_varint(&mut bytes, value);
    bytes
}

/// Append the varint encoding of `value` to `out`.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut digits = [0u8; MAX_VARINT_LEN];
    let mut len = 0;

    loop {
        digits[len] = (value & 0x7F) as u8;
        len += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }

    for (position, digit) in digits[..len].iter().rev().enumerate() {
        if position + 1 < len {
            out.push(digit | 0x80);
        } else {
            out.push(*digit);
        }
    }
}

/// Decode a varint from a byte slice
///
/// Returns (value, bytes_consumed)
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    if data.is_empty() {
        return Err(Nip77Error::VarintDecode("empty data".to_string()));
    }

    let mut value: u64 = 0;

    for (index, &byte) in data.iter().enumerate() {
        if index >= MAX_VARINT_LEN {
            return Err(Nip77Error::VarintDecode(
                "varint too long (max 10 bytes for u64)".to_string(),
            ));
        }

        if value > (u64::MAX >> 7) {
            return Err(Nip77Error::VarintDecode("varint overflow".to_string()));
        }

        value = (value << 7) | u64::from(byte & 0x7F);

        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
    }

    Err(Nip77Error::VarintDecode("incomplete varint".to_string()))
}
