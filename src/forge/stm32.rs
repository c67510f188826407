//! STM32 CRC peripheral compatibility.
//!
//! The peripheral feeds 32-bit little-endian words MSB first into a
//! non-reflected CRC-32 (polynomial 0x04C11DB7, init 0xFFFFFFFF, no final
//! XOR). Bit-reversing every word turns that into the standard reflected
//! CRC-32:
//!
//! ```text
//! hw_crc(data) == bitrev32(!crc32(shuffle(data)))
//! ```

use crate::error::{Error, Result};

pub const POLY: u32 = 0x04C1_1DB7;

pub fn bitrev32(x: u32) -> u32 {
    x.reverse_bits()
}

pub(crate) fn check_word_aligned(len: usize, offset: usize) -> Result<()> {
    if len % 4 != 0 || offset % 4 != 0 {
        return Err(Error::InvalidPatchOffset { offset, len });
    }
    Ok(())
}

/// Bit-reverses every 32-bit little-endian word of `data`.
pub fn shuffle(data: &[u8]) -> Result<Vec<u8>> {
    check_word_aligned(data.len(), 0)?;

    let mut out = Vec::with_capacity(data.len());
    for word in data.chunks_exact(4) {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        out.extend_from_slice(&bitrev32(word).to_le_bytes());
    }
    Ok(out)
}

/// Bitwise model of the hardware unit.
pub fn hw_crc(data: &[u8]) -> Result<u32> {
    check_word_aligned(data.len(), 0)?;

    let mut crc = 0xFFFF_FFFFu32;
    for word in data.chunks_exact(4) {
        crc ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        for _ in 0..32 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    Ok(crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrev32() {
        assert_eq!(bitrev32(0x0000_0001), 0x8000_0000);
        assert_eq!(bitrev32(0x04C1_1DB7), 0xEDB8_8320);
    }

    #[test]
    fn test_hw_crc_matches_reflected_crc() {
        let data: Vec<u8> = (0..256u32).map(|i| (i * 73 + 11) as u8).collect();
        let shuffled = shuffle(&data).unwrap();
        assert_eq!(
            hw_crc(&data).unwrap(),
            bitrev32(!crc32fast::hash(&shuffled))
        );
    }

    #[test]
    fn test_empty_input_is_init_value() {
        assert_eq!(hw_crc(&[]).unwrap(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_rejects_partial_words() {
        assert!(hw_crc(&[1, 2, 3]).is_err());
        assert!(shuffle(&[1, 2, 3, 4, 5]).is_err());
    }
}
