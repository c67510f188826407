//! CRC forging
//!
//! Computes the 4 bytes that, written at a chosen offset, make the CRC-32 of
//! a whole buffer equal an arbitrary target.
//!
//! CRC-32 is affine over GF(2). With the patch window zeroed the buffer has
//! checksum `c0`; writing a little-endian word `p` into the window changes the
//! final register by `Z^n(p)`, where `Z` is the register update for one zero
//! byte and `n` is the number of bytes from the window start to the end of the
//! buffer. Hence
//!
//! ```text
//! crc32(patched) = c0 ^ Z^n(p)    =>    p = Z^-n(c0 ^ target)
//! ```
//!
//! `Z^n` is built by repeated squaring of a 32x32 bit matrix and inverted by
//! Gaussian elimination, so the cost is one pass over the data plus a
//! constant amount of matrix work.

mod gf2;
pub mod stm32;

pub use self::gf2::Gf2Matrix;

use crate::error::{Error, Result};

/// Reflected form of the CRC-32 polynomial 0x04C11DB7.
pub const CRC32_POLY: u32 = 0xEDB8_8320;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcMode {
    /// Standard CRC-32 (zlib, Ethernet)
    #[default]
    Standard,
    /// STM32 hardware CRC unit over 32-bit words
    Stm32Hw,
    /// No checksum, the patch is always zero
    NoCrc,
}

impl CrcMode {
    pub fn forge(self, target: u32, data: &[u8], offset: usize) -> Result<u32> {
        match self {
            CrcMode::Standard => forge(target, data, offset),
            CrcMode::Stm32Hw => forge_stm32(target, data, offset),
            CrcMode::NoCrc => Ok(0),
        }
    }

    pub fn checksum(self, data: &[u8]) -> Result<Option<u32>> {
        match self {
            CrcMode::Standard => Ok(Some(crc32(data))),
            CrcMode::Stm32Hw => stm32::hw_crc(data).map(Some),
            CrcMode::NoCrc => Ok(None),
        }
    }

    /// Forges and writes the patch into `data`, then re-checks the result.
    ///
    /// A failed re-check is [`Error::ForgeComputation`].
    pub fn patch(self, target: u32, data: &mut [u8], offset: usize) -> Result<u32> {
        let value = self.forge(target, data, offset)?;
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());

        if let Some(actual) = self.checksum(data)? {
            if actual != target {
                return Err(Error::ForgeComputation {
                    expected: target,
                    actual,
                });
            }
        }

        Ok(value)
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Register update for one zero input byte.
fn zero_byte_step(mut reg: u32) -> u32 {
    for _ in 0..8 {
        reg = if reg & 1 != 0 {
            (reg >> 1) ^ CRC32_POLY
        } else {
            reg >> 1
        };
    }
    reg
}

fn check_window(len: usize, offset: usize) -> Result<()> {
    match offset.checked_add(4) {
        Some(end) if end <= len => Ok(()),
        _ => Err(Error::InvalidPatchOffset { offset, len }),
    }
}

/// Returns the little-endian word to store at `data[offset..offset + 4]` so
/// that the standard CRC-32 of the buffer becomes `target`.
///
/// The current content of the window is ignored.
pub fn forge(target: u32, data: &[u8], offset: usize) -> Result<u32> {
    check_window(data.len(), offset)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..offset]);
    hasher.update(&[0u8; 4]);
    hasher.update(&data[offset + 4..]);
    let zeroed = hasher.finalize();

    let distance = (data.len() - offset) as u64;
    let shift = Gf2Matrix::from_fn(zero_byte_step).pow(distance);

    let unshift = shift.inverse().ok_or(Error::ForgeComputation {
        expected: target,
        actual: zeroed,
    })?;

    Ok(unshift.apply(zeroed ^ target))
}

/// Same as [`forge`] for the STM32 hardware CRC.
///
/// Both the buffer length and `offset` must be multiples of 4.
pub fn forge_stm32(target: u32, data: &[u8], offset: usize) -> Result<u32> {
    stm32::check_word_aligned(data.len(), offset)?;
    check_window(data.len(), offset)?;

    let shuffled = stm32::shuffle(data)?;
    let patch = forge(stm32::bitrev32(!target), &shuffled, offset)?;
    Ok(stm32::bitrev32(patch))
}
