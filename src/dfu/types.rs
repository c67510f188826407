use std::fmt;
use std::ops::Range;
use std::time::Duration;

use crate::error::{Error, Result};

/// Session state as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Idle,
    Entered,
    Erasing,
    Writing,
    Verifying,
    Exited,
}

impl BootState {
    /// Commands other than enter are only valid between enter and exit.
    pub fn is_active(self) -> bool {
        !matches!(self, BootState::Idle | BootState::Exited)
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootState::Idle => "idle",
            BootState::Entered => "entered",
            BootState::Erasing => "erasing",
            BootState::Writing => "writing",
            BootState::Verifying => "verifying",
            BootState::Exited => "exited",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub address: u32,
    pub length: u32,
    pub local_crc: u32,
    pub remote_crc: u32,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.local_crc == self.remote_crc
    }

    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(Error::VerificationMismatch {
                local: self.local_crc,
                remote: self.remote_crc,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseTimings {
    pub erase: Duration,
    pub write: Duration,
    pub verify: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    pub verify: VerifyReport,
    pub timings: PhaseTimings,
}

/// One erasable flash sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub index: u8,
    pub address: u32,
    pub size: u32,
}

impl Sector {
    const fn new(index: u8, address: u32, size: u32) -> Self {
        Self {
            index,
            address,
            size,
        }
    }

    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }
}

/// Flash layout of the STM32F4 (1 MiB) targets.
pub const STM32F4_SECTORS: [Sector; 12] = [
    Sector::new(0, 0x0800_0000, 0x4000),
    Sector::new(1, 0x0800_4000, 0x4000),
    Sector::new(2, 0x0800_8000, 0x4000),
    Sector::new(3, 0x0800_C000, 0x4000),
    Sector::new(4, 0x0801_0000, 0x1_0000),
    Sector::new(5, 0x0802_0000, 0x2_0000),
    Sector::new(6, 0x0804_0000, 0x2_0000),
    Sector::new(7, 0x0806_0000, 0x2_0000),
    Sector::new(8, 0x0808_0000, 0x2_0000),
    Sector::new(9, 0x080A_0000, 0x2_0000),
    Sector::new(10, 0x080C_0000, 0x2_0000),
    Sector::new(11, 0x080E_0000, 0x2_0000),
];

/// Indices of the sectors touched by `[address, address + len)`.
pub fn sectors_covering(address: u32, len: usize) -> Range<u8> {
    let start = address as u64;
    let end = start + len as u64;

    let mut touched = STM32F4_SECTORS
        .iter()
        .filter(|s| len > 0 && (s.address as u64) < end && start < s.end());

    match touched.next() {
        Some(first) => {
            let last = touched.last().unwrap_or(first);
            first.index..last.index + 1
        }
        None => 0..0,
    }
}
