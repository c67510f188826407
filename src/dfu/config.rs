use std::ops::Range;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::image::DEFAULT_GAP_FILL;
use crate::protocols::apl::{BootEnter, MAX_DATA_CHUNK};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_ACK_WINDOW: usize = 10;
pub const DEFAULT_RESET_DELAY: Duration = Duration::from_secs(1);

/// Bootloader session settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub response_timeout: Duration,
    /// Write commands allowed in flight before waiting for an ack
    pub ack_window: usize,
    pub chunk_size: usize,
    /// Flash sectors erased before writing an image
    pub erase_sectors: Range<u8>,
    /// Leading image bytes written only after the body verified
    pub reserved_head: usize,
    pub reset_delay: Duration,
    pub enter_magic: u32,
    pub gap_filling: u8,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            ack_window: DEFAULT_ACK_WINDOW,
            chunk_size: MAX_DATA_CHUNK,
            erase_sectors: 4..12,
            reserved_head: 8,
            reset_delay: DEFAULT_RESET_DELAY,
            enter_magic: BootEnter::MAGIC,
            gap_filling: DEFAULT_GAP_FILL,
        }
    }
}

impl BootConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_ack_window(mut self, window: usize) -> Self {
        self.ack_window = window;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_erase_sectors(mut self, sectors: Range<u8>) -> Self {
        self.erase_sectors = sectors;
        self
    }

    pub fn with_reserved_head(mut self, len: usize) -> Self {
        self.reserved_head = len;
        self
    }

    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    pub fn with_gap_filling(mut self, fill: u8) -> Self {
        self.gap_filling = fill;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_DATA_CHUNK {
            return Err(Error::Configuration(format!(
                "chunk size must be 1..={} bytes, got {}",
                MAX_DATA_CHUNK, self.chunk_size
            )));
        }

        if self.response_timeout.is_zero() {
            return Err(Error::Configuration(
                "response timeout must be non-zero".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BootConfig::default();
        assert_eq!(config.response_timeout, Duration::from_secs(2));
        assert_eq!(config.ack_window, 10);
        assert_eq!(config.chunk_size, 240);
        assert_eq!(config.erase_sectors, 4..12);
        assert_eq!(config.reserved_head, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_chunk_size() {
        assert!(BootConfig::new().with_chunk_size(0).validate().is_err());
        assert!(BootConfig::new().with_chunk_size(241).validate().is_err());
        assert!(BootConfig::new().with_chunk_size(16).validate().is_ok());
    }

    #[test]
    fn test_validate_timeout() {
        let config = BootConfig::new().with_response_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
