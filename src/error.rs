use thiserror::Error;

use crate::protocols::lpl::FrameError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Timeout")]
    Timeout,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Unroutable message ID {0:#06x}")]
    UnroutableMessage(u16),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Verification failed: local CRC {local:#010x} != remote CRC {remote:#010x}")]
    VerificationMismatch { local: u32, remote: u32 },

    #[error("Version info structure marker not found")]
    MarkerNotFound,

    #[error("Version info already filled out (image CRC {0:#010x})")]
    AlreadyStamped(u32),

    #[error("Forged CRC self-check failed: expected {expected:#010x}, got {actual:#010x}")]
    ForgeComputation { expected: u32, actual: u32 },

    #[error("Invalid patch offset {offset} for {len} byte buffer")]
    InvalidPatchOffset { offset: usize, len: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("Consumer {consumer} is not subscribed to message ID {msg_id:#06x}")]
    NotSubscribed { consumer: u64, msg_id: u16 },

    #[error("Invalid bootloader state: {0}")]
    InvalidState(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Hex file error: {0}")]
    HexFile(#[from] ihex::ReaderError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, Error>;
