use thiserror::Error;

/// Integrity failures of a single received frame.
///
/// None of these close the link: the frame is dropped, the error counter is
/// incremented and decoding resumes after the next delimiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("COBS/R error: {0}")]
    Stuffing(&'static str),

    #[error("Packet too short ({0} bytes)")]
    TooShort(usize),

    #[error("CRC error: {header:#06x} != {computed:#06x}")]
    Crc { header: u16, computed: u16 },

    #[error("Message too large ({size} > {max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("Frame overrun, discarded {0} bytes")]
    Overrun(usize),
}
