use crate::error::Error;

/// Message type identifiers, the first two bytes (LE) of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageId {
    Nop = 0x0000,

    BootEnter = 0xB000,
    BootResponse = 0xB001,
    BootReadData = 0xB002,
    BootVerify = 0xB003,
    BootWriteData = 0xB004,
    BootEraseSector = 0xB005,
    BootExit = 0xB00F,

    ShellToPc = 0xC000,
    ShellFromPc = 0xC001,
}

impl MessageId {
    pub const fn raw(self) -> u16 {
        self as u16
    }

    /// Reads the identifier of a raw frame without validating it.
    pub fn peek(frame: &[u8]) -> Option<u16> {
        match frame {
            [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}

impl TryFrom<u16> for MessageId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Self::Nop),
            0xB000 => Ok(Self::BootEnter),
            0xB001 => Ok(Self::BootResponse),
            0xB002 => Ok(Self::BootReadData),
            0xB003 => Ok(Self::BootVerify),
            0xB004 => Ok(Self::BootWriteData),
            0xB005 => Ok(Self::BootEraseSector),
            0xB00F => Ok(Self::BootExit),
            0xC000 => Ok(Self::ShellToPc),
            0xC001 => Ok(Self::ShellFromPc),
            _ => Err(Error::InvalidMessage(format!(
                "unknown message ID {:#06x}",
                value
            ))),
        }
    }
}

impl From<MessageId> for u16 {
    fn from(id: MessageId) -> Self {
        id as u16
    }
}
