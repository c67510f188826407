use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::MessageId;
use crate::error::{Error, Result};

/// Largest data payload carried by a single write or read command.
pub const MAX_DATA_CHUNK: usize = 240;

fn check_len(bytes: &[u8], len: usize, name: &str) -> Result<()> {
    if bytes.len() < len {
        return Err(Error::InvalidMessage(format!(
            "{} too short: {} < {} bytes",
            name,
            bytes.len(),
            len
        )));
    }
    Ok(())
}

fn header(id: MessageId, capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + capacity);
    buf.put_u16_le(id.raw());
    buf
}

/// Enter bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootEnter {
    pub magic: u32,
}

impl BootEnter {
    pub const MAGIC: u32 = 0xB007_10AD;

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = header(MessageId::BootEnter, 4);
        buf.put_u32_le(self.magic);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 6, "boot_enter")?;
        let mut body = &bytes[2..];
        Ok(Self {
            magic: body.get_u32_le(),
        })
    }
}

/// Bootloader command response
///
/// The payload depends on the command: a status byte for enter, erase, write
/// and exit, the CRC-32 for verify, and raw memory for read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootResponse {
    pub data: Bytes,
}

impl BootResponse {
    pub fn status(&self) -> Option<u8> {
        self.data.first().copied()
    }

    pub fn crc(&self) -> Result<u32> {
        match self.data.get(..4) {
            Some(crc) => Ok(u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]])),
            None => Err(Error::InvalidMessage(format!(
                "boot_response carries {} bytes, expected a 4 byte CRC",
                self.data.len()
            ))),
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = header(MessageId::BootResponse, self.data.len());
        buf.put_slice(&self.data);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 2, "boot_response")?;
        Ok(Self {
            data: Bytes::copy_from_slice(&bytes[2..]),
        })
    }
}

/// Read flash memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReadData {
    pub address: u32,
    pub length: u8,
}

impl BootReadData {
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = header(MessageId::BootReadData, 5);
        buf.put_u32_le(self.address);
        buf.put_u8(self.length);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 7, "boot_read_data")?;
        let mut body = &bytes[2..];
        Ok(Self {
            address: body.get_u32_le(),
            length: body.get_u8(),
        })
    }
}

/// Verify flash memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootVerify {
    pub address: u32,
    pub length: u32,
}

impl BootVerify {
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = header(MessageId::BootVerify, 8);
        buf.put_u32_le(self.address);
        buf.put_u32_le(self.length);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 10, "boot_verify")?;
        let mut body = &bytes[2..];
        Ok(Self {
            address: body.get_u32_le(),
            length: body.get_u32_le(),
        })
    }
}

/// Write flash memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootWriteData {
    pub address: u32,
    pub data: Bytes,
}

impl BootWriteData {
    pub fn new(address: u32, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if data.len() > MAX_DATA_CHUNK {
            return Err(Error::InvalidMessage(format!(
                "boot_write_data payload of {} bytes exceeds {}",
                data.len(),
                MAX_DATA_CHUNK
            )));
        }
        Ok(Self { address, data })
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = header(MessageId::BootWriteData, 5 + self.data.len());
        buf.put_u32_le(self.address);
        buf.put_u8(self.data.len() as u8);
        buf.put_slice(&self.data);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 7, "boot_write_data")?;
        let mut body = &bytes[2..];
        let address = body.get_u32_le();
        let length = body.get_u8() as usize;

        if body.len() != length {
            return Err(Error::InvalidMessage(format!(
                "boot_write_data length field {} != {} payload bytes",
                length,
                body.len()
            )));
        }

        Self::new(address, Bytes::copy_from_slice(body))
    }
}

/// Erase flash sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootEraseSector {
    pub sector: u8,
}

impl BootEraseSector {
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = header(MessageId::BootEraseSector, 1);
        buf.put_u8(self.sector);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 3, "boot_erase_sector")?;
        Ok(Self { sector: bytes[2] })
    }
}

/// Free-form console text, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellText {
    pub data: Bytes,
}

impl ShellText {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn to_bytes(&self, id: MessageId) -> BytesMut {
        let mut buf = header(id, self.data.len());
        buf.put_slice(&self.data);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 2, "shell")?;
        Ok(Self::new(Bytes::copy_from_slice(&bytes[2..])))
    }
}
