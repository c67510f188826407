//! Application Protocol Layer (APL)
//!
//! Typed views over link frames. Every message starts with a little-endian
//! 16-bit [`MessageId`]; the layout after it is fixed per id. Encoding and
//! decoding are pure functions.

use bytes::BytesMut;

mod packet;
mod types;

pub use self::packet::{
    BootEnter, BootEraseSector, BootReadData, BootResponse, BootVerify, BootWriteData, ShellText,
    MAX_DATA_CHUNK,
};
pub use self::types::MessageId;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Nop,
    BootEnter(BootEnter),
    BootResponse(BootResponse),
    BootReadData(BootReadData),
    BootVerify(BootVerify),
    BootWriteData(BootWriteData),
    BootEraseSector(BootEraseSector),
    BootExit,
    ShellToPc(ShellText),
    ShellFromPc(ShellText),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Nop => MessageId::Nop,
            Message::BootEnter(_) => MessageId::BootEnter,
            Message::BootResponse(_) => MessageId::BootResponse,
            Message::BootReadData(_) => MessageId::BootReadData,
            Message::BootVerify(_) => MessageId::BootVerify,
            Message::BootWriteData(_) => MessageId::BootWriteData,
            Message::BootEraseSector(_) => MessageId::BootEraseSector,
            Message::BootExit => MessageId::BootExit,
            Message::ShellToPc(_) => MessageId::ShellToPc,
            Message::ShellFromPc(_) => MessageId::ShellFromPc,
        }
    }

    pub fn encode(&self) -> BytesMut {
        match self {
            Message::Nop | Message::BootExit => {
                BytesMut::from(&self.id().raw().to_le_bytes()[..])
            }
            Message::BootEnter(msg) => msg.to_bytes(),
            Message::BootResponse(msg) => msg.to_bytes(),
            Message::BootReadData(msg) => msg.to_bytes(),
            Message::BootVerify(msg) => msg.to_bytes(),
            Message::BootWriteData(msg) => msg.to_bytes(),
            Message::BootEraseSector(msg) => msg.to_bytes(),
            Message::ShellToPc(msg) => msg.to_bytes(MessageId::ShellToPc),
            Message::ShellFromPc(msg) => msg.to_bytes(MessageId::ShellFromPc),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw = MessageId::peek(bytes)
            .ok_or_else(|| Error::InvalidMessage("missing message ID".into()))?;

        Ok(match MessageId::try_from(raw)? {
            MessageId::Nop => Message::Nop,
            MessageId::BootEnter => Message::BootEnter(BootEnter::from_bytes(bytes)?),
            MessageId::BootResponse => Message::BootResponse(BootResponse::from_bytes(bytes)?),
            MessageId::BootReadData => Message::BootReadData(BootReadData::from_bytes(bytes)?),
            MessageId::BootVerify => Message::BootVerify(BootVerify::from_bytes(bytes)?),
            MessageId::BootWriteData => Message::BootWriteData(BootWriteData::from_bytes(bytes)?),
            MessageId::BootEraseSector => {
                Message::BootEraseSector(BootEraseSector::from_bytes(bytes)?)
            }
            MessageId::BootExit => Message::BootExit,
            MessageId::ShellToPc => Message::ShellToPc(ShellText::from_bytes(bytes)?),
            MessageId::ShellFromPc => Message::ShellFromPc(ShellText::from_bytes(bytes)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_write_data_layout() {
        let msg = BootWriteData::new(0x0800_4000, vec![0xAA, 0xBB]).unwrap();
        let bytes = Message::BootWriteData(msg).encode();
        assert_eq!(
            bytes.as_ref(),
            &[0x04, 0xB0, 0x00, 0x40, 0x00, 0x08, 0x02, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_fixed_layouts() {
        let enter = Message::BootEnter(BootEnter { magic: BootEnter::MAGIC }).encode();
        assert_eq!(enter.as_ref(), &[0x00, 0xB0, 0xAD, 0x10, 0x07, 0xB0]);

        let erase = Message::BootEraseSector(BootEraseSector { sector: 7 }).encode();
        assert_eq!(erase.as_ref(), &[0x05, 0xB0, 0x07]);

        let verify = Message::BootVerify(BootVerify {
            address: 0x0801_0008,
            length: 0x100,
        })
        .encode();
        assert_eq!(
            verify.as_ref(),
            &[0x03, 0xB0, 0x08, 0x00, 0x01, 0x08, 0x00, 0x01, 0x00, 0x00]
        );

        assert_eq!(Message::BootExit.encode().as_ref(), &[0x0F, 0xB0]);
    }

    #[test]
    fn test_decode_keyed_by_id() {
        let msg = Message::decode(&[0x05, 0xB0, 0x04]).unwrap();
        assert_eq!(msg, Message::BootEraseSector(BootEraseSector { sector: 4 }));

        let msg = Message::decode(&[0x01, 0xB0, 0x78, 0x56, 0x34, 0x12]).unwrap();
        let Message::BootResponse(response) = msg else {
            panic!("expected a boot response");
        };
        assert_eq!(response.crc().unwrap(), 0x1234_5678);
        assert_eq!(response.status(), Some(0x78));

        let msg = Message::decode(b"\x00\xC0hello").unwrap();
        assert_eq!(
            msg,
            Message::ShellToPc(ShellText::new(Bytes::from_static(b"hello")))
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(Message::decode(&[0x01]), Err(Error::InvalidMessage(_))));
        assert!(matches!(
            Message::decode(&[0x34, 0x12]),
            Err(Error::InvalidMessage(_))
        ));
        assert!(matches!(
            Message::decode(&[0x03, 0xB0, 0x00]),
            Err(Error::InvalidMessage(_))
        ));
        // length field disagrees with payload
        assert!(matches!(
            Message::decode(&[0x04, 0xB0, 0, 0, 0, 0, 3, 0xAA]),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_write_data_rejects_oversized_chunk() {
        assert!(BootWriteData::new(0, vec![0u8; MAX_DATA_CHUNK]).is_ok());
        assert!(BootWriteData::new(0, vec![0u8; MAX_DATA_CHUNK + 1]).is_err());
    }

    #[test]
    fn test_response_without_crc() {
        let response = BootResponse {
            data: Bytes::from_static(&[1]),
        };
        assert!(response.crc().is_err());
    }
}
