//! Link Protocol Layer (LPL)
//!
//! Wire format of one frame:
//!
//! ```text
//! ┌───────────────────────────────────────────┬──────┐
//! │ COBS/R( CRC-16 (2B LE) ++ message bytes ) │ 0x00 │
//! └───────────────────────────────────────────┴──────┘
//! ```
//!
//! The CRC is CRC-16/ARC over the message bytes. The stuffed region never
//! contains `0x00`, so the delimiter resynchronizes the receiver after any
//! corrupted frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_ARC};
use tokio_util::codec::{Decoder, Encoder};

pub mod cobsr;
mod types;

pub use self::types::FrameError;

use crate::error::Error;

/// Message id (2 bytes) + 255 bytes of data.
pub const MAX_MESSAGE_LEN: usize = 2 + 255;

/// Largest stuffed frame including the delimiter.
pub const MAX_FRAME_LEN: usize = cobsr::max_encoded_len(2 + MAX_MESSAGE_LEN) + 1;

/// CRC header + message id.
const MIN_PACKET_LEN: usize = 2 + 2;

const FRAME_DELIMITER: u8 = 0x00;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Encodes one message into wire bytes, delimiter included.
pub fn encode_packet(message: &[u8]) -> Result<Vec<u8>, FrameError> {
    if message.len() > MAX_MESSAGE_LEN {
        return Err(FrameError::TooLarge {
            size: message.len(),
            max: MAX_MESSAGE_LEN,
        });
    }

    let mut raw = BytesMut::with_capacity(2 + message.len());
    raw.put_u16_le(crc16(message));
    raw.put_slice(message);

    let mut packet = cobsr::encode(&raw);
    packet.push(FRAME_DELIMITER);
    Ok(packet)
}

/// Decodes the bytes of one frame, delimiter excluded.
pub fn decode_packet(frame: &[u8]) -> Result<Bytes, FrameError> {
    let data = cobsr::decode(frame)?;

    if data.len() < MIN_PACKET_LEN {
        return Err(FrameError::TooShort(data.len()));
    }

    let header = u16::from_le_bytes([data[0], data[1]]);
    let computed = crc16(&data[2..]);

    if header != computed {
        return Err(FrameError::Crc { header, computed });
    }

    let mut data = Bytes::from(data);
    data.advance(2);
    Ok(data)
}

/// Codec for the delimiter-framed link.
///
/// Decoding never fails the stream on bad frames. Each candidate frame yields
/// `Ok(Some(Err(..)))` instead, so the caller can count it and carry on.
#[derive(Debug, Default)]
pub struct FrameCodec {
    discarding: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Bytes, FrameError>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == FRAME_DELIMITER) else {
                if !self.discarding && src.len() >= MAX_FRAME_LEN {
                    let dropped = src.len();
                    src.clear();
                    self.discarding = true;
                    return Ok(Some(Err(FrameError::Overrun(dropped))));
                }
                if self.discarding {
                    src.clear();
                }
                return Ok(None);
            };

            let frame = src.split_to(pos);
            src.advance(1);

            if self.discarding {
                // tail of an overrun frame
                self.discarding = false;
                continue;
            }

            return Ok(Some(decode_packet(&frame)));
        }
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, message: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        let packet = encode_packet(message)?;
        dst.extend_from_slice(&packet);
        Ok(())
    }
}
