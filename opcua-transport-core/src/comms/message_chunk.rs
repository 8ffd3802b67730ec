//! Chunk header: the 8-byte little-endian prefix in front of every framed chunk, grounded on
//! `opcua_core::comms::message_chunk::MessageChunkHeader`.

use std::io::{Read, Write};

use opcua_transport_types::{read_u32, read_u8, write_u32, write_u8, EncodingResult, Error, StatusCode};

pub const MESSAGE_CHUNK_HEADER_SIZE: usize = 3 + 1 + 4 + 4;
pub const MESSAGE_SIZE_OFFSET: usize = 3 + 1;

const CHUNK_MESSAGE: &[u8] = b"MSG";
const OPEN_SECURE_CHANNEL_MESSAGE: &[u8] = b"OPN";
const CLOSE_SECURE_CHANNEL_MESSAGE: &[u8] = b"CLO";

const CHUNK_FINAL: u8 = b'F';
const CHUNK_INTERMEDIATE: u8 = b'C';
const CHUNK_FINAL_ERROR: u8 = b'A';

/// Which of the three chunked message families this header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageChunkType {
    Message,
    OpenSecureChannel,
    CloseSecureChannel,
}

impl MessageChunkType {
    pub fn is_open_secure_channel(self) -> bool {
        matches!(self, MessageChunkType::OpenSecureChannel)
    }
}

/// Chunk type byte: `'C'` intermediate, `'F'` final, `'A'` abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageIsFinalType {
    Intermediate,
    Final,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageChunkHeader {
    pub message_type: MessageChunkType,
    pub is_final: MessageIsFinalType,
    pub message_size: u32,
    pub secure_channel_id: u32,
}

impl MessageChunkHeader {
    pub fn byte_len(&self) -> usize {
        MESSAGE_CHUNK_HEADER_SIZE
    }

    pub fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        let message_type = match self.message_type {
            MessageChunkType::Message => CHUNK_MESSAGE,
            MessageChunkType::OpenSecureChannel => OPEN_SECURE_CHANNEL_MESSAGE,
            MessageChunkType::CloseSecureChannel => CLOSE_SECURE_CHANNEL_MESSAGE,
        };
        stream.write_all(message_type).map_err(Error::encoding)?;

        let is_final = match self.is_final {
            MessageIsFinalType::Intermediate => CHUNK_INTERMEDIATE,
            MessageIsFinalType::Final => CHUNK_FINAL,
            MessageIsFinalType::Abort => CHUNK_FINAL_ERROR,
        };
        write_u8(stream, is_final)?;
        write_u32(stream, self.message_size)?;
        write_u32(stream, self.secure_channel_id)
    }

    pub fn decode<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<Self> {
        let mut message_type_code = [0u8; 3];
        stream
            .read_exact(&mut message_type_code)
            .map_err(Error::decoding)?;
        let message_type = match &message_type_code as &[u8] {
            CHUNK_MESSAGE => MessageChunkType::Message,
            OPEN_SECURE_CHANNEL_MESSAGE => MessageChunkType::OpenSecureChannel,
            CLOSE_SECURE_CHANNEL_MESSAGE => MessageChunkType::CloseSecureChannel,
            other => {
                return Err(Error::new(
                    StatusCode::BadTcpMessageTypeInvalid,
                    format!("invalid message chunk type: {other:?}"),
                ));
            }
        };

        let chunk_type_code = read_u8(stream)?;
        let is_final = match chunk_type_code {
            CHUNK_FINAL => MessageIsFinalType::Final,
            CHUNK_INTERMEDIATE => MessageIsFinalType::Intermediate,
            CHUNK_FINAL_ERROR => MessageIsFinalType::Abort,
            other => {
                return Err(Error::new(
                    StatusCode::BadTcpMessageTypeInvalid,
                    format!("invalid chunk final type: {other}"),
                ));
            }
        };

        let message_size = read_u32(stream)?;
        let secure_channel_id = read_u32(stream)?;

        Ok(MessageChunkHeader {
            message_type,
            is_final,
            message_size,
            secure_channel_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trips() {
        let header = MessageChunkHeader {
            message_type: MessageChunkType::OpenSecureChannel,
            is_final: MessageIsFinalType::Final,
            message_size: 128,
            secure_channel_id: 7,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), MESSAGE_CHUNK_HEADER_SIZE);
        let mut cursor = Cursor::new(buf);
        let decoded = MessageChunkHeader::decode(&mut cursor).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn unknown_message_type_is_fatal() {
        let mut buf = b"XYZ".to_vec();
        buf.push(b'F');
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let mut cursor = Cursor::new(buf);
        let err = MessageChunkHeader::decode(&mut cursor).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadTcpMessageTypeInvalid);
    }
}
