//! Parses the fixed-position headers out of a raw chunk buffer, grounded on
//! `opcua_core::comms::message_chunk_info::ChunkInfo`.

use std::io::Cursor;

use opcua_transport_types::{DecodingOptions, EncodingResult};

use super::message_chunk::MessageChunkHeader;
use super::security_header::{SecurityHeader, SequenceHeader};
use super::secure_channel::SecureChannel;

/// Positions and decoded headers of one raw chunk buffer.
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    pub message_header: MessageChunkHeader,
    pub security_header: SecurityHeader,
    pub sequence_header: SequenceHeader,
    pub security_header_offset: usize,
    pub sequence_header_offset: usize,
    pub body_offset: usize,
}

impl ChunkInfo {
    pub fn new(
        data: &[u8],
        secure_channel: &SecureChannel,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let mut stream = Cursor::new(data);
        let message_header = MessageChunkHeader::decode(&mut stream)?;
        let security_header_offset = stream.position() as usize;

        let security_header = SecurityHeader::decode_from_stream(
            &mut stream,
            message_header.message_type.is_open_secure_channel(),
            decoding_options,
        )?;
        let sequence_header_offset = stream.position() as usize;

        let sequence_header = SequenceHeader::decode(&mut stream)?;
        let body_offset = stream.position() as usize;

        let _ = secure_channel;
        Ok(Self {
            message_header,
            security_header,
            sequence_header,
            security_header_offset,
            sequence_header_offset,
            body_offset,
        })
    }
}
