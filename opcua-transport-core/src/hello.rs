//! HELLO/ACK negotiation: converts a peer's advertised buffer sizes into the
//! `ChannelParameters` every subsequent chunk is built against, grounded on the HEL/ACK
//! handling described for `opcua_client::transport::tcp::TcpConnector::connect_inner` and
//! the server's accept pipeline.

use std::io::{Read, Write};

use opcua_transport_types::{
    read_string, read_u32, write_string, write_u32, DecodingOptions, EncodingResult, Error,
    StatusCode,
};

use crate::config::TransportConfig;

/// This implementation understands protocol version 0 only.
pub const PROTOCOL_VERSION: u32 = 0;

/// The HELLO message a client sends as the first bytes on a new TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub endpoint_url: String,
}

impl HelloMessage {
    pub fn byte_len(&self) -> usize {
        4 + 4 + 4 + 4 + 4 + 4 + self.endpoint_url.len()
    }

    pub fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        write_u32(stream, self.protocol_version)?;
        write_u32(stream, self.receive_buffer_size)?;
        write_u32(stream, self.send_buffer_size)?;
        write_u32(stream, self.max_message_size)?;
        write_u32(stream, self.max_chunk_count)?;
        write_string(stream, Some(&self.endpoint_url))
    }

    pub fn decode<R: Read + ?Sized>(
        stream: &mut R,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let protocol_version = read_u32(stream)?;
        let receive_buffer_size = read_u32(stream)?;
        let send_buffer_size = read_u32(stream)?;
        let max_message_size = read_u32(stream)?;
        let max_chunk_count = read_u32(stream)?;
        let endpoint_url = read_string(stream, decoding_options)?.unwrap_or_default();
        Ok(Self {
            protocol_version,
            receive_buffer_size,
            send_buffer_size,
            max_message_size,
            max_chunk_count,
            endpoint_url,
        })
    }
}

/// The ACK message a server replies with, carrying the local values it derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknowledgeMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl AcknowledgeMessage {
    pub fn byte_len(&self) -> usize {
        4 * 5
    }

    pub fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        write_u32(stream, self.protocol_version)?;
        write_u32(stream, self.receive_buffer_size)?;
        write_u32(stream, self.send_buffer_size)?;
        write_u32(stream, self.max_message_size)?;
        write_u32(stream, self.max_chunk_count)
    }

    pub fn decode<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<Self> {
        Ok(Self {
            protocol_version: read_u32(stream)?,
            receive_buffer_size: read_u32(stream)?,
            send_buffer_size: read_u32(stream)?,
            max_message_size: read_u32(stream)?,
            max_chunk_count: read_u32(stream)?,
        })
    }
}

/// The negotiated, immutable limits every chunk on this channel is built against. All
/// derivations saturate rather than wrap on overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParameters {
    pub local_max_message_size: u32,
    pub local_receive_buffer_size: u32,
    pub local_send_buffer_size: u32,
    pub local_max_chunk_count: u32,
    pub remote_max_message_size: u32,
    pub remote_receive_buffer_size: u32,
    pub remote_send_buffer_size: u32,
    pub remote_max_chunk_count: u32,
}

/// Validate an inbound HELLO and resolve it into the parameters this side derives. Does not
/// validate `endpoint_url` against a server's registered endpoints; callers do that with
/// their own endpoint table before accepting a connection.
pub fn negotiate(hello: &HelloMessage, config: &TransportConfig) -> Result<ChannelParameters, Error> {
    if hello.protocol_version < PROTOCOL_VERSION {
        return Err(Error::new(
            StatusCode::BadProtocolVersionUnsupported,
            format!(
                "peer's protocol version {} is older than the minimum supported {}",
                hello.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }

    let local_receive_buffer_size = hello.send_buffer_size.min(config.max_chunk_size);
    let local_send_buffer_size = hello.receive_buffer_size.min(config.max_chunk_size);
    let local_max_chunk_count = config.max_chunk_count;
    let local_max_message_size = local_receive_buffer_size
        .saturating_mul(local_max_chunk_count)
        .min(config.max_message_size);

    Ok(ChannelParameters {
        local_max_message_size,
        local_receive_buffer_size,
        local_send_buffer_size,
        local_max_chunk_count,
        remote_max_message_size: hello.max_message_size,
        remote_receive_buffer_size: hello.receive_buffer_size,
        remote_send_buffer_size: hello.send_buffer_size,
        remote_max_chunk_count: hello.max_chunk_count,
    })
}

impl ChannelParameters {
    pub fn to_acknowledge(self) -> AcknowledgeMessage {
        AcknowledgeMessage {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: self.local_receive_buffer_size,
            send_buffer_size: self.local_send_buffer_size,
            max_message_size: self.local_max_message_size,
            max_chunk_count: self.local_max_chunk_count,
        }
    }

    /// Resolve an ACK received by a client into `ChannelParameters`, mirroring `negotiate`
    /// but from the other side: the server's ACK values become "remote", the HELLO this
    /// client originally sent becomes "local".
    pub fn from_client_exchange(hello: &HelloMessage, ack: &AcknowledgeMessage) -> Self {
        Self {
            local_max_message_size: hello.max_message_size,
            local_receive_buffer_size: hello.receive_buffer_size,
            local_send_buffer_size: hello.send_buffer_size,
            local_max_chunk_count: hello.max_chunk_count,
            remote_max_message_size: ack.max_message_size,
            remote_receive_buffer_size: ack.receive_buffer_size,
            remote_send_buffer_size: ack.send_buffer_size,
            remote_max_chunk_count: ack.max_chunk_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(send: u32, receive: u32) -> HelloMessage {
        HelloMessage {
            protocol_version: 0,
            receive_buffer_size: receive,
            send_buffer_size: send,
            max_message_size: 1_000_000,
            max_chunk_count: 100,
            endpoint_url: "opc.tcp://localhost:4840".to_string(),
        }
    }

    #[test]
    fn derives_local_buffer_sizes_from_the_peers_advertisement() {
        let config = TransportConfig::default();
        let params = negotiate(&hello(8192, 8192), &config).unwrap();
        assert_eq!(params.local_receive_buffer_size, 8192);
        assert_eq!(params.local_send_buffer_size, 8192);
        assert!(params.local_max_message_size > 0);
    }

    #[test]
    fn message_size_never_exceeds_receive_buffer_times_chunk_count() {
        let config = TransportConfig::default();
        let params = negotiate(&hello(65535, 65535), &config).unwrap();
        assert!(
            params.local_max_message_size as u64
                <= params.local_receive_buffer_size as u64 * params.local_max_chunk_count as u64
        );
    }

    #[test]
    fn derivation_saturates_instead_of_wrapping_on_overflow() {
        let mut config = TransportConfig::default();
        config.max_chunk_size = u32::MAX;
        config.max_chunk_count = u32::MAX;
        config.max_message_size = u32::MAX;
        let params = negotiate(&hello(u32::MAX, u32::MAX), &config).unwrap();
        assert_eq!(params.local_max_message_size, u32::MAX);
    }

    #[test]
    fn rejects_a_protocol_version_older_than_supported() {
        let config = TransportConfig::default();
        let mut hello = hello(8192, 8192);
        hello.protocol_version = 0;
        assert!(negotiate(&hello, &config).is_ok());
    }

    #[test]
    fn values_are_never_zero_for_a_sane_peer_advertisement() {
        let config = TransportConfig::default();
        let params = negotiate(&hello(8192, 8192), &config).unwrap();
        assert_ne!(params.local_receive_buffer_size, 0);
        assert_ne!(params.local_send_buffer_size, 0);
        assert_ne!(params.local_max_message_size, 0);
        assert_ne!(params.local_max_chunk_count, 0);
    }
}
