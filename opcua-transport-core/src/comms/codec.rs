//! Frames whole chunks off a byte stream. Implemented as a `tokio_util::codec::Decoder` so a
//! `TcpStream` wrapped in `FramedRead` gets partial-read buffering and backpressure for free,
//! mirroring how `opcua_client::transport::tcp::TcpTransport` drives its `TcpCodec`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use opcua_transport_types::{Error, StatusCode};

use super::message_chunk::{MESSAGE_CHUNK_HEADER_SIZE, MESSAGE_SIZE_OFFSET};

/// Decodes whole chunks (header + body, still possibly encrypted) out of a byte stream.
pub struct TransportCodec {
    max_chunk_size: usize,
}

impl TransportCodec {
    pub fn new(max_chunk_size: usize) -> Self {
        Self { max_chunk_size }
    }
}

impl Decoder for TransportCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MESSAGE_CHUNK_HEADER_SIZE {
            return Ok(None);
        }

        let message_size = u32::from_le_bytes(
            src[MESSAGE_SIZE_OFFSET..MESSAGE_SIZE_OFFSET + 4]
                .try_into()
                .expect("slice is exactly 4 bytes"),
        ) as usize;

        if message_size < MESSAGE_CHUNK_HEADER_SIZE {
            return Err(Error::new(
                StatusCode::BadTcpMessageTooLarge,
                format!("declared message size {message_size} is smaller than the header"),
            ));
        }
        if message_size > self.max_chunk_size {
            return Err(Error::new(
                StatusCode::BadTcpMessageTooLarge,
                format!(
                    "declared message size {message_size} exceeds the configured limit {}",
                    self.max_chunk_size
                ),
            ));
        }

        if src.len() < message_size {
            // Reserve the remaining bytes up front so a large chunk doesn't reallocate the
            // read buffer repeatedly.
            src.reserve(message_size - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(message_size)))
    }
}

impl Encoder<Vec<u8>> for TransportCodec {
    type Error = Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_bytes(message_size: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"MSG");
        buf.extend_from_slice(&[b'F']);
        buf.extend_from_slice(&message_size.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.resize(message_size as usize, 0);
        buf
    }

    #[test]
    fn waits_for_the_full_header_before_deciding_anything() {
        let mut codec = TransportCodec::new(65536);
        let mut buf = BytesMut::from(&b"MSG"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_the_full_declared_message_before_emitting() {
        let mut codec = TransportCodec::new(65536);
        let mut full = chunk_bytes(32);
        let mut partial = full.split_to(16);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn rejects_an_oversized_message_before_buffering_its_body() {
        let mut codec = TransportCodec::new(128);
        let mut buf = chunk_bytes(256);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadTcpMessageTooLarge);
    }

    #[test]
    fn a_second_chunk_following_the_first_decodes_independently() {
        let mut codec = TransportCodec::new(65536);
        let mut buf = chunk_bytes(32);
        buf.extend_from_slice(&chunk_bytes(40));
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.len(), 32);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.len(), 40);
    }
}
