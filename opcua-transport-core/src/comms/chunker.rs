//! Splits an encoded message body across chunks on send and reassembles a run of chunks into
//! a message body on receive, applying the secure channel's signing/encryption at each step.
//! Grounded on `async_opcua_core::comms::chunker::Chunker`.

use opcua_transport_crypto::{MessageSecurityMode, SecurityPolicy};
use opcua_transport_types::{write_bytes, DecodingOptions, EncodingResult, Error, StatusCode};

use super::message_chunk::{
    MessageChunkHeader, MessageChunkType, MessageIsFinalType, MESSAGE_CHUNK_HEADER_SIZE,
};
use super::security_header::{SecurityHeader, SequenceHeader};
use super::secure_channel::SecureChannel;

/// The smallest chunk size the protocol permits; anything below this cannot hold a header,
/// a security header and at least one byte of payload.
pub const MIN_CHUNK_SIZE: usize = 8192;

/// Maximum body bytes that fit in one chunk of `max_chunk_size`, given the signature and
/// padding overhead the channel's current security policy imposes.
fn body_capacity(
    secure_channel: &SecureChannel,
    message_type: MessageChunkType,
    max_chunk_size: usize,
) -> Result<usize, Error> {
    let security_header = secure_channel.make_security_header(message_type);
    let header_size =
        MESSAGE_CHUNK_HEADER_SIZE + security_header.byte_len() + SequenceHeader { sequence_number: 0, request_id: 0 }.byte_len();
    let signature_size = secure_channel.signature_size(&security_header);
    let (plain_text_block_size, minimum_padding) =
        secure_channel.get_padding_block_sizes(&security_header, signature_size);

    let too_small_err = || {
        Error::new(
            StatusCode::BadTcpMessageTooLarge,
            "chunk size is too small to hold even an empty message body",
        )
    };

    if let SecurityHeader::Asymmetric(_) = &security_header {
        if let Some((plain_block, cipher_block)) = secure_channel.outgoing_asymmetric_block_sizes() {
            if plain_block > 0 && header_size + cipher_block <= max_chunk_size {
                let block_count = (max_chunk_size - header_size) / cipher_block;
                let plaintext_region = block_count * plain_block;
                return plaintext_region
                    .checked_sub(signature_size + minimum_padding)
                    .filter(|capacity| *capacity > 0)
                    .ok_or_else(too_small_err);
            }
            return Err(too_small_err());
        }
    }

    let aligned_max_chunk_size = if plain_text_block_size > 0 {
        max_chunk_size - (max_chunk_size % plain_text_block_size)
    } else {
        max_chunk_size
    };

    let overhead = header_size + signature_size + minimum_padding;
    if aligned_max_chunk_size <= overhead {
        return Err(too_small_err());
    }
    Ok(aligned_max_chunk_size - overhead)
}

/// Encode `body` as one or more chunks of `message_type`, signing/encrypting each under the
/// channel's current outbound security state. All chunks share `request_id`; the last is
/// marked `Final`.
pub fn encode(
    body: &[u8],
    message_type: MessageChunkType,
    request_id: u32,
    secure_channel: &mut SecureChannel,
    max_chunk_size: usize,
) -> Result<Vec<Vec<u8>>, Error> {
    let capacity = body_capacity(secure_channel, message_type, max_chunk_size)?;
    let chunk_count = body.len().div_ceil(capacity).max(1);

    let mut chunks = Vec::with_capacity(chunk_count);
    for (index, slice) in body.chunks(capacity).enumerate() {
        let is_final = if index + 1 == chunk_count {
            MessageIsFinalType::Final
        } else {
            MessageIsFinalType::Intermediate
        };
        let sequence_number = secure_channel.next_sequence_number();
        let chunk = encode_one_chunk(
            slice,
            message_type,
            is_final,
            sequence_number,
            request_id,
            secure_channel,
        )?;
        chunks.push(chunk);
    }
    if chunks.is_empty() {
        // An empty body still needs exactly one, final, chunk.
        let sequence_number = secure_channel.next_sequence_number();
        chunks.push(encode_one_chunk(
            &[],
            message_type,
            MessageIsFinalType::Final,
            sequence_number,
            request_id,
            secure_channel,
        )?);
    }
    Ok(chunks)
}

fn encode_one_chunk(
    body: &[u8],
    message_type: MessageChunkType,
    is_final: MessageIsFinalType,
    sequence_number: u32,
    request_id: u32,
    secure_channel: &SecureChannel,
) -> Result<Vec<u8>, Error> {
    let security_header = secure_channel.make_security_header(message_type);
    let sequence_header = SequenceHeader {
        sequence_number,
        request_id,
    };
    let signature_size = secure_channel.signature_size(&security_header);
    let (padding_size, _) = secure_channel.padding_size(&security_header, body.len(), signature_size);

    let header_size = MESSAGE_CHUNK_HEADER_SIZE + security_header.byte_len() + sequence_header.byte_len();
    let plaintext_region_len = body.len() + padding_size + signature_size;

    let asymmetric_blocks = match &security_header {
        SecurityHeader::Asymmetric(_) => secure_channel.outgoing_asymmetric_block_sizes(),
        SecurityHeader::Symmetric(_) => None,
    };
    let final_region_len = match asymmetric_blocks {
        Some((plain_block, cipher_block)) if plain_block > 0 => {
            plaintext_region_len.div_ceil(plain_block).max(1) * cipher_block
        }
        _ => plaintext_region_len,
    };
    let message_size = header_size + final_region_len;

    let mut buf = Vec::with_capacity(message_size);
    let header = MessageChunkHeader {
        message_type,
        is_final,
        message_size: message_size as u32,
        secure_channel_id: secure_channel.secure_channel_id(),
    };
    header.encode(&mut buf)?;
    security_header.encode(&mut buf)?;
    sequence_header.encode(&mut buf)?;
    buf.extend_from_slice(body);

    if padding_size > 0 {
        // The padding byte value itself records how much padding was added, so the
        // receiver can strip it without consulting anything else, matching the common
        // PKCS-style OPC UA padding scheme.
        write_bytes(&mut buf, (padding_size - 1) as u8, padding_size)?;
    }

    match &security_header {
        SecurityHeader::Symmetric(_) => {
            if signature_size > 0 {
                if let Some(keys) = secure_channel.local_keys() {
                    let signature = secure_channel
                        .security_policy()
                        .sign(&keys.signing_key, &buf);
                    buf.extend_from_slice(&signature);
                }
            }
            if secure_channel.security_mode() == MessageSecurityMode::SignAndEncrypt {
                if let Some(keys) = secure_channel.local_keys() {
                    let plaintext_start = header_size;
                    let (_plain, cipher) = buf.split_at_mut(plaintext_start);
                    let src = cipher.to_vec();
                    let mut dst = vec![0u8; src.len()];
                    keys.encrypting_key.encrypt(&src, &keys.iv, &mut dst).ok();
                    cipher.copy_from_slice(&dst);
                }
            }
        }
        SecurityHeader::Asymmetric(_) => {
            if signature_size > 0 {
                if let Some(private_key) = secure_channel.local_private_key() {
                    let signature = private_key.sign(&buf)?;
                    buf.extend_from_slice(&signature);
                }
            }
            if let Some((plain_block, _)) = asymmetric_blocks {
                if let Some(remote_key) = secure_channel.remote_public_key() {
                    let plaintext_start = header_size;
                    let plaintext = buf[plaintext_start..].to_vec();
                    let mut ciphertext = Vec::with_capacity(final_region_len);
                    for block in plaintext.chunks(plain_block.max(1)) {
                        ciphertext.extend_from_slice(&remote_key.encrypt(block)?);
                    }
                    buf.truncate(plaintext_start);
                    buf.extend_from_slice(&ciphertext);
                }
            }
        }
    }

    Ok(buf)
}

/// A reassembled message: the plaintext body and the request id all chunks shared.
pub struct DecodedMessage {
    pub request_id: u32,
    pub body: Vec<u8>,
}

/// Reassemble a run of raw chunk buffers belonging to one message into its plaintext body,
/// verifying the security header, signature and sequence numbers of each chunk in turn.
///
/// Chunks carrying chunk type `'A'` (abort) short-circuit with the carried status instead of
/// a decoded body.
pub fn decode(
    raw_chunks: &[Vec<u8>],
    secure_channel: &SecureChannel,
    last_sequence_number: &mut Option<u32>,
    decoding_options: &DecodingOptions,
) -> Result<DecodedMessage, Error> {
    let mut body = Vec::new();
    let mut request_id = None;

    for raw in raw_chunks {
        let info = super::chunk_info::ChunkInfo::new(raw, secure_channel, decoding_options)?;

        if info.message_header.secure_channel_id != secure_channel.secure_channel_id()
            && secure_channel.secure_channel_id() != 0
        {
            return Err(Error::new(
                StatusCode::BadSecureChannelIdInvalid,
                format!(
                    "chunk secure channel id {} does not match {}",
                    info.message_header.secure_channel_id,
                    secure_channel.secure_channel_id()
                ),
            ));
        }

        if let super::security_header::SecurityHeader::Symmetric(header) = &info.security_header {
            secure_channel.resolve_token(header.token_id)?;
        }

        if let Some(previous) = *last_sequence_number {
            if info.sequence_header.sequence_number <= previous
                && !(previous >= super::secure_channel::SEQUENCE_NUMBER_WRAP_AT
                    && info.sequence_header.sequence_number == 1)
            {
                return Err(Error::new(
                    StatusCode::BadSequenceNumberInvalid,
                    "sequence number did not strictly increase",
                ));
            }
        }
        *last_sequence_number = Some(info.sequence_header.sequence_number);

        match request_id {
            None => request_id = Some(info.sequence_header.request_id),
            Some(existing) if existing != info.sequence_header.request_id => {
                return Err(Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    "chunk sequence carried inconsistent request ids",
                ));
            }
            _ => {}
        }

        if info.message_header.is_final == MessageIsFinalType::Abort {
            let mut cursor = std::io::Cursor::new(&raw[info.body_offset..]);
            let status_code = opcua_transport_types::read_u32(&mut cursor)?;
            let reason =
                opcua_transport_types::read_string(&mut cursor, decoding_options)?.unwrap_or_default();
            return Err(Error::new(
                StatusCode::BadCommunicationError,
                format!("message aborted with status 0x{status_code:08X}: {reason}"),
            ));
        }

        let plaintext = decrypt_and_verify(raw, &info, secure_channel)?;
        body.extend_from_slice(&plaintext);
    }

    Ok(DecodedMessage {
        request_id: request_id.unwrap_or(0),
        body,
    })
}

fn decrypt_and_verify(
    raw: &[u8],
    info: &super::chunk_info::ChunkInfo,
    secure_channel: &SecureChannel,
) -> Result<Vec<u8>, Error> {
    match &info.security_header {
        SecurityHeader::Symmetric(header) => {
            decrypt_and_verify_symmetric(raw, info, header.token_id, secure_channel)
        }
        SecurityHeader::Asymmetric(_) => decrypt_and_verify_asymmetric(raw, info, secure_channel),
    }
}

fn decrypt_and_verify_symmetric(
    raw: &[u8],
    info: &super::chunk_info::ChunkInfo,
    token_id: u32,
    secure_channel: &SecureChannel,
) -> Result<Vec<u8>, Error> {
    let signature_size = secure_channel.signature_size(&info.security_header);

    if secure_channel.security_mode() != MessageSecurityMode::SignAndEncrypt {
        let body_end = raw.len() - signature_size;
        return Ok(raw[info.body_offset..body_end].to_vec());
    }
    let token = secure_channel.resolve_token(token_id)?;
    let keys = &token.keys;

    let ciphertext = &raw[info.body_offset..];
    let mut plaintext = vec![0u8; ciphertext.len()];
    keys.encrypting_key
        .decrypt(ciphertext, &keys.iv, &mut plaintext)
        .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))?;

    let body_end = plaintext.len() - signature_size;
    let signature = &plaintext[body_end..];
    let mut signed_region = raw[..info.body_offset].to_vec();
    signed_region.extend_from_slice(&plaintext[..body_end]);
    if !secure_channel
        .security_policy()
        .verify(&keys.signing_key, &signed_region, signature)
    {
        return Err(Error::new(
            StatusCode::BadSecurityChecksFailed,
            "symmetric signature verification failed",
        ));
    }

    let padding_byte = plaintext[body_end - 1];
    let padding_size = padding_byte as usize + 1;
    let body_size = body_end - padding_size;
    Ok(plaintext[..body_size].to_vec())
}

/// Decrypt (if a local keypair is installed) and verify (if the peer's public key is known)
/// the asymmetric portion of an OPN/CLO chunk. `SecurityPolicy::None` carries neither.
fn decrypt_and_verify_asymmetric(
    raw: &[u8],
    info: &super::chunk_info::ChunkInfo,
    secure_channel: &SecureChannel,
) -> Result<Vec<u8>, Error> {
    if secure_channel.security_policy() == SecurityPolicy::None {
        return Ok(raw[info.body_offset..].to_vec());
    }

    let (plaintext, was_encrypted) = match secure_channel.incoming_asymmetric_block_sizes() {
        Some((_, cipher_block)) if cipher_block > 0 => {
            let private_key = secure_channel.local_private_key().ok_or_else(|| {
                Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    "no local private key installed to decrypt an asymmetric chunk",
                )
            })?;
            let ciphertext = &raw[info.body_offset..];
            let mut plaintext = Vec::with_capacity(ciphertext.len());
            for block in ciphertext.chunks(cipher_block) {
                plaintext.extend_from_slice(&private_key.decrypt(block)?);
            }
            (plaintext, true)
        }
        _ => (raw[info.body_offset..].to_vec(), false),
    };

    let signature_size = secure_channel.incoming_signature_size(&info.security_header);
    if signature_size == 0 || signature_size > plaintext.len() {
        return Ok(plaintext);
    }

    let body_end = plaintext.len() - signature_size;
    let signature = &plaintext[body_end..];
    let mut signed_region = raw[..info.body_offset].to_vec();
    signed_region.extend_from_slice(&plaintext[..body_end]);

    let remote_key = secure_channel.remote_public_key().ok_or_else(|| {
        Error::new(
            StatusCode::BadSecurityChecksFailed,
            "no remote public key installed to verify an asymmetric chunk's signature",
        )
    })?;
    remote_key.verify(&signed_region, signature)?;

    if !was_encrypted || body_end == 0 {
        return Ok(plaintext[..body_end].to_vec());
    }
    let padding_byte = plaintext[body_end - 1];
    let padding_size = padding_byte as usize + 1;
    if padding_size > body_end {
        return Err(Error::new(
            StatusCode::BadSecurityChecksFailed,
            "asymmetric chunk padding exceeds its own body",
        ));
    }
    let body_size = body_end - padding_size;
    Ok(plaintext[..body_size].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcua_transport_crypto::{AsymmetricKeyPair, RemotePublicKey};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use std::sync::Arc;

    fn rsa_pair() -> (Arc<AsymmetricKeyPair>, Arc<RemotePublicKey>) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("key generation");
        let public_key = RsaPublicKey::from(&private_key);
        (
            Arc::new(AsymmetricKeyPair::new(private_key)),
            Arc::new(RemotePublicKey::new(public_key)),
        )
    }

    #[test]
    fn asymmetric_open_secure_channel_chunk_round_trips() {
        let (client_private, client_public) = rsa_pair();
        let (server_private, server_public) = rsa_pair();

        let mut client = SecureChannel::new(
            Role::Client,
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
        );
        client.set_local_private_key(client_private);
        client.set_remote_public_key(server_public);

        let mut server = SecureChannel::new(
            Role::Server,
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
        );
        server.set_local_private_key(server_private);
        server.set_remote_public_key(client_public);

        let body = b"open secure channel request body".to_vec();
        let chunks = encode(&body, MessageChunkType::OpenSecureChannel, 1, &mut client, MIN_CHUNK_SIZE).unwrap();
        assert_eq!(chunks.len(), 1);

        let mut last_sequence_number = None;
        let decoded = decode(
            &chunks,
            &server,
            &mut last_sequence_number,
            &DecodingOptions::default(),
        )
        .unwrap();
        assert_eq!(decoded.body, body);
        assert_eq!(decoded.request_id, 1);
    }

    #[test]
    fn asymmetric_chunk_with_tampered_ciphertext_fails_verification() {
        let (client_private, client_public) = rsa_pair();
        let (server_private, server_public) = rsa_pair();

        let mut client = SecureChannel::new(
            Role::Client,
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
        );
        client.set_local_private_key(client_private);
        client.set_remote_public_key(server_public);

        let mut server = SecureChannel::new(
            Role::Server,
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
        );
        server.set_local_private_key(server_private);
        server.set_remote_public_key(client_public);

        let body = b"open secure channel request body".to_vec();
        let mut chunks = encode(&body, MessageChunkType::OpenSecureChannel, 1, &mut client, MIN_CHUNK_SIZE).unwrap();
        let last = chunks[0].len() - 1;
        chunks[0][last] ^= 0xFF;

        let mut last_sequence_number = None;
        let result = decode(&chunks, &server, &mut last_sequence_number, &DecodingOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn no_security_policy_open_secure_channel_chunk_is_plaintext() {
        let mut client = SecureChannel::new(Role::Client, SecurityPolicy::None, MessageSecurityMode::None);
        let server = SecureChannel::new(Role::Server, SecurityPolicy::None, MessageSecurityMode::None);

        let body = b"hello".to_vec();
        let chunks = encode(&body, MessageChunkType::OpenSecureChannel, 7, &mut client, MIN_CHUNK_SIZE).unwrap();
        let mut last_sequence_number = None;
        let decoded = decode(&chunks, &server, &mut last_sequence_number, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded.body, body);
    }
}
