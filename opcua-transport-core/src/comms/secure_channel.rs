//! Holds all security state for one connection: current/previous tokens, derived keys, the
//! request id and sequence number counters, and the padding/signing logic chunks are built
//! from. Grounded on `async_opcua_core::comms::secure_channel::SecureChannel`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use opcua_transport_crypto::{
    AsymmetricKeyPair, MessageSecurityMode, RemotePublicKey, SecureChannelKeys, SecurityPolicy,
};
use opcua_transport_types::{ByteString, Error, StatusCode};

use super::message_chunk::MessageChunkType;
use super::security_header::{AsymmetricSecurityHeader, SecurityHeader, SymmetricSecurityHeader};

/// RSA-OAEP/SHA-256 overhead per RFC 8017 7.1.1: two hash lengths plus two bytes. Bounds how
/// many plaintext bytes fit in one asymmetric block alongside the fixed ciphertext block size
/// (the key's modulus size).
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

/// u32 sequence numbers and request ids wrap one below `u32::MAX` rather than at the true
/// unsigned boundary, per Part 6 6.7.2.
pub const SEQUENCE_NUMBER_WRAP_AT: u32 = u32::MAX - 1024;

/// Which end of the connection this channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Symmetric keying material bound to one token id, plus the instant it stops being
/// acceptable for inbound chunks.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    pub token_id: u32,
    pub created_at: DateTime<Utc>,
    pub lifetime_millis: u32,
    pub keys: SecureChannelKeys,
}

impl SecurityToken {
    /// Instant after which this token, if retained as `previous`, must be dropped: created
    /// time plus 125% of its lifetime (the 25% grace interval from the spec's Open Question
    /// decision), matching `RemoteKeys::expires_at` in the teacher.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::milliseconds(self.lifetime_millis as i64 * 5 / 4)
    }
}

/// Channel id, security material, counters: the per-connection state owned by one
/// serialization queue (see `opcua_transport_core::queue`).
#[derive(Debug)]
pub struct SecureChannel {
    role: Role,
    security_policy: SecurityPolicy,
    security_mode: MessageSecurityMode,
    secure_channel_id: u32,
    local_nonce: Vec<u8>,
    remote_nonce: Vec<u8>,
    current: Option<SecurityToken>,
    previous: Option<SecurityToken>,
    local_keys: Option<SecureChannelKeys>,
    sender_certificate: Vec<u8>,
    remote_certificate: Vec<u8>,
    local_private_key: Option<Arc<AsymmetricKeyPair>>,
    remote_public_key: Option<Arc<RemotePublicKey>>,
    send_sequence_number: u32,
    request_id_sequence: u32,
}

impl SecureChannel {
    pub fn new(role: Role, security_policy: SecurityPolicy, security_mode: MessageSecurityMode) -> Self {
        Self {
            role,
            security_policy,
            security_mode,
            secure_channel_id: 0,
            local_nonce: Vec::new(),
            remote_nonce: Vec::new(),
            current: None,
            previous: None,
            local_keys: None,
            sender_certificate: Vec::new(),
            remote_certificate: Vec::new(),
            local_private_key: None,
            remote_public_key: None,
            send_sequence_number: 0,
            request_id_sequence: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn security_policy(&self) -> SecurityPolicy {
        self.security_policy
    }

    pub fn security_mode(&self) -> MessageSecurityMode {
        self.security_mode
    }

    pub fn secure_channel_id(&self) -> u32 {
        self.secure_channel_id
    }

    pub fn set_secure_channel_id(&mut self, id: u32) {
        self.secure_channel_id = id;
    }

    pub fn current_token_id(&self) -> Option<u32> {
        self.current.as_ref().map(|t| t.token_id)
    }

    /// Generate and store a fresh local nonce of the policy's required length.
    pub fn create_random_nonce(&mut self) {
        let len = self.security_policy.secure_channel_nonce_length();
        self.local_nonce = opcua_transport_crypto::random::byte_vec(len);
    }

    pub fn local_nonce(&self) -> &[u8] {
        &self.local_nonce
    }

    pub fn set_remote_nonce(&mut self, remote_nonce: &ByteString) -> Result<(), Error> {
        let expected = self.security_policy.secure_channel_nonce_length();
        if self.security_policy == SecurityPolicy::None {
            self.remote_nonce = remote_nonce.as_bytes().to_vec();
            return Ok(());
        }
        if remote_nonce.len() != expected {
            return Err(Error::new(
                StatusCode::BadNonceInvalid,
                format!(
                    "remote nonce is {} bytes, expected {}",
                    remote_nonce.len(),
                    expected
                ),
            ));
        }
        self.remote_nonce = remote_nonce.as_bytes().to_vec();
        Ok(())
    }

    /// Derive local/remote symmetric keys from the nonce pair exchanged during OPN, per
    /// Part 6 Table 33.
    pub fn derive_keys(&mut self) {
        if self.security_policy == SecurityPolicy::None {
            return;
        }
        let remote_keys = self
            .security_policy
            .make_secure_channel_keys(&self.local_nonce, &self.remote_nonce);
        self.local_keys = Some(
            self.security_policy
                .make_secure_channel_keys(&self.remote_nonce, &self.local_nonce),
        );
        if let Some(current) = self.current.as_mut() {
            current.keys = remote_keys;
        }
    }

    /// Install a freshly issued token as `current`, demoting the old `current` to
    /// `previous`. Drops whatever `previous` token was already retained: only one previous
    /// token is kept at a time, matching the teacher's single-previous-token handling.
    pub fn set_security_token(&mut self, token_id: u32, lifetime_millis: u32) {
        let remote_keys = if self.security_policy == SecurityPolicy::None {
            self.security_policy.make_secure_channel_keys(&[], &[])
        } else {
            self.security_policy
                .make_secure_channel_keys(&self.local_nonce, &self.remote_nonce)
        };
        let new_token = SecurityToken {
            token_id,
            created_at: Utc::now(),
            lifetime_millis,
            keys: remote_keys,
        };
        self.previous = self.current.take();
        self.current = Some(new_token);
    }

    /// `true` once the current token has lived past `renewal_fraction` of its lifetime and
    /// a renewal OPN should be issued before the next send.
    pub fn should_renew_security_token(&self, renewal_fraction: f32) -> bool {
        match &self.current {
            None => false,
            Some(token) => {
                let age = Utc::now() - token.created_at;
                let threshold = Duration::milliseconds(
                    (token.lifetime_millis as f64 * renewal_fraction as f64) as i64,
                );
                age >= threshold
            }
        }
    }

    /// Drop `previous` if its grace period has elapsed. Called when a new token is
    /// installed, not on a separate timer, per the spec's Open Question decision.
    pub fn expire_previous_token(&mut self) {
        if let Some(previous) = &self.previous {
            if Utc::now() >= previous.expires_at() {
                self.previous = None;
            }
        }
    }

    /// Resolve a chunk's claimed token id against `current`/`previous`, enforcing the 25%
    /// grace window on the previous token.
    pub fn resolve_token(&self, token_id: u32) -> Result<&SecurityToken, Error> {
        if let Some(current) = &self.current {
            if current.token_id == token_id {
                return Ok(current);
            }
        }
        if let Some(previous) = &self.previous {
            if previous.token_id == token_id && Utc::now() < previous.expires_at() {
                return Ok(previous);
            }
        }
        Err(Error::new(
            StatusCode::BadSecureChannelTokenUnknown,
            format!("token id {token_id} matches neither the current nor previous token"),
        ))
    }

    pub fn local_keys(&self) -> Option<&SecureChannelKeys> {
        self.local_keys.as_ref()
    }

    pub fn set_certificates(&mut self, sender_certificate: Vec<u8>, remote_certificate: Vec<u8>) {
        self.sender_certificate = sender_certificate;
        self.remote_certificate = remote_certificate;
    }

    pub fn sender_certificate(&self) -> &[u8] {
        &self.sender_certificate
    }

    /// Install this party's RSA keypair, used to sign outgoing and decrypt incoming OPN/CLO
    /// chunks. Parsing it out of a certificate/private key file is the certificate-management
    /// collaborator's job; this layer only needs the keypair itself.
    pub fn set_local_private_key(&mut self, key: Arc<AsymmetricKeyPair>) {
        self.local_private_key = Some(key);
    }

    /// Install the peer's RSA public key, extracted from their certificate, used to verify
    /// their signature and encrypt outgoing OPN/CLO chunks addressed to them.
    pub fn set_remote_public_key(&mut self, key: Arc<RemotePublicKey>) {
        self.remote_public_key = Some(key);
    }

    pub fn local_private_key(&self) -> Option<&Arc<AsymmetricKeyPair>> {
        self.local_private_key.as_ref()
    }

    pub fn remote_public_key(&self) -> Option<&Arc<RemotePublicKey>> {
        self.remote_public_key.as_ref()
    }

    /// `(plaintext bytes per RSA block, ciphertext bytes per RSA block)` for chunks this party
    /// sends, encrypted under the peer's public key. `None` until the peer's certificate has
    /// been installed.
    pub fn outgoing_asymmetric_block_sizes(&self) -> Option<(usize, usize)> {
        let cipher_block = self.remote_public_key.as_ref()?.size();
        Some((cipher_block.saturating_sub(OAEP_SHA256_OVERHEAD), cipher_block))
    }

    /// `(plaintext bytes per RSA block, ciphertext bytes per RSA block)` for chunks this party
    /// receives, encrypted under its own public key. `None` until a local keypair is installed.
    pub fn incoming_asymmetric_block_sizes(&self) -> Option<(usize, usize)> {
        let cipher_block = self.local_private_key.as_ref()?.size();
        Some((cipher_block.saturating_sub(OAEP_SHA256_OVERHEAD), cipher_block))
    }

    /// Build the security header to stamp on a chunk of the given type: asymmetric for
    /// OPN/CLO's handshake framing, symmetric (current token id) otherwise.
    pub fn make_security_header(&self, message_type: MessageChunkType) -> SecurityHeader {
        if message_type.is_open_secure_channel() {
            if self.security_policy == SecurityPolicy::None {
                SecurityHeader::Asymmetric(AsymmetricSecurityHeader::none())
            } else {
                SecurityHeader::Asymmetric(AsymmetricSecurityHeader::new(
                    self.security_policy,
                    &self.sender_certificate,
                    ByteString::from(self.remote_certificate.clone()),
                ))
            }
        } else {
            SecurityHeader::Symmetric(SymmetricSecurityHeader {
                token_id: self.current_token_id().unwrap_or(0),
            })
        }
    }

    /// Signature size for a chunk this party is about to sign and send: for an asymmetric
    /// header this is the local keypair's modulus size (a PKCS#1v1.5 signature is exactly one
    /// RSA block), for a symmetric header it's the policy's fixed HMAC length.
    pub fn signature_size(&self, security_header: &SecurityHeader) -> usize {
        match security_header {
            SecurityHeader::Asymmetric(_) => {
                if self.security_policy == SecurityPolicy::None {
                    0
                } else {
                    self.local_private_key.as_ref().map(|k| k.size()).unwrap_or(0)
                }
            }
            SecurityHeader::Symmetric(_) => self.security_policy.symmetric_signature_size(),
        }
    }

    /// Signature size to expect when verifying an inbound chunk. For an asymmetric header this
    /// is the *peer's* key size (the signature was produced by their private key), which can
    /// differ from [`Self::signature_size`]'s local key size.
    pub fn incoming_signature_size(&self, security_header: &SecurityHeader) -> usize {
        match security_header {
            SecurityHeader::Asymmetric(_) => {
                if self.security_policy == SecurityPolicy::None {
                    0
                } else {
                    self.remote_public_key.as_ref().map(|k| k.size()).unwrap_or(0)
                }
            }
            SecurityHeader::Symmetric(_) => self.security_policy.symmetric_signature_size(),
        }
    }

    /// `(plainTextBlockSize, minimumPadding)` used to align the encrypted region of a chunk
    /// this party is about to send. Returns `(0, 0)` when the chunk is not encrypted.
    ///
    /// For a symmetric header this is the block cipher's block size, gated on
    /// `MessageSecurityMode::SignAndEncrypt`. For an asymmetric header (OPN/CLO) this is the
    /// RSA-OAEP plaintext block size implied by the peer's public key, applied whenever the
    /// security policy isn't `None` — Part 6 requires the handshake chunk to be protected
    /// regardless of the negotiated message security mode, which only governs MSG chunks.
    pub fn get_padding_block_sizes(
        &self,
        security_header: &SecurityHeader,
        signature_size: usize,
    ) -> (usize, usize) {
        match security_header {
            SecurityHeader::Asymmetric(_) => {
                if self.security_policy == SecurityPolicy::None {
                    return (0, 0);
                }
                match self.outgoing_asymmetric_block_sizes() {
                    // RSA-OAEP supplies its own internal padding; no minimum padding byte is
                    // needed beyond block alignment.
                    Some((plain_block, _)) if plain_block > 0 => (plain_block, 0),
                    _ => (0, 0),
                }
            }
            SecurityHeader::Symmetric(_) => {
                if self.security_policy == SecurityPolicy::None
                    || self.security_mode != MessageSecurityMode::SignAndEncrypt
                {
                    (0, 0)
                } else {
                    (
                        self.security_policy.plain_block_size(),
                        if signature_size + 1 > 256 { 2 } else { 1 },
                    )
                }
            }
        }
    }

    /// Compute how many padding bytes (beyond the minimum) are needed to align
    /// `8 + body_size + signature_size + minimum_padding` to a whole number of encryption
    /// blocks.
    pub fn padding_size(
        &self,
        security_header: &SecurityHeader,
        body_size: usize,
        signature_size: usize,
    ) -> (usize, usize) {
        let (plain_text_block_size, minimum_padding) =
            self.get_padding_block_sizes(security_header, signature_size);
        if plain_text_block_size == 0 {
            return (0, 0);
        }
        let encrypt_size = 8 + body_size + signature_size + minimum_padding;
        let padding_size = if encrypt_size % plain_text_block_size != 0 {
            plain_text_block_size - (encrypt_size % plain_text_block_size)
        } else {
            0
        };
        (minimum_padding + padding_size, minimum_padding)
    }

    /// Next outbound sequence number, wrapping to 1 just below `u32::MAX` rather than at the
    /// hardware boundary.
    pub fn next_sequence_number(&mut self) -> u32 {
        self.send_sequence_number = if self.send_sequence_number >= SEQUENCE_NUMBER_WRAP_AT {
            1
        } else {
            self.send_sequence_number + 1
        };
        self.send_sequence_number
    }

    /// Next outbound request id. Starts at 1, wraps the same way as sequence numbers, and
    /// never produces 0.
    pub fn next_request_id(&mut self) -> u32 {
        self.request_id_sequence = if self.request_id_sequence >= SEQUENCE_NUMBER_WRAP_AT {
            1
        } else {
            self.request_id_sequence + 1
        };
        self.request_id_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> SecureChannel {
        SecureChannel::new(Role::Client, SecurityPolicy::Basic256Sha256, MessageSecurityMode::SignAndEncrypt)
    }

    #[test]
    fn request_id_wraps_before_u32_max_and_skips_zero() {
        let mut c = channel();
        c.request_id_sequence = SEQUENCE_NUMBER_WRAP_AT - 1;
        assert_eq!(c.next_request_id(), SEQUENCE_NUMBER_WRAP_AT);
        assert_eq!(c.next_request_id(), 1);
        assert_ne!(c.next_request_id(), 0);
    }

    #[test]
    fn sequence_number_is_strictly_monotonic_until_wrap() {
        let mut c = channel();
        let first = c.next_sequence_number();
        let second = c.next_sequence_number();
        assert!(second > first);
    }

    #[test]
    fn previous_token_accepted_until_grace_elapses() {
        let mut c = channel();
        c.create_random_nonce();
        c.remote_nonce = vec![1u8; 32];
        c.set_security_token(1, 60_000);
        c.set_security_token(2, 60_000);
        // previous token (id 1) is still within its 25% grace window.
        assert!(c.resolve_token(1).is_ok());
        assert!(c.resolve_token(2).is_ok());
        assert!(c.resolve_token(3).is_err());
    }

    #[test]
    fn should_renew_is_false_for_a_freshly_issued_token() {
        let mut c = channel();
        c.set_security_token(1, 60_000);
        assert!(!c.should_renew_security_token(0.75));
    }

    #[test]
    fn none_policy_never_pads_or_signs() {
        let c = SecureChannel::new(Role::Client, SecurityPolicy::None, MessageSecurityMode::None);
        let header = c.make_security_header(MessageChunkType::Message);
        let sig_size = c.signature_size(&header);
        assert_eq!(sig_size, 0);
        assert_eq!(c.padding_size(&header, 100, 0), (0, 0));
    }
}
