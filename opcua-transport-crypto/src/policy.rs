//! Security policies bind a URI to a signing algorithm, an encryption algorithm and the key
//! lengths the pseudo-random function must produce, grounded on the `SecurityPolicy` methods
//! referenced throughout `async_opcua_core::comms::secure_channel`
//! (`symmetric_signature_size`, `secure_channel_nonce_length`, `plain_block_size`,
//! `make_secure_channel_keys`).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::aes_key::AesKey;
use crate::prf::p_sha256;

type HmacSha256 = Hmac<Sha256>;

/// The message security mode negotiated for a secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSecurityMode {
    None,
    Sign,
    SignAndEncrypt,
}

/// A security policy known to this transport. Only `None` and `Basic256Sha256` are
/// implemented; other policy URIs are rejected during OPN negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPolicy {
    None,
    Basic256Sha256,
}

const BASIC256SHA256_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256";
const NONE_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";

/// Signing and encryption keys derived for one direction of traffic on a secure channel.
#[derive(Debug, Clone)]
pub struct SecureChannelKeys {
    pub signing_key: Vec<u8>,
    pub encrypting_key: AesKey,
    pub iv: Vec<u8>,
}

impl SecurityPolicy {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            NONE_URI => Some(SecurityPolicy::None),
            BASIC256SHA256_URI => Some(SecurityPolicy::Basic256Sha256),
            _ => None,
        }
    }

    pub fn to_uri(self) -> &'static str {
        match self {
            SecurityPolicy::None => NONE_URI,
            SecurityPolicy::Basic256Sha256 => BASIC256SHA256_URI,
        }
    }

    /// Length in bytes of the nonce exchanged during OPN, also the seed/secret length fed
    /// into the pseudo-random function.
    pub fn secure_channel_nonce_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic256Sha256 => 32,
        }
    }

    /// Length in bytes of the HMAC-SHA256 signature appended to a symmetric chunk.
    pub fn symmetric_signature_size(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic256Sha256 => 32,
        }
    }

    /// Length in bytes of the symmetric signing key derived by the pseudo-random function.
    pub fn derived_signature_key_length(self) -> usize {
        self.symmetric_signature_size()
    }

    /// Length in bytes of the symmetric encrypting key derived by the pseudo-random function.
    pub fn derived_encryption_key_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic256Sha256 => 32,
        }
    }

    /// Block size of the symmetric cipher, used both for IV length and padding alignment.
    pub fn plain_block_size(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic256Sha256 => 16,
        }
    }

    /// Derive the signing key, encrypting key and IV used to secure traffic sent *to* the
    /// party whose nonce is `seed`, given the secret (the other party's nonce).
    ///
    /// Matches Table 33 of Part 6: `PRF(secret, seed, length, offset)` with the signing key
    /// at offset 0, the encrypting key following it, and the IV after that.
    pub fn make_secure_channel_keys(self, secret: &[u8], seed: &[u8]) -> SecureChannelKeys {
        let signing_len = self.derived_signature_key_length();
        let encrypting_len = self.derived_encryption_key_length();
        let iv_len = self.plain_block_size();

        let signing_key = p_sha256(secret, seed, signing_len, 0);
        let encrypting_key = p_sha256(secret, seed, encrypting_len, signing_len);
        let iv = p_sha256(secret, seed, iv_len, signing_len + encrypting_len);

        SecureChannelKeys {
            signing_key,
            encrypting_key: AesKey::new(self, &encrypting_key),
            iv,
        }
    }

    /// Sign `data` with an HMAC-SHA256 keyed by `signing_key`, as used for symmetric chunks.
    pub fn sign(self, signing_key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            SecurityPolicy::None => Vec::new(),
            SecurityPolicy::Basic256Sha256 => {
                let mut mac =
                    HmacSha256::new_from_slice(signing_key).expect("HMAC accepts keys of any length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Verify an HMAC-SHA256 signature over `data` in constant time.
    pub fn verify(self, signing_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
        match self {
            SecurityPolicy::None => signature.is_empty(),
            SecurityPolicy::Basic256Sha256 => {
                let mut mac =
                    HmacSha256::new_from_slice(signing_key).expect("HMAC accepts keys of any length");
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
        }
    }
}
