//! Symmetric encryption/decryption wrapper, grounded on `opcua_crypto::aeskey::AesKey`.

use aes::cipher::{block_padding::NoPadding, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use opcua_transport_types::{Error, StatusCode};

use crate::policy::SecurityPolicy;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_BLOCK_SIZE: usize = 16;
const AES256_KEY_SIZE: usize = 32;

type AesArray256 = GenericArray<u8, <aes::Aes256 as aes::cipher::KeySizeUser>::KeySize>;
type AesArrayIv = GenericArray<u8, <aes::Aes256 as aes::cipher::BlockSizeUser>::BlockSize>;

/// A symmetric key bound to the [`SecurityPolicy`] it was derived under.
#[derive(Debug, Clone)]
pub struct AesKey {
    value: Vec<u8>,
    security_policy: SecurityPolicy,
}

impl AesKey {
    pub fn new(security_policy: SecurityPolicy, value: &[u8]) -> Self {
        Self {
            value: value.to_vec(),
            security_policy,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn block_size(&self) -> usize {
        match self.security_policy {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic256Sha256 => AES_BLOCK_SIZE,
        }
    }

    pub fn iv_length(&self) -> usize {
        self.block_size()
    }

    pub fn key_length(&self) -> usize {
        match self.security_policy {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic256Sha256 => AES256_KEY_SIZE,
        }
    }

    fn validate_args(&self, src: &[u8], iv: &[u8], dst: &[u8]) -> Result<(), Error> {
        if dst.len() < src.len() {
            Err(Error::new(
                StatusCode::BadUnexpectedError,
                format!("dst buffer is too small: {} vs {}", dst.len(), src.len()),
            ))
        } else if iv.len() != self.iv_length() {
            Err(Error::new(
                StatusCode::BadUnexpectedError,
                format!("iv is not the expected size, len = {}", iv.len()),
            ))
        } else if src.len() % self.block_size() != 0 {
            Err(Error::new(
                StatusCode::BadUnexpectedError,
                format!("src length {} is not a multiple of the block size", src.len()),
            ))
        } else {
            Ok(())
        }
    }

    pub fn encrypt(&self, src: &[u8], iv: &[u8], dst: &mut [u8]) -> Result<usize, Error> {
        match self.security_policy {
            SecurityPolicy::None => Err(Error::new(
                StatusCode::BadUnexpectedError,
                "the None security policy never encrypts",
            )),
            SecurityPolicy::Basic256Sha256 => {
                self.validate_args(src, iv, dst)?;
                Aes256CbcEnc::new(
                    AesArray256::from_slice(&self.value),
                    AesArrayIv::from_slice(iv),
                )
                .encrypt_padded_b2b_mut::<NoPadding>(src, dst)
                .map_err(|e| Error::new(StatusCode::BadUnexpectedError, e.to_string()))?;
                Ok(src.len())
            }
        }
    }

    pub fn decrypt(&self, src: &[u8], iv: &[u8], dst: &mut [u8]) -> Result<usize, Error> {
        match self.security_policy {
            SecurityPolicy::None => Err(Error::new(
                StatusCode::BadUnexpectedError,
                "the None security policy never decrypts",
            )),
            SecurityPolicy::Basic256Sha256 => {
                self.validate_args(src, iv, dst)?;
                Aes256CbcDec::new(
                    AesArray256::from_slice(&self.value),
                    AesArrayIv::from_slice(iv),
                )
                .decrypt_padded_b2b_mut::<NoPadding>(src, dst)
                .map_err(|e| Error::new(StatusCode::BadUnexpectedError, e.to_string()))?;
                Ok(src.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let key = AesKey::new(SecurityPolicy::Basic256Sha256, &[7u8; AES256_KEY_SIZE]);
        let iv = [3u8; AES_BLOCK_SIZE];
        let plain = [9u8; AES_BLOCK_SIZE * 2];
        let mut cipher = vec![0u8; plain.len()];
        key.encrypt(&plain, &iv, &mut cipher).unwrap();
        assert_ne!(cipher, plain);

        let mut recovered = vec![0u8; plain.len()];
        key.decrypt(&cipher, &iv, &mut recovered).unwrap();
        assert_eq!(recovered, plain);
    }

    #[test]
    fn rejects_a_source_not_aligned_to_the_block_size() {
        let key = AesKey::new(SecurityPolicy::Basic256Sha256, &[7u8; AES256_KEY_SIZE]);
        let iv = [3u8; AES_BLOCK_SIZE];
        let plain = [9u8; 5];
        let mut cipher = vec![0u8; 32];
        assert!(key.encrypt(&plain, &iv, &mut cipher).is_err());
    }
}
