//! Asymmetric signing/encryption used only while opening a secure channel, before symmetric
//! keys have been derived. The certificate store and trust-list handling that would parse a
//! real X.509 chain are out of scope for this layer; this carries only the RSA keypair
//! wrapper the teacher's `opcua_crypto` builds its asymmetric chunk security on.

use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use opcua_transport_types::{Error, StatusCode};

/// An RSA keypair used to sign and decrypt the asymmetric portion of an OPN handshake.
pub struct AsymmetricKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl AsymmetricKeyPair {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    /// Size in bytes of one RSA block, i.e. the modulus size. Also the signature size for
    /// PKCS#1 v1.5 signatures under this key.
    pub fn size(&self) -> usize {
        use rsa::traits::PublicKeyParts;
        self.public_key.size()
    }

    /// Sign `data` with RSA-PKCS#1v1.5/SHA-256, as used to sign the asymmetric part of an
    /// OPN chunk sent by this party.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, data);
        Ok(signature.to_vec())
    }

    /// Decrypt an RSA-OAEP/SHA-256 ciphertext addressed to this keypair's public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))
    }
}

impl std::fmt::Debug for AsymmetricKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsymmetricKeyPair").finish_non_exhaustive()
    }
}

/// The peer's public key, extracted from their certificate, used to verify their signature
/// and to encrypt data addressed to them.
pub struct RemotePublicKey {
    public_key: RsaPublicKey,
}

impl std::fmt::Debug for RemotePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePublicKey").finish_non_exhaustive()
    }
}

impl RemotePublicKey {
    pub fn new(public_key: RsaPublicKey) -> Self {
        Self { public_key }
    }

    pub fn size(&self) -> usize {
        use rsa::traits::PublicKeyParts;
        self.public_key.size()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), Error> {
        let verifying_key = VerifyingKey::<Sha256>::new(self.public_key.clone());
        let signature = rsa::pkcs1v15::Signature::try_from(signature)
            .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))?;
        verifying_key
            .verify(data, &signature)
            .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut rng = rand::thread_rng();
        self.public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    fn test_keypair() -> AsymmetricKeyPair {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("key generation");
        AsymmetricKeyPair::new(private_key)
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let pair = test_keypair();
        let remote = RemotePublicKey::new(RsaPublicKey::from(&pair.private_key));
        let sig = pair.sign(b"open secure channel request").unwrap();
        remote.verify(b"open secure channel request", &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails_verification() {
        let pair = test_keypair();
        let remote = RemotePublicKey::new(RsaPublicKey::from(&pair.private_key));
        let sig = pair.sign(b"open secure channel request").unwrap();
        assert!(remote.verify(b"a different message", &sig).is_err());
    }

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let pair = test_keypair();
        let remote = RemotePublicKey::new(RsaPublicKey::from(&pair.private_key));
        let ciphertext = remote.encrypt(b"client nonce bytes").unwrap();
        let plaintext = pair.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"client nonce bytes");
    }
}
