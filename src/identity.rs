//! Optional RSA identity signing, layered above (never replacing) the
//! shared-secret trust model (spec §4.2 supplement, recovered from
//! `tpn/identifier.cpp`'s `Rsa` key pair use for signing profile
//! broadcasts). Friend-to-friend trust is still established purely by the
//! mutual secret derived in [`crate::crypto::hash::derive_secret`]; a
//! signature here only lets a third party that already has our public key
//! confirm a message really came from us, it is never consulted during the
//! handshake itself.

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::sha2::Sha512;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::SessionError;

const KEY_BITS: usize = 2048;

/// A local RSA-2048 identity key pair, used to sign outgoing messages that
/// opt into it.
pub struct IdentityKey {
    private: RsaPrivateKey,
}

impl IdentityKey {
    /// Generates a fresh 2048-bit RSA key pair.
    pub fn generate() -> Result<Self, SessionError> {
        let private = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
            .map_err(|e| SessionError::Crypto(e.to_string()))?;
        Ok(Self { private })
    }

    /// Loads a key pair previously serialized with [`Self::to_pkcs1_der`].
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self, SessionError> {
        let private = RsaPrivateKey::from_pkcs1_der(der)
            .map_err(|e| SessionError::Crypto(e.to_string()))?;
        Ok(Self { private })
    }

    pub fn to_pkcs1_der(&self) -> Result<Vec<u8>, SessionError> {
        self.private
            .to_pkcs1_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| SessionError::Crypto(e.to_string()))
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            public: RsaPublicKey::from(&self.private),
        }
    }

    /// Signs `data` with PKCS#1v15/SHA-512, the scheme recovered from the
    /// original's use of Crypto++'s `RSASS<PKCS1v15, SHA512>`.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha512>::new(self.private.clone());
        let signature: Signature = signing_key.sign_with_rng(&mut OsRng, data);
        signature.to_bytes().to_vec()
    }
}

/// The public half of an [`IdentityKey`], distributed alongside a peer's
/// [`crate::identifier::Identifier`] so others can verify its signatures.
#[derive(Clone)]
pub struct IdentityPublicKey {
    public: RsaPublicKey,
}

impl IdentityPublicKey {
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self, SessionError> {
        let public = RsaPublicKey::from_pkcs1_der(der)
            .map_err(|e| SessionError::Crypto(e.to_string()))?;
        Ok(Self { public })
    }

    pub fn to_pkcs1_der(&self) -> Result<Vec<u8>, SessionError> {
        self.public
            .to_pkcs1_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| SessionError::Crypto(e.to_string()))
    }

    /// Verifies a signature produced by [`IdentityKey::sign`]. Returns
    /// `Ok(())` on a valid signature, `Err` otherwise; never panics on
    /// malformed signature bytes.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), SessionError> {
        let verifying_key = VerifyingKey::<Sha512>::new(self.public.clone());
        let signature = Signature::try_from(signature)
            .map_err(|e| SessionError::Crypto(e.to_string()))?;
        verifying_key
            .verify(data, &signature)
            .map_err(|_| SessionError::Crypto("signature verification failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_succeeds() {
        let key = IdentityKey::generate().unwrap();
        let sig = key.sign(b"profile update #1");
        key.public_key().verify(b"profile update #1", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let key = IdentityKey::generate().unwrap();
        let sig = key.sign(b"profile update #1");
        assert!(key.public_key().verify(b"profile update #2", &sig).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let key_a = IdentityKey::generate().unwrap();
        let key_b = IdentityKey::generate().unwrap();
        let sig = key_a.sign(b"profile update #1");
        assert!(key_b.public_key().verify(b"profile update #1", &sig).is_err());
    }

    #[test]
    fn private_key_der_roundtrips() {
        let key = IdentityKey::generate().unwrap();
        let der = key.to_pkcs1_der().unwrap();
        let restored = IdentityKey::from_pkcs1_der(&der).unwrap();
        let sig = restored.sign(b"hello");
        key.public_key().verify(b"hello", &sig).unwrap();
    }
}
