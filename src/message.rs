//! A store-and-forward message exchanged between two peerings (spec §3, §4.7
//! verb `M`).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SessionError;
use crate::identifier::Identifier;
use crate::identity::{IdentityKey, IdentityPublicKey};

/// Messages larger than this are rejected on receipt rather than buffered
/// in full (spec §3: "Bounded in-memory size (enforced at reception;
/// oversized ⇒ reject)").
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// A message addressed to a peering (or broadcast, if `receiver` is
/// [`Identifier::NULL`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Unix timestamp (seconds) the message was created.
    pub time: u64,
    pub receiver: Identifier,
    pub parameters: HashMap<String, String>,
    pub content: Vec<u8>,
    pub is_read: bool,
}

impl Message {
    /// Builds a new, unread message stamped with the current time.
    pub fn new(receiver: Identifier, content: Vec<u8>) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            time,
            receiver,
            parameters: HashMap::new(),
            content,
            is_read: false,
        }
    }

    /// Broadcast convenience constructor: `receiver` is the null identifier.
    pub fn broadcast(content: Vec<u8>) -> Self {
        Self::new(Identifier::NULL, content)
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_null()
    }

    /// Validates the body length against [`MAX_MESSAGE_LEN`]; called by the
    /// session on receipt, before the message reaches its listener.
    pub fn validate_len(len: usize) -> Result<(), crate::error::SessionError> {
        if len > MAX_MESSAGE_LEN {
            return Err(crate::error::SessionError::MalformedCommand(format!(
                "message body of {} bytes exceeds the {} byte limit",
                len, MAX_MESSAGE_LEN
            )));
        }
        Ok(())
    }

    /// The bytes an identity signature is taken over: `time`, `receiver`
    /// and `content`, in that order. `parameters` and `is_read` are local
    /// bookkeeping and are deliberately excluded so a signature survives
    /// re-delivery through a store-and-forward hop that only touches those.
    fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 64 + self.content.len());
        buf.extend_from_slice(&self.time.to_be_bytes());
        buf.extend_from_slice(self.receiver.digest());
        buf.extend_from_slice(&self.content);
        buf
    }

    /// Signs this message's content with a local identity key (spec
    /// supplement B.6). Purely additive: it is never consulted by the
    /// session or the handshake, only by a listener that chooses to check
    /// it against a known sender's public key.
    pub fn sign(&self, key: &IdentityKey) -> Vec<u8> {
        key.sign(&self.signable_bytes())
    }

    /// Verifies a signature produced by [`Self::sign`].
    pub fn verify(&self, public_key: &IdentityPublicKey, signature: &[u8]) -> Result<(), SessionError> {
        public_key.verify(&self.signable_bytes(), signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_receiver_is_null() {
        let m = Message::broadcast(b"hi".to_vec());
        assert!(m.is_broadcast());
    }

    #[test]
    fn new_message_starts_unread() {
        let m = Message::new(Identifier::peering([1u8; 64]), b"hi".to_vec());
        assert!(!m.is_read);
    }

    #[test]
    fn validate_len_rejects_oversized_body() {
        assert!(Message::validate_len(MAX_MESSAGE_LEN + 1).is_err());
        assert!(Message::validate_len(MAX_MESSAGE_LEN).is_ok());
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let key = IdentityKey::generate().unwrap();
        let m = Message::new(Identifier::peering([2u8; 64]), b"hello friend".to_vec());
        let sig = m.sign(&key);
        m.verify(&key.public_key(), &sig).unwrap();
    }

    #[test]
    fn verify_rejects_content_tampered_after_signing() {
        let key = IdentityKey::generate().unwrap();
        let m = Message::new(Identifier::peering([2u8; 64]), b"hello friend".to_vec());
        let sig = m.sign(&key);
        let mut tampered = m.clone();
        tampered.content = b"hello enemy".to_vec();
        assert!(tampered.verify(&key.public_key(), &sig).is_err());
    }
}
