//! Peering identifiers: a 64-byte digest plus an optional instance name.
//!
//! Mirrors `src/identifier.h` in the original implementation: the digest
//! alone names a peering; the (optional) instance name distinguishes
//! concurrent sessions of the same user from different devices.

use std::cmp::Ordering;
use std::fmt;

/// Length of the digest backing every [`Identifier`], in bytes.
pub const DIGEST_LEN: usize = 64;

/// A 64-byte content digest with an optional short instance-name suffix.
///
/// Two identifiers are equal iff their digests and names are equal.
/// Ordering is lexicographic on `(digest, name)`, which lets a `Core`
/// keep identifiers in an ordered map and range-scan by digest prefix
/// (the tracker's own storage does the same, see `Tracker::retrieve`
/// in the original `lower_bound` scan).
#[derive(Clone, Eq, Hash)]
pub struct Identifier {
    digest: [u8; DIGEST_LEN],
    name: String,
}

impl Identifier {
    /// The null identifier: an all-zero digest and empty name. Used as the
    /// "broadcast" receiver in [`crate::message::Message`] and
    /// [`crate::request::Request`].
    pub const NULL: Identifier = Identifier {
        digest: [0u8; DIGEST_LEN],
        name: String::new(),
    };

    /// Builds an identifier from a raw digest and instance name.
    pub fn new(digest: [u8; DIGEST_LEN], name: impl Into<String>) -> Self {
        Self {
            digest,
            name: name.into(),
        }
    }

    /// Builds a peering id (no instance name) from a raw digest.
    pub fn peering(digest: [u8; DIGEST_LEN]) -> Self {
        Self::new(digest, "")
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// True for the all-zero, nameless identifier.
    pub fn is_null(&self) -> bool {
        self == &Self::NULL
    }

    /// An identifier carrying the same digest but no instance name; used to
    /// compare two identifiers "as peerings", ignoring instance.
    pub fn as_peering(&self) -> Identifier {
        Self::peering(self.digest)
    }

    /// Binary wire form: the 64-byte digest followed by the UTF-8 instance
    /// name, length-prefixed with a single big-endian `u16`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let mut out = Vec::with_capacity(DIGEST_LEN + 2 + name_bytes.len());
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(name_bytes);
        out
    }

    /// Parses the binary wire form produced by [`Identifier::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < DIGEST_LEN + 2 {
            return None;
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[..DIGEST_LEN]);
        let name_len = u16::from_be_bytes([buf[DIGEST_LEN], buf[DIGEST_LEN + 1]]) as usize;
        let name_start = DIGEST_LEN + 2;
        let name_end = name_start.checked_add(name_len)?;
        if buf.len() < name_end {
            return None;
        }
        let name = String::from_utf8(buf[name_start..name_end].to_vec()).ok()?;
        Some(Self { digest, name })
    }

    /// Text wire form: lowercase hex digest, optionally followed by
    /// `@instance`.
    pub fn to_text(&self) -> String {
        if self.name.is_empty() {
            hex::encode(self.digest)
        } else {
            format!("{}@{}", hex::encode(self.digest), self.name)
        }
    }

    /// Parses the text wire form produced by [`Identifier::to_text`].
    pub fn from_text(s: &str) -> Option<Self> {
        let (hex_part, name) = match s.split_once('@') {
            Some((h, n)) => (h, n.to_string()),
            None => (s, String::new()),
        };
        let bytes = hex::decode(hex_part).ok()?;
        if bytes.len() != DIGEST_LEN {
            return None;
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes);
        Some(Self { digest, name })
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::NULL
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.name == other.name
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.digest
            .cmp(&other.digest)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.to_text())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}
