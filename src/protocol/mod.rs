//! The multiplexed wire command protocol (spec §4.7, §6).
//!
//! Every line on the wire is `VERB SP args CRLF (Name: Value CRLF)* CRLF`;
//! `M` and `D` are additionally followed by exactly `length` raw bytes,
//! `length` taken from a header of the same name. [`codec::ProtocolCodec`]
//! turns this into a `tokio_util::codec::{Decoder, Encoder}` pair so a
//! session can drive it through a `Framed` stream exactly as the
//! handshake's line codec does (see `session::handshake`).

pub mod codec;

use std::collections::HashMap;

/// A command-line verb; exactly one uppercase ASCII letter on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Hello,
    Auth,
    KeepAlive,
    Message,
    RequestNoData,
    RequestWithData,
    Response,
    Data,
    Error,
    Cancel,
}

impl Verb {
    pub fn letter(self) -> u8 {
        match self {
            Self::Hello => b'H',
            Self::Auth => b'A',
            Self::KeepAlive => b'K',
            Self::Message => b'M',
            Self::RequestNoData => b'I',
            Self::RequestWithData => b'G',
            Self::Response => b'R',
            Self::Data => b'D',
            Self::Error => b'E',
            Self::Cancel => b'C',
        }
    }

    pub fn from_letter(b: u8) -> Option<Self> {
        match b {
            b'H' => Some(Self::Hello),
            b'A' => Some(Self::Auth),
            b'K' => Some(Self::KeepAlive),
            b'M' => Some(Self::Message),
            b'I' => Some(Self::RequestNoData),
            b'G' => Some(Self::RequestWithData),
            b'R' => Some(Self::Response),
            b'D' => Some(Self::Data),
            b'E' => Some(Self::Error),
            b'C' => Some(Self::Cancel),
            _ => None,
        }
    }

    /// Whether this verb's frame is immediately followed by a `length`
    /// byte body (only `M` and `D`).
    pub fn carries_body(self) -> bool {
        matches!(self, Self::Message | Self::Data)
    }
}

/// Case-insensitive header map; keys are canonicalized to lowercase on
/// insertion, per spec §4.5 ("Header names are case-insensitive on
/// receipt, canonicalized to lowercase for lookup").
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name)?.parse().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl From<HashMap<String, String>> for Headers {
    fn from(map: HashMap<String, String>) -> Self {
        let mut headers = Self::new();
        for (k, v) in map {
            headers.insert(k, v);
        }
        headers
    }
}

impl From<Headers> for HashMap<String, String> {
    fn from(headers: Headers) -> Self {
        headers.0
    }
}

/// One fully-parsed wire command, body included for `Message`/`Data`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Hello {
        remote_peering: String,
        headers: Headers,
    },
    Auth {
        hash: String,
        headers: Headers,
    },
    KeepAlive {
        nonce: u32,
    },
    Message {
        headers: Headers,
        body: Vec<u8>,
    },
    Request {
        req_id: u64,
        target: String,
        is_data: bool,
        headers: Headers,
    },
    Response {
        req_id: u64,
        status: i32,
        channel: u64,
        headers: Headers,
    },
    Data {
        channel: u64,
        body: Vec<u8>,
    },
    Error {
        channel: u64,
        status: i32,
    },
    Cancel {
        channel: u64,
    },
}

impl Command {
    pub fn verb(&self) -> Verb {
        match self {
            Self::Hello { .. } => Verb::Hello,
            Self::Auth { .. } => Verb::Auth,
            Self::KeepAlive { .. } => Verb::KeepAlive,
            Self::Message { .. } => Verb::Message,
            Self::Request { is_data, .. } => {
                if *is_data {
                    Verb::RequestWithData
                } else {
                    Verb::RequestNoData
                }
            }
            Self::Response { .. } => Verb::Response,
            Self::Data { .. } => Verb::Data,
            Self::Error { .. } => Verb::Error,
            Self::Cancel { .. } => Verb::Cancel,
        }
    }
}

pub use codec::ProtocolCodec;
