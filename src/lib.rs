// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod address;
pub mod conf;
pub mod core;
pub mod crypto;
pub mod error;
pub mod identifier;
pub mod identity;
pub mod message;
pub mod peering;
pub mod protocol;
pub mod request;
pub mod session;
mod splicer;
mod striped_file;
pub mod tracker;

pub use address::Address;
pub use conf::Conf;
pub use core::Core;
pub use error::{Result, SessionError, Status};
pub use identifier::Identifier;
pub use message::Message;
pub use request::{Request, Response};
pub use session::Session;
pub use splicer::Splicer;
pub use striped_file::StripedFile;
