//! Cryptographic building blocks used by the session core: the keyed-hash
//! KDF ([`hash`]) and the symmetric cipher stream ([`cipher`]).

pub mod cipher;
pub mod hash;

pub use cipher::CipherStream;
pub use hash::{iterated_hash, HASH_LEN};
