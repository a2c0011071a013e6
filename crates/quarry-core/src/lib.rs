//! quarry-core — storage layout, wire format, control messages, and the
//! stream cipher. All other Quarry crates depend on this one.

pub mod config;
pub mod crypto;
pub mod message;
pub mod store;
pub mod wire;

pub use crypto::EncryptionKey;
pub use message::{Codec, Envelope, JsonCodec, Message};
pub use store::{Store, StoreOpts};
