//! quarry-server — the replication engine.
//!
//! `FileServer` ties a local `Store` to a `TcpTransport`: writes are pushed
//! to every connected peer, misses are fetched from them.

mod dispatch;
pub mod error;
pub mod registry;
pub mod server;

pub use error::ServerError;
pub use registry::PeerRegistry;
pub use server::{FileServer, FileServerOpts};
