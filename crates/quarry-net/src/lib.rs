//! quarry-net — peer connections over TCP.
//!
//! `TcpTransport` owns the listener and one reader task per connection.
//! Decoded control messages come out of `TcpTransport::consume`; stream
//! bodies are claimed per connection through `Peer::claim_stream`.

pub mod handshake;
pub mod peer;
pub mod stream;
pub mod transport;

pub use handshake::{Handshake, HandshakeError, NopHandshake, VersionHandshake};
pub use peer::{Peer, PeerWriter};
pub use stream::{IncomingStream, StreamTable};
pub use transport::{PeerHook, TcpTransport, TcpTransportOpts, TransportError};
