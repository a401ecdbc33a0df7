//! BitTorrent wire protocol: message framing and the connection handshake.
//!
//! Peer-to-peer protocol following BEP 3. Messages are
//! `[u32 big-endian length][u8 id][payload]`; the handshake is a fixed
//! 68-byte greeting exchanged before any message.

pub mod handshake;
pub mod messages;
pub mod types;

// Re-export public API
pub use handshake::{HANDSHAKE_LEN, HandshakeCodec, exchange_handshake};
pub use messages::MessageCodec;
pub use types::{BlockRequest, MessageKind, PeerHandshake, PeerId, WireMessage};
