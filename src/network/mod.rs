pub mod local;
pub mod protocol;

pub use protocol::{Message, MixMessage, MIN_MIX_PROTO_VERSION, PROTOCOL_VERSION};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle for a connected peer, assigned by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// What the transport knows about the sender of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub version: u32,
}

/// An inbound message together with its sender.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: PeerInfo,
    pub message: Message,
}
