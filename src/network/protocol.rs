use serde::{Deserialize, Serialize};

use crate::core::types::{Amount, Transaction, TxIn, TxOut};
use crate::mix::error::PoolError;
use crate::mix::pool::{Acceptance, PoolState};
use crate::mix::queue::{BroadcastTx, QueueAnnouncement};

/// Mixing pool messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MixMessage {
    /// Ask a coordinator for a place in a session.
    JoinRequest {
        denom: u32,
        collateral: Transaction,
    },

    /// Session progress pushed by the coordinator.
    StatusUpdate {
        session_id: u32,
        state: PoolState,
        entries: usize,
        accepted: Acceptance,
        error: Option<PoolError>,
    },

    /// Session advertisement.
    Queue(QueueAnnouncement),

    /// Inputs and outputs contributed to the session.
    SubmitEntry {
        inputs: Vec<TxIn>,
        amount: Amount,
        collateral: Transaction,
        outputs: Vec<TxOut>,
    },

    /// Assembled transaction, ready to sign.
    FinalTransaction {
        session_id: u32,
        tx: Transaction,
    },

    /// Signed copies of the sender's own inputs.
    SubmitSignatures {
        inputs: Vec<TxIn>,
    },

    /// Final outcome of the session.
    Completed {
        session_id: u32,
        error: bool,
        message: String,
    },

    /// Masternode-signed record of a finished mix.
    BroadcastTx(BroadcastTx),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Version handshake
    Version { version: u32, timestamp: u64 },

    /// Version acknowledgment
    Verack,

    /// Ping (heartbeat)
    Ping { nonce: u64 },

    /// Pong (heartbeat response)
    Pong { nonce: u64 },

    /// Announce a transaction by id
    Inventory([u8; 32]),

    Mix(MixMessage),
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        // Every variant holds plain owned data, which bincode always encodes.
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn deserialize(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub const PROTOCOL_VERSION: u32 = 70_210;

/// Oldest peer version allowed to take part in mixing.
pub const MIN_MIX_PROTO_VERSION: u32 = 70_208;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::Script;
    use crate::core::types::{OutPoint, COIN};

    #[test]
    fn mix_message_survives_the_wire() {
        let tx = Transaction::new(
            vec![TxIn::new(OutPoint::new([3; 32], 1))],
            vec![TxOut::new(COIN, Script::p2pkh(&[4; 20]))],
        );
        let msg = Message::Mix(MixMessage::StatusUpdate {
            session_id: 77,
            state: PoolState::AcceptingEntries,
            entries: 2,
            accepted: Acceptance::Rejected,
            error: Some(PoolError::QueueFull),
        });
        assert_eq!(Message::deserialize(&msg.serialize()).unwrap(), msg);

        let fin = Message::Mix(MixMessage::FinalTransaction { session_id: 77, tx });
        assert_eq!(Message::deserialize(&fin.serialize()).unwrap(), fin);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(Message::deserialize(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
