//! In-process transport.
//!
//! Every send goes through the bincode codec and lands on the receiving
//! peer's unbounded channel, so nodes wired to a [`LocalHub`] exchange
//! exactly the bytes they would put on a socket.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Envelope, Message, MixMessage, PeerId, PeerInfo};
use crate::mix::services::NetworkSink;

struct Endpoint {
    version: u32,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
pub struct LocalHub {
    peers: Mutex<HashMap<PeerId, Endpoint>>,
    inventory: Mutex<Vec<[u8; 32]>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `id` and return its outbound link and inbox.
    pub fn connect(self: &Arc<Self>, id: PeerId, version: u32) -> (LocalLink, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(id, Endpoint { version, tx });
        let link = LocalLink { hub: Arc::clone(self), me: PeerInfo { id, version } };
        (link, rx)
    }

    pub fn disconnect(&self, id: PeerId) {
        self.peers.lock().remove(&id);
    }

    pub fn peer_version(&self, id: PeerId) -> Option<u32> {
        self.peers.lock().get(&id).map(|e| e.version)
    }

    /// Every transaction id announced so far, in order.
    pub fn inventory(&self) -> Vec<[u8; 32]> {
        self.inventory.lock().clone()
    }

    fn deliver(&self, from: PeerInfo, to: PeerId, bytes: &[u8]) {
        let message = match Message::deserialize(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Dropping undecodable message from {}: {}", from.id, e);
                return;
            }
        };
        let peers = self.peers.lock();
        match peers.get(&to) {
            Some(endpoint) => {
                if endpoint.tx.send(Envelope { from, message }).is_err() {
                    tracing::debug!("{} inbox closed", to);
                }
            }
            None => tracing::debug!("No route to {}", to),
        }
    }

    fn others(&self, me: PeerId) -> Vec<PeerId> {
        self.peers.lock().keys().copied().filter(|p| *p != me).collect()
    }
}

/// One peer's view of the hub.
#[derive(Clone)]
pub struct LocalLink {
    hub: Arc<LocalHub>,
    me: PeerInfo,
}

impl LocalLink {
    pub fn peer(&self) -> PeerInfo {
        self.me
    }

    pub fn send(&self, to: PeerId, message: &Message) {
        self.hub.deliver(self.me, to, &message.serialize());
    }
}

impl NetworkSink for LocalLink {
    fn push_message(&self, peer: PeerId, msg: MixMessage) {
        self.send(peer, &Message::Mix(msg));
    }

    fn broadcast(&self, msg: MixMessage) {
        let bytes = Message::Mix(msg).serialize();
        for peer in self.hub.others(self.me.id) {
            self.hub.deliver(self.me, peer, &bytes);
        }
    }

    fn broadcast_inventory(&self, txid: [u8; 32]) {
        self.hub.inventory.lock().push(txid);
        let bytes = Message::Inventory(txid).serialize();
        for peer in self.hub.others(self.me.id) {
            self.hub.deliver(self.me, peer, &bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Transaction;

    #[test]
    fn push_reaches_only_the_target() {
        let hub = LocalHub::new();
        let (a, _rx_a) = hub.connect(PeerId(1), 70_210);
        let (_b, mut rx_b) = hub.connect(PeerId(2), 70_210);
        let (_c, mut rx_c) = hub.connect(PeerId(3), 70_210);

        a.push_message(PeerId(2), MixMessage::JoinRequest { denom: 1, collateral: Transaction::default() });

        let env = rx_b.try_recv().unwrap();
        assert_eq!(env.from.id, PeerId(1));
        assert!(matches!(env.message, Message::Mix(MixMessage::JoinRequest { denom: 1, .. })));
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn broadcast_skips_sender_and_records_inventory() {
        let hub = LocalHub::new();
        let (a, mut rx_a) = hub.connect(PeerId(1), 70_210);
        let (_b, mut rx_b) = hub.connect(PeerId(2), 70_210);

        a.broadcast_inventory([7; 32]);
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv().unwrap().message, Message::Inventory(id) if id == [7; 32]));
        assert_eq!(hub.inventory(), vec![[7; 32]]);
    }

    #[test]
    fn disconnected_peer_gets_nothing() {
        let hub = LocalHub::new();
        let (a, _) = hub.connect(PeerId(1), 1);
        let (_b, mut rx_b) = hub.connect(PeerId(2), 1);
        hub.disconnect(PeerId(2));
        a.push_message(PeerId(2), MixMessage::SubmitSignatures { inputs: vec![] });
        assert!(rx_b.try_recv().is_err());
        assert_eq!(hub.peer_version(PeerId(2)), None);
    }
}
