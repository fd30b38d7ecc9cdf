//! Signed session advertisements.
//!
//! A coordinator announces a session twice: once when the first participant
//! is accepted (not ready), and again with `ready` set once the session is
//! full and entries are wanted. Announcements are relayed by every node and
//! kept in a [`QueueBook`] until they expire.
//!
//! Relay spacing: every accepted announcement bumps a local counter and
//! records it against the announcing coordinator. A coordinator whose last
//! recorded announcement is within `eligible / 5` announcements of the
//! current counter is flooding and gets ignored.

use std::collections::HashMap;

use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use super::signer;
use crate::core::types::{OutPoint, Transaction};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAnnouncement {
    /// Collateral input identifying the announcing masternode.
    pub input_ref: OutPoint,
    pub denom: u32,
    /// Seconds since the epoch.
    pub time: u64,
    pub ready: bool,
    pub signature: Vec<u8>,
}

impl QueueAnnouncement {
    pub fn new(input_ref: OutPoint, denom: u32, time: u64, ready: bool) -> Self {
        Self { input_ref, denom, time, ready, signature: Vec::new() }
    }

    /// input reference, denomination, time and ready flag, in that order
    pub fn signed_payload(&self) -> Vec<u8> {
        format!("{}{}{}{}", self.input_ref, self.denom, self.time, self.ready).into_bytes()
    }

    pub fn sign(&mut self, key: &SecretKey) {
        self.signature = signer::sign_message(&self.signed_payload(), key);
    }

    pub fn check_signature(&self, pubkey: &PublicKey) -> bool {
        signer::verify_message(pubkey, &self.signature, &self.signed_payload())
    }

    pub fn is_expired(&self, now_secs: u64, ttl_secs: u64) -> bool {
        now_secs.saturating_sub(self.time) > ttl_secs
    }
}

/// Why an incoming announcement was not stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRejection {
    Duplicate,
    Flooding,
    Expired,
}

/// Live announcements seen by this node plus the relay-spacing counters.
#[derive(Debug, Default)]
pub struct QueueBook {
    queues: Vec<QueueAnnouncement>,
    dsq_count: u64,
    last_dsq: HashMap<OutPoint, u64>,
}

impl QueueBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `input_ref` announced too recently given `eligible`
    /// masternodes on the network.
    pub fn is_flooding(&self, input_ref: &OutPoint, eligible: usize) -> bool {
        match self.last_dsq.get(input_ref) {
            Some(&last) if last != 0 => last + (eligible as u64) / 5 > self.dsq_count,
            _ => false,
        }
    }

    /// Count an announcement from `input_ref`.
    pub fn record(&mut self, input_ref: OutPoint) {
        self.dsq_count += 1;
        self.last_dsq.insert(input_ref, self.dsq_count);
    }

    /// Store a not-ready announcement if it is fresh, unique and not flooding.
    pub fn insert(
        &mut self,
        q: QueueAnnouncement,
        now_secs: u64,
        ttl_secs: u64,
        eligible: usize,
    ) -> Result<(), QueueRejection> {
        if q.is_expired(now_secs, ttl_secs) {
            return Err(QueueRejection::Expired);
        }
        if self.contains(&q.input_ref) {
            return Err(QueueRejection::Duplicate);
        }
        if self.is_flooding(&q.input_ref, eligible) {
            return Err(QueueRejection::Flooding);
        }
        self.record(q.input_ref);
        self.queues.push(q);
        Ok(())
    }

    pub fn contains(&self, input_ref: &OutPoint) -> bool {
        self.queues.iter().any(|q| &q.input_ref == input_ref)
    }

    /// Remove an announcement once a join has been sent against it.
    pub fn consume(&mut self, input_ref: &OutPoint) {
        self.queues.retain(|q| &q.input_ref != input_ref);
    }

    pub fn expire(&mut self, now_secs: u64, ttl_secs: u64) -> usize {
        let before = self.queues.len();
        self.queues.retain(|q| !q.is_expired(now_secs, ttl_secs));
        before - self.queues.len()
    }

    /// Live announcements a participant may try to join.
    pub fn candidates(&self, now_secs: u64, ttl_secs: u64) -> Vec<QueueAnnouncement> {
        self.queues
            .iter()
            .filter(|q| !q.ready && !q.is_expired(now_secs, ttl_secs))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn dsq_count(&self) -> u64 {
        self.dsq_count
    }
}

/// Masternode-signed record relayed alongside a finished mix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastTx {
    pub tx: Transaction,
    pub input_ref: OutPoint,
    pub sig_time: u64,
    pub signature: Vec<u8>,
}

impl BroadcastTx {
    pub fn new(tx: Transaction, input_ref: OutPoint, sig_time: u64) -> Self {
        Self { tx, input_ref, sig_time, signature: Vec::new() }
    }

    pub fn signed_payload(&self) -> Vec<u8> {
        format!("{}{}", hex::encode(self.tx.txid()), self.sig_time).into_bytes()
    }

    pub fn sign(&mut self, key: &SecretKey) {
        self.signature = signer::sign_message(&self.signed_payload(), key);
    }

    pub fn check_signature(&self, pubkey: &PublicKey) -> bool {
        signer::verify_message(pubkey, &self.signature, &self.signed_payload())
    }
}
