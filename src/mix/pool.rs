//! The mixing session state machine.
//!
//! One [`MixPool`] per node holds the current session, its entries, the
//! queue book and the transaction being finalized. The same state
//! enumeration drives both roles; what differs is which events move it:
//! a coordinator advances on its own `check` and on submissions it
//! receives, a participant follows the status its coordinator pushes.
//!
//! Coordinator-side handlers live in `coordinator.rs`, participant-side
//! handlers in `participant.rs`. Everything here is shared.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};

use super::entry::EntryStore;
use super::error::PoolError;
use super::queue::{BroadcastTx, QueueBook};
use super::services::{ChainView, MasternodeDirectory, MasternodeInfo, MixWallet, NetworkSink};
use crate::config::MixConfig;
use crate::core::types::{OutPoint, Transaction};
use crate::metrics::Metrics;
use crate::network::{MixMessage, PeerId, PeerInfo};

/// How long a broadcast record is remembered, in seconds.
const BROADCAST_RECORD_TTL: u64 = 3_600;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolState {
    Idle,
    Queue,
    AcceptingEntries,
    /// Coordinator only.
    FinalizeTransaction,
    Signing,
    /// Coordinator only.
    Transmission,
    Error,
    Success,
}

impl PoolState {
    /// A session is in flight.
    pub fn is_active(&self) -> bool {
        !matches!(self, PoolState::Idle | PoolState::Error | PoolState::Success)
    }

    /// Nearest state a participant can hold.
    pub fn participant_view(self) -> PoolState {
        match self {
            PoolState::FinalizeTransaction => PoolState::AcceptingEntries,
            PoolState::Transmission => PoolState::Signing,
            s => s,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Acceptance flag of a status update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acceptance {
    Rejected,
    Accepted,
    /// Progress broadcast not tied to a request.
    Reset,
}

/// A registered participant and the collateral it pledged.
#[derive(Clone, Debug)]
pub struct Member {
    pub peer: PeerId,
    pub collateral: Transaction,
}

#[derive(Clone, Debug)]
pub struct Session {
    /// 0 until a participant learns the coordinator's id.
    pub id: u32,
    pub denom: u32,
    /// Registration order. Empty on the participant side.
    pub members: Vec<Member>,
}

impl Session {
    pub fn users(&self) -> usize {
        self.members.len()
    }

    pub fn collaterals(&self) -> Vec<Transaction> {
        self.members.iter().map(|m| m.collateral.clone()).collect()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.members.iter().map(|m| m.peer).collect()
    }
}

/// Key and collateral input a masternode signs its announcements with.
#[derive(Clone, Debug)]
pub struct MasternodeIdentity {
    pub input_ref: OutPoint,
    key: SecretKey,
}

impl MasternodeIdentity {
    pub fn new(input_ref: OutPoint, key: SecretKey) -> Self {
        Self { input_ref, key }
    }

    pub fn key(&self) -> &SecretKey {
        &self.key
    }

    pub fn pubkey(&self) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &self.key)
    }
}

pub struct CoordinatorRole {
    pub identity: MasternodeIdentity,
}

pub struct ParticipantRole {
    pub(super) wallet: Arc<dyn MixWallet>,
    /// Coordinator we sent a join request to.
    pub(super) coordinator: Option<MasternodeInfo>,
    /// The coordinator accepted us into its session.
    pub(super) found_coordinator: bool,
    pub(super) used_coordinators: Vec<OutPoint>,
    pub(super) locked_coins: Vec<OutPoint>,
    pub(super) collateral: Option<Transaction>,
    pub(super) entry_submitted: bool,
    /// Entry count last reported by the coordinator.
    pub(super) entries_count: usize,
    /// Outcome of the last automatic mixing attempt, for display.
    pub(super) auto_denom_result: String,
    pub(super) ticks: u64,
}

pub enum Role {
    Coordinator(CoordinatorRole),
    Participant(ParticipantRole),
}

/// Shared collaborators.
#[derive(Clone)]
pub struct Services {
    pub chain: Arc<dyn ChainView>,
    pub directory: Arc<dyn MasternodeDirectory>,
    pub network: Arc<dyn NetworkSink>,
}

/// Point-in-time view of a pool, safe to hand to other tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub coordinator: bool,
    pub state: PoolState,
    pub session_id: u32,
    pub denom: u32,
    pub users: usize,
    pub entries: usize,
    pub max_participants: usize,
    pub queues: usize,
    pub last_message: String,
    pub detail: String,
    pub status: String,
}

impl Default for PoolSnapshot {
    fn default() -> Self {
        Self {
            coordinator: false,
            state: PoolState::Idle,
            session_id: 0,
            denom: 0,
            users: 0,
            entries: 0,
            max_participants: 0,
            queues: 0,
            last_message: String::new(),
            detail: String::new(),
            status: status_message(PoolState::Idle, 0, 0, ""),
        }
    }
}

/// User-facing status line for a pool in `state`.
pub fn status_message(state: PoolState, entries: usize, max: usize, last_message: &str) -> String {
    match state {
        PoolState::Idle => "Mixing is idle.".into(),
        PoolState::Queue => "Submitted to masternode, waiting in queue.".into(),
        PoolState::AcceptingEntries => {
            format!("Submitted to masternode, waiting for more entries ({} / {}).", entries, max)
        }
        PoolState::FinalizeTransaction => "Finalizing transaction.".into(),
        PoolState::Signing => "Found enough users, signing ...".into(),
        PoolState::Transmission => "Transmitting final transaction.".into(),
        PoolState::Error => format!("Mixing request incomplete: {} Will retry...", last_message),
        PoolState::Success => format!("Mixing request complete: {}", last_message),
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub struct MixPool {
    pub(super) role: Role,
    pub(super) config: MixConfig,
    pub(super) services: Services,
    pub(super) state: PoolState,
    pub(super) session: Option<Session>,
    pub(super) entries: EntryStore,
    pub(super) queues: QueueBook,
    pub(super) final_tx: Option<Transaction>,
    pub(super) broadcasts: HashMap<[u8; 32], BroadcastTx>,
    /// Milliseconds; every timeout is measured from here.
    pub(super) last_changed: u64,
    pub(super) last_message: String,
    pub(super) rng: ChaCha20Rng,
    pub(super) metrics: Metrics,
}

impl MixPool {
    pub fn coordinator(identity: MasternodeIdentity, services: Services, config: MixConfig) -> Self {
        Self::new(Role::Coordinator(CoordinatorRole { identity }), services, config)
    }

    pub fn participant(wallet: Arc<dyn MixWallet>, services: Services, config: MixConfig) -> Self {
        let role = Role::Participant(ParticipantRole {
            wallet,
            coordinator: None,
            found_coordinator: false,
            used_coordinators: Vec::new(),
            locked_coins: Vec::new(),
            collateral: None,
            entry_submitted: false,
            entries_count: 0,
            auto_denom_result: String::new(),
            ticks: 0,
        });
        Self::new(role, services, config)
    }

    fn new(role: Role, services: Services, config: MixConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        Self {
            role,
            entries: EntryStore::new(config.max_participants),
            config,
            services,
            state: PoolState::Idle,
            session: None,
            queues: QueueBook::new(),
            final_tx: None,
            broadcasts: HashMap::new(),
            last_changed: 0,
            last_message: String::new(),
            rng,
            metrics: Metrics::new(),
        }
    }

    /// Replace the RNG driving session ids, shuffling and charging.
    pub fn with_rng(mut self, rng: ChaCha20Rng) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn is_coordinator(&self) -> bool {
        matches!(self.role, Role::Coordinator(_))
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn config(&self) -> &MixConfig {
        &self.config
    }

    pub fn session_id(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.id)
    }

    pub fn session_denom(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.denom)
    }

    pub fn session_users(&self) -> usize {
        self.session.as_ref().map_or(0, Session::users)
    }

    /// Entries in the session: stored ones on a coordinator, the reported
    /// count on a participant.
    pub fn entries_count(&self) -> usize {
        match &self.role {
            Role::Coordinator(_) => self.entries.len(),
            Role::Participant(p) => p.entries_count,
        }
    }

    pub fn entries(&self) -> &EntryStore {
        &self.entries
    }

    pub fn queues(&self) -> &QueueBook {
        &self.queues
    }

    pub fn final_transaction(&self) -> Option<&Transaction> {
        self.final_tx.as_ref()
    }

    pub fn last_message(&self) -> &str {
        &self.last_message
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Coins this participant currently holds locked.
    pub fn locked_coins(&self) -> &[OutPoint] {
        match &self.role {
            Role::Participant(p) => &p.locked_coins,
            Role::Coordinator(_) => &[],
        }
    }

    pub fn status(&self) -> String {
        status_message(self.state, self.entries_count(), self.config.max_participants, &self.last_message)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let detail = match &self.role {
            Role::Participant(p) => p.auto_denom_result.clone(),
            Role::Coordinator(_) => String::new(),
        };
        PoolSnapshot {
            coordinator: self.is_coordinator(),
            state: self.state,
            session_id: self.session_id(),
            denom: self.session_denom(),
            users: self.session_users(),
            entries: self.entries_count(),
            max_participants: self.config.max_participants,
            queues: self.queues.len(),
            last_message: self.last_message.clone(),
            detail,
            status: self.status(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub(super) fn update_state(&mut self, new_state: PoolState, now: u64) {
        if self.state == new_state {
            return;
        }
        tracing::debug!("Mix state {} -> {}", self.state, new_state);
        self.state = new_state;
        self.last_changed = now;
        if self.is_coordinator() && self.session.is_some() {
            self.relay_status(Acceptance::Reset, None);
        }
    }

    /// Release every coin this pool locked.
    pub(super) fn unlock_coins(&mut self) {
        if let Role::Participant(p) = &mut self.role {
            for outpoint in p.locked_coins.drain(..) {
                p.wallet.unlock_coin(&outpoint);
            }
        }
    }

    /// Tear down the session without touching the state.
    pub(super) fn reset_session(&mut self) {
        self.unlock_coins();
        self.session = None;
        self.entries.clear();
        self.final_tx = None;
        if let Role::Participant(p) = &mut self.role {
            p.coordinator = None;
            p.found_coordinator = false;
            p.collateral = None;
            p.entry_submitted = false;
            p.entries_count = 0;
        }
        let seed: [u8; 32] = self.rng.gen();
        self.rng = ChaCha20Rng::from_seed(seed);
    }

    /// Drop everything and return to Idle.
    pub fn reset(&mut self, now: u64) {
        self.reset_session();
        self.state = PoolState::Idle;
        self.last_changed = now;
    }

    /// Abandon the current session with `reason`.
    pub(super) fn fail_session(&mut self, reason: PoolError, now: u64) {
        tracing::warn!("Mix session {} failed in {}: {}", self.session_id(), self.state, reason);
        if self.is_coordinator() {
            if matches!(self.state, PoolState::AcceptingEntries | PoolState::Signing) {
                self.charge_fees();
            }
            self.relay_completed(true, reason.to_string());
        }
        self.metrics.inc_sessions_failed();
        self.reset_session();
        self.last_message = reason.to_string();
        self.update_state(PoolState::Error, now);
    }

    // ── Scheduling ──────────────────────────────────────────────────────

    /// Periodic driver: expire what is stale, then advance.
    pub fn tick(&mut self, now: u64) {
        self.check_timeout(now);
        self.check(now);

        let auto = self.config.auto_denominate;
        let every = self.config.auto_denominate_ticks.max(1);
        let due = match &mut self.role {
            Role::Participant(p) => {
                p.ticks += 1;
                auto && p.ticks % every == 0
            }
            Role::Coordinator(_) => false,
        };
        if due && self.state == PoolState::Idle {
            if let Err(e) = self.do_automatic_denominating(now) {
                tracing::debug!("Automatic mixing not started: {}", e);
            }
        }
    }

    /// Phase advancement.
    pub fn check(&mut self, now: u64) {
        if self.is_coordinator() {
            self.check_coordinator(now);
        }
        if matches!(self.state, PoolState::Error | PoolState::Success)
            && now.saturating_sub(self.last_changed) >= self.config.cooldown_ms()
        {
            tracing::debug!("Cooldown over, back to idle");
            self.reset(now);
        }
    }

    /// Expiry sweep for announcements, entries and the current phase.
    pub fn check_timeout(&mut self, now: u64) {
        let now_secs = now / 1_000;
        self.queues.expire(now_secs, self.config.queue_timeout_secs);
        self.broadcasts.retain(|_, b| b.sig_time + BROADCAST_RECORD_TTL > now_secs);

        let lag = if self.is_coordinator() { 0 } else { self.config.participant_lag_ms() };
        let queue_limit = self.config.queue_timeout_ms() + lag;
        let elapsed = now.saturating_sub(self.last_changed);

        match self.state {
            PoolState::Queue | PoolState::AcceptingEntries => {
                // The phase deadline wins so a late tick still charges.
                if elapsed >= queue_limit {
                    self.fail_session(PoolError::Timeout, now);
                } else if self.is_coordinator() {
                    self.expire_entries(now);
                }
            }
            PoolState::Signing => {
                if elapsed >= self.config.signing_timeout_ms() + lag {
                    self.fail_session(PoolError::SigningTimeout, now);
                }
            }
            PoolState::FinalizeTransaction | PoolState::Transmission => {
                if elapsed >= queue_limit {
                    self.fail_session(PoolError::Timeout, now);
                }
            }
            PoolState::Idle => {
                let pending = matches!(&self.role, Role::Participant(p) if p.coordinator.is_some());
                if pending && elapsed >= queue_limit {
                    tracing::info!("Join request unanswered, giving up on coordinator");
                    self.reset(now);
                }
            }
            PoolState::Error | PoolState::Success => {}
        }
    }

    /// Drop stale entries, tearing the session down if none are left.
    fn expire_entries(&mut self, now: u64) {
        let removed = self.entries.expire(now, self.config.queue_timeout_ms());
        if removed == 0 {
            return;
        }
        tracing::info!("Removed {} expired entries", removed);
        if self.entries.is_empty() {
            self.relay_completed(true, PoolError::Timeout.to_string());
            self.reset(now);
        } else {
            self.relay_status(Acceptance::Reset, None);
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Handle one inbound mixing message.
    pub fn process_message(&mut self, from: &PeerInfo, msg: MixMessage, now: u64) {
        match msg {
            MixMessage::JoinRequest { denom, collateral } => {
                self.handle_join_request(from, denom, collateral, now);
            }
            MixMessage::StatusUpdate { session_id, state, entries, accepted, error } => {
                if let Err(e) = self.status_update(from, session_id, state, entries, accepted, error, now) {
                    tracing::debug!("Status update from {}: {}", from.id, e);
                }
            }
            MixMessage::Queue(q) => self.handle_queue(from, q, now),
            MixMessage::SubmitEntry { inputs, amount, collateral, outputs } => {
                self.handle_submit_entry(from, inputs, amount, collateral, outputs, now);
            }
            MixMessage::FinalTransaction { session_id, tx } => {
                if let Err(e) = self.sign_final_transaction(from, session_id, tx, now) {
                    tracing::warn!("Refused to sign final transaction: {}", e);
                }
            }
            MixMessage::SubmitSignatures { inputs } => self.handle_signatures(from, inputs, now),
            MixMessage::Completed { session_id, error, message } => {
                self.completed_transaction(from, session_id, error, message, now);
            }
            MixMessage::BroadcastTx(record) => self.handle_broadcast_tx(from, record),
        }
    }

    fn handle_broadcast_tx(&mut self, from: &PeerInfo, record: BroadcastTx) {
        if from.version < self.config.min_protocol_version {
            return;
        }
        let txid = record.tx.txid();
        if self.broadcasts.contains_key(&txid) {
            return;
        }
        let Some(mn) = self.services.directory.find(&record.input_ref) else {
            tracing::debug!("Broadcast record from unknown masternode {}", record.input_ref);
            return;
        };
        if !record.check_signature(&mn.pubkey) {
            tracing::warn!("Bad broadcast record signature from {}", from.id);
            return;
        }
        self.broadcasts.insert(txid, record.clone());
        self.services.network.broadcast(MixMessage::BroadcastTx(record));
    }

    /// Whether `txid` was announced as a masternode-signed mix.
    pub fn is_known_mix(&self, txid: &[u8; 32]) -> bool {
        self.broadcasts.contains_key(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_view_hides_coordinator_phases() {
        assert_eq!(PoolState::FinalizeTransaction.participant_view(), PoolState::AcceptingEntries);
        assert_eq!(PoolState::Transmission.participant_view(), PoolState::Signing);
        assert_eq!(PoolState::Queue.participant_view(), PoolState::Queue);
    }

    #[test]
    fn status_messages() {
        assert_eq!(status_message(PoolState::Idle, 0, 3, ""), "Mixing is idle.");
        assert_eq!(
            status_message(PoolState::AcceptingEntries, 2, 3, ""),
            "Submitted to masternode, waiting for more entries (2 / 3)."
        );
        assert_eq!(
            status_message(PoolState::Error, 0, 3, "Session timed out."),
            "Mixing request incomplete: Session timed out. Will retry..."
        );
        assert!(status_message(PoolState::Success, 0, 3, "done").ends_with("done"));
    }

    #[test]
    fn active_states() {
        assert!(!PoolState::Idle.is_active());
        assert!(PoolState::Signing.is_active());
        assert!(!PoolState::Success.is_active());
    }
}
