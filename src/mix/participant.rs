//! Wallet side of a session: choosing a coordinator, submitting an entry,
//! checking and signing the final transaction.

use std::sync::Arc;

use super::denom::{denominations_to_string, mask_of_amounts, single_random_denomination};
use super::entry::Entry;
use super::error::PoolError;
use super::pool::{Acceptance, MixPool, PoolState, Role, Session};
use super::queue::QueueAnnouncement;
use super::services::MasternodeInfo;
use crate::core::types::{Transaction, TxIn, TxOut};
use crate::network::{MixMessage, PeerInfo};

/// Random coordinators tried before giving up on one round.
const MAX_RANDOM_TRIES: usize = 10;
/// Draws of a random denomination before giving up.
const MAX_DENOM_DRAWS: usize = 20;

impl MixPool {
    /// Pick a coordinator and ask to join it. A no-op while a session is
    /// already pending or running.
    pub fn do_automatic_denominating(&mut self, now: u64) -> Result<(), PoolError> {
        let Role::Participant(p) = &mut self.role else {
            return Err(PoolError::Mode);
        };
        if self.state != PoolState::Idle || p.coordinator.is_some() {
            return Ok(());
        }
        if p.wallet.is_locked() {
            p.auto_denom_result = PoolError::WalletLocked.to_string();
            return Err(PoolError::WalletLocked);
        }
        let amounts = p.wallet.denominated_amounts();
        if amounts.is_empty() {
            p.auto_denom_result = "No denominated funds to mix.".into();
            return Err(PoolError::Denom);
        }

        let min_protocol = self.config.min_protocol_version;
        let eligible = self.services.directory.count_eligible(min_protocol);
        // Forget the oldest coordinators once most of the network was tried.
        let keep = eligible * 9 / 10;
        if p.used_coordinators.len() > keep {
            let excess = p.used_coordinators.len() - keep;
            p.used_coordinators.drain(..excess);
        }

        let Some(collateral) = p.wallet.create_collateral(self.config.collateral_amount) else {
            p.auto_denom_result = "Unable to create collateral.".into();
            return Err(PoolError::InvalidCollateral);
        };

        // Join an advertised session first.
        let now_secs = now / 1_000;
        for q in self.queues.candidates(now_secs, self.config.queue_timeout_secs) {
            if p.used_coordinators.contains(&q.input_ref) {
                continue;
            }
            if p.wallet.select_denominated(q.denom, self.config.pool_max).is_none() {
                continue;
            }
            let Some(mn) = self.services.directory.find(&q.input_ref) else {
                continue;
            };
            if mn.protocol_version < min_protocol {
                continue;
            }
            self.queues.consume(&q.input_ref);
            tracing::info!("Joining queue of {} for {}", mn.peer, denominations_to_string(q.denom));
            self.send_join(mn, q.denom, collateral, now);
            return Ok(());
        }

        // Otherwise start a session with a random coordinator.
        let mut skipped = p.used_coordinators.clone();
        for _ in 0..MAX_RANDOM_TRIES {
            let Some(mn) = self.services.directory.find_random_excluding(&skipped, min_protocol, &mut self.rng) else {
                break;
            };
            if self.queues.is_flooding(&mn.input_ref, eligible) {
                tracing::debug!("{} announced too recently, skipping", mn.peer);
                skipped.push(mn.input_ref);
                continue;
            }
            let denom = (0..MAX_DENOM_DRAWS)
                .map(|_| single_random_denomination(&amounts, &mut self.rng))
                .find(|&d| d != 0)
                .unwrap_or(0);
            if denom == 0 {
                p.auto_denom_result = PoolError::Denom.to_string();
                return Err(PoolError::Denom);
            }
            tracing::info!("Starting session with {} for {}", mn.peer, denominations_to_string(denom));
            self.send_join(mn, denom, collateral, now);
            return Ok(());
        }

        p.auto_denom_result = "Can't find random masternode.".into();
        Err(PoolError::MnList)
    }

    fn send_join(&mut self, mn: MasternodeInfo, denom: u32, collateral: Transaction, now: u64) {
        let Role::Participant(p) = &mut self.role else {
            return;
        };
        for input in &collateral.inputs {
            p.wallet.lock_coin(&input.prevout);
            p.locked_coins.push(input.prevout);
        }
        p.used_coordinators.push(mn.input_ref);
        p.collateral = Some(collateral.clone());
        p.auto_denom_result = "Mixing in progress...".into();
        let peer = mn.peer;
        p.coordinator = Some(mn);

        self.session = Some(Session { id: 0, denom, members: Vec::new() });
        self.last_changed = now;
        self.services.network.push_message(peer, MixMessage::JoinRequest { denom, collateral });
    }

    // ── Announcements ───────────────────────────────────────────────────

    /// Store and relay a session advertisement, or act on a ready one.
    pub(super) fn handle_queue(&mut self, from: &PeerInfo, q: QueueAnnouncement, now: u64) {
        if from.version < self.config.min_protocol_version {
            return;
        }
        let now_secs = now / 1_000;
        if q.is_expired(now_secs, self.config.queue_timeout_secs) {
            return;
        }
        let Some(mn) = self.services.directory.find(&q.input_ref) else {
            tracing::debug!("Queue from unknown masternode {}", q.input_ref);
            return;
        };
        if !q.check_signature(&mn.pubkey) {
            tracing::warn!("Bad queue signature relayed by {}", from.id);
            return;
        }

        if q.ready {
            let ours = matches!(
                &self.role,
                Role::Participant(p) if p.coordinator.as_ref().is_some_and(|c| c.input_ref == q.input_ref)
            );
            let pending_entry = matches!(&self.role, Role::Participant(p) if !p.entry_submitted);
            if ours && pending_entry && self.state == PoolState::Queue {
                if let Err(e) = self.prepare_denominate(now) {
                    tracing::warn!("Could not submit entry: {}", e);
                }
            }
            return;
        }

        let eligible = self.services.directory.count_eligible(self.config.min_protocol_version);
        match self.queues.insert(q.clone(), now_secs, self.config.queue_timeout_secs, eligible) {
            Ok(()) => {
                self.metrics.inc_queues_seen();
                tracing::debug!("New queue from {} for {}", mn.peer, denominations_to_string(q.denom));
                self.services.network.broadcast(MixMessage::Queue(q));
            }
            Err(r) => tracing::debug!("Queue from {} not stored: {:?}", mn.peer, r),
        }
    }

    // ── Entry ───────────────────────────────────────────────────────────

    /// Select coins for the session denomination and submit them.
    pub fn prepare_denominate(&mut self, now: u64) -> Result<(), PoolError> {
        let result = self.build_entry(now);
        if let Err(e) = result {
            self.fail_session(e, now);
        }
        result
    }

    fn build_entry(&mut self, now: u64) -> Result<(), PoolError> {
        let Role::Participant(p) = &mut self.role else {
            return Err(PoolError::Mode);
        };
        let Some(session) = &self.session else {
            return Err(PoolError::Session);
        };
        let Some(coordinator) = p.coordinator.as_ref().map(|c| c.peer) else {
            return Err(PoolError::Session);
        };
        let Some(collateral) = p.collateral.clone() else {
            return Err(PoolError::InvalidCollateral);
        };
        let denom = session.denom;

        let Some(selected) = p.wallet.select_denominated(denom, self.config.pool_max) else {
            return Err(PoolError::Denom);
        };
        if mask_of_amounts(&selected.values) != denom {
            return Err(PoolError::Denom);
        }
        for input in &selected.inputs {
            p.wallet.lock_coin(input.prevout());
            p.locked_coins.push(*input.prevout());
        }

        let outputs: Vec<TxOut> = selected.values.iter().map(|&v| TxOut::new(v, p.wallet.fresh_script())).collect();
        let inputs: Vec<TxIn> = selected.inputs.iter().map(|i| i.txin.clone()).collect();
        let candidate = Transaction::new(inputs.clone(), outputs.clone());
        if !self.services.chain.is_admissible(&candidate) {
            return Err(PoolError::InvalidTx);
        }

        let amount = selected.total();
        self.entries.clear();
        self.entries.add(Entry::new(selected.inputs, amount, collateral.clone(), outputs.clone(), now))?;
        p.entry_submitted = true;

        tracing::info!("Submitting entry: {} inputs for {}", inputs.len(), denominations_to_string(denom));
        self.services
            .network
            .push_message(coordinator, MixMessage::SubmitEntry { inputs, amount, collateral, outputs });
        self.update_state(PoolState::AcceptingEntries, now);
        Ok(())
    }

    // ── Status ──────────────────────────────────────────────────────────

    fn is_from_coordinator(&self, from: &PeerInfo) -> bool {
        matches!(&self.role, Role::Participant(p) if p.coordinator.as_ref().is_some_and(|c| c.peer == from.id))
    }

    /// Apply a status update pushed by our coordinator.
    #[allow(clippy::too_many_arguments)]
    pub fn status_update(
        &mut self,
        from: &PeerInfo,
        session_id: u32,
        state: PoolState,
        entries: usize,
        accepted: Acceptance,
        error: Option<PoolError>,
        now: u64,
    ) -> Result<(), PoolError> {
        if !self.is_from_coordinator(from) || matches!(self.state, PoolState::Error | PoolState::Success) {
            return Ok(());
        }
        let Role::Participant(p) = &mut self.role else {
            return Ok(());
        };
        // Progress chatter before we are admitted says nothing about us.
        if !p.found_coordinator && accepted == Acceptance::Reset {
            return Ok(());
        }
        if let Some(session) = &self.session {
            if session_id != 0 && session.id != 0 && session.id != session_id {
                self.fail_session(PoolError::SessionMismatch, now);
                return Err(PoolError::SessionMismatch);
            }
        }

        p.entries_count = entries;
        if let Some(e) = error {
            p.auto_denom_result = format!("Masternode: {}", e);
        }

        match accepted {
            Acceptance::Accepted if !p.found_coordinator => {
                p.found_coordinator = true;
                if let Some(session) = self.session.as_mut() {
                    session.id = session_id;
                }
                tracing::info!("Admitted to session {} by {}", session_id, from.id);
            }
            Acceptance::Rejected => {
                let reason = error.unwrap_or(PoolError::Mode);
                if p.found_coordinator {
                    self.fail_session(reason, now);
                } else {
                    tracing::info!("Join refused by {}: {}", from.id, reason);
                    self.last_message = reason.to_string();
                    self.reset(now);
                }
                return Err(reason);
            }
            _ => {}
        }

        match state.participant_view() {
            PoolState::Idle => {
                tracing::info!("Coordinator {} dropped the session", from.id);
                self.reset(now);
            }
            PoolState::AcceptingEntries if !p.entry_submitted => {
                return self.prepare_denominate(now);
            }
            PoolState::Error | PoolState::Success => {}
            visible => self.update_state(visible, now),
        }
        Ok(())
    }

    // ── Final transaction ───────────────────────────────────────────────

    /// Check that the final transaction pays every output we asked for,
    /// then sign our inputs and send the signatures back.
    pub fn sign_final_transaction(
        &mut self,
        from: &PeerInfo,
        session_id: u32,
        tx: Transaction,
        now: u64,
    ) -> Result<(), PoolError> {
        if !self.is_from_coordinator(from) {
            return Ok(());
        }
        let Role::Participant(p) = &self.role else {
            return Ok(());
        };
        if !matches!(self.state, PoolState::AcceptingEntries | PoolState::Signing) {
            tracing::debug!("Final transaction in {}, ignoring", self.state);
            return Ok(());
        }
        if self.session_id() != session_id {
            self.fail_session(PoolError::SessionMismatch, now);
            return Err(PoolError::SessionMismatch);
        }
        let wallet = Arc::clone(&p.wallet);
        let Some(coordinator) = p.coordinator.as_ref().map(|c| c.peer) else {
            return Ok(());
        };

        if let Some(out) = missing_output(&tx, self.entries.iter().flat_map(|e| e.outputs.iter())) {
            tracing::warn!("Output of {} missing from final transaction", out.value);
            self.fail_session(PoolError::OutputsMissing, now);
            return Err(PoolError::OutputsMissing);
        }

        let own: Vec<_> = self
            .entries
            .iter()
            .flat_map(|e| e.inputs.iter())
            .map(|i| (i.txin.prevout, i.prev_script.clone()))
            .collect();
        let mut working = tx.clone();
        let mut signed = Vec::new();
        for (prevout, prev_script) in &own {
            let Some(index) = working.inputs.iter().position(|i| i.prevout == *prevout) else {
                tracing::warn!("Input {} missing from final transaction", prevout);
                self.fail_session(PoolError::InvalidInput, now);
                return Err(PoolError::InvalidInput);
            };
            if wallet.sign_input(&mut working, index, prev_script) {
                signed.push(working.inputs[index].clone());
            } else {
                tracing::warn!("Wallet could not sign {}", prevout);
            }
        }

        tracing::info!("Signed {} inputs of session {}", signed.len(), session_id);
        self.final_tx = Some(tx);
        self.update_state(PoolState::Signing, now);
        if !signed.is_empty() {
            self.services.network.push_message(coordinator, MixMessage::SubmitSignatures { inputs: signed });
        }
        Ok(())
    }

    /// Session outcome from our coordinator.
    pub fn completed_transaction(&mut self, from: &PeerInfo, session_id: u32, error: bool, message: String, now: u64) {
        if !self.is_from_coordinator(from) {
            return;
        }
        if self.session_id() != session_id {
            tracing::debug!("Completion for session {} while in {}", session_id, self.session_id());
            return;
        }
        tracing::info!("Session {} completed: {}", session_id, message);
        if error {
            self.metrics.inc_sessions_failed();
        } else {
            self.metrics.inc_sessions_completed();
        }
        self.reset_session();
        self.last_message = message;
        let outcome = if error { PoolState::Error } else { PoolState::Success };
        self.update_state(outcome, now);
    }
}

/// First of `wanted` not paid by `tx`, matching outputs with multiplicity.
fn missing_output<'a>(tx: &Transaction, wanted: impl Iterator<Item = &'a TxOut>) -> Option<TxOut> {
    let mut claimed = vec![false; tx.outputs.len()];
    for out in wanted {
        match (0..tx.outputs.len()).find(|&i| !claimed[i] && tx.outputs[i] == *out) {
            Some(i) => claimed[i] = true,
            None => return Some(out.clone()),
        }
    }
    None
}
