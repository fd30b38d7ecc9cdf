//! Masternode side of a session: admission, entry collection, signature
//! merging and broadcast of the finished transaction.

use rand::seq::SliceRandom;
use rand::Rng;

use super::charger;
use super::collateral::validate_collateral;
use super::denom::{denominations_mask, denominations_to_string, ALL_DENOMINATIONS_MASK};
use super::entry::{Entry, MixInput};
use super::error::{PoolError, MSG_ENTRIES_ADDED, MSG_SUCCESS};
use super::pool::{Acceptance, Member, MixPool, PoolState, Role, Session};
use super::queue::{BroadcastTx, QueueAnnouncement};
use super::signer;
use crate::core::script::P2PKH_LEN;
use crate::core::types::{Amount, OutPoint, Transaction, TxIn, TxOut};
use crate::network::{MixMessage, PeerId, PeerInfo};

/// Session ids are drawn from this range.
const SESSION_ID_RANGE: std::ops::RangeInclusive<u32> = 1..=999_999;

impl MixPool {
    fn coordinator_input(&self) -> Result<OutPoint, PoolError> {
        match &self.role {
            Role::Coordinator(c) => Ok(c.identity.input_ref),
            Role::Participant(_) => Err(PoolError::NotAMasternode),
        }
    }

    // ── Admission ───────────────────────────────────────────────────────

    pub(super) fn handle_join_request(&mut self, from: &PeerInfo, denom: u32, collateral: Transaction, now: u64) {
        if !self.is_coordinator() {
            return;
        }
        match self.request_join(from, denom, collateral, now) {
            Ok(()) => {
                tracing::info!("{} joined session {}", from.id, self.session_id());
                self.push_status(from.id, Acceptance::Accepted, None);
            }
            Err(e) => {
                tracing::info!("Join from {} refused: {}", from.id, e);
                self.push_status(from.id, Acceptance::Rejected, Some(e));
            }
        }
    }

    /// Admit `from` into the current session, starting one if none exists.
    pub fn request_join(
        &mut self,
        from: &PeerInfo,
        denom: u32,
        collateral: Transaction,
        now: u64,
    ) -> Result<(), PoolError> {
        if from.version < self.config.min_protocol_version {
            return Err(PoolError::Version);
        }
        let input_ref = self.coordinator_input()?;
        if self.services.directory.find(&input_ref).is_none() {
            return Err(PoolError::MnList);
        }
        if self.session_users() == 0 {
            let eligible = self.services.directory.count_eligible(self.config.min_protocol_version);
            if self.queues.is_flooding(&input_ref, eligible) {
                tracing::debug!("Announced too recently to start another session");
                return Err(PoolError::Recent);
            }
        }
        self.admit(from.id, denom, collateral, now)
    }

    fn admit(&mut self, peer: PeerId, denom: u32, collateral: Transaction, now: u64) -> Result<(), PoolError> {
        if denom == 0 || denom > ALL_DENOMINATIONS_MASK {
            return Err(PoolError::Denom);
        }
        validate_collateral(&collateral, self.services.chain.as_ref(), self.config.collateral_amount)?;

        match &mut self.session {
            None => {
                if self.state != PoolState::Idle {
                    return Err(PoolError::Mode);
                }
                let id = self.rng.gen_range(SESSION_ID_RANGE);
                self.session = Some(Session { id, denom, members: vec![Member { peer, collateral }] });
                self.metrics.inc_sessions_started();
                tracing::info!("Starting session {} for {}", id, denominations_to_string(denom));
                self.update_state(PoolState::Queue, now);
                self.announce_queue(denom, false, now);
                Ok(())
            }
            Some(session) => {
                if !matches!(self.state, PoolState::Queue | PoolState::AcceptingEntries) {
                    return Err(PoolError::Mode);
                }
                if session.users() >= self.config.max_participants {
                    return Err(PoolError::QueueFull);
                }
                if denom != session.denom {
                    return Err(PoolError::Denom);
                }
                if session.members.iter().any(|m| m.peer == peer || m.collateral == collateral) {
                    return Err(PoolError::AlreadyHave);
                }
                session.members.push(Member { peer, collateral });
                self.last_changed = now;
                Ok(())
            }
        }
    }

    fn announce_queue(&mut self, denom: u32, ready: bool, now: u64) {
        let Role::Coordinator(c) = &self.role else {
            return;
        };
        let mut q = QueueAnnouncement::new(c.identity.input_ref, denom, now / 1_000, ready);
        q.sign(c.identity.key());
        if !ready {
            let eligible = self.services.directory.count_eligible(self.config.min_protocol_version);
            if let Err(r) = self.queues.insert(q.clone(), now / 1_000, self.config.queue_timeout_secs, eligible) {
                tracing::debug!("Own announcement not stored: {:?}", r);
            }
        }
        tracing::debug!("Announcing queue {} ready={}", denominations_to_string(denom), ready);
        self.services.network.broadcast(MixMessage::Queue(q));
    }

    // ── Entries ─────────────────────────────────────────────────────────

    pub(super) fn handle_submit_entry(
        &mut self,
        from: &PeerInfo,
        inputs: Vec<TxIn>,
        amount: Amount,
        collateral: Transaction,
        outputs: Vec<TxOut>,
        now: u64,
    ) {
        if !self.is_coordinator() {
            return;
        }
        match self.submit_entry(from, inputs, amount, collateral, outputs, now) {
            Ok(()) => {
                self.metrics.inc_entries_accepted();
                tracing::info!("{} from {} ({} / {})", MSG_ENTRIES_ADDED, from.id, self.entries.len(), self.config.max_participants);
                self.push_status(from.id, Acceptance::Accepted, None);
                self.check(now);
                self.relay_status(Acceptance::Reset, None);
            }
            Err(e) => {
                self.metrics.inc_entries_rejected();
                tracing::info!("Entry from {} rejected: {}", from.id, e);
                self.push_status(from.id, Acceptance::Rejected, Some(e));
            }
        }
    }

    /// Validate and store one participant's entry.
    pub fn submit_entry(
        &mut self,
        from: &PeerInfo,
        inputs: Vec<TxIn>,
        amount: Amount,
        collateral: Transaction,
        outputs: Vec<TxOut>,
        now: u64,
    ) -> Result<(), PoolError> {
        if from.version < self.config.min_protocol_version {
            return Err(PoolError::Version);
        }
        self.coordinator_input()?;

        if let Some(dup) = inputs.iter().find(|i| self.entries.contains_input(&i.prevout)) {
            tracing::debug!("Input {} already in session", dup.prevout);
            return Err(PoolError::AlreadyHave);
        }

        let Some(session) = &self.session else {
            return Err(PoolError::Session);
        };
        let Some(member) = session.members.iter().find(|m| m.peer == from.id) else {
            tracing::debug!("Entry from {} which is not in session {}", from.id, session.id);
            return Err(PoolError::Session);
        };
        if member.collateral != collateral {
            return Err(PoolError::InvalidCollateral);
        }
        // One entry per member.
        if self.entries.has_collateral(&collateral) {
            return Err(PoolError::ExistingTx);
        }
        if self.state != PoolState::AcceptingEntries || session.users() < self.config.max_participants {
            return Err(PoolError::Session);
        }
        if denominations_mask(&outputs) != session.denom || !self.entries.is_compatible(&outputs) {
            return Err(PoolError::Denom);
        }

        for out in &outputs {
            if out.script_pubkey.len() != P2PKH_LEN {
                return Err(PoolError::NonStandardPubkey);
            }
            if !out.script_pubkey.is_normal_payment_script() {
                return Err(PoolError::InvalidScript);
            }
        }

        if inputs.is_empty() || amount < 0 {
            return Err(PoolError::InvalidInput);
        }
        let mut value_in: Amount = 0;
        let mut mix_inputs = Vec::with_capacity(inputs.len());
        for txin in &inputs {
            if txin.prevout.is_null() {
                return Err(PoolError::InvalidInput);
            }
            let Some(prev) = self.services.chain.lookup_output(&txin.prevout) else {
                tracing::debug!("Missing input {}", txin.prevout);
                return Err(PoolError::MissingTx);
            };
            value_in += prev.value;
            mix_inputs.push(MixInput::new(txin.clone(), prev.script_pubkey));
        }
        if value_in > self.config.pool_max {
            return Err(PoolError::Maximum);
        }

        let value_out: Amount = outputs.iter().map(|o| o.value).sum();
        if value_out > value_in {
            return Err(PoolError::InvalidTx);
        }
        // At most 1% of the inputs may go to fees.
        if value_in - value_out > value_in / 100 {
            return Err(PoolError::Fees);
        }

        let candidate = Transaction::new(inputs.iter().map(TxIn::unsigned).collect(), outputs.clone());
        if !self.services.chain.is_admissible(&candidate) {
            return Err(PoolError::InvalidTx);
        }
        validate_collateral(&collateral, self.services.chain.as_ref(), self.config.collateral_amount)?;

        self.entries.add(Entry::new(mix_inputs, amount, collateral, outputs, now))
    }

    // ── Phase advancement ───────────────────────────────────────────────

    pub(super) fn check_coordinator(&mut self, now: u64) {
        if self.state == PoolState::Queue && self.session_users() >= self.config.max_participants {
            tracing::info!("Session {} is full, accepting entries", self.session_id());
            self.update_state(PoolState::AcceptingEntries, now);
            let denom = self.session_denom();
            self.announce_queue(denom, true, now);
        }

        if self.state == PoolState::AcceptingEntries && self.entries.is_full() {
            self.update_state(PoolState::FinalizeTransaction, now);
        }

        if self.state == PoolState::FinalizeTransaction {
            self.assemble_final_transaction(now);
        }

        if self.state == PoolState::Signing && self.entries.all_signatures_complete() {
            self.update_state(PoolState::Transmission, now);
            self.check_final_transaction(now);
        }
    }

    fn assemble_final_transaction(&mut self, now: u64) {
        let mut inputs: Vec<TxIn> = Vec::new();
        let mut outputs: Vec<TxOut> = Vec::new();
        for entry in self.entries.iter() {
            inputs.extend(entry.inputs.iter().map(|i| i.txin.unsigned()));
            outputs.extend(entry.outputs.iter().cloned());
        }
        inputs.shuffle(&mut self.rng);
        outputs.shuffle(&mut self.rng);

        let tx = Transaction::new(inputs, outputs);
        tracing::info!(
            "Session {} final transaction {} ({} inputs, {} outputs)",
            self.session_id(),
            hex::encode(tx.txid()),
            tx.inputs.len(),
            tx.outputs.len()
        );

        let session_id = self.session_id();
        for peer in self.session.as_ref().map(|s| s.peers()).unwrap_or_default() {
            self.services.network.push_message(peer, MixMessage::FinalTransaction { session_id, tx: tx.clone() });
        }
        self.final_tx = Some(tx);
        self.update_state(PoolState::Signing, now);
    }

    // ── Signatures ──────────────────────────────────────────────────────

    pub(super) fn handle_signatures(&mut self, from: &PeerInfo, inputs: Vec<TxIn>, now: u64) {
        if !self.is_coordinator() || from.version < self.config.min_protocol_version {
            return;
        }
        let mut applied = false;
        for txin in &inputs {
            match self.submit_signature(txin) {
                Ok(()) => {
                    self.metrics.inc_signatures_applied();
                    applied = true;
                }
                Err(e) => {
                    self.metrics.inc_signatures_rejected();
                    tracing::warn!("Signature for {} from {} rejected: {}", txin.prevout, from.id, e);
                }
            }
        }
        if applied {
            self.check(now);
            self.relay_status(Acceptance::Reset, None);
        }
    }

    /// Verify `signed` against the final transaction and merge it.
    pub fn submit_signature(&mut self, signed: &TxIn) -> Result<(), PoolError> {
        if self.state != PoolState::Signing {
            return Err(PoolError::Mode);
        }
        let Some(final_tx) = self.final_tx.as_mut() else {
            return Err(PoolError::Mode);
        };
        let Some(index) = final_tx
            .inputs
            .iter()
            .position(|i| i.prevout == signed.prevout && i.sequence == signed.sequence)
        else {
            return Err(PoolError::InvalidInput);
        };
        let Some(input) = self.entries.find_input(signed) else {
            return Err(PoolError::InvalidInput);
        };
        if input.has_sig {
            return Err(PoolError::AlreadyHave);
        }

        let previous = std::mem::replace(&mut final_tx.inputs[index].script_sig, signed.script_sig.clone());
        if !signer::verify_input(final_tx, index, &input.prev_script) {
            final_tx.inputs[index].script_sig = previous;
            return Err(PoolError::InvalidSignature);
        }
        self.entries.add_signature(signed);
        Ok(())
    }

    /// Submit the fully signed transaction and close the session.
    pub(super) fn check_final_transaction(&mut self, now: u64) {
        let Some(tx) = self.final_tx.clone() else {
            return;
        };
        let Role::Coordinator(c) = &self.role else {
            return;
        };
        let identity = c.identity.clone();

        if !self.services.chain.accept_to_mempool(&tx) {
            tracing::warn!("Final transaction {} refused by mempool", hex::encode(tx.txid()));
            self.fail_session(PoolError::InvalidTx, now);
            return;
        }

        let txid = tx.txid();
        let mut record = BroadcastTx::new(tx, identity.input_ref, now / 1_000);
        record.sign(identity.key());
        self.broadcasts.insert(txid, record.clone());
        self.services.network.broadcast(MixMessage::BroadcastTx(record));
        self.services.network.broadcast_inventory(txid);
        tracing::info!("Session {} complete: {}", self.session_id(), hex::encode(txid));

        self.relay_completed(false, MSG_SUCCESS.to_string());

        let pledged = self.session.as_ref().map(Session::collaterals).unwrap_or_default();
        if let Some(collateral) = charger::charge_random_fee(&self.config.charge, &pledged, &mut self.rng) {
            self.forfeit(&collateral);
        }

        self.metrics.inc_sessions_completed();
        self.reset_session();
        self.last_message = MSG_SUCCESS.to_string();
        self.update_state(PoolState::Success, now);
    }

    // ── Charging ────────────────────────────────────────────────────────

    /// Forfeit at most one collateral of a session failing in the current
    /// state.
    pub(super) fn charge_fees(&mut self) {
        let pledged = self.session.as_ref().map(Session::collaterals).unwrap_or_default();
        let charge = charger::charge_failed_session(
            &self.config.charge,
            self.state,
            &pledged,
            &self.entries,
            self.config.max_participants,
            &mut self.rng,
        );
        if let Some(charge) = charge {
            self.forfeit(&charge.collateral);
        }
    }

    fn forfeit(&mut self, collateral: &Transaction) {
        let txid = collateral.txid();
        if self.services.chain.accept_to_mempool(collateral) {
            self.services.network.broadcast_inventory(txid);
            self.metrics.inc_collaterals_charged();
            tracing::info!("Collateral {} forfeited", hex::encode(txid));
        } else {
            tracing::warn!("Collateral {} could not be submitted", hex::encode(txid));
        }
    }

    // ── Outbound status ─────────────────────────────────────────────────

    fn push_status(&self, peer: PeerId, accepted: Acceptance, error: Option<PoolError>) {
        self.services.network.push_message(
            peer,
            MixMessage::StatusUpdate {
                session_id: self.session_id(),
                state: self.state,
                entries: self.entries.len(),
                accepted,
                error,
            },
        );
    }

    /// Send the current state to every session member.
    pub(super) fn relay_status(&self, accepted: Acceptance, error: Option<PoolError>) {
        let Some(session) = &self.session else {
            return;
        };
        for member in &session.members {
            self.push_status(member.peer, accepted, error);
        }
    }

    pub(super) fn relay_completed(&self, error: bool, message: String) {
        let Some(session) = &self.session else {
            return;
        };
        for member in &session.members {
            self.services.network.push_message(
                member.peer,
                MixMessage::Completed { session_id: session.id, error, message: message.clone() },
            );
        }
    }
}
