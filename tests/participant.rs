use mixnode::config::MixConfig;
use mixnode::core::script::Script;
use mixnode::devnet::{register_masternode, MemoryChain, MemoryWallet, StaticDirectory};
use mixnode::mix::denom::STANDARD_DENOMINATIONS;
use mixnode::mix::services::{ChainView, MasternodeDirectory, MixWallet};
use mixnode::mix::signer;
use mixnode::mix::{Acceptance, MixPool, PoolError, PoolState, Services};
use mixnode::network::local::LocalHub;
use mixnode::network::{Envelope, Message, MixMessage, PeerId, PeerInfo, PROTOCOL_VERSION};
use mixnode::*;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

// ─── Helpers ────────────────────────────────────────────────────────────────

const NOW: u64 = 1_700_000_000_000;
const DENOM: u32 = 0b01000;

/// A participant wired to a scripted coordinator whose inbox the test reads.
struct Scripted {
    pool: MixPool,
    wallet: Arc<MemoryWallet>,
    chain: Arc<MemoryChain>,
    coordinator: PeerInfo,
    inbox: UnboundedReceiver<Envelope>,
}

fn scripted() -> Scripted {
    let hub = LocalHub::new();
    let chain = Arc::new(MemoryChain::new());
    let (_, info) = register_masternode(&chain, b"scripted", PeerId(1));
    let directory = Arc::new(StaticDirectory::new(vec![info]));
    let (_coord_link, inbox) = hub.connect(PeerId(1), PROTOCOL_VERSION);
    let (link, _own_inbox) = hub.connect(PeerId(2), PROTOCOL_VERSION);

    // Only one denomination on hand, so the session denomination is fixed.
    let wallet = Arc::new(MemoryWallet::new(chain.clone(), b"participant"));
    wallet.fund(STANDARD_DENOMINATIONS[3]);
    wallet.fund(COIN / 10);

    let services = Services {
        chain: chain.clone() as Arc<dyn ChainView>,
        directory: directory as Arc<dyn MasternodeDirectory>,
        network: Arc::new(link),
    };
    let config = MixConfig { rng_seed: Some(3), auto_denominate: false, ..MixConfig::default() };
    let pool = MixPool::participant(wallet.clone() as Arc<dyn MixWallet>, services, config);
    let coordinator = PeerInfo { id: PeerId(1), version: PROTOCOL_VERSION };
    Scripted { pool, wallet, chain, coordinator, inbox }
}

impl Scripted {
    fn sent(&mut self) -> Vec<MixMessage> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.inbox.try_recv() {
            if let Message::Mix(msg) = envelope.message {
                out.push(msg);
            }
        }
        out
    }

    fn status(&mut self, session_id: u32, state: PoolState, accepted: Acceptance, error: Option<PoolError>, now: u64) {
        let msg = MixMessage::StatusUpdate { session_id, state, entries: 0, accepted, error };
        self.pool.process_message(&self.coordinator, msg, now);
    }

    /// Join, get admitted and submit an entry. Returns the entry.
    fn admitted_with_entry(&mut self) -> (Vec<TxIn>, Vec<TxOut>) {
        self.pool.do_automatic_denominating(NOW).unwrap();
        self.status(42, PoolState::Queue, Acceptance::Accepted, None, NOW);
        self.status(42, PoolState::AcceptingEntries, Acceptance::Reset, None, NOW);
        self.sent()
            .into_iter()
            .find_map(|m| match m {
                MixMessage::SubmitEntry { inputs, outputs, .. } => Some((inputs, outputs)),
                _ => None,
            })
            .expect("entry submitted")
    }
}

// ─── Joining ────────────────────────────────────────────────────────────────

#[test]
fn test_join_request_locks_collateral() {
    let mut s = scripted();
    s.pool.do_automatic_denominating(NOW).unwrap();

    let sent = s.sent();
    let Some(MixMessage::JoinRequest { denom, collateral }) = sent.first() else {
        panic!("expected a join request, got {:?}", sent);
    };
    assert_eq!(*denom, DENOM);
    assert_eq!(s.wallet.locked(), vec![collateral.inputs[0].prevout]);
    assert_eq!(s.pool.state(), PoolState::Idle);

    // A pending join is not repeated.
    s.pool.do_automatic_denominating(NOW).unwrap();
    assert!(s.sent().is_empty());
}

#[test]
fn test_locked_wallet_does_not_mix() {
    let mut s = scripted();
    s.wallet.set_locked(true);
    assert_eq!(s.pool.do_automatic_denominating(NOW), Err(PoolError::WalletLocked));
    assert!(s.sent().is_empty());
}

#[test]
fn test_rejected_join_releases_collateral() {
    let mut s = scripted();
    s.pool.do_automatic_denominating(NOW).unwrap();
    s.status(0, PoolState::Idle, Acceptance::Rejected, Some(PoolError::QueueFull), NOW);

    assert_eq!(s.pool.state(), PoolState::Idle);
    assert!(s.wallet.locked().is_empty());
    assert_eq!(s.pool.last_message(), "Masternode queue is full.");
}

#[test]
fn test_admission_adopts_session_id() {
    let mut s = scripted();
    s.pool.do_automatic_denominating(NOW).unwrap();
    // Progress chatter before admission is ignored.
    s.status(42, PoolState::Queue, Acceptance::Reset, None, NOW);
    assert_eq!(s.pool.session_id(), 0);

    s.status(42, PoolState::Queue, Acceptance::Accepted, None, NOW);
    assert_eq!(s.pool.session_id(), 42);
    assert_eq!(s.pool.state(), PoolState::Queue);
}

#[test]
fn test_unanswered_join_is_abandoned() {
    let mut s = scripted();
    s.pool.do_automatic_denominating(NOW).unwrap();
    let limit = s.pool.config().queue_timeout_ms() + s.pool.config().participant_lag_ms();

    s.pool.tick(NOW + limit - 1);
    assert_eq!(s.wallet.locked().len(), 1);
    s.pool.tick(NOW + limit);
    assert!(s.wallet.locked().is_empty());
    assert_eq!(s.pool.session_denom(), 0);
}

// ─── Entry and signing ──────────────────────────────────────────────────────

#[test]
fn test_entry_submitted_when_accepting() {
    let mut s = scripted();
    let (inputs, outputs) = s.admitted_with_entry();

    assert_eq!(s.pool.state(), PoolState::AcceptingEntries);
    assert_eq!(inputs.len(), 1);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].value, STANDARD_DENOMINATIONS[3]);
    assert!(outputs[0].script_pubkey.is_p2pkh());
    // Collateral plus the mixed coin.
    assert_eq!(s.wallet.locked().len(), 2);
}

#[test]
fn test_signs_final_transaction_with_its_outputs() {
    let mut s = scripted();
    let (inputs, outputs) = s.admitted_with_entry();

    let other_in = TxIn::new(OutPoint::new([7; 32], 0));
    let other_out = TxOut::new(STANDARD_DENOMINATIONS[3], Script::p2pkh(&[7; 20]));
    let tx = Transaction::new(vec![other_in, inputs[0].clone()], vec![other_out, outputs[0].clone()]);
    s.pool.process_message(&s.coordinator.clone(), MixMessage::FinalTransaction { session_id: 42, tx: tx.clone() }, NOW);

    assert_eq!(s.pool.state(), PoolState::Signing);
    let signed = s
        .sent()
        .into_iter()
        .find_map(|m| match m {
            MixMessage::SubmitSignatures { inputs } => Some(inputs),
            _ => None,
        })
        .expect("signatures sent");
    assert_eq!(signed.len(), 1);

    let mut check = tx.clone();
    check.inputs[1] = signed[0].clone();
    let prev = s.chain.lookup_output(&inputs[0].prevout).unwrap();
    assert!(signer::verify_input(&check, 1, &prev.script_pubkey));
}

#[test]
fn test_refuses_to_sign_without_its_outputs() {
    let mut s = scripted();
    let (inputs, outputs) = s.admitted_with_entry();

    let mut stolen = outputs[0].clone();
    stolen.script_pubkey = Script::p2pkh(&[9; 20]);
    let tx = Transaction::new(inputs.clone(), vec![stolen]);
    let result = s.pool.sign_final_transaction(&s.coordinator.clone(), 42, tx, NOW);

    assert_eq!(result, Err(PoolError::OutputsMissing));
    assert_eq!(s.pool.state(), PoolState::Error);
    assert!(s.sent().iter().all(|m| !matches!(m, MixMessage::SubmitSignatures { .. })));
    assert!(s.wallet.locked().is_empty());
}

#[test]
fn test_session_mismatch_aborts() {
    let mut s = scripted();
    let (inputs, outputs) = s.admitted_with_entry();

    let tx = Transaction::new(inputs, outputs);
    let result = s.pool.sign_final_transaction(&s.coordinator.clone(), 43, tx, NOW);
    assert_eq!(result, Err(PoolError::SessionMismatch));
    assert_eq!(s.pool.state(), PoolState::Error);
}

#[test]
fn test_messages_from_strangers_are_ignored() {
    let mut s = scripted();
    let (inputs, outputs) = s.admitted_with_entry();

    let stranger = PeerInfo { id: PeerId(77), version: PROTOCOL_VERSION };
    let tx = Transaction::new(inputs, outputs);
    s.pool.process_message(&stranger, MixMessage::FinalTransaction { session_id: 42, tx }, NOW);
    s.pool.process_message(
        &stranger,
        MixMessage::Completed { session_id: 42, error: true, message: "nope".into() },
        NOW,
    );
    assert_eq!(s.pool.state(), PoolState::AcceptingEntries);
}

// ─── Completion ─────────────────────────────────────────────────────────────

#[test]
fn test_completion_releases_coins() {
    let mut s = scripted();
    s.admitted_with_entry();
    let msg = MixMessage::Completed { session_id: 42, error: false, message: "Transaction created successfully.".into() };
    s.pool.process_message(&s.coordinator.clone(), msg, NOW + 5);

    assert_eq!(s.pool.state(), PoolState::Success);
    assert!(s.wallet.locked().is_empty());
    assert!(s.pool.status().starts_with("Mixing request complete"));

    s.pool.tick(NOW + 5 + s.pool.config().cooldown_ms());
    assert_eq!(s.pool.state(), PoolState::Idle);
}

#[test]
fn test_coordinator_silence_times_out() {
    let mut s = scripted();
    s.admitted_with_entry();
    let limit = s.pool.config().queue_timeout_ms() + s.pool.config().participant_lag_ms();

    s.pool.tick(NOW + limit - 1);
    assert_eq!(s.pool.state(), PoolState::AcceptingEntries);
    s.pool.tick(NOW + limit);
    assert_eq!(s.pool.state(), PoolState::Error);
    assert_eq!(s.pool.last_message(), "Session timed out.");
    assert!(s.wallet.locked().is_empty());
}
