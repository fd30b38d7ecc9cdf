//! In-memory chain, wallet and masternode list.
//!
//! Enough of a ledger to run mixing sessions end to end without a real
//! node: the `simulate` command and the integration tests both build on
//! these types.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use tokio::sync::mpsc;

use crate::config::MixConfig;
use crate::core::script::Script;
use crate::core::types::{hash, hash_concat, Amount, OutPoint, Transaction, TxIn, TxOut};
use crate::mix::denom::{decode_mask, is_denominated_amount};
use crate::mix::entry::MixInput;
use crate::mix::pool::{MasternodeIdentity, MixPool, Services};
use crate::mix::services::{ChainView, MasternodeDirectory, MasternodeInfo, MixWallet, SelectedCoins};
use crate::mix::signer;
use crate::network::local::{LocalHub, LocalLink};
use crate::network::{Envelope, Message, PeerId, PROTOCOL_VERSION};

/// Value locked behind each masternode's collateral input.
pub const MASTERNODE_COLLATERAL: Amount = 1_000 * crate::core::types::COIN;

/// Deterministic secret key number `index` derived from `seed`.
pub fn derive_key(seed: &[u8], index: u64) -> SecretKey {
    let mut attempt = 0u64;
    loop {
        let tweak = [index.to_le_bytes(), attempt.to_le_bytes()].concat();
        if let Ok(key) = SecretKey::from_slice(&hash_concat(seed, &tweak)) {
            return key;
        }
        attempt += 1;
    }
}

// ── Chain ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct ChainInner {
    outputs: HashMap<OutPoint, TxOut>,
    spent: HashSet<OutPoint>,
    mempool: Vec<Transaction>,
    funded: u64,
}

impl ChainInner {
    fn check(&self, tx: &Transaction, verify_signatures: bool) -> bool {
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return false;
        }
        if tx.outputs.iter().any(|o| o.value <= 0) {
            return false;
        }
        let mut seen = HashSet::new();
        let mut value_in: Amount = 0;
        for (index, input) in tx.inputs.iter().enumerate() {
            if !seen.insert(input.prevout) || self.spent.contains(&input.prevout) {
                return false;
            }
            let Some(prev) = self.outputs.get(&input.prevout) else {
                return false;
            };
            if verify_signatures && !signer::verify_input(tx, index, &prev.script_pubkey) {
                return false;
            }
            value_in += prev.value;
        }
        tx.value_out() <= value_in
    }
}

/// A UTXO set plus a mempool that never confirms anything.
#[derive(Default)]
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh output of `value` paying `script`.
    pub fn fund(&self, script: Script, value: Amount) -> OutPoint {
        let mut inner = self.inner.lock();
        inner.funded += 1;
        let mut preimage = b"fund".to_vec();
        preimage.extend_from_slice(&inner.funded.to_le_bytes());
        let outpoint = OutPoint::new(hash(&preimage), 0);
        inner.outputs.insert(outpoint, TxOut::new(value, script));
        outpoint
    }

    pub fn mark_spent(&self, outpoint: &OutPoint) {
        self.inner.lock().spent.insert(*outpoint);
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.inner.lock().spent.contains(outpoint)
    }

    pub fn mempool(&self) -> Vec<Transaction> {
        self.inner.lock().mempool.clone()
    }

    pub fn in_mempool(&self, txid: &[u8; 32]) -> bool {
        self.inner.lock().mempool.iter().any(|tx| &tx.txid() == txid)
    }

    /// Unspent outputs paying any of `scripts`, ordered by outpoint.
    pub fn unspent_for(&self, scripts: &[Script]) -> Vec<(OutPoint, TxOut)> {
        let inner = self.inner.lock();
        let mut coins: Vec<(OutPoint, TxOut)> = inner
            .outputs
            .iter()
            .filter(|(op, out)| !inner.spent.contains(*op) && scripts.contains(&out.script_pubkey))
            .map(|(op, out)| (*op, out.clone()))
            .collect();
        coins.sort_by_key(|(op, _)| *op);
        coins
    }
}

impl ChainView for MemoryChain {
    fn lookup_output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.inner.lock().outputs.get(outpoint).cloned()
    }

    fn is_admissible(&self, tx: &Transaction) -> bool {
        self.inner.lock().check(tx, false)
    }

    fn accept_to_mempool(&self, tx: &Transaction) -> bool {
        let mut inner = self.inner.lock();
        if !inner.check(tx, true) {
            return false;
        }
        let txid = tx.txid();
        for input in &tx.inputs {
            inner.spent.insert(input.prevout);
        }
        for (vout, out) in tx.outputs.iter().enumerate() {
            inner.outputs.insert(OutPoint::new(txid, vout as u32), out.clone());
        }
        inner.mempool.push(tx.clone());
        tracing::debug!("Mempool accepted {}", hex::encode(txid));
        true
    }
}

// ── Wallet ──────────────────────────────────────────────────────────────

struct WalletInner {
    keys: Vec<SecretKey>,
    scripts: Vec<Script>,
    locked: HashSet<OutPoint>,
    is_locked: bool,
}

/// Keys derived from a seed; coins are whatever the chain holds for them.
pub struct MemoryWallet {
    chain: Arc<MemoryChain>,
    seed: Vec<u8>,
    inner: Mutex<WalletInner>,
}

impl MemoryWallet {
    pub fn new(chain: Arc<MemoryChain>, seed: &[u8]) -> Self {
        Self {
            chain,
            seed: seed.to_vec(),
            inner: Mutex::new(WalletInner {
                keys: Vec::new(),
                scripts: Vec::new(),
                locked: HashSet::new(),
                is_locked: false,
            }),
        }
    }

    /// Pay `value` to a new address of this wallet.
    pub fn fund(&self, value: Amount) -> OutPoint {
        self.chain.fund(self.fresh_script(), value)
    }

    pub fn set_locked(&self, locked: bool) {
        self.inner.lock().is_locked = locked;
    }

    /// Coins currently reserved by a mixing session.
    pub fn locked(&self) -> Vec<OutPoint> {
        let mut locked: Vec<OutPoint> = self.inner.lock().locked.iter().copied().collect();
        locked.sort();
        locked
    }

    pub fn balance(&self) -> Amount {
        self.unspent().iter().map(|(_, out)| out.value).sum()
    }

    /// Every unspent coin, locked or not.
    pub fn unspent(&self) -> Vec<(OutPoint, TxOut)> {
        let scripts = self.inner.lock().scripts.clone();
        self.chain.unspent_for(&scripts)
    }

    fn available(&self) -> Vec<(OutPoint, TxOut)> {
        let locked = self.inner.lock().locked.clone();
        self.unspent().into_iter().filter(|(op, _)| !locked.contains(op)).collect()
    }

    fn key_for(&self, script: &Script) -> Option<SecretKey> {
        let inner = self.inner.lock();
        inner.scripts.iter().position(|s| s == script).map(|i| inner.keys[i])
    }
}

impl MixWallet for MemoryWallet {
    fn is_locked(&self) -> bool {
        self.inner.lock().is_locked
    }

    fn denominated_amounts(&self) -> Vec<Amount> {
        self.available().into_iter().map(|(_, out)| out.value).filter(|v| is_denominated_amount(*v)).collect()
    }

    fn select_denominated(&self, mask: u32, max_value: Amount) -> Option<SelectedCoins> {
        let coins = self.available();
        let mut inputs = Vec::new();
        let mut values = Vec::new();
        for denom in decode_mask(mask) {
            let (outpoint, out) = coins.iter().find(|(_, out)| out.value == denom)?;
            inputs.push(MixInput::new(TxIn::new(*outpoint), out.script_pubkey.clone()));
            values.push(out.value);
        }
        let selected = SelectedCoins { inputs, values };
        if selected.inputs.is_empty() || selected.total() > max_value {
            return None;
        }
        Some(selected)
    }

    fn create_collateral(&self, fee: Amount) -> Option<Transaction> {
        let mut coins: Vec<(OutPoint, TxOut)> =
            self.available().into_iter().filter(|(_, out)| !is_denominated_amount(out.value) && out.value > fee).collect();
        coins.sort_by_key(|(_, out)| out.value);
        let (outpoint, prev) = coins.into_iter().next()?;

        let mut tx = Transaction::new(vec![TxIn::new(outpoint)], vec![TxOut::new(prev.value - fee, self.fresh_script())]);
        let key = self.key_for(&prev.script_pubkey)?;
        signer::sign_input(&mut tx, 0, &prev.script_pubkey, &key).ok()?;
        Some(tx)
    }

    fn sign_input(&self, tx: &mut Transaction, index: usize, prev_script: &Script) -> bool {
        let Some(key) = self.key_for(prev_script) else {
            return false;
        };
        signer::sign_input(tx, index, prev_script, &key).is_ok()
    }

    fn lock_coin(&self, outpoint: &OutPoint) {
        self.inner.lock().locked.insert(*outpoint);
    }

    fn unlock_coin(&self, outpoint: &OutPoint) {
        self.inner.lock().locked.remove(outpoint);
    }

    fn fresh_script(&self) -> Script {
        let mut inner = self.inner.lock();
        let key = derive_key(&self.seed, inner.keys.len() as u64);
        let script = Script::for_pubkey(&PublicKey::from_secret_key(SECP256K1, &key));
        inner.keys.push(key);
        inner.scripts.push(script.clone());
        script
    }
}

// ── Masternode list ─────────────────────────────────────────────────────

/// A fixed masternode list.
#[derive(Default)]
pub struct StaticDirectory {
    nodes: Vec<MasternodeInfo>,
}

impl StaticDirectory {
    pub fn new(nodes: Vec<MasternodeInfo>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[MasternodeInfo] {
        &self.nodes
    }
}

impl MasternodeDirectory for StaticDirectory {
    fn find(&self, input_ref: &OutPoint) -> Option<MasternodeInfo> {
        self.nodes.iter().find(|n| &n.input_ref == input_ref).cloned()
    }

    fn find_random_excluding(
        &self,
        exclude: &[OutPoint],
        min_protocol: u32,
        rng: &mut dyn RngCore,
    ) -> Option<MasternodeInfo> {
        let candidates: Vec<&MasternodeInfo> = self
            .nodes
            .iter()
            .filter(|n| n.protocol_version >= min_protocol && !exclude.contains(&n.input_ref))
            .collect();
        candidates.choose(rng).map(|n| (*n).clone())
    }

    fn count_eligible(&self, min_protocol: u32) -> usize {
        self.nodes.iter().filter(|n| n.protocol_version >= min_protocol).count()
    }
}

/// Fund a masternode collateral on `chain` and return its identity and
/// list entry.
pub fn register_masternode(chain: &MemoryChain, seed: &[u8], peer: PeerId) -> (MasternodeIdentity, MasternodeInfo) {
    let key = derive_key(seed, 0);
    let pubkey = PublicKey::from_secret_key(SECP256K1, &key);
    let input_ref = chain.fund(Script::for_pubkey(&pubkey), MASTERNODE_COLLATERAL);
    let info = MasternodeInfo { input_ref, peer, pubkey, protocol_version: PROTOCOL_VERSION };
    (MasternodeIdentity::new(input_ref, key), info)
}

// ── Cluster ─────────────────────────────────────────────────────────────

pub struct ClusterNode {
    pub pool: MixPool,
    pub link: LocalLink,
    pub wallet: Option<Arc<MemoryWallet>>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl ClusterNode {
    pub fn into_parts(self) -> (MixPool, LocalLink, mpsc::UnboundedReceiver<Envelope>) {
        (self.pool, self.link, self.inbox)
    }
}

/// Coordinators and participants on one [`LocalHub`], driven by hand.
///
/// Time only moves through [`Cluster::advance`]; messages are delivered by
/// [`Cluster::pump`] until the hub is quiet.
pub struct Cluster {
    pub hub: Arc<LocalHub>,
    pub chain: Arc<MemoryChain>,
    pub directory: Arc<StaticDirectory>,
    pub nodes: Vec<ClusterNode>,
    pub coordinators: usize,
    pub now: u64,
}

/// Delivery rounds after which `pump` gives up on a chatty network.
const MAX_PUMP_ROUNDS: usize = 1_000;

impl Cluster {
    /// `coordinators` masternodes followed by `participants` wallets, each
    /// wallet funded with `funding`.
    pub fn new(coordinators: usize, participants: usize, funding: &[Amount], config: MixConfig) -> Self {
        let hub = LocalHub::new();
        let chain = Arc::new(MemoryChain::new());

        let mut identities = Vec::new();
        let mut infos = Vec::new();
        for i in 0..coordinators {
            let peer = PeerId(i as u64 + 1);
            let (identity, info) = register_masternode(&chain, format!("masternode-{}", i).as_bytes(), peer);
            identities.push(identity);
            infos.push(info);
        }
        let directory = Arc::new(StaticDirectory::new(infos));

        let mut nodes = Vec::new();
        for (i, identity) in identities.into_iter().enumerate() {
            let (link, inbox) = hub.connect(PeerId(i as u64 + 1), PROTOCOL_VERSION);
            let services = Self::services(&chain, &directory, &link);
            let config = MixConfig { rng_seed: config.rng_seed.map(|s| s + i as u64), ..config.clone() };
            let pool = MixPool::coordinator(identity, services, config);
            nodes.push(ClusterNode { pool, link, wallet: None, inbox });
        }
        for j in 0..participants {
            let index = coordinators + j;
            let (link, inbox) = hub.connect(PeerId(index as u64 + 1), PROTOCOL_VERSION);
            let wallet = Arc::new(MemoryWallet::new(Arc::clone(&chain), format!("wallet-{}", j).as_bytes()));
            for value in funding {
                wallet.fund(*value);
            }
            let services = Self::services(&chain, &directory, &link);
            let config = MixConfig { rng_seed: config.rng_seed.map(|s| s + index as u64), ..config.clone() };
            let pool = MixPool::participant(Arc::clone(&wallet) as Arc<dyn MixWallet>, services, config);
            nodes.push(ClusterNode { pool, link, wallet: Some(wallet), inbox });
        }

        Self { hub, chain, directory, nodes, coordinators, now: 1_700_000_000_000 }
    }

    fn services(chain: &Arc<MemoryChain>, directory: &Arc<StaticDirectory>, link: &LocalLink) -> Services {
        Services {
            chain: Arc::clone(chain) as Arc<dyn ChainView>,
            directory: Arc::clone(directory) as Arc<dyn MasternodeDirectory>,
            network: Arc::new(link.clone()),
        }
    }

    pub fn coordinator(&self, i: usize) -> &MixPool {
        &self.nodes[i].pool
    }

    pub fn participant(&self, j: usize) -> &MixPool {
        &self.nodes[self.coordinators + j].pool
    }

    pub fn participant_mut(&mut self, j: usize) -> &mut MixPool {
        &mut self.nodes[self.coordinators + j].pool
    }

    pub fn wallet(&self, j: usize) -> Option<&Arc<MemoryWallet>> {
        self.nodes[self.coordinators + j].wallet.as_ref()
    }

    pub fn participant_peer(&self, j: usize) -> PeerId {
        self.nodes[self.coordinators + j].link.peer().id
    }

    pub fn into_nodes(self) -> Vec<ClusterNode> {
        self.nodes
    }

    /// Deliver queued messages until no inbox has anything left. Returns
    /// how many were delivered.
    pub fn pump(&mut self) -> usize {
        let now = self.now;
        let mut total = 0;
        for _ in 0..MAX_PUMP_ROUNDS {
            let mut delivered = 0;
            for node in self.nodes.iter_mut() {
                while let Ok(envelope) = node.inbox.try_recv() {
                    delivered += 1;
                    if let Message::Mix(msg) = envelope.message {
                        node.pool.process_message(&envelope.from, msg, now);
                    }
                }
            }
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
        tracing::warn!("Network still busy after {} rounds", MAX_PUMP_ROUNDS);
        total
    }

    /// Tick every node in order, delivering messages after each.
    pub fn tick_all(&mut self) {
        for i in 0..self.nodes.len() {
            self.nodes[i].pool.tick(self.now);
            self.pump();
        }
    }

    /// Move the clock forward and tick.
    pub fn advance(&mut self, ms: u64) {
        self.now += ms;
        self.tick_all();
    }

    /// Advance one tick interval at a time until `done` holds, for at most
    /// `max_ticks` ticks. Returns whether `done` was reached.
    pub fn run_until(&mut self, max_ticks: usize, done: impl Fn(&Cluster) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            let step = self.nodes.first().map_or(1_000, |n| n.pool.config().tick_interval_ms);
            self.advance(step);
        }
        done(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::COIN;
    use crate::mix::denom::STANDARD_DENOMINATIONS;

    #[test]
    fn mempool_checks_signatures_and_spends_inputs() {
        let chain = Arc::new(MemoryChain::new());
        let wallet = MemoryWallet::new(Arc::clone(&chain), b"w");
        let op = wallet.fund(COIN);
        let prev = chain.lookup_output(&op).unwrap();

        let mut tx = Transaction::new(vec![TxIn::new(op)], vec![TxOut::new(COIN, Script::p2pkh(&[1; 20]))]);
        assert!(chain.is_admissible(&tx));
        assert!(!chain.accept_to_mempool(&tx));

        assert!(wallet.sign_input(&mut tx, 0, &prev.script_pubkey));
        assert!(chain.accept_to_mempool(&tx));
        assert!(chain.is_spent(&op));
        assert!(!chain.is_admissible(&tx));
        assert!(chain.in_mempool(&tx.txid()));
    }

    #[test]
    fn wallet_selects_one_coin_per_denomination() {
        let chain = Arc::new(MemoryChain::new());
        let wallet = MemoryWallet::new(Arc::clone(&chain), b"w");
        wallet.fund(STANDARD_DENOMINATIONS[3]);
        wallet.fund(STANDARD_DENOMINATIONS[4]);
        wallet.fund(STANDARD_DENOMINATIONS[4]);

        let picked = wallet.select_denominated(0b11000, Amount::MAX).unwrap();
        assert_eq!(picked.values, vec![STANDARD_DENOMINATIONS[3], STANDARD_DENOMINATIONS[4]]);
        assert!(wallet.select_denominated(0b00100, Amount::MAX).is_none());

        for input in &picked.inputs {
            wallet.lock_coin(input.prevout());
        }
        assert_eq!(wallet.denominated_amounts(), vec![STANDARD_DENOMINATIONS[4]]);
    }

    #[test]
    fn collateral_pays_the_fee() {
        let chain = Arc::new(MemoryChain::new());
        let wallet = MemoryWallet::new(Arc::clone(&chain), b"w");
        wallet.fund(STANDARD_DENOMINATIONS[4]);
        assert!(wallet.create_collateral(COIN / 100).is_none());

        wallet.fund(COIN / 10);
        let tx = wallet.create_collateral(COIN / 100).unwrap();
        assert_eq!(tx.value_out(), COIN / 10 - COIN / 100);
        assert!(chain.accept_to_mempool(&tx));
    }

    #[test]
    fn directory_respects_exclusions_and_versions() {
        let chain = MemoryChain::new();
        let (_, a) = register_masternode(&chain, b"a", PeerId(1));
        let (_, mut b) = register_masternode(&chain, b"b", PeerId(2));
        b.protocol_version = 1;
        let directory = StaticDirectory::new(vec![a.clone(), b]);
        let mut rng = rand::thread_rng();

        assert_eq!(directory.count_eligible(PROTOCOL_VERSION), 1);
        assert_eq!(directory.find_random_excluding(&[], PROTOCOL_VERSION, &mut rng), Some(a.clone()));
        assert_eq!(directory.find_random_excluding(&[a.input_ref], PROTOCOL_VERSION, &mut rng), None);
    }
}
