//! Collaborators the mixing pool talks to but does not own.
//!
//! All methods take `&self`; implementations keep their own interior
//! locking so one instance can be shared between a pool and its caller.

use rand::RngCore;
use secp256k1::PublicKey;

use super::entry::MixInput;
use crate::core::script::Script;
use crate::core::types::{Amount, OutPoint, Transaction, TxOut};
use crate::network::{MixMessage, PeerId};

/// Coins picked by the wallet for one entry.
#[derive(Clone, Debug)]
pub struct SelectedCoins {
    pub inputs: Vec<MixInput>,
    /// Value of each input, index-aligned with `inputs`.
    pub values: Vec<Amount>,
}

impl SelectedCoins {
    pub fn total(&self) -> Amount {
        self.values.iter().sum()
    }
}

pub trait MixWallet: Send + Sync {
    fn is_locked(&self) -> bool;

    /// Values of the spendable, unlocked denominated coins.
    fn denominated_amounts(&self) -> Vec<Amount>;

    /// One unlocked coin for every denomination in `mask`, totalling at most
    /// `max_value`. `None` if some denomination cannot be covered.
    fn select_denominated(&self, mask: u32, max_value: Amount) -> Option<SelectedCoins>;

    /// A signed transaction paying `fee` to the network, to be pledged as
    /// collateral.
    fn create_collateral(&self, fee: Amount) -> Option<Transaction>;

    /// Sign input `index` of `tx` in place. False if the wallet does not own
    /// `prev_script`.
    fn sign_input(&self, tx: &mut Transaction, index: usize, prev_script: &Script) -> bool;

    fn lock_coin(&self, outpoint: &OutPoint);

    fn unlock_coin(&self, outpoint: &OutPoint);

    /// A never-before-used destination for a mixed output.
    fn fresh_script(&self) -> Script;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasternodeInfo {
    pub input_ref: OutPoint,
    pub peer: PeerId,
    pub pubkey: PublicKey,
    pub protocol_version: u32,
}

pub trait MasternodeDirectory: Send + Sync {
    fn find(&self, input_ref: &OutPoint) -> Option<MasternodeInfo>;

    /// A random masternode at or above `min_protocol` whose input is not in
    /// `exclude`.
    fn find_random_excluding(
        &self,
        exclude: &[OutPoint],
        min_protocol: u32,
        rng: &mut dyn RngCore,
    ) -> Option<MasternodeInfo>;

    fn count_eligible(&self, min_protocol: u32) -> usize;
}

/// Read access to confirmed outputs plus mempool admission.
pub trait ChainView: Send + Sync {
    fn lookup_output(&self, outpoint: &OutPoint) -> Option<TxOut>;

    /// Whether `tx` would be accepted if it were signed: inputs exist and are
    /// unspent, and values balance. Does not check signatures.
    fn is_admissible(&self, tx: &Transaction) -> bool;

    /// Fully validate and add `tx` to the mempool.
    fn accept_to_mempool(&self, tx: &Transaction) -> bool;
}

/// Fire-and-forget sends to already connected peers.
pub trait NetworkSink: Send + Sync {
    fn push_message(&self, peer: PeerId, msg: MixMessage);

    fn broadcast(&self, msg: MixMessage);

    fn broadcast_inventory(&self, txid: [u8; 32]);
}
