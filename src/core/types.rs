use serde::{Deserialize, Serialize};
use std::fmt;

use super::script::Script;

/// Hash a byte slice with BLAKE3.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Concatenate two byte slices and hash them with BLAKE3.
pub fn hash_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(a);
    hasher.update(b);
    *hasher.finalize().as_bytes()
}

/// 20-byte key/script hash used by payment scripts: the first 20 bytes of BLAKE3.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let full = hash(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&full[..20]);
    out
}

// ── Amounts ─────────────────────────────────────────────────────────────────

/// Signed base-unit amount. Negative values only ever appear as the result of
/// malformed peer input and are rejected on sight.
pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// Render an amount the way wallets display it: at least two decimals,
/// trailing zeros beyond that trimmed.
pub fn format_money(amount: Amount) -> String {
    let neg = amount < 0;
    let abs = amount.unsigned_abs();
    let whole = abs / COIN as u64;
    let frac = abs % COIN as u64;
    let mut s = format!("{}.{:08}", whole, frac);
    while s.ends_with('0') && s.len() - s.find('.').map_or(0, |p| p + 1) > 2 {
        s.pop();
    }
    if neg {
        format!("-{}", s)
    } else {
        s
    }
}

// ── Transaction model ───────────────────────────────────────────────────────

/// Reference to a prior transaction output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub vout: u32,
}

impl OutPoint {
    pub const NULL: OutPoint = OutPoint { txid: [0u8; 32], vout: u32::MAX };

    pub fn new(txid: [u8; 32], vout: u32) -> Self {
        Self { txid, vout }
    }

    pub fn is_null(&self) -> bool {
        self.txid == [0u8; 32] && self.vout == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hex::encode(self.txid), self.vout)
    }
}

pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    /// Unsigned input spending `prevout`.
    pub fn new(prevout: OutPoint) -> Self {
        Self { prevout, script_sig: Vec::new(), sequence: SEQUENCE_FINAL }
    }

    /// Same input with its signature stripped.
    pub fn unsigned(&self) -> Self {
        Self { prevout: self.prevout, script_sig: Vec::new(), sequence: self.sequence }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Script) -> Self {
        Self { value, script_pubkey }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        Self { version: TX_VERSION, inputs, outputs, lock_time: 0 }
    }

    /// BLAKE3 over the canonical bincode encoding, signatures included.
    pub fn txid(&self) -> [u8; 32] {
        // Serializing plain owned data into a Vec cannot fail.
        let bytes = bincode::serialize(self).unwrap_or_default();
        hash(&bytes)
    }

    pub fn value_out(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}

// ── Protocol constants ──────────────────────────────────────────────────────

pub const TX_VERSION: u32 = 1;
