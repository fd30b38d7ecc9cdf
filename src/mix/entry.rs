//! Participant submissions held for the current session.

use serde::{Deserialize, Serialize};

use super::denom::denominations_mask;
use super::error::PoolError;
use crate::core::script::Script;
use crate::core::types::{Amount, OutPoint, Transaction, TxIn, TxOut};

/// One input offered to the mix, with the script of the output it spends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixInput {
    pub txin: TxIn,
    pub prev_script: Script,
    pub has_sig: bool,
}

impl MixInput {
    pub fn new(txin: TxIn, prev_script: Script) -> Self {
        Self { txin: txin.unsigned(), prev_script, has_sig: false }
    }

    pub fn prevout(&self) -> &OutPoint {
        &self.txin.prevout
    }

    /// Same input as it appears in a transaction: prevout and sequence.
    pub fn matches(&self, txin: &TxIn) -> bool {
        self.txin.prevout == txin.prevout && self.txin.sequence == txin.sequence
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub inputs: Vec<MixInput>,
    pub amount: Amount,
    pub collateral: Transaction,
    pub outputs: Vec<TxOut>,
    /// Milliseconds since the epoch.
    pub added_at: u64,
}

impl Entry {
    pub fn new(inputs: Vec<MixInput>, amount: Amount, collateral: Transaction, outputs: Vec<TxOut>, now: u64) -> Self {
        Self { inputs, amount, collateral, outputs, added_at: now }
    }

    pub fn denominations(&self) -> u32 {
        denominations_mask(&self.outputs)
    }

    pub fn is_expired(&self, now: u64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.added_at) > ttl_ms
    }

    pub fn is_fully_signed(&self) -> bool {
        self.inputs.iter().all(|i| i.has_sig)
    }

    pub fn spends(&self, outpoint: &OutPoint) -> bool {
        self.inputs.iter().any(|i| i.prevout() == outpoint)
    }

    /// Record a verified signature. False if the input is not ours or was
    /// already signed.
    pub fn add_sig(&mut self, signed: &TxIn) -> bool {
        for input in self.inputs.iter_mut() {
            if input.matches(signed) {
                if input.has_sig {
                    return false;
                }
                input.txin.script_sig = signed.script_sig.clone();
                input.has_sig = true;
                return true;
            }
        }
        false
    }
}

/// Accepted entries of one session.
#[derive(Debug)]
pub struct EntryStore {
    entries: Vec<Entry>,
    capacity: usize,
}

impl EntryStore {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::new(), capacity }
    }

    /// Store `entry`. Its inputs must be distinct from each other and from
    /// every input already stored.
    pub fn add(&mut self, entry: Entry) -> Result<(), PoolError> {
        if let Some(dup) = self.first_known_input(&entry.inputs) {
            tracing::debug!("Rejecting entry: input {} already in session", dup);
            return Err(PoolError::AlreadyHave);
        }
        for (i, input) in entry.inputs.iter().enumerate() {
            if entry.inputs[..i].iter().any(|earlier| earlier.prevout() == input.prevout()) {
                return Err(PoolError::AlreadyHave);
            }
        }
        if self.entries.len() >= self.capacity {
            return Err(PoolError::EntriesFull);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// First of `inputs` already spent by a stored entry.
    pub fn first_known_input(&self, inputs: &[MixInput]) -> Option<OutPoint> {
        inputs.iter().map(|i| *i.prevout()).find(|op| self.contains_input(op))
    }

    pub fn contains_input(&self, outpoint: &OutPoint) -> bool {
        self.entries.iter().any(|e| e.spends(outpoint))
    }

    /// Outputs may join only if they encode to a non-zero mask equal to
    /// that of every stored entry.
    pub fn is_compatible(&self, outputs: &[TxOut]) -> bool {
        let mask = denominations_mask(outputs);
        mask != 0 && self.entries.iter().all(|e| e.denominations() == mask)
    }

    pub fn has_collateral(&self, collateral: &Transaction) -> bool {
        self.entries.iter().any(|e| &e.collateral == collateral)
    }

    /// Mark the matching input signed. False if no stored input matches or
    /// it already carries a signature.
    pub fn add_signature(&mut self, signed: &TxIn) -> bool {
        self.entries.iter_mut().any(|e| e.add_sig(signed))
    }

    pub fn find_input(&self, txin: &TxIn) -> Option<&MixInput> {
        self.entries.iter().flat_map(|e| e.inputs.iter()).find(|i| i.matches(txin))
    }

    pub fn all_signatures_complete(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(Entry::is_fully_signed)
    }

    /// Drop entries older than `ttl_ms`. Returns how many were removed.
    pub fn expire(&mut self, now: u64, ttl_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_expired(now, ttl_ms));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mix::denom::STANDARD_DENOMINATIONS;

    fn input(tag: u8, vout: u32) -> MixInput {
        MixInput::new(TxIn::new(OutPoint::new([tag; 32], vout)), Script::p2pkh(&[tag; 20]))
    }

    fn entry(inputs: Vec<MixInput>, denoms: &[usize], now: u64) -> Entry {
        let outputs = denoms
            .iter()
            .map(|d| TxOut::new(STANDARD_DENOMINATIONS[*d], Script::p2pkh(&[0xee; 20])))
            .collect();
        Entry::new(inputs, 0, Transaction::default(), outputs, now)
    }

    fn signed(input: &MixInput) -> TxIn {
        TxIn { script_sig: vec![1; 4], ..input.txin.clone() }
    }

    // ── Add ─────────────────────────────────────────────────────────────

    #[test]
    fn rejects_duplicate_input_across_entries() {
        let mut store = EntryStore::new(3);
        store.add(entry(vec![input(1, 0)], &[0], 0)).unwrap();
        let err = store.add(entry(vec![input(2, 0), input(1, 0)], &[0], 0)).unwrap_err();
        assert_eq!(err, PoolError::AlreadyHave);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rejects_duplicate_input_within_entry() {
        let mut store = EntryStore::new(3);
        let err = store.add(entry(vec![input(1, 0), input(1, 0)], &[0], 0)).unwrap_err();
        assert_eq!(err, PoolError::AlreadyHave);
    }

    #[test]
    fn duplicate_wins_over_full() {
        let mut store = EntryStore::new(1);
        store.add(entry(vec![input(1, 0)], &[0], 0)).unwrap();
        assert_eq!(store.add(entry(vec![input(1, 0)], &[0], 0)), Err(PoolError::AlreadyHave));
        assert_eq!(store.add(entry(vec![input(2, 0)], &[0], 0)), Err(PoolError::EntriesFull));
    }

    // ── Compatibility ───────────────────────────────────────────────────

    #[test]
    fn compatibility_requires_equal_masks() {
        let mut store = EntryStore::new(3);
        store.add(entry(vec![input(1, 0)], &[0, 2], 0)).unwrap();
        store.add(entry(vec![input(2, 0)], &[0, 2], 0)).unwrap();

        let same: Vec<TxOut> = entry(vec![], &[2, 0, 0], 0).outputs;
        let other: Vec<TxOut> = entry(vec![], &[1, 2], 0).outputs;
        assert!(store.is_compatible(&same));
        assert!(!store.is_compatible(&other));
        assert!(!store.is_compatible(&[]));
    }

    // ── Signatures ──────────────────────────────────────────────────────

    #[test]
    fn signatures_complete_in_any_order() {
        let mut store = EntryStore::new(3);
        let a = vec![input(1, 0), input(1, 1)];
        let b = vec![input(2, 0)];
        store.add(entry(a.clone(), &[0], 0)).unwrap();
        store.add(entry(b.clone(), &[0], 0)).unwrap();

        let order = [&b[0], &a[1], &a[0]];
        for (n, i) in order.iter().enumerate() {
            assert!(!store.all_signatures_complete(), "complete after {} of 3", n);
            assert!(store.add_signature(&signed(i)));
        }
        assert!(store.all_signatures_complete());
    }

    #[test]
    fn signature_applies_once() {
        let mut store = EntryStore::new(3);
        let a = vec![input(1, 0)];
        store.add(entry(a.clone(), &[0], 0)).unwrap();
        assert!(store.add_signature(&signed(&a[0])));
        assert!(!store.add_signature(&signed(&a[0])));
        assert!(!store.add_signature(&signed(&input(9, 9))));
    }

    #[test]
    fn empty_store_is_not_complete() {
        assert!(!EntryStore::new(3).all_signatures_complete());
    }

    // ── Expiry ──────────────────────────────────────────────────────────

    #[test]
    fn expire_drops_only_old_entries() {
        let mut store = EntryStore::new(3);
        store.add(entry(vec![input(1, 0)], &[0], 1_000)).unwrap();
        store.add(entry(vec![input(2, 0)], &[0], 20_000)).unwrap();
        assert_eq!(store.expire(31_500, 30_000), 1);
        assert_eq!(store.len(), 1);
        assert!(store.contains_input(&OutPoint::new([2; 32], 0)));
        assert_eq!(store.expire(60_000, 30_000), 1);
        assert!(store.is_empty());
    }
}
