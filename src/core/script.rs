//! Output scripts and the per-input signature hash.
//!
//! Only the two "normal" payment templates are modelled: pay-to-pubkey-hash
//! and pay-to-script-hash. Anything else is carried as opaque bytes and
//! rejected wherever a normal payment script is required.

use serde::{Deserialize, Serialize};

use super::types::{hash160, Transaction};

pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_RETURN: u8 = 0x6a;
const PUSH_20: u8 = 0x14;

/// Signs this input and every output; other inputs are not committed to.
pub const SIGHASH_ALL_ANYONECANPAY: u8 = 0x81;

/// Length of a standard pay-to-pubkey-hash script.
pub const P2PKH_LEN: usize = 25;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Script(pub Vec<u8>);

impl Script {
    /// OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    pub fn p2pkh(pubkey_hash: &[u8; 20]) -> Self {
        let mut s = Vec::with_capacity(P2PKH_LEN);
        s.extend_from_slice(&[OP_DUP, OP_HASH160, PUSH_20]);
        s.extend_from_slice(pubkey_hash);
        s.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        Script(s)
    }

    /// OP_HASH160 <20> OP_EQUAL
    pub fn p2sh(script_hash: &[u8; 20]) -> Self {
        let mut s = Vec::with_capacity(23);
        s.extend_from_slice(&[OP_HASH160, PUSH_20]);
        s.extend_from_slice(script_hash);
        s.push(OP_EQUAL);
        Script(s)
    }

    pub fn for_pubkey(pubkey: &secp256k1::PublicKey) -> Self {
        Self::p2pkh(&hash160(&pubkey.serialize()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_p2pkh(&self) -> bool {
        let s = &self.0;
        s.len() == P2PKH_LEN
            && s[0] == OP_DUP
            && s[1] == OP_HASH160
            && s[2] == PUSH_20
            && s[23] == OP_EQUALVERIFY
            && s[24] == OP_CHECKSIG
    }

    pub fn is_p2sh(&self) -> bool {
        let s = &self.0;
        s.len() == 23 && s[0] == OP_HASH160 && s[1] == PUSH_20 && s[22] == OP_EQUAL
    }

    pub fn is_normal_payment_script(&self) -> bool {
        self.is_p2pkh() || self.is_p2sh()
    }

    /// The key hash a p2pkh script pays to.
    pub fn pubkey_hash(&self) -> Option<[u8; 20]> {
        if !self.is_p2pkh() {
            return None;
        }
        let mut h = [0u8; 20];
        h.copy_from_slice(&self.0[3..23]);
        Some(h)
    }
}

/// Digest an input signature commits to.
///
/// Covers the transaction version and lock time, every output, and the
/// signed input's own prevout, sequence and prior script. Returns `None` if
/// `index` is out of range.
pub fn signature_hash(tx: &Transaction, index: usize, prev_script: &Script) -> Option<[u8; 32]> {
    let input = tx.inputs.get(index)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(&tx.version.to_le_bytes());
    hasher.update(&input.prevout.txid);
    hasher.update(&input.prevout.vout.to_le_bytes());
    hasher.update(&input.sequence.to_le_bytes());
    hasher.update(&(prev_script.len() as u64).to_le_bytes());
    hasher.update(&prev_script.0);
    hasher.update(&(tx.outputs.len() as u64).to_le_bytes());
    for out in &tx.outputs {
        hasher.update(&out.value.to_le_bytes());
        hasher.update(&(out.script_pubkey.len() as u64).to_le_bytes());
        hasher.update(&out.script_pubkey.0);
    }
    hasher.update(&tx.lock_time.to_le_bytes());
    hasher.update(&[SIGHASH_ALL_ANYONECANPAY]);
    Some(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OutPoint, TxIn, TxOut, COIN};

    #[test]
    fn p2pkh_layout() {
        let s = Script::p2pkh(&[7u8; 20]);
        assert_eq!(s.len(), P2PKH_LEN);
        assert!(s.is_p2pkh());
        assert!(s.is_normal_payment_script());
        assert_eq!(s.pubkey_hash(), Some([7u8; 20]));
    }

    #[test]
    fn p2sh_is_normal_but_has_no_pubkey_hash() {
        let s = Script::p2sh(&[1u8; 20]);
        assert!(s.is_normal_payment_script());
        assert_eq!(s.pubkey_hash(), None);
    }

    #[test]
    fn data_carrier_is_not_normal() {
        let s = Script(vec![OP_RETURN, 0x01, 0xff]);
        assert!(!s.is_normal_payment_script());
    }

    #[test]
    fn sighash_ignores_other_inputs() {
        let out = TxOut::new(COIN, Script::p2pkh(&[3u8; 20]));
        let mine = TxIn::new(OutPoint::new([1u8; 32], 0));
        let theirs = TxIn::new(OutPoint::new([2u8; 32], 1));
        let prev = Script::p2pkh(&[9u8; 20]);

        let solo = Transaction::new(vec![mine.clone()], vec![out.clone()]);
        let mixed = Transaction::new(vec![theirs, mine], vec![out]);

        assert_eq!(signature_hash(&solo, 0, &prev), signature_hash(&mixed, 1, &prev));
    }

    #[test]
    fn sighash_commits_to_outputs() {
        let input = TxIn::new(OutPoint::new([1u8; 32], 0));
        let prev = Script::p2pkh(&[9u8; 20]);
        let a = Transaction::new(vec![input.clone()], vec![TxOut::new(COIN, Script::p2pkh(&[3u8; 20]))]);
        let b = Transaction::new(vec![input], vec![TxOut::new(COIN, Script::p2pkh(&[4u8; 20]))]);
        assert_ne!(signature_hash(&a, 0, &prev), signature_hash(&b, 0, &prev));
        assert_eq!(signature_hash(&a, 5, &prev), None);
    }
}
