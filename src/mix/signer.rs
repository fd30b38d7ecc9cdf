//! Message signing for queue announcements and broadcast records, and the
//! ownership proofs attached to mix inputs.
//!
//! Both use secp256k1 ECDSA. Messages are signed over
//! `BLAKE3(MESSAGE_MAGIC || payload)`; inputs over [`signature_hash`].

use anyhow::{bail, Result};
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};

use crate::core::script::{signature_hash, Script, SIGHASH_ALL_ANYONECANPAY};
use crate::core::types::{hash160, hash_concat, Transaction};

pub const MESSAGE_MAGIC: &[u8] = b"Mixnode Signed Message:\n";

const COMPACT_SIG_LEN: usize = 64;
const PUBKEY_LEN: usize = 33;
/// compact signature, hash type byte, compressed public key
pub const SCRIPT_SIG_LEN: usize = COMPACT_SIG_LEN + 1 + PUBKEY_LEN;

pub fn message_digest(payload: &[u8]) -> [u8; 32] {
    hash_concat(MESSAGE_MAGIC, payload)
}

pub fn sign_message(payload: &[u8], key: &SecretKey) -> Vec<u8> {
    let msg = Message::from_digest(message_digest(payload));
    SECP256K1.sign_ecdsa(&msg, key).serialize_compact().to_vec()
}

pub fn verify_message(pubkey: &PublicKey, signature: &[u8], payload: &[u8]) -> bool {
    let Ok(sig) = Signature::from_compact(signature) else {
        return false;
    };
    let msg = Message::from_digest(message_digest(payload));
    SECP256K1.verify_ecdsa(&msg, &sig, pubkey).is_ok()
}

/// Parse a hex-encoded secret key, returning it with its public key.
pub fn parse_key(secret_hex: &str) -> Result<(SecretKey, PublicKey)> {
    let bytes = hex::decode(secret_hex.trim())?;
    if bytes.len() != 32 {
        bail!("secret key must be 32 bytes, got {}", bytes.len());
    }
    let secret = SecretKey::from_slice(&bytes)?;
    Ok((secret, PublicKey::from_secret_key(SECP256K1, &secret)))
}

/// Sign input `index` of `tx` in place.
pub fn sign_input(tx: &mut Transaction, index: usize, prev_script: &Script, key: &SecretKey) -> Result<()> {
    let pubkey = PublicKey::from_secret_key(SECP256K1, key);
    if prev_script.pubkey_hash() != Some(hash160(&pubkey.serialize())) {
        bail!("key does not own the script being spent");
    }
    let Some(digest) = signature_hash(tx, index, prev_script) else {
        bail!("input index {} out of range", index);
    };
    let sig = SECP256K1.sign_ecdsa(&Message::from_digest(digest), key);

    let mut script_sig = Vec::with_capacity(SCRIPT_SIG_LEN);
    script_sig.extend_from_slice(&sig.serialize_compact());
    script_sig.push(SIGHASH_ALL_ANYONECANPAY);
    script_sig.extend_from_slice(&pubkey.serialize());
    tx.inputs[index].script_sig = script_sig;
    Ok(())
}

/// Check that input `index` carries a valid ownership proof for
/// `prev_script` against exactly this transaction.
pub fn verify_input(tx: &Transaction, index: usize, prev_script: &Script) -> bool {
    let Some(input) = tx.inputs.get(index) else {
        return false;
    };
    let script_sig = &input.script_sig;
    if script_sig.len() != SCRIPT_SIG_LEN || script_sig[COMPACT_SIG_LEN] != SIGHASH_ALL_ANYONECANPAY {
        return false;
    }
    let Ok(pubkey) = PublicKey::from_slice(&script_sig[COMPACT_SIG_LEN + 1..]) else {
        return false;
    };
    if prev_script.pubkey_hash() != Some(hash160(&pubkey.serialize())) {
        return false;
    }
    let Ok(sig) = Signature::from_compact(&script_sig[..COMPACT_SIG_LEN]) else {
        return false;
    };
    let Some(digest) = signature_hash(tx, index, prev_script) else {
        return false;
    };
    SECP256K1.verify_ecdsa(&Message::from_digest(digest), &sig, &pubkey).is_ok()
}
