//! Collateral forfeiture for participants that stall a session.
//!
//! Charging is probabilistic so that a single dropped connection rarely
//! costs anything, while a participant that repeatedly joins and walks away
//! pays on average. All rolls come from the caller's RNG.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::entry::EntryStore;
use super::pool::PoolState;
use crate::core::types::Transaction;

/// Percentages in `0..=100`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargePolicy {
    /// Chance that a failed session is looked at all.
    pub charge_percent: u32,
    /// When nearly everyone offended, chance of still charging.
    pub mostly_offending_skip_percent: u32,
    /// With several offenders, the chosen one is charged only if a roll
    /// reaches this value.
    pub multi_offender_threshold: u32,
    /// Chance of charging one random collateral after a successful session.
    pub success_charge_percent: u32,
}

impl Default for ChargePolicy {
    fn default() -> Self {
        Self {
            charge_percent: 33,
            mostly_offending_skip_percent: 33,
            multi_offender_threshold: 50,
            success_charge_percent: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offence {
    /// Pledged collateral but never sent an entry.
    MissingEntry,
    /// Sent an entry but did not sign all of its inputs.
    MissingSignature,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Charge {
    pub collateral: Transaction,
    pub offence: Offence,
}

/// Participants at fault for a session stalled in `state`.
pub fn find_offenders(state: PoolState, pledged: &[Transaction], entries: &EntryStore) -> Vec<Charge> {
    match state {
        PoolState::AcceptingEntries => pledged
            .iter()
            .filter(|c| !entries.has_collateral(c))
            .map(|c| Charge { collateral: c.clone(), offence: Offence::MissingEntry })
            .collect(),
        PoolState::Signing => entries
            .iter()
            .filter(|e| !e.is_fully_signed())
            .map(|e| Charge { collateral: e.collateral.clone(), offence: Offence::MissingSignature })
            .collect(),
        _ => Vec::new(),
    }
}

fn roll<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.gen_range(0..100)
}

/// Decide which single collateral, if any, to forfeit for a failed session.
pub fn charge_failed_session<R: Rng + ?Sized>(
    policy: &ChargePolicy,
    state: PoolState,
    pledged: &[Transaction],
    entries: &EntryStore,
    max_participants: usize,
    rng: &mut R,
) -> Option<Charge> {
    if roll(rng) >= policy.charge_percent {
        return None;
    }

    let offenders = find_offenders(state, pledged, entries);
    if offenders.is_empty() {
        return None;
    }
    // Everyone failing at once points at the network, not the participants.
    if offenders.len() >= max_participants {
        return None;
    }
    if offenders.len() + 1 >= max_participants && roll(rng) >= policy.mostly_offending_skip_percent {
        return None;
    }

    let chosen = offenders.choose(rng)?.clone();
    if offenders.len() > 1 && roll(rng) < policy.multi_offender_threshold {
        return None;
    }
    tracing::info!("Charging collateral {} ({:?})", hex::encode(chosen.collateral.txid()), chosen.offence);
    Some(chosen)
}

/// After a successful session, occasionally forfeit one random collateral.
pub fn charge_random_fee<R: Rng + ?Sized>(policy: &ChargePolicy, pledged: &[Transaction], rng: &mut R) -> Option<Transaction> {
    if pledged.is_empty() || roll(rng) >= policy.success_charge_percent {
        return None;
    }
    pledged.choose(rng).cloned()
}
