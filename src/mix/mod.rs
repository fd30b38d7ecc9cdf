//! Coin mixing sessions.
//!
//! A masternode acting as coordinator collects one entry from each of a
//! fixed number of participants, merges them into a single transaction
//! whose inputs and outputs are shuffled, gathers every participant's
//! signature and submits the result. Participants pledge a collateral
//! transaction that the coordinator may forfeit if they stall the session.

pub mod charger;
pub mod collateral;
mod coordinator;
pub mod denom;
pub mod entry;
pub mod error;
mod participant;
pub mod pool;
pub mod queue;
pub mod services;
pub mod signer;

pub use error::PoolError;
pub use pool::{Acceptance, MasternodeIdentity, MixPool, PoolSnapshot, PoolState, Services};
