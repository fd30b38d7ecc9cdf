use super::error::PoolError;
use super::services::ChainView;
use crate::core::types::{Amount, Transaction};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CollateralError {
    #[error("collateral has no outputs")]
    NoOutputs,
    #[error("collateral lock time must be zero")]
    LockTime,
    #[error("collateral output {0} has a non-standard script")]
    NonStandardScript(usize),
    #[error("collateral spends unknown outputs")]
    UnknownInputs,
    #[error("collateral pays {paid} in fees, {required} required")]
    InsufficientFee { paid: Amount, required: Amount },
    #[error("collateral not accepted by mempool")]
    NotAdmissible,
}

impl From<CollateralError> for PoolError {
    fn from(_: CollateralError) -> Self {
        PoolError::InvalidCollateral
    }
}

/// Check that `tx` is a usable collateral: it pays at least `min_fee` to the
/// network through normal scripts and would enter the mempool as-is.
pub fn validate_collateral(tx: &Transaction, chain: &dyn ChainView, min_fee: Amount) -> Result<(), CollateralError> {
    if tx.outputs.is_empty() {
        return Err(CollateralError::NoOutputs);
    }
    if tx.lock_time != 0 {
        return Err(CollateralError::LockTime);
    }
    if let Some(i) = tx.outputs.iter().position(|o| !o.script_pubkey.is_normal_payment_script()) {
        return Err(CollateralError::NonStandardScript(i));
    }

    let mut value_in: Amount = 0;
    for input in &tx.inputs {
        match chain.lookup_output(&input.prevout) {
            Some(prev) => value_in += prev.value,
            None => return Err(CollateralError::UnknownInputs),
        }
    }
    let paid = value_in - tx.value_out();
    if paid < min_fee {
        tracing::debug!("Collateral pays {} < {}", paid, min_fee);
        return Err(CollateralError::InsufficientFee { paid, required: min_fee });
    }

    if !chain.is_admissible(tx) {
        return Err(CollateralError::NotAdmissible);
    }
    Ok(())
}
