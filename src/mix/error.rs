use serde::{Deserialize, Serialize};

/// Reason codes carried in status updates and returned from every
/// coordinator/participant operation.
///
/// The `Display` text is what peers and users see.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum PoolError {
    #[error("Incompatible version.")]
    Version,

    #[error("This is not a masternode.")]
    NotAMasternode,
    #[error("Not in the masternode list.")]
    MnList,
    #[error("Wallet is locked.")]
    WalletLocked,
    #[error("No matching denominations found for mixing.")]
    Denom,
    #[error("Incompatible mode.")]
    Mode,
    #[error("Last queue was too recent.")]
    Recent,

    #[error("Collateral not valid.")]
    InvalidCollateral,
    #[error("Input is not valid.")]
    InvalidInput,
    #[error("Already have input.")]
    AlreadyHave,
    #[error("Invalid script detected.")]
    InvalidScript,
    #[error("Non-standard public key detected.")]
    NonStandardPubkey,
    #[error("Transaction fees are too high.")]
    Fees,
    #[error("Value more than mixing pool maximum allows.")]
    Maximum,
    #[error("Missing input transaction information.")]
    MissingTx,
    #[error("Transaction not valid.")]
    InvalidTx,
    #[error("Signature verification failed.")]
    InvalidSignature,
    #[error("Not compatible with existing transactions.")]
    ExistingTx,

    #[error("Masternode queue is full.")]
    QueueFull,
    #[error("Entries are full.")]
    EntriesFull,
    #[error("Session not complete!")]
    Session,

    #[error("Session mismatch.")]
    SessionMismatch,
    #[error("My outputs are missing from the final transaction.")]
    OutputsMissing,

    #[error("Session timed out.")]
    Timeout,
    #[error("Signing timed out.")]
    SigningTimeout,
}

/// Error taxonomy used to decide how a failure propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Version,
    Capability,
    Validation,
    Capacity,
    Consistency,
    Timeout,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        use PoolError::*;
        match self {
            Version => ErrorKind::Version,
            NotAMasternode | MnList | WalletLocked | Denom | Mode | Recent => ErrorKind::Capability,
            InvalidCollateral | InvalidInput | AlreadyHave | InvalidScript | NonStandardPubkey
            | Fees | Maximum | MissingTx | InvalidTx | InvalidSignature | ExistingTx => {
                ErrorKind::Validation
            }
            QueueFull | EntriesFull | Session => ErrorKind::Capacity,
            SessionMismatch | OutputsMissing => ErrorKind::Consistency,
            Timeout | SigningTimeout => ErrorKind::Timeout,
        }
    }

    /// Consistency and timeout failures abandon the session; everything
    /// else is reported back to the caller and leaves local state alone.
    pub fn aborts_session(&self) -> bool {
        matches!(self.kind(), ErrorKind::Consistency | ErrorKind::Timeout)
    }
}

/// Message shown after a successful mix.
pub const MSG_SUCCESS: &str = "Transaction created successfully.";
/// Message shown after an entry was taken.
pub const MSG_ENTRIES_ADDED: &str = "Your entries added successfully.";
