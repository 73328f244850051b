use thiserror::Error;

/// Reasons a transaction is refused by a node.
///
/// None of these are fatal: a rejected transaction is dropped and logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// The transaction carries no signature at all.
    #[error("Missing signature for transaction {0}")]
    MissingSignature(String),

    /// The signature does not match the sender and content.
    #[error("Invalid signature for transaction {0}")]
    InvalidSignature(String),

    /// The id does not hash back to the transaction content.
    #[error("Transaction id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: String, got: String },

    #[error("Transaction amount must be greater than 0")]
    ZeroAmount,

    /// The sender cannot cover the amount in the current ledger snapshot.
    #[error("Insufficient balance for {address}: has {balance}, needs {amount}")]
    InsufficientBalance { address: String, balance: u64, amount: u64 },

    /// The nonce is not the next one expected for the sender.
    #[error("Nonce mismatch for {address}: expected {expected}, got {got}")]
    NonceMismatch { address: String, expected: u64, got: u64 },

    #[error("Transaction already known: {0}")]
    Duplicate(String),

    /// The transaction is already part of a locally stored block.
    #[error("Transaction already committed: {0}")]
    AlreadyCommitted(String),
}
