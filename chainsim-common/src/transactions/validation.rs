use super::{errors::TransactionError, types::Transaction};

pub struct TransactionValidator;

impl TransactionValidator {
    /// Performs stateless validation checks:
    /// 1. Amount > 0.
    /// 2. Id matches content.
    /// 3. Signature present and valid for the sender.
    ///
    /// Balance and nonce checks need a ledger snapshot and live in the ledger crate.
    pub fn validate_stateless(tx: &Transaction) -> Result<(), TransactionError> {
        if tx.amount == 0 {
            return Err(TransactionError::ZeroAmount);
        }

        let expected = tx.expected_id();
        if tx.id != expected {
            return Err(TransactionError::IdMismatch { expected, got: tx.id.clone() });
        }

        if tx.signature.is_empty() {
            return Err(TransactionError::MissingSignature(tx.id.clone()));
        }
        if !tx.has_valid_signature() {
            return Err(TransactionError::InvalidSignature(tx.id.clone()));
        }

        Ok(())
    }
}
