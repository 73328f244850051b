pub mod errors;
pub mod types;
pub mod validation;

pub use errors::TransactionError;
pub use types::{Transaction, TxState};
pub use validation::TransactionValidator;
