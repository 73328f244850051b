pub mod hash;
pub mod signing;

pub use hash::{digest, hash_to_range};
