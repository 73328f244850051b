//! Simulated signatures.
//!
//! A signature is a digest over the signer and the message. It proves nothing
//! cryptographically; it only lets nodes tell signed payloads from unsigned or
//! tampered ones.

use super::hash::digest;

pub fn sign(signer: &str, message: &str) -> String {
    digest(format!("sig:{}:{}", signer, message).as_bytes())
}

pub fn verify(signer: &str, message: &str, signature: &str) -> bool {
    !signature.is_empty() && sign(signer, message) == signature
}
