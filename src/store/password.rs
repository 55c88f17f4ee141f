//! Salted password verifiers.
//!
//! Verifier format is `salt$digest` where `digest = sha256(salt || password)`
//! in lowercase hex. The salt is 16 random bytes, hex-encoded, and hashed as
//! the text it is stored as.

use rand::RngCore;
use sha2::{Digest, Sha256};

pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = hex(&salt);
    let digest = digest(&salt, password);
    format!("{salt}${digest}")
}

pub fn verify_password(password: &str, verifier: &str) -> bool {
    let Some((salt, expected)) = verifier.split_once('$') else {
        return false;
    };
    digest(salt, password) == expected
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
