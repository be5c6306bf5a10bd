//! PKCE verifier/challenge and state-nonce generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// A generated PKCE verifier/challenge pair (`S256` method).
#[derive(Debug, Clone)]
pub struct PkcePair {
    /// Code verifier: 32 random bytes, base64url without padding.
    pub verifier: String,
    /// Code challenge: base64url(SHA-256(verifier)).
    pub challenge: String,
}

/// Generate a fresh PKCE pair.
pub fn generate_pkce() -> PkcePair {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = challenge_for(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

/// Compute the `S256` challenge for a verifier.
pub fn challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Check that a verifier matches a challenge.
pub fn verify_challenge(verifier: &str, challenge: &str) -> bool {
    challenge_for(verifier) == challenge
}

/// Generate a random state nonce: 32 random bytes, hex encoded.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
