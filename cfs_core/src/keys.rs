//! Key derivation and signing glue.
//!
//! Partition key pairs are derived deterministically so that two CFS
//! instances opened with the same root secret key always agree on every
//! partition's identity:
//!
//! - `seed = partition_name_bytes ++ root_secret_key`
//! - `signing_key` = BLAKE3 derive_key("cfs/partition/ed25519", seed)
//! - `public_key` = Ed25519 public key of `signing_key`
//!
//! The discovery key is derived from the public key alone and never
//! reveals write capability.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroize;

use crate::{KEY_SIZE, SIGNATURE_SIZE};

/// Derivation context for partition signing keys.
pub const PARTITION_KEY_CONTEXT: &str = "cfs/partition/ed25519";

/// Derivation context for discovery keys.
pub const DISCOVERY_KEY_CONTEXT: &str = "cfs/discovery";

/// An Ed25519 private key seed, scrubbed on drop.
#[derive(Clone)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// A public key plus an optional secret half.
///
/// A pair with a secret key grants write capability; a public-only pair
/// opens a drive as a reader.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: [u8; KEY_SIZE],
    pub secret: Option<SecretKey>,
}

impl KeyPair {
    /// A reader pair with no write capability.
    pub fn public_only(public: [u8; KEY_SIZE]) -> Self {
        Self {
            public,
            secret: None,
        }
    }

    pub fn writable(&self) -> bool {
        self.secret.is_some()
    }
}

/// Derives a deterministic Ed25519 key pair from a seed.
pub fn derive_keypair(seed: &[u8]) -> KeyPair {
    let secret = blake3::derive_key(PARTITION_KEY_CONTEXT, seed);
    let signing_key = SigningKey::from_bytes(&secret);
    KeyPair {
        public: *signing_key.verifying_key().as_bytes(),
        secret: Some(SecretKey(secret)),
    }
}

/// Generates a random key pair from OS entropy.
pub fn generate_keypair() -> KeyPair {
    let seed: [u8; KEY_SIZE] = rand::random();
    derive_keypair(&seed)
}

/// Builds the derivation seed for a named partition of a root drive.
pub fn partition_seed(name: &str, root_secret: &SecretKey) -> Vec<u8> {
    let mut seed = Vec::with_capacity(name.len() + KEY_SIZE);
    seed.extend_from_slice(name.as_bytes());
    seed.extend_from_slice(root_secret.as_bytes());
    seed
}

/// Derives the discovery key for a drive public key.
pub fn discovery_key(public: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    blake3::derive_key(DISCOVERY_KEY_CONTEXT, public)
}

/// Signs `message` with the given secret key.
pub fn sign(secret: &SecretKey, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
    let signing_key = SigningKey::from_bytes(secret.as_bytes());
    signing_key.sign(message).to_bytes()
}

/// Verifies an Ed25519 signature. Returns `false` on any malformed input.
pub fn verify(public: &[u8; KEY_SIZE], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let root = SecretKey::new([7u8; 32]);
        let a = derive_keypair(&partition_seed("etc", &root));
        let b = derive_keypair(&partition_seed("etc", &root));
        assert_eq!(a.public, b.public);
        assert_eq!(
            a.secret.as_ref().unwrap().as_bytes(),
            b.secret.as_ref().unwrap().as_bytes()
        );

        let c = derive_keypair(&partition_seed("var", &root));
        assert_ne!(a.public, c.public);
    }

    #[test]
    fn sign_and_verify() {
        let pair = derive_keypair(b"seed");
        let sig = sign(pair.secret.as_ref().unwrap(), b"hello");
        assert!(verify(&pair.public, b"hello", &sig));
        assert!(!verify(&pair.public, b"tampered", &sig));
        assert!(!verify(&pair.public, b"hello", &sig[..10]));
    }

    #[test]
    fn discovery_key_differs_from_public() {
        let pair = derive_keypair(b"seed");
        assert_ne!(discovery_key(&pair.public), pair.public);
        assert_eq!(discovery_key(&pair.public), discovery_key(&pair.public));
    }
}
