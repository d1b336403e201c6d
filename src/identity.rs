//! # Node Identity
//!
//! A node owns one [`Keypair`] made of two halves:
//!
//! - an Ed25519 signing key, used to sign `message` and `shout` envelopes
//! - an X25519 static secret, used to open envelopes sealed to this node
//!
//! The matching [`PublicKey`] is what other nodes store in their user table
//! and what `share_info` / `new_user` carry on the wire, as a single
//! 128-character hex string (verifying key followed by exchange key).
//!
//! Keys persist to a small JSON file so a node keeps its identity across
//! restarts. A missing file is created on first start; a file that exists
//! but cannot be parsed is a fatal error, never silently replaced.

use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as ExchangePublic, StaticSecret};

pub const KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    exchange_secret: StaticSecret,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            exchange_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_secret_bytes(signing: &[u8; KEY_LEN], exchange: &[u8; KEY_LEN]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(signing),
            exchange_secret: StaticSecret::from(*exchange),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying: self.signing_key.verifying_key().to_bytes(),
            exchange: ExchangePublic::from(&self.exchange_secret).to_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub(crate) fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange_secret
    }

    /// Load the keypair stored at `path`, or generate and persist a new one
    /// when the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let keypair = Self::load(path)?;
            tracing::debug!(path = %path.display(), "loaded node keys");
            return Ok(keypair);
        }
        let keypair = Self::generate();
        keypair.save(path)?;
        tracing::info!(
            path = %path.display(),
            key = %keypair.public_key().fingerprint(),
            "generated new node keys"
        );
        Ok(keypair)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        let file: KeyFile = serde_json::from_str(&raw)
            .with_context(|| format!("key file {} is corrupt", path.display()))?;
        let signing = decode_key(&file.signing).context("invalid signing key")?;
        let exchange = decode_key(&file.exchange).context("invalid exchange key")?;
        Ok(Self::from_secret_bytes(&signing, &exchange))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = KeyFile {
            signing: hex::encode(self.signing_key.to_bytes()),
            exchange: hex::encode(self.exchange_secret.to_bytes()),
        };
        let raw = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write key file {}", path.display()))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    signing: String,
    exchange: String,
}

fn decode_key(s: &str) -> Result<[u8; KEY_LEN], hex::FromHexError> {
    let bytes = hex::decode(s)?;
    bytes
        .try_into()
        .map_err(|_| hex::FromHexError::InvalidStringLength)
}

/// Public half of a node's identity, as shared with the rest of the overlay.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    verifying: [u8; KEY_LEN],
    exchange: [u8; KEY_LEN],
}

impl PublicKey {
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.verifying).ok()
    }

    pub fn exchange_key(&self) -> ExchangePublic {
        ExchangePublic::from(self.exchange)
    }

    pub fn exchange_bytes(&self) -> &[u8; KEY_LEN] {
        &self.exchange
    }

    pub fn to_hex(&self) -> String {
        let mut out = hex::encode(self.verifying);
        out.push_str(&hex::encode(self.exchange));
        out
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        if s.len() != KEY_LEN * 4 || !s.is_ascii() {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let (verifying, exchange) = s.split_at(KEY_LEN * 2);
        let key = Self {
            verifying: decode_key(verifying)?,
            exchange: decode_key(exchange)?,
        };
        Ok(key)
    }

    /// Short blake3 digest, for logs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.verifying);
        hasher.update(&self.exchange);
        hex::encode(&hasher.finalize().as_bytes()[..8])
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for PublicKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let key = Keypair::generate().public_key();
        let hex = key.to_hex();
        assert_eq!(hex.len(), 128);
        assert_eq!(PublicKey::from_hex(&hex).unwrap(), key);
        assert_eq!(hex.parse::<PublicKey>().unwrap(), key);
    }

    #[test]
    fn public_key_hex_rejects_invalid() {
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex(&"zz".repeat(64)).is_err());
    }

    #[test]
    fn public_key_serializes_as_string() {
        let key = Keypair::generate().public_key();
        let json = serde_json::to_value(key).unwrap();
        assert_eq!(json, serde_json::Value::String(key.to_hex()));
        let back: PublicKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn reconstruction_preserves_public_key() {
        let keypair = Keypair::generate();
        let rebuilt = Keypair::from_secret_bytes(
            &keypair.signing_key.to_bytes(),
            &keypair.exchange_secret.to_bytes(),
        );
        assert_eq!(rebuilt.public_key(), keypair.public_key());
    }

    #[test]
    fn key_file_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.json");

        let first = Keypair::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "not a key file").unwrap();
        assert!(Keypair::load_or_generate(&path).is_err());

        std::fs::write(&path, r#"{"signing":"00","exchange":"00"}"#).unwrap();
        assert!(Keypair::load_or_generate(&path).is_err());
    }

    #[test]
    fn debug_does_not_leak_secrets() {
        let keypair = Keypair::generate();
        let rendered = format!("{keypair:?}");
        assert!(!rendered.contains(&hex::encode(keypair.signing_key.to_bytes())));
    }
}
