//! # Crypto Envelope
//!
//! Signing and sealing of envelope payloads.
//!
//! Signatures are Ed25519 over `ENVELOPE_SIGNATURE_DOMAIN || plaintext`,
//! where the plaintext is the serialized [`Message`]. Sealed payloads use
//! an ephemeral X25519 exchange against the recipient's static key, a
//! blake3-derived ChaCha20-Poly1305 key and a random nonce:
//!
//! ```text
//! hex( ephemeral_public[32] || nonce[12] || ciphertext+tag )
//! ```
//!
//! `request` envelopes never pass through here. A `message` envelope is
//! signed, then its payload is replaced by the ciphertext. A `shout` is
//! signed and left readable. Verification always runs on the plaintext
//! after decryption.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::Signature;
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as ExchangePublic};

use crate::identity::{Keypair, PublicKey, KEY_LEN};
use crate::messages::{Envelope, EnvelopeKind, MalformedEnvelope, Message, Payload};

pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"murmur-envelope-v1:";

const SEAL_KEY_CONTEXT: &str = "murmur 2024 sealed envelope key";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid key material")]
    InvalidKey,
    #[error("system randomness unavailable")]
    RandomUnavailable,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Malformed(#[from] MalformedEnvelope),
}

pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], payload: &[u8]) -> Signature {
    let mut prefixed = Vec::with_capacity(domain.len() + payload.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(payload);
    keypair.sign(&prefixed)
}

pub fn verify_with_domain(
    key: &PublicKey,
    domain: &[u8],
    payload: &[u8],
    signature: &Signature,
) -> bool {
    let Some(verifying) = key.verifying_key() else {
        return false;
    };
    let mut prefixed = Vec::with_capacity(domain.len() + payload.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(payload);
    verifying.verify_strict(&prefixed, signature).is_ok()
}

/// Hex-encoded envelope signature over `payload`.
pub fn sign(payload: &[u8], keypair: &Keypair) -> String {
    hex::encode(sign_with_domain(keypair, ENVELOPE_SIGNATURE_DOMAIN, payload).to_bytes())
}

pub fn verify(payload: &[u8], signature: &str, key: &PublicKey) -> bool {
    let Ok(bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    verify_with_domain(key, ENVELOPE_SIGNATURE_DOMAIN, payload, &signature)
}

fn seal_key(shared: &[u8; KEY_LEN], ephemeral: &[u8; KEY_LEN], recipient: &[u8; KEY_LEN]) -> [u8; 32] {
    let mut material = [0u8; KEY_LEN * 3];
    material[..KEY_LEN].copy_from_slice(shared);
    material[KEY_LEN..KEY_LEN * 2].copy_from_slice(ephemeral);
    material[KEY_LEN * 2..].copy_from_slice(recipient);
    blake3::derive_key(SEAL_KEY_CONTEXT, &material)
}

/// Seal `payload` so only the holder of `recipient`'s exchange secret can open it.
pub fn encrypt(payload: &[u8], recipient: &PublicKey) -> Result<String, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = ExchangePublic::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient.exchange_key());
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }

    let key = seal_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient.exchange_bytes(),
    );
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| CryptoError::RandomUnavailable)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| CryptoError::InvalidKey)?;

    let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Open a payload produced by [`encrypt`]. Any failure, including a
/// payload sealed to a different key, is [`CryptoError::DecryptionFailed`].
pub fn decrypt(ciphertext: &str, keypair: &Keypair) -> Result<Vec<u8>, CryptoError> {
    let raw = hex::decode(ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;
    if raw.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let (ephemeral, rest) = raw.split_at(KEY_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);
    let ephemeral: [u8; KEY_LEN] = ephemeral
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let shared = keypair
        .exchange_secret()
        .diffie_hellman(&ExchangePublic::from(ephemeral));
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }
    let own = keypair.public_key();
    let key = seal_key(shared.as_bytes(), &ephemeral, own.exchange_bytes());

    ChaCha20Poly1305::new(Key::from_slice(&key))
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Build a signed `message` envelope sealed to `recipient`.
pub fn seal(
    message: &Message,
    sender: &str,
    keypair: &Keypair,
    recipient: &PublicKey,
    tunnel_id: Option<String>,
) -> Result<Envelope, CryptoError> {
    let plaintext = message.to_bytes()?;
    let signature = sign(&plaintext, keypair);
    let ciphertext = encrypt(&plaintext, recipient)?;
    let envelope = Envelope::new(
        EnvelopeKind::Message,
        Payload::Sealed(ciphertext),
        Some(sender.to_string()),
        Some(signature),
        tunnel_id,
    )?;
    Ok(envelope)
}

/// Build a signed, readable `shout` envelope.
pub fn sign_shout(message: Message, sender: &str, keypair: &Keypair) -> Result<Envelope, CryptoError> {
    let signature = sign(&message.to_bytes()?, keypair);
    let envelope = Envelope::new(
        EnvelopeKind::Shout,
        Payload::Plain(message),
        Some(sender.to_string()),
        Some(signature),
        None,
    )?;
    Ok(envelope)
}

/// An inbound payload after decryption.
#[derive(Clone, Debug, PartialEq)]
pub struct Opened {
    pub message: Message,
    /// The exact bytes the envelope signature covers.
    pub plaintext: Vec<u8>,
}

/// Recover the plaintext [`Message`] of an inbound payload. Sealed payloads
/// keep their decrypted bytes; readable payloads are re-encoded, which is
/// lossless for any value `Message::from_bytes` accepts.
pub fn open(payload: &Payload, keypair: &Keypair) -> Result<Opened, CryptoError> {
    match payload {
        Payload::Plain(message) => Ok(Opened {
            plaintext: message.to_bytes()?,
            message: message.clone(),
        }),
        Payload::Sealed(ciphertext) => {
            let plaintext = decrypt(ciphertext, keypair)?;
            let message = Message::from_bytes(&plaintext).map_err(|_| CryptoError::DecryptionFailed)?;
            Ok(Opened { message, plaintext })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{decode, encode};

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::generate();
        let signature = sign(b"hello", &keypair);
        assert!(verify(b"hello", &signature, &keypair.public_key()));
        assert!(!verify(b"hullo", &signature, &keypair.public_key()));
    }

    #[test]
    fn wrong_signer_fails_verification() {
        let alice = Keypair::generate();
        let mallory = Keypair::generate();
        let signature = sign(b"payload", &mallory);
        assert!(!verify(b"payload", &signature, &alice.public_key()));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let keypair = Keypair::generate();
        assert!(!verify(b"payload", "not-hex", &keypair.public_key()));
        assert!(!verify(b"payload", "abcd", &keypair.public_key()));
    }

    #[test]
    fn domain_separation_prevents_cross_use() {
        let keypair = Keypair::generate();
        let signature = sign_with_domain(&keypair, b"other-domain:", b"payload");
        assert!(!verify(b"payload", &hex::encode(signature.to_bytes()), &keypair.public_key()));
    }

    #[test]
    fn encrypt_then_decrypt() {
        let recipient = Keypair::generate();
        let sealed = encrypt(b"secret", &recipient.public_key()).unwrap();
        assert_eq!(decrypt(&sealed, &recipient).unwrap(), b"secret");
    }

    #[test]
    fn ciphertexts_are_randomized() {
        let recipient = Keypair::generate();
        let a = encrypt(b"secret", &recipient.public_key()).unwrap();
        let b = encrypt(b"secret", &recipient.public_key()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let recipient = Keypair::generate();
        let other = Keypair::generate();
        let sealed = encrypt(b"secret", &recipient.public_key()).unwrap();
        assert!(matches!(decrypt(&sealed, &other), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn corrupted_ciphertext_fails() {
        let recipient = Keypair::generate();
        let sealed = encrypt(b"secret", &recipient.public_key()).unwrap();
        let mut raw = hex::decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(
            decrypt(&hex::encode(raw), &recipient),
            Err(CryptoError::DecryptionFailed)
        ));
        assert!(matches!(decrypt("zz", &recipient), Err(CryptoError::DecryptionFailed)));
        assert!(matches!(decrypt("abcd", &recipient), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn sealed_envelope_opens_and_verifies() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let message = Message::named("hello").with_callback("c1");

        let envelope = seal(&message, "alice", &alice, &bob.public_key(), Some("t1".into())).unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Message);
        assert!(envelope.payload().is_sealed());
        assert_eq!(envelope.sender(), Some("alice"));
        assert_eq!(envelope.tunnel_id(), Some("t1"));

        let opened = open(envelope.payload(), &bob).unwrap();
        assert_eq!(opened.message, message);
        assert_eq!(opened.plaintext, message.to_bytes().unwrap());
        let signature = envelope.signature().unwrap();
        assert!(verify(&opened.plaintext, signature, &alice.public_key()));

        assert!(open(envelope.payload(), &alice).is_err());
    }

    #[test]
    fn shout_is_signed_but_readable() {
        let alice = Keypair::generate();
        let message = Message::named("news");
        let envelope = sign_shout(message.clone(), "alice", &alice).unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Shout);
        assert_eq!(envelope.payload().as_plain(), Some(&message));
        assert!(verify(
            &message.to_bytes().unwrap(),
            envelope.signature().unwrap(),
            &alice.public_key()
        ));
    }

    fn float_data() -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("v".into(), serde_json::json!(4.055474706295447e-187));
        data
    }

    #[test]
    fn shout_with_awkward_float_verifies_after_the_wire() {
        let alice = Keypair::generate();
        let envelope = sign_shout(Message::new("news", float_data()), "alice", &alice).unwrap();
        let received = decode(&encode(&envelope).unwrap()).unwrap();

        let opened = open(received.payload(), &alice).unwrap();
        assert_eq!(opened.message.data, float_data());
        assert!(verify(&opened.plaintext, received.signature().unwrap(), &alice.public_key()));
    }

    #[test]
    fn sealed_signature_covers_decrypted_bytes() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let message = Message::new("hello", float_data());
        let envelope = seal(&message, "alice", &alice, &bob.public_key(), None).unwrap();
        let received = decode(&encode(&envelope).unwrap()).unwrap();

        let opened = open(received.payload(), &bob).unwrap();
        assert!(verify(&opened.plaintext, received.signature().unwrap(), &alice.public_key()));
    }
}
