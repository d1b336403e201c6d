//! # Wire Envelope
//!
//! Every datagram carries one JSON envelope:
//!
//! ```text
//! {
//!   "message":   <Message object, or hex ciphertext when sealed>,
//!   "type":      "message" | "request" | "shout",
//!   "sender":    <string|null>,
//!   "encoding":  "json",
//!   "id":        <string>,
//!   "sign":      <string|null>,
//!   "tunnel_id": <string|null>
//! }
//! ```
//!
//! | Kind | Sender | Signature | Payload |
//! |------|--------|-----------|---------|
//! | `request` | never | never | plaintext |
//! | `message` | required | required | sealed to the addressee |
//! | `shout` | required | required | plaintext |
//!
//! Requests are deliberately unauthenticated: carrying a sender or a
//! signature would link them to an identity. Both [`Envelope`]
//! construction and [`decode`] reject a request that has either.
//!
//! The envelope `id` is the flood dedup key. It is generated at the
//! originating hop and carried unchanged by every re-broadcast.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Only encoding understood on the wire.
pub const ENCODING_JSON: &str = "json";

/// Upper bound on a single datagram we are willing to parse.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Length of the random salt, in bytes before hex encoding.
const SALT_LEN: usize = 16;

pub(crate) fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    if getrandom::getrandom(&mut salt).is_err() {
        // salt is a freshness nonce, not key material; fall back to the uuid generator
        return uuid::Uuid::new_v4().simple().to_string();
    }
    hex::encode(salt)
}

pub(crate) fn generate_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Application-level payload: a named message with a correlation token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default = "generate_salt")]
    pub salt: String,
    #[serde(default = "generate_token")]
    pub callback: String,
}

impl Message {
    pub fn new(name: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            data,
            salt: generate_salt(),
            callback: generate_token(),
        }
    }

    /// A message with no data.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Map::new())
    }

    pub fn with_callback(mut self, token: impl Into<String>) -> Self {
        self.callback = token.into();
        self
    }

    /// Build a reply that chains onto `request` by reusing its callback token.
    pub fn reply(request: &Message, name: impl Into<String>, data: Map<String, Value>) -> Self {
        Self::new(name, data).with_callback(request.callback.clone())
    }

    /// Canonical bytes covered by the envelope signature and, for sealed
    /// envelopes, the plaintext that gets encrypted.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Addressed, signed and encrypted for one user.
    Message,
    /// Direct, unauthenticated, unlinkable.
    Request,
    /// Network-wide broadcast, signed but not encrypted.
    Shout,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Message => "message",
            EnvelopeKind::Request => "request",
            EnvelopeKind::Shout => "shout",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "message" => Some(EnvelopeKind::Message),
            "request" => Some(EnvelopeKind::Request),
            "shout" => Some(EnvelopeKind::Shout),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `message` field: a plaintext [`Message`] or hex ciphertext.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Plain(Message),
    Sealed(String),
}

impl Payload {
    pub fn as_plain(&self) -> Option<&Message> {
        match self {
            Payload::Plain(message) => Some(message),
            Payload::Sealed(_) => None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, Payload::Sealed(_))
    }
}

/// Structural reasons an envelope is refused, at construction or decode.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MalformedEnvelope {
    #[error("datagram is not valid JSON text: {0}")]
    InvalidText(String),
    #[error("envelope exceeds {MAX_DATAGRAM_SIZE} bytes")]
    TooLarge,
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope type missing or unknown")]
    UnknownKind,
    #[error("message payload missing")]
    MissingMessage,
    #[error("message payload invalid: {0}")]
    InvalidMessage(String),
    #[error("unsupported encoding")]
    UnsupportedEncoding,
    #[error("envelope id missing")]
    MissingId,
    #[error("{0} envelope requires a sender")]
    MissingSender(EnvelopeKind),
    #[error("{0} envelope requires a signature")]
    MissingSignature(EnvelopeKind),
    #[error("request envelopes must not carry a sender or signature")]
    IdentifiedRequest,
    #[error("request envelopes must not be encrypted")]
    SealedRequest,
    #[error("tunnel id must be a string")]
    InvalidTunnelId,
}

/// Wire-level wrapper around a [`Message`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "message")]
    payload: Payload,
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    sender: Option<String>,
    encoding: String,
    id: String,
    #[serde(rename = "sign")]
    signature: Option<String>,
    tunnel_id: Option<String>,
}

impl Envelope {
    /// An unauthenticated request. Carries no sender and no signature.
    pub fn request(message: Message) -> Self {
        Self {
            payload: Payload::Plain(message),
            kind: EnvelopeKind::Request,
            sender: None,
            encoding: ENCODING_JSON.to_string(),
            id: generate_token(),
            signature: None,
            tunnel_id: None,
        }
    }

    /// Build an envelope with a fresh id, enforcing the per-kind invariants.
    pub fn new(
        kind: EnvelopeKind,
        payload: Payload,
        sender: Option<String>,
        signature: Option<String>,
        tunnel_id: Option<String>,
    ) -> Result<Self, MalformedEnvelope> {
        Self::from_parts(payload, kind, sender, generate_token(), signature, tunnel_id)
    }

    fn from_parts(
        payload: Payload,
        kind: EnvelopeKind,
        sender: Option<String>,
        id: String,
        signature: Option<String>,
        tunnel_id: Option<String>,
    ) -> Result<Self, MalformedEnvelope> {
        if id.is_empty() {
            return Err(MalformedEnvelope::MissingId);
        }
        match kind {
            EnvelopeKind::Request => {
                if sender.is_some() || signature.is_some() {
                    return Err(MalformedEnvelope::IdentifiedRequest);
                }
                if payload.is_sealed() {
                    return Err(MalformedEnvelope::SealedRequest);
                }
            }
            EnvelopeKind::Message | EnvelopeKind::Shout => {
                if sender.as_deref().map_or(true, str::is_empty) {
                    return Err(MalformedEnvelope::MissingSender(kind));
                }
                if signature.as_deref().map_or(true, str::is_empty) {
                    return Err(MalformedEnvelope::MissingSignature(kind));
                }
            }
        }
        Ok(Self {
            payload,
            kind,
            sender,
            encoding: ENCODING_JSON.to_string(),
            id,
            signature,
            tunnel_id,
        })
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn tunnel_id(&self) -> Option<&str> {
        self.tunnel_id.as_deref()
    }

    /// Callback token of the inner message, if it is readable at this hop.
    pub fn callback(&self) -> Option<&str> {
        self.payload.as_plain().map(|message| message.callback.as_str())
    }

    /// Leave the tunnel at this hop: drop the tunnel id and continue as a
    /// plain `message` envelope.
    pub fn exit_tunnel(&mut self) {
        self.tunnel_id = None;
        if self.kind != EnvelopeKind::Request {
            self.kind = EnvelopeKind::Message;
        }
    }
}

/// Serialize an envelope to its wire bytes.
pub fn encode(envelope: &Envelope) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(envelope)
}

/// Parse and validate wire bytes.
pub fn decode(bytes: &[u8]) -> Result<Envelope, MalformedEnvelope> {
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(MalformedEnvelope::TooLarge);
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|e| MalformedEnvelope::InvalidText(e.to_string()))?;
    let value: Value = serde_json::from_str(text)
        .map_err(|e| MalformedEnvelope::InvalidText(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(MalformedEnvelope::NotAnObject);
    };

    let kind = fields
        .get("type")
        .and_then(Value::as_str)
        .and_then(EnvelopeKind::parse)
        .ok_or(MalformedEnvelope::UnknownKind)?;

    let payload = match fields.remove("message") {
        None | Some(Value::Null) => return Err(MalformedEnvelope::MissingMessage),
        Some(Value::String(ciphertext)) if ciphertext.is_empty() => {
            return Err(MalformedEnvelope::MissingMessage)
        }
        Some(Value::String(ciphertext)) => Payload::Sealed(ciphertext),
        Some(object @ Value::Object(_)) => Payload::Plain(
            serde_json::from_value(object)
                .map_err(|e| MalformedEnvelope::InvalidMessage(e.to_string()))?,
        ),
        Some(_) => {
            return Err(MalformedEnvelope::InvalidMessage(
                "expected an object or a ciphertext string".to_string(),
            ))
        }
    };

    match fields.get("encoding") {
        None | Some(Value::Null) => {}
        Some(Value::String(encoding)) if encoding == ENCODING_JSON => {}
        Some(_) => return Err(MalformedEnvelope::UnsupportedEncoding),
    }

    let id = match fields.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => id,
        _ => return Err(MalformedEnvelope::MissingId),
    };

    let sender = optional_string(&mut fields, "sender")
        .ok_or(MalformedEnvelope::MissingSender(kind))?;
    let signature = optional_string(&mut fields, "sign")
        .ok_or(MalformedEnvelope::MissingSignature(kind))?;
    let tunnel_id = optional_string(&mut fields, "tunnel_id")
        .ok_or(MalformedEnvelope::InvalidTunnelId)?;

    Envelope::from_parts(payload, kind, sender, id, signature, tunnel_id)
}

/// `Some(None)` for absent/null, `Some(Some(s))` for a string, `None` for
/// any other JSON type.
fn optional_string(fields: &mut Map<String, Value>, key: &str) -> Option<Option<String>> {
    match fields.remove(key) {
        None | Some(Value::Null) => Some(None),
        Some(Value::String(s)) => Some(Some(s)),
        Some(_) => None,
    }
}
