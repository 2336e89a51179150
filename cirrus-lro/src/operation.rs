//! In-flight operation records and the poller token codec.
//!
//! A record is the only state that survives between reconciliation attempts. Its
//! `data` field holds a versioned, base64-encoded JSON envelope around whatever
//! poller state the provider handler needs to resume polling.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TokenError;

/// Current envelope version written by [`encode_token`].
pub const TOKEN_VERSION: u32 = 1;

/// Kind of provider-side operation a record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Put,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Put => write!(f, "PUT"),
            OperationKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A provider-side operation that has not been confirmed complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongRunningOperationState {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub service_name: String,
    pub name: String,
    pub resource_group: String,
    /// Encoded poller token, see [`encode_token`].
    pub data: String,
}

impl LongRunningOperationState {
    pub fn new(
        kind: OperationKind,
        service_name: impl Into<String>,
        name: impl Into<String>,
        resource_group: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            service_name: service_name.into(),
            name: name.into(),
            resource_group: resource_group.into(),
            data: data.into(),
        }
    }

    /// True if this record belongs to the given (resource, service) key.
    pub fn matches(&self, resource_name: &str, service_name: &str) -> bool {
        self.name == resource_name && self.service_name == service_name
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, P> {
    version: u32,
    poller: &'a P,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    poller: serde_json::Value,
}

/// Encode provider poller state into an opaque token.
pub fn encode_token<P: Serialize>(poller: &P) -> Result<String, TokenError> {
    let json = serde_json::to_vec(&EnvelopeRef {
        version: TOKEN_VERSION,
        poller,
    })?;
    Ok(BASE64.encode(json))
}

/// Decode a token written by [`encode_token`].
///
/// Fails on malformed base64, malformed JSON, an unknown envelope version, or a
/// poller payload that does not match `P`.
pub fn decode_token<P: DeserializeOwned>(data: &str) -> Result<P, TokenError> {
    let bytes = BASE64.decode(data.trim())?;
    let envelope: Envelope = serde_json::from_slice(&bytes)?;
    if envelope.version != TOKEN_VERSION {
        return Err(TokenError::UnsupportedVersion(envelope.version));
    }
    Ok(serde_json::from_value(envelope.poller)?)
}
