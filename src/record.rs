//! Transcript record model
//!
//! One `TranscriptRecord` is emitted per completed proxy exchange. The JSON
//! shape (camelCase names, base64 bodies) is the wire format consumed by the
//! inspection UI and preserved across the store, the SSE feed and replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes captured per body direction. Process constant.
pub const MAX_BODY_CAPTURE: usize = 512 * 1024;

/// A single header name/value pair. Multi-valued headers are kept as
/// repeated pairs in wire order rather than joined into one string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

impl HeaderPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Which leg the exchange was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(format!("unknown scheme: {other}")),
        }
    }
}

/// The canonical observation unit: one proxied request/response exchange.
///
/// Records are immutable once committed; the identifier is assigned by the
/// store at commit time and stable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRecord {
    /// Opaque identifier, unique across the store's lifetime.
    #[serde(default)]
    pub id: String,

    /// Wall-clock instant the outbound request was dispatched.
    pub started_at: DateTime<Utc>,

    /// Elapsed time until response headers were read, or until failure.
    pub duration_ms: u64,

    pub method: String,

    /// Absolute URL of the exchange.
    pub url: String,

    pub http_version: String,

    pub host: String,

    pub scheme: Scheme,

    /// Request headers in wire order.
    pub req_headers: Vec<HeaderPair>,

    /// Captured request body prefix (≤ `MAX_BODY_CAPTURE`).
    #[serde(with = "base64_bytes")]
    pub req_body: Vec<u8>,

    /// True iff the client sent more request bytes than were captured.
    pub req_body_trunc: bool,

    /// Response status code; 0 when no response was received.
    pub status: u16,

    /// Response headers in wire order.
    pub resp_headers: Vec<HeaderPair>,

    /// Captured response body prefix (≤ `MAX_BODY_CAPTURE`).
    #[serde(with = "base64_bytes")]
    pub resp_body: Vec<u8>,

    /// True iff the origin sent more response bytes than were captured.
    pub resp_body_trunc: bool,

    /// Short failure cause; empty on success. Non-empty iff `status == 0`.
    #[serde(default)]
    pub error: String,
}

/// Serialize `Vec<u8>` as a base64 string, the encoding the UI expects for
/// body fields everywhere (records, replay results, HAR content).
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
