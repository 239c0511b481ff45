//! Core detached JWS types
//!
//! The protected header and the algorithm names understood by the built-in
//! primitives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{codec, errors::JwsDetachedError, Result};

/// JWS signature algorithms with a built-in incremental primitive
///
/// Registries are keyed by the `alg` string, so custom capabilities may use
/// names outside this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JwsAlgorithm {
    /// RSA with PSS padding and SHA-256 (RFC 7518)
    #[serde(rename = "PS256")]
    PS256,

    /// RSA with PKCS#1 v1.5 padding and SHA-256 (RFC 7518)
    #[serde(rename = "RS256")]
    RS256,

    /// ECDSA with the P-256 curve and SHA-256 (RFC 7518)
    #[serde(rename = "ES256")]
    ES256,
}

impl JwsAlgorithm {
    /// Get the algorithm name as specified in RFC 7518
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PS256 => "PS256",
            Self::RS256 => "RS256",
            Self::ES256 => "ES256",
        }
    }

    /// Whether the algorithm needs an RSA key
    pub fn is_rsa(self) -> bool {
        matches!(self, Self::PS256 | Self::RS256)
    }
}

impl fmt::Display for JwsAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JwsAlgorithm {
    type Err = JwsDetachedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PS256" => Ok(Self::PS256),
            "RS256" => Ok(Self::RS256),
            "ES256" => Ok(Self::ES256),
            other => Err(JwsDetachedError::UnsupportedAlgorithm {
                algorithm: Some(other.to_string()),
            }),
        }
    }
}

/// Protected JWS header
///
/// An ordered JSON object. Claim order is preserved so that a header
/// serializes to the same compact JSON it was built from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header(Map<String, Value>);

impl Header {
    /// Create a header carrying only the `alg` claim
    pub fn new(algorithm: impl fmt::Display) -> Self {
        let mut claims = Map::new();
        claims.insert("alg".to_string(), Value::String(algorithm.to_string()));
        Self(claims)
    }

    /// Wrap an existing JSON object
    pub fn from_map(claims: Map<String, Value>) -> Self {
        Self(claims)
    }

    /// Add a claim, replacing any previous value
    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// The `alg` claim, if present and a string
    pub fn algorithm(&self) -> Option<&str> {
        self.0.get("alg").and_then(Value::as_str)
    }

    /// Look up any claim
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Borrow the underlying JSON object
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Compact JSON, base64url encoded: segment 0 of a token
    pub fn to_segment(&self) -> Result<String> {
        let json = serde_json::to_vec(&self.0).map_err(|e| JwsDetachedError::IoError {
            reason: format!("Failed to serialize header: {e}"),
        })?;
        Ok(codec::base64url_encode(json))
    }
}

impl From<Map<String, Value>> for Header {
    fn from(claims: Map<String, Value>) -> Self {
        Self(claims)
    }
}
