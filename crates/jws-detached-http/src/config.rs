//! Middleware configuration

use std::env;
use std::str::FromStr;

use axum::http::HeaderName;
use jws_detached::{BufferingPolicy, DEFAULT_HEADER_NAME, JwsDetachedError, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the signature header name
pub const HEADER_NAME_ENV: &str = "JWS_DETACHED_HEADER_NAME";

/// Environment variable selecting the response signing strategy
pub const RESPONSE_SIGNING_ENV: &str = "JWS_DETACHED_RESPONSE_SIGNING";

/// How a response body is signed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSigning {
    /// Capture the whole body, sign it, send the token as a header, then the body
    #[default]
    Buffered,

    /// Forward the body as it is produced and send the token as a trailer
    Sliding,
}

impl FromStr for ResponseSigning {
    type Err = JwsDetachedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffered" => Ok(Self::Buffered),
            "sliding" => Ok(Self::Sliding),
            other => Err(JwsDetachedError::ConfigurationError {
                reason: format!("unknown response signing strategy '{other}'"),
            }),
        }
    }
}

/// Configuration for [`JwsDetachedLayer`](crate::JwsDetachedLayer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JwsDetachedConfig {
    /// Header carrying the detached token, on requests and responses
    pub header_name: String,

    /// How request bodies are made replayable for verification
    pub request_buffering: BufferingPolicy,

    /// How response bodies are captured for signing
    pub response_buffering: BufferingPolicy,

    /// Response signing strategy
    pub response_signing: ResponseSigning,
}

impl Default for JwsDetachedConfig {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_HEADER_NAME.to_string(),
            request_buffering: BufferingPolicy::default(),
            response_buffering: BufferingPolicy::default(),
            response_signing: ResponseSigning::default(),
        }
    }
}

impl JwsDetachedConfig {
    /// Start building a configuration from the defaults
    pub fn builder() -> JwsDetachedConfigBuilder {
        JwsDetachedConfigBuilder::new()
    }

    /// Defaults overridden by `JWS_DETACHED_HEADER_NAME` and
    /// `JWS_DETACHED_RESPONSE_SIGNING`, validated
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder();
        if let Ok(name) = env::var(HEADER_NAME_ENV) {
            builder = builder.header_name(name);
        }
        if let Ok(strategy) = env::var(RESPONSE_SIGNING_ENV) {
            builder = builder.response_signing(strategy.parse()?);
        }
        builder.build()
    }

    /// Parsed signature header name
    pub fn header(&self) -> Result<HeaderName> {
        HeaderName::from_bytes(self.header_name.as_bytes()).map_err(|_| {
            JwsDetachedError::ConfigurationError {
                reason: format!("'{}' is not a valid header name", self.header_name),
            }
        })
    }

    /// Reject configurations the middleware cannot honour
    pub fn validate(&self) -> Result<()> {
        self.header()?;

        if self.response_signing == ResponseSigning::Buffered
            && self.response_buffering.is_disabled()
        {
            return Err(JwsDetachedError::ConfigurationError {
                reason: "buffered response signing requires response buffering".to_string(),
            });
        }

        self.request_buffering.validate()?;
        self.response_buffering.validate()
    }
}

/// Builder for [`JwsDetachedConfig`]
#[derive(Debug, Clone, Default)]
pub struct JwsDetachedConfigBuilder {
    config: JwsDetachedConfig,
}

impl JwsDetachedConfigBuilder {
    /// Builder seeded with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signature header name
    #[must_use]
    pub fn header_name(mut self, name: impl Into<String>) -> Self {
        self.config.header_name = name.into();
        self
    }

    /// Set the request buffering policy
    #[must_use]
    pub fn request_buffering(mut self, policy: BufferingPolicy) -> Self {
        self.config.request_buffering = policy;
        self
    }

    /// Set the response buffering policy
    #[must_use]
    pub fn response_buffering(mut self, policy: BufferingPolicy) -> Self {
        self.config.response_buffering = policy;
        self
    }

    /// Set both buffering policies
    #[must_use]
    pub fn buffering(self, policy: BufferingPolicy) -> Self {
        self.request_buffering(policy.clone())
            .response_buffering(policy)
    }

    /// Set the response signing strategy
    #[must_use]
    pub fn response_signing(mut self, strategy: ResponseSigning) -> Self {
        self.config.response_signing = strategy;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<JwsDetachedConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = JwsDetachedConfig::builder().build().unwrap();
        assert_eq!(config.header_name, "x-jws-signature");
        assert_eq!(config.request_buffering, BufferingPolicy::file());
        assert_eq!(config.response_signing, ResponseSigning::Buffered);
        assert_eq!(config.header().unwrap().as_str(), "x-jws-signature");
    }

    #[test]
    fn test_rejects_invalid_header_name() {
        let err = JwsDetachedConfig::builder()
            .header_name("not a header")
            .build()
            .unwrap_err();
        assert!(matches!(err, JwsDetachedError::ConfigurationError { .. }));
    }

    #[test]
    fn test_buffered_signing_needs_response_buffering() {
        let err = JwsDetachedConfig::builder()
            .response_buffering(BufferingPolicy::Disabled)
            .build()
            .unwrap_err();
        assert!(matches!(err, JwsDetachedError::ConfigurationError { .. }));

        let config = JwsDetachedConfig::builder()
            .response_buffering(BufferingPolicy::Disabled)
            .response_signing(ResponseSigning::Sliding)
            .build()
            .unwrap();
        assert!(config.response_buffering.is_disabled());
    }

    #[test]
    fn test_policy_validation_is_applied() {
        let err = JwsDetachedConfig::builder()
            .request_buffering(BufferingPolicy::file().with_threshold(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, JwsDetachedError::ConfigurationError { .. }));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: JwsDetachedConfig = serde_json::from_str(
            r#"{
                "header_name": "x-body-signature",
                "request_buffering": {"mode": "memory", "limit": 1024},
                "response_signing": "sliding"
            }"#,
        )
        .unwrap();

        assert_eq!(config.header_name, "x-body-signature");
        assert_eq!(
            config.request_buffering,
            BufferingPolicy::memory().with_limit(1024)
        );
        assert_eq!(config.response_buffering, BufferingPolicy::file());
        assert_eq!(config.response_signing, ResponseSigning::Sliding);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_response_signing() {
        assert_eq!("Sliding".parse::<ResponseSigning>().unwrap(), ResponseSigning::Sliding);
        assert_eq!(" buffered ".parse::<ResponseSigning>().unwrap(), ResponseSigning::Buffered);
        assert!("streamed".parse::<ResponseSigning>().is_err());
    }
}
