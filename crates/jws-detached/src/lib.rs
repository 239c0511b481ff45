//! # Detached JWS over streams
//!
//! Sign and verify HTTP bodies with a detached JSON Web Signature without ever
//! holding the whole body in memory.
//!
//! A detached token is the compact JWS serialization with the payload segment
//! left empty: `base64url(header)..base64url(signature)`. The payload travels
//! separately (as the HTTP body) and the signing input
//! `base64url(header) '.' base64url(payload)` is pushed through an incremental
//! hash/sign primitive chunk by chunk.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use jws_detached::{
//!     sign_reader, verify_reader, Header, JwsAlgorithm, SignerRegistry, SigningKeyMaterial,
//!     VerifierRegistry,
//! };
//!
//! # async fn example(private_pem: &str) -> jws_detached::Result<()> {
//! let key = Arc::new(SigningKeyMaterial::from_pkcs8_pem(private_pem)?);
//! let signers = SignerRegistry::with_key(JwsAlgorithm::PS256, key.clone())?;
//! let verifiers = VerifierRegistry::with_key(JwsAlgorithm::PS256, Arc::new(key.verifying_key()))?;
//!
//! let token = sign_reader(&Header::new(JwsAlgorithm::PS256), &signers, &b"Request body"[..]).await?;
//! let header = verify_reader(&token, &verifiers, &b"Request body"[..]).await?;
//! assert!(header.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  body stream ──▶ buffering (replayable) ──▶ engine ──▶ algorithms registry ──▶ primitive
//!                                               │
//!                                               └──▶ codec (seg0..seg2)
//! ```
//!
//! The HTTP orchestration (when to verify, when to sign) lives in the
//! `jws-detached-http` crate.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub use algorithms::*;
pub use buffering::{
    make_seekable, temp_directory, BodyStream, BufferLimitError, BufferingPolicy,
    BufferingReader, BufferingWriter, SeekableBody, SeekableRead, SpillBuffer, TeeWriter,
};
pub use codec::{DetachedToken, base64url_decode, base64url_encode};
pub use encoder::Base64UrlEncoder;
pub use engine::{DetachedSigner, DetachedVerifier, sign_reader, verify_reader};
pub use errors::*;
pub use keys::*;
pub use primitives::{KeyedSignerFactory, KeyedVerifierFactory};
pub use types::*;

pub mod algorithms;
pub mod buffering;
pub mod codec;
pub mod encoder;
pub mod engine;
pub mod errors;
pub mod keys;
pub mod primitives;
pub mod types;

/// Detached JWS result type
pub type Result<T> = std::result::Result<T, JwsDetachedError>;

/// Current crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header carrying the detached token on requests and responses
pub const DEFAULT_HEADER_NAME: &str = "x-jws-signature";

/// Bytes kept in memory before a file-backed buffer spills to disk (30 KiB)
pub const DEFAULT_FILE_BUFFER_THRESHOLD: usize = 30 * 1024;

/// Environment variable naming the directory for spilled buffers
pub const TEMP_DIR_ENV: &str = "JWS_DETACHED_TEMP";

/// Size of the chunks pulled from a payload reader
pub const PAYLOAD_CHUNK_SIZE: usize = 16 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_HEADER_NAME, "x-jws-signature");
        assert_eq!(DEFAULT_FILE_BUFFER_THRESHOLD, 30_720);
        assert_eq!(TEMP_DIR_ENV, "JWS_DETACHED_TEMP");
    }
}
