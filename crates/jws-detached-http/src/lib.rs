//! # Detached JWS middleware
//!
//! A [`tower::Layer`] that checks detached JWS signatures on request bodies and
//! signs response bodies, for use with `axum` routers or any tower stack over
//! [`axum::body::Body`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{routing::post, Router};
//! use jws_detached::{Header, JwsAlgorithm, SignerRegistry, VerifierRegistry};
//! use jws_detached_http::{JwsDetachedConfig, JwsDetachedLayer, SignContext};
//!
//! # fn example(signers: SignerRegistry, verifiers: VerifierRegistry) -> jws_detached::Result<()> {
//! let layer = JwsDetachedLayer::new(JwsDetachedConfig::default())?
//!     .verify_all(Arc::new(verifiers))
//!     .sign_all(SignContext::new(Header::new(JwsAlgorithm::PS256), Arc::new(signers)));
//!
//! let app: Router = Router::new()
//!     .route("/orders", post(|body: String| async move { body }))
//!     .layer(layer);
//! # Ok(())
//! # }
//! ```
//!
//! Failures become plain-text responses: a missing header or bad signature is
//! `403`, a malformed token or unknown algorithm `400`, an oversized request
//! body `413`, anything else `500`.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod config;
pub mod middleware;
pub mod selector;
pub mod stage;

pub use config::{
    HEADER_NAME_ENV, JwsDetachedConfig, JwsDetachedConfigBuilder, RESPONSE_SIGNING_ENV,
    ResponseSigning,
};
pub use middleware::{JwsDetachedLayer, JwsDetachedService, error_response, status_for};
pub use selector::{SignContext, SignContextSelector, VerifierSelector};
pub use stage::{Stage, StageTracker};
