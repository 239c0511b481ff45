//! Per-request capability selection
//!
//! Both hooks run once per request, before the handler. Returning `None` is the
//! common case and leaves the request (or its response) untouched.

use std::fmt;
use std::sync::Arc;

use axum::http::request::Parts;
use jws_detached::{Header, SignerRegistry, VerifierRegistry};

/// Decides whether a request body must carry a valid detached signature
pub trait VerifierSelector: Send + Sync + 'static {
    /// Verifiers to check the request with, `None` to skip verification
    fn select(&self, request: &Parts) -> Option<Arc<VerifierRegistry>>;
}

impl<F> VerifierSelector for F
where
    F: Fn(&Parts) -> Option<Arc<VerifierRegistry>> + Send + Sync + 'static,
{
    fn select(&self, request: &Parts) -> Option<Arc<VerifierRegistry>> {
        self(request)
    }
}

/// Decides whether the response to a request gets signed
pub trait SignContextSelector: Send + Sync + 'static {
    /// Signing context for the response, `None` to leave it unsigned
    fn select(&self, request: &Parts) -> Option<SignContext>;
}

impl<F> SignContextSelector for F
where
    F: Fn(&Parts) -> Option<SignContext> + Send + Sync + 'static,
{
    fn select(&self, request: &Parts) -> Option<SignContext> {
        self(request)
    }
}

/// Header and signers for one response
#[derive(Clone)]
pub struct SignContext {
    /// Protected header of the response token
    pub header: Header,

    /// Signers, resolved by the header's `alg`
    pub signers: Arc<SignerRegistry>,
}

impl SignContext {
    /// Sign with `header` using `signers`
    pub fn new(header: Header, signers: Arc<SignerRegistry>) -> Self {
        Self { header, signers }
    }
}

impl fmt::Debug for SignContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignContext")
            .field("header", &self.header)
            .field("algorithms", &self.signers.algorithms())
            .finish()
    }
}
