//! Signing capabilities and the `alg` registry
//!
//! A capability is an incremental primitive: it accepts the signing input in
//! pieces and produces (or checks) a signature once. Capabilities are created
//! per operation by factories registered under an `alg` name. Adding an
//! algorithm means registering another factory.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    errors::JwsDetachedError,
    keys::{SigningKeyMaterial, VerifyingKeyMaterial},
    primitives::{KeyedSignerFactory, KeyedVerifierFactory},
    types::{Header, JwsAlgorithm},
    Result,
};

/// Shared input side of signers and verifiers
#[async_trait]
pub trait IncrementalInput: Send + fmt::Debug {
    /// Absorb the next piece of the signing input
    async fn update(&mut self, data: &[u8]) -> Result<()>;
}

/// Incremental signature producer
#[async_trait]
pub trait Signer: IncrementalInput {
    /// Produce the signature over everything passed to `update`.
    ///
    /// Called at most once; the hash context is released afterwards.
    async fn finalize(&mut self) -> Result<Vec<u8>>;
}

/// Incremental signature checker
#[async_trait]
pub trait Verifier: IncrementalInput {
    /// Check `signature` against everything passed to `update`.
    ///
    /// A mismatch is `Ok(false)`. Errors are reserved for primitive failures.
    async fn finalize(&mut self, signature: &[u8]) -> Result<bool>;
}

/// Creates a [`Signer`] for one signing operation
pub trait SignerFactory: Send + Sync {
    /// Build a signer for `header`; the whole header is available for key selection
    fn create(&self, header: &Header) -> Result<Box<dyn Signer>>;
}

/// Creates a [`Verifier`] for one verification operation
pub trait VerifierFactory: Send + Sync {
    /// Build a verifier for `header`; the whole header is available for key selection
    fn create(&self, header: &Header) -> Result<Box<dyn Verifier>>;
}

/// Table of capability factories keyed by `alg`
pub struct AlgorithmRegistry<F: ?Sized> {
    factories: HashMap<String, Arc<F>>,
}

/// Registry of signing capabilities
pub type SignerRegistry = AlgorithmRegistry<dyn SignerFactory>;

/// Registry of verification capabilities
pub type VerifierRegistry = AlgorithmRegistry<dyn VerifierFactory>;

impl<F: ?Sized> AlgorithmRegistry<F> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `factory` under `algorithm`, replacing any previous entry
    pub fn register(&mut self, algorithm: impl Into<String>, factory: Arc<F>) -> &mut Self {
        self.factories.insert(algorithm.into(), factory);
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, algorithm: impl Into<String>, factory: Arc<F>) -> Self {
        self.register(algorithm, factory);
        self
    }

    /// Whether `algorithm` has a registered factory
    pub fn contains(&self, algorithm: &str) -> bool {
        self.factories.contains_key(algorithm)
    }

    /// Registered algorithm names, sorted
    pub fn algorithms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered algorithms
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn lookup(&self, header: &Header) -> Result<&Arc<F>> {
        let Some(algorithm) = header.algorithm() else {
            return Err(JwsDetachedError::UnsupportedAlgorithm { algorithm: None });
        };

        self.factories
            .get(algorithm)
            .ok_or_else(|| JwsDetachedError::UnsupportedAlgorithm {
                algorithm: Some(algorithm.to_string()),
            })
    }
}

impl<F: ?Sized> Default for AlgorithmRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> Clone for AlgorithmRegistry<F> {
    fn clone(&self) -> Self {
        Self {
            factories: self.factories.clone(),
        }
    }
}

impl<F: ?Sized> fmt::Debug for AlgorithmRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("algorithms", &self.algorithms())
            .finish()
    }
}

impl SignerRegistry {
    /// Registry with a single built-in algorithm bound to `key`
    pub fn with_key(algorithm: JwsAlgorithm, key: Arc<SigningKeyMaterial>) -> Result<Self> {
        let factory = KeyedSignerFactory::new(algorithm, key)?;
        Ok(Self::new().with(algorithm.as_str(), Arc::new(factory)))
    }

    /// Resolve the signer for `header["alg"]`
    pub fn resolve(&self, header: &Header) -> Result<Box<dyn Signer>> {
        self.lookup(header)?.create(header)
    }
}

impl VerifierRegistry {
    /// Registry with a single built-in algorithm bound to `key`
    pub fn with_key(algorithm: JwsAlgorithm, key: Arc<VerifyingKeyMaterial>) -> Result<Self> {
        let factory = KeyedVerifierFactory::new(algorithm, key)?;
        Ok(Self::new().with(algorithm.as_str(), Arc::new(factory)))
    }

    /// Resolve the verifier for `header["alg"]`
    pub fn resolve(&self, header: &Header) -> Result<Box<dyn Verifier>> {
        self.lookup(header)?.create(header)
    }
}
