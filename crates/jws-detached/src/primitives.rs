//! Built-in incremental primitives
//!
//! SHA-256 is computed incrementally over the signing input; the private or
//! public key operation runs once on the finished digest.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rsa::{pkcs1v15, pss};
use sha2::{Digest, Sha256};
use signature::{DigestSigner, DigestVerifier, RandomizedDigestSigner, SignatureEncoding};

use crate::{
    algorithms::{IncrementalInput, Signer, SignerFactory, Verifier, VerifierFactory},
    errors::JwsDetachedError,
    keys::{SigningKeyMaterial, VerifyingKeyMaterial},
    types::{Header, JwsAlgorithm},
    Result,
};

/// Key bound to one algorithm, ready to sign a digest
enum PrimitiveSigningKey {
    Ps256(pss::BlindedSigningKey<Sha256>),
    Rs256(pkcs1v15::SigningKey<Sha256>),
    Es256(p256::ecdsa::SigningKey),
}

impl PrimitiveSigningKey {
    fn sign_digest(&self, digest: Sha256) -> Result<Vec<u8>> {
        let signature = match self {
            Self::Ps256(key) => {
                let signature: pss::Signature = key.try_sign_digest_with_rng(&mut OsRng, digest)?;
                signature.to_vec()
            }
            Self::Rs256(key) => {
                let signature: pkcs1v15::Signature = key.try_sign_digest(digest)?;
                signature.to_vec()
            }
            Self::Es256(key) => {
                let signature: p256::ecdsa::Signature = key.try_sign_digest(digest)?;
                signature.to_bytes().to_vec()
            }
        };
        Ok(signature)
    }
}

/// Key bound to one algorithm, ready to check a digest
enum PrimitiveVerifyingKey {
    Ps256(pss::VerifyingKey<Sha256>),
    Rs256(pkcs1v15::VerifyingKey<Sha256>),
    Es256(p256::ecdsa::VerifyingKey),
}

impl PrimitiveVerifyingKey {
    fn verify_digest(&self, digest: Sha256, signature: &[u8]) -> bool {
        let outcome = match self {
            Self::Ps256(key) => pss::Signature::try_from(signature)
                .and_then(|signature| key.verify_digest(digest, &signature)),
            Self::Rs256(key) => pkcs1v15::Signature::try_from(signature)
                .and_then(|signature| key.verify_digest(digest, &signature)),
            Self::Es256(key) => p256::ecdsa::Signature::try_from(signature)
                .and_then(|signature| key.verify_digest(digest, &signature)),
        };

        if let Err(e) = &outcome {
            tracing::debug!(error = %e, "Signature check failed");
        }
        outcome.is_ok()
    }
}

/// Factory for the built-in algorithms with a fixed private key
#[derive(Clone)]
pub struct KeyedSignerFactory {
    algorithm: JwsAlgorithm,
    key: Arc<PrimitiveSigningKey>,
}

impl KeyedSignerFactory {
    /// Bind `key` to `algorithm`; the key type must fit the algorithm
    pub fn new(algorithm: JwsAlgorithm, key: Arc<SigningKeyMaterial>) -> Result<Self> {
        let primitive = match (algorithm, key.as_ref()) {
            (JwsAlgorithm::PS256, SigningKeyMaterial::Rsa(rsa)) => {
                PrimitiveSigningKey::Ps256(pss::BlindedSigningKey::new(rsa.clone()))
            }
            (JwsAlgorithm::RS256, SigningKeyMaterial::Rsa(rsa)) => {
                PrimitiveSigningKey::Rs256(pkcs1v15::SigningKey::new(rsa.clone()))
            }
            (JwsAlgorithm::ES256, SigningKeyMaterial::EcdsaP256(ec)) => {
                PrimitiveSigningKey::Es256(ec.clone())
            }
            (algorithm, key) => return Err(key_mismatch(algorithm, &format!("{key:?}"))),
        };

        Ok(Self {
            algorithm,
            key: Arc::new(primitive),
        })
    }

    /// Algorithm this factory signs with
    pub fn algorithm(&self) -> JwsAlgorithm {
        self.algorithm
    }
}

impl fmt::Debug for KeyedSignerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedSignerFactory")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SignerFactory for KeyedSignerFactory {
    fn create(&self, _header: &Header) -> Result<Box<dyn Signer>> {
        Ok(Box::new(KeyedSigner {
            algorithm: self.algorithm,
            key: Arc::clone(&self.key),
            digest: Some(Sha256::new()),
        }))
    }
}

/// Factory for the built-in algorithms with a fixed public key
#[derive(Clone)]
pub struct KeyedVerifierFactory {
    algorithm: JwsAlgorithm,
    key: Arc<PrimitiveVerifyingKey>,
}

impl KeyedVerifierFactory {
    /// Bind `key` to `algorithm`; the key type must fit the algorithm
    pub fn new(algorithm: JwsAlgorithm, key: Arc<VerifyingKeyMaterial>) -> Result<Self> {
        let primitive = match (algorithm, key.as_ref()) {
            (JwsAlgorithm::PS256, VerifyingKeyMaterial::Rsa(rsa)) => {
                PrimitiveVerifyingKey::Ps256(pss::VerifyingKey::new(rsa.clone()))
            }
            (JwsAlgorithm::RS256, VerifyingKeyMaterial::Rsa(rsa)) => {
                PrimitiveVerifyingKey::Rs256(pkcs1v15::VerifyingKey::new(rsa.clone()))
            }
            (JwsAlgorithm::ES256, VerifyingKeyMaterial::EcdsaP256(ec)) => {
                PrimitiveVerifyingKey::Es256(ec.clone())
            }
            (algorithm, _) => return Err(key_mismatch(algorithm, "public key")),
        };

        Ok(Self {
            algorithm,
            key: Arc::new(primitive),
        })
    }

    /// Algorithm this factory verifies
    pub fn algorithm(&self) -> JwsAlgorithm {
        self.algorithm
    }
}

impl fmt::Debug for KeyedVerifierFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedVerifierFactory")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl VerifierFactory for KeyedVerifierFactory {
    fn create(&self, _header: &Header) -> Result<Box<dyn Verifier>> {
        Ok(Box::new(KeyedVerifier {
            algorithm: self.algorithm,
            key: Arc::clone(&self.key),
            digest: Some(Sha256::new()),
        }))
    }
}

fn key_mismatch(algorithm: JwsAlgorithm, key: &str) -> JwsDetachedError {
    JwsDetachedError::ConfigurationError {
        reason: format!("{key} cannot be used with {algorithm}"),
    }
}

fn already_finalized() -> JwsDetachedError {
    JwsDetachedError::CryptographicError {
        reason: "primitive already finalized".to_string(),
    }
}

/// SHA-256 based signer for one operation
struct KeyedSigner {
    algorithm: JwsAlgorithm,
    key: Arc<PrimitiveSigningKey>,
    digest: Option<Sha256>,
}

impl fmt::Debug for KeyedSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedSigner")
            .field("algorithm", &self.algorithm)
            .field("finalized", &self.digest.is_none())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IncrementalInput for KeyedSigner {
    async fn update(&mut self, data: &[u8]) -> Result<()> {
        let digest = self.digest.as_mut().ok_or_else(already_finalized)?;
        Digest::update(digest, data);
        Ok(())
    }
}

#[async_trait]
impl Signer for KeyedSigner {
    async fn finalize(&mut self) -> Result<Vec<u8>> {
        let digest = self.digest.take().ok_or_else(already_finalized)?;
        self.key.sign_digest(digest)
    }
}

/// SHA-256 based verifier for one operation
struct KeyedVerifier {
    algorithm: JwsAlgorithm,
    key: Arc<PrimitiveVerifyingKey>,
    digest: Option<Sha256>,
}

impl fmt::Debug for KeyedVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedVerifier")
            .field("algorithm", &self.algorithm)
            .field("finalized", &self.digest.is_none())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IncrementalInput for KeyedVerifier {
    async fn update(&mut self, data: &[u8]) -> Result<()> {
        let digest = self.digest.as_mut().ok_or_else(already_finalized)?;
        Digest::update(digest, data);
        Ok(())
    }
}

#[async_trait]
impl Verifier for KeyedVerifier {
    async fn finalize(&mut self, signature: &[u8]) -> Result<bool> {
        let digest = self.digest.take().ok_or_else(already_finalized)?;
        Ok(self.key.verify_digest(digest, signature))
    }
}
