//! Streaming signature engine
//!
//! The signing input is `seg0 '.' base64url(payload)`. It is never built as a
//! whole: the header segment and the separator go to the primitive first,
//! then the payload passes through a [`Base64UrlEncoder`] chunk by chunk.

use std::mem;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    algorithms::{IncrementalInput, Signer, SignerRegistry, Verifier, VerifierRegistry},
    codec::DetachedToken,
    encoder::Base64UrlEncoder,
    errors::JwsDetachedError,
    types::Header,
    Result, PAYLOAD_CHUNK_SIZE,
};

/// Payload side shared by signer and verifier: base64url into the primitive
#[derive(Debug, Default)]
struct PayloadEncoder {
    encoder: Base64UrlEncoder,
    scratch: Vec<u8>,
}

impl PayloadEncoder {
    async fn update<P>(&mut self, primitive: &mut P, payload: &[u8]) -> Result<()>
    where
        P: IncrementalInput + ?Sized,
    {
        self.encoder.update(payload, &mut self.scratch);
        if !self.scratch.is_empty() {
            primitive.update(&self.scratch).await?;
        }
        Ok(())
    }

    async fn finish<P>(&mut self, primitive: &mut P) -> Result<()>
    where
        P: IncrementalInput + ?Sized,
    {
        mem::take(&mut self.encoder).finish(&mut self.scratch);
        if !self.scratch.is_empty() {
            primitive.update(&self.scratch).await?;
        }
        Ok(())
    }
}

async fn start<P>(primitive: &mut P, header_segment: &str) -> Result<()>
where
    P: IncrementalInput + ?Sized,
{
    primitive.update(header_segment.as_bytes()).await?;
    primitive.update(b".").await
}

/// Push-based detached signer
///
/// Feed the payload with [`update`](Self::update) in any chunking, then call
/// [`finish`](Self::finish) for the token.
#[derive(Debug)]
pub struct DetachedSigner {
    header_segment: String,
    signer: Box<dyn Signer>,
    payload: PayloadEncoder,
}

impl DetachedSigner {
    /// Resolve the signer for `header` and absorb the header segment
    pub async fn new(header: &Header, registry: &SignerRegistry) -> Result<Self> {
        let mut signer = registry.resolve(header)?;
        let header_segment = header.to_segment()?;
        start(signer.as_mut(), &header_segment).await?;

        Ok(Self {
            header_segment,
            signer,
            payload: PayloadEncoder::default(),
        })
    }

    /// Segment 0 of the token being produced
    pub fn header_segment(&self) -> &str {
        &self.header_segment
    }

    /// Absorb the next payload chunk
    pub async fn update(&mut self, payload: &[u8]) -> Result<()> {
        self.payload.update(self.signer.as_mut(), payload).await
    }

    /// Finish the payload and produce `seg0..seg2`
    pub async fn finish(mut self) -> Result<String> {
        self.payload.finish(self.signer.as_mut()).await?;
        let signature = self.signer.finalize().await?;
        Ok(DetachedToken::encode_with_segment(
            &self.header_segment,
            &signature,
        ))
    }
}

/// Push-based detached verifier
///
/// Built from a received token; the header segment is hashed exactly as it
/// appears on the wire.
#[derive(Debug)]
pub struct DetachedVerifier {
    header: Header,
    signature: Vec<u8>,
    canonical_signature: bool,
    verifier: Box<dyn Verifier>,
    payload: PayloadEncoder,
}

impl DetachedVerifier {
    /// Parse `token`, resolve the verifier and absorb the header segment
    pub async fn new(token: &str, registry: &VerifierRegistry) -> Result<Self> {
        let token = DetachedToken::parse(token)?;
        let mut verifier = registry.resolve(token.header())?;
        start(verifier.as_mut(), token.header_segment()).await?;

        let canonical_signature = token.has_canonical_signature();
        let (header, signature) = token.into_parts();
        Ok(Self {
            header,
            signature,
            canonical_signature,
            verifier,
            payload: PayloadEncoder::default(),
        })
    }

    /// Header decoded from the token
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Absorb the next payload chunk
    pub async fn update(&mut self, payload: &[u8]) -> Result<()> {
        self.payload.update(self.verifier.as_mut(), payload).await
    }

    /// Check the signature; the header on success, `None` on mismatch
    pub async fn finish(mut self) -> Result<Option<Header>> {
        self.payload.finish(self.verifier.as_mut()).await?;
        let valid = self.verifier.finalize(&self.signature).await?;
        if valid && self.canonical_signature {
            Ok(Some(self.header))
        } else {
            Ok(None)
        }
    }
}

/// Sign everything `payload` yields
pub async fn sign_reader<R>(
    header: &Header,
    registry: &SignerRegistry,
    mut payload: R,
) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut signer = DetachedSigner::new(header, registry).await?;
    let mut chunk = vec![0u8; PAYLOAD_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = payload
            .read(&mut chunk)
            .await
            .map_err(JwsDetachedError::from_read)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        signer.update(&chunk[..n]).await?;
    }

    let token = signer.finish().await?;
    tracing::debug!(alg = header.algorithm(), bytes = total, "Signed payload");
    Ok(token)
}

/// Verify `token` against everything `payload` yields.
///
/// `Ok(None)` is a signature mismatch; structural problems with the token are
/// errors.
pub async fn verify_reader<R>(
    token: &str,
    registry: &VerifierRegistry,
    mut payload: R,
) -> Result<Option<Header>>
where
    R: AsyncRead + Unpin,
{
    let mut verifier = DetachedVerifier::new(token, registry).await?;
    let mut chunk = vec![0u8; PAYLOAD_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = payload
            .read(&mut chunk)
            .await
            .map_err(JwsDetachedError::from_read)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        verifier.update(&chunk[..n]).await?;
    }

    let algorithm = verifier.header().algorithm().map(str::to_owned);
    let outcome = verifier.finish().await?;
    tracing::debug!(
        alg = algorithm.as_deref(),
        bytes = total,
        valid = outcome.is_some(),
        "Verified payload"
    );
    Ok(outcome)
}
