//! Tower middleware verifying request bodies and signing response bodies
//!
//! For each request the layer asks its selectors whether verification and
//! signing apply. A selected verifier makes the request body replayable,
//! streams it through the verifier and rewinds it before the handler sees it.
//! A selected signing context captures the response body and attaches the
//! token, either as a header (buffered) or as a trailer (sliding).

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, TRAILER, UPGRADE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use jws_detached::{
    BodyStream, BufferingPolicy, BufferingWriter, DetachedSigner, JwsDetachedError,
    PAYLOAD_CHUNK_SIZE, Result, SeekableBody, SpillBuffer, TeeWriter, VerifierRegistry,
    make_seekable, sign_reader, verify_reader,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::config::{JwsDetachedConfig, ResponseSigning};
use crate::selector::{SignContext, SignContextSelector, VerifierSelector};
use crate::stage::{Stage, StageTracker};

/// HTTP status for a failure surfaced at the middleware boundary
pub fn status_for(err: &JwsDetachedError) -> StatusCode {
    match err {
        JwsDetachedError::HeaderNotFound { .. } | JwsDetachedError::InvalidSignature => {
            StatusCode::FORBIDDEN
        }
        JwsDetachedError::MalformedToken { .. } | JwsDetachedError::UnsupportedAlgorithm { .. } => {
            StatusCode::BAD_REQUEST
        }
        JwsDetachedError::ReadBufferLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Plain-text error response for `err`
pub fn error_response(err: &JwsDetachedError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        warn!(error = %err, status = status.as_u16(), "Detached JWS processing failed");
    } else {
        debug!(error = %err, status = status.as_u16(), "Request rejected");
    }
    (status, err.to_string()).into_response()
}

/// Layer applying detached JWS verification and signing
#[derive(Clone)]
pub struct JwsDetachedLayer {
    shared: Arc<Shared>,
}

struct Shared {
    header: HeaderName,
    config: JwsDetachedConfig,
    verifiers: Option<Arc<dyn VerifierSelector>>,
    signers: Option<Arc<dyn SignContextSelector>>,
}

impl JwsDetachedLayer {
    /// Layer with `config` and no selectors; requests pass through untouched
    pub fn new(config: JwsDetachedConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                header: config.header()?,
                config,
                verifiers: None,
                signers: None,
            }),
        })
    }

    /// Verify requests for which `selector` returns verifiers
    #[must_use]
    pub fn verify_with(self, selector: impl VerifierSelector) -> Self {
        self.map_shared(|shared| shared.verifiers = Some(Arc::new(selector)))
    }

    /// Verify every request with `verifiers`
    #[must_use]
    pub fn verify_all(self, verifiers: Arc<VerifierRegistry>) -> Self {
        self.verify_with(move |_: &Parts| Some(verifiers.clone()))
    }

    /// Sign responses for which `selector` returns a context
    #[must_use]
    pub fn sign_with(self, selector: impl SignContextSelector) -> Self {
        self.map_shared(|shared| shared.signers = Some(Arc::new(selector)))
    }

    /// Sign every response with `context`
    #[must_use]
    pub fn sign_all(self, context: SignContext) -> Self {
        self.sign_with(move |_: &Parts| Some(context.clone()))
    }

    /// The validated configuration
    pub fn config(&self) -> &JwsDetachedConfig {
        &self.shared.config
    }

    fn map_shared(self, f: impl FnOnce(&mut Shared)) -> Self {
        let mut shared = match Arc::try_unwrap(self.shared) {
            Ok(shared) => shared,
            Err(shared) => Shared {
                header: shared.header.clone(),
                config: shared.config.clone(),
                verifiers: shared.verifiers.clone(),
                signers: shared.signers.clone(),
            },
        };
        f(&mut shared);
        Self {
            shared: Arc::new(shared),
        }
    }
}

impl fmt::Debug for JwsDetachedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwsDetachedLayer")
            .field("header", &self.shared.header)
            .field("config", &self.shared.config)
            .field("verifies", &self.shared.verifiers.is_some())
            .field("signs", &self.shared.signers.is_some())
            .finish()
    }
}

impl<S> Layer<S> for JwsDetachedLayer {
    type Service = JwsDetachedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JwsDetachedService {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Service produced by [`JwsDetachedLayer`]
#[derive(Clone)]
pub struct JwsDetachedService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> fmt::Debug for JwsDetachedService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwsDetachedService")
            .field("header", &self.shared.header)
            .finish_non_exhaustive()
    }
}

impl<S> Service<Request<Body>> for JwsDetachedService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // the clone may not be ready; keep the one that was polled
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = Arc::clone(&self.shared);

        Box::pin(async move {
            if is_upgrade(&request) {
                debug!(method = %request.method(), "Upgrade request, skipping detached JWS");
                return inner.call(request).await;
            }

            let mut stage = StageTracker::new();
            let (parts, body) = request.into_parts();
            let verifiers = shared
                .verifiers
                .as_deref()
                .and_then(|selector| VerifierSelector::select(selector, &parts));
            let sign_context = shared
                .signers
                .as_deref()
                .and_then(|selector| SignContextSelector::select(selector, &parts));

            let request = match verifiers {
                Some(verifiers) => {
                    match verify_request(&shared, &mut stage, parts, body, &verifiers).await {
                        Ok(request) => request,
                        Err(err) => {
                            stage.fail(&err);
                            return Ok(error_response(&err));
                        }
                    }
                }
                None => Request::from_parts(parts, body),
            };

            stage.advance(Stage::HandlerRunning);
            let response = inner.call(request).await?;

            let Some(context) = sign_context else {
                stage.advance(Stage::Done);
                return Ok(response);
            };

            Ok(match shared.config.response_signing {
                ResponseSigning::Buffered => {
                    match sign_buffered(&shared, &mut stage, &context, response).await {
                        Ok(response) => response,
                        Err(err) => {
                            stage.fail(&err);
                            error_response(&err)
                        }
                    }
                }
                ResponseSigning::Sliding => sign_sliding(&shared, stage, context, response),
            })
        })
    }
}

fn is_upgrade<B>(request: &Request<B>) -> bool {
    request.method() == Method::CONNECT || request.headers().contains_key(UPGRADE)
}

fn body_reader(body: Body) -> impl AsyncRead + Send + Unpin + 'static {
    StreamReader::new(TryStreamExt::map_err(body.into_data_stream(), io::Error::other))
}

fn body_error(err: axum::Error) -> JwsDetachedError {
    JwsDetachedError::IoError {
        reason: format!("body stream failed: {err}"),
    }
}

fn token_value(token: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(token).map_err(|_| JwsDetachedError::CryptographicError {
        reason: "produced token is not a valid header value".to_string(),
    })
}

async fn verify_request(
    shared: &Shared,
    stage: &mut StageTracker,
    parts: Parts,
    body: Body,
    verifiers: &VerifierRegistry,
) -> Result<Request<Body>> {
    stage.advance(Stage::RequestBuffering);
    let mut body = make_seekable(
        BodyStream::sequential(body_reader(body)),
        &shared.config.request_buffering,
    );

    match verify_body(shared, stage, &parts, &mut body, verifiers).await {
        Ok(()) => {
            // the body releases its buffer once the handler has read or dropped it
            let body = Body::from_stream(ReaderStream::new(body));
            Ok(Request::from_parts(parts, body))
        }
        Err(err) => {
            if let Err(e) = body.release().await {
                warn!(error = %e, "Failed to release request buffer");
            }
            Err(err)
        }
    }
}

async fn verify_body(
    shared: &Shared,
    stage: &mut StageTracker,
    parts: &Parts,
    body: &mut SeekableBody,
    verifiers: &VerifierRegistry,
) -> Result<()> {
    stage.advance(Stage::Verifying);

    // a missing header is the caller's fault whatever the buffering policy
    let token = parts
        .headers
        .get(&shared.header)
        .ok_or_else(|| JwsDetachedError::HeaderNotFound {
            header_name: shared.header.to_string(),
        })?
        .to_str()
        .map_err(|_| JwsDetachedError::malformed("signature header is not visible ASCII"))?;
    let start = body.position().await?;

    let Some(header) = verify_reader(token, verifiers, &mut *body).await? else {
        return Err(JwsDetachedError::InvalidSignature);
    };

    body.restore(start).await?;
    stage.advance(Stage::VerifiedOk);
    debug!(
        alg = header.algorithm(),
        path = %parts.uri.path(),
        "Request signature verified"
    );
    Ok(())
}

async fn sign_buffered(
    shared: &Shared,
    stage: &mut StageTracker,
    context: &SignContext,
    response: Response,
) -> Result<Response> {
    let (mut parts, body) = response.into_parts();

    stage.advance(Stage::ResponseBuffering);
    let mut writer = BufferingWriter::new(&shared.config.response_buffering);
    let trailers = match capture_body(body, &mut writer).await {
        Ok(trailers) => trailers,
        Err(err) => {
            if let Err(e) = writer.release().await {
                warn!(error = %e, "Failed to release response buffer");
            }
            return Err(err);
        }
    };
    let mut buffer = writer.finish().await?;

    stage.advance(Stage::Signing);
    let token = match sign_buffer(context, &mut buffer).await {
        Ok(token) => token,
        Err(err) => {
            if let Err(e) = buffer.release().await {
                warn!(error = %e, "Failed to release response buffer");
            }
            return Err(err);
        }
    };

    parts.headers.insert(shared.header.clone(), token_value(&token)?);
    stage.advance(Stage::Done);
    debug!(
        alg = context.header.algorithm(),
        bytes = buffer.len(),
        "Response signed"
    );
    Ok(Response::from_parts(parts, replay_body(buffer, trailers)))
}

async fn capture_body(mut body: Body, writer: &mut BufferingWriter) -> Result<Option<HeaderMap>> {
    let mut trailers = None;
    while let Some(frame) = body.frame().await {
        match frame.map_err(body_error)?.into_data() {
            Ok(data) => writer.write_all(&data).await?,
            Err(frame) => trailers = frame.into_trailers().ok(),
        }
    }
    writer.flush().await?;
    Ok(trailers)
}

async fn sign_buffer(context: &SignContext, buffer: &mut SpillBuffer) -> Result<String> {
    let token = sign_reader(&context.header, &context.signers, &mut *buffer).await?;
    buffer.rewind().await?;
    Ok(token)
}

/// Stream a signed buffer, releasing it once sent
fn replay_body(mut buffer: SpillBuffer, trailers: Option<HeaderMap>) -> Body {
    let frames = async_stream::stream! {
        let mut chunk = BytesMut::new();
        loop {
            chunk.reserve(PAYLOAD_CHUNK_SIZE);
            match buffer.read_buf(&mut chunk).await {
                Ok(0) => break,
                Ok(_) => yield Ok(Frame::data(chunk.split().freeze())),
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        if let Err(e) = buffer.release().await {
            warn!(error = %e, "Failed to release response buffer");
        }
        if let Some(trailers) = trailers {
            yield Ok(Frame::trailers(trailers));
        }
    };
    Body::new(StreamBody::new(frames))
}

/// Where sliding-write bytes are captured for signing
enum SlidingCapture {
    /// Unbuffered; every chunk goes straight into the signer
    Direct(DetachedSigner),
    /// Captured through a tee and signed once the body is complete
    Tee(TeeWriter<Vec<u8>>),
}

impl SlidingCapture {
    async fn new(policy: &BufferingPolicy, context: &SignContext) -> Result<Self> {
        if policy.is_disabled() {
            let signer = DetachedSigner::new(&context.header, &context.signers).await?;
            return Ok(Self::Direct(signer));
        }
        Ok(Self::Tee(TeeWriter::new(
            Vec::new(),
            BufferingWriter::new(policy),
        )))
    }

    /// Capture `data`, returning the bytes to forward
    async fn forward(&mut self, data: Bytes) -> Result<Bytes> {
        match self {
            Self::Direct(signer) => {
                signer.update(&data).await?;
                Ok(data)
            }
            Self::Tee(tee) => {
                tee.write_all(&data).await?;
                Ok(Bytes::from(std::mem::take(tee.get_mut())))
            }
        }
    }

    async fn finish(self, context: &SignContext) -> Result<String> {
        match self {
            Self::Direct(signer) => signer.finish().await,
            Self::Tee(tee) => {
                let (_, mut captured) = tee.finish().await?;
                let signed = sign_reader(&context.header, &context.signers, &mut captured).await;
                captured.release().await?;
                signed
            }
        }
    }

    async fn release(self) {
        if let Self::Tee(tee) = self
            && let Err(e) = tee.release().await
        {
            warn!(error = %e, "Failed to release response capture");
        }
    }
}

/// Forward the response as it is produced; the token follows as a trailer.
///
/// A failure after the head was sent ends the body with an error and no
/// trailer, so the client never sees a signature for a truncated body.
fn sign_sliding(
    shared: &Arc<Shared>,
    mut stage: StageTracker,
    context: SignContext,
    response: Response,
) -> Response {
    let (mut parts, mut body) = response.into_parts();
    parts.headers.remove(CONTENT_LENGTH);
    parts
        .headers
        .append(TRAILER, HeaderValue::from(shared.header.clone()));

    let shared = Arc::clone(shared);
    let frames = async_stream::stream! {
        stage.advance(Stage::ResponseBuffering);
        let mut capture = match SlidingCapture::new(&shared.config.response_buffering, &context).await {
            Ok(capture) => capture,
            Err(err) => {
                stage.fail(&err);
                yield Err(err);
                return;
            }
        };

        let mut trailers = None;
        while let Some(frame) = body.frame().await {
            let outcome = match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => capture.forward(data).await.map(Some),
                    Err(frame) => {
                        trailers = frame.into_trailers().ok();
                        Ok(None)
                    }
                },
                Err(e) => Err(body_error(e)),
            };
            match outcome {
                Ok(Some(data)) => yield Ok(Frame::data(data)),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Aborting sliding response");
                    stage.fail(&err);
                    capture.release().await;
                    yield Err(err);
                    return;
                }
            }
        }

        stage.advance(Stage::Signing);
        let token = match capture.finish(&context).await {
            Ok(token) => token,
            Err(err) => {
                stage.fail(&err);
                yield Err(err);
                return;
            }
        };
        let value = match token_value(&token) {
            Ok(value) => value,
            Err(err) => {
                stage.fail(&err);
                yield Err(err);
                return;
            }
        };

        let mut trailers: HeaderMap = trailers.unwrap_or_default();
        trailers.insert(shared.header.clone(), value);
        stage.advance(Stage::Done);
        debug!(alg = context.header.algorithm(), "Response signed, sending trailer");
        yield Ok(Frame::trailers(trailers));
    };

    Response::from_parts(parts, Body::new(StreamBody::new(frames)))
}
