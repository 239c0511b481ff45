//! End-to-end tests of the middleware in front of an axum router
//!
//! Clients sign request bodies with an RSA key (PS256); the server signs
//! responses with a P-256 key (ES256).

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::header::TRAILER;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use tower::ServiceExt;

use jws_detached::{
    BufferingPolicy, DetachedToken, Header, JwsAlgorithm, Result, SignerRegistry,
    SigningKeyMaterial, VerifierRegistry, VerifyingKeyMaterial, sign_reader, verify_reader,
};
use jws_detached_http::{JwsDetachedConfig, JwsDetachedLayer, ResponseSigning, SignContext};

const HEADER: &str = "x-jws-signature";
const CLIENT_PRIVATE: &str = include_str!("../../jws-detached/tests/fixtures/rsa_private.pem");
const CLIENT_PUBLIC: &str = include_str!("../../jws-detached/tests/fixtures/rsa_public.pem");
const SERVER_PRIVATE: &str = include_str!("../../jws-detached/tests/fixtures/ec_private.pem");
const SERVER_PUBLIC: &str = include_str!("../../jws-detached/tests/fixtures/ec_public.pem");

struct Keys {
    client_signers: SignerRegistry,
    request_verifiers: Arc<VerifierRegistry>,
    server_signers: Arc<SignerRegistry>,
    response_verifiers: VerifierRegistry,
}

fn keys() -> Result<Keys> {
    let client = Arc::new(SigningKeyMaterial::from_pkcs8_pem(CLIENT_PRIVATE)?);
    let client_public = Arc::new(VerifyingKeyMaterial::from_public_key_pem(CLIENT_PUBLIC)?);
    let server = Arc::new(SigningKeyMaterial::from_pkcs8_pem(SERVER_PRIVATE)?);
    let server_public = Arc::new(VerifyingKeyMaterial::from_public_key_pem(SERVER_PUBLIC)?);

    Ok(Keys {
        client_signers: SignerRegistry::with_key(JwsAlgorithm::PS256, client)?,
        request_verifiers: Arc::new(VerifierRegistry::with_key(
            JwsAlgorithm::PS256,
            client_public,
        )?),
        server_signers: Arc::new(SignerRegistry::with_key(JwsAlgorithm::ES256, server)?),
        response_verifiers: VerifierRegistry::with_key(JwsAlgorithm::ES256, server_public)?,
    })
}

fn sign_context(keys: &Keys) -> SignContext {
    SignContext::new(
        Header::new(JwsAlgorithm::ES256),
        Arc::clone(&keys.server_signers),
    )
}

fn echo_router(layer: JwsDetachedLayer) -> Router {
    Router::new()
        .route("/echo", post(|body: Bytes| async move { body }))
        .layer(layer)
}

fn signed_request(token: &str, payload: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/echo")
        .header(HEADER, token)
        .body(payload.into())
        .unwrap()
}

async fn client_token(keys: &Keys, payload: &[u8]) -> Result<String> {
    sign_reader(&Header::new(JwsAlgorithm::PS256), &keys.client_signers, payload).await
}

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// A correctly signed request reaches the handler with its body intact
#[tokio::test]
async fn test_signed_request_reaches_handler() -> Result<()> {
    let keys = keys()?;
    let layer = JwsDetachedLayer::new(JwsDetachedConfig::default())?
        .verify_all(Arc::clone(&keys.request_verifiers));

    let token = client_token(&keys, b"Request body").await?;
    let response = echo_router(layer)
        .oneshot(signed_request(&token, "Request body"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "Request body");
    Ok(())
}

/// Rejections map to 403 / 400 and never run the handler
#[tokio::test]
async fn test_rejected_requests_skip_handler() -> Result<()> {
    let keys = keys()?;
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = Arc::clone(&hits);
    let layer = JwsDetachedLayer::new(JwsDetachedConfig::default())?
        .verify_all(Arc::clone(&keys.request_verifiers));
    let router = Router::new()
        .route(
            "/echo",
            post(move |body: Bytes| {
                handler_hits.fetch_add(1, Ordering::SeqCst);
                async move { body }
            }),
        )
        .layer(layer);

    let token = client_token(&keys, b"Request body").await?;

    // tampered body
    let response = router
        .clone()
        .oneshot(signed_request(&token, "Request Body"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // missing header
    let unsigned = Request::builder()
        .method(Method::POST)
        .uri("/echo")
        .body(Body::from("Request body"))
        .unwrap();
    let response = router.clone().oneshot(unsigned).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_text(response).await.contains(HEADER));

    // four segments
    let response = router
        .clone()
        .oneshot(signed_request(&format!("{token}.x"), "Request body"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // unregistered algorithm
    let hs256 = DetachedToken::encode(&Header::new("HS256"), b"not a signature")?;
    let response = router
        .clone()
        .oneshot(signed_request(&hs256, "Request body"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    Ok(())
}

/// A large body spills to disk, is verified, replayed, and cleaned up
#[tokio::test]
async fn test_file_buffered_request_is_replayed_and_released() -> Result<()> {
    let keys = keys()?;
    let dir = tempfile::tempdir()?;
    let config = JwsDetachedConfig::builder()
        .request_buffering(
            BufferingPolicy::file()
                .with_threshold(1024)
                .with_temp_dir(dir.path()),
        )
        .build()?;
    let layer = JwsDetachedLayer::new(config)?.verify_all(Arc::clone(&keys.request_verifiers));

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let token = client_token(&keys, &payload).await?;

    let response = echo_router(layer)
        .oneshot(signed_request(&token, payload.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let echoed = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(echoed.as_ref(), payload.as_slice());
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

/// A request body over the limit is refused with 413 and leaves no file
#[tokio::test]
async fn test_request_limit() -> Result<()> {
    let keys = keys()?;
    let dir = tempfile::tempdir()?;
    let config = JwsDetachedConfig::builder()
        .request_buffering(
            BufferingPolicy::file()
                .with_threshold(512)
                .with_limit(4096)
                .with_temp_dir(dir.path()),
        )
        .build()?;
    let layer = JwsDetachedLayer::new(config)?.verify_all(Arc::clone(&keys.request_verifiers));

    let payload = vec![b'x'; 10_000];
    let token = client_token(&keys, &payload).await?;
    let response = echo_router(layer)
        .oneshot(signed_request(&token, payload))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

/// Without request buffering a missing header is still a 403, while a signed
/// request cannot be replayed and fails with 500
#[tokio::test]
async fn test_unbuffered_request_checks_header_first() -> Result<()> {
    let keys = keys()?;
    let config = JwsDetachedConfig::builder()
        .request_buffering(BufferingPolicy::Disabled)
        .build()?;
    let layer = JwsDetachedLayer::new(config)?.verify_all(Arc::clone(&keys.request_verifiers));
    let router = echo_router(layer);

    let unsigned = Request::builder()
        .method(Method::POST)
        .uri("/echo")
        .body(Body::from("Request body"))
        .unwrap();
    let response = router.clone().oneshot(unsigned).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let token = client_token(&keys, b"Request body").await?;
    let response = router
        .oneshot(signed_request(&token, "Request body"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    Ok(())
}

/// Only requests picked by the selector are verified
#[tokio::test]
async fn test_selector_limits_verification() -> Result<()> {
    let keys = keys()?;
    let verifiers = Arc::clone(&keys.request_verifiers);
    let layer = JwsDetachedLayer::new(JwsDetachedConfig::default())?.verify_with(
        move |request: &Parts| {
            request
                .uri
                .path()
                .starts_with("/secure")
                .then(|| Arc::clone(&verifiers))
        },
    );
    let router = Router::new()
        .route("/open", post(|| async { "open" }))
        .route("/secure", post(|| async { "secure" }))
        .layer(layer);

    let open = Request::builder()
        .method(Method::POST)
        .uri("/open")
        .body(Body::from("anything"))
        .unwrap();
    assert_eq!(router.clone().oneshot(open).await.unwrap().status(), StatusCode::OK);

    let secure = Request::builder()
        .method(Method::POST)
        .uri("/secure")
        .body(Body::from("anything"))
        .unwrap();
    assert_eq!(
        router.oneshot(secure).await.unwrap().status(),
        StatusCode::FORBIDDEN
    );
    Ok(())
}

/// Upgrade requests bypass verification and signing
#[tokio::test]
async fn test_upgrade_passes_through() -> Result<()> {
    let keys = keys()?;
    let layer = JwsDetachedLayer::new(JwsDetachedConfig::default())?
        .verify_all(Arc::clone(&keys.request_verifiers))
        .sign_all(sign_context(&keys));
    let router = Router::new()
        .route("/ws", get(|| async { "upgraded" }))
        .layer(layer);

    let request = Request::builder()
        .uri("/ws")
        .header("upgrade", "websocket")
        .header("connection", "upgrade")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(HEADER).is_none());
    Ok(())
}

/// Buffered signing puts the token in a response header
#[tokio::test]
async fn test_buffered_response_signing() -> Result<()> {
    let keys = keys()?;
    let layer = JwsDetachedLayer::new(JwsDetachedConfig::default())?
        .verify_all(Arc::clone(&keys.request_verifiers))
        .sign_all(sign_context(&keys));

    let token = client_token(&keys, b"Request body").await?;
    let response = echo_router(layer)
        .oneshot(signed_request(&token, "Request body"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response_token = response
        .headers()
        .get(HEADER)
        .expect("response token")
        .to_str()
        .unwrap()
        .to_string();
    let body = body_text(response).await;
    assert_eq!(body, "Request body");

    let header = verify_reader(&response_token, &keys.response_verifiers, body.as_bytes()).await?;
    assert_eq!(header, Some(Header::new(JwsAlgorithm::ES256)));
    Ok(())
}

/// A response over the capture limit is a 500, not an unsigned 200
#[tokio::test]
async fn test_buffered_response_limit() -> Result<()> {
    let keys = keys()?;
    let config = JwsDetachedConfig::builder()
        .response_buffering(BufferingPolicy::memory().with_limit(16))
        .build()?;
    let layer = JwsDetachedLayer::new(config)?.sign_all(sign_context(&keys));
    let router = Router::new()
        .route("/big", get(|| async { "x".repeat(1024) }))
        .layer(layer);

    let request = Request::builder().uri("/big").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get(HEADER).is_none());
    Ok(())
}

fn streaming_router(layer: JwsDetachedLayer) -> Router {
    Router::new()
        .route(
            "/stream",
            get(|| async {
                let chunks = vec![
                    Ok::<_, io::Error>("chunk one, "),
                    Ok("chunk two, "),
                    Ok("chunk three"),
                ];
                Body::from_stream(futures::stream::iter(chunks))
            }),
        )
        .layer(layer)
}

async fn sliding_round_trip(policy: BufferingPolicy) -> Result<()> {
    let keys = keys()?;
    let config = JwsDetachedConfig::builder()
        .response_buffering(policy)
        .response_signing(ResponseSigning::Sliding)
        .build()?;
    let layer = JwsDetachedLayer::new(config)?.sign_all(sign_context(&keys));

    let request = Request::builder().uri("/stream").body(Body::empty()).unwrap();
    let response = streaming_router(layer).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(TRAILER).unwrap(), HEADER);
    assert!(response.headers().get(HEADER).is_none());

    let collected = response.into_body().collect().await.unwrap();
    let trailers: HeaderMap = collected.trailers().cloned().expect("trailers");
    let body = collected.to_bytes();
    assert_eq!(body.as_ref(), b"chunk one, chunk two, chunk three");

    let token = trailers.get(HEADER).unwrap().to_str().unwrap().to_string();
    let header = verify_reader(&token, &keys.response_verifiers, body.as_ref()).await?;
    assert!(header.is_some());
    Ok(())
}

/// Sliding signing through a tee capture
#[tokio::test]
async fn test_sliding_response_signing_with_capture() -> Result<()> {
    sliding_round_trip(BufferingPolicy::memory()).await
}

/// Sliding signing straight into the signer
#[tokio::test]
async fn test_sliding_response_signing_unbuffered() -> Result<()> {
    sliding_round_trip(BufferingPolicy::Disabled).await
}

/// A sliding response over the capture limit fails its body and has no trailer
#[tokio::test]
async fn test_sliding_response_limit_aborts_body() -> Result<()> {
    let keys = keys()?;
    let config = JwsDetachedConfig::builder()
        .response_buffering(BufferingPolicy::memory().with_limit(15))
        .response_signing(ResponseSigning::Sliding)
        .build()?;
    let layer = JwsDetachedLayer::new(config)?.sign_all(sign_context(&keys));

    let request = Request::builder().uri("/stream").body(Body::empty()).unwrap();
    let response = streaming_router(layer).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let first = body.frame().await.unwrap().unwrap();
    assert_eq!(first.into_data().unwrap().as_ref(), b"chunk one, ");

    let second = body.frame().await.unwrap();
    assert!(second.is_err());
    Ok(())
}
