//! Detached JWS demo server
//!
//! `POST /orders` only accepts bodies signed by the client key (PS256) and
//! answers with a body signed by the server key (ES256). `GET /health` is
//! neither verified nor signed.
//!
//! Key paths come from the environment and default to the test fixtures:
//!
//! - `JWS_DEMO_CLIENT_PUBLIC_KEY`: SPKI PEM used to verify requests
//! - `JWS_DEMO_SERVER_PRIVATE_KEY`: PKCS#8 PEM used to sign responses
//! - `JWS_DEMO_CLIENT_PRIVATE_KEY`: optional, logs a ready-made request token
//! - `JWS_DEMO_ADDR`: listen address, `127.0.0.1:8080` by default
//!
//! Middleware settings are read with `JwsDetachedConfig::from_env`.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use jws_detached::{
    Header, JwsAlgorithm, SignerRegistry, SigningKeyMaterial, VerifierRegistry,
    VerifyingKeyMaterial, sign_reader,
};
use jws_detached_http::{JwsDetachedConfig, JwsDetachedLayer, SignContext};

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../crates/jws-detached/tests/fixtures");
const SAMPLE_BODY: &str = r#"{"item":"coffee","quantity":2}"#;

#[derive(Debug, Deserialize)]
struct Order {
    item: String,
    quantity: u32,
}

#[derive(Debug, Serialize)]
struct Receipt {
    item: String,
    quantity: u32,
    accepted: bool,
}

async fn place_order(Json(order): Json<Order>) -> Json<Receipt> {
    tracing::info!(item = %order.item, quantity = order.quantity, "Order accepted");
    Json(Receipt {
        item: order.item,
        quantity: order.quantity,
        accepted: true,
    })
}

fn key_path(var: &str, fixture: &str) -> PathBuf {
    env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(FIXTURES).join(fixture))
}

fn read_pem(var: &str, fixture: &str) -> anyhow::Result<String> {
    let path = key_path(var, fixture);
    std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
}

/// Log a token for the sample body so the demo can be tried with curl
async fn log_sample_token() -> anyhow::Result<()> {
    let Some(path) = env::var_os("JWS_DEMO_CLIENT_PRIVATE_KEY") else {
        return Ok(());
    };
    let pem = std::fs::read_to_string(&path)?;
    let key = Arc::new(SigningKeyMaterial::from_pkcs8_pem(&pem)?);
    let signers = SignerRegistry::with_key(JwsAlgorithm::PS256, key)?;
    let token = sign_reader(
        &Header::new(JwsAlgorithm::PS256),
        &signers,
        SAMPLE_BODY.as_bytes(),
    )
    .await?;
    tracing::info!(body = SAMPLE_BODY, %token, "Sample request token");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jws_detached=debug,jws_detached_http=debug".into()),
        )
        .with_target(false)
        .init();

    let client_key = VerifyingKeyMaterial::from_public_key_pem(&read_pem(
        "JWS_DEMO_CLIENT_PUBLIC_KEY",
        "rsa_public.pem",
    )?)?;
    let server_key = SigningKeyMaterial::from_pkcs8_pem(&read_pem(
        "JWS_DEMO_SERVER_PRIVATE_KEY",
        "ec_private.pem",
    )?)?;

    let verifiers = Arc::new(VerifierRegistry::with_key(
        JwsAlgorithm::PS256,
        Arc::new(client_key),
    )?);
    let signers = Arc::new(SignerRegistry::with_key(
        JwsAlgorithm::ES256,
        Arc::new(server_key),
    )?);

    let config = JwsDetachedConfig::from_env()?;
    tracing::info!(?config, "Detached JWS configuration");

    let layer = JwsDetachedLayer::new(config)?
        .verify_with(move |request: &Parts| {
            (request.uri.path() != "/health").then(|| Arc::clone(&verifiers))
        })
        .sign_with(move |request: &Parts| {
            (request.uri.path() != "/health").then(|| {
                SignContext::new(
                    Header::new(JwsAlgorithm::ES256).with_claim("kid", "demo-server"),
                    Arc::clone(&signers),
                )
            })
        });

    let app = Router::new()
        .route("/orders", post(place_order))
        .route("/health", get(|| async { "ok" }))
        .layer(layer);

    log_sample_token().await?;

    let addr = env::var("JWS_DEMO_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app).await?;
    Ok(())
}
