// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Provider tests against mock CA servers.
//!
//! Each test starts an axum server on an ephemeral port that records the
//! request it receives and answers with a canned response.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use ca_client::constants::{CITADEL_SIGN_PATH, GOOGLE_CA_SIGN_PATH};
use ca_client::{CaClientConfig, CaError, ProviderKind, SignRequest, generate_csr, new_ca_client};
use serde_json::{Value, json};

const IDENTITY: &str = "spiffe://cluster.local/ns/ns1/sa/svc1";

#[derive(Clone, Default)]
struct Recorded {
    authorization: Arc<Mutex<Option<String>>>,
    body: Arc<Mutex<Option<Value>>>,
}

#[derive(Clone)]
struct MockState {
    recorded: Recorded,
    status: StatusCode,
    reply: String,
}

async fn handler(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    *state.recorded.authorization.lock().unwrap() = headers
        .get("authorization")
        .map(|v| v.to_str().unwrap().to_string());
    *state.recorded.body.lock().unwrap() = Some(body);
    (state.status, state.reply.clone()).into_response()
}

/// Starts a mock CA answering `path` and returns its base URL.
async fn spawn_mock_ca(path: &str, status: StatusCode, reply: String) -> (String, Recorded) {
    let recorded = Recorded::default();
    let state = MockState {
        recorded: recorded.clone(),
        status,
        reply,
    };
    let app = Router::new().route(path, post(handler)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), recorded)
}

fn test_chain() -> Vec<String> {
    let leaf = rcgen::generate_simple_self_signed(vec!["leaf.test".to_string()]).unwrap();
    let root = rcgen::generate_simple_self_signed(vec!["root.test".to_string()]).unwrap();
    vec![leaf.cert.pem(), root.cert.pem()]
}

fn sign_request() -> SignRequest {
    let bundle = generate_csr(IDENTITY).unwrap();
    SignRequest::new(bundle.csr_pem.clone(), IDENTITY, Duration::from_secs(600))
}

// ==== Self-hosted CA ====

#[tokio::test]
async fn test_citadel_sign_success() {
    let chain = test_chain();
    let reply = json!({ "cert_chain": chain }).to_string();
    let (endpoint, recorded) = spawn_mock_ca(CITADEL_SIGN_PATH, StatusCode::OK, reply).await;

    let client = new_ca_client(&CaClientConfig::new(endpoint, ProviderKind::Citadel)).unwrap();
    let request = sign_request().with_credential("workload-token");

    let issued = client.sign(&request).await.unwrap();
    assert_eq!(issued, chain);

    assert_eq!(
        recorded.authorization.lock().unwrap().as_deref(),
        Some("Bearer workload-token")
    );
    let body = recorded.body.lock().unwrap().clone().unwrap();
    assert_eq!(body["subject_id"], IDENTITY);
    assert_eq!(body["validity_duration"], 600);
    assert!(
        body["csr"]
            .as_str()
            .unwrap()
            .starts_with("-----BEGIN CERTIFICATE REQUEST-----")
    );
}

#[tokio::test]
async fn test_citadel_uses_identity_without_credential() {
    let reply = json!({ "cert_chain": test_chain() }).to_string();
    let (endpoint, recorded) = spawn_mock_ca(CITADEL_SIGN_PATH, StatusCode::OK, reply).await;

    let client = new_ca_client(&CaClientConfig::new(endpoint, ProviderKind::Citadel)).unwrap();
    client.sign(&sign_request()).await.unwrap();

    assert_eq!(
        recorded.authorization.lock().unwrap().clone(),
        Some(format!("Bearer {IDENTITY}"))
    );
}

#[tokio::test]
async fn test_citadel_unauthorized() {
    let (endpoint, _) =
        spawn_mock_ca(CITADEL_SIGN_PATH, StatusCode::UNAUTHORIZED, "bad token".to_string()).await;

    let client = new_ca_client(&CaClientConfig::new(endpoint, ProviderKind::Citadel)).unwrap();
    let result = client.sign(&sign_request()).await;
    assert!(matches!(result, Err(CaError::AuthRejected(_))));
}

#[tokio::test]
async fn test_citadel_unavailable() {
    let (endpoint, _) =
        spawn_mock_ca(CITADEL_SIGN_PATH, StatusCode::SERVICE_UNAVAILABLE, String::new()).await;

    let client = new_ca_client(&CaClientConfig::new(endpoint, ProviderKind::Citadel)).unwrap();
    let result = client.sign(&sign_request()).await;
    assert!(matches!(result, Err(CaError::Unreachable(_))));
}

#[tokio::test]
async fn test_citadel_empty_chain() {
    let reply = json!({ "cert_chain": [] }).to_string();
    let (endpoint, _) = spawn_mock_ca(CITADEL_SIGN_PATH, StatusCode::OK, reply).await;

    let client = new_ca_client(&CaClientConfig::new(endpoint, ProviderKind::Citadel)).unwrap();
    let result = client.sign(&sign_request()).await;
    assert_eq!(
        result,
        Err(CaError::MalformedResponse("empty cert chain".to_string()))
    );
}

#[tokio::test]
async fn test_citadel_undecodable_body() {
    let (endpoint, _) =
        spawn_mock_ca(CITADEL_SIGN_PATH, StatusCode::OK, "<html>oops</html>".to_string()).await;

    let client = new_ca_client(&CaClientConfig::new(endpoint, ProviderKind::Citadel)).unwrap();
    let result = client.sign(&sign_request()).await;
    assert!(matches!(result, Err(CaError::MalformedResponse(_))));
}

// ==== Vendor CA ====

#[tokio::test]
async fn test_google_ca_sign_with_token_file() {
    let chain = test_chain();
    let reply = json!({ "certChain": chain }).to_string();
    let (endpoint, recorded) = spawn_mock_ca(GOOGLE_CA_SIGN_PATH, StatusCode::OK, reply).await;

    let mut token_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(token_file, "vendor-token").unwrap();

    let mut config = CaClientConfig::new(endpoint, ProviderKind::GoogleCa);
    config.token_file = Some(token_file.path().to_path_buf());
    let client = new_ca_client(&config).unwrap();

    let issued = client
        .sign(&sign_request().with_credential("workload-token"))
        .await
        .unwrap();
    assert_eq!(issued, chain);

    assert_eq!(
        recorded.authorization.lock().unwrap().as_deref(),
        Some("Bearer vendor-token")
    );
    let body = recorded.body.lock().unwrap().clone().unwrap();
    assert_eq!(body["subjectId"], IDENTITY);
    assert_eq!(body["validityDuration"], "600s");
}

#[tokio::test]
async fn test_google_ca_without_any_token() {
    let reply = json!({ "certChain": test_chain() }).to_string();
    let (endpoint, recorded) = spawn_mock_ca(GOOGLE_CA_SIGN_PATH, StatusCode::OK, reply).await;

    let client = new_ca_client(&CaClientConfig::new(endpoint, ProviderKind::GoogleCa)).unwrap();
    let result = client.sign(&sign_request()).await;

    assert!(matches!(result, Err(CaError::AuthRejected(_))));
    assert!(recorded.body.lock().unwrap().is_none());
}
