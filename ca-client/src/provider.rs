// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The signing capability and the selection of a concrete backend.
//!
//! Callers only ever see `Arc<dyn CaClient>`; which CA sits behind it is
//! decided once by [`new_ca_client`] from a [`CaClientConfig`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::citadel::CitadelClient;
use crate::constants::{DEFAULT_CA_TIMEOUT, MAX_RESPONSE_SIZE};
use crate::errors::CaError;
use crate::google::GoogleCaClient;
use crate::models::SignRequest;

/// Signs certificate requests.
///
/// Implementations return the issued chain as PEM strings, leaf first, and
/// never retry on their own.
#[async_trait]
pub trait CaClient: Send + Sync {
    /// Submits `request` to the CA and returns the issued chain.
    async fn sign(&self, request: &SignRequest) -> Result<Vec<String>, CaError>;

    /// The backend this client talks to.
    fn provider(&self) -> ProviderKind;
}

/// Supported CA backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ProviderKind {
    /// Self-hosted mesh CA.
    Citadel,
    /// Cloud-vendor hosted CA.
    GoogleCa,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Citadel => write!(f, "citadel"),
            ProviderKind::GoogleCa => write!(f, "google-ca"),
        }
    }
}

/// Everything needed to bind a CA client.
#[derive(Debug, Clone)]
pub struct CaClientConfig {
    /// Base URL of the CA, e.g. `https://istio-citadel:8060`.
    pub endpoint: String,
    pub provider: ProviderKind,
    /// PEM bundle of roots trusted for the CA's TLS certificate.
    pub root_cert: Option<PathBuf>,
    /// File holding an externally issued bearer token.
    pub token_file: Option<PathBuf>,
    pub timeout: Duration,
}

impl CaClientConfig {
    pub fn new(endpoint: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            provider,
            root_cert: None,
            token_file: None,
            timeout: DEFAULT_CA_TIMEOUT,
        }
    }
}

/// Builds the client for the configured provider.
///
/// # Errors
///
/// Returns [`CaError::Config`] if the endpoint is empty or the root
/// certificate bundle cannot be read or parsed.
pub fn new_ca_client(config: &CaClientConfig) -> Result<Arc<dyn CaClient>, CaError> {
    if config.endpoint.trim().is_empty() {
        return Err(CaError::Config("CA endpoint must not be empty".to_string()));
    }

    let http = build_http_client(config)?;
    let endpoint = config.endpoint.trim_end_matches('/').to_string();

    info!(endpoint = %endpoint, provider = %config.provider, "created CA client");

    let client: Arc<dyn CaClient> = match config.provider {
        ProviderKind::Citadel => Arc::new(CitadelClient::new(http, endpoint)),
        ProviderKind::GoogleCa => Arc::new(GoogleCaClient::new(
            http,
            endpoint,
            config.token_file.clone(),
        )),
    };
    Ok(client)
}

fn build_http_client(config: &CaClientConfig) -> Result<Client, CaError> {
    let mut builder = ClientBuilder::new()
        .timeout(config.timeout)
        .pool_max_idle_per_host(4);

    if let Some(ref ca_path) = config.root_cert {
        let ca_cert = std::fs::read(ca_path).map_err(|e| {
            CaError::Config(format!("failed to read CA root file {}: {e}", ca_path.display()))
        })?;
        let certs = reqwest::Certificate::from_pem_bundle(&ca_cert)
            .map_err(|e| CaError::Config(format!("failed to parse CA root certificates: {e}")))?;
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    builder
        .build()
        .map_err(|e| CaError::Config(format!("failed to build HTTP client: {e}")))
}

/// POSTs `body` as JSON with a bearer credential and decodes the JSON reply.
pub(crate) async fn post_json<B, R>(
    http: &Client,
    url: &str,
    bearer: &str,
    body: &B,
) -> Result<R, CaError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let response = http
        .post(url)
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .json(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(status_error(status, &text));
    }

    let bytes = response.bytes().await?;
    if bytes.len() > MAX_RESPONSE_SIZE {
        return Err(CaError::MalformedResponse(format!(
            "response size {} exceeds maximum allowed size {}",
            bytes.len(),
            MAX_RESPONSE_SIZE
        )));
    }

    debug!(url, "received CA response ({} bytes)", bytes.len());

    serde_json::from_slice(&bytes)
        .map_err(|e| CaError::MalformedResponse(format!("unable to decode CA response: {e}")))
}

fn status_error(status: StatusCode, body: &str) -> CaError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CaError::AuthRejected(format!("{status}: {body}"))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            CaError::Unreachable(format!("{status}: {body}"))
        }
        s if s.is_server_error() => CaError::Unreachable(format!("{status}: {body}")),
        _ => CaError::MalformedResponse(format!("unexpected status {status}: {body}")),
    }
}
