// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Client for the cloud-vendor hosted CA.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error, warn};

use crate::chain::validate_chain;
use crate::constants::GOOGLE_CA_SIGN_PATH;
use crate::errors::CaError;
use crate::models::{GoogleCertificateRequest, GoogleCertificateResponse, SignRequest};
use crate::provider::{CaClient, ProviderKind, post_json};

/// Signs CSRs against the vendor-hosted CA.
///
/// The vendor CA does not accept bare identities as credentials: the bearer
/// is read from `token_file` on every call (it is rotated externally), or
/// taken from the workload's own credential.
pub struct GoogleCaClient {
    http: Client,
    url: String,
    token_file: Option<PathBuf>,
}

impl GoogleCaClient {
    pub fn new(http: Client, endpoint: String, token_file: Option<PathBuf>) -> Self {
        Self {
            http,
            url: format!("{endpoint}{GOOGLE_CA_SIGN_PATH}"),
            token_file,
        }
    }

    async fn bearer(&self, request: &SignRequest) -> Result<String, CaError> {
        if let Some(ref path) = self.token_file {
            match tokio::fs::read_to_string(path).await {
                Ok(token) if !token.trim().is_empty() => return Ok(token.trim().to_string()),
                Ok(_) => debug!("token file {} is empty", path.display()),
                Err(e) => warn!(
                    "unable to read token file {}, using request credential: {e}",
                    path.display()
                ),
            }
        }

        match request.credential.as_deref() {
            Some(credential) if !credential.is_empty() => Ok(credential.to_string()),
            _ => Err(CaError::AuthRejected(
                "no bearer token available for vendor CA".to_string(),
            )),
        }
    }
}

#[async_trait]
impl CaClient for GoogleCaClient {
    #[tracing::instrument(skip(self, request), fields(subject_id = %request.subject_id))]
    async fn sign(&self, request: &SignRequest) -> Result<Vec<String>, CaError> {
        let bearer = self.bearer(request).await?;

        let body = GoogleCertificateRequest {
            csr: request.csr_pem.clone(),
            subject_id: request.subject_id.clone(),
            validity_duration: format!("{}s", request.ttl.as_secs()),
        };

        let response: GoogleCertificateResponse = post_json(&self.http, &self.url, &bearer, &body)
            .await
            .inspect_err(|e| error!("failed to create certificate: {e}"))?;

        validate_chain(&response.cert_chain)?;

        debug!("received certificate chain of {} certs", response.cert_chain.len());

        Ok(response.cert_chain)
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::GoogleCa
    }
}
