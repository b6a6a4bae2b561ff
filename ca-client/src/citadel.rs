// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Client for a self-hosted mesh CA.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error};

use crate::chain::validate_chain;
use crate::constants::CITADEL_SIGN_PATH;
use crate::errors::CaError;
use crate::models::{CitadelCertificateRequest, CitadelCertificateResponse, SignRequest};
use crate::provider::{CaClient, ProviderKind, post_json};

/// Signs CSRs against a self-hosted CA.
///
/// The bearer credential is the workload's token when one was presented,
/// otherwise the subject identity.
pub struct CitadelClient {
    http: Client,
    url: String,
}

impl CitadelClient {
    pub fn new(http: Client, endpoint: String) -> Self {
        Self {
            http,
            url: format!("{endpoint}{CITADEL_SIGN_PATH}"),
        }
    }
}

#[async_trait]
impl CaClient for CitadelClient {
    #[tracing::instrument(skip(self, request), fields(subject_id = %request.subject_id))]
    async fn sign(&self, request: &SignRequest) -> Result<Vec<String>, CaError> {
        let body = CitadelCertificateRequest {
            csr: request.csr_pem.clone(),
            subject_id: request.subject_id.clone(),
            validity_duration: request.ttl.as_secs().try_into().unwrap_or(i64::MAX),
        };

        let response: CitadelCertificateResponse =
            post_json(&self.http, &self.url, request.bearer(), &body)
                .await
                .inspect_err(|e| error!("failed to create certificate: {e}"))?;

        validate_chain(&response.cert_chain)?;

        debug!("received certificate chain of {} certs", response.cert_chain.len());

        Ok(response.cert_chain)
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Citadel
    }
}
