// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// Input of a single signing call.
#[derive(Clone)]
pub struct SignRequest {
    /// PEM-encoded PKCS#10 certificate signing request.
    pub csr_pem: String,
    /// Workload identity the certificate is issued for.
    pub subject_id: String,
    /// Requested certificate validity.
    pub ttl: Duration,
    /// Bearer credential presented by the workload, if any.
    pub credential: Option<String>,
}

impl SignRequest {
    pub fn new(csr_pem: impl Into<String>, subject_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            csr_pem: csr_pem.into(),
            subject_id: subject_id.into(),
            ttl,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Bearer value attached to the outbound call: the workload's credential
    /// when present, otherwise the subject identity itself.
    pub fn bearer(&self) -> &str {
        match self.credential.as_deref() {
            Some(credential) if !credential.is_empty() => credential,
            _ => self.subject_id.as_str(),
        }
    }
}

// Credentials must never reach the logs.
impl fmt::Debug for SignRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignRequest")
            .field("subject_id", &self.subject_id)
            .field("ttl", &self.ttl)
            .field("csr_len", &self.csr_pem.len())
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Request body understood by the self-hosted CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitadelCertificateRequest {
    pub csr: String,
    pub subject_id: String,
    /// Validity in seconds.
    pub validity_duration: i64,
}

/// Response body of the self-hosted CA. Leaf certificate first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitadelCertificateResponse {
    #[serde(default)]
    pub cert_chain: Vec<String>,
}

/// Request body understood by the vendor-hosted CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleCertificateRequest {
    pub csr: String,
    pub subject_id: String,
    /// Validity as a protobuf JSON duration, e.g. `"3600s"`.
    pub validity_duration: String,
}

/// Response body of the vendor-hosted CA. Leaf certificate first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleCertificateResponse {
    #[serde(default)]
    pub cert_chain: Vec<String>,
}

/// Freshly generated key pair and the CSR built from it.
#[derive(Clone, ZeroizeOnDrop)]
pub struct CsrBundle {
    #[zeroize(skip)]
    pub csr_pem: String,
    pub private_key_pem: String,
}

impl fmt::Debug for CsrBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrBundle")
            .field("csr_pem", &self.csr_pem)
            .field("private_key_pem", &"[REDACTED]")
            .finish()
    }
}
