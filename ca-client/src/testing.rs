// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! In-process certificate authority for tests.
//!
//! [`LocalCa`] signs real CSRs with a throwaway root so callers can exercise
//! issuance, rotation and expiry without a network CA. Failures and latency
//! can be injected at runtime.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use time::OffsetDateTime;

use crate::errors::CaError;
use crate::models::SignRequest;
use crate::provider::{CaClient, ProviderKind};

/// A self-signed root that signs whatever it is asked to.
pub struct LocalCa {
    ca_key_pem: String,
    ca_cert_pem: String,
    validity: Mutex<Option<Duration>>,
    failure: Mutex<Option<CaError>>,
    delay_ms: AtomicU64,
    calls: AtomicUsize,
}

impl LocalCa {
    /// Creates a root CA. Issued certificates use the requested TTL unless
    /// overridden with [`LocalCa::set_validity`].
    pub fn new() -> Result<Self, CaError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "node-agent test root");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc() - time::Duration::hours(1);
        params.not_after = OffsetDateTime::now_utc() + time::Duration::days(365);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
            validity: Mutex::new(None),
            failure: Mutex::new(None),
            delay_ms: AtomicU64::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    /// PEM of the root certificate.
    pub fn root_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Forces the validity of subsequently issued certificates.
    pub fn set_validity(&self, validity: Option<Duration>) {
        *lock(&self.validity) = validity;
    }

    /// Makes every subsequent call fail with `error` (or succeed again with `None`).
    pub fn set_failure(&self, error: Option<CaError>) {
        *lock(&self.failure) = error;
    }

    /// Delays every subsequent call before it answers.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis().try_into().unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Number of `sign` calls received so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn issue(&self, request: &SignRequest) -> Result<Vec<String>, CaError> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(&request.csr_pem)
            .map_err(|e| CaError::MalformedResponse(format!("failed to parse CSR: {e}")))?;

        let validity = lock(&self.validity).unwrap_or(request.ttl);
        let now = OffsetDateTime::now_utc();
        csr_params.params.not_before = now - time::Duration::minutes(1);
        csr_params.params.not_after =
            now + time::Duration::seconds(validity.as_secs().try_into().unwrap_or(i64::MAX / 2));
        csr_params.params.is_ca = IsCa::NoCa;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)?;
        let leaf = csr_params.signed_by(&issuer)?;

        Ok(vec![leaf.pem(), self.ca_cert_pem.clone()])
    }
}

#[async_trait]
impl CaClient for LocalCa {
    async fn sign(&self, request: &SignRequest) -> Result<Vec<String>, CaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }

        self.issue(request)
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Citadel
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::chain::leaf_not_after;
    use crate::csr::generate_csr;
    use std::time::SystemTime;

    #[tokio::test]
    async fn test_local_ca_signs_csr() {
        let ca = LocalCa::new().unwrap();
        let bundle = generate_csr("spiffe://cluster.local/ns/a/sa/b").unwrap();
        let request = SignRequest::new(
            bundle.csr_pem.clone(),
            "spiffe://cluster.local/ns/a/sa/b",
            Duration::from_secs(600),
        );

        let chain = ca.sign(&request).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], ca.root_pem());
        assert_eq!(ca.calls(), 1);

        let not_after = leaf_not_after(&chain).unwrap();
        let remaining = not_after.duration_since(SystemTime::now()).unwrap();
        assert!(remaining <= Duration::from_secs(600));
        assert!(remaining > Duration::from_secs(500));
    }

    #[tokio::test]
    async fn test_local_ca_injected_failure() {
        let ca = LocalCa::new().unwrap();
        ca.set_failure(Some(CaError::Unreachable("down".to_string())));

        let request = SignRequest::new("csr", "spiffe://a/b", Duration::from_secs(60));
        assert_eq!(
            ca.sign(&request).await,
            Err(CaError::Unreachable("down".to_string()))
        );
        assert_eq!(ca.calls(), 1);
    }
}
