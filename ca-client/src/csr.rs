// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Key pair and certificate signing request synthesis.
//!
//! Every issuance uses a fresh ECDSA P-256 key pair. The workload identity is
//! carried as a URI subject alternative name, which is what proxies and CAs
//! match on; the subject only carries a fixed organization.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use tracing::debug;

use crate::constants::CSR_ORGANIZATION;
use crate::errors::CaError;
use crate::models::CsrBundle;

/// Generates a new key pair and a PEM-encoded CSR for `identity`.
///
/// # Errors
///
/// Returns [`CaError::Csr`] if the identity is empty or not a valid IA5
/// string, or if key generation or CSR serialization fails.
pub fn generate_csr(identity: &str) -> Result<CsrBundle, CaError> {
    if identity.is_empty() {
        return Err(CaError::Csr("identity must not be empty".to_string()));
    }

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, CSR_ORGANIZATION);

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::URI(
        identity
            .try_into()
            .map_err(|_| CaError::Csr(format!("invalid identity: {identity}")))?,
    )];

    let key_pair = KeyPair::generate()?;
    let csr = params.serialize_request(&key_pair)?;
    let csr_pem = csr.pem()?;

    debug!(identity, "generated certificate signing request");

    Ok(CsrBundle {
        csr_pem,
        private_key_pem: key_pair.serialize_pem(),
    })
}
