// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Helpers for certificate chains returned by a CA.

use std::time::SystemTime;

use x509_cert::Certificate;
use x509_cert::der::DecodePem;

use crate::errors::CaError;

const PEM_CERTIFICATE_HEADER: &str = "-----BEGIN CERTIFICATE-----";

/// Checks that a CA returned a non-empty chain of PEM certificates.
pub fn validate_chain(chain: &[String]) -> Result<(), CaError> {
    if chain.is_empty() {
        return Err(CaError::MalformedResponse("empty cert chain".to_string()));
    }
    for (index, cert) in chain.iter().enumerate() {
        if !cert.trim_start().starts_with(PEM_CERTIFICATE_HEADER) {
            return Err(CaError::MalformedResponse(format!(
                "chain element {index} is not a PEM certificate"
            )));
        }
    }
    Ok(())
}

/// Returns the `notAfter` instant of the leaf (first) certificate.
pub fn leaf_not_after(chain: &[String]) -> Result<SystemTime, CaError> {
    let leaf = chain
        .first()
        .ok_or_else(|| CaError::MalformedResponse("empty cert chain".to_string()))?;
    let cert = Certificate::from_pem(leaf.trim().as_bytes())
        .map_err(|e| CaError::MalformedResponse(format!("unable to parse leaf certificate: {e}")))?;

    Ok(cert.tbs_certificate.validity.not_after.to_system_time())
}

/// Concatenates the chain into a single PEM bundle, leaf first.
pub fn concat_chain(chain: &[String]) -> Vec<u8> {
    let mut bundle = String::new();
    for cert in chain {
        bundle.push_str(cert.trim());
        bundle.push('\n');
    }
    bundle.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_chain_empty() {
        let result = validate_chain(&[]);
        assert_eq!(
            result,
            Err(CaError::MalformedResponse("empty cert chain".to_string()))
        );
    }

    #[test]
    fn test_validate_chain_rejects_garbage() {
        let chain = vec![
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----".to_string(),
            "not a cert".to_string(),
        ];
        assert!(matches!(
            validate_chain(&chain),
            Err(CaError::MalformedResponse(msg)) if msg.contains("element 1")
        ));
    }

    #[test]
    fn test_leaf_not_after_truncated() {
        let chain = vec!["-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----".to_string()];
        assert!(matches!(
            leaf_not_after(&chain),
            Err(CaError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_concat_chain_order() {
        let chain = vec!["leaf\n".to_string(), "root".to_string()];
        assert_eq!(concat_chain(&chain), b"leaf\nroot\n".to_vec());
    }
}
