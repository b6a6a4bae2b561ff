// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

/// Failures surfaced by a [`crate::CaClient`].
///
/// The client never retries; callers decide what a failure means for them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CaError {
    /// The CA rejected the bearer credential (invalid, expired or missing).
    #[error("CA rejected credential: {0}")]
    AuthRejected(String),
    /// Network or transport failure while talking to the CA.
    #[error("CA unreachable: {0}")]
    Unreachable(String),
    /// The CA answered, but not with a usable certificate chain.
    #[error("malformed CA response: {0}")]
    MalformedResponse(String),
    /// Key pair or certificate signing request could not be generated.
    #[error("failed to build certificate signing request: {0}")]
    Csr(String),
    /// The client binding could not be constructed.
    #[error("CA client configuration error: {0}")]
    Config(String),
}

impl From<rcgen::Error> for CaError {
    fn from(source: rcgen::Error) -> Self {
        tracing::error!("{:?}", source);
        CaError::Csr(source.to_string())
    }
}

impl From<reqwest::Error> for CaError {
    fn from(source: reqwest::Error) -> Self {
        tracing::debug!("{:?}", source);
        if source.is_decode() {
            CaError::MalformedResponse(source.to_string())
        } else {
            CaError::Unreachable(source.to_string())
        }
    }
}

impl From<std::io::Error> for CaError {
    fn from(source: std::io::Error) -> Self {
        tracing::error!("{:?}", source);
        CaError::Config(source.to_string())
    }
}
