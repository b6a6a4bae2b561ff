// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use ca_client::CaError;

use crate::protocol::{ErrorCode, Frame};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("failed to provision secret: {0}")]
    ProvisionFailure(String),
    #[error("failed to push response: {0}")]
    PushFailure(String),
    #[error("secret revoked for {0}")]
    SecretRevoked(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl AppError {
    /// Wire code reported to the peer for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedRequest(_) => ErrorCode::InvalidArgument,
            Self::AuthRejected(_) => ErrorCode::Unauthenticated,
            Self::ProvisionFailure(_) => ErrorCode::Unavailable,
            Self::SecretRevoked(_) => ErrorCode::Aborted,
            Self::PushFailure(_) | Self::Protocol(_) | Self::ConfigError(_) | Self::Io(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// The message carried by the variant, without its prefix.
    pub fn detail(&self) -> &str {
        match self {
            Self::MalformedRequest(msg)
            | Self::AuthRejected(msg)
            | Self::ProvisionFailure(msg)
            | Self::PushFailure(msg)
            | Self::SecretRevoked(msg)
            | Self::Protocol(msg)
            | Self::ConfigError(msg)
            | Self::Io(msg) => msg,
        }
    }

    /// Error frame sent to the peer. Internal details are not disclosed.
    pub fn to_frame(&self) -> Frame {
        let message = match self.code() {
            ErrorCode::Internal => "internal error".to_string(),
            _ => self.detail().to_string(),
        };
        Frame::Error {
            code: self.code(),
            message,
        }
    }

    /// Rebuilds an error received in an error frame.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::InvalidArgument => Self::MalformedRequest(message),
            ErrorCode::Unauthenticated => Self::AuthRejected(message),
            ErrorCode::Unavailable => Self::ProvisionFailure(message),
            ErrorCode::Aborted => Self::SecretRevoked(message),
            ErrorCode::Internal => Self::Protocol(message),
        }
    }
}

impl From<CaError> for AppError {
    fn from(source: CaError) -> Self {
        tracing::error!("{:?}", source);
        AppError::ProvisionFailure(source.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(source: serde_json::Error) -> Self {
        tracing::error!("{:?}", source);
        AppError::Protocol(source.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(source: anyhow::Error) -> Self {
        tracing::debug!("{:?}", source);
        AppError::Protocol(source.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(source: std::io::Error) -> Self {
        tracing::error!("{:?}", source);
        AppError::Io(source.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(source: validator::ValidationErrors) -> Self {
        tracing::warn!("{:?}", source);
        AppError::MalformedRequest(source.to_string())
    }
}
