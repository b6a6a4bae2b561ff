// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Client side of the discovery socket, for tools and tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::net::UnixStream;
use zeroize::Zeroizing;

use crate::constants::CREDENTIAL_TOKEN_HEADER_KEY;
use crate::errors::AppError;
use crate::models::{DiscoveryRequest, DiscoveryResponse};
use crate::protocol::{Frame, Method, recv_frame, send_frame};

pub struct SdsClient {
    path: PathBuf,
    token: Option<Zeroizing<String>>,
}

impl SdsClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            token: None,
        }
    }

    /// Sends `token` as the credential of every call.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Zeroizing::new(token.into()));
        self
    }

    async fn connect(&self, method: Method) -> Result<UnixStream, AppError> {
        let mut stream = UnixStream::connect(&self.path).await?;

        let mut metadata = BTreeMap::new();
        if let Some(ref token) = self.token {
            metadata.insert(CREDENTIAL_TOKEN_HEADER_KEY.to_string(), token.to_string());
        }
        send_frame(&mut stream, &Frame::Headers { method, metadata }).await?;

        Ok(stream)
    }

    /// Performs a unary fetch.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the server, or a transport error.
    pub async fn fetch_secrets(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveryResponse, AppError> {
        let mut stream = self.connect(Method::FetchSecrets).await?;
        send_frame(&mut stream, &Frame::Request(request.clone())).await?;

        read_response(&mut stream)
            .await?
            .ok_or_else(|| AppError::Protocol("server closed the stream".to_string()))
    }

    /// Opens a discovery stream. Send the first request with [`SecretStream::send`].
    pub async fn stream_secrets(&self) -> Result<SecretStream, AppError> {
        let stream = self.connect(Method::StreamSecrets).await?;
        Ok(SecretStream { stream })
    }
}

pub struct SecretStream {
    stream: UnixStream,
}

impl SecretStream {
    pub async fn send(&mut self, request: &DiscoveryRequest) -> Result<(), AppError> {
        send_frame(&mut self.stream, &Frame::Request(request.clone())).await?;
        Ok(())
    }

    /// Waits for the next response.
    ///
    /// Returns `Ok(None)` once the server has closed the stream, and the
    /// server's error if it closed the stream with one.
    pub async fn recv(&mut self) -> Result<Option<DiscoveryResponse>, AppError> {
        read_response(&mut self.stream).await
    }
}

async fn read_response(stream: &mut UnixStream) -> Result<Option<DiscoveryResponse>, AppError> {
    match recv_frame(stream).await? {
        None => Ok(None),
        Some(Frame::Response(response)) => Ok(Some(response)),
        Some(Frame::Error { code, message }) => Err(AppError::from_wire(code, message)),
        Some(_) => Err(AppError::Protocol(
            "unexpected frame from server".to_string(),
        )),
    }
}
