// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::cache::SecretCache;
use crate::configuration::AgentOptions;
use crate::constants::{HEADERS_TIMEOUT, SHUTDOWN_TIMEOUT};
use crate::errors::AppError;
use crate::protocol::{Frame, Method, recv_frame, send_frame};
use crate::service::SdsService;
use crate::tls::build_tls_acceptor;

pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    tls: Option<TlsAcceptor>,
    streams: Arc<Semaphore>,
    service: Arc<SdsService>,
    shutdown: CancellationToken,
}

impl Server {
    pub async fn build(options: &AgentOptions, cache: Arc<SecretCache>) -> Result<Self, AppError> {
        let tls = match (&options.sds_cert_file, &options.sds_key_file) {
            (Some(cert), Some(key)) => Some(
                build_tls_acceptor(cert, key)
                    .map_err(|err| AppError::ConfigError(format!("{err:#}")))?,
            ),
            _ => None,
        };

        Self::bind(&options.sds_uds_path, tls, options.max_streams, cache)
    }

    /// Binds the discovery socket at `path`, replacing a stale socket file.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(
        path: &Path,
        tls: Option<TlsAcceptor>,
        max_streams: usize,
        cache: Arc<SecretCache>,
    ) -> Result<Self, AppError> {
        if path.exists() {
            tracing::warn!("[server] removing stale socket {}", path.display());
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        let shutdown = CancellationToken::new();
        let service = Arc::new(SdsService::new(cache, shutdown.clone()));

        tracing::info!(
            "[server] listening at {} (tls: {})",
            path.display(),
            tls.is_some()
        );

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            tls,
            streams: Arc::new(Semaphore::new(max_streams)),
            service,
            shutdown,
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }

    pub fn service(&self) -> &Arc<SdsService> {
        &self.service
    }

    /// Cancelling this token stops the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts streams until the shutdown token is cancelled, then closes
    /// every stream and removes the socket file.
    pub async fn run_until_stopped(self) -> Result<(), AppError> {
        let forwarder = self.service.spawn_event_forwarder(self.shutdown.clone());
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        tracing::warn!("[server] stream task ended abnormally: {:?}", err);
                    }
                }
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => {
                            tracing::error!("[server] failed to accept stream: {:?}", err);
                            continue;
                        }
                    };

                    let Ok(permit) = self.streams.clone().try_acquire_owned() else {
                        tracing::warn!("[server] stream limit reached, dropping stream");
                        continue;
                    };

                    let service = self.service.clone();
                    let tls = self.tls.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        serve_stream(service, tls, stream).await;
                    });
                }
            }
        }

        tracing::info!("[server] shutting down with {} open streams", tasks.len());

        self.service.registry().close_all().await;
        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("[server] aborting {} streams that did not close", tasks.len());
            tasks.shutdown().await;
        }

        if let Err(err) = forwarder.await {
            tracing::warn!("[server] event forwarder ended abnormally: {:?}", err);
        }

        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(
                "[server] unable to remove socket {}: {:?}",
                self.path.display(),
                err
            );
        }

        Ok(())
    }
}

async fn serve_stream(service: Arc<SdsService>, tls: Option<TlsAcceptor>, stream: UnixStream) {
    let peer = peer_name(&stream);

    let result = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => handle_connection(service, stream, peer.clone()).await,
            Err(err) => Err(AppError::Protocol(format!("TLS handshake failed: {err}"))),
        },
        None => handle_connection(service, stream, peer.clone()).await,
    };

    if let Err(err) = result {
        tracing::debug!("[server] stream from {peer} ended: {err}");
    }
}

fn peer_name(stream: &UnixStream) -> String {
    match stream.peer_cred() {
        Ok(cred) => match cred.pid() {
            Some(pid) => format!("pid={pid},uid={}", cred.uid()),
            None => format!("uid={}", cred.uid()),
        },
        Err(_) => "unknown".to_string(),
    }
}

/// Reads the opening headers frame and dispatches on its method.
pub async fn handle_connection<S>(
    service: Arc<SdsService>,
    stream: S,
    peer: String,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let opening = match tokio::time::timeout(HEADERS_TIMEOUT, recv_frame(&mut reader)).await {
        Ok(frame) => frame?,
        Err(_) => {
            return Err(AppError::Protocol(
                "timed out waiting for headers".to_string(),
            ));
        }
    };

    match opening {
        // Connected and left without a call.
        None => Ok(()),
        Some(Frame::Headers {
            method: Method::StreamSecrets,
            metadata,
        }) => {
            service
                .stream_secrets(reader, writer, peer, &metadata)
                .await
        }
        Some(Frame::Headers {
            method: Method::FetchSecrets,
            metadata,
        }) => {
            let request = match tokio::time::timeout(HEADERS_TIMEOUT, recv_frame(&mut reader)).await {
                Ok(Ok(Some(Frame::Request(request)))) => request,
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(_))) | Err(_) => {
                    let err = AppError::MalformedRequest("expected a request frame".to_string());
                    send_frame(&mut writer, &err.to_frame()).await?;
                    return Err(err);
                }
                Ok(Err(err)) => return Err(err.into()),
            };

            let frame = match service.fetch_secrets(&metadata, &request).await {
                Ok(response) => Frame::Response(response),
                Err(err) => {
                    tracing::warn!("[server] fetch from {peer} failed: {err}");
                    err.to_frame()
                }
            };
            send_frame(&mut writer, &frame).await?;
            Ok(())
        }
        Some(_) => {
            let err = AppError::MalformedRequest("expected a headers frame".to_string());
            send_frame(&mut writer, &err.to_frame()).await?;
            Err(err)
        }
    }
}
