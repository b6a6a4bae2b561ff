// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Secret discovery service.
//!
//! Implements the unary [`SdsService::fetch_secrets`] call and the streaming
//! [`SdsService::stream_secrets`] call. A stream moves through
//! [`ConnectionState`]: the first valid request resolves the secret, registers
//! the stream and pushes; afterwards the handler waits on the next request,
//! a push signal from the registry, or teardown. Rotation and eviction
//! events from the cache reach streams through [`SdsService::spawn_event_forwarder`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use ca_client::constants::URI_SCHEME;

use crate::cache::SecretCache;
use crate::connection::{Connection, ConnectionState, spawn_receiver};
use crate::constants::{
    CREDENTIAL_TOKEN_HEADER_KEY, MAX_AUTH_FAILURES, REQUEST_CHANNEL_CAPACITY, SECRET_TYPE_URL,
};
use crate::errors::AppError;
use crate::models::{
    DataSource, DiscoveryRequest, DiscoveryResponse, Secret, SecretResource, TlsCertificate,
};
use crate::protocol::{Frame, send_frame};
use crate::registry::{Notify, Registry};

pub struct SdsService {
    cache: Arc<SecretCache>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl SdsService {
    pub fn new(cache: Arc<SecretCache>, shutdown: CancellationToken) -> Self {
        Self {
            cache,
            registry: Arc::new(Registry::new()),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<SecretCache> {
        &self.cache
    }

    /// Resolves the secret named by `request`, issuing it if needed.
    ///
    /// Never registers a connection.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::MalformedRequest`] or [`AppError::AuthRejected`]
    /// if validation fails, and [`AppError::ProvisionFailure`] if no secret
    /// could be issued.
    #[tracing::instrument(skip_all, fields(node_id = ?request.node_id()))]
    pub async fn fetch_secrets(
        &self,
        metadata: &BTreeMap<String, String>,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveryResponse, AppError> {
        let identity = parse_discovery_request(request)?;
        let token = get_credential_token(metadata).inspect_err(|err| {
            tracing::warn!("[sds] rejected fetch for {identity}: {err}");
        })?;

        let secret = self.cache.get_secret(&identity, &token).await?;

        tracing::info!("[sds] fetched secret for {identity}");

        Ok(discovery_response(&secret))
    }

    /// Serves one discovery stream until the peer leaves, the stream fails,
    /// the secret is revoked, or the server shuts down.
    ///
    /// `reader` and `writer` are the two halves of the stream; only this
    /// call writes to `writer`.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the stream. It has already been reported
    /// to the peer when the stream was still writable.
    #[tracing::instrument(skip_all, fields(peer = %peer))]
    pub async fn stream_secrets<R, W>(
        &self,
        reader: R,
        mut writer: W,
        peer: String,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), AppError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        let (mut conn, mut push_rx) = Connection::new(peer, &self.shutdown);

        let (request_tx, mut request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let receiver = spawn_receiver(reader, request_tx, conn.teardown().clone());

        let result = self
            .serve(&mut conn, &mut writer, &mut request_rx, &mut push_rx, metadata)
            .await;

        conn.transition(ConnectionState::Closing);
        conn.teardown().cancel();
        if conn.identity.is_some()
            && let Some(ref node_id) = conn.node_id
        {
            self.registry.remove(node_id, conn.id).await;
        }
        if let Err(err) = receiver.await {
            tracing::warn!("[sds] receive task ended abnormally: {:?}", err);
        }

        if let Err(ref err) = result
            && !matches!(err, AppError::PushFailure(_) | AppError::Io(_))
            && let Err(send_err) = send_frame(&mut writer, &err.to_frame()).await
        {
            tracing::debug!("[sds] unable to report error to peer: {:?}", send_err);
        }

        conn.transition(ConnectionState::Closed);
        tracing::info!(
            "[sds] stream {} closed for {}",
            conn.id,
            conn.identity.as_deref().unwrap_or("unknown identity")
        );

        result
    }

    async fn serve<W>(
        &self,
        conn: &mut Connection,
        writer: &mut W,
        requests: &mut mpsc::Receiver<Result<DiscoveryRequest, AppError>>,
        pushes: &mut mpsc::Receiver<()>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), AppError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let teardown = conn.teardown().clone();
        loop {
            tokio::select! {
                _ = teardown.cancelled() => return Ok(()),
                request = requests.recv() => match request {
                    // Remote side closed the stream.
                    None => return Ok(()),
                    Some(Err(err)) => return Err(err),
                    Some(Ok(request)) => self.on_request(conn, writer, request, metadata).await?,
                },
                Some(()) = pushes.recv() => self.on_push(conn, writer).await?,
            }
        }
    }

    async fn on_request<W>(
        &self,
        conn: &mut Connection,
        writer: &mut W,
        request: DiscoveryRequest,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), AppError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match conn.state() {
            ConnectionState::AwaitingFirstRequest => {
                let identity = parse_discovery_request(&request)?;
                let token = get_credential_token(metadata).inspect_err(|err| {
                    tracing::warn!("[sds] rejected stream for {identity}: {err}");
                })?;

                let secret = self.cache.get_secret(&identity, &token).await?;

                conn.node_id = request.node_id().map(str::to_string);
                conn.identity = Some(identity.clone());
                self.registry.register(conn.handle()).await;
                conn.transition(ConnectionState::Serving);

                push(conn, writer, secret).await
            }
            ConnectionState::Serving => self.on_follow_up(conn, writer, &request).await,
            ConnectionState::Closing | ConnectionState::Closed => Ok(()),
        }
    }

    /// Handles an ack, a NACK or a re-sync on a serving stream. None of them
    /// trigger a push.
    async fn on_follow_up<W>(
        &self,
        conn: &mut Connection,
        writer: &mut W,
        request: &DiscoveryRequest,
    ) -> Result<(), AppError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let rejection = match parse_discovery_request(request) {
            Err(err) => Some(err),
            Ok(identity) if Some(&identity) != conn.identity.as_ref() => {
                conn.auth_failures += 1;
                Some(AppError::AuthRejected(format!(
                    "resource {identity} does not match the stream's identity"
                )))
            }
            Ok(_) => None,
        };

        if let Some(err) = rejection {
            tracing::warn!("[sds] rejected request on stream {}: {err}", conn.id);
            if conn.auth_failures >= MAX_AUTH_FAILURES {
                return Err(AppError::AuthRejected(format!(
                    "{} authentication failures on one stream",
                    conn.auth_failures
                )));
            }
            return send_frame(writer, &err.to_frame())
                .await
                .map_err(|e| AppError::PushFailure(e.to_string()));
        }

        match request.error_detail {
            Some(ref detail) => tracing::warn!(
                "[sds] client rejected version {:?} on stream {}: {}",
                request.version_info,
                conn.id,
                detail.message
            ),
            None => tracing::debug!(
                "[sds] ack of nonce {:?} on stream {}",
                request.response_nonce,
                conn.id
            ),
        }
        Ok(())
    }

    async fn on_push<W>(&self, conn: &mut Connection, writer: &mut W) -> Result<(), AppError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(identity) = conn.identity.clone() else {
            return Ok(());
        };

        match self.cache.lookup(&identity).await {
            Some(secret)
                if conn
                    .last_secret
                    .as_ref()
                    .is_some_and(|last| Arc::ptr_eq(last, &secret)) =>
            {
                tracing::debug!("[sds] stream {} already has the current secret", conn.id);
                Ok(())
            }
            Some(secret) => push(conn, writer, secret).await,
            None => {
                tracing::info!("[sds] secret for {identity} revoked, closing stream {}", conn.id);
                Err(AppError::SecretRevoked(identity))
            }
        }
    }

    /// Forwards cache events to the registry until `shutdown`.
    ///
    /// If events were missed, every stream is signalled; a push re-resolves
    /// the current secret so spurious signals are harmless.
    pub fn spawn_event_forwarder(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self.cache.subscribe();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(event) => {
                        let outcome = registry.notify(event.identity()).await;
                        tracing::debug!("[sds] {:?} -> {:?}", event, outcome);
                        if outcome == Notify::Sent {
                            tracing::info!("[sds] signalled stream for {}", event.identity());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("[sds] missed {missed} secret events, signalling all streams");
                        registry.notify_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn push<W>(conn: &mut Connection, writer: &mut W, secret: Arc<Secret>) -> Result<(), AppError>
where
    W: AsyncWrite + Unpin + Send,
{
    let response = discovery_response(&secret);
    send_frame(writer, &Frame::Response(response))
        .await
        .map_err(|err| {
            tracing::error!("[sds] failed to push to stream {}: {:?}", conn.id, err);
            AppError::PushFailure(err.to_string())
        })?;

    tracing::info!(
        "[sds] pushed secret for {} to node {:?} at {}",
        secret.identity,
        conn.node_id.as_deref().unwrap_or_default(),
        conn.peer
    );
    conn.last_secret = Some(secret);
    Ok(())
}

/// Validates `request` and returns the workload identity it names.
///
/// Checks, in order: the node id is present; there is exactly one resource
/// name and it is a workload identity; the size limits hold.
///
/// # Errors
///
/// Returns [`AppError::MalformedRequest`] on the first failed check.
pub fn parse_discovery_request(request: &DiscoveryRequest) -> Result<String, AppError> {
    if request.node_id().is_none() {
        return Err(AppError::MalformedRequest(
            "discovery request is missing node id".to_string(),
        ));
    }

    let identity = match request.resource_names.as_slice() {
        [name] if name.starts_with(URI_SCHEME) => name.clone(),
        names => {
            return Err(AppError::MalformedRequest(format!(
                "discovery request has invalid resource names {names:?}"
            )));
        }
    };

    request.validate()?;

    Ok(identity)
}

/// Extracts the credential token from stream metadata.
///
/// # Errors
///
/// Returns [`AppError::AuthRejected`] if the token is missing or empty.
pub fn get_credential_token(metadata: &BTreeMap<String, String>) -> Result<String, AppError> {
    match metadata.get(CREDENTIAL_TOKEN_HEADER_KEY) {
        Some(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        Some(_) => Err(AppError::AuthRejected("credential token is empty".to_string())),
        None => Err(AppError::AuthRejected("no credential token is found".to_string())),
    }
}

/// Encodes `secret` into a discovery response.
///
/// Version and nonce come from the wall clock, so later responses replace
/// earlier ones; the nonce also carries a random suffix.
pub fn discovery_response(secret: &Secret) -> DiscoveryResponse {
    let version_info = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    let nonce = format!("{version_info}-{:016x}", fastrand::u64(..));

    DiscoveryResponse {
        version_info,
        resources: vec![SecretResource {
            name: secret.identity.clone(),
            tls_certificate: TlsCertificate {
                certificate_chain: DataSource::new(secret.chain_pem()),
                private_key: DataSource::new(secret.private_key.clone()),
            },
        }],
        type_url: SECRET_TYPE_URL.to_string(),
        nonce,
    }
}
