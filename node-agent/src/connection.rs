// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Per-stream state.
//!
//! A stream is served by two tasks: the receive task spawned by
//! [`spawn_receiver`] only reads frames, and the stream handler owns the
//! [`Connection`] and every write to the stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::PUSH_CHANNEL_CAPACITY;
use crate::errors::AppError;
use crate::models::{DiscoveryRequest, Secret};
use crate::protocol::{Frame, recv_frame};
use crate::registry::ConnectionHandle;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingFirstRequest,
    Serving,
    Closing,
    Closed,
}

impl ConnectionState {
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (AwaitingFirstRequest, Serving)
                | (AwaitingFirstRequest, Closing)
                | (Serving, Closing)
                | (Closing, Closed)
        )
    }
}

pub struct Connection {
    pub id: u64,
    pub peer: String,
    pub node_id: Option<String>,
    pub identity: Option<String>,
    pub last_secret: Option<Arc<Secret>>,
    pub auth_failures: u32,
    state: ConnectionState,
    push: mpsc::Sender<()>,
    teardown: CancellationToken,
}

impl Connection {
    /// Creates a connection whose teardown follows `parent`.
    ///
    /// Returns the receiving side of the push channel alongside it.
    pub fn new(peer: impl Into<String>, parent: &CancellationToken) -> (Self, mpsc::Receiver<()>) {
        let (push, push_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let connection = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            node_id: None,
            identity: None,
            last_secret: None,
            auth_failures: 0,
            state: ConnectionState::AwaitingFirstRequest,
            push,
            teardown: parent.child_token(),
        };
        (connection, push_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Moves to `next`. Repeating the current state or moving backwards is
    /// ignored, which makes closing idempotent.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::debug!(
                "[connection {}] ignoring transition {:?} -> {:?}",
                self.id,
                self.state,
                next
            );
            return false;
        }
        tracing::debug!(
            "[connection {}] {:?} -> {:?}",
            self.id,
            self.state,
            next
        );
        self.state = next;
        true
    }

    pub fn teardown(&self) -> &CancellationToken {
        &self.teardown
    }

    /// Handle placed in the registry once the connection is serving.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(
            self.id,
            self.node_id.clone().unwrap_or_default(),
            self.identity.clone().unwrap_or_default(),
            self.peer.clone(),
            self.push.clone(),
            self.teardown.clone(),
        )
    }
}

/// Spawns the receive task of a stream.
///
/// Parsed requests are forwarded on `requests`; the channel closes when the
/// peer closes the stream. A read or protocol error is forwarded once and
/// ends the task, as does `teardown`.
pub fn spawn_receiver<R>(
    mut reader: R,
    requests: mpsc::Sender<Result<DiscoveryRequest, AppError>>,
    teardown: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = teardown.cancelled() => break,
                frame = recv_frame(&mut reader) => frame,
            };

            let item = match frame {
                Ok(Some(Frame::Request(request))) => Ok(request),
                Ok(Some(other)) => Err(AppError::Protocol(format!(
                    "unexpected frame from client: {}",
                    frame_kind(&other)
                ))),
                Ok(None) => break,
                Err(err) => Err(AppError::from(err)),
            };

            let fatal = item.is_err();
            if requests.send(item).await.is_err() || fatal {
                break;
            }
        }
    })
}

fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Headers { .. } => "headers",
        Frame::Request(_) => "request",
        Frame::Response(_) => "response",
        Frame::Error { .. } => "error",
    }
}
