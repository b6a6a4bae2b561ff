// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Registry of active discovery streams, keyed by node id.
//!
//! Several proxies may share one workload identity, so an identity index
//! maps each identity to the node ids currently serving it. Both maps sit
//! behind one lock.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// What the registry holds for a live stream: enough to signal it, never
/// enough to write to it.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub node_id: String,
    pub identity: String,
    pub peer: String,
    push: mpsc::Sender<()>,
    teardown: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: u64,
        node_id: impl Into<String>,
        identity: impl Into<String>,
        peer: impl Into<String>,
        push: mpsc::Sender<()>,
        teardown: CancellationToken,
    ) -> Self {
        Self {
            id,
            node_id: node_id.into(),
            identity: identity.into(),
            peer: peer.into(),
            push,
            teardown,
        }
    }

    fn signal(&self) -> Notify {
        match self.push.try_send(()) {
            Ok(()) => Notify::Sent,
            Err(TrySendError::Full(())) => Notify::Coalesced,
            // The handler is gone but has not deregistered yet.
            Err(TrySendError::Closed(())) => Notify::NotFound,
        }
    }
}

/// Outcome of [`Registry::notify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    /// A push signal was queued for at least one stream.
    Sent,
    /// Every matching stream already had a signal pending.
    Coalesced,
    /// No live stream for the identity.
    NotFound,
}

#[derive(Default)]
struct Connections {
    by_node: HashMap<String, ConnectionHandle>,
    by_identity: HashMap<String, HashSet<String>>,
}

impl Connections {
    fn unindex(&mut self, handle: &ConnectionHandle) {
        if let Some(nodes) = self.by_identity.get_mut(&handle.identity) {
            nodes.remove(&handle.node_id);
            if nodes.is_empty() {
                self.by_identity.remove(&handle.identity);
            }
        }
    }
}

#[derive(Default)]
pub struct Registry {
    connections: RwLock<Connections>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under its node id.
    ///
    /// A stream already registered for the node id is torn down and
    /// returned, so its proxy reconnects instead of waiting on pushes that
    /// will never come.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let node_id = handle.node_id.clone();
        let identity = handle.identity.clone();

        let mut connections = self.connections.write().await;
        let previous = connections.by_node.insert(node_id.clone(), handle);
        if let Some(ref previous) = previous
            && previous.identity != identity
        {
            connections.unindex(previous);
        }
        connections
            .by_identity
            .entry(identity)
            .or_default()
            .insert(node_id.clone());

        if let Some(ref previous) = previous {
            if previous.teardown.is_cancelled() {
                tracing::debug!("[registry] connection {} replaced for {node_id}", previous.id);
            } else {
                tracing::info!(
                    "[registry] connection {} replaced for {node_id}, closing it",
                    previous.id
                );
                previous.teardown.cancel();
            }
        }
        previous
    }

    /// Removes the entry for `node_id` if it still belongs to connection `id`.
    pub async fn remove(&self, node_id: &str, id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.by_node.get(node_id) {
            Some(handle) if handle.id == id => {
                if let Some(handle) = connections.by_node.remove(node_id) {
                    connections.unindex(&handle);
                }
                true
            }
            _ => false,
        }
    }

    /// Signals every stream serving `identity` to push.
    ///
    /// Never blocks: a signal already pending absorbs this one.
    pub async fn notify(&self, identity: &str) -> Notify {
        let connections = self.connections.write().await;
        let Some(nodes) = connections.by_identity.get(identity) else {
            tracing::debug!("[registry] no connection for {identity}");
            return Notify::NotFound;
        };

        let mut outcome = Notify::NotFound;
        for handle in nodes.iter().filter_map(|node| connections.by_node.get(node)) {
            match handle.signal() {
                Notify::Sent => outcome = Notify::Sent,
                Notify::Coalesced => {
                    tracing::debug!(
                        "[registry] push already pending for {identity} on {}",
                        handle.node_id
                    );
                    if outcome == Notify::NotFound {
                        outcome = Notify::Coalesced;
                    }
                }
                Notify::NotFound => {}
            }
        }
        outcome
    }

    /// Signals every registered stream. Returns how many signals were queued.
    pub async fn notify_all(&self) -> usize {
        let connections = self.connections.write().await;
        connections
            .by_node
            .values()
            .filter(|handle| handle.signal() == Notify::Sent)
            .count()
    }

    /// Tears down every registered stream.
    pub async fn close_all(&self) {
        let connections = self.connections.read().await;
        for handle in connections.by_node.values() {
            handle.teardown.cancel();
        }
        tracing::info!("[registry] closed {} connections", connections.by_node.len());
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.by_node.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.by_node.is_empty()
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        self.connections.read().await.by_node.contains_key(node_id)
    }

    /// Id of the connection currently registered for `node_id`.
    pub async fn connection_id(&self, node_id: &str) -> Option<u64> {
        self.connections
            .read()
            .await
            .by_node
            .get(node_id)
            .map(|handle| handle.id)
    }

    /// Number of streams currently serving `identity`.
    pub async fn identity_streams(&self, identity: &str) -> usize {
        self.connections
            .read()
            .await
            .by_identity
            .get(identity)
            .map_or(0, HashSet::len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const IDENTITY: &str = "spiffe://cluster.local/ns/ns1/sa/svc1";
    const OTHER_IDENTITY: &str = "spiffe://cluster.local/ns/ns2/sa/svc2";

    fn handle(
        id: u64,
        node_id: &str,
        identity: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<()>, CancellationToken) {
        let (tx, rx) = mpsc::channel(1);
        let teardown = CancellationToken::new();
        (
            ConnectionHandle::new(id, node_id, identity, "pid=1", tx, teardown.clone()),
            rx,
            teardown,
        )
    }

    #[tokio::test]
    async fn test_register_same_node_tears_down_previous() {
        let registry = Registry::new();
        let (first, _rx1, first_teardown) = handle(1, "sidecar", IDENTITY);
        let (second, _rx2, second_teardown) = handle(2, "sidecar", IDENTITY);

        assert!(registry.register(first).await.is_none());
        let replaced = registry.register(second).await.unwrap();
        assert_eq!(replaced.id, 1);
        assert!(first_teardown.is_cancelled());
        assert!(!second_teardown.is_cancelled());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.connection_id("sidecar").await, Some(2));
        assert_eq!(registry.identity_streams(IDENTITY).await, 1);
    }

    #[tokio::test]
    async fn test_register_same_node_new_identity_reindexes() {
        let registry = Registry::new();
        let (first, _rx1, _) = handle(1, "sidecar", IDENTITY);
        let (second, _rx2, _) = handle(2, "sidecar", OTHER_IDENTITY);
        registry.register(first).await;
        registry.register(second).await;

        assert_eq!(registry.identity_streams(IDENTITY).await, 0);
        assert_eq!(registry.identity_streams(OTHER_IDENTITY).await, 1);
        assert_eq!(registry.notify(IDENTITY).await, Notify::NotFound);
    }

    #[tokio::test]
    async fn test_nodes_sharing_identity_both_registered() {
        let registry = Registry::new();
        let (a, mut rx_a, teardown_a) = handle(1, "sidecar-a", IDENTITY);
        let (b, mut rx_b, teardown_b) = handle(2, "sidecar-b", IDENTITY);

        assert!(registry.register(a).await.is_none());
        assert!(registry.register(b).await.is_none());
        assert!(!teardown_a.is_cancelled());
        assert!(!teardown_b.is_cancelled());
        assert_eq!(registry.identity_streams(IDENTITY).await, 2);

        assert_eq!(registry.notify(IDENTITY).await, Notify::Sent);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_remove_ignores_other_connection() {
        let registry = Registry::new();
        let (first, _rx1, _) = handle(1, "sidecar", IDENTITY);
        let (second, _rx2, _) = handle(2, "sidecar", IDENTITY);
        registry.register(first).await;
        registry.register(second).await;

        // The replaced stream tearing down must not remove its successor.
        assert!(!registry.remove("sidecar", 1).await);
        assert!(registry.contains("sidecar").await);
        assert_eq!(registry.identity_streams(IDENTITY).await, 1);

        assert!(registry.remove("sidecar", 2).await);
        assert!(registry.is_empty().await);
        assert_eq!(registry.identity_streams(IDENTITY).await, 0);
        assert!(!registry.remove("sidecar", 2).await);
    }

    #[tokio::test]
    async fn test_notify_coalesces() {
        let registry = Registry::new();
        let (conn, mut rx, _) = handle(1, "sidecar", IDENTITY);
        registry.register(conn).await;

        assert_eq!(registry.notify(IDENTITY).await, Notify::Sent);
        assert_eq!(registry.notify(IDENTITY).await, Notify::Coalesced);
        assert_eq!(registry.notify(IDENTITY).await, Notify::Coalesced);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_after_remove_is_noop() {
        let registry = Registry::new();
        let (conn, mut rx, _) = handle(1, "sidecar", IDENTITY);
        registry.register(conn).await;
        registry.remove("sidecar", 1).await;

        assert_eq!(registry.notify(IDENTITY).await, Notify::NotFound);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_targets_only_identity() {
        let registry = Registry::new();
        let (conn_i, mut rx_i, _) = handle(1, "sidecar-i", IDENTITY);
        let (conn_j, mut rx_j, _) = handle(2, "sidecar-j", OTHER_IDENTITY);
        registry.register(conn_i).await;
        registry.register(conn_j).await;

        registry.notify(IDENTITY).await;
        assert!(rx_i.try_recv().is_ok());
        assert!(rx_j.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_all_and_close_all() {
        let registry = Registry::new();
        let (conn_i, _rx_i, token_i) = handle(1, "sidecar-i", IDENTITY);
        let (conn_j, _rx_j, token_j) = handle(2, "sidecar-j", OTHER_IDENTITY);
        registry.register(conn_i).await;
        registry.register(conn_j).await;

        assert_eq!(registry.notify_all().await, 2);
        assert_eq!(registry.notify_all().await, 0);

        registry.close_all().await;
        assert!(token_i.is_cancelled());
        assert!(token_j.is_cancelled());
    }
}
