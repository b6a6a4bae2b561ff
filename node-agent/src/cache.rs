// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Secret cache and rotation manager.
//!
//! The cache maps a workload identity to its current [`Secret`]. Misses are
//! collapsed so that concurrent callers for the same identity share a single
//! CA signing call. A background task reissues secrets nearing expiry and
//! evicts secrets that could not be renewed or are no longer used; each
//! change is published as a [`SecretEvent`].
//!
//! # Locking
//!
//! `inflight` is always taken before `entries`. Neither lock is held across
//! a CA call.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ca_client::chain::leaf_not_after;
use ca_client::{CaClient, SignRequest, generate_csr};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::constants::{
    DEFAULT_EVICTION_DURATION, DEFAULT_ROTATION_GRACE, DEFAULT_ROTATION_INTERVAL,
    DEFAULT_SECRET_TTL, EVENT_CHANNEL_CAPACITY,
};
use crate::errors::AppError;
use crate::models::Secret;

/// Lifetime thresholds of cached secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Validity requested for new certificates.
    pub secret_ttl: Duration,
    /// Period of the rotation task.
    pub rotation_interval: Duration,
    /// Secrets with less remaining lifetime than this are reissued.
    pub rotation_grace: Duration,
    /// Secrets not read for this long are evicted.
    pub eviction_duration: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            secret_ttl: DEFAULT_SECRET_TTL,
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            rotation_grace: DEFAULT_ROTATION_GRACE,
            eviction_duration: DEFAULT_EVICTION_DURATION,
        }
    }
}

/// Change to a cached secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretEvent {
    /// A new secret replaced the previous one.
    Rotated(String),
    /// The secret was dropped; the identity is no longer served.
    Evicted(String),
}

impl SecretEvent {
    pub fn identity(&self) -> &str {
        match self {
            SecretEvent::Rotated(identity) | SecretEvent::Evicted(identity) => identity,
        }
    }
}

struct CacheEntry {
    secret: Arc<Secret>,
    /// CSR the secret was issued from; resubmitted on rotation.
    csr_pem: String,
    token: Zeroizing<String>,
    /// Seconds since the epoch of the last read.
    last_used: AtomicU64,
}

impl CacheEntry {
    fn new(secret: Arc<Secret>, csr_pem: String, token: &str, now: SystemTime) -> Self {
        Self {
            secret,
            csr_pem,
            token: Zeroizing::new(token.to_string()),
            last_used: AtomicU64::new(epoch_secs(now)),
        }
    }

    fn touch(&self, now: SystemTime) {
        self.last_used.store(epoch_secs(now), Ordering::Relaxed);
    }

    fn idle(&self, now: SystemTime) -> Duration {
        Duration::from_secs(epoch_secs(now).saturating_sub(self.last_used.load(Ordering::Relaxed)))
    }
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

type IssueResult = Result<Arc<Secret>, AppError>;

struct Inner {
    ca: Arc<dyn CaClient>,
    options: CacheOptions,
    entries: RwLock<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<IssueResult>>>>,
    events: broadcast::Sender<SecretEvent>,
}

/// Owner of all secrets issued by this agent.
pub struct SecretCache {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    rotation: Mutex<Option<JoinHandle<()>>>,
}

impl SecretCache {
    /// Creates the cache and starts its rotation task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConfigError`] if the rotation interval or the
    /// secret TTL is zero.
    pub fn new(ca: Arc<dyn CaClient>, options: CacheOptions) -> Result<Self, AppError> {
        if options.rotation_interval.is_zero() {
            return Err(AppError::ConfigError(
                "rotation interval must be greater than zero".to_string(),
            ));
        }
        if options.secret_ttl.is_zero() {
            return Err(AppError::ConfigError(
                "secret TTL must be greater than zero".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            ca,
            options,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            events,
        });

        let cancel = CancellationToken::new();
        let rotation = tokio::spawn(rotation_loop(inner.clone(), cancel.clone()));

        tracing::info!(
            "[cache] rotating secrets every {:#?}",
            inner.options.rotation_interval
        );

        Ok(Self {
            inner,
            cancel,
            rotation: Mutex::new(Some(rotation)),
        })
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    /// Returns the secret for `identity`, issuing one if none is cached or
    /// the cached one has expired.
    ///
    /// Concurrent calls for the same identity wait on one issuance. The
    /// issuance runs to completion and populates the cache even if every
    /// caller has gone away.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProvisionFailure`] if the CSR cannot be built or
    /// the CA does not sign it. Failures are not cached.
    #[tracing::instrument(skip(self, token))]
    pub async fn get_secret(&self, identity: &str, token: &str) -> Result<Arc<Secret>, AppError> {
        // Fast path: check if the cached secret is still valid
        if let Some(secret) = self.inner.cached(identity, SystemTime::now()).await {
            return Ok(secret);
        }

        // Slow path: join or start an issuance
        let mut receiver = {
            let mut inflight = self.inner.inflight.lock().await;

            // Double-check after acquiring the lock (an issuance may have completed)
            if let Some(secret) = self.inner.cached(identity, SystemTime::now()).await {
                return Ok(secret);
            }

            match inflight.get(identity) {
                Some(receiver) => {
                    tracing::debug!("[cache] joining in-flight issuance for {identity}");
                    receiver.clone()
                }
                None => {
                    let (sender, receiver) = watch::channel(None);
                    inflight.insert(identity.to_string(), receiver.clone());

                    let inner = self.inner.clone();
                    let identity = identity.to_string();
                    let token = Zeroizing::new(token.to_string());
                    tokio::spawn(async move {
                        inner.issue_and_publish(identity, token, sender).await;
                    });
                    receiver
                }
            }
        };

        let result = receiver.wait_for(Option::is_some).await.map_err(|_| {
            AppError::ProvisionFailure("issuance ended without a result".to_string())
        })?;

        match &*result {
            Some(result) => result.clone(),
            None => Err(AppError::ProvisionFailure(
                "issuance ended without a result".to_string(),
            )),
        }
    }

    /// Returns the cached secret for `identity` without issuing one.
    ///
    /// `None` means the identity is no longer served.
    pub async fn lookup(&self, identity: &str) -> Option<Arc<Secret>> {
        self.inner.cached(identity, SystemTime::now()).await
    }

    /// Subscribes to rotation and eviction events.
    pub fn subscribe(&self) -> broadcast::Receiver<SecretEvent> {
        self.inner.events.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.read().await.is_empty()
    }

    /// Runs one rotation and eviction pass immediately.
    pub async fn rotate_now(&self) {
        self.inner.rotation_pass().await;
    }

    /// Stops the rotation task and waits for it to finish.
    ///
    /// Calling this more than once is a no-op.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.rotation.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!("[cache] rotation task ended abnormally: {:?}", err);
            }
            tracing::info!("[cache] closed");
        }
    }
}

impl Drop for SecretCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    async fn cached(&self, identity: &str, now: SystemTime) -> Option<Arc<Secret>> {
        let entries = self.entries.read().await;
        let entry = entries.get(identity)?;
        if entry.secret.is_expired(now) {
            return None;
        }
        entry.touch(now);
        Some(entry.secret.clone())
    }

    async fn issue_and_publish(
        &self,
        identity: String,
        token: Zeroizing<String>,
        sender: watch::Sender<Option<IssueResult>>,
    ) {
        let result = match generate_csr(&identity) {
            Ok(bundle) => self
                .sign(&identity, &token, &bundle.csr_pem, bundle.private_key_pem.as_bytes())
                .await
                .map(|secret| (secret, bundle.csr_pem.clone())),
            Err(err) => Err(AppError::from(err)),
        };

        let result = {
            let mut inflight = self.inflight.lock().await;
            let result = match result {
                Ok((secret, csr_pem)) => {
                    let entry = CacheEntry::new(secret.clone(), csr_pem, &token, SystemTime::now());
                    self.entries.write().await.insert(identity.clone(), entry);
                    tracing::info!(
                        "[cache] issued secret for {identity}, expires_at: {:?}",
                        secret.expires_at
                    );
                    Ok(secret)
                }
                Err(err) => {
                    tracing::error!("[cache] failed to issue secret for {identity}: {err}");
                    Err(err)
                }
            };
            inflight.remove(&identity);
            result
        };

        sender.send_replace(Some(result));
    }

    async fn sign(
        &self,
        identity: &str,
        token: &str,
        csr_pem: &str,
        private_key: &[u8],
    ) -> IssueResult {
        let request = SignRequest::new(csr_pem, identity, self.options.secret_ttl)
            .with_credential(token);

        let created_at = SystemTime::now();
        let chain = self.ca.sign(&request).await?;
        let expires_at = leaf_not_after(&chain)?;

        Ok(Arc::new(Secret::new(
            identity,
            chain,
            private_key.to_vec(),
            created_at,
            expires_at,
        )))
    }

    /// Reissues secrets nearing expiry, then evicts expired and idle ones.
    /// Every decision uses the same `now`.
    async fn rotation_pass(&self) {
        let now = SystemTime::now();

        struct Candidate {
            identity: String,
            secret: Arc<Secret>,
            csr_pem: String,
            token: Zeroizing<String>,
        }

        let (candidates, mut evictions) = {
            let entries = self.entries.read().await;
            let mut candidates = Vec::new();
            let mut evictions = Vec::new();
            for (identity, entry) in entries.iter() {
                if entry.idle(now) > self.options.eviction_duration {
                    evictions.push((identity.clone(), entry.secret.clone()));
                } else if entry.secret.remaining(now) < self.options.rotation_grace {
                    candidates.push(Candidate {
                        identity: identity.clone(),
                        secret: entry.secret.clone(),
                        csr_pem: entry.csr_pem.clone(),
                        token: entry.token.clone(),
                    });
                }
            }
            (candidates, evictions)
        };

        for candidate in candidates {
            let result = self
                .sign(
                    &candidate.identity,
                    &candidate.token,
                    &candidate.csr_pem,
                    &candidate.secret.private_key,
                )
                .await;

            match result {
                Ok(secret) => {
                    let replaced = {
                        let mut entries = self.entries.write().await;
                        match entries.get_mut(&candidate.identity) {
                            Some(entry) if Arc::ptr_eq(&entry.secret, &candidate.secret) => {
                                entry.secret = secret.clone();
                                true
                            }
                            _ => false,
                        }
                    };
                    if replaced {
                        tracing::info!(
                            "[cache] rotated secret for {}, expires_at: {:?}",
                            candidate.identity,
                            secret.expires_at
                        );
                        self.emit(SecretEvent::Rotated(candidate.identity));
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        "[cache] failed to rotate secret for {}: {err}",
                        candidate.identity
                    );
                    if candidate.secret.is_expired(now) {
                        evictions.push((candidate.identity, candidate.secret));
                    }
                }
            }
        }

        for (identity, secret) in evictions {
            let removed = {
                let mut entries = self.entries.write().await;
                match entries.get(&identity) {
                    Some(entry) if Arc::ptr_eq(&entry.secret, &secret) => {
                        entries.remove(&identity);
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                tracing::info!("[cache] evicted secret for {identity}");
                self.emit(SecretEvent::Evicted(identity));
            }
        }
    }

    fn emit(&self, event: SecretEvent) {
        // No subscriber is not an error; nothing is listening yet.
        if self.events.send(event).is_err() {
            tracing::debug!("[cache] no subscribers for secret event");
        }
    }
}

async fn rotation_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.options.rotation_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                inner.rotation_pass().await;
                tracing::debug!(
                    "[cache] rotation pass done, sleeping for {:#?}",
                    inner.options.rotation_interval
                );
            }
        }
    }

    tracing::debug!("[cache] rotation task stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use ca_client::CaError;
    use ca_client::testing::LocalCa;

    const IDENTITY: &str = "spiffe://cluster.local/ns/ns1/sa/svc1";

    fn options() -> CacheOptions {
        CacheOptions {
            secret_ttl: Duration::from_secs(3600),
            rotation_interval: Duration::from_secs(3600),
            rotation_grace: Duration::from_secs(600),
            eviction_duration: Duration::from_secs(86400),
        }
    }

    fn cache_with(ca: Arc<LocalCa>, options: CacheOptions) -> SecretCache {
        SecretCache::new(ca, options).unwrap()
    }

    /// Replaces the cached secret of `identity` with a copy expiring at `expires_at`.
    async fn set_expiry(cache: &SecretCache, identity: &str, expires_at: SystemTime) {
        let mut entries = cache.inner.entries.write().await;
        let entry = entries.get_mut(identity).unwrap();
        let mut secret = (*entry.secret).clone();
        secret.expires_at = expires_at;
        entry.secret = Arc::new(secret);
    }

    // ==================== Issuance Tests ====================

    #[tokio::test]
    async fn test_get_secret_issues_and_caches() {
        let ca = Arc::new(LocalCa::new().unwrap());
        let cache = cache_with(ca.clone(), options());

        let first = cache.get_secret(IDENTITY, "token").await.unwrap();
        assert_eq!(first.identity, IDENTITY);
        assert_eq!(first.cert_chain.len(), 2);
        assert!(first.expires_at > first.created_at);

        let second = cache.get_secret(IDENTITY, "token").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ca.calls(), 1);
        assert_eq!(cache.len().await, 1);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_signing_call() {
        let ca = Arc::new(LocalCa::new().unwrap());
        ca.set_delay(Duration::from_millis(200));
        let cache = Arc::new(cache_with(ca.clone(), options()));

        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_secret(IDENTITY, "token").await })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_secret(IDENTITY, "token").await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ca.calls(), 1);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let ca = Arc::new(LocalCa::new().unwrap());
        ca.set_failure(Some(CaError::Unreachable("connection refused".to_string())));
        let cache = cache_with(ca.clone(), options());

        let result = cache.get_secret(IDENTITY, "token").await;
        assert!(matches!(result, Err(AppError::ProvisionFailure(_))));
        assert!(cache.is_empty().await);
        assert!(cache.lookup(IDENTITY).await.is_none());

        ca.set_failure(None);
        let secret = cache.get_secret(IDENTITY, "token").await.unwrap();
        assert_eq!(secret.identity, IDENTITY);
        assert_eq!(ca.calls(), 2);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_expired_secret_is_never_served() {
        let ca = Arc::new(LocalCa::new().unwrap());
        let cache = cache_with(ca.clone(), options());

        let old = cache.get_secret(IDENTITY, "token").await.unwrap();
        set_expiry(&cache, IDENTITY, SystemTime::now()).await;

        assert!(cache.lookup(IDENTITY).await.is_none());

        let fresh = cache.get_secret(IDENTITY, "token").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(fresh.expires_at > SystemTime::now());
        assert_eq!(ca.calls(), 2);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_issuance_completes_after_caller_goes_away() {
        let ca = Arc::new(LocalCa::new().unwrap());
        ca.set_delay(Duration::from_millis(100));
        let cache = Arc::new(cache_with(ca.clone(), options()));

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_secret(IDENTITY, "token").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(cache.lookup(IDENTITY).await.is_some());
        assert_eq!(ca.calls(), 1);

        cache.close().await;
    }

    // ==================== Rotation Tests ====================

    #[tokio::test]
    async fn test_rotation_replaces_expiring_secret() {
        let ca = Arc::new(LocalCa::new().unwrap());
        let cache = cache_with(ca.clone(), options());
        let mut events = cache.subscribe();

        let old = cache.get_secret(IDENTITY, "token").await.unwrap();
        set_expiry(&cache, IDENTITY, SystemTime::now() + Duration::from_secs(60)).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        cache.rotate_now().await;

        assert_eq!(
            events.try_recv().unwrap(),
            SecretEvent::Rotated(IDENTITY.to_string())
        );
        let new = cache.lookup(IDENTITY).await.unwrap();
        assert!(new.created_at > old.created_at);
        assert_eq!(new.private_key, old.private_key);
        assert_eq!(ca.calls(), 2);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_rotation_failure_keeps_old_secret() {
        let ca = Arc::new(LocalCa::new().unwrap());
        let cache = cache_with(ca.clone(), options());
        let mut events = cache.subscribe();

        cache.get_secret(IDENTITY, "token").await.unwrap();
        set_expiry(&cache, IDENTITY, SystemTime::now() + Duration::from_secs(60)).await;

        ca.set_failure(Some(CaError::Unreachable("down".to_string())));
        cache.rotate_now().await;

        assert!(events.try_recv().is_err());
        assert!(cache.lookup(IDENTITY).await.is_some());

        cache.close().await;
    }

    #[tokio::test]
    async fn test_expired_secret_evicted_when_rotation_fails() {
        let ca = Arc::new(LocalCa::new().unwrap());
        let cache = cache_with(ca.clone(), options());
        let mut events = cache.subscribe();

        cache.get_secret(IDENTITY, "token").await.unwrap();
        set_expiry(&cache, IDENTITY, SystemTime::now()).await;

        ca.set_failure(Some(CaError::Unreachable("down".to_string())));
        cache.rotate_now().await;

        assert_eq!(
            events.try_recv().unwrap(),
            SecretEvent::Evicted(IDENTITY.to_string())
        );
        assert!(cache.is_empty().await);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_idle_secret_evicted() {
        let ca = Arc::new(LocalCa::new().unwrap());
        let mut opts = options();
        opts.eviction_duration = Duration::from_secs(60);
        let cache = cache_with(ca.clone(), opts);
        let mut events = cache.subscribe();

        cache.get_secret(IDENTITY, "token").await.unwrap();
        {
            let entries = cache.inner.entries.read().await;
            let stale = SystemTime::now() - Duration::from_secs(120);
            entries[IDENTITY].last_used.store(epoch_secs(stale), Ordering::Relaxed);
        }
        cache.rotate_now().await;

        assert_eq!(
            events.try_recv().unwrap(),
            SecretEvent::Evicted(IDENTITY.to_string())
        );
        assert!(cache.lookup(IDENTITY).await.is_none());

        cache.close().await;
    }

    #[tokio::test]
    async fn test_rotation_task_runs_on_interval() {
        let ca = Arc::new(LocalCa::new().unwrap());
        let mut opts = options();
        opts.rotation_interval = Duration::from_millis(100);
        // Every secret is always within the grace window.
        opts.rotation_grace = Duration::from_secs(7200);
        let cache = cache_with(ca.clone(), opts);
        let mut events = cache.subscribe();

        cache.get_secret(IDENTITY, "token").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SecretEvent::Rotated(IDENTITY.to_string()));

        cache.close().await;
    }

    // ==================== Lifecycle Tests ====================

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let ca = Arc::new(LocalCa::new().unwrap());
        let cache = cache_with(ca, options());
        cache.close().await;
        cache.close().await;
        assert!(cache.cancel.is_cancelled());
        assert!(cache.rotation.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_rotation_interval_rejected() {
        let ca = Arc::new(LocalCa::new().unwrap());
        let mut opts = options();
        opts.rotation_interval = Duration::ZERO;
        assert!(matches!(
            SecretCache::new(ca, opts),
            Err(AppError::ConfigError(_))
        ));
    }
}
