//! Scope cache and single-flight scope resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use scanbroker_core::api::ScopeNotification;
use scanbroker_core::model::Scope;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, ResolveError};
use crate::locks::NamedMutex;
use crate::manager::Manager;

/// Fetches retried when an invalidation raced the lookup.
const STALE_REFETCHES: usize = 3;

/// Scopes confirmed by the manager, keyed by the secret agents present.
///
/// Every invalidation bumps a generation counter. A lookup started before an
/// invalidation cannot populate the cache afterwards.
#[derive(Default)]
pub struct ScopeCache {
    entries: RwLock<HashMap<String, Scope>>,
    generation: AtomicU64,
}

impl ScopeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, secret: &str) -> Option<Scope> {
        self.entries.read().get(secret).cloned()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Stores `scope` unless the cache was invalidated since `generation`.
    pub fn insert_if_current(&self, secret: &str, scope: Scope, generation: u64) -> bool {
        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.insert(secret.to_string(), scope);
        true
    }

    /// Replaces every entry of `scope.id` with `scope`.
    pub fn replace(&self, scope: Scope) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.retain(|_, s| s.id != scope.id);
        entries.insert(scope.secret.clone(), scope);
    }

    /// Drops updated and removed scopes. Returns the evicted scope ids.
    pub fn invalidate(&self, notification: &ScopeNotification) -> Vec<u64> {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut evicted = Vec::new();
        entries.retain(|_, scope| {
            let evict = notification.evicts(scope.id);
            if evict {
                evicted.push(scope.id);
            }
            !evict
        });
        evicted
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    /// One copy of every cached scope.
    pub fn scopes(&self) -> Vec<Scope> {
        let entries = self.entries.read();
        let mut by_id: HashMap<u64, Scope> = HashMap::with_capacity(entries.len());
        for scope in entries.values() {
            by_id.entry(scope.id).or_insert_with(|| scope.clone());
        }
        let mut scopes: Vec<Scope> = by_id.into_values().collect();
        scopes.sort_by_key(|s| s.id);
        scopes
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves scope secrets through the cache, asking the manager at most once
/// per secret at a time.
pub struct ScopeResolver {
    cache: Arc<ScopeCache>,
    locks: NamedMutex<String>,
    manager: Arc<dyn Manager>,
    shutdown: CancellationToken,
    retry: Duration,
}

impl ScopeResolver {
    pub fn new(
        cache: Arc<ScopeCache>,
        manager: Arc<dyn Manager>,
        shutdown: CancellationToken,
        retry: Duration,
    ) -> Self {
        Self {
            cache,
            locks: NamedMutex::new(),
            manager,
            shutdown,
            retry,
        }
    }

    pub async fn resolve(&self, secret: &str) -> Result<Scope, ResolveError> {
        if let Some(scope) = self.cache.get(secret) {
            return Ok(scope);
        }

        let Some(_primary) = self.locks.try_lock(secret.to_string()) else {
            // Someone else is asking the manager. Whatever they found is in
            // the cache once they let go.
            let _waited = self.locks.lock(secret.to_string()).await;
            return self.cache.get(secret).ok_or(ResolveError::InvalidSecret);
        };

        if let Some(scope) = self.cache.get(secret) {
            return Ok(scope);
        }

        let mut scope = None;
        for _ in 0..STALE_REFETCHES {
            let generation = self.cache.generation();
            let fetched = self.fetch(secret).await?;
            if fetched.id == 0 {
                info!("manager does not know the presented scope secret");
                return Err(ResolveError::InvalidSecret);
            }
            if self.cache.insert_if_current(secret, fetched.clone(), generation) {
                debug!(scope_id = fetched.id, "scope cached");
                return Ok(fetched);
            }
            debug!(scope_id = fetched.id, "scope invalidated during lookup, fetching again");
            scope = Some(fetched);
        }
        // Keeps changing under us; serve the latest copy without caching it.
        scope.ok_or(ResolveError::Unavailable)
    }

    /// Calls the manager, waiting out connectivity failures until the
    /// connection comes back or the broker shuts down.
    async fn fetch(&self, secret: &str) -> Result<Scope, ResolveError> {
        let mut connected = self.manager.connected();
        loop {
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ResolveError::Unavailable),
                res = self.manager.get_scope_full(secret) => res,
            };
            match attempt {
                Ok(scope) => return Ok(scope),
                Err(e) if e.is_connectivity() => {
                    debug!(error = %e, "manager unreachable, waiting to resolve scope");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(ResolveError::Unavailable),
                        changed = connected.changed() => {
                            if changed.is_err() {
                                tokio::time::sleep(self.retry).await;
                            }
                        }
                        _ = tokio::time::sleep(self.retry) => {}
                    }
                }
                Err(ManagerError::Unauthorized) => {
                    warn!("manager rejected the privilege secret");
                    return Err(ResolveError::Unavailable);
                }
                Err(e) => {
                    warn!(error = %e, "scope lookup failed");
                    return Err(ResolveError::Unavailable);
                }
            }
        }
    }
}
