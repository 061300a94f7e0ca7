//! Pool lifecycle and admission control for project preview servers.
//!
//! The manager owns every [`LocalFileServer`] instance and the port
//! manager; callers only ever hold URLs. Structural pool changes
//! (insert, evict, remove) serialize under one async lock; URL reads on a
//! running instance take only a brief read of the pool map and never wait
//! on `stop`/`stop_all`/eviction/the reaper.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};

use api_types::{PreviewServerEntry, PreviewServerStats};
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::config::PreviewConfig;
use super::error::PreviewServerError;
use super::file_server::LocalFileServer;
use super::monotonic_ms;
use super::port_manager::PortManager;
use super::token::AccessToken;

/// Coordinates the bounded pool of per-project preview servers.
pub struct ProjectServerManager {
    inner: Arc<ManagerInner>,
    reaper: CancellationToken,
}

struct ManagerInner {
    config: PreviewConfig,
    ports: PortManager,
    /// Serializes structural pool changes and instance `start`/`stop`.
    lifecycle: Mutex<LifecycleState>,
    /// Read view of the pool. Held only for map lookups, never across an
    /// await; all mutation happens under the `lifecycle` lock.
    pool: RwLock<HashMap<String, PoolEntry>>,
}

#[derive(Default)]
struct LifecycleState {
    roots: HashMap<String, PathBuf>,
    insert_seq: u64,
}

struct PoolEntry {
    server: Arc<LocalFileServer>,
    /// Eviction tie-breaker for equal `last_accessed` stamps.
    inserted: u64,
}

impl ProjectServerManager {
    /// Builds the manager and spawns its idle reaper.
    #[must_use]
    pub fn new(config: PreviewConfig) -> Self {
        let ports = PortManager::load(
            config.port_map_path.clone(),
            config.port_range,
            config.bind_address,
        );
        let inner = Arc::new(ManagerInner {
            config,
            ports,
            lifecycle: Mutex::new(LifecycleState::default()),
            pool: RwLock::new(HashMap::new()),
        });
        let reaper = CancellationToken::new();
        spawn_idle_reaper(Arc::downgrade(&inner), reaper.clone());
        Self { inner, reaper }
    }

    /// Registers a project root. Only registered roots are ever served.
    pub async fn register_project_root(
        &self,
        project_id: &str,
        root: impl AsRef<Path>,
    ) -> Result<(), PreviewServerError> {
        if !is_valid_project_id(project_id) {
            return Err(PreviewServerError::InvalidProjectId {
                id: project_id.to_string(),
            });
        }
        let root = root.as_ref();
        let canonical =
            std::fs::canonicalize(root).map_err(|_| PreviewServerError::RootInvalid {
                path: root.to_path_buf(),
            })?;
        if !canonical.is_dir() {
            return Err(PreviewServerError::RootInvalid {
                path: root.to_path_buf(),
            });
        }
        let mut lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.roots.insert(project_id.to_string(), canonical);
        Ok(())
    }

    /// Stops any running instance for the project and forgets its root.
    pub async fn unregister_project_root(&self, project_id: &str) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.roots.remove(project_id);
        if let Some(entry) = self.inner.remove(project_id) {
            entry.server.stop().await;
            self.inner.ports.release(project_id);
        }
    }

    /// Tokenized URL for a file in the project, starting a server on demand.
    ///
    /// When the pool is full the least recently used instance is stopped
    /// first. A start failure after eviction propagates without restoring
    /// the victim.
    pub async fn url_for(
        &self,
        project_id: &str,
        relative_path: &str,
    ) -> Result<String, PreviewServerError> {
        // Fast path: a URL for a running instance needs no structural lock.
        if let Some(server) = self.inner.running(project_id) {
            return server.url_for(relative_path);
        }

        let mut lifecycle = self.inner.lifecycle.lock().await;
        // Another caller may have started the instance while we waited.
        if let Some(server) = self.inner.running(project_id) {
            return server.url_for(relative_path);
        }

        let root = lifecycle
            .roots
            .get(project_id)
            .cloned()
            .ok_or_else(|| PreviewServerError::RootInvalid {
                path: PathBuf::from(project_id),
            })?;

        if self.inner.pool_len() >= self.inner.config.max_active_servers {
            evict_lru(&self.inner).await;
        }

        let port = self.inner.ports.allocate(project_id)?;
        let server = Arc::new(LocalFileServer::new(
            project_id,
            root,
            port,
            AccessToken::generate(),
            self.inner.config.bind_address,
            self.inner.config.start_timeout,
        ));
        if let Err(err) = server.start().await {
            self.inner.ports.release(project_id);
            return Err(err);
        }

        let inserted = lifecycle.insert_seq;
        lifecycle.insert_seq += 1;
        self.inner.insert(project_id, Arc::clone(&server), inserted);
        server.url_for(relative_path)
    }

    /// Stops and removes the project's instance; no-op when absent.
    pub async fn stop(&self, project_id: &str) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(entry) = self.inner.remove(project_id) {
            entry.server.stop().await;
            self.inner.ports.release(project_id);
        }
    }

    /// Cancels the idle reaper and stops every instance concurrently.
    /// Idempotent.
    pub async fn stop_all(&self) {
        self.reaper.cancel();
        let _lifecycle = self.inner.lifecycle.lock().await;
        let entries = self.inner.drain();
        let ports = &self.inner.ports;
        join_all(entries.into_iter().map(|(project_id, entry)| async move {
            entry.server.stop().await;
            ports.release(&project_id);
        }))
        .await;
    }

    /// Full shutdown for app exit: stop everything, flush the port mapping.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.inner.ports.flush();
    }

    /// Read-only pool snapshot for the status UI.
    pub async fn stats(&self) -> PreviewServerStats {
        let mut entries: Vec<PreviewServerEntry> = self
            .inner
            .snapshot()
            .into_iter()
            .map(|(project_id, server, _)| PreviewServerEntry {
                project_id,
                port: server.port(),
            })
            .collect();
        entries.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        PreviewServerStats {
            active_servers: entries.len(),
            max_servers: self.inner.config.max_active_servers,
            per_project_entries: entries,
        }
    }
}

impl Drop for ProjectServerManager {
    fn drop(&mut self) {
        // The reaper task only holds a weak handle; cancelling here just
        // ends it promptly instead of on its next tick.
        self.reaper.cancel();
    }
}

impl ManagerInner {
    fn running(&self, project_id: &str) -> Option<Arc<LocalFileServer>> {
        let pool = self.pool.read().unwrap_or_else(|e| e.into_inner());
        pool.get(project_id).map(|entry| Arc::clone(&entry.server))
    }

    fn pool_len(&self) -> usize {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn insert(&self, project_id: &str, server: Arc<LocalFileServer>, inserted: u64) {
        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        pool.insert(project_id.to_string(), PoolEntry { server, inserted });
    }

    fn remove(&self, project_id: &str) -> Option<PoolEntry> {
        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        pool.remove(project_id)
    }

    fn drain(&self) -> Vec<(String, PoolEntry)> {
        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        pool.drain().collect()
    }

    fn snapshot(&self) -> Vec<(String, Arc<LocalFileServer>, u64)> {
        let pool = self.pool.read().unwrap_or_else(|e| e.into_inner());
        pool.iter()
            .map(|(project_id, entry)| {
                (project_id.clone(), Arc::clone(&entry.server), entry.inserted)
            })
            .collect()
    }
}

/// Stops the pool entry with the smallest `last_accessed`, ties broken by
/// insertion order, and frees its port. Caller holds the lifecycle lock.
async fn evict_lru(inner: &ManagerInner) {
    let victim = inner
        .snapshot()
        .into_iter()
        .min_by_key(|(_, server, inserted)| (server.last_accessed(), *inserted))
        .map(|(project_id, _, _)| project_id);
    let Some(project_id) = victim else {
        return;
    };
    if let Some(entry) = inner.remove(&project_id) {
        tracing::info!(project = %project_id, "evicting least recently used preview server");
        entry.server.stop().await;
        inner.ports.release(&project_id);
    }
}

fn spawn_idle_reaper(inner: Weak<ManagerInner>, cancel: CancellationToken) {
    let Some(strong) = inner.upgrade() else {
        return;
    };
    let period = strong.config.reaper_interval;
    drop(strong);
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            // Weak handle: the manager stays destroyable while a tick runs.
            let Some(inner) = inner.upgrade() else {
                return;
            };
            reap_idle(&inner).await;
        }
    });
}

/// Stops every instance idle longer than the configured timeout. Errors
/// from individual stops must not poison the rest of the pool.
async fn reap_idle(inner: &ManagerInner) {
    let idle_timeout = inner.config.idle_timeout.as_millis() as u64;
    let now = monotonic_ms();
    let _lifecycle = inner.lifecycle.lock().await;
    let idle: Vec<String> = inner
        .snapshot()
        .into_iter()
        .filter(|(_, server, _)| now.saturating_sub(server.last_accessed()) > idle_timeout)
        .map(|(project_id, _, _)| project_id)
        .collect();
    for project_id in idle {
        if let Some(entry) = inner.remove(&project_id) {
            tracing::info!(project = %project_id, "reaping idle preview server");
            entry.server.stop().await;
            inner.ports.release(&project_id);
        }
    }
}

fn is_valid_project_id(project_id: &str) -> bool {
    !project_id.is_empty()
        && project_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_shape() {
        assert!(is_valid_project_id("proj1"));
        assert!(is_valid_project_id("a_b-C9"));
        assert!(!is_valid_project_id(""));
        assert!(!is_valid_project_id("../evil"));
        assert!(!is_valid_project_id("a b"));
        assert!(!is_valid_project_id("a/b"));
    }
}
