use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{HubError, Result};

/// Health-check cadence per remote.
const HEALTH_INTERVAL: Duration = Duration::from_secs(15);
/// Per-attempt budget for one health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// A federated remote instance owned by this HQ.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remote {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: String,
    pub registered_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<Timestamp>,
}

/// What the HQ dashboard sees; the bearer token never leaves the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSummary {
    pub id: String,
    pub name: String,
    pub url: String,
    pub registered_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<Timestamp>,
    pub session_count: usize,
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, Remote>,
    name_index: HashMap<String, String>,
    /// session id → owning remote id; every session maps to at most one.
    session_index: HashMap<String, String>,
    sessions_by_remote: HashMap<String, HashSet<String>>,
}

/// HQ-side registry of remotes, their session ownership, and their health.
pub struct RemoteRegistry {
    inner: Mutex<RegistryInner>,
    http: reqwest::blocking::Client,
}

impl RemoteRegistry {
    pub fn new() -> Arc<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .expect("failed to construct http client");
        Arc::new(Self {
            inner: Mutex::new(RegistryInner::default()),
            http,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a remote. Name uniqueness is a hard invariant; an
    /// immediate health check runs in the background.
    pub fn register(self: &Arc<Self>, remote: Remote) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.name_index.contains_key(&remote.name) {
                return Err(HubError::DuplicateRemoteName {
                    name: remote.name.clone(),
                });
            }
            inner.name_index.insert(remote.name.clone(), remote.id.clone());
            inner.by_id.insert(remote.id.clone(), remote.clone());
            inner
                .sessions_by_remote
                .insert(remote.id.clone(), HashSet::new());
        }
        info!(remote = remote.name, url = remote.url, "registered remote");

        let registry = Arc::clone(self);
        let remote_id = remote.id;
        std::thread::spawn(move || {
            registry.check_remote(&remote_id);
        });
        Ok(())
    }

    /// Removes a remote and every session mapping it owned.
    pub fn unregister(&self, remote_id: &str) -> Option<Remote> {
        let mut inner = self.lock();
        let remote = inner.by_id.remove(remote_id)?;
        inner.name_index.remove(&remote.name);
        if let Some(sessions) = inner.sessions_by_remote.remove(remote_id) {
            for session_id in sessions {
                inner.session_index.remove(&session_id);
            }
        }
        info!(remote = remote.name, "unregistered remote");
        Some(remote)
    }

    pub fn get(&self, remote_id: &str) -> Option<Remote> {
        self.lock().by_id.get(remote_id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Remote> {
        let inner = self.lock();
        let id = inner.name_index.get(name)?;
        inner.by_id.get(id).cloned()
    }

    pub fn get_by_session_id(&self, session_id: &str) -> Option<Remote> {
        let inner = self.lock();
        let remote_id = inner.session_index.get(session_id)?;
        inner.by_id.get(remote_id).cloned()
    }

    /// Atomically rewrites the remote's owned-session set.
    pub fn update_sessions(&self, remote_id: &str, session_ids: Vec<String>) {
        let mut inner = self.lock();
        if !inner.by_id.contains_key(remote_id) {
            return;
        }
        if let Some(old) = inner.sessions_by_remote.remove(remote_id) {
            for session_id in old {
                inner.session_index.remove(&session_id);
            }
        }
        let mut set = HashSet::new();
        for session_id in session_ids {
            inner
                .session_index
                .insert(session_id.clone(), remote_id.to_string());
            set.insert(session_id);
        }
        inner.sessions_by_remote.insert(remote_id.to_string(), set);
    }

    /// Adds one session to a remote's owned set, e.g. on a
    /// `refresh-sessions` notification.
    pub fn add_session(&self, remote_id: &str, session_id: &str) {
        let mut inner = self.lock();
        if !inner.by_id.contains_key(remote_id) {
            return;
        }
        if let Some(previous) = inner
            .session_index
            .insert(session_id.to_string(), remote_id.to_string())
        {
            if let Some(set) = inner.sessions_by_remote.get_mut(&previous) {
                set.remove(session_id);
            }
        }
        inner
            .sessions_by_remote
            .entry(remote_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    /// Drops a single session→remote mapping, e.g. when the session's
    /// directory disappears.
    pub fn clear_session(&self, session_id: &str) {
        let mut inner = self.lock();
        if let Some(remote_id) = inner.session_index.remove(session_id) {
            if let Some(set) = inner.sessions_by_remote.get_mut(&remote_id) {
                set.remove(session_id);
            }
        }
    }

    pub fn list(&self) -> Vec<RemoteSummary> {
        let inner = self.lock();
        let mut summaries: Vec<RemoteSummary> = inner
            .by_id
            .values()
            .map(|remote| RemoteSummary {
                id: remote.id.clone(),
                name: remote.name.clone(),
                url: remote.url.clone(),
                registered_at: remote.registered_at,
                last_heartbeat: remote.last_heartbeat,
                session_count: inner
                    .sessions_by_remote
                    .get(&remote.id)
                    .map_or(0, HashSet::len),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// One health probe; a failure unregisters the remote.
    fn check_remote(&self, remote_id: &str) -> bool {
        let Some(remote) = self.get(remote_id) else {
            return false;
        };
        let url = format!("{}/api/health", remote.url.trim_end_matches('/'));
        let healthy = self
            .http
            .get(&url)
            .bearer_auth(&remote.token)
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false);

        if healthy {
            let mut inner = self.lock();
            if let Some(remote) = inner.by_id.get_mut(remote_id) {
                remote.last_heartbeat = Some(Timestamp::now());
            }
            debug!(remote = remote.name, "health check ok");
        } else {
            warn!(remote = remote.name, "health check failed, unregistering");
            self.unregister(remote_id);
        }
        healthy
    }

    /// Background loop: every 15 s, probe all remotes in parallel. Skipped
    /// entirely while shutting down.
    pub fn start_health_loop(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        std::thread::Builder::new()
            .name("remote-health".to_string())
            .spawn(move || loop {
                std::thread::sleep(HEALTH_INTERVAL);
                if crate::utils::is_shutting_down() {
                    return;
                }
                let ids: Vec<String> = registry.lock().by_id.keys().cloned().collect();
                let handles: Vec<_> = ids
                    .into_iter()
                    .map(|remote_id| {
                        let registry = Arc::clone(&registry);
                        std::thread::spawn(move || {
                            registry.check_remote(&remote_id);
                        })
                    })
                    .collect();
                for handle in handles {
                    let _ = handle.join();
                }
            })
            .expect("failed to spawn health loop");
    }
}
