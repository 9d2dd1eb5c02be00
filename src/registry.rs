use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{stable_session_uuid, workspace_hash};
use crate::store::{SessionRow, Store};

/// How long a session may go without a heartbeat before a dead PID closes it.
const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Sweep cadence for the background task.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Signal 0 existence probe.
pub fn pid_alive(pid: i64) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub internal_id: Uuid,
    pub external_session_id: String,
    pub workspace_hash: String,
    pub workspace_path: String,
    pub pid: Option<i64>,
}

struct LiveState {
    session: ActiveSession,
    last_seen: Instant,
}

/// Authoritative set of active Cursor sessions.
///
/// The in-memory map answers the monitor's per-cycle queries without touching
/// the database; `cursor_sessions` holds the durable lifecycle. At most one
/// session per workspace_hash is active at a time; a conflicting start
/// closes the older session first.
pub struct SessionRegistry {
    store: Arc<Store>,
    live: Mutex<HashMap<String, LiveState>>,
}

impl SessionRegistry {
    /// Load still-open sessions from the store so a daemon restart keeps
    /// monitoring the same workspaces.
    pub fn new(store: Arc<Store>) -> Result<Self, PipelineError> {
        let mut live = HashMap::new();
        for row in store.active_sessions()? {
            let internal_id = Uuid::parse_str(&row.id)
                .unwrap_or_else(|_| stable_session_uuid(&row.external_session_id));
            live.insert(
                row.external_session_id.clone(),
                LiveState {
                    session: ActiveSession {
                        internal_id,
                        external_session_id: row.external_session_id,
                        workspace_hash: row.workspace_hash,
                        workspace_path: row.workspace_path,
                        pid: row.pid,
                    },
                    last_seen: Instant::now(),
                },
            );
        }
        Ok(SessionRegistry {
            store,
            live: Mutex::new(live),
        })
    }

    /// Upsert a session and return its internal UUID.
    pub fn session_start(
        &self,
        external_session_id: &str,
        workspace_path: &str,
        hash: Option<&str>,
        pid: Option<i64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Uuid, PipelineError> {
        let hash = hash
            .map(str::to_string)
            .unwrap_or_else(|| workspace_hash(workspace_path));
        let internal_id = stable_session_uuid(external_session_id);

        // the same workspace may have at most one active session
        let displaced: Vec<String> = {
            let live = self.live.lock().unwrap();
            live.values()
                .filter(|s| {
                    s.session.workspace_hash == hash
                        && s.session.external_session_id != external_session_id
                })
                .map(|s| s.session.external_session_id.clone())
                .collect()
        };
        for old in &displaced {
            info!(old, new = external_session_id, "workspace conflict, closing older session");
            self.session_end(old)?;
        }
        self.store
            .close_other_workspace_sessions(&hash, external_session_id)?;

        self.store.upsert_session(&SessionRow {
            id: internal_id.to_string(),
            external_session_id: external_session_id.to_string(),
            workspace_hash: hash.clone(),
            workspace_path: workspace_path.to_string(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ended_at: None,
            pid,
            metadata: metadata.map(|m| m.to_string()),
        })?;

        self.live.lock().unwrap().insert(
            external_session_id.to_string(),
            LiveState {
                session: ActiveSession {
                    internal_id,
                    external_session_id: external_session_id.to_string(),
                    workspace_hash: hash,
                    workspace_path: workspace_path.to_string(),
                    pid,
                },
                last_seen: Instant::now(),
            },
        );
        Ok(internal_id)
    }

    pub fn session_end(&self, external_session_id: &str) -> Result<bool, PipelineError> {
        self.live.lock().unwrap().remove(external_session_id);
        self.store.end_session(external_session_id, None)
    }

    /// Refresh the liveness clock; false when the session is unknown.
    pub fn heartbeat(&self, external_session_id: &str) -> bool {
        let mut live = self.live.lock().unwrap();
        match live.get_mut(external_session_id) {
            Some(state) => {
                state.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Internal UUID for an external session id, if active.
    pub fn resolve(&self, external_session_id: &str) -> Option<Uuid> {
        self.live
            .lock()
            .unwrap()
            .get(external_session_id)
            .map(|s| s.session.internal_id)
    }

    /// Snapshot of active sessions, one per workspace, for the monitor.
    pub fn active(&self) -> Vec<ActiveSession> {
        let live = self.live.lock().unwrap();
        let mut sessions: Vec<_> = live.values().map(|s| s.session.clone()).collect();
        sessions.sort_by(|a, b| a.external_session_id.cmp(&b.external_session_id));
        sessions
    }

    /// Force-close sessions whose owning process is gone and whose heartbeat
    /// is stale. Returns the external ids that were closed.
    pub fn sweep_stale(&self) -> Result<Vec<String>, PipelineError> {
        self.sweep_stale_with(pid_alive, STALE_AFTER)
    }

    fn sweep_stale_with(
        &self,
        is_alive: impl Fn(i64) -> bool,
        max_idle: Duration,
    ) -> Result<Vec<String>, PipelineError> {
        let stale: Vec<String> = {
            let live = self.live.lock().unwrap();
            live.values()
                .filter(|s| {
                    let pid_dead = s.session.pid.map(|p| !is_alive(p)).unwrap_or(false);
                    pid_dead && s.last_seen.elapsed() >= max_idle
                })
                .map(|s| s.session.external_session_id.clone())
                .collect()
        };

        for external_id in &stale {
            warn!(session = %external_id, "owning process gone, force-closing session");
            self.live.lock().unwrap().remove(external_id);
            self.store.end_session(external_id, Some("stale_pid"))?;
        }
        Ok(stale)
    }
}

/// Background sweeper; runs until the shutdown signal flips.
pub async fn run_sweeper(
    registry: Arc<SessionRegistry>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = registry.sweep_stale() {
                    warn!(error = %e, "stale-session sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(Store::open_in_memory().unwrap())).unwrap()
    }

    #[test]
    fn session_start_returns_stable_internal_id() {
        let reg = registry();
        let a = reg
            .session_start("curs_1_a", "/home/dev/api", None, Some(4242), None)
            .unwrap();
        let b = reg
            .session_start("curs_1_a", "/home/dev/api", None, Some(4242), None)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.resolve("curs_1_a"), Some(a));
    }

    #[test]
    fn conflicting_workspace_closes_older_session() {
        let reg = registry();
        reg.session_start("curs_1_a", "/home/dev/api", None, Some(1), None)
            .unwrap();
        reg.session_start("curs_2_b", "/home/dev/api", None, Some(2), None)
            .unwrap();

        let active = reg.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_session_id, "curs_2_b");
        assert!(reg.resolve("curs_1_a").is_none());

        // durable rows agree: exactly one open session for the workspace
        let open = reg.store.active_sessions().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].external_session_id, "curs_2_b");
    }

    #[test]
    fn distinct_workspaces_coexist() {
        let reg = registry();
        reg.session_start("curs_1_a", "/home/dev/api", None, Some(1), None)
            .unwrap();
        reg.session_start("curs_2_b", "/home/dev/web", None, Some(2), None)
            .unwrap();
        assert_eq!(reg.active().len(), 2);
    }

    #[test]
    fn session_end_removes_from_live_set() {
        let reg = registry();
        reg.session_start("curs_1_a", "/home/dev/api", None, None, None)
            .unwrap();
        assert!(reg.session_end("curs_1_a").unwrap());
        assert!(reg.active().is_empty());
        assert!(!reg.heartbeat("curs_1_a"));
    }

    #[test]
    fn sweep_closes_only_dead_and_idle_sessions() {
        let reg = registry();
        reg.session_start("curs_dead", "/home/dev/api", None, Some(111), None)
            .unwrap();
        reg.session_start("curs_live", "/home/dev/web", None, Some(222), None)
            .unwrap();

        // pid 222 alive, pid 111 dead; no idle grace
        let closed = reg
            .sweep_stale_with(|pid| pid == 222, Duration::ZERO)
            .unwrap();
        assert_eq!(closed, vec!["curs_dead".to_string()]);
        assert_eq!(reg.active().len(), 1);

        let row = reg
            .store
            .session_by_external_id("curs_dead")
            .unwrap()
            .unwrap();
        assert!(row.ended_at.is_some());
        assert!(row.metadata.unwrap().contains("stale_pid"));
    }

    #[test]
    fn sweep_spares_recent_heartbeats_even_with_dead_pid() {
        let reg = registry();
        reg.session_start("curs_1_a", "/home/dev/api", None, Some(111), None)
            .unwrap();
        // dead pid but heartbeat is fresh relative to a 1h idle budget
        let closed = reg
            .sweep_stale_with(|_| false, Duration::from_secs(3600))
            .unwrap();
        assert!(closed.is_empty());
    }

    #[test]
    fn registry_reloads_active_sessions_from_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        {
            let reg = SessionRegistry::new(store.clone()).unwrap();
            reg.session_start("curs_1_a", "/home/dev/api", None, Some(1), None)
                .unwrap();
        }
        let reloaded = SessionRegistry::new(store).unwrap();
        assert_eq!(reloaded.active().len(), 1);
        assert!(reloaded.resolve("curs_1_a").is_some());
    }
}
