use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::health::{HealthGate, Metrics};
use crate::ingress::publish_event;
use crate::models::{snapshot_hash, stable_event_uuid, Event, Platform};
use crate::queue::MessageQueue;
use crate::registry::{ActiveSession, SessionRegistry};
use crate::store::{MonitorState, Store};

use super::extract;
use super::platform;

const KEY_GENERATIONS: &str = "aiService.generations";
const KEY_COMPOSERS: &str = "composer.composerData";
const KEY_BACKGROUND: &str = "workbench.backgroundComposer.workspacePersistentData";
const KEY_HISTORY: &str = "history.entries";

/// In-memory dedup sets are bounded; the `event_id` unique index is the
/// durable backstop.
const DEDUP_CAP: usize = 4_096;

/// Insertion-ordered bounded set.
struct LruSet {
    set: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl LruSet {
    fn new(cap: usize) -> Self {
        LruSet {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, key: &str) -> bool {
        if !self.set.insert(key.to_string()) {
            return false;
        }
        self.order.push_back(key.to_string());
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

struct WorkspaceState {
    db_path: Option<PathBuf>,
    generations_watermark: i64,
    generation_uuids: LruSet,
    composers: HashMap<String, serde_json::Value>,
    composers_hash: Option<String>,
    bubbles_seen: HashMap<String, HashSet<String>>,
    bubble_hashes: HashMap<String, String>,
    background_hash: Option<String>,
    history_seen: HashSet<String>,
    history_hash: Option<String>,
    storage_missing_logged: bool,
}

impl WorkspaceState {
    fn new() -> Self {
        WorkspaceState {
            db_path: None,
            generations_watermark: 0,
            generation_uuids: LruSet::new(DEDUP_CAP),
            composers: HashMap::new(),
            composers_hash: None,
            bubbles_seen: HashMap::new(),
            bubble_hashes: HashMap::new(),
            background_hash: None,
            history_seen: HashSet::new(),
            history_hash: None,
            storage_missing_logged: false,
        }
    }
}

/// Everything one poll reads from the workspace and global stores.
///
/// Reads are synchronous and the connections are closed before any event is
/// published, so Cursor's files are never held open across suspension
/// points.
#[derive(Default)]
struct SourceSnapshot {
    generations: Option<serde_json::Value>,
    composers: Option<serde_json::Value>,
    background: Option<serde_json::Value>,
    history: Option<serde_json::Value>,
    conversations: HashMap<String, serde_json::Value>,
}

/// Polls Cursor's workspace and global SQLite stores for every active
/// session and emits telemetry events for what changed.
///
/// Polling is authoritative; the interval is configuration. Watchers would
/// only shorten latency and are not required for correctness.
pub struct CursorMonitor {
    user_dir: Option<PathBuf>,
    poll_interval: Duration,
    /// When set, only sessions under this tree are polled.
    workspace_root: Option<PathBuf>,
    registry: Arc<SessionRegistry>,
    store: Arc<Store>,
    queue: Arc<dyn MessageQueue>,
    metrics: Arc<Metrics>,
    gate: HealthGate,
    workspaces: HashMap<String, WorkspaceState>,
}

impl CursorMonitor {
    pub fn new(
        user_dir: Option<PathBuf>,
        poll_interval: Duration,
        registry: Arc<SessionRegistry>,
        store: Arc<Store>,
        queue: Arc<dyn MessageQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        CursorMonitor {
            user_dir,
            poll_interval,
            workspace_root: None,
            registry,
            store,
            queue,
            metrics,
            gate: HealthGate::new(),
            workspaces: HashMap::new(),
        }
    }

    pub fn with_workspace_root(mut self, root: Option<PathBuf>) -> Self {
        self.workspace_root = root;
        self
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        match &self.user_dir {
            Some(dir) => info!(dir = %dir.display(), "cursor monitor started"),
            None => info!("cursor monitor started without a cursor installation"),
        }
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if self.gate.is_cooling() {
                        continue;
                    }
                    self.poll_once().await;
                }
            }
        }
        info!("cursor monitor stopped");
    }

    /// One full poll cycle over all active sessions. Per-workspace failures
    /// are isolated; one corrupt database does not stop the others.
    pub async fn poll_once(&mut self) -> usize {
        let mut sessions = self.registry.active();
        if let Some(root) = &self.workspace_root {
            sessions.retain(|s| std::path::Path::new(&s.workspace_path).starts_with(root));
        }
        if sessions.is_empty() {
            self.gate.record_success();
            return 0;
        }

        let mut emitted = 0;
        let mut failures = 0;
        for session in &sessions {
            match self.poll_workspace(session).await {
                Ok(n) => emitted += n,
                Err(e) => {
                    failures += 1;
                    Metrics::incr(&self.metrics.poll_errors);
                    warn!(workspace = %session.workspace_hash, error = %e, "workspace poll failed");
                }
            }
        }
        if failures == sessions.len() {
            self.gate.record_failure();
        } else {
            self.gate.record_success();
        }
        emitted
    }

    async fn poll_workspace(&mut self, session: &ActiveSession) -> Result<usize, PipelineError> {
        let Some(user_dir) = self.user_dir.clone() else {
            return Ok(0);
        };
        let state = self
            .workspaces
            .entry(session.workspace_hash.clone())
            .or_insert_with(WorkspaceState::new);

        if state.db_path.is_none() {
            state.db_path = platform::find_workspace_db(&user_dir, &session.workspace_path);
            if state.db_path.is_none() {
                if !state.storage_missing_logged {
                    debug!(workspace = %session.workspace_hash, "no workspace storage yet");
                    state.storage_missing_logged = true;
                }
                return Ok(0);
            }
            // first sighting of this workspace: adopt persisted watermarks
            load_monitor_state(&self.store, &session.workspace_hash, state)?;
        }
        let Some(db_path) = state.db_path.clone() else {
            return Ok(0);
        };

        let snapshot = self.read_snapshot(&user_dir, &db_path).await?;

        let mut emitted = 0;
        if let Some(generations) = &snapshot.generations {
            emitted += self.emit_generations(generations, session).await?;
        }
        if let Some(composers) = &snapshot.composers {
            emitted += self.emit_composer_changes(composers, session).await?;
        }
        emitted += self
            .emit_bubbles(&snapshot.conversations, session)
            .await?;
        if let Some(background) = &snapshot.background {
            emitted += self.emit_background(background, session).await?;
        }
        if let Some(history) = &snapshot.history {
            emitted += self.emit_history(history, session).await?;
        }
        Ok(emitted)
    }

    /// Read phase. Connections never survive past this function.
    async fn read_snapshot(
        &mut self,
        user_dir: &std::path::Path,
        db_path: &std::path::Path,
    ) -> Result<SourceSnapshot, PipelineError> {
        let mut snapshot = SourceSnapshot::default();
        {
            let conn = extract::open_with_backoff(db_path).await?;
            snapshot.generations = extract::read_item(&conn, KEY_GENERATIONS)?;
            snapshot.composers = extract::read_item(&conn, KEY_COMPOSERS)?;
            snapshot.background = extract::read_item(&conn, KEY_BACKGROUND)?;
            snapshot.history = extract::read_item(&conn, KEY_HISTORY)?;
        }

        let composer_ids: Vec<String> = snapshot
            .composers
            .as_ref()
            .map(|data| {
                extract::composer_list(data)
                    .iter()
                    .filter_map(|c| c["composerId"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let global_path = platform::global_db_path(user_dir);
        if !composer_ids.is_empty() && global_path.exists() {
            let global = extract::open_with_backoff(&global_path).await?;
            for composer_id in composer_ids {
                let key = format!("composerData:{composer_id}");
                if let Some(data) = extract::read_disk_kv(&global, &key)? {
                    snapshot.conversations.insert(composer_id, data);
                }
            }
        }
        Ok(snapshot)
    }

    async fn emit_generations(
        &mut self,
        generations: &serde_json::Value,
        session: &ActiveSession,
    ) -> Result<usize, PipelineError> {
        let watermark_before = self
            .workspaces
            .get(&session.workspace_hash)
            .map(|s| s.generations_watermark)
            .unwrap_or(0);
        let fresh = extract::new_generations(generations, watermark_before);
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut emitted = 0;
        let mut watermark = watermark_before;
        for generation in fresh {
            let unix_ms = generation["unixMs"].as_i64().unwrap_or(0);
            watermark = watermark.max(unix_ms);

            if let Some(uuid) = generation["generationUUID"].as_str() {
                let state = self.workspaces.get_mut(&session.workspace_hash).unwrap();
                if !state.generation_uuids.insert(uuid) {
                    continue;
                }
            }

            let mut event = Event::new(
                Platform::Cursor,
                "generation",
                session.external_session_id.clone(),
                generation.clone(),
            );
            event.event_id = stable_event_uuid(&[
                "cursor:generation",
                &session.workspace_hash,
                generation["generationUUID"].as_str().unwrap_or(""),
            ]);
            event.workspace_hash = Some(session.workspace_hash.clone());
            if let Some(ts) = ms_to_utc(unix_ms) {
                event.timestamp = ts;
            }
            publish_event(&self.queue, &self.metrics, &event).await?;
            emitted += 1;
        }

        let state = self.workspaces.get_mut(&session.workspace_hash).unwrap();
        state.generations_watermark = watermark;
        self.store.upsert_monitor_state(
            &session.workspace_hash,
            KEY_GENERATIONS,
            &MonitorState {
                last_seen_unix_ms: watermark,
                last_hash: None,
            },
        )?;
        Ok(emitted)
    }

    async fn emit_composer_changes(
        &mut self,
        data: &serde_json::Value,
        session: &ActiveSession,
    ) -> Result<usize, PipelineError> {
        let composers = extract::composer_list(data);
        let hash = snapshot_hash(&serde_json::Value::Array(composers.clone()));

        let changes = {
            let state = self.workspaces.get(&session.workspace_hash).unwrap();
            if state.composers_hash.as_deref() == Some(hash.as_str()) {
                return Ok(0);
            }
            extract::diff_composers(&state.composers, &composers)
        };

        let mut emitted = 0;
        for change in &changes {
            let composer = change.composer();
            let composer_id = composer["composerId"].as_str().unwrap_or("");
            let mut event = Event::new(
                Platform::Cursor,
                change.event_type(),
                session.external_session_id.clone(),
                composer.clone(),
            );
            event.event_id = stable_event_uuid(&[
                "cursor:composer",
                &session.workspace_hash,
                composer_id,
                change.event_type(),
                &snapshot_hash(composer),
            ]);
            event.workspace_hash = Some(session.workspace_hash.clone());
            publish_event(&self.queue, &self.metrics, &event).await?;
            emitted += 1;
        }

        let state = self.workspaces.get_mut(&session.workspace_hash).unwrap();
        state.composers = composers
            .iter()
            .filter_map(|c| {
                c["composerId"]
                    .as_str()
                    .map(|id| (id.to_string(), c.clone()))
            })
            .collect();
        state.composers_hash = Some(hash.clone());
        self.store.upsert_monitor_state(
            &session.workspace_hash,
            KEY_COMPOSERS,
            &MonitorState {
                last_seen_unix_ms: 0,
                last_hash: Some(hash),
            },
        )?;
        Ok(emitted)
    }

    async fn emit_bubbles(
        &mut self,
        conversations: &HashMap<String, serde_json::Value>,
        session: &ActiveSession,
    ) -> Result<usize, PipelineError> {
        let mut emitted = 0;
        // stable iteration keeps bubble order deterministic per composer
        let mut composer_ids: Vec<&String> = conversations.keys().collect();
        composer_ids.sort();

        for composer_id in composer_ids {
            let data = &conversations[composer_id];
            let conversation = &data["conversation"];
            let bubble_ids: Vec<&str> = conversation
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|b| b["bubbleId"].as_str())
                        .collect()
                })
                .unwrap_or_default();
            let hash = snapshot_hash(&serde_json::json!(bubble_ids));

            let seen = {
                let state = self.workspaces.get_mut(&session.workspace_hash).unwrap();
                if state.bubble_hashes.get(composer_id) == Some(&hash) {
                    continue;
                }
                state
                    .bubbles_seen
                    .entry(composer_id.clone())
                    .or_default()
                    .clone()
            };

            for bubble in extract::new_bubbles(&seen, conversation) {
                let bubble_id = bubble["bubbleId"].as_str().unwrap_or("");
                let mut payload = bubble.clone();
                if payload.get("composerId").is_none() {
                    payload["composerId"] = serde_json::Value::String(composer_id.clone());
                }
                let mut event = Event::new(
                    Platform::Cursor,
                    "bubble",
                    session.external_session_id.clone(),
                    payload,
                );
                event.event_id = stable_event_uuid(&["cursor:bubble", composer_id, bubble_id]);
                event.workspace_hash = Some(session.workspace_hash.clone());
                publish_event(&self.queue, &self.metrics, &event).await?;
                emitted += 1;

                let state = self.workspaces.get_mut(&session.workspace_hash).unwrap();
                if let Some(set) = state.bubbles_seen.get_mut(composer_id) {
                    set.insert(bubble_id.to_string());
                    if set.len() > DEDUP_CAP {
                        set.clear();
                    }
                }
            }

            let state = self.workspaces.get_mut(&session.workspace_hash).unwrap();
            state
                .bubble_hashes
                .insert(composer_id.clone(), hash.clone());
            self.store.upsert_monitor_state(
                &session.workspace_hash,
                &format!("composerData:{composer_id}"),
                &MonitorState {
                    last_seen_unix_ms: 0,
                    last_hash: Some(hash),
                },
            )?;
        }
        Ok(emitted)
    }

    async fn emit_background(
        &mut self,
        data: &serde_json::Value,
        session: &ActiveSession,
    ) -> Result<usize, PipelineError> {
        let hash = snapshot_hash(data);
        {
            let state = self.workspaces.get(&session.workspace_hash).unwrap();
            if state.background_hash.as_deref() == Some(hash.as_str()) {
                return Ok(0);
            }
        }

        let mut event = Event::new(
            Platform::Cursor,
            "background_composer_updated",
            session.external_session_id.clone(),
            data.clone(),
        );
        event.event_id = stable_event_uuid(&["cursor:background", &session.workspace_hash, &hash]);
        event.workspace_hash = Some(session.workspace_hash.clone());
        publish_event(&self.queue, &self.metrics, &event).await?;

        let state = self.workspaces.get_mut(&session.workspace_hash).unwrap();
        state.background_hash = Some(hash.clone());
        self.store.upsert_monitor_state(
            &session.workspace_hash,
            KEY_BACKGROUND,
            &MonitorState {
                last_seen_unix_ms: 0,
                last_hash: Some(hash),
            },
        )?;
        Ok(1)
    }

    async fn emit_history(
        &mut self,
        entries: &serde_json::Value,
        session: &ActiveSession,
    ) -> Result<usize, PipelineError> {
        let hash = snapshot_hash(entries);
        let fresh = {
            let state = self.workspaces.get(&session.workspace_hash).unwrap();
            if state.history_hash.as_deref() == Some(hash.as_str()) {
                return Ok(0);
            }
            extract::new_history_entries(&state.history_seen, entries)
        };

        let mut emitted = 0;
        for (resource, entry) in fresh {
            let mut event = Event::new(
                Platform::Cursor,
                "file_opened",
                session.external_session_id.clone(),
                entry,
            );
            event.event_id =
                stable_event_uuid(&["cursor:file_opened", &session.workspace_hash, &resource]);
            event.workspace_hash = Some(session.workspace_hash.clone());
            publish_event(&self.queue, &self.metrics, &event).await?;
            emitted += 1;

            let state = self.workspaces.get_mut(&session.workspace_hash).unwrap();
            state.history_seen.insert(resource);
            if state.history_seen.len() > DEDUP_CAP {
                state.history_seen.clear();
            }
        }

        let state = self.workspaces.get_mut(&session.workspace_hash).unwrap();
        state.history_hash = Some(hash.clone());
        self.store.upsert_monitor_state(
            &session.workspace_hash,
            KEY_HISTORY,
            &MonitorState {
                last_seen_unix_ms: 0,
                last_hash: Some(hash),
            },
        )?;
        Ok(emitted)
    }
}

fn ms_to_utc(unix_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(unix_ms).single()
}

fn load_monitor_state(
    store: &Store,
    workspace_hash: &str,
    state: &mut WorkspaceState,
) -> Result<(), PipelineError> {
    if let Some(s) = store.get_monitor_state(workspace_hash, KEY_GENERATIONS)? {
        state.generations_watermark = s.last_seen_unix_ms;
    }
    if let Some(s) = store.get_monitor_state(workspace_hash, KEY_COMPOSERS)? {
        state.composers_hash = s.last_hash;
    }
    if let Some(s) = store.get_monitor_state(workspace_hash, KEY_BACKGROUND)? {
        state.background_hash = s.last_hash;
    }
    if let Some(s) = store.get_monitor_state(workspace_hash, KEY_HISTORY)? {
        state.history_hash = s.last_hash;
    }
    Ok(())
}
