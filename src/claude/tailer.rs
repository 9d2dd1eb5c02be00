use chrono::Utc;
use notify::Watcher;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::health::{HealthGate, Metrics};
use crate::ingress::publish_event;
use crate::queue::MessageQueue;
use crate::store::{FileState, Store};

use super::transcript;

/// Incremental reader for Claude Code's append-only JSONL transcripts.
///
/// Offsets are durable: the `claude_jsonl_offsets` row for a file is only
/// advanced after every event read from it has been enqueued, which bounds
/// the crash re-read window to one batch. Polling is the correctness
/// mechanism; the directory watcher just shortens latency.
pub struct ClaudeTailer {
    projects_dir: PathBuf,
    poll_interval: Duration,
    store: Arc<Store>,
    queue: Arc<dyn MessageQueue>,
    metrics: Arc<Metrics>,
    gate: HealthGate,
    states: HashMap<PathBuf, FileState>,
}

/// What one file contributed to a poll cycle.
#[derive(Debug, Default, PartialEq)]
pub struct TailSummary {
    pub events: usize,
    pub malformed: usize,
}

impl ClaudeTailer {
    pub fn new(
        projects_dir: PathBuf,
        poll_interval: Duration,
        store: Arc<Store>,
        queue: Arc<dyn MessageQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        ClaudeTailer {
            projects_dir,
            poll_interval,
            store,
            queue,
            metrics,
            gate: HealthGate::new(),
            states: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(dir = %self.projects_dir.display(), "claude tailer started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Watcher-assisted: filesystem events trigger an early poll, but the
        // timer remains authoritative.
        let (wake_tx, mut wake_rx) = tokio::sync::mpsc::unbounded_channel();
        let _watcher = spawn_watcher(&self.projects_dir, wake_tx);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if !self.gate.is_cooling() {
                        self.poll_once().await;
                    }
                }
                Some(()) = wake_rx.recv() => {
                    while wake_rx.try_recv().is_ok() {}
                    if !self.gate.is_cooling() {
                        self.poll_once().await;
                    }
                }
            }
        }
        info!("claude tailer stopped");
    }

    /// One poll over every candidate transcript file.
    pub async fn poll_once(&mut self) -> usize {
        let files = enumerate_transcripts(&self.projects_dir);
        let mut emitted = 0;
        let mut failed = 0;
        for file in &files {
            match self.poll_file(file).await {
                Ok(summary) => emitted += summary.events,
                Err(e) => {
                    failed += 1;
                    Metrics::incr(&self.metrics.poll_errors);
                    warn!(file = %file.display(), error = %e, "transcript poll failed");
                }
            }
        }
        if !files.is_empty() && failed == files.len() {
            self.gate.record_failure();
        } else {
            self.gate.record_success();
        }
        emitted
    }

    async fn poll_file(&mut self, path: &Path) -> Result<TailSummary, PipelineError> {
        let meta = std::fs::metadata(path)?;
        let size = meta.len();
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let path_str = path.to_string_lossy().to_string();
        let mut state = match self.states.get(path) {
            Some(state) => state.clone(),
            None => self
                .store
                .get_file_state(&path_str)?
                .unwrap_or_default(),
        };

        if size < state.last_size {
            // truncation: the file was replaced, start over; identical
            // re-read lines dedupe on their stable event ids downstream
            debug!(file = %path.display(), "transcript shrank, resetting offset");
            state.line_offset = 0;
        } else if size == state.last_size && mtime == state.last_mtime {
            self.states.insert(path.to_path_buf(), state);
            return Ok(TailSummary::default());
        }

        let (lines, new_offset) = read_complete_lines(path, state.line_offset)?;
        let file_stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut summary = TailSummary::default();
        let mut session_id = file_stem.clone();
        let mut agent_id = None;
        for (offset, line) in &lines {
            let Some(parsed) = transcript::parse_line(line) else {
                summary.malformed += 1;
                debug!(file = %path.display(), offset, "skipping malformed transcript line");
                continue;
            };
            if agent_id.is_none() {
                agent_id = parsed.record["agentId"].as_str().map(str::to_string);
            }
            let event = transcript::build_event(parsed, &file_stem, &path_str, *offset);
            session_id = event.external_session_id.clone();
            publish_event(&self.queue, &self.metrics, &event).await?;
            summary.events += 1;
        }

        // Only after the whole batch is enqueued does the offset move: a
        // crash in between re-reads (and dedupes) at most this batch.
        state.line_offset = new_offset;
        state.last_size = size;
        state.last_mtime = mtime;
        state.last_read_time = Some(Utc::now());
        self.store
            .upsert_file_state(&path_str, &session_id, agent_id.as_deref(), &state)?;
        self.states.insert(path.to_path_buf(), state);
        Ok(summary)
    }
}

/// `~/.claude/projects/<project>/<session>.jsonl`, recursively.
fn enumerate_transcripts(projects_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect_jsonl(projects_dir, &mut files, 0);
    files.sort();
    files
}

fn collect_jsonl(dir: &Path, files: &mut Vec<PathBuf>, depth: usize) {
    if depth > 4 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_jsonl(&path, files, depth + 1);
        } else if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
            files.push(path);
        }
    }
}

/// Read complete lines from `offset` to EOF.
///
/// A line only counts when its terminating newline is present; partial
/// trailing bytes stay unread and the returned offset stops at the last
/// newline. Each returned line carries the byte offset it started at.
fn read_complete_lines(
    path: &Path,
    offset: u64,
) -> Result<(Vec<(u64, String)>, u64), PipelineError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;

    let mut lines = Vec::new();
    let mut position = offset;
    let mut buf = String::new();
    loop {
        buf.clear();
        let n = reader.read_line(&mut buf)?;
        if n == 0 {
            break;
        }
        if !buf.ends_with('\n') {
            // partial tail: leave it for the next cycle
            break;
        }
        let line_start = position;
        position += n as u64;
        let line = buf.trim_end_matches('\n').trim_end_matches('\r');
        if !line.is_empty() {
            lines.push((line_start, line.to_string()));
        }
    }
    Ok((lines, position))
}

fn spawn_watcher(
    dir: &Path,
    wake: tokio::sync::mpsc::UnboundedSender<()>,
) -> Option<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
        if res.is_ok() {
            let _ = wake.send(());
        }
    })
    .ok()?;
    watcher
        .watch(dir, notify::RecursiveMode::Recursive)
        .ok()?;
    Some(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, MessageQueue, STREAM_EVENTS};
    use std::io::Write;

    struct Harness {
        dir: tempfile::TempDir,
        queue: Arc<MemoryQueue>,
        store: Arc<Store>,
        tailer: ClaudeTailer,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tailer = ClaudeTailer::new(
            dir.path().to_path_buf(),
            Duration::from_secs(2),
            store.clone(),
            queue.clone(),
            Arc::new(Metrics::default()),
        );
        Harness {
            dir,
            queue,
            store,
            tailer,
        }
    }

    fn transcript_path(h: &Harness) -> PathBuf {
        let project = h.dir.path().join("-home-dev-api");
        std::fs::create_dir_all(&project).unwrap();
        project.join("4be0ac86-21f1-4c34-9ddb-d95b3c6b0f8a.jsonl")
    }

    fn user_line(uuid: &str) -> String {
        format!(
            "{{\"type\":\"user\",\"uuid\":\"{uuid}\",\"timestamp\":\"2026-01-15T10:00:00Z\",\"message\":{{\"role\":\"user\"}}}}\n"
        )
    }

    #[tokio::test]
    async fn complete_lines_emit_partial_tail_waits() {
        let mut h = harness();
        let path = transcript_path(&h);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{}", user_line("u1")).unwrap();
        write!(f, "{}", user_line("u2")).unwrap();
        write!(f, "{}", user_line("u3")).unwrap();
        write!(f, "{{\"type\":\"user\",\"uuid\":\"u4\",\"par").unwrap();
        drop(f);

        assert_eq!(h.tailer.poll_once().await, 3);

        // offset sits exactly after the third newline
        let expected = user_line("u1").len() as u64 * 3;
        let state = h
            .store
            .get_file_state(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(state.line_offset, expected);

        // completing the partial line and appending two more emits three
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "tial\":true}}").unwrap();
        write!(f, "{}", user_line("u5")).unwrap();
        write!(f, "{}", user_line("u6")).unwrap();
        drop(f);

        assert_eq!(h.tailer.poll_once().await, 3);
        assert_eq!(h.queue.len(STREAM_EVENTS), 6);
    }

    #[tokio::test]
    async fn unchanged_file_is_skipped() {
        let mut h = harness();
        let path = transcript_path(&h);
        std::fs::write(&path, user_line("u1")).unwrap();

        assert_eq!(h.tailer.poll_once().await, 1);
        assert_eq!(h.tailer.poll_once().await, 0);
        assert_eq!(h.queue.len(STREAM_EVENTS), 1);
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_and_offset_advances() {
        let mut h = harness();
        let path = transcript_path(&h);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{}", user_line("u1")).unwrap();
        writeln!(f, "this is not json").unwrap();
        write!(f, "{}", user_line("u2")).unwrap();
        drop(f);

        assert_eq!(h.tailer.poll_once().await, 2);

        let size = std::fs::metadata(&path).unwrap().len();
        let state = h
            .store
            .get_file_state(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(state.line_offset, size);

        // the bad line never comes back
        assert_eq!(h.tailer.poll_once().await, 0);
    }

    #[tokio::test]
    async fn truncation_resets_offset_and_rereads() {
        let mut h = harness();
        let path = transcript_path(&h);
        std::fs::write(
            &path,
            format!("{}{}", user_line("u1"), user_line("u2")),
        )
        .unwrap();
        assert_eq!(h.tailer.poll_once().await, 2);

        // file replaced with shorter, partly-overlapping content
        std::fs::write(&path, user_line("u1")).unwrap();
        // mtime nudged so (size, mtime) can't collide with the old state
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(2_000_000_000, 0))
            .unwrap();

        let n = h.tailer.poll_once().await;
        assert_eq!(n, 1, "replacement content is re-read from offset 0");

        let state = h
            .store
            .get_file_state(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(state.line_offset, user_line("u1").len() as u64);

        // the re-read line carries its original stable event id, so the
        // store keeps exactly one row for it
        h.queue.ensure_group(STREAM_EVENTS, "t").await.unwrap();
        let msgs = h
            .queue
            .read_group(STREAM_EVENTS, "t", "t", 10, 0)
            .await
            .unwrap();
        let events: Vec<_> = msgs
            .iter()
            .map(|m| crate::codec::decode_wire(&m.fields).unwrap())
            .collect();
        assert_eq!(events[0].event_id, events[2].event_id);
        let unique: std::collections::HashSet<_> =
            events.iter().map(|e| e.event_id).collect();
        assert_eq!(unique.len(), 2);
    }

    #[tokio::test]
    async fn offsets_survive_tailer_restart() {
        let mut h = harness();
        let path = transcript_path(&h);
        std::fs::write(&path, user_line("u1")).unwrap();
        assert_eq!(h.tailer.poll_once().await, 1);

        let mut restarted = ClaudeTailer::new(
            h.dir.path().to_path_buf(),
            Duration::from_secs(2),
            h.store.clone(),
            h.queue.clone(),
            Arc::new(Metrics::default()),
        );
        // nothing new: the durable offset prevents a re-read
        assert_eq!(restarted.poll_once().await, 0);

        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(user_line("u2").as_bytes())
            .unwrap();
        assert_eq!(restarted.poll_once().await, 1);
    }

    #[tokio::test]
    async fn session_id_comes_from_file_stem() {
        let mut h = harness();
        let path = transcript_path(&h);
        std::fs::write(&path, user_line("u1")).unwrap();
        h.tailer.poll_once().await;

        h.queue.ensure_group(STREAM_EVENTS, "t").await.unwrap();
        let msgs = h
            .queue
            .read_group(STREAM_EVENTS, "t", "t", 10, 0)
            .await
            .unwrap();
        let event = crate::codec::decode_wire(&msgs[0].fields).unwrap();
        assert_eq!(
            event.external_session_id,
            "4be0ac86-21f1-4c34-9ddb-d95b3c6b0f8a"
        );
    }

    #[test]
    fn enumerate_finds_nested_jsonl_only() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("-home-dev-api");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("a.jsonl"), "").unwrap();
        std::fs::write(project.join("notes.txt"), "").unwrap();
        std::fs::write(dir.path().join("top.jsonl"), "").unwrap();

        let files = enumerate_transcripts(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() == "jsonl"));
    }
}
