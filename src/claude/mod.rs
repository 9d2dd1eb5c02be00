//! Claude Code transcript capture.
//!
//! Claude Code appends JSONL transcripts under `~/.claude/projects/`; the
//! tailer follows them with durable byte offsets so a restart re-reads at
//! most the tail it had not yet persisted.

pub mod tailer;
pub mod transcript;

pub use tailer::ClaudeTailer;
