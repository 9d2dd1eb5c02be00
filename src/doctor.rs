use std::path::Path;

use crate::config::Config;
use crate::cursor::platform;
use crate::queue::RedisQueue;
use crate::store::Store;

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";

#[derive(PartialEq)]
enum Status {
    Ok,
    Failed,
    Skipped,
}

struct Check {
    label: &'static str,
    status: Status,
    detail: String,
}

impl Check {
    fn ok(label: &'static str, detail: impl Into<String>) -> Self {
        Check {
            label,
            status: Status::Ok,
            detail: detail.into(),
        }
    }

    fn failed(label: &'static str, detail: impl Into<String>) -> Self {
        Check {
            label,
            status: Status::Failed,
            detail: detail.into(),
        }
    }

    fn skipped(label: &'static str, detail: impl Into<String>) -> Self {
        Check {
            label,
            status: Status::Skipped,
            detail: detail.into(),
        }
    }
}

/// `blueplane doctor`: probe everything the pipeline needs and print a
/// one-line verdict per dependency. Skipped rows are capture paths that are
/// simply not installed on this machine, not problems.
pub async fn run(config: &Config) {
    let report = vec![
        check_data_dir(config),
        check_store(config),
        check_queue(config).await,
        check_cursor(config),
        check_claude(config),
    ];

    println!("\nblueplane {} doctor\n", env!("CARGO_PKG_VERSION"));
    for check in &report {
        let verdict = match check.status {
            Status::Ok => format!("{GREEN}ok{RESET}  "),
            Status::Failed => format!("{RED}FAIL{RESET}"),
            Status::Skipped => format!("{DIM}skip{RESET}"),
        };
        println!("  {:<18} {verdict}  {DIM}{}{RESET}", check.label, check.detail);
    }

    let failed = report.iter().filter(|c| c.status == Status::Failed).count();
    let skipped = report.iter().filter(|c| c.status == Status::Skipped).count();
    let ok = report.len() - failed - skipped;
    println!();
    match failed {
        0 => println!("  {ok} ok, {skipped} skipped. Ready to capture.\n"),
        n => println!("  {ok} ok, {RED}{n} failed{RESET}, {skipped} skipped.\n"),
    }
}

fn check_data_dir(config: &Config) -> Check {
    let dir = &config.data_dir;
    if dir.exists() || std::fs::create_dir_all(dir).is_ok() {
        let lock_hint = if config.lock_path().exists() {
            " (lock present, a daemon may be running)"
        } else {
            ""
        };
        Check::ok("data dir", format!("{}{lock_hint}", dir.display()))
    } else {
        Check::failed("data dir", format!("{} is not writable", dir.display()))
    }
}

fn check_store(config: &Config) -> Check {
    match Store::open(&config.store_path()) {
        Ok(store) => match store.trace_count(crate::models::Platform::Cursor) {
            Ok(cursor_rows) => {
                let claude_rows = store
                    .trace_count(crate::models::Platform::ClaudeCode)
                    .unwrap_or(0);
                Check::ok(
                    "unified store",
                    format!("{cursor_rows} cursor / {claude_rows} claude trace rows"),
                )
            }
            Err(e) => Check::failed("unified store", format!("schema unreadable: {e}")),
        },
        Err(e) => Check::failed("unified store", e.to_string()),
    }
}

async fn check_queue(config: &Config) -> Check {
    match RedisQueue::connect(&config.redis_url()).await {
        Ok(_) => Check::ok("redis", config.redis_url()),
        Err(e) => Check::failed("redis", e.to_string()),
    }
}

fn check_cursor(config: &Config) -> Check {
    match platform::resolve_user_dir(config.cursor_data_dir.as_deref()) {
        Some(dir) => Check::ok("cursor appdata", dir.display().to_string()),
        None => Check::skipped("cursor appdata", "not found, cursor capture idle"),
    }
}

fn check_claude(config: &Config) -> Check {
    let dir = &config.claude_projects_dir;
    if dir.exists() {
        let transcripts = count_jsonl(dir);
        Check::ok(
            "claude projects",
            format!("{} ({transcripts} transcripts)", dir.display()),
        )
    } else {
        Check::skipped("claude projects", "not found, claude capture idle")
    }
}

fn count_jsonl(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| {
            let path = e.path();
            if path.is_dir() {
                count_jsonl(&path)
            } else if path.extension().map(|x| x == "jsonl").unwrap_or(false) {
                1
            } else {
                0
            }
        })
        .sum()
}
