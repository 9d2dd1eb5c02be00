use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::PipelineError;

/// Returns the user's home directory as a `PathBuf`.
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Runtime configuration, resolved once at startup.
///
/// Precedence per key: environment variable, then `~/.blueplane/config`
/// (`KEY=value` lines), then the built-in default.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub redis_host: String,
    pub redis_port: u16,
    pub log_level: String,
    pub ingress_port: u16,
    pub cursor_poll_secs: u64,
    pub claude_poll_secs: u64,
    pub cursor_data_dir: Option<PathBuf>,
    pub claude_projects_dir: PathBuf,
    pub workspace_root: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self, PipelineError> {
        let file = load_config_file();
        let get = |env_key: &str, file_key: &str| -> Option<String> {
            std::env::var(env_key)
                .ok()
                .or_else(|| file.get(file_key).cloned())
        };

        let data_dir = get("BLUEPLANE_DATA_DIR", "DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".blueplane"));

        let redis_port = parse_or("REDIS_PORT", get("REDIS_PORT", "REDIS_PORT"), 6379u16)?;
        let ingress_port = parse_or("BLUEPLANE_PORT", get("BLUEPLANE_PORT", "PORT"), 7845u16)?;
        let cursor_poll_secs = parse_or(
            "CURSOR_POLL_SECS",
            get("CURSOR_POLL_SECS", "CURSOR_POLL_SECS"),
            30u64,
        )?;
        let claude_poll_secs = parse_or(
            "CLAUDE_POLL_SECS",
            get("CLAUDE_POLL_SECS", "CLAUDE_POLL_SECS"),
            2u64,
        )?;

        Ok(Config {
            data_dir,
            redis_host: get("REDIS_HOST", "REDIS_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            redis_port,
            log_level: get("LOG_LEVEL", "LOG_LEVEL").unwrap_or_else(|| "info".into()),
            ingress_port,
            cursor_poll_secs,
            claude_poll_secs,
            cursor_data_dir: get("CURSOR_DATA_DIR", "CURSOR_DATA_DIR").map(PathBuf::from),
            claude_projects_dir: get("CLAUDE_PROJECTS_DIR", "CLAUDE_PROJECTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| home_dir().join(".claude").join("projects")),
            workspace_root: get("WORKSPACE_ROOT", "WORKSPACE_ROOT").map(PathBuf::from),
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("telemetry.db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("processing.log")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("lock")
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &str,
    raw: Option<String>,
    default: T,
) -> Result<T, PipelineError> {
    match raw {
        None => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| PipelineError::Config(format!("{key} is not a valid number: '{s}'"))),
    }
}

fn load_config_file() -> HashMap<String, String> {
    let path = home_dir().join(".blueplane").join("config");
    let Ok(content) = std::fs::read_to_string(&path) else {
        return HashMap::new();
    };
    content
        .lines()
        .filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty())
        .filter_map(|l| {
            let (k, v) = l.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_without_env() {
        let cfg = Config::load().expect("default config");
        assert_eq!(cfg.redis_port, 6379);
        assert_eq!(cfg.claude_poll_secs, 2);
        assert!(cfg.store_path().ends_with("telemetry.db"));
        assert!(cfg.log_path().ends_with("logs/processing.log"));
    }

    #[test]
    fn redis_url_is_well_formed() {
        let cfg = Config::load().expect("default config");
        assert!(cfg.redis_url().starts_with("redis://"));
        assert!(cfg.redis_url().ends_with("/"));
    }

    #[test]
    fn parse_or_rejects_garbage() {
        let err = parse_or::<u16>("REDIS_PORT", Some("not-a-port".into()), 1).unwrap_err();
        assert!(err.to_string().contains("REDIS_PORT"));
    }

    #[test]
    fn parse_or_uses_default_when_absent() {
        assert_eq!(parse_or::<u64>("X", None, 42).unwrap(), 42);
    }
}
