use std::path::{Path, PathBuf};

use crate::config::home_dir;

const WORKSPACE_STORAGE: &str = "workspaceStorage";
const GLOBAL_STORAGE: &str = "globalStorage";
const DB_NAME: &str = "state.vscdb";

/// Locate Cursor's `User` directory.
///
/// An explicit override wins; otherwise the per-platform appdata locations
/// are probed in order and the first existing one is used.
pub fn resolve_user_dir(override_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = override_dir {
        let user = dir.join("User");
        return user.exists().then_some(user);
    }
    candidate_user_dirs().into_iter().find(|p| p.exists())
}

fn candidate_user_dirs() -> Vec<PathBuf> {
    let home = home_dir();
    let mut candidates = vec![
        // macOS
        home.join("Library/Application Support/Cursor/User"),
        // Linux
        home.join(".config/Cursor/User"),
    ];
    // Windows
    if let Ok(appdata) = std::env::var("APPDATA") {
        candidates.push(PathBuf::from(appdata).join("Cursor").join("User"));
    }
    candidates
}

pub fn global_db_path(user_dir: &Path) -> PathBuf {
    user_dir.join(GLOBAL_STORAGE).join(DB_NAME)
}

/// Find the workspace-storage database for a workspace path.
///
/// Each `workspaceStorage/<hash>/` directory carries a `workspace.json`
/// naming its folder as a `file://` URI; the first match wins.
pub fn find_workspace_db(user_dir: &Path, workspace_path: &str) -> Option<PathBuf> {
    let storage = user_dir.join(WORKSPACE_STORAGE);
    let entries = std::fs::read_dir(&storage).ok()?;

    let wanted = workspace_path.trim_end_matches('/');
    for entry in entries.filter_map(|e| e.ok()) {
        let meta_path = entry.path().join("workspace.json");
        let Ok(raw) = std::fs::read_to_string(&meta_path) else {
            continue;
        };
        let Ok(meta) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };
        let Some(folder) = meta["folder"].as_str() else {
            continue;
        };
        if folder_matches(folder, wanted) {
            let db = entry.path().join(DB_NAME);
            if db.exists() {
                return Some(db);
            }
        }
    }
    None
}

fn folder_matches(folder_uri: &str, workspace_path: &str) -> bool {
    let path = folder_uri
        .strip_prefix("file://")
        .unwrap_or(folder_uri)
        .trim_end_matches('/');
    path == workspace_path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_requires_user_subdir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_user_dir(Some(dir.path())).is_none());

        std::fs::create_dir_all(dir.path().join("User")).unwrap();
        let resolved = resolve_user_dir(Some(dir.path())).unwrap();
        assert!(resolved.ends_with("User"));
    }

    #[test]
    fn find_workspace_db_matches_folder_uri() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("User");
        let ws_dir = user.join("workspaceStorage").join("abc123");
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(
            ws_dir.join("workspace.json"),
            r#"{"folder": "file:///home/dev/api"}"#,
        )
        .unwrap();
        std::fs::write(ws_dir.join("state.vscdb"), b"").unwrap();

        let found = find_workspace_db(&user, "/home/dev/api").unwrap();
        assert!(found.ends_with("abc123/state.vscdb"));
        assert!(find_workspace_db(&user, "/home/dev/other").is_none());
    }

    #[test]
    fn folder_match_ignores_trailing_slash() {
        assert!(folder_matches("file:///home/dev/api/", "/home/dev/api"));
        assert!(folder_matches("/home/dev/api", "/home/dev/api"));
        assert!(!folder_matches("file:///home/dev/api2", "/home/dev/api"));
    }

    #[test]
    fn global_db_path_is_under_global_storage() {
        let p = global_db_path(Path::new("/x/User"));
        assert_eq!(p, PathBuf::from("/x/User/globalStorage/state.vscdb"));
    }
}
