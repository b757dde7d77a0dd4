// Settings: where the Drive lives, where workspaces go, which editor to run
// and how uploads behave. Loaded from a JSON file, then overridden from the
// environment the same way the HTTP client picks up its gateway URL.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};

const CONFIG_ENV: &str = "SWIMMY_CONFIG";
const APP_DIR: &str = "swimmy-manager";
const CONFIG_FILE: &str = "settings.json";

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendSettings,
    pub workspace: WorkspaceSettings,
    pub editor: EditorSettings,
    pub upload: UploadSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A Drive folder kept in sync on local disk by the desktop client.
    #[default]
    Mounted,
    /// JSON gateway in front of the storage service.
    Http,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub drive_root: PathBuf,
    pub api_url: String,
    pub api_token: Option<String>,
    pub page_size: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            kind: BackendKind::Mounted,
            drive_root: PathBuf::from("~/Google Drive"),
            api_url: "http://localhost:3001".into(),
            api_token: None,
            page_size: 50,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WorkspaceSettings {
    pub base_path: PathBuf,
    /// Path components skipped when scanning scratch for candidates.
    pub exclude: Vec<String>,
    /// chrono format string for the per-batch date folder.
    pub date_format: String,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        WorkspaceSettings {
            base_path: PathBuf::from("~/swimmy-workspaces"),
            exclude: vec![
                ".git".into(),
                "__pycache__".into(),
                ".vscode".into(),
                ".DS_Store".into(),
                "Thumbs.db".into(),
            ],
            date_format: "%Y-%m-%d".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EditorSettings {
    pub program: String,
    /// Extra arguments placed before the workspace roots. The editor must
    /// block until its window closes, hence `--wait` for VS Code.
    pub args: Vec<String>,
    /// Hand the editor a generated workspace file instead of bare folders.
    pub workspace_file: bool,
    pub template: Option<PathBuf>,
}

impl Default for EditorSettings {
    fn default() -> Self {
        EditorSettings {
            program: "code".into(),
            args: vec!["--new-window".into(), "--wait".into()],
            workspace_file: true,
            template: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UploadSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        UploadSettings {
            concurrency: 2,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl Settings {
    /// Load settings from `SWIMMY_CONFIG`, or the per-user config file, or
    /// fall back to defaults; then apply environment overrides and resolve
    /// every path.
    pub fn load() -> Result<Self> {
        let mut settings = match Self::config_path() {
            Some(path) if path.is_file() => Self::from_file(&path)?,
            _ => Settings::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.resolve_paths();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).at(path)?;
        let settings = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(p));
        }
        dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Overrides from the environment. Takes a lookup function so tests do
    /// not have to mutate the process environment.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SWIMMY_DRIVE_ROOT") {
            self.backend.drive_root = PathBuf::from(v);
        }
        if let Some(v) = var("SWIMMY_WORKSPACE_BASE") {
            self.workspace.base_path = PathBuf::from(v);
        }
        if let Some(v) = var("SWIMMY_API_URL") {
            self.backend.api_url = v;
            self.backend.kind = BackendKind::Http;
        }
        if let Some(v) = var("SWIMMY_API_TOKEN") {
            self.backend.api_token = Some(v);
        }
        if let Some(v) = var("SWIMMY_EDITOR") {
            self.editor.program = v;
        }
    }

    fn resolve_paths(&mut self) {
        self.backend.drive_root = resolve_path(&self.backend.drive_root);
        self.workspace.base_path = resolve_path(&self.workspace.base_path);
        if let Some(t) = &self.editor.template {
            self.editor.template = Some(resolve_path(t));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload.concurrency == 0 {
            return Err(Error::Config("upload.concurrency must be at least 1".into()));
        }
        if self.upload.max_attempts == 0 {
            return Err(Error::Config("upload.max_attempts must be at least 1".into()));
        }
        if self.backend.page_size == 0 {
            return Err(Error::Config("backend.page_size must be at least 1".into()));
        }
        if self.editor.program.trim().is_empty() {
            return Err(Error::Config("editor.program is empty".into()));
        }
        // A format with no specifiers would put every batch in one folder.
        if !self.workspace.date_format.contains('%') {
            return Err(Error::Config(format!(
                "workspace.date_format '{}' has no date fields",
                self.workspace.date_format
            )));
        }
        Ok(())
    }
}

/// Resolve a configured path: `~` expands to the home directory, absolute
/// paths are kept, relative paths are taken from the executable's directory.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    exe_dir.join(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_fills_in_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{ "upload": { "concurrency": 4 } }"#).unwrap();
        assert_eq!(s.upload.concurrency, 4);
        assert_eq!(s.upload.max_attempts, 3);
        assert_eq!(s.backend.kind, BackendKind::Mounted);
        assert_eq!(s.workspace.date_format, "%Y-%m-%d");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn api_url_override_switches_backend() {
        let env: HashMap<&str, &str> = [
            ("SWIMMY_API_URL", "https://gw.example"),
            ("SWIMMY_API_TOKEN", "t0k"),
            ("SWIMMY_EDITOR", "codium"),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.backend.kind, BackendKind::Http);
        assert_eq!(s.backend.api_url, "https://gw.example");
        assert_eq!(s.backend.api_token.as_deref(), Some("t0k"));
        assert_eq!(s.editor.program, "codium");
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut s = Settings::default();
        s.upload.concurrency = 0;
        assert!(matches!(s.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn resolves_home_and_absolute_paths() {
        let abs = if cfg!(windows) { "C:\\data" } else { "/data" };
        assert_eq!(resolve_path(Path::new(abs)), PathBuf::from(abs));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolve_path(Path::new("~/ws")), home.join("ws"));
        }
        assert!(resolve_path(Path::new("relative/dir")).is_absolute());
    }

    #[test]
    fn reads_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "backend": { "kind": "http", "page_size": 10 } }"#).unwrap();
        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.backend.kind, BackendKind::Http);
        assert_eq!(s.backend.page_size, 10);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Settings::from_file(&path), Err(Error::Config(_))));
    }
}
