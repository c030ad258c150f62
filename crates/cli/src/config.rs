use anyhow::{Context, Result};
use generator::{AutosavePolicy, EngineConfig};
use image_api::BackendConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings read from `config.json` in the application data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Project database; defaults to `<data dir>/projects.db`
    pub db_path: Option<PathBuf>,
    pub backend: BackendConfig,
    /// Per-frame limit enforced by the engine
    pub frame_timeout_secs: Option<u64>,
    /// Minimum spacing of edit-triggered saves
    pub autosave_debounce_ms: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            backend: BackendConfig::default(),
            frame_timeout_secs: Some(600),
            autosave_debounce_ms: Some(500),
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        project::app_data_dir().join("config.json")
    }

    /// Loads `path`, or the default location. A missing file yields defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| project::app_data_dir().join("projects.db"))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            frame_timeout: self.frame_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn autosave_policy(&self) -> AutosavePolicy {
        match self.autosave_debounce_ms {
            Some(ms) if ms > 0 => AutosavePolicy::debounced(Duration::from_millis(ms)),
            _ => AutosavePolicy::immediate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_api::ApiVariant;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(Some(&dir.path().join("none.json"))).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.db_path().ends_with("projects.db"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg/config.json");
        let config = AppConfig {
            db_path: Some(dir.path().join("p.db")),
            backend: BackendConfig::new(ApiVariant::TextToImage).with_timeout(60),
            frame_timeout_secs: None,
            autosave_debounce_ms: Some(0),
        };
        config.save(&path).unwrap();
        let loaded = AppConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.engine_config().frame_timeout.is_none());
        assert!(loaded.autosave_policy().min_interval.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"backend":{"variant":"text-to-image"}}"#).unwrap();
        let config = AppConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.backend.variant, ApiVariant::TextToImage);
        assert_eq!(config.frame_timeout_secs, Some(600));
        assert_eq!(
            config.autosave_policy().min_interval,
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(AppConfig::load_or_default(Some(&path)).is_err());
    }
}
