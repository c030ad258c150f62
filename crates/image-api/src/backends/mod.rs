//! Image API backends
//!
//! Configuration shared by backends plus a factory that turns a config into
//! a ready client.
pub mod openai;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use openai::OpenAiImagesBackend;

use crate::{ApiVariant, ImageApi, ImageSize};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1";

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Endpoint family
    pub variant: ApiVariant,

    /// API base URL
    pub api_url: String,

    /// Model name sent with each request, if the service wants one
    pub model: Option<String>,

    /// Timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Sizes a compatible endpoint accepts, when they differ from the
    /// variant's stock list (e.g. `1024x576`)
    pub sizes: Option<Vec<ImageSize>>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            variant: ApiVariant::default(),
            api_url: DEFAULT_API_URL.to_string(),
            model: None,
            timeout_secs: Some(300),
            sizes: None,
        }
    }
}

impl BackendConfig {
    pub fn new(variant: ApiVariant) -> Self {
        Self {
            variant,
            ..Default::default()
        }
    }

    /// With API endpoint
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// With timeout
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_sizes(mut self, sizes: impl IntoIterator<Item = ImageSize>) -> Self {
        self.sizes = Some(sizes.into_iter().collect());
        self
    }

    /// Save configuration to JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from JSON
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

/// Backend factory for creating backend instances
pub struct BackendFactory;

impl BackendFactory {
    /// Create backend from config
    pub fn create(config: BackendConfig) -> Result<Arc<dyn ImageApi>> {
        Ok(Arc::new(OpenAiImagesBackend::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_config() {
        let config = BackendConfig::new(ApiVariant::TextToImage)
            .with_api_url("http://localhost:8080/v1")
            .with_model("gpt-image-1")
            .with_timeout(30);

        assert_eq!(config.variant, ApiVariant::TextToImage);
        assert_eq!(config.api_url, "http://localhost:8080/v1");
        assert_eq!(config.model.as_deref(), Some("gpt-image-1"));
        assert_eq!(config.timeout_secs, Some(30));
    }

    #[test]
    fn test_backend_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.json");
        let config = BackendConfig::new(ApiVariant::ImageEdit).with_model("dall-e-2");
        config.save(&path).unwrap();
        assert_eq!(BackendConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: BackendConfig = serde_json::from_str(r#"{"variant":"text-to-image"}"#).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.timeout_secs, Some(300));
    }

    #[test]
    fn test_factory_creates_variant() {
        let api = BackendFactory::create(BackendConfig::new(ApiVariant::ImageEdit)).unwrap();
        assert_eq!(api.variant(), ApiVariant::ImageEdit);
        assert!(api.supports_size(ImageSize::new(1024, 1024)));
        assert!(!api.supports_size(ImageSize::new(1024, 576)));
    }

    #[test]
    fn test_configured_sizes_replace_stock_list() {
        let config: BackendConfig = serde_json::from_str(
            r#"{"variant":"image-edit","api_url":"http://localhost:8188/v1","sizes":["1024x576","576x1024"]}"#,
        )
        .unwrap();
        let api = BackendFactory::create(config).unwrap();
        assert!(api.supports_size(ImageSize::new(1024, 576)));
        assert!(!api.supports_size(ImageSize::new(1024, 1024)));
    }
}
