//! Image generation API client
//!
//! One operation: send {credentials, prompt, reference image, mask, size},
//! get back an encoded image or a structured error. Transport details live
//! in the backends.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub mod backends;

pub use backends::{BackendConfig, BackendFactory, OpenAiImagesBackend};
pub use project::{Credentials, ImageBlob, ImageSize};

/// Which endpoint family a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ApiVariant {
    /// Prompt only; any reference image is ignored
    TextToImage,
    /// Reference image plus mask; the default for chained runs
    #[default]
    ImageEdit,
}

impl ApiVariant {
    pub fn requires_reference(&self) -> bool {
        matches!(self, Self::ImageEdit)
    }

    pub fn requires_mask(&self) -> bool {
        matches!(self, Self::ImageEdit)
    }

    /// Sizes the stock endpoints of this variant accept.
    pub fn default_sizes(&self) -> &'static [ImageSize] {
        match self {
            Self::TextToImage => &GENERATION_SIZES,
            Self::ImageEdit => &EDIT_SIZES,
        }
    }
}

static GENERATION_SIZES: [ImageSize; 7] = [
    ImageSize::new(256, 256),
    ImageSize::new(512, 512),
    ImageSize::new(1024, 1024),
    ImageSize::new(1536, 1024),
    ImageSize::new(1024, 1536),
    ImageSize::new(1792, 1024),
    ImageSize::new(1024, 1792),
];

static EDIT_SIZES: [ImageSize; 5] = [
    ImageSize::new(256, 256),
    ImageSize::new(512, 512),
    ImageSize::new(1024, 1024),
    ImageSize::new(1536, 1024),
    ImageSize::new(1024, 1536),
];

impl fmt::Display for ApiVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TextToImage => write!(f, "text-to-image"),
            Self::ImageEdit => write!(f, "image-edit"),
        }
    }
}

impl FromStr for ApiVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text-to-image" | "generation" | "generations" => Ok(Self::TextToImage),
            "image-edit" | "edit" | "edits" => Ok(Self::ImageEdit),
            other => Err(format!("unknown API variant '{other}'")),
        }
    }
}

/// A single frame request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub credentials: Credentials,
    pub prompt: String,
    pub reference_image: Option<ImageBlob>,
    pub mask: Option<ImageBlob>,
    pub size: ImageSize,
}

/// Rejection reported by the image service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiError {
    pub code: Option<String>,
    pub message: String,
    pub param: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{code}] ")?;
        }
        f.write_str(&self.message)?;
        if let Some(param) = &self.param {
            write!(f, " (param: {param})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ImageApiError {
    #[error("API error: {0}")]
    Api(ApiError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response contained no image data")]
    EmptyResponse,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ImageApiError {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api(e) => e.code.as_deref(),
            _ => None,
        }
    }

    pub fn param(&self) -> Option<&str> {
        match self {
            Self::Api(e) => e.param.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ImageApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Transport(format!("request timed out: {e}"))
        } else if e.is_decode() {
            Self::Transport(format!("unexpected response: {e}"))
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Image generation capability.
#[async_trait]
pub trait ImageApi: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    fn variant(&self) -> ApiVariant;

    /// Output sizes this backend's endpoint accepts.
    fn supported_sizes(&self) -> Vec<ImageSize> {
        self.variant().default_sizes().to_vec()
    }

    fn supports_size(&self, size: ImageSize) -> bool {
        self.supported_sizes().contains(&size)
    }

    /// Generate one image.
    async fn generate(&self, request: &ImageRequest) -> Result<ImageBlob, ImageApiError>;
}
