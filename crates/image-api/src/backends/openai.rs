//! OpenAI-style images backend
//!
//! `TextToImage` posts JSON to `/images/generations`, `ImageEdit` posts a
//! multipart form to `/images/edits`. Both ask for `b64_json` output.
use super::BackendConfig;
use crate::{ApiError, ApiVariant, ImageApi, ImageApiError, ImageBlob, ImageRequest, ImageSize};
use anyhow::Result;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// OpenAI images backend
pub struct OpenAiImagesBackend {
    api_url: String,
    variant: ApiVariant,
    model: Option<String>,
    sizes: Option<Vec<ImageSize>>,
    client: reqwest::Client,
}

impl OpenAiImagesBackend {
    /// Create new backend
    pub fn new(config: BackendConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            variant: config.variant,
            model: config.model,
            sizes: config.sizes,
            client: builder.build()?,
        })
    }

    fn endpoint(&self) -> String {
        match self.variant {
            ApiVariant::TextToImage => format!("{}/images/generations", self.api_url),
            ApiVariant::ImageEdit => format!("{}/images/edits", self.api_url),
        }
    }

    fn generation_body(&self, request: &ImageRequest) -> GenerationRequest {
        GenerationRequest {
            model: self.model.clone(),
            prompt: request.prompt.clone(),
            n: 1,
            size: request.size.to_string(),
            response_format: "b64_json",
        }
    }

    fn edit_form(&self, request: &ImageRequest) -> Result<Form, ImageApiError> {
        let image = request.reference_image.as_ref().ok_or_else(|| {
            ImageApiError::InvalidRequest("image edit requires a reference image".to_string())
        })?;
        let mut form = Form::new()
            .part("image", image_part(image, "frame")?)
            .text("prompt", request.prompt.clone())
            .text("n", "1")
            .text("size", request.size.to_string())
            .text("response_format", "b64_json");
        if let Some(mask) = &request.mask {
            form = form.part("mask", image_part(mask, "mask")?);
        }
        if let Some(model) = &self.model {
            form = form.text("model", model.clone());
        }
        Ok(form)
    }

    async fn send(&self, request: &ImageRequest) -> Result<reqwest::Response, ImageApiError> {
        let builder = self
            .client
            .post(self.endpoint())
            .bearer_auth(request.credentials.expose());
        let builder = match self.variant {
            ApiVariant::TextToImage => builder.json(&self.generation_body(request)),
            ApiVariant::ImageEdit => builder.multipart(self.edit_form(request)?),
        };
        Ok(builder.send().await?)
    }
}

fn image_part(blob: &ImageBlob, stem: &str) -> Result<Part, ImageApiError> {
    let mime = blob.mime_type();
    let ext = mime.strip_prefix("image/").unwrap_or("png");
    Part::bytes(blob.as_bytes().to_vec())
        .file_name(format!("{stem}.{ext}"))
        .mime_str(mime)
        .map_err(|e| ImageApiError::InvalidRequest(e.to_string()))
}

/// Maps an error response body to an [`ImageApiError`].
fn parse_error_body(status: reqwest::StatusCode, body: &str) -> ImageApiError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => ImageApiError::Api(ApiError {
            code: envelope
                .error
                .code
                .or(envelope.error.kind)
                .or_else(|| Some(status.as_u16().to_string())),
            message: envelope.error.message,
            param: envelope.error.param,
        }),
        Err(_) => ImageApiError::Api(ApiError {
            code: Some(status.as_u16().to_string()),
            message: if body.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.trim().to_string()
            },
            param: None,
        }),
    }
}

/// Extracts the first image from a success body.
fn parse_image_body(body: &str) -> Result<ImageBlob, ImageApiError> {
    let response: ImagesResponse = serde_json::from_str(body)
        .map_err(|e| ImageApiError::Transport(format!("unexpected response shape: {e}")))?;
    let encoded = response
        .data
        .into_iter()
        .find_map(|d| d.b64_json)
        .filter(|s| !s.trim().is_empty())
        .ok_or(ImageApiError::EmptyResponse)?;
    let blob = ImageBlob::from_base64(&encoded)
        .map_err(|e| ImageApiError::Transport(format!("undecodable image payload: {e}")))?;
    if blob.is_empty() {
        return Err(ImageApiError::EmptyResponse);
    }
    Ok(blob)
}

#[async_trait::async_trait]
impl ImageApi for OpenAiImagesBackend {
    fn name(&self) -> &str {
        "OpenAI Images"
    }

    fn variant(&self) -> ApiVariant {
        self.variant
    }

    fn supported_sizes(&self) -> Vec<ImageSize> {
        match &self.sizes {
            Some(sizes) => sizes.clone(),
            None => self.variant.default_sizes().to_vec(),
        }
    }

    async fn generate(&self, request: &ImageRequest) -> Result<ImageBlob, ImageApiError> {
        debug!(variant = %self.variant, size = %request.size, "sending image request");
        let response = self.send(request).await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(parse_error_body(status, &body));
        }
        parse_image_body(&body)
    }
}

#[derive(Debug, Serialize)]
struct GenerationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    prompt: String,
    n: u32,
    size: String,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    b64_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    param: Option<String>,
    code: Option<String>,
}
