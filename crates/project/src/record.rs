//! Project record: everything needed to resume a frame run.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Opaque project identifier, the only key used by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// API secret. Passed through to the image API untouched.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Credentials(<empty>)")
        } else {
            f.write_str("Credentials(<redacted>)")
        }
    }
}

/// Output dimensions requested from the image API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    /// Every size some image endpoint accepts. Each backend narrows this to
    /// what its own endpoint takes.
    pub const SUPPORTED: [ImageSize; 9] = [
        ImageSize::new(256, 256),
        ImageSize::new(512, 512),
        ImageSize::new(1024, 1024),
        ImageSize::new(1024, 576),
        ImageSize::new(576, 1024),
        ImageSize::new(1536, 1024),
        ImageSize::new(1024, 1536),
        ImageSize::new(1792, 1024),
        ImageSize::new(1024, 1792),
    ];

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::new(1024, 1024)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RecordError::InvalidSize(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width = w.trim().parse::<u32>().map_err(|_| invalid())?;
        let height = h.trim().parse::<u32>().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for ImageSize {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageSize> for String {
    fn from(size: ImageSize) -> Self {
        size.to_string()
    }
}

/// Encoded image bytes (PNG, JPEG, ...). The format travels with the bytes.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ImageBlob(Vec<u8>);

impl ImageBlob {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, RecordError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| RecordError::InvalidImage(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Accepts `data:image/png;base64,<payload>` as well as a bare payload.
    pub fn from_data_url(url: &str) -> Result<Self, RecordError> {
        match url.split_once(',') {
            Some((header, payload)) if header.starts_with("data:") => {
                if !header.ends_with(";base64") {
                    return Err(RecordError::InvalidImage(
                        "data URL is not base64 encoded".to_string(),
                    ));
                }
                Self::from_base64(payload)
            }
            _ => Self::from_base64(url),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn mime_type(&self) -> &'static str {
        match self.0.as_slice() {
            [0x89, b'P', b'N', b'G', ..] => "image/png",
            [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
            [b'G', b'I', b'F', b'8', ..] => "image/gif",
            _ => "application/octet-stream",
        }
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), self.to_base64())
    }
}

impl fmt::Debug for ImageBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageBlob({}, {} bytes)", self.mime_type(), self.0.len())
    }
}

impl Serialize for ImageBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for ImageBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        ImageBlob::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid image size '{0}', expected WIDTHxHEIGHT")]
    InvalidSize(String),
    #[error("invalid image data: {0}")]
    InvalidImage(String),
    #[error("{frames} stored frames do not match watermark {watermark}")]
    WatermarkMismatch { frames: usize, watermark: u32 },
    #[error("watermark {watermark} exceeds frame count {frame_count}")]
    WatermarkBeyondCount { watermark: u32, frame_count: u32 },
    #[error("record id {record:?} does not match store key {key}")]
    IdMismatch {
        key: ProjectId,
        record: Option<ProjectId>,
    },
}

/// Field names reported by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Credentials,
    Prompt,
    FrameCount,
    Size,
    ReferenceImage,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Name => "name",
            Self::Credentials => "credentials",
            Self::Prompt => "prompt",
            Self::FrameCount => "frame_count",
            Self::Size => "size",
            Self::ReferenceImage => "reference_image",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: Field,
    pub message: String,
}

/// All failing fields of a record, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_field_errors(.0))]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.0.iter().map(|e| e.field)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.fields().any(|f| f == field)
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Durable unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: Option<ProjectId>,
    pub name: String,
    pub credentials: Credentials,
    pub prompt_template: String,
    pub frame_count: u32,
    pub size: ImageSize,
    pub reference_image: Option<ImageBlob>,
    pub frames: Vec<ImageBlob>,
    pub last_success_frame: u32,
}

impl ProjectRecord {
    /// Returns the id, assigning a fresh one if this record was never saved.
    pub fn ensure_id(&mut self) -> &ProjectId {
        self.id.get_or_insert_with(ProjectId::new)
    }

    /// Sets the requested frame count. Frames beyond the new count are dropped
    /// so the watermark never exceeds it.
    pub fn set_frame_count(&mut self, frame_count: u32) {
        self.frame_count = frame_count;
        if self.last_success_frame > frame_count {
            self.truncate_frames(frame_count);
        }
    }

    /// Keeps the first `keep` frames and moves the watermark with them.
    pub fn truncate_frames(&mut self, keep: u32) {
        self.frames.truncate(keep as usize);
        self.last_success_frame = self.frames.len() as u32;
    }

    /// Drops all generated frames.
    pub fn reset_progress(&mut self) {
        self.frames.clear();
        self.last_success_frame = 0;
    }

    pub fn is_complete(&self) -> bool {
        self.frame_count > 0 && self.last_success_frame >= self.frame_count
    }

    pub fn check_invariants(&self) -> Result<(), RecordError> {
        if self.frames.len() != self.last_success_frame as usize {
            return Err(RecordError::WatermarkMismatch {
                frames: self.frames.len(),
                watermark: self.last_success_frame,
            });
        }
        if self.last_success_frame > self.frame_count {
            return Err(RecordError::WatermarkBeyondCount {
                watermark: self.last_success_frame,
                frame_count: self.frame_count,
            });
        }
        Ok(())
    }

    /// Checks the inputs a generation run needs.
    pub fn validate(&self, require_reference: bool) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();
        let mut fail = |field, message: &str| {
            errors.push(FieldError {
                field,
                message: message.to_string(),
            })
        };
        if self.name.trim().is_empty() {
            fail(Field::Name, "project name is required");
        }
        if self.credentials.is_blank() {
            fail(Field::Credentials, "API key is required");
        }
        if self.prompt_template.trim().is_empty() {
            fail(Field::Prompt, "prompt is required");
        }
        if self.frame_count == 0 {
            fail(Field::FrameCount, "frame count must be at least 1");
        }
        if !self.size.is_supported() {
            fail(Field::Size, "size is not accepted by any image endpoint");
        }
        if require_reference && self.reference_image.is_none() {
            fail(
                Field::ReferenceImage,
                "upload a reference image first; later frames are derived from it",
            );
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }
}

/// Listing entry returned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub name: String,
    pub frame_count: u32,
    pub last_success_frame: u32,
    /// Unix milliseconds of the last save
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_record() -> ProjectRecord {
        ProjectRecord {
            name: "walk cycle".to_string(),
            credentials: Credentials::new("sk-test"),
            prompt_template: "a cat walking".to_string(),
            frame_count: 3,
            reference_image: Some(ImageBlob::from_bytes(vec![0x89, b'P', b'N', b'G'])),
            ..Default::default()
        }
    }

    #[test]
    fn test_size_parse_and_display() {
        let size: ImageSize = "1024x576".parse().unwrap();
        assert_eq!(size, ImageSize::new(1024, 576));
        assert_eq!(size.to_string(), "1024x576");
        assert!(size.is_supported());
        assert!("1024".parse::<ImageSize>().is_err());
        assert!("0x10".parse::<ImageSize>().is_err());
        assert!(!ImageSize::new(100, 100).is_supported());
    }

    #[test]
    fn test_data_url_round_trip() {
        let blob = ImageBlob::from_bytes(vec![0x89, b'P', b'N', b'G', 1, 2, 3]);
        let url = blob.to_data_url();
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(ImageBlob::from_data_url(&url).unwrap(), blob);
        assert_eq!(ImageBlob::from_data_url(&blob.to_base64()).unwrap(), blob);
        assert!(ImageBlob::from_data_url("data:image/png,raw").is_err());
    }

    #[test]
    fn test_credentials_are_redacted() {
        let record = valid_record();
        let debug = format!("{:?}", record);
        assert!(!debug.contains("sk-test"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_ensure_id_is_stable() {
        let mut record = valid_record();
        let first = record.ensure_id().clone();
        record.name = "renamed".to_string();
        assert_eq!(record.ensure_id(), &first);
    }

    #[test]
    fn test_validate_collects_every_field() {
        let record = ProjectRecord::default();
        let errors = record.validate(true).unwrap_err();
        for field in [
            Field::Name,
            Field::Credentials,
            Field::Prompt,
            Field::FrameCount,
            Field::ReferenceImage,
        ] {
            assert!(errors.contains(field), "missing {field}");
        }
        assert!(valid_record().validate(true).is_ok());

        let mut no_ref = valid_record();
        no_ref.reference_image = None;
        assert!(no_ref.validate(false).is_ok());
        assert!(no_ref.validate(true).is_err());
    }

    #[test]
    fn test_lowering_frame_count_truncates_frames() {
        let mut record = valid_record();
        record.frame_count = 4;
        record.frames = vec![ImageBlob::from_bytes(vec![1]); 3];
        record.last_success_frame = 3;
        record.set_frame_count(2);
        assert_eq!(record.frames.len(), 2);
        assert_eq!(record.last_success_frame, 2);
        assert!(record.check_invariants().is_ok());
    }

    #[test]
    fn test_invariant_violations() {
        let mut record = valid_record();
        record.last_success_frame = 1;
        assert!(matches!(
            record.check_invariants(),
            Err(RecordError::WatermarkMismatch { .. })
        ));
        record.frames = vec![ImageBlob::from_bytes(vec![1]); 4];
        record.last_success_frame = 4;
        assert!(matches!(
            record.check_invariants(),
            Err(RecordError::WatermarkBeyondCount { .. })
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let mut record = valid_record();
        record.ensure_id();
        record.frames = vec![ImageBlob::from_bytes(vec![9, 8, 7])];
        record.last_success_frame = 1;
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"1024x1024\""));
        let back: ProjectRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
