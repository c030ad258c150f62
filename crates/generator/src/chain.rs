//! Frame chain builder.
//!
//! Frame 1 is derived from the uploaded reference image, every later frame
//! from the frame generated just before it.

use image::{DynamicImage, ImageFormat, ImageReader, Rgba, RgbaImage};
use image_api::{ApiVariant, ImageRequest};
use project::{ImageBlob, ProjectRecord};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("frame {index} is outside 1..={frame_count}")]
    InvalidFrameIndex { index: u32, frame_count: u32 },
    #[error("frame {0} is missing; cannot chain from it")]
    MissingPreviousFrame(u32),
    #[error("no reference image uploaded")]
    MissingReference,
    #[error("{source_name} cannot be decoded: {message}")]
    Undecodable { source_name: String, message: String },
    #[error("failed to encode mask: {0}")]
    MaskEncode(String),
}

/// Prompt sent for one frame.
pub fn frame_prompt(template: &str, index: u32, frame_count: u32) -> String {
    format!("{} (frame {} of {})", template.trim(), index, frame_count)
}

/// Fully decodes `blob` and returns its pixel dimensions.
pub fn decode_dimensions(blob: &ImageBlob) -> Result<(u32, u32), image::ImageError> {
    let image = ImageReader::new(Cursor::new(blob.as_bytes()))
        .with_guessed_format()?
        .decode()?;
    Ok((image.width(), image.height()))
}

/// Opaque PNG mask covering the whole frame.
pub fn opaque_mask(width: u32, height: u32) -> Result<ImageBlob, BuildError> {
    let mask = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(mask)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| BuildError::MaskEncode(e.to_string()))?;
    Ok(ImageBlob::from_bytes(bytes))
}

/// Builds the request for `frame_index` (1-based).
///
/// `previous_frame` must be the frame generated immediately before
/// `frame_index` whenever `frame_index > 1`; it is never substituted with the
/// original upload.
pub fn build_request(
    record: &ProjectRecord,
    frame_index: u32,
    previous_frame: Option<&ImageBlob>,
    variant: ApiVariant,
) -> Result<ImageRequest, BuildError> {
    if frame_index == 0 || frame_index > record.frame_count {
        return Err(BuildError::InvalidFrameIndex {
            index: frame_index,
            frame_count: record.frame_count,
        });
    }

    let (reference, source_name) = if frame_index == 1 {
        (record.reference_image.as_ref(), "reference image".to_string())
    } else {
        let previous = previous_frame.ok_or(BuildError::MissingPreviousFrame(frame_index - 1))?;
        (Some(previous), format!("frame {}", frame_index - 1))
    };

    if reference.is_none() && variant.requires_reference() {
        return Err(BuildError::MissingReference);
    }

    let mut mask = None;
    if let Some(reference) = reference {
        let (width, height) =
            decode_dimensions(reference).map_err(|e| BuildError::Undecodable {
                source_name,
                message: e.to_string(),
            })?;
        if variant.requires_mask() {
            mask = Some(opaque_mask(width, height)?);
        }
    }

    Ok(ImageRequest {
        credentials: record.credentials.clone(),
        prompt: frame_prompt(&record.prompt_template, frame_index, record.frame_count),
        reference_image: reference.cloned(),
        mask,
        size: record.size,
    })
}

#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32, shade: u8) -> ImageBlob {
    let img = RgbaImage::from_pixel(width, height, Rgba([shade, shade, shade, 255]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    ImageBlob::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use project::{Credentials, ImageSize};

    fn record() -> ProjectRecord {
        ProjectRecord {
            name: "chain".to_string(),
            credentials: Credentials::new("sk-1"),
            prompt_template: "  a paper boat drifting ".to_string(),
            frame_count: 3,
            size: ImageSize::new(1024, 576),
            reference_image: Some(test_png(16, 9, 10)),
            ..Default::default()
        }
    }

    #[test]
    fn test_frame_prompt_is_deterministic() {
        assert_eq!(
            frame_prompt(" boat ", 2, 5),
            "boat (frame 2 of 5)".to_string()
        );
        assert_eq!(frame_prompt("boat", 2, 5), frame_prompt("boat", 2, 5));
    }

    #[test]
    fn test_first_frame_uses_reference() {
        let record = record();
        let req = build_request(&record, 1, None, ApiVariant::ImageEdit).unwrap();
        assert_eq!(req.reference_image, record.reference_image);
        assert_eq!(req.prompt, "a paper boat drifting (frame 1 of 3)");
        assert_eq!(req.size, ImageSize::new(1024, 576));
        let mask = req.mask.unwrap();
        assert_eq!(decode_dimensions(&mask).unwrap(), (16, 9));
    }

    #[test]
    fn test_later_frame_chains_previous() {
        let record = record();
        let previous = test_png(32, 20, 200);
        let req = build_request(&record, 2, Some(&previous), ApiVariant::ImageEdit).unwrap();
        assert_eq!(req.reference_image.as_ref(), Some(&previous));
        // mask follows the actual reference, not the configured size
        assert_eq!(decode_dimensions(&req.mask.unwrap()).unwrap(), (32, 20));
    }

    #[test]
    fn test_malformed_previous_frame_is_an_error() {
        let record = record();
        let broken = ImageBlob::from_bytes(vec![0x89, b'P', b'N', b'G', 0, 0]);
        let err = build_request(&record, 3, Some(&broken), ApiVariant::ImageEdit).unwrap_err();
        match err {
            BuildError::Undecodable { source_name, .. } => assert_eq!(source_name, "frame 2"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            build_request(&record, 2, None, ApiVariant::ImageEdit).unwrap_err(),
            BuildError::MissingPreviousFrame(1)
        );
    }

    #[test]
    fn test_text_to_image_without_reference() {
        let mut record = record();
        record.reference_image = None;
        let req = build_request(&record, 1, None, ApiVariant::TextToImage).unwrap();
        assert!(req.reference_image.is_none());
        assert!(req.mask.is_none());
        assert_eq!(
            build_request(&record, 1, None, ApiVariant::ImageEdit).unwrap_err(),
            BuildError::MissingReference
        );
    }

    #[test]
    fn test_frame_index_bounds() {
        let record = record();
        assert!(matches!(
            build_request(&record, 0, None, ApiVariant::TextToImage),
            Err(BuildError::InvalidFrameIndex { .. })
        ));
        assert!(matches!(
            build_request(&record, 4, Some(&test_png(1, 1, 0)), ApiVariant::TextToImage),
            Err(BuildError::InvalidFrameIndex { .. })
        ));
    }
}
