use image_api::ImageApiError;
use project::{ImageBlob, ProjectId};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chain::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Reference or previous frame could not be turned into a request
    Build,
    /// The service rejected the request
    Api,
    /// Network failure, timeout or unexpected response
    Transport,
    /// Success response without a usable image
    EmptyResponse,
    /// The frame was generated but could not be saved
    Persist,
}

/// Why a run stopped at `frame`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFailure {
    pub frame: u32,
    pub kind: FailureKind,
    pub code: Option<String>,
    pub message: String,
    pub param: Option<String>,
}

impl FrameFailure {
    pub fn from_build(frame: u32, err: &BuildError) -> Self {
        Self {
            frame,
            kind: FailureKind::Build,
            code: None,
            message: err.to_string(),
            param: None,
        }
    }

    pub fn from_api(frame: u32, err: &ImageApiError) -> Self {
        match err {
            ImageApiError::Api(api) => Self {
                frame,
                kind: FailureKind::Api,
                code: api.code.clone(),
                message: api.message.clone(),
                param: api.param.clone(),
            },
            ImageApiError::EmptyResponse => Self::empty_response(frame, err.to_string()),
            ImageApiError::Transport(_)
            | ImageApiError::Timeout(_)
            | ImageApiError::InvalidRequest(_) => Self {
                frame,
                kind: FailureKind::Transport,
                code: None,
                message: err.to_string(),
                param: None,
            },
        }
    }

    pub fn empty_response(frame: u32, message: impl Into<String>) -> Self {
        Self {
            frame,
            kind: FailureKind::EmptyResponse,
            code: None,
            message: message.into(),
            param: None,
        }
    }

    pub fn persist(frame: u32, err: &anyhow::Error) -> Self {
        Self {
            frame,
            kind: FailureKind::Persist,
            code: None,
            message: format!("frame generated but not saved: {err:#}"),
            param: None,
        }
    }
}

impl fmt::Display for FrameFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {} failed", self.frame)?;
        if let Some(code) = &self.code {
            write!(f, " [{code}]")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(param) = &self.param {
            write!(f, " (param: {param})")?;
        }
        Ok(())
    }
}

/// How a call to `generate` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every frame up to `frames` is generated and saved
    Completed { frames: u32 },
    Failed(FrameFailure),
    /// Stopped before `next_frame` by the cancel token or a session switch
    Cancelled { next_frame: u32 },
    /// Another run owns the session; nothing was done
    AlreadyRunning,
}

impl RunOutcome {
    pub fn failure(&self) -> Option<&FrameFailure> {
        match self {
            Self::Failed(f) => Some(f),
            _ => None,
        }
    }
}

/// Progress notifications for the UI.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    RunStarted {
        project: Option<ProjectId>,
        start_frame: u32,
        frame_count: u32,
    },
    FrameStarted {
        frame: u32,
    },
    FrameCompleted {
        project: ProjectId,
        frame: u32,
        image: ImageBlob,
    },
    FrameFailed(FrameFailure),
    RunFinished(RunOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_api::ApiError;
    use std::time::Duration;

    #[test]
    fn test_failure_from_api_error_keeps_details() {
        let err = ImageApiError::Api(ApiError {
            code: Some("invalid_size".to_string()),
            message: "size not supported".to_string(),
            param: Some("size".to_string()),
        });
        let failure = FrameFailure::from_api(4, &err);
        assert_eq!(failure.kind, FailureKind::Api);
        assert_eq!(
            failure.to_string(),
            "frame 4 failed [invalid_size]: size not supported (param: size)"
        );
    }

    #[test]
    fn test_transport_errors_are_generic() {
        let failure = FrameFailure::from_api(1, &ImageApiError::Timeout(Duration::from_secs(5)));
        assert_eq!(failure.kind, FailureKind::Transport);
        assert!(failure.code.is_none());
        let empty = FrameFailure::from_api(2, &ImageApiError::EmptyResponse);
        assert_eq!(empty.kind, FailureKind::EmptyResponse);
    }
}
