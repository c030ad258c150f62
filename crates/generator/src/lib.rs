//! Chained frame generation with resumable progress.
//!
//! [`SessionController`] owns the editable project and its autosave,
//! [`GenerationEngine`] walks the frames, [`chain`] turns the previous frame
//! into the next request.

pub mod chain;
pub mod controller;
pub mod engine;
pub mod events;
pub mod session;

pub use chain::{build_request, frame_prompt, BuildError};
pub use controller::{AutosavePolicy, ControllerError, SessionController};
pub use engine::{EngineConfig, GenerationEngine, GenerationError};
pub use events::{FailureKind, FrameEvent, FrameFailure, RunOutcome};
pub use session::{Session, SessionState};
