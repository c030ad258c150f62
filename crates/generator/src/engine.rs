//! Generation engine: walks frames `start..=frame_count` one at a time,
//! chaining each output into the next request and saving after every frame.

use crossbeam_channel::{unbounded, Receiver, Sender};
use image_api::{ImageApi, ImageApiError, ImageBlob};
use project::{Field, FieldError, ProjectRecord, ProjectStore, ValidationErrors};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chain::{build_request, decode_dimensions};
use crate::events::{FrameEvent, FrameFailure, RunOutcome};
use crate::session::Session;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid project: {0}")]
    Validation(#[from] ValidationErrors),
    #[error("cannot start at frame {start}: frames 1..{start} are not all generated (last successful frame is {last_success})")]
    InvalidStart { start: u32, last_success: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Upper bound on a single API call, on top of the client's own timeout
    pub frame_timeout: Option<Duration>,
}

pub struct GenerationEngine {
    api: Arc<dyn ImageApi>,
    store: Arc<dyn ProjectStore>,
    config: EngineConfig,
    /// Set once a consumer subscribes; events are dropped until then.
    tx_events: Option<Sender<FrameEvent>>,
}

/// Result of one frame attempt inside the loop.
enum Step {
    Saved,
    Stop(RunOutcome),
}

impl GenerationEngine {
    pub fn new(api: Arc<dyn ImageApi>, store: Arc<dyn ProjectStore>, config: EngineConfig) -> Self {
        Self {
            api,
            store,
            config,
            tx_events: None,
        }
    }

    /// Subscribes to progress events from now on. Subscribing again
    /// disconnects the previous receiver. Once the receiver is dropped,
    /// events are discarded instead of queued.
    pub fn events(&mut self) -> Receiver<FrameEvent> {
        let (tx, rx) = unbounded();
        self.tx_events = Some(tx);
        rx
    }

    pub fn api(&self) -> &Arc<dyn ImageApi> {
        &self.api
    }

    /// Record validation plus the sizes this engine's backend accepts.
    fn validate(&self, record: &ProjectRecord) -> Result<(), ValidationErrors> {
        let mut errors = match record.validate(self.api.variant().requires_reference()) {
            Ok(()) => Vec::new(),
            Err(ValidationErrors(errors)) => errors,
        };
        if !errors.iter().any(|e| e.field == Field::Size) && !self.api.supports_size(record.size)
        {
            errors.push(FieldError {
                field: Field::Size,
                message: format!(
                    "{} is not accepted by {} ({})",
                    record.size,
                    self.api.name(),
                    self.api.variant()
                ),
            });
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    fn emit(&self, event: FrameEvent) {
        if let Some(tx) = &self.tx_events {
            let _ = tx.send(event);
        }
    }

    /// Continues after the last saved frame. A finished project makes no API
    /// calls.
    pub async fn resume(&self, session: &Session) -> Result<RunOutcome, GenerationError> {
        let start = session.lock().record.last_success_frame + 1;
        self.generate(session, start).await
    }

    /// Generates frames `start_frame..=frame_count` in order, stopping at the
    /// first failure. `start_frame == 1` discards the session's frames.
    pub async fn generate(
        &self,
        session: &Session,
        start_frame: u32,
    ) -> Result<RunOutcome, GenerationError> {
        if session.is_running() {
            debug!("generation already in progress; ignoring request");
            return Ok(RunOutcome::AlreadyRunning);
        }

        let variant = self.api.variant();
        let (frame_count, epoch) = {
            let state = session.lock();
            self.validate(&state.record)?;
            let last_success = state.record.last_success_frame;
            if start_frame == 0 || start_frame > last_success + 1 {
                return Err(GenerationError::InvalidStart {
                    start: start_frame,
                    last_success,
                });
            }
            (state.record.frame_count, state.epoch())
        };

        let Some(_guard) = session.try_begin_run() else {
            debug!("generation already in progress; ignoring request");
            return Ok(RunOutcome::AlreadyRunning);
        };

        let project = {
            let mut state = session.lock();
            if start_frame == 1 {
                state.record.reset_progress();
            } else if start_frame <= state.record.last_success_frame {
                state.record.truncate_frames(start_frame - 1);
            }
            state.record.id.clone()
        };

        info!(
            project = ?project,
            start_frame,
            frame_count,
            %variant,
            "starting generation run"
        );
        self.emit(FrameEvent::RunStarted {
            project,
            start_frame,
            frame_count,
        });

        let mut outcome = RunOutcome::Completed {
            frames: frame_count,
        };
        for frame in start_frame..=frame_count {
            if session.is_cancel_requested() {
                info!(frame, "generation cancelled");
                outcome = RunOutcome::Cancelled { next_frame: frame };
                break;
            }
            match self.run_frame(session, frame, epoch).await {
                Step::Saved => {}
                Step::Stop(stop) => {
                    outcome = stop;
                    break;
                }
            }
        }

        if let RunOutcome::Failed(failure) = &outcome {
            warn!(%failure, "generation stopped");
        } else {
            info!(?outcome, "generation run finished");
        }
        self.emit(FrameEvent::RunFinished(outcome.clone()));
        Ok(outcome)
    }

    async fn run_frame(&self, session: &Session, frame: u32, epoch: u64) -> Step {
        let variant = self.api.variant();
        let built = {
            let state = session.lock();
            if state.epoch() != epoch {
                return Step::Stop(RunOutcome::Cancelled { next_frame: frame });
            }
            let previous = match frame {
                1 => None,
                n => state.record.frames.get(n as usize - 2),
            };
            build_request(&state.record, frame, previous, variant)
        };
        let request = match built {
            Ok(request) => request,
            Err(e) => return self.fail(FrameFailure::from_build(frame, &e)),
        };

        debug!(frame, "requesting frame");
        self.emit(FrameEvent::FrameStarted { frame });
        let result = match self.config.frame_timeout {
            Some(limit) => tokio::time::timeout(limit, self.api.generate(&request))
                .await
                .unwrap_or(Err(ImageApiError::Timeout(limit))),
            None => self.api.generate(&request).await,
        };

        let image = match result {
            Ok(image) => image,
            Err(e) => return self.fail(FrameFailure::from_api(frame, &e)),
        };
        if let Err(e) = check_payload(&image) {
            return self.fail(FrameFailure::empty_response(frame, e));
        }

        let saved = {
            let mut state = session.lock();
            if state.epoch() != epoch {
                debug!(frame, "session switched during request; discarding frame");
                return Step::Stop(RunOutcome::Cancelled { next_frame: frame });
            }
            let record = &mut state.record;
            record.frames.push(image.clone());
            record.last_success_frame = frame;
            let id = record.ensure_id().clone();
            match self.store.put(&id, record) {
                Ok(()) => Ok(id),
                Err(e) => {
                    record.frames.pop();
                    record.last_success_frame = frame - 1;
                    Err(e)
                }
            }
        };

        match saved {
            Ok(project) => {
                debug!(frame, project = %project, "frame saved");
                self.emit(FrameEvent::FrameCompleted {
                    project,
                    frame,
                    image,
                });
                Step::Saved
            }
            Err(e) => self.fail(FrameFailure::persist(frame, &e)),
        }
    }

    fn fail(&self, failure: FrameFailure) -> Step {
        self.emit(FrameEvent::FrameFailed(failure.clone()));
        Step::Stop(RunOutcome::Failed(failure))
    }
}

fn check_payload(image: &ImageBlob) -> Result<(), String> {
    if image.is_empty() {
        return Err("response contained no image data".to_string());
    }
    decode_dimensions(image)
        .map(|_| ())
        .map_err(|e| format!("response image cannot be decoded: {e}"))
}
