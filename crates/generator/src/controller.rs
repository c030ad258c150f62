//! Project session controller: new/load/delete lifecycle and autosave.

use project::{
    Credentials, ImageBlob, ImageSize, ProjectId, ProjectRecord, ProjectStore, ProjectSummary,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::session::Session;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("project {0} not found")]
    NotFound(ProjectId),
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Coalesces saves triggered by rapid edits.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutosavePolicy {
    /// Minimum time between two edit-triggered saves; `None` saves on every edit
    pub min_interval: Option<Duration>,
}

impl AutosavePolicy {
    pub fn immediate() -> Self {
        Self { min_interval: None }
    }

    pub fn debounced(min_interval: Duration) -> Self {
        Self {
            min_interval: Some(min_interval),
        }
    }
}

pub struct SessionController {
    store: Arc<dyn ProjectStore>,
    session: Session,
    policy: AutosavePolicy,
    last_save: Option<Instant>,
    dirty: bool,
}

impl SessionController {
    pub fn new(store: Arc<dyn ProjectStore>, policy: AutosavePolicy) -> Self {
        Self {
            store,
            session: Session::new(),
            policy,
            last_save: None,
            dirty: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    /// True when an edit has not been written yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectSummary>, ControllerError> {
        Ok(self.store.list()?)
    }

    /// Swaps the session contents. Pending edits are dropped, callers flush
    /// first when they must survive.
    fn reset_session(&mut self, record: ProjectRecord) {
        self.session.replace(record);
        self.dirty = false;
        self.last_save = None;
    }

    /// Saves pending edits, then starts an empty, unsaved project.
    pub fn new_project(&mut self) -> Result<(), ControllerError> {
        self.flush()?;
        self.reset_session(ProjectRecord::default());
        debug!("started new project");
        Ok(())
    }

    /// Saves pending edits, then replaces the session with the stored
    /// record, watermark included, so `resume` continues where the record
    /// left off.
    pub fn load_project(&mut self, id: &ProjectId) -> Result<(), ControllerError> {
        self.flush()?;
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| ControllerError::NotFound(id.clone()))?;
        info!(
            project = %id,
            frames = record.last_success_frame,
            of = record.frame_count,
            "loaded project"
        );
        self.reset_session(record);
        Ok(())
    }

    /// Deletes a stored project. If it is the active one, the session is
    /// reset as well and its pending edits go with it; otherwise pending
    /// edits are kept and saved as usual.
    pub fn delete_project(&mut self, id: &ProjectId) -> Result<bool, ControllerError> {
        let removed = self.store.delete(id)?;
        if self.session.project_id().as_ref() == Some(id) {
            self.reset_session(ProjectRecord::default());
            info!(project = %id, "deleted active project; session reset");
        } else {
            info!(project = %id, removed, "deleted project");
        }
        Ok(removed)
    }

    /// Writes the session to the store, assigning an id on first save.
    pub fn auto_save(&mut self) -> Result<ProjectId, ControllerError> {
        let id = {
            let mut state = self.session.lock();
            let record = &mut state.record;
            if record.name.trim().is_empty() {
                record.name = format!("Project {}", chrono::Utc::now().timestamp_millis());
            }
            let id = record.ensure_id().clone();
            self.store.put(&id, record)?;
            id
        };
        self.dirty = false;
        self.last_save = Some(Instant::now());
        debug!(project = %id, "autosaved");
        Ok(id)
    }

    /// Saves a pending edit, if any.
    pub fn flush(&mut self) -> Result<Option<ProjectId>, ControllerError> {
        if self.dirty {
            self.auto_save().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Applies an edit to the session and autosaves per the policy.
    pub fn edit<F>(&mut self, f: F) -> Result<(), ControllerError>
    where
        F: FnOnce(&mut ProjectRecord),
    {
        f(&mut self.session.lock().record);
        self.dirty = true;
        let due = match (self.policy.min_interval, self.last_save) {
            (Some(interval), Some(last)) => last.elapsed() >= interval,
            _ => true,
        };
        if due {
            self.auto_save()?;
        }
        Ok(())
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), ControllerError> {
        let name = name.into();
        self.edit(|r| r.name = name)
    }

    pub fn set_credentials(&mut self, secret: impl Into<String>) -> Result<(), ControllerError> {
        let credentials = Credentials::new(secret);
        self.edit(|r| r.credentials = credentials)
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) -> Result<(), ControllerError> {
        let prompt = prompt.into();
        self.edit(|r| r.prompt_template = prompt)
    }

    pub fn set_frame_count(&mut self, frame_count: u32) -> Result<(), ControllerError> {
        self.edit(|r| r.set_frame_count(frame_count))
    }

    pub fn set_size(&mut self, size: ImageSize) -> Result<(), ControllerError> {
        self.edit(|r| r.size = size)
    }

    pub fn set_reference_image(&mut self, image: ImageBlob) -> Result<(), ControllerError> {
        self.edit(|r| r.reference_image = Some(image))
    }

    pub fn clear_reference_image(&mut self) -> Result<(), ControllerError> {
        self.edit(|r| r.reference_image = None)
    }
}
