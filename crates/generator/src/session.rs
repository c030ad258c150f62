//! Per-session state shared between the controller and the engine.

use parking_lot::{Mutex, MutexGuard};
use project::{ProjectId, ProjectRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Mutable state of the project being edited.
#[derive(Debug, Default)]
pub struct SessionState {
    pub record: ProjectRecord,
    epoch: u64,
}

impl SessionState {
    /// Bumped whenever the session switches to another project (new, load,
    /// delete). A run compares it after every await.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    state: Mutex<SessionState>,
    running: AtomicBool,
    cancel: AtomicBool,
}

/// Cloneable handle to one session. The lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_record(record: ProjectRecord) -> Self {
        let session = Self::new();
        session.lock().record = record;
        session
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock()
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> ProjectRecord {
        self.lock().record.clone()
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        self.lock().record.id.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Asks the active run to stop before its next frame. The frame in
    /// flight, if any, still completes and is saved.
    ///
    /// Only a running generation observes the request: every run starts with
    /// the token cleared, so a cancel issued while idle has no effect on the
    /// next run.
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel.load(Ordering::Acquire)
    }

    /// Swaps in another project and invalidates any run working on the old one.
    pub(crate) fn replace(&self, record: ProjectRecord) {
        if self.is_running() {
            self.cancel();
        }
        let mut state = self.lock();
        state.record = record;
        state.epoch += 1;
    }

    /// Claims the run flag. `None` if a run is already active.
    pub(crate) fn try_begin_run(&self) -> Option<RunGuard> {
        self.inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.inner.cancel.store(false, Ordering::Release);
        Some(RunGuard {
            inner: self.inner.clone(),
        })
    }
}

/// Clears the run flag on every exit path, unwinding included.
pub(crate) struct RunGuard {
    inner: Arc<SessionInner>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flag_is_exclusive() {
        let session = Session::new();
        let guard = session.try_begin_run().unwrap();
        assert!(session.is_running());
        assert!(session.try_begin_run().is_none());
        drop(guard);
        assert!(!session.is_running());
        assert!(session.try_begin_run().is_some());
    }

    #[test]
    fn test_idle_cancel_does_not_carry_into_next_run() {
        let session = Session::new();
        session.cancel();
        assert!(session.is_cancel_requested());
        let _guard = session.try_begin_run().unwrap();
        assert!(!session.is_cancel_requested());
    }

    #[test]
    fn test_flags_are_per_session() {
        let a = Session::new();
        let b = Session::new();
        let _guard = a.try_begin_run().unwrap();
        assert!(b.try_begin_run().is_some());
    }

    #[test]
    fn test_flag_cleared_on_panic() {
        let session = Session::new();
        let clone = session.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = clone.try_begin_run().unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!session.is_running());
    }

    #[test]
    fn test_replace_bumps_epoch_and_cancels_run() {
        let session = Session::new();
        let _guard = session.try_begin_run().unwrap();
        assert!(!session.is_cancel_requested());
        let before = session.lock().epoch();
        session.replace(ProjectRecord::default());
        assert_eq!(session.lock().epoch(), before + 1);
        assert!(session.is_cancel_requested());
    }
}
