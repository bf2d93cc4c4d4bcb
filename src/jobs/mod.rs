//! Background execution for long-running work such as calibration and image
//! correction.
//!
//! A [`JobHandle`] owns one worker thread and its result. Hosts poll
//! [`JobHandle::is_in_flight`] or block on [`JobHandle::wait`]. Cancellation is
//! cooperative: the job receives a [`CancellationToken`] and decides where to
//! check it. The current model estimate lives in a [`ModelSlot`], whose
//! version counter tells hosts when to recompute derived views.

use crate::distortion::{DistortionError, DistortionModel};
use log::{debug, warn};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<(), DistortionError> {
        if self.is_cancelled() {
            Err(DistortionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Handle to a job running on its own thread.
#[derive(Debug)]
pub struct JobHandle<T> {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<Result<T, DistortionError>>>,
}

impl<T: Send + 'static> JobHandle<T> {
    /// Starts `job` on a new thread. The job receives the handle's token.
    pub fn spawn<F>(name: &str, job: F) -> Result<Self, DistortionError>
    where
        F: FnOnce(CancellationToken) -> Result<T, DistortionError> + Send + 'static,
    {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || job(worker_token))
            .map_err(|e| DistortionError::JobFailed(format!("cannot start {name}: {e}")))?;
        debug!("Started job {}", name);
        Ok(Self {
            name: name.to_string(),
            token,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` while the worker thread is still running.
    pub fn is_in_flight(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Asks the job to stop at its next cancellation check.
    pub fn cancel(&self) {
        debug!("Cancelling job {}", self.name);
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Blocks until the job finishes and returns its result.
    ///
    /// # Errors
    ///
    /// The job's own error, or [`DistortionError::JobFailed`] if it panicked.
    pub fn wait(mut self) -> Result<T, DistortionError> {
        self.join()
    }

    /// Result of a finished job, `None` while it runs or after it was taken.
    pub fn try_take(&mut self) -> Option<Result<T, DistortionError>> {
        if self.handle.as_ref()?.is_finished() {
            Some(self.join())
        } else {
            None
        }
    }

    fn join(&mut self) -> Result<T, DistortionError> {
        let handle = self.handle.take().ok_or_else(|| {
            DistortionError::JobFailed(format!("result of {} was already taken", self.name))
        })?;
        match handle.join() {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("Job {} panicked: {}", self.name, message);
                Err(DistortionError::JobFailed(format!("{} panicked: {message}", self.name)))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Current model estimate with a version counter that grows on every
/// replacement.
#[derive(Debug)]
pub struct ModelSlot {
    model: RwLock<Arc<DistortionModel>>,
    version: AtomicU64,
}

impl ModelSlot {
    pub fn new(model: DistortionModel) -> Self {
        Self {
            model: RwLock::new(Arc::new(model)),
            version: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current model.
    pub fn current(&self) -> Arc<DistortionModel> {
        match self.model.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Installs `model` and returns the new version.
    pub fn replace(&self, model: DistortionModel) -> u64 {
        let model = Arc::new(model);
        let mut guard = match self.model.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = model;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        drop(guard);
        debug!("Model slot now at version {}", version);
        version
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distortion::DistortionParameters;
    use std::time::Duration;

    #[test]
    fn test_job_returns_result() {
        let job = JobHandle::spawn("sum", |_| Ok((1..=10).sum::<u32>())).unwrap();
        assert_eq!(job.name(), "sum");
        assert_eq!(job.wait().unwrap(), 55);
    }

    #[test]
    fn test_cancel_stops_cooperative_job() {
        let job = JobHandle::spawn("spin", |token| loop {
            token.check()?;
            thread::sleep(Duration::from_millis(1));
        })
        .unwrap();
        let _: &CancellationToken = job.token();
        job.cancel();
        let result: Result<(), _> = job.wait();
        assert_eq!(result.unwrap_err(), DistortionError::Cancelled);
    }

    #[test]
    fn test_panic_reports_job_failed() {
        let job = JobHandle::<()>::spawn("boom", |_| panic!("lost the lines")).unwrap();
        match job.wait() {
            Err(DistortionError::JobFailed(message)) => assert!(message.contains("lost the lines")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_try_take_after_finish() {
        let mut job = JobHandle::spawn("quick", |_| Ok(7)).unwrap();
        let mut result = None;
        for _ in 0..1000 {
            if let Some(r) = job.try_take() {
                result = Some(r);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(result.unwrap().unwrap(), 7);
        assert!(!job.is_in_flight());
        assert!(job.try_take().is_none());
    }

    #[test]
    fn test_model_slot_versions() {
        let slot = ModelSlot::new(DistortionModel::new(DistortionParameters::for_image(640, 480)).unwrap());
        assert_eq!(slot.version(), 0);

        let refined = DistortionModel::new(
            DistortionParameters::for_image(640, 480).with_radial(vec![-0.2]),
        )
        .unwrap();
        assert_eq!(slot.replace(refined.clone()), 1);
        assert_eq!(slot.version(), 1);
        assert_eq!(*slot.current(), refined);
        assert_eq!(slot.replace(refined), 2);
    }

    #[test]
    fn test_token_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check().unwrap_err(), DistortionError::Cancelled);
    }
}
