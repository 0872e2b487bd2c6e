//! Scheduler collaborator.
//!
//! The driver hands each round over as one unit of work. A scheduler only has
//! to run it; completion is reported through the channel the round carries.

use crate::error::{Result, SyncError};
use std::future::Future;
use std::pin::Pin;
use tokio::runtime::Handle;

/// A round packaged for execution.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs jobs to completion.
pub trait Scheduler: Send + Sync {
    /// Start `job` now. Fails when the job cannot be accepted.
    fn run_now(&self, job: Job) -> Result<()>;
}

/// Spawns jobs onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| SyncError::Scheduler(e.to_string()))
    }
}

impl Scheduler for TokioScheduler {
    fn run_now(&self, job: Job) -> Result<()> {
        self.handle.spawn(job);
        Ok(())
    }
}
