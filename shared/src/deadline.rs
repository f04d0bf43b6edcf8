//! Request deadlines threaded through every store and cache call.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("deadline exceeded")]
pub struct Elapsed;

/// An optional point in time after which in-flight I/O is abandoned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline: I/O runs until the collaborator's own timeout.
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    /// Runs `fut` to completion or until the deadline passes.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Elapsed>
    where
        F: Future,
    {
        match self.0 {
            Some(at) => tokio::time::timeout_at(at, fut).await.map_err(|_| Elapsed),
            None => Ok(fut.await),
        }
    }
}
