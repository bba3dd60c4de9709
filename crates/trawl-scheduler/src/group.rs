use std::future::Future;

use tokio::task::JoinSet;
use trawl_core::Error;

use crate::{CancellationToken, TaskError};

/// Structured fan-out over sibling tasks sharing one cancellation scope.
///
/// A task that returns `Err` is fatal: the group token is cancelled and every sibling observes it.
/// Outcomes that must not stop siblings (a missing repository, a timeout) are expected to be
/// returned as `Ok` values. Dropping the group aborts whatever is still running.
pub struct TaskGroup<T> {
    token: CancellationToken,
    tasks: JoinSet<Result<T, Error>>,
    first_error: Option<Error>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: JoinSet::new(),
            first_error: None,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Spawns `task` with a child of the group token. The task is dropped at its next await point
    /// once the group is cancelled.
    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let token = self.token.child_token();
        let fut = task(token.clone());
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::cancelled()),
                result = fut => result,
            }
        });
    }

    /// Waits for the next task to finish, in completion order.
    ///
    /// Returns `None` once every spawned task has been joined.
    pub async fn join_next(&mut self) -> Option<Result<T, TaskError>> {
        let joined = self.tasks.join_next().await?;
        let result = match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_cancelled() => Err(TaskError::Cancelled),
            Ok(Err(err)) => Err(TaskError::Failed(err)),
            Err(err) if err.is_cancelled() => Err(TaskError::Cancelled),
            Err(_) => Err(TaskError::Panicked),
        };
        if let Err(err) = &result {
            if self.first_error.is_none() {
                if !matches!(err, TaskError::Cancelled) {
                    tracing::debug!(target: "trawl.group", error = %err, "cancelling task group");
                }
                self.first_error = Some(err.clone().into());
            }
            self.token.cancel();
        }
        Some(result)
    }

    /// Joins every task and returns their values in completion order, or the first failure.
    pub async fn wait(mut self) -> Result<Vec<T>, Error> {
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.join_next().await {
            if let Ok(value) = result {
                out.push(value);
            }
        }
        match self.first_error.take() {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }
}
