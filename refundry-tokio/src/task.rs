//! A thin wrapper around [`tokio::task::JoinHandle`] that:
//!
//! 1. propagates panics instead of catching them, and
//! 2. adds `#[must_use]` so spawned tasks are joined or explicitly detached.
//!
//! Tasks carry a name for debuggability; [`NamedTask::logged`] instruments a
//! task so it logs its name and status when it finishes.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

/// A named [`JoinHandle`] which resumes panics on join.
#[must_use]
pub struct NamedTask<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> NamedTask<T> {
    /// Spawn a named task which inherits the current tracing span.
    #[inline]
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> NamedTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let span = tracing::Span::current();
        NamedTask {
            task: tokio::spawn(future.instrument(span)),
            name: name.into(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Detach the task from its handle; it can no longer be joined.
    /// Use sparingly.
    pub fn detach(self) {
        drop(self.task);
    }

    /// Abort the underlying task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wrap so the task's name and outcome are logged when it finishes, and
    /// the output is mapped to the task name.
    pub fn logged(self) -> LoggedTask<T> {
        LoggedTask(self)
    }
}

impl<T> Future for NamedTask<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(join_err)) => match join_err.try_into_panic() {
                // Propagate the panic into the joining task.
                Ok(panic_payload) => std::panic::resume_unwind(panic_payload),
                Err(join_err) => panic!(
                    "Task {name:?} was cancelled: {join_err:#}",
                    name = self.name,
                ),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A [`Future`] wrapping [`NamedTask`] so its result is logged when it
/// finishes. The inner `T` is discarded; the output is the task name.
pub struct LoggedTask<T>(NamedTask<T>);

impl<T> Future for LoggedTask<T> {
    type Output = String;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<String> {
        match Pin::new(&mut self.0.task).poll(cx) {
            Poll::Ready(result) => {
                let name = self.0.name.to_string();
                match result {
                    Ok(_) => info!("Task finished: {name}"),
                    Err(e) if e.is_panic() =>
                        warn!("Task panicked: {name}: {e:#}"),
                    Err(e) => warn!("Task cancelled: {name}: {e:#}"),
                }
                Poll::Ready(name)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_returns_output() {
        let task = NamedTask::spawn("adder", async { 2 + 2 });
        assert_eq!(task.await, 4);
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn join_propagates_panics() {
        let task: NamedTask<()> =
            NamedTask::spawn("bomb", async { panic!("boom") });
        task.await;
    }

    #[tokio::test]
    async fn logged_task_output_is_the_name() {
        let task = NamedTask::spawn("worker", async {}).logged();
        assert_eq!(task.await, "worker");
    }
}
