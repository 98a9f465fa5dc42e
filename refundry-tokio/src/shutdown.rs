//! An at-most-once broadcast used for shutdown signals.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Synchronization utility which sends a notification to all consumers
/// *once*, used for shutdown signals.
///
/// - Multi-producer and multi-consumer: clone to get another handle.
/// - Every clone observes the signal at most once; clones created after the
///   signal was sent still observe it (unlike [`tokio::sync::broadcast`]).
/// - Sending more than once is safe and has no further effect.
///
/// The implementation uses the fact that [`Semaphore::acquire`] on a
/// semaphore with zero permits returns only once the semaphore is closed:
/// closing is "send", and observing the close is "receive".
#[derive(Debug)]
pub struct ShutdownChannel {
    inner: Arc<Semaphore>,
    have_recved: bool,
}

impl ShutdownChannel {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
            have_recved: false,
        }
    }

    /// Send the signal, waking every handle currently waiting in
    /// [`recv`](Self::recv).
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the signal.
    ///
    /// A handle which has already observed the signal never resolves again;
    /// clone a fresh handle if another observation is needed.
    pub async fn recv(&mut self) {
        if self.have_recved {
            std::future::pending().await
        } else {
            // Acquiring can only fail, and only by the semaphore closing.
            let acquired = self.inner.acquire().await;
            debug_assert!(acquired.is_err());
            self.have_recved = true;
        }
    }

    /// [`recv`](Self::recv) but taking ownership, for graceful-shutdown APIs
    /// which require `impl Future<Output = ()> + 'static`.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Whether the signal has been sent. Does not consume the handle's
    /// observation.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Clone for ShutdownChannel {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            // Every clone gets its own chance to observe the signal.
            have_recved: false,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[test]
    fn multiple_sends_dont_panic() {
        let shutdown = ShutdownChannel::new();
        shutdown.send();
        shutdown.send();
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscribers_observe_the_signal() {
        let shutdown1 = ShutdownChannel::new();
        let shutdown2 = shutdown1.clone();
        shutdown1.send();

        // A clone made before the send observes it...
        time::timeout(Duration::from_millis(1), shutdown2.recv_owned())
            .await
            .expect("should resolve immediately");

        // ...and so does a clone made after.
        let shutdown3 = shutdown1.clone();
        assert!(shutdown3.try_recv());
        time::timeout(Duration::from_millis(1), shutdown3.recv_owned())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test(start_paused = true)]
    async fn each_handle_observes_at_most_once() {
        let shutdown1 = ShutdownChannel::new();
        let mut shutdown2 = shutdown1.clone();
        shutdown1.send();

        shutdown2.recv().await;

        // The same handle never resolves a second time.
        let second = time::timeout(Duration::from_millis(5), shutdown2.recv());
        assert!(second.await.is_err());
    }
}
