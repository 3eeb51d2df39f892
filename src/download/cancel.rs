//! Cooperative cancellation handle.
//!
//! A [`CancelToken`] is a first-class value passed explicitly to workers and
//! adapters. All blocking waits in the engine (backoff sleeps, domain-gate
//! waits, HTTP transfers) race against it so cancellation takes effect
//! within the 2-second adapter budget.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Shared cancellation handle for one job.
///
/// Cloning shares the underlying token; cancelling any clone wakes every
/// waiter. Child tokens cancel with their parent but not vice versa, which
/// is how a pause request reaches in-flight items without marking the whole
/// job cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    /// Creates a fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled when either parent is.
    #[must_use]
    pub fn child_of(parents: &[&CancelToken]) -> Self {
        let child = Self::new();
        for parent in parents {
            let parent = parent.inner.clone();
            let downstream = child.inner.clone();
            tokio::spawn(async move {
                parent.cancelled().await;
                downstream.cancel();
            });
        }
        child
    }

    /// Requests cancellation, waking all waiters.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// True once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// Interruptible sleep: waits up to `duration`, returning early on
    /// cancellation. Returns `true` if the token was cancelled during the
    /// wait.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.inner.cancelled() => true,
            () = tokio::time::sleep(duration) => self.is_cancelled(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_wakes_clones() {
        let token = CancelToken::new();
        let clone = token.clone();

        let waiter = tokio::spawn(async move {
            clone.cancelled().await;
            true
        });

        token.cancel();
        assert!(waiter.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_returns_false_when_uninterrupted() {
        tokio::time::pause();
        let token = CancelToken::new();
        assert!(!token.sleep(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let token = CancelToken::new();
        let sleeper = token.clone();

        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(60)).await });
        tokio::task::yield_now().await;
        token.cancel();

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_child_cancels_with_parent_not_vice_versa() {
        let parent_a = CancelToken::new();
        let parent_b = CancelToken::new();
        let child = CancelToken::child_of(&[&parent_a, &parent_b]);

        child.cancel();
        assert!(!parent_a.is_cancelled());
        assert!(!parent_b.is_cancelled());

        let other_child = CancelToken::child_of(&[&parent_a, &parent_b]);
        parent_b.cancel();
        other_child.cancelled().await;
        assert!(other_child.is_cancelled());
        assert!(!parent_a.is_cancelled());
    }
}
