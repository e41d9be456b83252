//! Cancellation scope: a cancellation token plus an optional deadline, able to
//! tell "someone cancelled us" apart from "we ran out of time".

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a scope ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Done {
    /// Explicit cancellation, with the reason given by whoever cancelled.
    Cancelled(String),
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<Instant>,
    // Own reason first, then ancestors'.
    reasons: Vec<Arc<OnceLock<String>>>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), deadline: None, reasons: vec![Arc::new(OnceLock::new())] }
    }

    /// Child scope: cancelled with its parent, but can be cancelled on its own.
    pub fn child(&self) -> Self {
        let mut reasons = Vec::with_capacity(self.reasons.len() + 1);
        reasons.push(Arc::new(OnceLock::new()));
        reasons.extend(self.reasons.iter().cloned());
        Self { token: self.token.child_token(), deadline: self.deadline, reasons }
    }

    /// Child scope whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        let at = Instant::now() + timeout;
        child.deadline = Some(match self.deadline {
            Some(d) if d < at => d,
            _ => at,
        });
        child
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reasons[0].set(reason.into());
        self.token.cancel();
    }

    fn reason(&self) -> String {
        self.reasons
            .iter()
            .find_map(|r| r.get().cloned())
            .unwrap_or_else(|| "cancelled".to_string())
    }

    /// Non-blocking check.
    pub fn state(&self) -> Option<Done> {
        if self.token.is_cancelled() {
            return Some(Done::Cancelled(self.reason()));
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(Done::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state().is_some()
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    pub async fn done(&self) -> Done {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Done::Cancelled(self.reason()),
                    _ = tokio::time::sleep_until(deadline) => Done::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Done::Cancelled(self.reason())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_is_distinct_from_cancel() {
        let root = CancelScope::new();
        let scoped = root.with_timeout(Duration::from_millis(10));
        assert_eq!(scoped.state(), None);
        assert_eq!(scoped.done().await, Done::DeadlineExceeded);
        // The parent has no deadline and was never cancelled.
        assert_eq!(root.state(), None);
    }

    #[tokio::test]
    async fn child_sees_parent_reason() {
        let root = CancelScope::new();
        let child = root.child();
        root.cancel("user pressed ctrl-c");
        assert_eq!(child.done().await, Done::Cancelled("user pressed ctrl-c".into()));
    }

    #[tokio::test]
    async fn child_cancel_does_not_reach_parent() {
        let root = CancelScope::new();
        let child = root.child();
        child.cancel("pod removed");
        assert!(child.is_done());
        assert!(!root.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn nested_timeout_keeps_earlier_deadline() {
        let root = CancelScope::new();
        let short = root.with_timeout(Duration::from_millis(5));
        let long = short.with_timeout(Duration::from_secs(60));
        assert_eq!(long.deadline(), short.deadline());
    }
}
