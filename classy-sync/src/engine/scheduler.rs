//! Retry scheduling collaborator.
//!
//! The engine never sleeps. When a pass fails with a transient error it
//! hands exactly one [`RetryTask`] to a [`RetryScheduler`] together with the
//! backoff delay, and returns.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::models::{AccountId, PurchaseEvent};

/// Work the engine asks to have retried.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RetryTask {
    /// Re-fetch the subscription status list.
    Refresh,
    /// Register a purchase.
    Register(PurchaseEvent),
    /// Transfer a purchase owned by another account.
    Transfer(PurchaseEvent),
}

impl RetryTask {
    /// Short label for logs and notices.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::Register(_) => "register_subscription",
            Self::Transfer(_) => "transfer_subscription",
        }
    }
}

/// Receives retry requests from the engine.
///
/// Implementations must return promptly; the engine calls `schedule` while
/// holding its session lock.
pub trait RetryScheduler: Send + Sync {
    /// Runs `task` for `account` after `delay`.
    fn schedule(&self, account: &AccountId, task: RetryTask, delay: Duration);
}

/// A retry whose delay has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueRetry {
    /// Account the task belongs to.
    pub account: AccountId,
    /// Task to run.
    pub task: RetryTask,
}

/// Receiving side of a [`TokioRetryScheduler`].
pub type DueRetryReceiver = mpsc::UnboundedReceiver<DueRetry>;

/// Scheduler that sleeps on a spawned tokio task, then emits the retry on a
/// channel.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioRetryScheduler {
    due: mpsc::UnboundedSender<DueRetry>,
}

impl TokioRetryScheduler {
    /// Creates a scheduler and the receiver due retries arrive on.
    #[must_use]
    pub fn new() -> (Self, DueRetryReceiver) {
        let (due, rx) = mpsc::unbounded_channel();
        (Self { due }, rx)
    }
}

impl RetryScheduler for TokioRetryScheduler {
    fn schedule(&self, account: &AccountId, task: RetryTask, delay: Duration) {
        let due = self.due.clone();
        let retry = DueRetry { account: account.clone(), task };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if due.send(retry).is_err() {
                debug!("Retry receiver closed, dropping retry");
            }
        });
    }
}
