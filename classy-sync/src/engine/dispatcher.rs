//! Per-account event routing.
//!
//! Each account gets a bounded channel drained by one worker task, so the
//! events of an account are processed in arrival order while different
//! accounts proceed independently.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use super::{DueRetry, DueRetryReceiver, EngineEvent, ReconciliationEngine};
use crate::{
    error::{Result, SyncError},
    models::AccountId,
    remote::RemoteStatusClient,
};

/// Default per-account queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Routes engine events to per-account workers.
pub struct EventDispatcher<C> {
    engine: Arc<ReconciliationEngine<C>>,
    workers: Mutex<HashMap<AccountId, mpsc::Sender<EngineEvent>>>,
    capacity: usize,
}

impl<C> std::fmt::Debug for EventDispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher").field("capacity", &self.capacity).finish_non_exhaustive()
    }
}

impl<C: RemoteStatusClient + 'static> EventDispatcher<C> {
    /// Creates a dispatcher with the given per-account queue capacity.
    #[must_use]
    pub fn new(engine: Arc<ReconciliationEngine<C>>, capacity: usize) -> Self {
        Self { engine, workers: Mutex::new(HashMap::new()), capacity: capacity.max(1) }
    }

    /// Queues an event for `account`, waiting if its queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidInput`] if the account's worker has shut
    /// down.
    pub async fn dispatch(&self, account: &AccountId, event: EngineEvent) -> Result<()> {
        let sender = self.sender_for(account);
        sender
            .send(event)
            .await
            .map_err(|_| SyncError::InvalidInput(format!("event queue for {account} is closed")))
    }

    /// Stops accepting events for `account`. Queued events still run.
    pub fn close(&self, account: &AccountId) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.remove(account).is_some() {
            debug!(account = %account, "Closed event queue");
        }
    }

    /// Forwards due retries into the owning account's queue.
    pub fn spawn_retry_pump(self: &Arc<Self>, mut due: DueRetryReceiver) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(DueRetry { account, task }) = due.recv().await {
                if let Err(e) = dispatcher.dispatch(&account, EngineEvent::Retry(task)).await {
                    warn!(account = %account, error = %e, "Dropping retry");
                }
            }
            debug!("Retry pump stopped");
        })
    }

    fn sender_for(&self, account: &AccountId) -> mpsc::Sender<EngineEvent> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = workers.get(account)
            && !sender.is_closed()
        {
            return sender.clone();
        }

        let (sender, receiver) = mpsc::channel(self.capacity);
        tokio::spawn(run_worker(Arc::clone(&self.engine), account.clone(), receiver));
        workers.insert(account.clone(), sender.clone());
        debug!(account = %account, "Started event worker");
        sender
    }
}

async fn run_worker<C: RemoteStatusClient>(
    engine: Arc<ReconciliationEngine<C>>,
    account: AccountId,
    mut events: mpsc::Receiver<EngineEvent>,
) {
    while let Some(event) = events.recv().await {
        let name = event.name();
        match engine.process(&account, event).await {
            Ok(outcome) => debug!(account = %account, event = name, ?outcome, "Event processed"),
            Err(e) => warn!(account = %account, event = name, error = %e, "Event failed"),
        }
    }
    debug!(account = %account, "Event worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        engine::{PassOutcome, RetryScheduler, RetryTask},
        models::{
            AccountCredential, Ack, ContentResource, PurchaseEvent, SubscriptionStatusList,
        },
        reliability::RetryPolicy,
        store::MemoryStore,
    };

    #[derive(Debug, Default)]
    struct CountingClient {
        fetches: std::sync::atomic::AtomicU32,
    }

    impl RemoteStatusClient for CountingClient {
        async fn fetch_subscription_status<'a>(
            &'a self,
            _credential: &'a AccountCredential,
        ) -> Result<SubscriptionStatusList> {
            self.fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(SubscriptionStatusList::default())
        }

        async fn register_subscription<'a>(
            &'a self,
            _credential: &'a AccountCredential,
            _purchase: &'a PurchaseEvent,
        ) -> Result<SubscriptionStatusList> {
            Ok(SubscriptionStatusList::default())
        }

        async fn transfer_subscription<'a>(
            &'a self,
            _credential: &'a AccountCredential,
            _purchase: &'a PurchaseEvent,
        ) -> Result<SubscriptionStatusList> {
            Ok(SubscriptionStatusList::default())
        }

        async fn register_instance_id<'a>(
            &'a self,
            _credential: &'a AccountCredential,
            _instance_id: &'a str,
        ) -> Result<Ack> {
            Ok(Ack(String::new()))
        }

        async fn unregister_instance_id<'a>(
            &'a self,
            _credential: &'a AccountCredential,
            _instance_id: &'a str,
        ) -> Result<Ack> {
            Ok(Ack(String::new()))
        }

        async fn fetch_basic_content<'a>(
            &'a self,
            _credential: &'a AccountCredential,
        ) -> Result<ContentResource> {
            Ok(ContentResource { url: String::new() })
        }

        async fn fetch_premium_content<'a>(
            &'a self,
            _credential: &'a AccountCredential,
        ) -> Result<ContentResource> {
            Ok(ContentResource { url: String::new() })
        }
    }

    #[derive(Debug)]
    struct NoopScheduler;

    impl RetryScheduler for NoopScheduler {
        fn schedule(&self, _account: &AccountId, _task: RetryTask, _delay: Duration) {}
    }

    #[tokio::test]
    async fn test_dispatch_runs_events_for_current_account() {
        let client = Arc::new(CountingClient::default());
        let engine = Arc::new(ReconciliationEngine::new(
            Arc::clone(&client),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopScheduler),
            RetryPolicy::default(),
        ));
        let account = AccountId::new("uid-1").unwrap();
        let credential = AccountCredential::new(account.clone(), "token").unwrap();
        assert_eq!(engine.switch_account(credential).await.unwrap(), PassOutcome::Applied);

        let dispatcher = EventDispatcher::new(Arc::clone(&engine), DEFAULT_QUEUE_CAPACITY);
        let mut snapshots = engine.subscribe();
        snapshots.mark_unchanged();

        dispatcher.dispatch(&account, EngineEvent::Refresh).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), snapshots.changed()).await.unwrap().unwrap();
        assert_eq!(client.fetches.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_then_dispatch_restarts_worker() {
        let engine = Arc::new(ReconciliationEngine::new(
            Arc::new(CountingClient::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopScheduler),
            RetryPolicy::default(),
        ));
        let dispatcher = EventDispatcher::new(engine, 1);
        let account = AccountId::new("uid-1").unwrap();

        dispatcher.dispatch(&account, EngineEvent::Refresh).await.unwrap();
        dispatcher.close(&account);
        dispatcher.dispatch(&account, EngineEvent::Refresh).await.unwrap();
    }
}
