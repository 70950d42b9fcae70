//! Wiring of the sync components.
//!
//! [`SyncRuntime`] constructs the engine, dispatcher, retry scheduler and
//! identity handler once and hands out shared references; nothing in the
//! crate is a global.

use std::{sync::Arc, time::Duration};

use tokio::{sync::{broadcast, watch}, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::{
    config::SyncConfig,
    engine::{
        DEFAULT_QUEUE_CAPACITY, EngineEvent, EventDispatcher, PassOutcome, ReconciliationEngine,
        SyncNotice, SyncSnapshot, TokioRetryScheduler,
    },
    error::{Result, SyncError},
    identity::{IdentityChangeHandler, IdentityEvent},
    models::{AccountCredential, PurchaseEvent},
    reliability::RetryPolicy,
    remote::{HttpStatusClient, RemoteStatusClient},
    store::SubscriptionStore,
};

/// Owns the running sync components.
///
/// Must be created inside a tokio runtime. Background tasks stop when the
/// runtime is dropped.
pub struct SyncRuntime<C> {
    engine: Arc<ReconciliationEngine<C>>,
    dispatcher: Arc<EventDispatcher<C>>,
    identity: IdentityChangeHandler<C>,
    refresh_interval: Duration,
    retry_pump: JoinHandle<()>,
}

impl<C> std::fmt::Debug for SyncRuntime<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRuntime")
            .field("engine", &self.engine)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

impl SyncRuntime<HttpStatusClient> {
    /// Builds a runtime talking to the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] for invalid configuration, or
    /// [`SyncError::LocalStore`] if the store cannot be opened.
    pub fn from_config(config: &SyncConfig, instance_id: Option<String>) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(HttpStatusClient::new(&config.server, &config.http)?);
        info!(
            base_url = %config.server.base_url,
            protocol = client.protocol_name(),
            store = ?config.store.kind,
            "Sync runtime configured"
        );
        let store = config.store.open()?;
        Ok(Self::new(client, store, config.retry.policy(), config.refresh.interval(), instance_id))
    }
}

impl<C: RemoteStatusClient + 'static> SyncRuntime<C> {
    /// Wires the components around an existing client and store.
    #[must_use]
    pub fn new(
        client: Arc<C>,
        store: Arc<dyn SubscriptionStore>,
        policy: RetryPolicy,
        refresh_interval: Duration,
        instance_id: Option<String>,
    ) -> Self {
        let (scheduler, due) = TokioRetryScheduler::new();
        let engine = Arc::new(ReconciliationEngine::new(
            Arc::clone(&client),
            store,
            Arc::new(scheduler),
            policy.clone(),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&engine), DEFAULT_QUEUE_CAPACITY));
        let retry_pump = dispatcher.spawn_retry_pump(due);
        let identity = IdentityChangeHandler::new(Arc::clone(&engine), client, instance_id, policy);

        Self { engine, dispatcher, identity, refresh_interval, retry_pump }
    }

    /// The reconciliation engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<ReconciliationEngine<C>> {
        &self.engine
    }

    /// The identity handler.
    #[must_use]
    pub fn identity(&self) -> &IdentityChangeHandler<C> {
        &self.identity
    }

    /// Receiver of the merged view.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.engine.subscribe()
    }

    /// Receiver of notices.
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.engine.notices()
    }

    /// Restores the last-known-good view at process start.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LocalStore`] if the store cannot be read.
    pub fn resume(&self, credential: AccountCredential) -> Result<()> {
        self.engine.resume(credential)
    }

    /// Applies an identity event.
    ///
    /// # Errors
    ///
    /// Same as [`IdentityChangeHandler::handle`].
    pub async fn on_identity(&self, event: IdentityEvent) -> Result<PassOutcome> {
        let previous = self.engine.current_account();
        let outcome = self.identity.handle(event).await;
        if let Some(previous) = previous
            && self.engine.current_account().as_ref() != Some(&previous)
        {
            self.dispatcher.close(&previous);
        }
        outcome
    }

    /// Queues a purchase for the signed-in account.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Unauthorized`] when nobody is signed in.
    pub async fn on_purchase(&self, event: PurchaseEvent) -> Result<()> {
        let account = self
            .engine
            .current_account()
            .ok_or_else(|| SyncError::Unauthorized("no signed-in account".to_owned()))?;
        self.dispatcher.dispatch(&account, EngineEvent::Purchase(event)).await
    }

    /// Queues a refresh for the signed-in account. A no-op when signed out.
    ///
    /// # Errors
    ///
    /// Returns an error if the account's queue is closed.
    pub async fn request_refresh(&self) -> Result<()> {
        match self.engine.current_account() {
            Some(account) => self.dispatcher.dispatch(&account, EngineEvent::Refresh).await,
            None => {
                debug!("Signed out, refresh skipped");
                Ok(())
            }
        }
    }

    /// Spawns the periodic refresh loop.
    pub fn spawn_periodic_refresh(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let dispatcher = Arc::clone(&self.dispatcher);
        let period = self.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(account) = engine.current_account() else {
                    continue;
                };
                if let Err(e) = dispatcher.dispatch(&account, EngineEvent::Refresh).await {
                    debug!(account = %account, error = %e, "Periodic refresh not queued");
                }
            }
        })
    }
}

impl<C> Drop for SyncRuntime<C> {
    fn drop(&mut self) {
        self.retry_pump.abort();
    }
}
