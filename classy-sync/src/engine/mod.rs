//! Reconciliation engine.
//!
//! The engine merges purchases observed on the device with the subscription
//! status reported by the server, and publishes the merged view.
//!
//! # Passes
//!
//! Every operation that talks to the server runs as a *pass*:
//!
//! 1. take the account's pass lock (one pass per account at a time),
//! 2. capture a ticket: the credential plus the session generation,
//! 3. perform the network calls without holding any other lock,
//! 4. commit under the short session lock: if the generation moved (sign-out
//!    or account switch) the result is discarded, otherwise the store is
//!    written first and the in-memory view second.
//!
//! Sign-out and account switches only bump the generation, so they never
//! wait on the network.
//!
//! # Observing state
//!
//! [`ReconciliationEngine::subscribe`] returns a `watch` receiver of
//! [`SyncSnapshot`]; [`ReconciliationEngine::notices`] returns a `broadcast`
//! receiver of [`SyncNotice`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Duration,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as PassLock, OwnedMutexGuard, broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Result, SyncError},
    models::{
        AccountCredential, AccountId, PurchaseEvent, PurchaseToken, SubscriptionId,
        SubscriptionStatusList,
    },
    reliability::RetryPolicy,
    remote::RemoteStatusClient,
    store::SubscriptionStore,
};

mod dispatcher;
mod resolve;
mod scheduler;
mod state;

pub use dispatcher::{DEFAULT_QUEUE_CAPACITY, EventDispatcher};
use resolve::{Resolved, resolve_duplicates};
pub use scheduler::{DueRetry, DueRetryReceiver, RetryScheduler, RetryTask, TokioRetryScheduler};
pub use state::{Availability, EntryState, SyncNotice, SyncSnapshot, TrackedEntry};

/// Capacity of the notice broadcast channel.
const NOTICE_CAPACITY: usize = 64;

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Server state was committed to the store and published.
    Applied,
    /// Nothing to do; the purchase was already registered.
    Unchanged,
    /// A transient failure was handed to the retry scheduler.
    Deferred,
    /// The identity changed while the pass ran; nothing was written.
    Discarded,
}

/// Inbound work for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A purchase reported by the billing collaborator.
    Purchase(PurchaseEvent),
    /// A periodic or foreground refresh.
    Refresh,
    /// A retry whose backoff has elapsed.
    Retry(RetryTask),
}

impl EngineEvent {
    /// Short label for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Purchase(_) => "purchase",
            Self::Refresh => "refresh",
            Self::Retry(task) => task.name(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PurchaseStep {
    Register,
    Transfer,
}

/// Identity and generation a pass started under.
#[derive(Debug)]
struct PassTicket {
    credential: AccountCredential,
    generation: u64,
}

impl PassTicket {
    fn account(&self) -> &AccountId {
        self.credential.account_id()
    }
}

#[derive(Debug, Default)]
struct Session {
    credential: Option<AccountCredential>,
    generation: u64,
    entries: BTreeMap<SubscriptionId, TrackedEntry>,
    availability: Availability,
    last_refreshed: Option<DateTime<Utc>>,
    last_purchase: HashMap<SubscriptionId, PurchaseToken>,
    attempts: HashMap<RetryTask, u32>,
    /// Confirmed entries hidden behind a pending purchase of the same id.
    superseded: HashMap<SubscriptionId, TrackedEntry>,
    /// Purchase tasks stopped by a rejected credential.
    stalled: Vec<RetryTask>,
}

impl Session {
    fn account(&self) -> Option<&AccountId> {
        self.credential.as_ref().map(AccountCredential::account_id)
    }

    fn ticket(&self) -> Option<PassTicket> {
        self.credential
            .clone()
            .map(|credential| PassTicket { credential, generation: self.generation })
    }

    fn is_current(&self, ticket: &PassTicket) -> bool {
        self.generation == ticket.generation && self.account() == Some(ticket.account())
    }

    /// Starts a new identity scope. Passes from the previous scope are
    /// discarded at commit.
    fn reset(&mut self, credential: Option<AccountCredential>) {
        *self = Self { credential, generation: self.generation.wrapping_add(1), ..Self::default() };
    }

    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            account: self.account().cloned(),
            entries: self.entries.clone(),
            availability: self.availability,
            last_refreshed: self.last_refreshed,
            published_at: Utc::now(),
        }
    }

    fn mark_pending(&mut self, event: &PurchaseEvent) {
        let previous = self.entries.insert(event.sku.clone(), TrackedEntry::pending(event));
        if let Some(previous) = previous.filter(|entry| entry.state != EntryState::Pending) {
            self.superseded.insert(event.sku.clone(), previous);
        }
    }

    /// Removes the pending entry of `event`, bringing back the confirmed
    /// entry it covered.
    fn drop_pending(&mut self, event: &PurchaseEvent) {
        if self.entries.get(&event.sku).is_some_and(|entry| {
            entry.state == EntryState::Pending && entry.purchase_token == event.purchase_token
        }) {
            self.entries.remove(&event.sku);
            if let Some(previous) = self.superseded.remove(&event.sku) {
                self.entries.insert(event.sku.clone(), previous);
            }
        }
    }

    fn stall(&mut self, task: &RetryTask) {
        if !matches!(task, RetryTask::Refresh) && !self.stalled.contains(task) {
            self.stalled.push(task.clone());
        }
    }
}

/// Merges local purchases with server status for the signed-in account.
pub struct ReconciliationEngine<C> {
    client: Arc<C>,
    store: Arc<dyn SubscriptionStore>,
    scheduler: Arc<dyn RetryScheduler>,
    policy: RetryPolicy,
    session: Mutex<Session>,
    pass_locks: Mutex<HashMap<AccountId, Arc<PassLock<()>>>>,
    snapshots: watch::Sender<SyncSnapshot>,
    notices: broadcast::Sender<SyncNotice>,
    next_pass: AtomicU64,
}

impl<C> fmt::Debug for ReconciliationEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("policy", &self.policy)
            .field("account", &self.current_account())
            .finish_non_exhaustive()
    }
}

impl<C> ReconciliationEngine<C> {
    /// Creates an engine with no signed-in account.
    #[must_use]
    pub fn new(
        client: Arc<C>,
        store: Arc<dyn SubscriptionStore>,
        scheduler: Arc<dyn RetryScheduler>,
        policy: RetryPolicy,
    ) -> Self {
        let (snapshots, _) = watch::channel(SyncSnapshot::signed_out());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            client,
            store,
            scheduler,
            policy,
            session: Mutex::new(Session::default()),
            pass_locks: Mutex::new(HashMap::new()),
            snapshots,
            notices,
            next_pass: AtomicU64::new(1),
        }
    }

    /// Receiver of the merged view. The current value is available at once.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshots.subscribe()
    }

    /// Receiver of notices emitted from now on.
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Copy of the current merged view.
    #[must_use]
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Signed-in account, if any.
    #[must_use]
    pub fn current_account(&self) -> Option<AccountId> {
        self.lock_session().account().cloned()
    }

    /// Restores the last-known-good view of an account from the store,
    /// without touching the network.
    ///
    /// The view is published as [`Availability::Stale`], or
    /// [`Availability::Unknown`] when nothing was stored.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LocalStore`] if the store cannot be read; the
    /// session is left unchanged then.
    pub fn resume(&self, credential: AccountCredential) -> Result<()> {
        let mut session = self.lock_session();
        let account = credential.account_id().clone();
        let records = self.store.load(&account)?;

        session.reset(Some(credential));
        session.entries = records
            .into_values()
            .map(|record| (record.subscription_id.clone(), TrackedEntry::confirmed(record, &account)))
            .collect();
        session.availability =
            if session.entries.is_empty() { Availability::Unknown } else { Availability::Stale };
        self.publish(&session);

        info!(account = %account, records = session.entries.len(), "Resumed from local store");
        Ok(())
    }

    /// Replaces the credential of the signed-in account.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidInput`] if the credential belongs to a
    /// different account or nobody is signed in.
    pub fn update_credential(&self, credential: AccountCredential) -> Result<()> {
        let mut session = self.lock_session();
        if session.account() != Some(credential.account_id()) {
            return Err(SyncError::InvalidInput(
                "credential does not belong to the signed-in account".to_owned(),
            ));
        }
        session.credential = Some(credential);
        debug!("Credential updated");
        self.resume_stalled(&mut session);
        Ok(())
    }

    /// Signs the current account out.
    ///
    /// Cancels in-flight passes, clears the in-memory view and the account's
    /// store scope, and publishes a signed-out view. Returns the credential
    /// that was active so the caller can clean up server-side registrations.
    ///
    /// A store failure is logged and reported as a notice; the signed-out
    /// view is published regardless.
    pub fn sign_out(&self) -> Option<AccountCredential> {
        let mut session = self.lock_session();
        let previous = session.credential.take();
        session.reset(None);
        self.publish(&session);

        if let Some(credential) = &previous {
            let account = credential.account_id();
            if let Err(e) = self.store.clear(account) {
                error!(account = %account, error = %e, "Failed to clear store on sign-out");
                self.notify(SyncNotice::OperationFailed {
                    account: account.clone(),
                    operation: "sign_out",
                    error: e.into(),
                });
            }
            info!(account = %account, "Signed out");
        }
        self.prune_pass_locks();
        previous
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pass_lock(&self, account: &AccountId) -> Arc<PassLock<()>> {
        let mut locks = self.pass_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(account.clone()).or_default())
    }

    /// Forgets pass locks no pass holds or waits on.
    fn prune_pass_locks(&self) {
        let mut locks = self.pass_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Hands purchase tasks stopped by a rejected credential back to the
    /// scheduler, to run as soon as possible.
    fn resume_stalled(&self, session: &mut Session) {
        let Some(account) = session.account().cloned() else {
            return;
        };
        for task in std::mem::take(&mut session.stalled) {
            info!(account = %account, task = task.name(), "Resuming purchase after credential refresh");
            self.scheduler.schedule(&account, task, Duration::ZERO);
        }
    }

    /// Waits for the account's pass lock and captures a ticket.
    ///
    /// Returns `None` if nobody is signed in, or the signed-in account is not
    /// `expected`.
    async fn enter(&self, expected: Option<&AccountId>) -> Option<(OwnedMutexGuard<()>, PassTicket)> {
        let account = self.current_account()?;
        if expected.is_some_and(|expected| expected != &account) {
            return None;
        }
        let guard = self.pass_lock(&account).lock_owned().await;
        let ticket = self.lock_session().ticket()?;
        if ticket.account() != &account {
            return None;
        }

        let pass_id = self.next_pass.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("pass_id", pass_id);
        Some((guard, ticket))
    }

    fn publish(&self, session: &Session) {
        self.snapshots.send_replace(session.snapshot());
    }

    fn notify(&self, notice: SyncNotice) {
        if self.notices.send(notice).is_err() {
            debug!("No notice subscribers");
        }
    }

    fn report_ambiguities(&self, account: &AccountId, resolved: &Resolved) {
        for ambiguity in &resolved.ambiguities {
            warn!(
                account = %account,
                subscription_id = %ambiguity.subscription_id,
                candidates = ambiguity.candidates,
                "Response held duplicate records for one subscription"
            );
            self.notify(SyncNotice::AmbiguousStatus {
                account: account.clone(),
                subscription_id: ambiguity.subscription_id.clone(),
                candidates: ambiguity.candidates,
                chosen: ambiguity.chosen.clone(),
            });
        }
    }

    fn fail(&self, ticket: &PassTicket, task: RetryTask, error: SyncError) -> Result<PassOutcome> {
        let mut session = self.lock_session();
        self.fail_locked(&mut session, ticket, task, error)
    }

    /// Applies the failure semantics of one error class.
    fn fail_locked(
        &self,
        session: &mut Session,
        ticket: &PassTicket,
        task: RetryTask,
        error: SyncError,
    ) -> Result<PassOutcome> {
        if !session.is_current(ticket) {
            debug!(error = %error, "Identity changed during pass, dropping failure");
            return Ok(PassOutcome::Discarded);
        }
        let account = ticket.account().clone();

        match &error {
            SyncError::Network(_) => {
                session.availability = Availability::Stale;
                let attempt = {
                    let counter = session.attempts.entry(task.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                };
                if self.policy.allows_retry(attempt) {
                    let delay = self.policy.delay_for_attempt(attempt - 1);
                    warn!(
                        account = %account,
                        task = task.name(),
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Transient failure, retry scheduled"
                    );
                    self.scheduler.schedule(&account, task.clone(), delay);
                    self.publish(session);
                    self.notify(SyncNotice::RetryScheduled { account, task, attempt, delay });
                    return Ok(PassOutcome::Deferred);
                }
                session.attempts.remove(&task);
            }
            SyncError::Unauthorized(_) => {
                warn!(account = %account, task = task.name(), "Credential rejected");
                session.stall(&task);
                self.notify(SyncNotice::IdentityRefreshRequired { account });
                return Err(error);
            }
            SyncError::LocalStore(_) => {
                if let RetryTask::Register(event) | RetryTask::Transfer(event) = &task {
                    session.drop_pending(event);
                }
            }
            SyncError::Conflict(_)
            | SyncError::ServerRejected { .. }
            | SyncError::Config(_)
            | SyncError::InvalidInput(_) => {
                match &task {
                    RetryTask::Refresh => session.availability = Availability::Unavailable,
                    RetryTask::Register(event) | RetryTask::Transfer(event) => {
                        session.drop_pending(event);
                    }
                }
                session.attempts.remove(&task);
            }
        }

        error!(account = %account, task = task.name(), error = %error, kind = error.kind(), "Pass failed");
        self.publish(session);
        self.notify(SyncNotice::OperationFailed { account, operation: task.name(), error: error.clone() });
        Err(error)
    }

    fn commit_refresh(&self, ticket: &PassTicket, list: SubscriptionStatusList) -> Result<PassOutcome> {
        let mut session = self.lock_session();
        if !session.is_current(ticket) {
            debug!("Identity changed during refresh, discarding response");
            return Ok(PassOutcome::Discarded);
        }
        let account = ticket.account();

        let resolved = resolve_duplicates(list.subscriptions, &session.last_purchase);
        if let Err(e) = self.store.replace_all(account, &resolved.records) {
            return self.fail_locked(&mut session, ticket, RetryTask::Refresh, e.into());
        }

        let mut entries: BTreeMap<SubscriptionId, TrackedEntry> = resolved
            .records
            .iter()
            .map(|(id, record)| (id.clone(), TrackedEntry::confirmed(record.clone(), account)))
            .collect();
        for (id, entry) in std::mem::take(&mut session.entries) {
            if entries.contains_key(&id) {
                continue;
            }
            match entry.state {
                EntryState::Active => {
                    entries.insert(id, entry.expired());
                }
                EntryState::Pending => {
                    entries.insert(id, entry);
                }
                EntryState::Unknown | EntryState::Expired | EntryState::Transferred => {}
            }
        }

        session.superseded = std::mem::take(&mut session.superseded)
            .into_iter()
            .filter(|(id, entry)| {
                !resolved.records.contains_key(id) && entry.state == EntryState::Active
            })
            .map(|(id, entry)| (id, entry.expired()))
            .collect();
        session.entries = entries;
        session.availability = Availability::Fresh;
        session.last_refreshed = Some(Utc::now());
        session.attempts.remove(&RetryTask::Refresh);
        self.publish(&session);
        drop(session);

        self.report_ambiguities(account, &resolved);
        info!(account = %account, records = resolved.records.len(), "Refresh applied");
        Ok(PassOutcome::Applied)
    }

    fn commit_purchase(
        &self,
        ticket: &PassTicket,
        task: RetryTask,
        event: &PurchaseEvent,
        list: SubscriptionStatusList,
    ) -> Result<PassOutcome> {
        let mut session = self.lock_session();
        if !session.is_current(ticket) {
            debug!("Identity changed during registration, discarding response");
            return Ok(PassOutcome::Discarded);
        }
        let account = ticket.account();

        let resolved = resolve_duplicates(list.subscriptions, &session.last_purchase);
        if let Err(e) = self.store.replace_many(account, &resolved.records) {
            return self.fail_locked(&mut session, ticket, task, e.into());
        }

        for (id, record) in &resolved.records {
            session.superseded.remove(id);
            session.entries.insert(id.clone(), TrackedEntry::confirmed(record.clone(), account));
        }
        if !resolved.records.contains_key(&event.sku) {
            warn!(
                account = %account,
                subscription_id = %event.sku,
                "Server response did not include the purchased subscription"
            );
            session.drop_pending(event);
        }
        session.attempts.remove(&RetryTask::Register(event.clone()));
        session.attempts.remove(&RetryTask::Transfer(event.clone()));
        self.publish(&session);
        drop(session);

        self.report_ambiguities(account, &resolved);
        info!(
            account = %account,
            subscription_id = %event.sku,
            records = resolved.records.len(),
            "Purchase applied"
        );
        Ok(PassOutcome::Applied)
    }
}

impl<C: RemoteStatusClient> ReconciliationEngine<C> {
    /// Switches to another account and fetches its status.
    ///
    /// The previous account's view and store scope are discarded and an
    /// empty view for the new account is published before the fetch starts.
    /// Switching to the account that is already signed in only updates the
    /// credential before refreshing.
    ///
    /// # Errors
    ///
    /// Returns the failure of the initial refresh.
    #[instrument(skip(self, credential), fields(account = %credential.account_id()))]
    pub async fn switch_account(&self, credential: AccountCredential) -> Result<PassOutcome> {
        {
            let mut session = self.lock_session();
            if session.account() == Some(credential.account_id()) {
                session.credential = Some(credential);
                debug!("Account unchanged, refreshing");
                self.resume_stalled(&mut session);
            } else {
                let previous = session.credential.take();
                session.reset(Some(credential));
                self.publish(&session);

                if let Some(previous) = previous {
                    let from = previous.account_id();
                    if let Err(e) = self.store.clear(from) {
                        error!(from = %from, error = %e, "Failed to clear previous account store");
                        self.notify(SyncNotice::OperationFailed {
                            account: from.clone(),
                            operation: "switch_account",
                            error: e.into(),
                        });
                    }
                    info!(from = %from, "Switched account");
                }
            }
        }
        self.prune_pass_locks();
        self.refresh().await
    }

    /// Re-fetches the subscription list and replaces the stored records.
    ///
    /// # Errors
    ///
    /// Returns the classified failure unless it was handed to the retry
    /// scheduler ([`PassOutcome::Deferred`]).
    #[instrument(skip(self), fields(pass_id))]
    pub async fn refresh(&self) -> Result<PassOutcome> {
        self.refresh_pass(None).await
    }

    /// Registers a purchase with the server.
    ///
    /// A purchase whose token is already stored for the account is a
    /// duplicate and causes no remote call.
    ///
    /// # Errors
    ///
    /// Returns the classified failure unless it was handed to the retry
    /// scheduler.
    #[instrument(skip(self, event), fields(subscription_id = %event.sku, pass_id))]
    pub async fn handle_purchase(&self, event: PurchaseEvent) -> Result<PassOutcome> {
        self.purchase_pass(None, event, PurchaseStep::Register).await
    }

    /// Processes an event on behalf of `account`.
    ///
    /// Events for an account that is no longer signed in are discarded.
    ///
    /// # Errors
    ///
    /// Same as the operation the event maps to.
    #[instrument(skip(self, event), fields(account = %account, event = event.name(), pass_id))]
    pub async fn process(&self, account: &AccountId, event: EngineEvent) -> Result<PassOutcome> {
        match event {
            EngineEvent::Refresh | EngineEvent::Retry(RetryTask::Refresh) => {
                self.refresh_pass(Some(account)).await
            }
            EngineEvent::Purchase(event) | EngineEvent::Retry(RetryTask::Register(event)) => {
                self.purchase_pass(Some(account), event, PurchaseStep::Register).await
            }
            EngineEvent::Retry(RetryTask::Transfer(event)) => {
                self.purchase_pass(Some(account), event, PurchaseStep::Transfer).await
            }
        }
    }

    async fn refresh_pass(&self, expected: Option<&AccountId>) -> Result<PassOutcome> {
        let Some((_guard, ticket)) = self.enter(expected).await else {
            debug!("No matching signed-in account, skipping refresh");
            return Ok(PassOutcome::Discarded);
        };

        match self.client.fetch_subscription_status(&ticket.credential).await {
            Ok(list) => self.commit_refresh(&ticket, list),
            Err(error) => self.fail(&ticket, RetryTask::Refresh, error),
        }
    }

    async fn purchase_pass(
        &self,
        expected: Option<&AccountId>,
        event: PurchaseEvent,
        step: PurchaseStep,
    ) -> Result<PassOutcome> {
        let Some((_guard, ticket)) = self.enter(expected).await else {
            warn!(subscription_id = %event.sku, "Purchase without a matching signed-in account, dropping");
            return Ok(PassOutcome::Discarded);
        };

        {
            let mut session = self.lock_session();
            if !session.is_current(&ticket) {
                return Ok(PassOutcome::Discarded);
            }
            session.last_purchase.insert(event.sku.clone(), event.purchase_token.clone());

            let stored = match self.store.load(ticket.account()) {
                Ok(stored) => stored,
                Err(e) => {
                    let task = RetryTask::Register(event.clone());
                    return self.fail_locked(&mut session, &ticket, task, e.into());
                }
            };
            if stored.values().any(|record| record.purchase_token == event.purchase_token) {
                debug!(subscription_id = %event.sku, "Purchase already registered");
                return Ok(PassOutcome::Unchanged);
            }

            session.mark_pending(&event);
            self.publish(&session);
        }

        let credential = &ticket.credential;
        let (task, result) = match step {
            PurchaseStep::Register => match self.client.register_subscription(credential, &event).await {
                Ok(list)
                    if list
                        .find_by_token(&event.purchase_token)
                        .is_some_and(|record| record.sub_already_owned) =>
                {
                    info!(subscription_id = %event.sku, "Purchase owned by another account, transferring");
                    let result = self.client.transfer_subscription(credential, &event).await;
                    (RetryTask::Transfer(event.clone()), result)
                }
                Err(SyncError::Conflict(reason)) => {
                    info!(subscription_id = %event.sku, reason = %reason, "Registration conflict, transferring");
                    let result = self.client.transfer_subscription(credential, &event).await;
                    (RetryTask::Transfer(event.clone()), result)
                }
                other => (RetryTask::Register(event.clone()), other),
            },
            PurchaseStep::Transfer => {
                let result = self.client.transfer_subscription(credential, &event).await;
                (RetryTask::Transfer(event.clone()), result)
            }
        };

        match result {
            Ok(list) => self.commit_purchase(&ticket, task, &event, list),
            Err(error) => self.fail(&ticket, task, error),
        }
    }
}
