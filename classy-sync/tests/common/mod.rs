//! Shared fakes for integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use classy_sync::{
    engine::{ReconciliationEngine, RetryScheduler, RetryTask},
    error::{Result, SyncError},
    models::{
        AccountCredential, AccountId, Ack, ContentResource, PurchaseEvent, PurchaseToken,
        SubscriptionStatus, SubscriptionStatusList,
    },
    reliability::RetryPolicy,
    remote::RemoteStatusClient,
    store::{MemoryStore, StoreError, StoredRecords, SubscriptionStore},
};
use tokio::sync::Notify;

/// A remote call as seen by [`MockClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Fetch(AccountId),
    Register(PurchaseToken),
    Transfer(PurchaseToken),
    RegisterInstance(String),
    UnregisterInstance(String),
}

/// Pauses fetches until released.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

type Queue<T> = Mutex<VecDeque<Result<T>>>;

/// Scripted client. Empty queues answer with an empty list or `ok`.
#[derive(Debug, Default)]
pub struct MockClient {
    calls: Mutex<Vec<Call>>,
    fetches: Queue<SubscriptionStatusList>,
    registers: Queue<SubscriptionStatusList>,
    transfers: Queue<SubscriptionStatusList>,
    instance_registers: Queue<()>,
    instance_unregisters: Queue<()>,
    gate: Mutex<Option<Gate>>,
    fetch_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn pop<T: Default>(queue: &Queue<T>) -> Result<T> {
    queue.lock().unwrap().pop_front().unwrap_or_else(|| Ok(T::default()))
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_fetch(&self, result: Result<SubscriptionStatusList>) {
        self.fetches.lock().unwrap().push_back(result);
    }

    pub fn push_register(&self, result: Result<SubscriptionStatusList>) {
        self.registers.lock().unwrap().push_back(result);
    }

    pub fn push_transfer(&self, result: Result<SubscriptionStatusList>) {
        self.transfers.lock().unwrap().push_back(result);
    }

    pub fn push_instance_register(&self, result: Result<()>) {
        self.instance_registers.lock().unwrap().push_back(result);
    }

    pub fn push_instance_unregister(&self, result: Result<()>) {
        self.instance_unregisters.lock().unwrap().push_back(result);
    }

    /// Makes the next fetches wait for `Gate::release`.
    pub fn gate_fetches(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl RemoteStatusClient for MockClient {
    async fn fetch_subscription_status<'a>(
        &'a self,
        credential: &'a AccountCredential,
    ) -> Result<SubscriptionStatusList> {
        self.record(Call::Fetch(credential.account_id().clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        pop(&self.fetches)
    }

    async fn register_subscription<'a>(
        &'a self,
        _credential: &'a AccountCredential,
        purchase: &'a PurchaseEvent,
    ) -> Result<SubscriptionStatusList> {
        self.record(Call::Register(purchase.purchase_token.clone()));
        pop(&self.registers)
    }

    async fn transfer_subscription<'a>(
        &'a self,
        _credential: &'a AccountCredential,
        purchase: &'a PurchaseEvent,
    ) -> Result<SubscriptionStatusList> {
        self.record(Call::Transfer(purchase.purchase_token.clone()));
        pop(&self.transfers)
    }

    async fn register_instance_id<'a>(
        &'a self,
        _credential: &'a AccountCredential,
        instance_id: &'a str,
    ) -> Result<Ack> {
        self.record(Call::RegisterInstance(instance_id.to_owned()));
        pop(&self.instance_registers).map(|_| Ack("ok".to_owned()))
    }

    async fn unregister_instance_id<'a>(
        &'a self,
        _credential: &'a AccountCredential,
        instance_id: &'a str,
    ) -> Result<Ack> {
        self.record(Call::UnregisterInstance(instance_id.to_owned()));
        pop(&self.instance_unregisters).map(|_| Ack("ok".to_owned()))
    }

    async fn fetch_basic_content<'a>(
        &'a self,
        _credential: &'a AccountCredential,
    ) -> Result<ContentResource> {
        Err(SyncError::Unauthorized("not used".to_owned()))
    }

    async fn fetch_premium_content<'a>(
        &'a self,
        _credential: &'a AccountCredential,
    ) -> Result<ContentResource> {
        Err(SyncError::Unauthorized("not used".to_owned()))
    }
}

/// Scheduler that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    scheduled: Mutex<Vec<(AccountId, RetryTask, Duration)>>,
}

impl RecordingScheduler {
    pub fn scheduled(&self) -> Vec<(AccountId, RetryTask, Duration)> {
        self.scheduled.lock().unwrap().clone()
    }
}

impl RetryScheduler for RecordingScheduler {
    fn schedule(&self, account: &AccountId, task: RetryTask, delay: Duration) {
        self.scheduled.lock().unwrap().push((account.clone(), task, delay));
    }
}

/// Memory store whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    writes_left: Mutex<Option<usize>>,
}

impl FlakyStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Lets the next `writes` write calls through, then fails every write.
    pub fn fail_after(&self, writes: usize) {
        *self.writes_left.lock().unwrap() = Some(writes);
    }

    fn check(&self) -> std::result::Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".to_owned()));
        }
        match self.writes_left.lock().unwrap().as_mut() {
            Some(0) => Err(StoreError::Io("disk full".to_owned())),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl SubscriptionStore for FlakyStore {
    fn load(&self, account: &AccountId) -> std::result::Result<StoredRecords, StoreError> {
        self.inner.load(account)
    }

    fn replace_all(
        &self,
        account: &AccountId,
        records: &StoredRecords,
    ) -> std::result::Result<(), StoreError> {
        self.check()?;
        self.inner.replace_all(account, records)
    }

    fn replace_many(
        &self,
        account: &AccountId,
        records: &StoredRecords,
    ) -> std::result::Result<(), StoreError> {
        self.check()?;
        self.inner.replace_many(account, records)
    }

    fn clear(&self, account: &AccountId) -> std::result::Result<(), StoreError> {
        self.check()?;
        self.inner.clear(account)
    }
}

pub struct Harness<S> {
    pub client: Arc<MockClient>,
    pub store: Arc<S>,
    pub scheduler: Arc<RecordingScheduler>,
    pub policy: RetryPolicy,
    pub engine: Arc<ReconciliationEngine<MockClient>>,
}

pub fn harness() -> Harness<MemoryStore> {
    harness_with_store(Arc::new(MemoryStore::new()))
}

pub fn harness_with_store<S: SubscriptionStore + 'static>(store: Arc<S>) -> Harness<S> {
    let client = MockClient::new();
    let scheduler = Arc::new(RecordingScheduler::default());
    let policy = RetryPolicy::default();
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::clone(&client),
        Arc::clone(&store) as Arc<dyn SubscriptionStore>,
        Arc::clone(&scheduler) as Arc<dyn RetryScheduler>,
        policy.clone(),
    ));
    Harness { client, store, scheduler, policy, engine }
}

pub fn account(id: &str) -> AccountId {
    AccountId::new(id).unwrap()
}

pub fn credential(id: &str) -> AccountCredential {
    AccountCredential::new(account(id), format!("token-{id}")).unwrap()
}

pub fn purchase(sku: &str, token: &str) -> PurchaseEvent {
    PurchaseEvent::new(sku, token, false).unwrap()
}

pub fn status(sku: &str, token: &str, active: bool) -> SubscriptionStatus {
    let mut status = SubscriptionStatus::for_purchase(&purchase(sku, token));
    status.is_entitled = active;
    status.is_entitlement_active = active;
    status
}

pub fn list(records: Vec<SubscriptionStatus>) -> SubscriptionStatusList {
    SubscriptionStatusList::new(records)
}
