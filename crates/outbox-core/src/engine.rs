//! Sync orchestration.
//!
//! [`SyncEngine`] is the facade hosts talk to. It executes operations
//! immediately while online, queues them otherwise, and drains the queue
//! through the scheduler and dispatcher when connectivity returns.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::conflict::{can_auto_resolve, is_metadata_field, suggest_resolution, ConflictDetector};
use crate::connectivity::Connectivity;
use crate::dispatch::{BatchDispatcher, OperationOutcome};
use crate::error::{DurabilityDegraded, Error, Result};
use crate::events::{EventBus, SyncEvent};
use crate::models::{
    ConflictFinding, Operation, OperationId, OperationKind, OperationPatch, OperationStatus,
    Priority, ResolutionStrategy, SyncProgress,
};
use crate::optimistic::{
    resolve_values, ConflictOutcome, FailOutcome, MergeFn, OptimisticUpdater, UpdateId, ViewFn,
};
use crate::remote::{FailureClassifier, RemoteError, RemoteService};
use crate::scheduler::PriorityScheduler;
use crate::state::SyncState;
use crate::store::OperationStore;

/// A local mutation to show before the remote service confirms it
#[derive(Clone)]
pub struct OptimisticMutation {
    pub entity_id: String,
    pub changes: Value,
    pub previous_value: Value,
    pub view: ViewFn,
}

impl OptimisticMutation {
    pub fn new(
        entity_id: impl Into<String>,
        changes: Value,
        previous_value: Value,
        view: ViewFn,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            changes,
            previous_value,
            view,
        }
    }
}

/// How `queue_operation` handled an operation
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    /// Applied remotely right away; carries the service response
    Executed(Option<Value>),
    /// Stored for a later sync
    Queued(OperationId),
}

/// Work left behind when the engine stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub awaiting_resolution: usize,
    pub pending_optimistic: usize,
}

impl ShutdownReport {
    pub const fn has_pending_work(&self) -> bool {
        self.pending_operations > 0 || self.awaiting_resolution > 0 || self.pending_optimistic > 0
    }
}

pub struct SyncEngineBuilder {
    store: OperationStore,
    remote: Arc<dyn RemoteService>,
    connectivity: Connectivity,
    config: EngineConfig,
    classifier: Option<Arc<dyn FailureClassifier>>,
    merge: Option<MergeFn>,
}

impl SyncEngineBuilder {
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Merge function used by the `merge` resolution strategy
    #[must_use]
    pub fn with_merge_fn(mut self, merge: MergeFn) -> Self {
        self.merge = Some(merge);
        self
    }

    pub fn build(self) -> SyncEngine {
        let store = Arc::new(self.store);
        let mut dispatcher =
            BatchDispatcher::new(Arc::clone(&self.remote), Arc::clone(&store), &self.config);
        if let Some(classifier) = self.classifier {
            dispatcher = dispatcher.with_classifier(classifier);
        }
        let initial_state = if self.connectivity.is_online() {
            SyncState::Synced
        } else {
            SyncState::Offline
        };
        let (state, _) = watch::channel(initial_state);

        SyncEngine {
            inner: Arc::new(EngineInner {
                scheduler: Mutex::new(PriorityScheduler::new(&self.config)),
                detector: ConflictDetector::from_config(&self.config),
                optimistic: OptimisticUpdater::new(self.config.optimistic_max_retries),
                dispatcher,
                store,
                events: EventBus::new(),
                connectivity: self.connectivity,
                state,
                merge: self.merge,
                syncing: AtomicBool::new(false),
                resync_requested: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                debounce_generation: AtomicU64::new(0),
                links: Mutex::new(HashMap::new()),
                awaiting: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                config: self.config,
            }),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<OperationStore>,
    dispatcher: BatchDispatcher,
    scheduler: Mutex<PriorityScheduler>,
    detector: ConflictDetector,
    optimistic: OptimisticUpdater,
    events: EventBus,
    connectivity: Connectivity,
    state: watch::Sender<SyncState>,
    merge: Option<MergeFn>,
    syncing: AtomicBool,
    resync_requested: AtomicBool,
    stopped: AtomicBool,
    debounce_generation: AtomicU64,
    /// Optimistic update shown for each queued operation
    links: Mutex<HashMap<OperationId, UpdateId>>,
    /// Remote copy for operations blocked on a conflict decision
    awaiting: Mutex<HashMap<OperationId, Value>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-progress flag when a sync run ends
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Offline-first sync engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder(store: OperationStore, remote: Arc<dyn RemoteService>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            remote,
            connectivity: Connectivity::default(),
            config: EngineConfig::default(),
            classifier: None,
            merge: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &OperationStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn optimistic(&self) -> &OptimisticUpdater {
        &self.inner.optimistic
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn sync_state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    /// Degraded-durability warning from opening the store, yielded once
    pub fn take_durability_warning(&self) -> Option<DurabilityDegraded> {
        self.inner.store.take_degraded_warning()
    }

    fn scheduler(&self) -> MutexGuard<'_, PriorityScheduler> {
        lock(&self.inner.scheduler)
    }

    fn publish_state(&self, state: SyncState) {
        self.inner.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Start the connectivity listener and the escalation sweep.
    ///
    /// Calling it again while running has no effect.
    pub fn start(&self) {
        let mut tasks = lock(&self.inner.tasks);
        if !tasks.is_empty() {
            return;
        }
        self.inner.stopped.store(false, Ordering::SeqCst);

        let weak = Arc::downgrade(&self.inner);
        let mut changes = self.inner.connectivity.subscribe();
        tasks.push(tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let online = *changes.borrow_and_update();
                let Some(engine) = upgrade(&weak) else {
                    break;
                };
                if online {
                    tracing::info!("Back online, scheduling sync");
                    engine.schedule_sync();
                } else {
                    engine.publish_state(SyncState::Offline);
                }
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        let period = self
            .inner
            .config
            .escalation_interval()
            .max(Duration::from_secs(1));
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(engine) = upgrade(&weak) else {
                    break;
                };
                let escalated = engine.scheduler().escalate(Utc::now());
                if !escalated.is_empty() {
                    tracing::debug!("Escalated {} aging operations", escalated.len());
                }
            }
        }));
        drop(tasks);

        if self.inner.connectivity.is_online() {
            self.schedule_sync();
        }
    }

    /// Run `sync_all` after the debounce delay; later calls restart the delay
    pub fn schedule_sync(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.inner.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.inner.config.sync_debounce();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = upgrade(&weak) else {
                return;
            };
            let current = engine.inner.debounce_generation.load(Ordering::SeqCst);
            if current == generation && !engine.inner.stopped.load(Ordering::SeqCst) {
                engine.sync_all().await;
            }
        });
    }

    /// Execute an operation now, or queue it when that is not possible.
    ///
    /// Only queue capacity and invalid input are reported as errors; a failed
    /// immediate attempt falls back to the queue.
    pub async fn queue_operation(
        &self,
        kind: OperationKind,
        target: impl Into<String>,
        payload: Value,
        optimistic: Option<OptimisticMutation>,
    ) -> Result<QueueOutcome> {
        let operation = Operation::new(kind, target, payload)
            .with_max_retries(self.inner.config.max_retries);
        operation.validate()?;

        let online = self.inner.connectivity.is_online();
        if online && !self.is_syncing() && !self.has_queued_for_entity(&operation).await? {
            match self.inner.dispatcher.attempt(&operation).await {
                Ok(response) => {
                    if let Some(mutation) = optimistic {
                        let update_id = self.apply_mutation(mutation);
                        self.inner.optimistic.confirm(update_id)?;
                    }
                    tracing::debug!("Executed {} on '{}' immediately", kind, operation.target);
                    return Ok(QueueOutcome::Executed(response));
                }
                Err(error) => {
                    tracing::warn!(
                        "Immediate {} on '{}' failed, queueing: {}",
                        kind,
                        operation.target,
                        error
                    );
                }
            }
        }

        let update_id = optimistic.map(|mutation| self.apply_mutation(mutation));
        let id = match self.inner.store.enqueue(operation.clone()).await {
            Ok(id) => id,
            Err(error) => {
                if let Some(update_id) = update_id {
                    self.inner
                        .optimistic
                        .fail(update_id, &error.to_string(), false)?;
                }
                return Err(error);
            }
        };

        if let Some(update_id) = update_id {
            lock(&self.inner.links).insert(id, update_id);
        }
        self.scheduler().admit(operation.clone(), Utc::now());
        self.inner.events.emit(&SyncEvent::OperationQueued(operation));

        if !online {
            self.publish_state(SyncState::Offline);
        } else if self.is_syncing() {
            self.inner.resync_requested.store(true, Ordering::SeqCst);
        } else {
            self.schedule_sync();
        }
        Ok(QueueOutcome::Queued(id))
    }

    /// Whether an earlier operation on the same entity is still queued, in
    /// which case running this one immediately would overtake it.
    async fn has_queued_for_entity(&self, operation: &Operation) -> Result<bool> {
        let Some(entity_id) = operation.entity_id() else {
            return Ok(false);
        };
        Ok(self.inner.store.list_all().await?.iter().any(|queued| {
            queued.target == operation.target
                && queued.entity_id().as_deref() == Some(entity_id.as_str())
        }))
    }

    fn apply_mutation(&self, mutation: OptimisticMutation) -> UpdateId {
        self.inner.optimistic.apply(
            mutation.entity_id,
            &mutation.changes,
            mutation.previous_value,
            mutation.view,
        )
    }

    /// Drain the queue once.
    ///
    /// Returns zero progress without doing anything while offline or when
    /// another run is in flight. Per-operation failures are recorded on the
    /// operations and reflected in the progress only.
    pub async fn sync_all(&self) -> SyncProgress {
        if !self.inner.connectivity.is_online() {
            tracing::debug!("Skipping sync while offline");
            self.publish_state(SyncState::Offline);
            return SyncProgress::none();
        }
        let Some(running) = SyncGuard::acquire(&self.inner.syncing) else {
            tracing::debug!("Sync already in progress");
            return SyncProgress::none();
        };
        self.inner.resync_requested.store(false, Ordering::SeqCst);
        self.publish_state(SyncState::Syncing);

        let progress = match self.run_sync().await {
            Ok(progress) => progress,
            Err(error) => {
                tracing::error!("Sync aborted: {}", error);
                self.publish_state(SyncState::Error);
                return SyncProgress::none();
            }
        };

        self.publish_state(SyncState::after(&progress));
        self.inner
            .events
            .emit(&SyncEvent::SyncCompleted(progress));
        tracing::info!(
            "Sync finished ({}): {}/{} completed, {} failed",
            self.sync_state(),
            progress.completed,
            progress.total,
            progress.failed
        );

        drop(running);
        if self.inner.resync_requested.swap(false, Ordering::SeqCst) {
            self.schedule_sync();
        }
        progress
    }

    async fn run_sync(&self) -> Result<SyncProgress> {
        let total = self.admit_queue().await?;
        self.inner.events.emit(&SyncEvent::SyncStarted { total });
        tracing::info!("Sync started with {} operations", total);

        let round_size = self.inner.dispatcher.max_batch_size()
            * self.inner.dispatcher.max_concurrent_batches().max(1);
        let (mut completed, mut failed) = (0, 0);

        loop {
            let selected = self.scheduler().next_batch(round_size);
            if selected.is_empty() {
                break;
            }
            let operations = selected.into_iter().map(|entry| entry.operation).collect();
            let batches = self.inner.dispatcher.group_into_batches(operations);

            for result in self.inner.dispatcher.dispatch_all(batches).await {
                for outcome in result.outcomes {
                    match outcome {
                        OperationOutcome::Synced {
                            operation,
                            response: _,
                        } => {
                            completed += 1;
                            self.settle_synced(operation).await;
                        }
                        OperationOutcome::Failed { operation, error } => {
                            failed += 1;
                            self.settle_failed(operation, &error);
                        }
                        OperationOutcome::Conflict { operation, error } => {
                            self.settle_remote_conflict(operation, &error).await;
                        }
                    }
                }
            }
        }

        Ok(SyncProgress::new(total, completed, failed))
    }

    /// Load the queue into the scheduler and fence entities that have
    /// unresolved work; returns how many operations may run.
    async fn admit_queue(&self) -> Result<usize> {
        let mut operations = self.inner.store.list_all().await?;

        // No dispatch is in flight here, so `processing` means an earlier run
        // was interrupted before recording its outcome.
        for operation in &mut operations {
            if operation.status == OperationStatus::Processing {
                tracing::warn!("Requeueing interrupted operation {}", operation.id);
                *operation = self
                    .inner
                    .store
                    .update(&operation.id, &OperationPatch::status(OperationStatus::Pending))
                    .await?;
            }
        }

        let now = Utc::now();
        let mut scheduler = self.scheduler();
        scheduler.clear_fences();
        let mut dispatchable = HashSet::new();
        for operation in operations {
            if operation.is_dispatchable() {
                dispatchable.insert(operation.id);
                scheduler.admit(operation, now);
            } else if let Some(entity_id) = operation.entity_id() {
                scheduler.fence(operation.target, entity_id);
            }
        }
        scheduler.retain(|id| dispatchable.contains(id));
        Ok(scheduler.unfenced_len())
    }

    fn fence(&self, operation: &Operation) {
        if let Some(entity_id) = operation.entity_id() {
            self.scheduler().fence(operation.target.clone(), entity_id);
        }
    }

    fn linked_update(&self, id: &OperationId) -> Option<UpdateId> {
        lock(&self.inner.links).get(id).copied()
    }

    async fn settle_synced(&self, operation: Operation) {
        if operation.kind == OperationKind::Update {
            if let Some(remote) = self.fetch_written_fields(&operation).await {
                let original = self.original_value(&operation);
                let findings = self.inner.detector.detect_conflicts(
                    &operation.payload,
                    &remote,
                    original.as_ref(),
                );
                if !findings.is_empty() {
                    self.reconcile(operation, remote, findings).await;
                    return;
                }
            }
        }
        self.finish(operation).await;
    }

    /// Remote copy of an updated entity restricted to the fields the update wrote
    async fn fetch_written_fields(&self, operation: &Operation) -> Option<Value> {
        let entity_id = operation.entity_id()?;
        match self
            .inner
            .dispatcher
            .fetch(&operation.target, &entity_id)
            .await
        {
            Ok(remote) => remote.map(|remote| project_onto(&remote, &operation.payload)),
            Err(error) => {
                tracing::debug!(
                    "Could not fetch '{}' {} for conflict check: {}",
                    operation.target,
                    entity_id,
                    error
                );
                None
            }
        }
    }

    fn original_value(&self, operation: &Operation) -> Option<Value> {
        let update_id = self.linked_update(&operation.id)?;
        let update = self.inner.optimistic.get(update_id)?;
        Some(project_onto(&update.previous_value, &operation.payload))
    }

    async fn reconcile(&self, operation: Operation, remote: Value, findings: Vec<ConflictFinding>) {
        let suggested_resolution = suggest_resolution(&findings);
        let auto = can_auto_resolve(&findings);
        tracing::warn!(
            "Operation {} on '{}' conflicts with the remote copy ({} findings, suggested {})",
            operation.id,
            operation.target,
            findings.len(),
            suggested_resolution
        );
        self.inner.events.emit(&SyncEvent::ConflictsDetected {
            operation: operation.clone(),
            findings,
            suggested_resolution,
        });

        let strategy = if auto {
            self.inner.config.resolution_strategy
        } else {
            ResolutionStrategy::Manual
        };
        let local = &operation.payload;
        let merge = self.inner.merge.as_ref();
        let resolved = match self.linked_update(&operation.id) {
            Some(update_id) => {
                match self
                    .inner
                    .optimistic
                    .resolve_conflict(update_id, local, &remote, strategy, merge)
                {
                    Ok(ConflictOutcome::Resolved(value)) => Some(value),
                    Ok(ConflictOutcome::AwaitingManual) => None,
                    Err(error) => {
                        tracing::debug!("Optimistic update {update_id} already settled: {error}");
                        resolve_values(strategy, local, &remote, merge)
                    }
                }
            }
            None => resolve_values(strategy, local, &remote, merge),
        };

        match resolved {
            Some(value) => self.apply_resolution(operation, &value, Some(&remote)).await,
            None => {
                tracing::info!("Operation {} awaits conflict resolution", operation.id);
                self.fence(&operation);
                lock(&self.inner.awaiting).insert(operation.id, remote);
            }
        }
    }

    /// Drop the settled operation and write `value` back when the remote
    /// copy does not already hold it.
    async fn apply_resolution(&self, operation: Operation, value: &Value, remote: Option<&Value>) {
        let follow_up = follow_up_payload(&operation, value);
        let differs = remote.is_none_or(|remote| project_onto(remote, &follow_up) != follow_up);
        let target = operation.target.clone();
        self.finish(operation).await;

        if differs {
            let update = Operation::new(OperationKind::Update, target, follow_up)
                .with_max_retries(self.inner.config.max_retries);
            match self.inner.store.enqueue(update.clone()).await {
                Ok(_) => {
                    tracing::debug!("Queued resolved value as operation {}", update.id);
                    self.fence(&update);
                    self.scheduler().admit(update.clone(), Utc::now());
                    self.inner.events.emit(&SyncEvent::OperationQueued(update));
                }
                Err(error) => {
                    tracing::warn!("Failed to queue resolved value: {}", error);
                }
            }
        }
    }

    fn settle_failed(&self, operation: Operation, error: &RemoteError) {
        self.fence(&operation);
        if let Some(update_id) = self.linked_update(&operation.id) {
            let retry = operation.status == OperationStatus::Pending;
            match self
                .inner
                .optimistic
                .fail(update_id, &error.to_string(), retry)
            {
                Ok(FailOutcome::RolledBack) | Err(_) => {
                    lock(&self.inner.links).remove(&operation.id);
                }
                Ok(FailOutcome::WillRetry) => {}
            }
        }
        self.inner.events.emit(&SyncEvent::OperationFailed {
            operation,
            error: error.to_string(),
        });
    }

    /// The service refused a write because the entity changed remotely. The
    /// operation stays queued without spending a retry.
    async fn settle_remote_conflict(&self, operation: Operation, error: &RemoteError) {
        self.fence(&operation);
        if let Some(remote) = self.fetch_written_fields(&operation).await {
            let original = self.original_value(&operation);
            let findings =
                self.inner
                    .detector
                    .detect_conflicts(&operation.payload, &remote, original.as_ref());
            if !findings.is_empty() {
                let suggested_resolution = suggest_resolution(&findings);
                self.inner.events.emit(&SyncEvent::ConflictsDetected {
                    operation: operation.clone(),
                    findings,
                    suggested_resolution,
                });
            }
        }
        self.inner.events.emit(&SyncEvent::OperationFailed {
            operation,
            error: error.to_string(),
        });
    }

    async fn finish(&self, operation: Operation) {
        if let Err(error) = self.inner.store.remove(&operation.id).await {
            tracing::warn!("Failed to remove synced operation {}: {}", operation.id, error);
        }
        let linked = lock(&self.inner.links).remove(&operation.id);
        if let Some(update_id) = linked {
            // Already settled when a conflict strategy picked the value
            if let Err(error) = self.inner.optimistic.confirm(update_id) {
                tracing::debug!("Optimistic update {update_id} not confirmed: {error}");
            }
        }
        tracing::debug!("Operation {} synced", operation.id);
        self.inner.events.emit(&SyncEvent::OperationSynced(operation));
    }

    /// Supply the chosen value for an operation blocked on a conflict.
    ///
    /// The operation leaves the queue; if `chosen` differs from the remote
    /// copy an update carrying it is queued.
    pub async fn resolve_conflict(&self, id: &OperationId, chosen: Value) -> Result<()> {
        let operation = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if operation.status != OperationStatus::Completed {
            return Err(Error::InvalidInput(format!(
                "operation {id} is not awaiting conflict resolution"
            )));
        }

        let known_remote = lock(&self.inner.awaiting).remove(id);
        let remote = match known_remote {
            Some(remote) => Some(remote),
            None if self.inner.connectivity.is_online() => {
                self.fetch_written_fields(&operation).await
            }
            None => None,
        };

        if let Some(update_id) = self.linked_update(id) {
            if let Err(error) = self.inner.optimistic.resolve(update_id, &chosen) {
                tracing::debug!("Optimistic update {update_id} not awaiting resolution: {error}");
            }
        }
        self.apply_resolution(operation, &chosen, remote.as_ref())
            .await;
        if self.inner.connectivity.is_online() {
            self.schedule_sync();
        }
        Ok(())
    }

    /// Operations blocked on a conflict decision
    pub async fn awaiting_resolution(&self) -> Result<Vec<Operation>> {
        self.inner
            .store
            .list_by_status(OperationStatus::Completed)
            .await
    }

    /// Reset every failed operation to pending with a fresh retry budget,
    /// then sync.
    pub async fn retry_failed(&self) -> Result<SyncProgress> {
        let failed = self.inner.store.reset_all_failed().await?;
        if !failed.is_empty() {
            tracing::info!("Retrying {} failed operations", failed.len());
        }
        Ok(self.sync_all().await)
    }

    /// Reset one failed operation to pending with a fresh retry budget
    pub async fn retry_operation(&self, id: &OperationId) -> Result<Operation> {
        let operation = self.inner.store.reset_failed(id).await?;
        if self.inner.connectivity.is_online() {
            self.schedule_sync();
        }
        Ok(operation)
    }

    /// Remove a pending or failed operation and roll back its optimistic update
    pub async fn cancel(&self, id: &OperationId) -> Result<Operation> {
        let cancellable = [OperationStatus::Pending, OperationStatus::Failed];
        let Some(operation) = self.inner.store.remove_if(id, &cancellable).await? else {
            return match self.inner.store.get(id).await? {
                Some(operation) => Err(Error::InvalidInput(format!(
                    "operation {id} is {} and cannot be cancelled",
                    operation.status
                ))),
                None => Err(Error::NotFound(id.to_string())),
            };
        };

        self.scheduler().remove(id);
        let linked = lock(&self.inner.links).remove(id);
        if let Some(update_id) = linked {
            self.inner.optimistic.fail(update_id, "cancelled", false)?;
        }
        tracing::info!("Cancelled operation {}", id);
        Ok(operation)
    }

    /// Override the scheduling tier of a queued operation
    pub fn change_priority(&self, id: &OperationId, priority: Priority) -> bool {
        self.scheduler().change_priority(id, priority, Utc::now())
    }

    /// Operations still waiting to reach the remote service
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self
            .inner
            .store
            .list_by_status(OperationStatus::Pending)
            .await?
            .len())
    }

    /// Stop background tasks and report work that has not reached the
    /// remote service.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }

        let mut report = ShutdownReport {
            pending_optimistic: self.inner.optimistic.pending_count()
                + self.inner.optimistic.conflict_count(),
            ..ShutdownReport::default()
        };
        for (status, count) in self.inner.store.count_by_status().await? {
            match status {
                OperationStatus::Pending | OperationStatus::Processing => {
                    report.pending_operations += count;
                }
                OperationStatus::Failed => report.failed_operations += count,
                OperationStatus::Completed => report.awaiting_resolution += count,
            }
        }

        if report.has_pending_work() {
            tracing::warn!(
                "Shutting down with {} pending operations, {} awaiting resolution and {} unconfirmed local changes",
                report.pending_operations,
                report.awaiting_resolution,
                report.pending_optimistic
            );
        }
        Ok(report)
    }
}

fn upgrade(weak: &Weak<EngineInner>) -> Option<SyncEngine> {
    weak.upgrade().map(|inner| SyncEngine { inner })
}

/// Fields of `value` that `shape` also has, plus id, version and timestamps
fn project_onto(value: &Value, shape: &Value) -> Value {
    match (value, shape) {
        (Value::Object(fields), Value::Object(keys)) => Value::Object(
            fields
                .iter()
                .filter(|(field, _)| keys.contains_key(*field) || is_metadata_field(field))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect::<Map<String, Value>>(),
        ),
        _ => value.clone(),
    }
}

/// Update payload writing `value` back over the entity `operation` touched
fn follow_up_payload(operation: &Operation, value: &Value) -> Value {
    let mut payload = match value {
        Value::Object(fields) => fields.clone(),
        _ => Map::new(),
    };
    if let Some(id) = operation.payload.get("id") {
        payload.insert("id".to_string(), id.clone());
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::models::ConflictType;
    use crate::testing::MockRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Harness {
        engine: SyncEngine,
        remote: Arc<MockRemote>,
    }

    fn harness(online: bool, config: EngineConfig) -> Harness {
        let remote = Arc::new(MockRemote::new());
        let service: Arc<dyn RemoteService> = remote.clone();
        let engine = SyncEngine::builder(OperationStore::in_memory(config.max_queue_size), service)
            .with_connectivity(Connectivity::new(online))
            .with_config(config.with_sync_debounce(Duration::from_millis(20)))
            .build();
        Harness { engine, remote }
    }

    fn recorder(engine: &SyncEngine) -> (Arc<Mutex<Vec<SyncEvent>>>, crate::events::Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let subscription = engine.events().subscribe_all(move |event| {
            seen.lock().unwrap().push(event.clone());
        });
        (events, subscription)
    }

    #[derive(Clone, Default)]
    struct View(Arc<Mutex<HashMap<String, Value>>>);

    impl View {
        fn mutation(&self, entity: &str, changes: Value, previous: Value) -> OptimisticMutation {
            let state = Arc::clone(&self.0);
            OptimisticMutation::new(
                entity,
                changes,
                previous,
                Arc::new(move |entity: &str, value: &Value| {
                    state.lock().unwrap().insert(entity.to_string(), value.clone());
                }),
            )
        }

        fn get(&self, entity: &str) -> Option<Value> {
            self.0.lock().unwrap().get(entity).cloned()
        }
    }

    async fn queue(engine: &SyncEngine, kind: OperationKind, payload: Value) -> OperationId {
        match engine
            .queue_operation(kind, "devices", payload, None)
            .await
            .unwrap()
        {
            QueueOutcome::Queued(id) => id,
            QueueOutcome::Executed(_) => panic!("expected the operation to be queued"),
        }
    }

    async fn wait_until_empty(store: &OperationStore) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.count().await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue drained");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_creates_sync_when_back_online() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        let (events, _subscription) = recorder(&engine);

        for n in 1..=3 {
            queue(&engine, OperationKind::Create, json!({"id": format!("d{n}")})).await;
        }
        assert_eq!(engine.pending_count().await.unwrap(), 3);
        assert_eq!(engine.sync_state(), SyncState::Offline);

        engine.connectivity().set_online(true);
        let progress = engine.sync_all().await;

        assert_eq!(progress, SyncProgress::new(3, 3, 0));
        assert_eq!(progress.percentage, 100);
        assert_eq!(engine.store().count().await.unwrap(), 0);
        assert_eq!(remote.record_count("devices"), 3);
        assert_eq!(engine.sync_state(), SyncState::Synced);

        let kinds: Vec<_> = events.lock().unwrap().iter().map(SyncEvent::kind).collect();
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::OperationQueued).count(),
            3
        );
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::OperationSynced).count(),
            3
        );
        assert!(events
            .lock()
            .unwrap()
            .contains(&SyncEvent::SyncStarted { total: 3 }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn online_operations_execute_immediately() {
        let Harness { engine, remote } = harness(true, EngineConfig::default());
        let view = View::default();

        let outcome = engine
            .queue_operation(
                OperationKind::Create,
                "devices",
                json!({"id": "d1", "name": "Lamp"}),
                Some(view.mutation("d1", json!({"name": "Lamp"}), json!({}))),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, QueueOutcome::Executed(Some(_))));
        assert_eq!(engine.store().count().await.unwrap(), 0);
        assert!(remote.record("devices", "d1").is_some());
        assert_eq!(view.get("d1"), Some(json!({"name": "Lamp"})));
        assert!(!engine.optimistic().has_pending());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_immediate_attempt_is_queued_with_optimistic_view() {
        let Harness { engine, remote } = harness(true, EngineConfig::default());
        remote.fail_next("devices", RemoteError::retryable("503"));
        let view = View::default();

        let outcome = engine
            .queue_operation(
                OperationKind::Update,
                "devices",
                json!({"id": "d1", "name": "New"}),
                Some(view.mutation("d1", json!({"name": "New"}), json!({"id": "d1", "name": "Old"}))),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, QueueOutcome::Queued(_)));
        assert_eq!(view.get("d1"), Some(json!({"id": "d1", "name": "New"})));
        assert!(engine.optimistic().has_pending());

        // The debounced sync delivers it
        wait_until_empty(engine.store()).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.optimistic().has_pending() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("optimistic update confirmed");
        assert_eq!(remote.record("devices", "d1"), Some(json!({"id": "d1", "name": "New"})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn online_operation_waits_behind_queued_work_on_same_entity() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        queue(&engine, OperationKind::Update, json!({"id": "d1", "name": "a"})).await;
        engine.connectivity().set_online(true);

        let outcome = engine
            .queue_operation(OperationKind::Delete, "devices", json!({"id": "d1"}), None)
            .await
            .unwrap();
        assert!(matches!(outcome, QueueOutcome::Queued(_)));

        wait_until_empty(engine.store()).await;
        assert_eq!(remote.log(), vec!["update devices/d1", "delete devices/d1"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_queue_rolls_back_optimistic_update() {
        let Harness { engine, .. } = harness(false, EngineConfig::default().with_max_queue_size(1));
        let view = View::default();
        queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;

        let error = engine
            .queue_operation(
                OperationKind::Update,
                "devices",
                json!({"id": "d2", "name": "New"}),
                Some(view.mutation("d2", json!({"name": "New"}), json!({"name": "Old"}))),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, Error::QueueFull { capacity: 1 }));
        assert_eq!(view.get("d2"), Some(json!({"name": "Old"})));
        assert!(!engine.optimistic().has_pending());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_operations_are_rejected() {
        let Harness { engine, .. } = harness(false, EngineConfig::default());
        let error = engine
            .queue_operation(OperationKind::Delete, "devices", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_budget_and_manual_retry() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        let id = queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;
        engine.connectivity().set_online(true);

        for attempt in 1..=3 {
            remote.fail_next("devices", RemoteError::retryable("503"));
            let progress = engine.sync_all().await;
            assert_eq!(progress, SyncProgress::new(1, 0, 1));
            let stored = engine.store().get(&id).await.unwrap().unwrap();
            assert_eq!(stored.retry_count, attempt);
            let expected = if attempt < 3 {
                OperationStatus::Pending
            } else {
                OperationStatus::Failed
            };
            assert_eq!(stored.status, expected);
        }
        assert_eq!(engine.sync_state(), SyncState::Error);

        // Failed operations are no longer offered
        assert_eq!(engine.sync_all().await, SyncProgress::none());
        assert_eq!(remote.calls(), 3);

        let progress = engine.retry_failed().await.unwrap();
        assert_eq!(progress, SyncProgress::new(1, 1, 0));
        assert_eq!(engine.store().count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_retries_roll_back_the_view() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        let view = View::default();
        let previous = json!({"id": "d1", "name": "Old", "tags": ["a"]});
        engine
            .queue_operation(
                OperationKind::Update,
                "devices",
                json!({"id": "d1", "name": "New"}),
                Some(view.mutation("d1", json!({"name": "New"}), previous.clone())),
            )
            .await
            .unwrap();
        engine.connectivity().set_online(true);

        for _ in 0..3 {
            remote.fail_next("devices", RemoteError::timeout("no response"));
            engine.sync_all().await;
        }

        assert_eq!(view.get("d1"), Some(previous));
        assert!(!engine.optimistic().has_pending());
        let failed = engine
            .store()
            .list_by_status(OperationStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_operation_resets_only_failed() {
        let Harness { engine, .. } = harness(false, EngineConfig::default());
        let id = queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;

        assert!(matches!(
            engine.retry_operation(&id).await,
            Err(Error::InvalidInput(_))
        ));

        engine
            .store()
            .update(
                &id,
                &OperationPatch::status(OperationStatus::Failed)
                    .with_retry_count(3)
                    .with_error("503"),
            )
            .await
            .unwrap();
        let retried = engine.retry_operation(&id).await.unwrap();
        assert_eq!(retried.status, OperationStatus::Pending);
        assert_eq!(retried.retry_count, 0);
        assert_eq!(retried.last_error, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_failed_resets_exhausted_and_fail_fast_operations() {
        let Harness { engine, .. } = harness(false, EngineConfig::default());
        let exhausted = queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;
        let rejected = queue(&engine, OperationKind::Create, json!({"id": "d2"})).await;
        for (id, retry_count) in [(exhausted, 3), (rejected, 1)] {
            engine
                .store()
                .update(
                    &id,
                    &OperationPatch::status(OperationStatus::Failed)
                        .with_retry_count(retry_count)
                        .with_error("rejected"),
                )
                .await
                .unwrap();
        }

        // Offline, so the follow-up sync is skipped and the reset is observable
        assert_eq!(engine.retry_failed().await.unwrap(), SyncProgress::none());
        for id in [exhausted, rejected] {
            let stored = engine.store().get(&id).await.unwrap().unwrap();
            assert_eq!(stored.status, OperationStatus::Pending);
            assert_eq!(stored.retry_count, 0);
        }
        assert_eq!(engine.pending_count().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn started_engine_escalates_aging_operations() {
        let config = EngineConfig {
            escalation_interval_secs: 1,
            escalation_threshold_secs: 0,
            ..EngineConfig::default()
        }
        .with_target_priority("devices", Priority::Low);
        let Harness { engine, .. } = harness(false, config);
        let id = queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;
        assert_eq!(engine.scheduler().priority_of(&id), Some(Priority::Low));

        engine.start();
        let promoted = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let priority = engine.scheduler().priority_of(&id);
                if priority != Some(Priority::Low) {
                    return priority;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(promoted, Some(Priority::Normal));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_is_skipped_offline_and_while_running() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;
        assert_eq!(engine.sync_all().await, SyncProgress::none());

        engine.connectivity().set_online(true);
        remote.set_delay(Duration::from_millis(200));
        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync_all().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.is_syncing());
        assert_eq!(engine.sync_all().await, SyncProgress::none());

        assert_eq!(running.await.unwrap(), SyncProgress::new(1, 1, 0));
        assert!(!engine.is_syncing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_entity_operations_keep_enqueue_order() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        queue(&engine, OperationKind::Update, json!({"id": "d1", "name": "a"})).await;
        queue(&engine, OperationKind::Delete, json!({"id": "d1"})).await;
        engine.connectivity().set_online(true);

        let progress = engine.sync_all().await;
        assert_eq!(progress, SyncProgress::new(2, 2, 0));
        assert_eq!(remote.log(), vec!["update devices/d1", "delete devices/d1"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_operation_holds_back_later_ones_on_same_entity() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        queue(&engine, OperationKind::Update, json!({"id": "d1", "name": "a"})).await;
        let delete = queue(&engine, OperationKind::Delete, json!({"id": "d1"})).await;
        engine.connectivity().set_online(true);
        remote.fail_next("devices", RemoteError::retryable("503"));

        let progress = engine.sync_all().await;
        assert_eq!(progress, SyncProgress::new(2, 0, 1));
        assert!(remote.log().is_empty());
        let stored = engine.store().get(&delete).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);

        let progress = engine.sync_all().await;
        assert_eq!(progress, SyncProgress::new(2, 2, 0));
        assert_eq!(remote.log(), vec!["update devices/d1", "delete devices/d1"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unresolvable_conflict_blocks_until_resolved() {
        let config = EngineConfig::default().with_critical_field("status");
        let Harness { engine, remote } = harness(false, config);
        let (events, _subscription) = recorder(&engine);
        let view = View::default();
        remote.put_record("devices", "d1", json!({"id": "d1", "status": "draft"}));
        remote.override_fetch("devices", "d1", json!({"id": "d1", "status": "archived"}));

        let outcome = engine
            .queue_operation(
                OperationKind::Update,
                "devices",
                json!({"id": "d1", "status": "published"}),
                Some(view.mutation(
                    "d1",
                    json!({"status": "published"}),
                    json!({"id": "d1", "status": "draft"}),
                )),
            )
            .await
            .unwrap();
        let QueueOutcome::Queued(id) = outcome else {
            panic!("expected queued operation");
        };
        engine.connectivity().set_online(true);

        let progress = engine.sync_all().await;
        assert_eq!(progress, SyncProgress::new(1, 1, 0));

        let conflict = events
            .lock()
            .unwrap()
            .iter()
            .find_map(|event| match event {
                SyncEvent::ConflictsDetected {
                    findings,
                    suggested_resolution,
                    ..
                } => Some((findings.clone(), *suggested_resolution)),
                _ => None,
            })
            .expect("conflict published");
        assert_eq!(conflict.1, crate::models::SuggestedResolution::Manual);
        assert!(conflict.0.iter().any(|finding| {
            finding.conflict_type == ConflictType::ConcurrentField
                && finding.field.as_deref() == Some("status")
        }));

        // Blocked: kept in the store and not offered again
        let blocked = engine.awaiting_resolution().await.unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(engine.optimistic().conflict_count(), 1);
        assert_eq!(engine.sync_all().await, SyncProgress::none());

        engine
            .resolve_conflict(&id, json!({"id": "d1", "status": "published"}))
            .await
            .unwrap();
        assert!(engine.store().get(&id).await.unwrap().is_none());
        assert_eq!(engine.optimistic().conflict_count(), 0);
        assert_eq!(view.get("d1"), Some(json!({"id": "d1", "status": "published"})));

        // The chosen value differs from the remote copy, so it is written back
        let queued = engine.store().list_all().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, OperationKind::Update);
        assert_eq!(queued[0].payload, json!({"id": "d1", "status": "published"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timestamp_only_conflict_resolves_automatically() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        let view = View::default();
        let remote_copy = json!({"id": "d1", "name": "Lamp", "updated_at": 5_000});
        remote.override_fetch("devices", "d1", remote_copy.clone());

        let outcome = engine
            .queue_operation(
                OperationKind::Update,
                "devices",
                json!({"id": "d1", "name": "Lamp", "updated_at": 1_000}),
                Some(view.mutation(
                    "d1",
                    json!({"name": "Lamp", "updated_at": 1_000}),
                    json!({"id": "d1", "name": "Lamp", "updated_at": 500}),
                )),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, QueueOutcome::Queued(_)));
        engine.connectivity().set_online(true);

        let progress = engine.sync_all().await;
        assert_eq!(progress, SyncProgress::new(1, 1, 0));
        assert_eq!(engine.store().count().await.unwrap(), 0);
        assert_eq!(view.get("d1"), Some(remote_copy));
        assert!(!engine.optimistic().has_pending());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolved_conflict_keeps_fields_the_update_did_not_write() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        let previous = json!({"id": "d1", "name": "Old", "color": "red", "updated_at": 500});
        let view = View::default();
        remote.override_fetch(
            "devices",
            "d1",
            json!({"id": "d1", "name": "New", "color": "red", "updated_at": 5_000}),
        );

        engine
            .queue_operation(
                OperationKind::Update,
                "devices",
                json!({"id": "d1", "name": "New", "updated_at": 1_000}),
                Some(view.mutation(
                    "d1",
                    json!({"name": "New", "updated_at": 1_000}),
                    previous,
                )),
            )
            .await
            .unwrap();
        engine.connectivity().set_online(true);

        assert_eq!(engine.sync_all().await, SyncProgress::new(1, 1, 0));
        assert_eq!(
            view.get("d1"),
            Some(json!({"id": "d1", "name": "New", "color": "red", "updated_at": 5_000}))
        );
        assert!(!engine.optimistic().has_pending());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_conflict_keeps_operation_without_spending_retry() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        let id = queue(&engine, OperationKind::Update, json!({"id": "d1", "name": "a"})).await;
        engine.connectivity().set_online(true);
        remote.fail_next("devices", RemoteError::conflict("stale"));

        let progress = engine.sync_all().await;
        assert_eq!(progress, SyncProgress::new(1, 0, 0));
        assert_eq!(engine.sync_state(), SyncState::Synced);
        let stored = engine.store().get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_rolls_back_and_respects_status() {
        let Harness { engine, .. } = harness(false, EngineConfig::default());
        let view = View::default();
        let outcome = engine
            .queue_operation(
                OperationKind::Update,
                "devices",
                json!({"id": "d1", "name": "New"}),
                Some(view.mutation("d1", json!({"name": "New"}), json!({"name": "Old"}))),
            )
            .await
            .unwrap();
        let QueueOutcome::Queued(id) = outcome else {
            panic!("expected queued operation");
        };

        let cancelled = engine.cancel(&id).await.unwrap();
        assert_eq!(cancelled.id, id);
        assert_eq!(view.get("d1"), Some(json!({"name": "Old"})));
        assert_eq!(engine.store().count().await.unwrap(), 0);
        assert!(matches!(engine.cancel(&id).await, Err(Error::NotFound(_))));

        let processing = queue(&engine, OperationKind::Create, json!({"id": "d2"})).await;
        engine
            .store()
            .update(&processing, &OperationPatch::status(OperationStatus::Processing))
            .await
            .unwrap();
        assert!(matches!(
            engine.cancel(&processing).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_operations_are_requeued() {
        let Harness { engine, .. } = harness(false, EngineConfig::default());
        let id = queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;
        engine
            .store()
            .update(&id, &OperationPatch::status(OperationStatus::Processing))
            .await
            .unwrap();
        engine.connectivity().set_online(true);

        assert_eq!(engine.sync_all().await, SyncProgress::new(1, 1, 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_triggers_debounced_sync() {
        let Harness { engine, remote } = harness(false, EngineConfig::default());
        engine.start();
        queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;
        queue(&engine, OperationKind::Create, json!({"id": "d2"})).await;

        engine.connectivity().set_online(true);
        wait_until_empty(engine.store()).await;
        assert_eq!(remote.record_count("devices"), 2);

        let report = engine.shutdown().await.unwrap();
        assert!(!report.has_pending_work());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_reports_pending_work() {
        let Harness { engine, .. } = harness(false, EngineConfig::default());
        let view = View::default();
        queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;
        engine
            .queue_operation(
                OperationKind::Update,
                "devices",
                json!({"id": "d2", "name": "x"}),
                Some(view.mutation("d2", json!({"name": "x"}), json!({}))),
            )
            .await
            .unwrap();

        let report = engine.shutdown().await.unwrap();
        assert_eq!(
            report,
            ShutdownReport {
                pending_operations: 2,
                failed_operations: 0,
                awaiting_resolution: 0,
                pending_optimistic: 1,
            }
        );
        assert!(report.has_pending_work());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deletes_are_scheduled_ahead_of_creates() {
        let config = EngineConfig::default()
            .with_max_batch_size(1)
            .with_max_concurrent_batches(1);
        let Harness { engine, remote } = harness(false, config);
        queue(&engine, OperationKind::Create, json!({"id": "d1"})).await;
        queue(&engine, OperationKind::Delete, json!({"id": "d9"})).await;
        engine.connectivity().set_online(true);

        engine.sync_all().await;
        assert_eq!(remote.log(), vec!["delete devices/d9", "insert devices/d1"]);
    }

    #[test]
    fn project_onto_keeps_written_and_metadata_fields() {
        let remote = json!({"id": "d1", "name": "a", "color": "red", "version": 2});
        let projected = project_onto(&remote, &json!({"name": "b"}));
        assert_eq!(projected, json!({"id": "d1", "name": "a", "version": 2}));
    }
}
