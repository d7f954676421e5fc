//! Optimistic view updates with rollback.
//!
//! A mutation is shown to the user immediately and tracked until the remote
//! result arrives. Tracking state lives only in memory; the durable queue
//! never sees it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::conflict::timestamp_of;
use crate::error::{Error, Result};
use crate::models::ResolutionStrategy;

/// Writes an entity value into the host's view state
pub type ViewFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Combines a local and a remote value
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Receives conflicts that need a human decision
pub type ManualConflictFn = Arc<dyn Fn(&ManualConflict) + Send + Sync>;

type RollbackFn = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateId(Uuid);

impl UpdateId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Pending,
    Success,
    Failed,
    Conflict,
}

/// Snapshot of one in-flight local mutation
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticUpdate {
    pub id: UpdateId,
    pub entity_id: String,
    pub previous_value: Value,
    pub proposed_value: Value,
    pub status: UpdateStatus,
    pub retry_count: u32,
}

/// Both sides of a conflict awaiting an external decision
#[derive(Debug, Clone, PartialEq)]
pub struct ManualConflict {
    pub update_id: UpdateId,
    pub entity_id: String,
    pub local: Value,
    pub remote: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Retry budget remains; the mutation stays visible
    WillRetry,
    /// The previous value was restored
    RolledBack,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    /// The view now shows this value and the update is confirmed
    Resolved(Value),
    /// Waiting for [`OptimisticUpdater::resolve`]
    AwaitingManual,
}

struct TrackedUpdate {
    update: OptimisticUpdate,
    view: ViewFn,
    rollback: Option<RollbackFn>,
}

impl TrackedUpdate {
    fn roll_back(mut self) -> OptimisticUpdate {
        if let Some(rollback) = self.rollback.take() {
            rollback();
        }
        self.update.status = UpdateStatus::Failed;
        self.update
    }
}

/// Tracks optimistic updates until they are confirmed, rolled back or resolved
pub struct OptimisticUpdater {
    updates: Mutex<HashMap<UpdateId, TrackedUpdate>>,
    max_retries: u32,
    manual_conflicts: Mutex<Option<ManualConflictFn>>,
}

impl Default for OptimisticUpdater {
    fn default() -> Self {
        Self::new(3)
    }
}

impl OptimisticUpdater {
    pub fn new(max_retries: u32) -> Self {
        Self {
            updates: Mutex::new(HashMap::new()),
            max_retries,
            manual_conflicts: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UpdateId, TrackedUpdate>> {
        self.updates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the callback that receives conflicts needing manual resolution
    pub fn on_manual_conflict(&self, callback: ManualConflictFn) {
        *self
            .manual_conflicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Show `proposed_changes` merged over `previous_value` and start tracking
    pub fn apply(
        &self,
        entity_id: impl Into<String>,
        proposed_changes: &Value,
        previous_value: Value,
        view: ViewFn,
    ) -> UpdateId {
        let entity_id = entity_id.into();
        let proposed_value = merge_values(&previous_value, proposed_changes);
        view(&entity_id, &proposed_value);

        let rollback: RollbackFn = {
            let view = Arc::clone(&view);
            let entity_id = entity_id.clone();
            let previous_value = previous_value.clone();
            Box::new(move || view(&entity_id, &previous_value))
        };

        let id = UpdateId::new();
        self.lock().insert(
            id,
            TrackedUpdate {
                update: OptimisticUpdate {
                    id,
                    entity_id,
                    previous_value,
                    proposed_value,
                    status: UpdateStatus::Pending,
                    retry_count: 0,
                },
                view,
                rollback: Some(rollback),
            },
        );
        tracing::debug!("Applied optimistic update {id}");
        id
    }

    /// Snapshot of a tracked update
    pub fn get(&self, id: UpdateId) -> Option<OptimisticUpdate> {
        self.lock().get(&id).map(|tracked| tracked.update.clone())
    }

    /// Mark an update as accepted and stop tracking it
    pub fn confirm(&self, id: UpdateId) -> Result<OptimisticUpdate> {
        let mut tracked = self.take(id)?;
        tracked.update.status = UpdateStatus::Success;
        Ok(tracked.update)
    }

    /// Record a failed remote attempt.
    ///
    /// With `retry` and budget left the mutation stays visible; otherwise
    /// the previous value is restored.
    pub fn fail(&self, id: UpdateId, error: &str, retry: bool) -> Result<FailOutcome> {
        {
            let mut updates = self.lock();
            let tracked = updates
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("optimistic update {id}")))?;
            if retry && tracked.update.retry_count < self.max_retries {
                tracked.update.retry_count += 1;
                tracing::debug!(
                    "Optimistic update {id} failed ({error}); retry {}/{}",
                    tracked.update.retry_count,
                    self.max_retries
                );
                return Ok(FailOutcome::WillRetry);
            }
        }

        let tracked = self.take(id)?;
        tracing::warn!("Rolling back optimistic update {id}: {error}");
        tracked.roll_back();
        Ok(FailOutcome::RolledBack)
    }

    /// Settle a conflicting update with `strategy` (see [`resolve_values`])
    pub fn resolve_conflict(
        &self,
        id: UpdateId,
        local: &Value,
        remote: &Value,
        strategy: ResolutionStrategy,
        merge: Option<&MergeFn>,
    ) -> Result<ConflictOutcome> {
        if let Some(resolved) = resolve_values(strategy, local, remote, merge) {
            self.settle(id, &resolved)?;
            return Ok(ConflictOutcome::Resolved(resolved));
        }

        let conflict = {
            let mut updates = self.lock();
            let tracked = updates
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("optimistic update {id}")))?;
            tracked.update.status = UpdateStatus::Conflict;
            ManualConflict {
                update_id: id,
                entity_id: tracked.update.entity_id.clone(),
                local: local.clone(),
                remote: remote.clone(),
            }
        };
        let callback = self
            .manual_conflicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&conflict);
        }
        tracing::info!("Optimistic update {id} awaits manual resolution");
        Ok(ConflictOutcome::AwaitingManual)
    }

    /// Supply the externally chosen value for an update awaiting manual resolution
    pub fn resolve(&self, id: UpdateId, chosen: &Value) -> Result<()> {
        let awaiting = self
            .lock()
            .get(&id)
            .map(|tracked| tracked.update.status == UpdateStatus::Conflict);
        match awaiting {
            Some(true) => self.settle(id, chosen),
            Some(false) => Err(Error::InvalidInput(format!(
                "optimistic update {id} is not awaiting resolution"
            ))),
            None => Err(Error::NotFound(format!("optimistic update {id}"))),
        }
    }

    /// Stop tracking and show `value` over the proposed entity, so fields the
    /// settled value does not carry keep their current contents.
    fn settle(&self, id: UpdateId, value: &Value) -> Result<()> {
        let tracked = self.take(id)?;
        let shown = merge_values(&tracked.update.proposed_value, value);
        (tracked.view)(&tracked.update.entity_id, &shown);
        Ok(())
    }

    fn take(&self, id: UpdateId) -> Result<TrackedUpdate> {
        self.lock()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("optimistic update {id}")))
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn pending_count(&self) -> usize {
        self.count_with(UpdateStatus::Pending)
    }

    pub fn conflict_count(&self) -> usize {
        self.count_with(UpdateStatus::Conflict)
    }

    fn count_with(&self, status: UpdateStatus) -> usize {
        self.lock()
            .values()
            .filter(|tracked| tracked.update.status == status)
            .count()
    }

    /// Roll back every tracked update
    pub fn clear_all(&self) -> usize {
        let drained: Vec<TrackedUpdate> = self.lock().drain().map(|(_, tracked)| tracked).collect();
        let count = drained.len();
        for tracked in drained {
            tracked.roll_back();
        }
        if count > 0 {
            tracing::warn!("Rolled back {count} optimistic updates");
        }
        count
    }
}

/// Shallow-merge `changes` over `base`; non-object changes replace `base`
pub fn merge_values(base: &Value, changes: &Value) -> Value {
    match (base, changes) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (field, value) in changes {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, changes) => changes.clone(),
    }
}

/// Value `strategy` settles on, or `None` when a person has to decide.
///
/// `merge` replaces the default merge, which keeps whichever side has the
/// later timestamp.
pub fn resolve_values(
    strategy: ResolutionStrategy,
    local: &Value,
    remote: &Value,
    merge: Option<&MergeFn>,
) -> Option<Value> {
    match strategy {
        ResolutionStrategy::LastWriteWins => Some(remote.clone()),
        ResolutionStrategy::FirstWriteWins => Some(local.clone()),
        ResolutionStrategy::Merge => Some(merge.map_or_else(
            || later_of(local, remote),
            |merge| merge(local, remote),
        )),
        ResolutionStrategy::Manual => None,
    }
}

/// Whichever value carries the later timestamp; remote on ties or when absent
fn later_of(local: &Value, remote: &Value) -> Value {
    match (timestamp_of(local), timestamp_of(remote)) {
        (Some((_, local_time)), Some((_, remote_time))) if local_time > remote_time => {
            local.clone()
        }
        _ => remote.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Clone, Default)]
    struct View(Arc<Mutex<HashMap<String, Value>>>);

    impl View {
        fn with(entity: &str, value: Value) -> Self {
            let view = Self::default();
            view.0.lock().unwrap().insert(entity.to_string(), value);
            view
        }

        fn get(&self, entity: &str) -> Value {
            self.0.lock().unwrap().get(entity).cloned().unwrap_or(Value::Null)
        }

        fn apply_fn(&self) -> ViewFn {
            let state = Arc::clone(&self.0);
            Arc::new(move |entity: &str, value: &Value| {
                state.lock().unwrap().insert(entity.to_string(), value.clone());
            })
        }
    }

    #[test]
    fn apply_shows_merged_value_immediately() {
        let previous = json!({"id": "1", "name": "pump", "status": "open"});
        let view = View::with("1", previous.clone());
        let updater = OptimisticUpdater::default();

        let id = updater.apply("1", &json!({"status": "closed"}), previous, view.apply_fn());

        assert_eq!(view.get("1"), json!({"id": "1", "name": "pump", "status": "closed"}));
        assert!(updater.has_pending());
        assert_eq!(updater.get(id).unwrap().status, UpdateStatus::Pending);
    }

    #[test]
    fn confirm_stops_tracking() {
        let updater = OptimisticUpdater::default();
        let view = View::default();
        let id = updater.apply("1", &json!({"a": 1}), json!({}), view.apply_fn());

        let confirmed = updater.confirm(id).unwrap();
        assert_eq!(confirmed.status, UpdateStatus::Success);
        assert!(!updater.has_pending());
        assert!(updater.confirm(id).is_err());
        assert_eq!(view.get("1"), json!({"a": 1}));
    }

    #[test]
    fn exhausted_retries_restore_previous_value_exactly() {
        let previous = json!({"id": "7", "nested": {"list": [1, 2, 3]}, "flag": true});
        let view = View::with("7", previous.clone());
        let updater = OptimisticUpdater::new(3);
        let id = updater.apply("7", &json!({"flag": false, "extra": "x"}), previous.clone(), view.apply_fn());

        for _ in 0..3 {
            assert_eq!(updater.fail(id, "timeout", true).unwrap(), FailOutcome::WillRetry);
            assert_ne!(view.get("7"), previous);
        }
        assert_eq!(updater.fail(id, "timeout", true).unwrap(), FailOutcome::RolledBack);
        assert_eq!(view.get("7"), previous);
        assert_eq!(updater.pending_count(), 0);
    }

    #[test]
    fn fail_without_retry_rolls_back_immediately() {
        let view = View::with("1", json!({"v": 1}));
        let updater = OptimisticUpdater::default();
        let id = updater.apply("1", &json!({"v": 2}), json!({"v": 1}), view.apply_fn());

        assert_eq!(updater.fail(id, "rejected", false).unwrap(), FailOutcome::RolledBack);
        assert_eq!(view.get("1"), json!({"v": 1}));
    }

    #[test]
    fn last_and_first_write_wins() {
        let view = View::default();
        let updater = OptimisticUpdater::default();
        let local = json!({"v": "local"});
        let remote = json!({"v": "remote"});

        let lww = updater.apply("a", &local, json!({}), view.apply_fn());
        let outcome = updater
            .resolve_conflict(lww, &local, &remote, ResolutionStrategy::LastWriteWins, None)
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Resolved(remote.clone()));
        assert_eq!(view.get("a"), remote);

        let fww = updater.apply("b", &local, json!({}), view.apply_fn());
        updater
            .resolve_conflict(fww, &local, &remote, ResolutionStrategy::FirstWriteWins, None)
            .unwrap();
        assert_eq!(view.get("b"), local);
        assert!(!updater.has_pending());
    }

    #[test]
    fn resolved_value_keeps_fields_it_does_not_carry() {
        let previous = json!({"id": "d1", "name": "Old", "color": "red", "updated_at": 500});
        let view = View::with("d1", previous.clone());
        let updater = OptimisticUpdater::default();
        let local = json!({"name": "New", "updated_at": 1_000});
        let id = updater.apply("d1", &local, previous, view.apply_fn());

        let remote = json!({"id": "d1", "name": "New", "updated_at": 5_000});
        updater
            .resolve_conflict(id, &local, &remote, ResolutionStrategy::LastWriteWins, None)
            .unwrap();
        assert_eq!(
            view.get("d1"),
            json!({"id": "d1", "name": "New", "color": "red", "updated_at": 5_000})
        );
    }

    #[test]
    fn default_merge_keeps_later_timestamp() {
        let view = View::default();
        let updater = OptimisticUpdater::default();
        let local = json!({"v": "local", "updated_at": 5_000});
        let remote = json!({"v": "remote", "updated_at": 1_000});

        let id = updater.apply("a", &local, json!({}), view.apply_fn());
        updater
            .resolve_conflict(id, &local, &remote, ResolutionStrategy::Merge, None)
            .unwrap();
        assert_eq!(view.get("a"), local);
    }

    #[test]
    fn custom_merge_function_is_used() {
        let view = View::default();
        let updater = OptimisticUpdater::default();
        let merge: MergeFn = Arc::new(|local, remote| merge_values(remote, local));

        let id = updater.apply("a", &json!({"x": 1}), json!({}), view.apply_fn());
        updater
            .resolve_conflict(
                id,
                &json!({"x": 1}),
                &json!({"x": 0, "y": 2}),
                ResolutionStrategy::Merge,
                Some(&merge),
            )
            .unwrap();
        assert_eq!(view.get("a"), json!({"x": 1, "y": 2}));
    }

    #[test]
    fn manual_resolution_waits_for_chosen_value() {
        let view = View::default();
        let updater = OptimisticUpdater::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            updater.on_manual_conflict(Arc::new(move |conflict: &ManualConflict| {
                seen.lock().unwrap().push(conflict.clone());
            }));
        }

        let local = json!({"v": "local"});
        let remote = json!({"v": "remote"});
        let id = updater.apply("a", &local, json!({}), view.apply_fn());
        let outcome = updater
            .resolve_conflict(id, &local, &remote, ResolutionStrategy::Manual, None)
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::AwaitingManual);
        assert_eq!(updater.conflict_count(), 1);
        assert_eq!(seen.lock().unwrap()[0].remote, remote);
        // The view keeps showing the local value meanwhile
        assert_eq!(view.get("a"), local);

        updater.resolve(id, &json!({"v": "chosen"})).unwrap();
        assert_eq!(view.get("a"), json!({"v": "chosen"}));
        assert_eq!(updater.conflict_count(), 0);
    }

    #[test]
    fn resolve_rejects_updates_not_in_conflict() {
        let updater = OptimisticUpdater::default();
        let id = updater.apply("a", &json!({}), json!({}), View::default().apply_fn());
        assert!(matches!(
            updater.resolve(id, &json!({})),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn clear_all_rolls_back_everything() {
        let view = View::with("a", json!({"v": 0}));
        view.0.lock().unwrap().insert("b".to_string(), json!({"v": 0}));
        let updater = OptimisticUpdater::default();
        updater.apply("a", &json!({"v": 1}), json!({"v": 0}), view.apply_fn());
        updater.apply("b", &json!({"v": 1}), json!({"v": 0}), view.apply_fn());

        assert_eq!(updater.clear_all(), 2);
        assert_eq!(view.get("a"), json!({"v": 0}));
        assert_eq!(view.get("b"), json!({"v": 0}));
        assert!(!updater.has_pending());
    }

    #[test]
    fn merge_values_replaces_non_objects() {
        assert_eq!(merge_values(&json!({"a": 1}), &json!(5)), json!(5));
        assert_eq!(
            merge_values(&json!({"a": 1, "b": 1}), &json!({"b": 2})),
            json!({"a": 1, "b": 2})
        );
    }
}
