//! Priority scheduling of queued operations.
//!
//! Operations are classified into four tiers when admitted, escalated as
//! they age, and drained in weighted batches. All bookkeeping here is
//! synchronous and in-memory.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::config::{EngineConfig, TierWeights};
use crate::models::{Operation, OperationId, OperationKind, Priority};

/// An operation decorated with its scheduling tier and deadline
#[derive(Debug, Clone, PartialEq)]
pub struct PrioritizedOperation {
    pub operation: Operation,
    pub priority: Priority,
    pub deadline: DateTime<Utc>,
    /// When the operation last changed tier by escalation
    pub escalated_at: Option<DateTime<Utc>>,
}

impl PrioritizedOperation {
    fn entity_key(&self) -> Option<(String, String)> {
        self.operation
            .entity_id()
            .map(|entity| (self.operation.target.clone(), entity))
    }

    fn aged_since(&self) -> DateTime<Utc> {
        self.escalated_at.unwrap_or_else(|| {
            Utc.timestamp_millis_opt(self.operation.created_at)
                .single()
                .unwrap_or_else(Utc::now)
        })
    }
}

/// One tier change made by an escalation sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub operation_id: OperationId,
    pub from: Priority,
    pub to: Priority,
}

pub struct PriorityScheduler {
    queue: HashMap<OperationId, PrioritizedOperation>,
    fenced: HashSet<(String, String)>,
    target_priorities: BTreeMap<String, Priority>,
    weights: TierWeights,
    escalation_threshold: Duration,
}

impl PriorityScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            queue: HashMap::new(),
            fenced: HashSet::new(),
            target_priorities: config.target_priorities.clone(),
            weights: config.tier_weights,
            escalation_threshold: config.escalation_threshold(),
        }
    }

    /// Tier an operation receives on admission
    pub fn classify(&self, operation: &Operation) -> Priority {
        if operation.is_last_attempt() {
            Priority::Critical
        } else if operation.kind == OperationKind::Delete {
            Priority::High
        } else {
            self.target_priorities
                .get(&operation.target)
                .copied()
                .unwrap_or(Priority::Normal)
        }
    }

    /// Admit an operation, keeping the tier of one already queued
    pub fn admit(&mut self, operation: Operation, now: DateTime<Utc>) -> Priority {
        if let Some(existing) = self.queue.get_mut(&operation.id) {
            existing.operation = operation;
            return existing.priority;
        }

        let priority = self.classify(&operation);
        self.queue.insert(
            operation.id,
            PrioritizedOperation {
                operation,
                priority,
                deadline: now + priority.deadline_offset(),
                escalated_at: None,
            },
        );
        priority
    }

    pub fn admit_all(&mut self, operations: impl IntoIterator<Item = Operation>, now: DateTime<Utc>) {
        for operation in operations {
            self.admit(operation, now);
        }
    }

    /// Promote every operation that has waited past the threshold by one tier
    pub fn escalate(&mut self, now: DateTime<Utc>) -> Vec<Escalation> {
        let threshold = self.escalation_threshold;
        let mut escalations = Vec::new();

        for entry in self.queue.values_mut() {
            if entry.priority == Priority::Critical || now - entry.aged_since() < threshold {
                continue;
            }
            let from = entry.priority;
            entry.priority = from.promoted();
            entry.escalated_at = Some(now);
            entry.deadline = entry.deadline.min(now + entry.priority.deadline_offset());
            escalations.push(Escalation {
                operation_id: entry.operation.id,
                from,
                to: entry.priority,
            });
        }

        escalations.sort_by_key(|escalation| escalation.operation_id);
        if !escalations.is_empty() {
            tracing::debug!("Escalated {} aging operations", escalations.len());
        }
        escalations
    }

    /// Override an operation's tier, recomputing its deadline
    pub fn change_priority(
        &mut self,
        id: &OperationId,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.queue.get_mut(id) else {
            return false;
        };
        entry.priority = priority;
        entry.deadline = now + priority.deadline_offset();
        true
    }

    /// Hold back every operation on an entity until [`Self::clear_fences`]
    pub fn fence(&mut self, target: impl Into<String>, entity_id: impl Into<String>) {
        self.fenced.insert((target.into(), entity_id.into()));
    }

    pub fn clear_fences(&mut self) {
        self.fenced.clear();
    }

    /// Take up to `size` operations, weighted across tiers.
    ///
    /// An operation is held back while an older operation on the same entity
    /// is still queued or its entity is fenced, so a selection holds at most
    /// one operation per entity.
    pub fn next_batch(&mut self, size: usize) -> Vec<PrioritizedOperation> {
        if size == 0 || self.queue.is_empty() {
            return Vec::new();
        }

        let mut tiers = self.eligible_by_tier();
        let mut taken: [usize; 4] = [0; 4];
        let total_weight = u64::from(self.weights.total().max(1));

        let mut remaining = size;
        for priority in Priority::ALL {
            let quota = usize::try_from(
                (size as u64) * u64::from(self.weights.weight(priority)) / total_weight,
            )
            .unwrap_or(size);
            let take = quota.min(tiers[priority.index()].len()).min(remaining);
            taken[priority.index()] = take;
            remaining -= take;
        }
        for priority in Priority::ALL {
            if remaining == 0 {
                break;
            }
            let available = tiers[priority.index()].len() - taken[priority.index()];
            let extra = available.min(remaining);
            taken[priority.index()] += extra;
            remaining -= extra;
        }

        let mut selected = Vec::with_capacity(size - remaining);
        for priority in Priority::ALL {
            let tier = &mut tiers[priority.index()];
            tier.truncate(taken[priority.index()]);
            for id in tier.drain(..) {
                if let Some(entry) = self.queue.remove(&id) {
                    selected.push(entry);
                }
            }
        }
        selected
    }

    /// Eligible operation ids per tier, ordered by deadline then age
    fn eligible_by_tier(&self) -> [Vec<OperationId>; 4] {
        let mut oldest_per_entity: HashMap<(String, String), (i64, OperationId)> = HashMap::new();
        for entry in self.queue.values() {
            if let Some(key) = entry.entity_key() {
                let candidate = (entry.operation.created_at, entry.operation.id);
                oldest_per_entity
                    .entry(key)
                    .and_modify(|oldest| *oldest = (*oldest).min(candidate))
                    .or_insert(candidate);
            }
        }
        let heads: HashSet<OperationId> = oldest_per_entity.values().map(|(_, id)| *id).collect();

        let mut entries: Vec<&PrioritizedOperation> = self
            .queue
            .values()
            .filter(|entry| match entry.entity_key() {
                Some(key) => heads.contains(&entry.operation.id) && !self.fenced.contains(&key),
                None => true,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.deadline
                .cmp(&b.deadline)
                .then(a.operation.created_at.cmp(&b.operation.created_at))
                .then(a.operation.id.cmp(&b.operation.id))
        });

        let mut tiers: [Vec<OperationId>; 4] = Default::default();
        for entry in entries {
            tiers[entry.priority.index()].push(entry.operation.id);
        }
        tiers
    }

    /// Stop scheduling an operation
    pub fn remove(&mut self, id: &OperationId) -> Option<PrioritizedOperation> {
        self.queue.remove(id)
    }

    /// Drop every operation not matched by `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(&OperationId) -> bool) {
        self.queue.retain(|id, _| keep(id));
    }

    /// Queued operations whose entity is not fenced
    pub fn unfenced_len(&self) -> usize {
        self.queue
            .values()
            .filter(|entry| {
                entry
                    .entity_key()
                    .is_none_or(|key| !self.fenced.contains(&key))
            })
            .count()
    }

    pub fn priority_of(&self, id: &OperationId) -> Option<Priority> {
        self.queue.get(id).map(|entry| entry.priority)
    }

    pub fn get(&self, id: &OperationId) -> Option<&PrioritizedOperation> {
        self.queue.get(id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.fenced.clear();
    }
}
