//! Engine events and the observer registry.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::models::{ConflictFinding, Operation, SuggestedResolution, SyncProgress};

/// Event names callers subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OperationQueued,
    OperationSynced,
    OperationFailed,
    ConflictsDetected,
    SyncStarted,
    SyncCompleted,
}

impl EventKind {
    pub const ALL: [Self; 6] = [
        Self::OperationQueued,
        Self::OperationSynced,
        Self::OperationFailed,
        Self::ConflictsDetected,
        Self::SyncStarted,
        Self::SyncCompleted,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OperationQueued => "operation-queued",
            Self::OperationSynced => "operation-synced",
            Self::OperationFailed => "operation-failed",
            Self::ConflictsDetected => "conflicts-detected",
            Self::SyncStarted => "sync-started",
            Self::SyncCompleted => "sync-completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown event: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    OperationQueued(Operation),
    OperationSynced(Operation),
    OperationFailed {
        operation: Operation,
        error: String,
    },
    ConflictsDetected {
        operation: Operation,
        findings: Vec<ConflictFinding>,
        suggested_resolution: SuggestedResolution,
    },
    SyncStarted {
        total: usize,
    },
    SyncCompleted(SyncProgress),
}

impl SyncEvent {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::OperationQueued(_) => EventKind::OperationQueued,
            Self::OperationSynced(_) => EventKind::OperationSynced,
            Self::OperationFailed { .. } => EventKind::OperationFailed,
            Self::ConflictsDetected { .. } => EventKind::ConflictsDetected,
            Self::SyncStarted { .. } => EventKind::SyncStarted,
            Self::SyncCompleted(_) => EventKind::SyncCompleted,
        }
    }
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Registration {
    id: u64,
    kind: Option<EventKind>,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    registrations: Vec<Registration>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out of engine events to registered listeners
#[derive(Clone, Default)]
pub struct EventBus {
    registry: SharedRegistry,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for one kind of event until the returned handle is dropped
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Listen for every event until the returned handle is dropped
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, kind: Option<EventKind>, listener: Listener) -> Subscription {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.registrations.push(Registration { id, kind, listener });
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event to every matching listener.
    ///
    /// Listeners run outside the registry lock and may subscribe or
    /// unsubscribe while handling an event.
    pub fn emit(&self, event: &SyncEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = lock(&self.registry)
            .registrations
            .iter()
            .filter(|registration| registration.kind.is_none_or(|wanted| wanted == kind))
            .map(|registration| Arc::clone(&registration.listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).registrations.len()
    }
}

/// Handle for a registered listener; unsubscribes on drop
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the listener registered for the lifetime of the bus
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry)
                .registrations
                .retain(|registration| registration.id != self.id);
        }
    }
}
