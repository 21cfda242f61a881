use crate::error::{ComfoError, Result};
use crate::state::SessionState;
use crate::types::{PropertyId, PropertyValue};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Listener invoked for every push of the property it was registered for
pub type PropertyCallback = Arc<dyn Fn(&PropertyValue) + Send + Sync>;

/// Identifies one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    property: PropertyId,
}

impl SubscriptionHandle {
    pub fn property(&self) -> PropertyId {
        self.property
    }
}

/// Outcome of [`SubscriptionRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub handle: SubscriptionHandle,
    /// First listener for this property: a wire subscribe is due
    pub first: bool,
}

/// Outcome of a dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Snapshot of the listeners of one property, in registration order
#[derive(Clone, Default)]
pub struct Listeners(Vec<PropertyCallback>);

impl Listeners {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Call every listener; a panicking listener does not stop the others
    pub fn dispatch(&self, value: &PropertyValue) -> DispatchReport {
        let mut report = DispatchReport::default();
        for callback in &self.0 {
            match catch_unwind(AssertUnwindSafe(|| callback(value))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(property = %value.id, "Property listener failed: {}", message);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Table of property listeners keyed by property id
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    table: BTreeMap<PropertyId, Vec<(u64, PropertyCallback)>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    pub fn register(&mut self, property: PropertyId, callback: PropertyCallback) -> Registration {
        self.next_id += 1;
        let id = self.next_id;
        let listeners = self.table.entry(property).or_default();
        let first = listeners.is_empty();
        listeners.push((id, callback));

        tracing::debug!(%property, listeners = listeners.len(), "Listener registered");
        Registration {
            handle: SubscriptionHandle { id, property },
            first,
        }
    }

    /// Remove a listener
    ///
    /// Returns `Some(true)` when it was the last one for its property, so a wire
    /// unsubscribe is due, and `None` for handles that are not registered.
    pub fn unregister(&mut self, handle: SubscriptionHandle) -> Option<bool> {
        let listeners = self.table.get_mut(&handle.property)?;
        let position = listeners.iter().position(|(id, _)| *id == handle.id)?;
        listeners.remove(position);

        let last = listeners.is_empty();
        if last {
            self.table.remove(&handle.property);
        }
        tracing::debug!(property = %handle.property, last, "Listener unregistered");
        Some(last)
    }

    /// Snapshot the listeners of a property
    pub fn listeners(&self, property: PropertyId) -> Listeners {
        self.table
            .get(&property)
            .map(|entries| Listeners(entries.iter().map(|(_, cb)| cb.clone()).collect()))
            .unwrap_or_default()
    }

    /// Properties with at least one listener
    pub fn properties(&self) -> Vec<PropertyId> {
        self.table.keys().copied().collect()
    }

    /// Drop every listener
    pub fn clear(&mut self) {
        self.table.clear();
    }
}

/// Event published by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session moved to a new state
    StateChanged(SessionState),

    /// A subscribed property changed on the unit
    PropertyChanged(PropertyValue),

    /// The session gave up reconnecting
    Failed(String),
}

/// Receiver for session events
pub struct EventReceiver {
    rx: broadcast::Receiver<SessionEvent>,
}

impl EventReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Fails with [`ComfoError::ConnectionClosed`] once the session is gone.
    pub async fn recv(&mut self) -> Result<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Closed) => return Err(ComfoError::ConnectionClosed),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event receiver lagged by {} events", n);
                }
            }
        }
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Result<Option<SessionEvent>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(ComfoError::ConnectionClosed)
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("Event receiver lagged by {} events", n);
                }
            }
        }
    }
}
