//! Listener Bus
//!
//! Ordered registry of observers interested in connection and device state
//! changes. Delivery is synchronous and in registration order. Observers may
//! register or unregister from any thread, including from inside a callback:
//! an observer removed mid-delivery is skipped for the rest of that delivery.

use crate::domain::models::{ConnectionState, DeviceState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Receives state change notifications from the LED control service
pub trait LedControlListener: Send + Sync {
    fn on_connection_state_change(&self, _state: ConnectionState) {}

    /// Called with the live state after every applied device report
    fn on_device_state_change(&self, _state: &DeviceState) {}
}

/// Handle returned by [`ListenerBus::add`], used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    // Sorted by id, which is also registration order
    listeners: Vec<(ListenerId, Arc<dyn LedControlListener>)>,
}

#[derive(Default)]
pub struct ListenerBus {
    registry: Mutex<Registry>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn LedControlListener>) -> ListenerId {
        let mut registry = self.registry();
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry.listeners.push((id, listener));
        id
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut registry = self.registry();
        let before = registry.listeners.len();
        registry.listeners.retain(|(existing, _)| *existing != id);
        registry.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.registry().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit_connection_state(&self, state: ConnectionState) {
        self.for_each(|listener| listener.on_connection_state_change(state));
    }

    pub fn emit_device_state(&self, state: &DeviceState) {
        self.for_each(|listener| listener.on_device_state_change(state));
    }

    /// Walk the registry one listener at a time without holding the lock
    /// during the callback, so callbacks can add or remove listeners.
    fn for_each(&self, mut deliver: impl FnMut(&dyn LedControlListener)) {
        let mut last: Option<ListenerId> = None;
        loop {
            let next = {
                let registry = self.registry();
                registry
                    .listeners
                    .iter()
                    .find(|(id, _)| last.map_or(true, |last| *id > last))
                    .map(|(id, listener)| (*id, Arc::clone(listener)))
            };

            let Some((id, listener)) = next else {
                break;
            };
            last = Some(id);
            deliver(listener.as_ref());
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
