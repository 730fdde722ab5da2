//! Pending-event buffer
//!
//! Producers append under a mutex. The consumer drains without blocking: if the
//! lock is busy it gets an empty batch and tries again on its next tick.

use super::events::Event;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

/// Type alias for event callback functions
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Thread-safe, append-only store of events waiting to be shipped
pub struct EventBuffer {
    events: Mutex<Vec<Event>>,
    on_append_callback: Option<EventCallback>,
}

impl EventBuffer {
    /// Create a new event buffer
    ///
    /// # Arguments
    ///
    /// * `on_append_callback` - Optional callback invoked for every appended event
    pub fn new(on_append_callback: Option<EventCallback>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            on_append_callback,
        }
    }

    /// Append one event
    pub fn append(&self, event: Event) {
        if let Some(callback) = &self.on_append_callback {
            callback(&event);
        }

        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.push(event);
    }

    /// Append a batch of events, typically one that failed to send
    pub fn append_batch(&self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }

        if let Some(callback) = &self.on_append_callback {
            batch.iter().for_each(|event| callback(event));
        }

        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.extend(batch);
    }

    /// Take every pending event
    ///
    /// Never blocks: returns an empty batch when another thread holds the lock.
    pub fn drain_batch(&self) -> Vec<Event> {
        match self.events.try_lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(TryLockError::Poisoned(poisoned)) => std::mem::take(&mut *poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Vec::new(),
        }
    }

    /// Copy of the pending events, oldest first
    pub fn pending(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drop every pending event
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Get the number of pending events
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(None)
    }
}
