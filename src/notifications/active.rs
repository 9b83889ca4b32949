//! The process-wide set of live notification handles.
//!
//! Notifications are registered at lower levels (controllers) and addressed
//! from higher ones (containers); this registry is what connects the two.
//! The listener consults it before every delivery so that an unregistered
//! handle stops routing without tearing anything else down.

use std::collections::HashSet;
use std::sync::Mutex;

/// Opaque identifier for a live notification registration. Handles are
/// process-unique and never reused.
pub type Handle = u64;

#[derive(Debug, Default)]
struct Inner {
    next_id: Handle,
    active: HashSet<Handle>,
}

/// Thread-safe set of active notification handles.
#[derive(Debug, Default)]
pub struct ActiveNotifications {
    inner: Mutex<Inner>,
}

impl ActiveNotifications {
    /// Adds a new active notification and returns its unique handle. Each
    /// handle is strictly greater than every previously issued one.
    pub fn add(&self) -> Handle {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.active.insert(id);
        id
    }

    /// Removes a notification from the active set. Returns true exactly once
    /// per successfully added handle.
    pub fn remove(&self, id: Handle) -> bool {
        self.inner.lock().unwrap().active.remove(&id)
    }

    /// Whether the given notification is still active.
    pub fn contains(&self, id: Handle) -> bool {
        self.inner.lock().unwrap().active.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
