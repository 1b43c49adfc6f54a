//! Live sockets per connection id in this process.
//!
//! A tab that resumes its id after a network blip may briefly share the id with
//! the socket it replaces. Only the last socket to leave retires the row.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

#[derive(Clone, Default)]
pub struct SocketAttachments {
    inner: Arc<Mutex<HashMap<String, usize>>>,
}

impl SocketAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a socket for `connection_id`; returns how many are now attached.
    pub fn attach(&self, connection_id: &str) -> usize {
        let mut map = self.lock();
        let count = map.entry(connection_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Removes one socket for `connection_id`; returns how many remain.
    pub fn detach(&self, connection_id: &str) -> usize {
        let mut map = self.lock();
        let remaining = match map.get_mut(connection_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            map.remove(connection_id);
        }
        remaining
    }

    pub fn attached(&self, connection_id: &str) -> usize {
        self.lock().get(connection_id).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        // The map holds plain counters, so a poisoned lock is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
