use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};
use uuid::Uuid;

/// In-flight correlation ids. Diagnostics only.
#[derive(Debug, Clone, Default)]
pub struct CorrelationTracker {
    live: Arc<Mutex<HashSet<String>>>,
}

impl CorrelationTracker {
    /// Register a fresh id. It is removed when the guard drops, including on error or when
    /// the request future is dropped.
    pub fn begin(&self) -> CorrelationGuard {
        let id = Uuid::new_v4().to_string();
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        CorrelationGuard {
            id,
            live: Arc::clone(&self.live),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug)]
pub struct CorrelationGuard {
    id: String,
    live: Arc<Mutex<HashSet<String>>>,
}

impl CorrelationGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for CorrelationGuard {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_released() {
        let t = CorrelationTracker::default();
        let a = t.begin();
        let b = t.begin();
        assert_ne!(a.id(), b.id());
        assert_eq!(t.in_flight(), 2);
        drop(a);
        assert_eq!(t.in_flight(), 1);
        drop(b);
        assert_eq!(t.in_flight(), 0);
    }
}
