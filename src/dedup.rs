//! Process-wide dedup guard for ingested content hashes.

use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Insert-if-absent set shared across export and ingest activity
pub trait DedupGuard: Send + Sync {
    /// Record `hash`; returns `false` if it was already present
    fn insert_if_absent(&self, hash: i64) -> bool;

    /// Forget `hash`, e.g. when the write it guarded did not happen
    fn remove(&self, hash: i64);

    fn contains(&self, hash: i64) -> bool;
}

/// Bounded dedup set. Once capacity is exceeded the oldest hash is evicted,
/// so a record seen long ago may be admitted again.
pub struct BoundedDedup {
    seen: DashSet<i64>,
    order: Mutex<VecDeque<i64>>,
    capacity: usize,
}

impl BoundedDedup {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: DashSet::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl DedupGuard for BoundedDedup {
    fn insert_if_absent(&self, hash: i64) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }

        let mut order = self.order.lock();
        order.push_back(hash);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn remove(&self, hash: i64) {
        if self.seen.remove(&hash).is_some() {
            self.order.lock().retain(|h| *h != hash);
        }
    }

    fn contains(&self, hash: i64) -> bool {
        self.seen.contains(&hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_second_insert_is_rejected() {
        let dedup = BoundedDedup::new(10);
        assert!(dedup.insert_if_absent(7));
        assert!(!dedup.insert_if_absent(7));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_oldest_hash_is_evicted_past_capacity() {
        let dedup = BoundedDedup::new(2);
        dedup.insert_if_absent(1);
        dedup.insert_if_absent(2);
        dedup.insert_if_absent(3);

        assert!(!dedup.contains(1));
        assert!(dedup.contains(2));
        assert!(dedup.contains(3));
        assert!(dedup.insert_if_absent(1));
    }

    #[test]
    fn test_removed_hash_is_admitted_again() {
        let dedup = BoundedDedup::new(10);
        assert!(dedup.insert_if_absent(-3));
        dedup.remove(-3);

        assert!(!dedup.contains(-3));
        assert!(dedup.insert_if_absent(-3));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_concurrent_inserts_admit_each_hash_once() {
        let dedup = Arc::new(BoundedDedup::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                std::thread::spawn(move || (0..100i64).filter(|h| dedup.insert_if_absent(*h)).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(dedup.len(), 100);
    }
}
