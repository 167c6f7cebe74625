//! Per-tier eviction priority queue
//!
//! Ordered ascending by `(score, created_at, id)` so the least valuable and,
//! on ties, oldest record comes out first. Entries can go stale when a record
//! is rescored or accessed; `pop_min_validated` reconciles them lazily.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// f32 score with a total order
#[derive(Debug, Clone, Copy)]
pub struct Score(pub f32);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueEntry {
    pub score: Score,
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl QueueEntry {
    pub fn new(id: Uuid, score: f32, created_at: DateTime<Utc>) -> Self {
        Self {
            score: Score(score),
            created_at,
            id,
        }
    }

    pub fn score(&self) -> f32 {
        self.score.0
    }
}

#[derive(Debug, Default)]
pub struct EvictionPriorityQueue {
    ordered: BTreeSet<QueueEntry>,
    by_id: HashMap<Uuid, QueueEntry>,
}

impl EvictionPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or reposition a record
    pub fn insert(&mut self, id: Uuid, score: f32, created_at: DateTime<Utc>) {
        self.remove(&id);
        let entry = QueueEntry::new(id, score, created_at);
        self.ordered.insert(entry);
        self.by_id.insert(id, entry);
    }

    pub fn peek_min(&self) -> Option<&QueueEntry> {
        self.ordered.first()
    }

    pub fn pop_min(&mut self) -> Option<QueueEntry> {
        let entry = self.ordered.pop_first()?;
        self.by_id.remove(&entry.id);
        Some(entry)
    }

    /// Pop the lowest entry that still reflects its record.
    ///
    /// `current` returns the record's live score, or `None` if the record is
    /// gone or no longer eligible. Gone entries are dropped; entries whose
    /// score drifted by more than `tolerance` are reinserted at the live score.
    pub fn pop_min_validated<F>(&mut self, current: F, tolerance: f32) -> Option<QueueEntry>
    where
        F: Fn(&Uuid) -> Option<f32>,
    {
        while let Some(entry) = self.pop_min() {
            let Some(live) = current(&entry.id) else {
                continue;
            };
            if (live - entry.score()).abs() > tolerance {
                self.insert(entry.id, live, entry.created_at);
                continue;
            }
            return Some(entry);
        }
        None
    }

    pub fn remove(&mut self, id: &Uuid) -> bool {
        match self.by_id.remove(id) {
            Some(entry) => {
                self.ordered.remove(&entry);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_pops_in_ascending_score_order() {
        let mut queue = EvictionPriorityQueue::new();
        let now = Utc::now();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        queue.insert(ids[0], 0.7, now);
        queue.insert(ids[1], 0.2, now);
        queue.insert(ids[2], 0.5, now);

        assert_eq!(queue.pop_min().map(|e| e.id), Some(ids[1]));
        assert_eq!(queue.pop_min().map(|e| e.id), Some(ids[2]));
        assert_eq!(queue.pop_min().map(|e| e.id), Some(ids[0]));
        assert!(queue.pop_min().is_none());
    }

    #[test]
    fn test_ties_break_on_oldest_first() {
        let mut queue = EvictionPriorityQueue::new();
        let now = Utc::now();
        let newer = Uuid::new_v4();
        let older = Uuid::new_v4();

        queue.insert(newer, 0.4, now);
        queue.insert(older, 0.4, now - Duration::hours(1));

        assert_eq!(queue.peek_min().map(|e| e.id), Some(older));
    }

    #[test]
    fn test_insert_replaces_existing_entry() {
        let mut queue = EvictionPriorityQueue::new();
        let now = Utc::now();
        let id = Uuid::new_v4();

        queue.insert(id, 0.1, now);
        queue.insert(id, 0.9, now);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_min().map(|e| e.score()), Some(0.9));
    }

    #[test]
    fn test_remove_and_contains() {
        let mut queue = EvictionPriorityQueue::new();
        let id = Uuid::new_v4();
        queue.insert(id, 0.3, Utc::now());

        assert!(queue.contains(&id));
        assert!(queue.remove(&id));
        assert!(!queue.contains(&id));
        assert!(!queue.remove(&id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_validated_pop_drops_gone_and_reorders_drifted() {
        let mut queue = EvictionPriorityQueue::new();
        let now = Utc::now();
        let gone = Uuid::new_v4();
        let drifted = Uuid::new_v4();
        let steady = Uuid::new_v4();

        queue.insert(gone, 0.1, now);
        queue.insert(drifted, 0.2, now);
        queue.insert(steady, 0.3, now);

        let live = |id: &Uuid| {
            if *id == gone {
                None
            } else if *id == drifted {
                Some(0.8)
            } else {
                Some(0.3)
            }
        };

        let first = queue.pop_min_validated(live, 0.01).expect("entry");
        assert_eq!(first.id, steady);

        let second = queue.pop_min_validated(live, 0.01).expect("entry");
        assert_eq!(second.id, drifted);
        assert!((second.score() - 0.8).abs() < 1e-6);

        assert!(queue.pop_min_validated(live, 0.01).is_none());
    }

    #[test]
    fn test_nan_scores_do_not_break_ordering() {
        let mut queue = EvictionPriorityQueue::new();
        let now = Utc::now();
        queue.insert(Uuid::new_v4(), f32::NAN, now);
        queue.insert(Uuid::new_v4(), 0.5, now);
        assert_eq!(queue.len(), 2);
        assert!(queue.pop_min().is_some());
        assert!(queue.pop_min().is_some());
    }
}
