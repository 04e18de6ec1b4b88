//! In-memory priority queue of pending behavior events.
//!
//! Ordering: priority descending, then `queued_at` ascending, then
//! insertion order. An event id is held at most once.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use uuid::Uuid;

use crate::event::BehaviorEvent;

struct Entry {
    seq: u64,
    event: BehaviorEvent,
}

impl Entry {
    fn key(&self) -> (u8, Reverse<u64>, Reverse<u64>) {
        (
            self.event.priority(),
            Reverse(self.event.queued_at()),
            Reverse(self.seq),
        )
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    ids: HashSet<Uuid>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending event. Terminal or already-queued events are refused.
    pub fn push(&mut self, event: BehaviorEvent) -> bool {
        if event.state().is_terminal() || !self.ids.insert(event.id()) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { seq, event });
        true
    }

    /// Remove the next event in dispatch order.
    pub fn pop(&mut self) -> Option<BehaviorEvent> {
        let entry = self.heap.pop()?;
        self.ids.remove(&entry.event.id());
        Some(entry.event)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &Uuid> {
        self.ids.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineId;
    use crate::event::{BehaviorAction, EngineAttempt, EventDraft};

    fn event(action: BehaviorAction, engines: &[EngineId], queued_at: u64) -> BehaviorEvent {
        BehaviorEvent::new(
            EventDraft {
                action: Some(action),
                user_id: 1,
                target_engines: engines.iter().copied().collect(),
                ..Default::default()
            },
            queued_at,
        )
        .unwrap()
    }

    fn take(q: &mut PriorityQueue, n: usize) -> Vec<BehaviorEvent> {
        std::iter::from_fn(|| q.pop()).take(n).collect()
    }

    #[test]
    fn test_priority_then_age_order() {
        let mut q = PriorityQueue::new();
        q.push(event(BehaviorAction::UserActivity, &[EngineId::Archer], 1));
        q.push(event(BehaviorAction::ArtworkCreated, &[EngineId::Huraii], 9));
        q.push(event(BehaviorAction::PurchaseCompleted, &[EngineId::Cloe], 5));
        q.push(event(BehaviorAction::PurchaseCompleted, &[EngineId::Cloe], 3));

        let order: Vec<_> = take(&mut q, 10)
            .iter()
            .map(|e| (e.priority(), e.queued_at()))
            .collect();
        assert_eq!(order, vec![(10, 9), (8, 3), (8, 5), (5, 1)]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut q = PriorityQueue::new();
        let a = event(BehaviorAction::PageView, &[EngineId::Archer], 7);
        let b = event(BehaviorAction::PageView, &[EngineId::Archer], 7);
        let (ida, idb) = (a.id(), b.id());
        q.push(a);
        q.push(b);
        let ids: Vec<_> = take(&mut q, 2).iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![ida, idb]);
    }

    #[test]
    fn test_pop_releases_id() {
        let mut q = PriorityQueue::new();
        for t in 0..3 {
            q.push(event(BehaviorAction::PageView, &[EngineId::Archer], t));
        }
        let first = q.pop().unwrap();
        assert_eq!(q.len(), 2);
        assert!(!q.contains(&first.id()));
        assert_eq!(q.ids().count(), 2);
        assert!(q.push(first));
        assert_eq!(take(&mut q, 5).len(), 3);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_refuses_duplicates_and_terminal_events() {
        let mut q = PriorityQueue::new();
        let ev = event(BehaviorAction::PageView, &[EngineId::Archer], 0);
        assert!(q.push(ev.clone()));
        assert!(!q.push(ev.clone()));
        assert!(q.contains(&ev.id()));
        assert_eq!(q.len(), 1);

        let mut done = event(BehaviorAction::PageView, &[EngineId::Archer], 0);
        done.settle(&[(EngineId::Archer, EngineAttempt::Accepted)]);
        assert!(!q.push(done));
        assert_eq!(q.len(), 1);
    }
}
