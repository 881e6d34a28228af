// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::data_sender::Event;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub trait Prioritized {
    fn priority(&self) -> f32;
}

impl Prioritized for Event {
    fn priority(&self) -> f32 {
        self.priority
    }
}

// Heap order is reversed so the top is the lowest-priority event.
struct Lowest<T>(T);

impl<T: Prioritized> PartialEq for Lowest<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Prioritized> Eq for Lowest<T> {}

impl<T: Prioritized> PartialOrd for Lowest<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Prioritized> Ord for Lowest<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.priority().total_cmp(&self.0.priority())
    }
}

/// A bounded sample that keeps the highest-priority events offered to it
/// and counts every offer.
pub struct EventReservoir<T> {
    capacity: usize,
    seen: usize,
    heap: BinaryHeap<Lowest<T>>,
}

impl<T> std::fmt::Debug for EventReservoir<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReservoir")
            .field("capacity", &self.capacity)
            .field("seen", &self.seen)
            .field("len", &self.heap.len())
            .finish()
    }
}

impl<T: Prioritized> EventReservoir<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: 0,
            heap: BinaryHeap::with_capacity(capacity.min(4096)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns whether the event was kept.
    pub fn offer(&mut self, event: T) -> bool {
        self.seen += 1;
        self.insert(event)
    }

    fn insert(&mut self, event: T) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Lowest(event));
            return true;
        }
        match self.heap.peek() {
            Some(lowest) if lowest.0.priority() < event.priority() => {
                self.heap.pop();
                self.heap.push(Lowest(event));
                true
            }
            _ => false,
        }
    }

    /// Takes back a batch that could not be sent. Its events compete with the
    /// ones already kept and its offers still count as seen.
    pub fn absorb(&mut self, other: EventReservoir<T>) {
        let seen = other.seen;
        self.restore(seen, other.heap.into_vec().into_iter().map(|Lowest(e)| e));
    }

    /// Like [`EventReservoir::absorb`] for a batch already taken apart.
    pub fn restore(&mut self, seen: usize, events: impl IntoIterator<Item = T>) {
        self.seen += seen;
        for event in events {
            self.insert(event);
        }
    }

    /// Kept events, highest priority first.
    pub fn into_events(self) -> Vec<T> {
        let mut events: Vec<T> = self.heap.into_vec().into_iter().map(|Lowest(e)| e).collect();
        events.sort_by(|a, b| b.priority().total_cmp(&a.priority()));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priorities(reservoir: EventReservoir<Event>) -> Vec<f32> {
        reservoir.into_events().iter().map(|e| e.priority).collect()
    }

    #[test]
    fn keeps_highest_priorities() {
        let mut reservoir = EventReservoir::new(3);
        for priority in [0.5, 1.7, 0.1, 1.2, 0.9] {
            reservoir.offer(Event::new(priority));
        }
        assert_eq!(reservoir.seen(), 5);
        assert_eq!(reservoir.len(), 3);
        assert_eq!(priorities(reservoir), vec![1.7, 1.2, 0.9]);
    }

    #[test]
    fn zero_capacity_only_counts() {
        let mut reservoir = EventReservoir::new(0);
        assert!(!reservoir.offer(Event::new(1.0)));
        assert_eq!(reservoir.seen(), 1);
        assert!(reservoir.is_empty());
    }

    #[test]
    fn absorbed_batch_competes_for_room() {
        let mut current = EventReservoir::new(2);
        current.offer(Event::new(0.3));

        let mut failed = EventReservoir::new(2);
        failed.offer(Event::new(0.8));
        failed.offer(Event::new(0.1));
        failed.offer(Event::new(0.05));

        current.absorb(failed);
        assert_eq!(current.seen(), 4);
        assert_eq!(priorities(current), vec![0.8, 0.3]);
    }
}
