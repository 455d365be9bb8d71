//! Edge-keyed agenda for the LCFRS parser.
//!
//! A thin layer over [`priority_queue::PriorityQueue`] (a binary heap with
//! a position map, giving O(1) membership and O(log n) priority changes),
//! keyed by chart item and ordered by edge score, lowest first. Ties are
//! broken first-in-first-out via a running sequence number so that pops
//! stay deterministic.

use std::cmp::{Ordering, Reverse};

use ordered_float::OrderedFloat;
use priority_queue::PriorityQueue;

use crate::item::{ChartItem, Edge, SpanVec};

/// Heap payload: the best known edge for an item plus its insertion rank.
#[derive(Clone, Copy, Debug)]
struct Entry<V: SpanVec> {
    edge: Edge<V>,
    seq: u64,
}

impl<V: SpanVec> Entry<V> {
    fn key(&self) -> (OrderedFloat<f64>, u64) {
        (OrderedFloat(self.edge.score), self.seq)
    }
}

impl<V: SpanVec> PartialEq for Entry<V> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<V: SpanVec> Eq for Entry<V> {}

impl<V: SpanVec> PartialOrd for Entry<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V: SpanVec> Ord for Entry<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Min-priority queue of chart items keyed by edge score, with
/// decrease-key and set-if-better.
pub struct Agenda<V: SpanVec> {
    queue: PriorityQueue<ChartItem<V>, Reverse<Entry<V>>>,
    seq: u64,
}

impl<V: SpanVec> Default for Agenda<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: SpanVec> Agenda<V> {
    pub fn new() -> Self {
        Agenda {
            queue: PriorityQueue::new(),
            seq: 0,
        }
    }

    fn entry(&mut self, edge: Edge<V>) -> Reverse<Entry<V>> {
        self.seq += 1;
        Reverse(Entry {
            edge,
            seq: self.seq,
        })
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether an entry for `item` is queued.
    #[inline]
    pub fn contains(&self, item: &ChartItem<V>) -> bool {
        self.queue.get_priority(item).is_some()
    }

    /// The queued edge for `item`, if any.
    #[inline]
    pub fn edge(&self, item: &ChartItem<V>) -> Option<Edge<V>> {
        self.queue.get_priority(item).map(|Reverse(e)| e.edge)
    }

    /// Insert `item`, or replace its queued edge unconditionally.
    pub fn set(&mut self, item: ChartItem<V>, edge: Edge<V>) {
        let entry = self.entry(edge);
        self.queue.push(item, entry);
    }

    /// Replace the queued edge only if the new score is strictly lower;
    /// inserts when absent.
    pub fn set_if_better(&mut self, item: ChartItem<V>, edge: Edge<V>) {
        let entry = self.entry(edge);
        self.queue.push_increase(item, entry);
    }

    /// Decrease-key: replace the queued edge, returning the one displaced.
    /// The caller is responsible for having compared the two beforehand.
    pub fn replace(&mut self, item: ChartItem<V>, edge: Edge<V>) -> Option<Edge<V>> {
        let entry = self.entry(edge);
        self.queue
            .change_priority(&item, entry)
            .map(|Reverse(e)| e.edge)
    }

    /// Remove and return the lowest-scored entry.
    pub fn pop(&mut self) -> Option<(ChartItem<V>, Edge<V>)> {
        self.queue.pop().map(|(item, Reverse(e))| (item, e.edge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::NO_RULE;

    fn item(label: u32, vec: u64) -> ChartItem<u64> {
        ChartItem::new(label, vec)
    }

    fn edge(score: f64, inside: f64) -> Edge<u64> {
        Edge {
            score,
            inside,
            prob: inside,
            rule_no: NO_RULE,
            left: ChartItem::none(),
            right: ChartItem::none(),
        }
    }

    #[test]
    fn test_pop_order() {
        let mut agenda: Agenda<u64> = Agenda::new();
        agenda.set(item(1, 0b01), edge(3.0, 3.0));
        agenda.set(item(2, 0b10), edge(1.0, 1.0));
        agenda.set(item(3, 0b11), edge(2.0, 2.0));
        let order: Vec<u32> = std::iter::from_fn(|| agenda.pop())
            .map(|(i, _)| i.label)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_fifo_on_ties() {
        let mut agenda: Agenda<u64> = Agenda::new();
        agenda.set(item(1, 0b01), edge(1.0, 1.0));
        agenda.set(item(2, 0b10), edge(1.0, 1.0));
        agenda.set(item(3, 0b11), edge(1.0, 1.0));
        let order: Vec<u32> = std::iter::from_fn(|| agenda.pop())
            .map(|(i, _)| i.label)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_replace_returns_displaced() {
        let mut agenda: Agenda<u64> = Agenda::new();
        let it = item(1, 0b01);
        agenda.set(it, edge(5.0, 5.0));
        let old = agenda.replace(it, edge(2.0, 2.0)).unwrap();
        assert_eq!(old.inside, 5.0);
        assert_eq!(agenda.len(), 1);
        let (_, popped) = agenda.pop().unwrap();
        assert_eq!(popped.inside, 2.0);
    }

    #[test]
    fn test_set_if_better() {
        let mut agenda: Agenda<u64> = Agenda::new();
        let it = item(1, 0b01);
        agenda.set(it, edge(5.0, 5.0));
        agenda.set_if_better(it, edge(7.0, 7.0));
        assert_eq!(agenda.edge(&it).unwrap().score, 5.0);
        agenda.set_if_better(it, edge(2.0, 2.0));
        assert_eq!(agenda.edge(&it).unwrap().score, 2.0);
        assert_eq!(agenda.len(), 1);
    }

    #[test]
    fn test_membership() {
        let mut agenda: Agenda<u64> = Agenda::new();
        let it = item(1, 0b01);
        assert!(!agenda.contains(&it));
        agenda.set(it, edge(1.0, 1.0));
        assert!(agenda.contains(&it));
        agenda.pop();
        assert!(!agenda.contains(&it));
    }
}
