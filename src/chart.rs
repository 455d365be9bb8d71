//! Packed parse chart for the LCFRS parser.
//!
//! The chart maps each discovered item to the list of edges (derivations)
//! found for it, and keeps a per-label Viterbi index holding the best edge
//! of every admitted item. Items enter the map as soon as they are queued
//! on the agenda (with an empty edge list); they are admitted — best edge
//! appended and recorded in the Viterbi index — when popped.

use rustc_hash::FxHashMap;

use crate::item::{ChartItem, Edge, SpanVec};

/// Chart of derivations plus the per-label Viterbi index.
pub struct Chart<V: SpanVec> {
    items: FxHashMap<ChartItem<V>, Vec<Edge<V>>>,
    viterbi: Vec<FxHashMap<ChartItem<V>, Edge<V>>>,
}

impl<V: SpanVec> Chart<V> {
    pub fn new(nonterminals: usize) -> Self {
        Chart {
            items: FxHashMap::default(),
            viterbi: vec![FxHashMap::default(); nonterminals],
        }
    }

    /// Whether `item` has been discovered (queued or admitted).
    #[inline]
    pub fn contains(&self, item: &ChartItem<V>) -> bool {
        self.items.contains_key(item)
    }

    /// Register a discovered item with no derivations yet.
    pub fn reserve(&mut self, item: ChartItem<V>) {
        self.items.entry(item).or_default();
    }

    /// Append a derivation for `item`.
    pub fn add_edge(&mut self, item: ChartItem<V>, edge: Edge<V>) {
        self.items.entry(item).or_default().push(edge);
    }

    /// Admit a popped item: append its edge and record it as the Viterbi
    /// edge for the item.
    pub fn admit(&mut self, item: ChartItem<V>, edge: Edge<V>) {
        self.add_edge(item, edge);
        self.viterbi[item.label as usize].insert(item, edge);
    }

    /// All derivations found for `item`.
    pub fn edges(&self, item: &ChartItem<V>) -> &[Edge<V>] {
        self.items.get(item).map_or(&[], |v| v.as_slice())
    }

    /// The best edge of an admitted item.
    #[inline]
    pub fn viterbi_edge(&self, item: &ChartItem<V>) -> Option<&Edge<V>> {
        self.viterbi[item.label as usize].get(item)
    }

    /// Admitted items with the given label, paired with their best edges.
    pub fn label_items(&self, label: u32) -> impl Iterator<Item = (&ChartItem<V>, &Edge<V>)> {
        self.viterbi[label as usize].iter()
    }

    /// All discovered items and their derivation lists.
    pub fn iter(&self) -> impl Iterator<Item = (&ChartItem<V>, &Vec<Edge<V>>)> {
        self.items.iter()
    }

    /// Items with at least one derivation.
    pub fn item_count(&self) -> usize {
        self.items.values().filter(|v| !v.is_empty()).count()
    }

    /// Labels with at least one admitted item.
    pub fn label_count(&self) -> usize {
        self.viterbi.iter().filter(|m| !m.is_empty()).count()
    }

    /// Total number of edges in the chart.
    pub fn edge_count(&self) -> usize {
        self.items.values().map(|v| v.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::NO_RULE;

    fn edge(inside: f64) -> Edge<u64> {
        Edge {
            score: inside,
            inside,
            prob: inside,
            rule_no: NO_RULE,
            left: ChartItem::none(),
            right: ChartItem::none(),
        }
    }

    #[test]
    fn test_reserve_then_admit() {
        let mut chart: Chart<u64> = Chart::new(4);
        let it = ChartItem::new(2, 0b11u64);
        chart.reserve(it);
        assert!(chart.contains(&it));
        assert!(chart.viterbi_edge(&it).is_none());
        assert_eq!(chart.item_count(), 0);

        chart.admit(it, edge(1.5));
        assert_eq!(chart.viterbi_edge(&it).unwrap().inside, 1.5);
        assert_eq!(chart.item_count(), 1);
        assert_eq!(chart.label_count(), 1);
        assert_eq!(chart.edge_count(), 1);
    }

    #[test]
    fn test_suboptimal_edges_accumulate() {
        let mut chart: Chart<u64> = Chart::new(4);
        let it = ChartItem::new(1, 0b01u64);
        chart.admit(it, edge(1.0));
        chart.add_edge(it, edge(2.0));
        assert_eq!(chart.edges(&it).len(), 2);
        assert_eq!(chart.viterbi_edge(&it).unwrap().inside, 1.0);
    }

    #[test]
    fn test_label_items() {
        let mut chart: Chart<u64> = Chart::new(4);
        chart.admit(ChartItem::new(1, 0b01u64), edge(1.0));
        chart.admit(ChartItem::new(1, 0b10u64), edge(2.0));
        chart.admit(ChartItem::new(2, 0b11u64), edge(3.0));
        assert_eq!(chart.label_items(1).count(), 2);
        assert_eq!(chart.label_items(2).count(), 1);
        assert_eq!(chart.label_items(3).count(), 0);
    }
}
