//! Lazy k-best derivation extraction over a finished chart.
//!
//! Implements the lazy enumeration of Huang & Chiang (2005): for each
//! vertex, a ranked list `D` of extracted derivations grows on demand from
//! a candidate heap `cand`, and popping the j-th derivation pushes only the
//! successors of the (j-1)-th — each child rank bumped by one — so the
//! chart is never unpacked further than the ranking requires. A global
//! `explored` set keeps a ranked edge from entering a heap twice.
//!
//! Derivations are emitted as bracketed tree strings with terminals
//! rendered as input positions; labels carrying a debinarization marker
//! are spliced into their parent.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::chart::Chart;
use crate::grammar::Grammar;
use crate::item::{ChartItem, Edge, SpanVec};

/// Recursion cap guarding against malformed charts.
const MAX_DEPTH: usize = 100;

/// A derivation of `head` via `edge`, using the `left`-th best derivation
/// of the left child and the `right`-th of the right child (-1 when the
/// edge has no right child).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RankedEdge<V: SpanVec> {
    pub head: ChartItem<V>,
    pub edge: Edge<V>,
    pub left: i32,
    pub right: i32,
}

/// A ranked edge with its evaluated derivation cost, ordered by cost.
#[derive(Clone, Copy, Debug)]
struct RankedEntry<V: SpanVec> {
    prob: OrderedFloat<f64>,
    re: RankedEdge<V>,
}

impl<V: SpanVec> RankedEntry<V> {
    fn key(&self) -> (OrderedFloat<f64>, u32, i32, i32, u32) {
        (
            self.prob,
            self.re.edge.rule_no,
            self.re.left,
            self.re.right,
            self.re.edge.left.label,
        )
    }
}

impl<V: SpanVec> PartialEq for RankedEntry<V> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<V: SpanVec> Eq for RankedEntry<V> {}

impl<V: SpanVec> PartialOrd for RankedEntry<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V: SpanVec> Ord for RankedEntry<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct KBest<'a, V: SpanVec> {
    chart: &'a Chart<V>,
    grammar: &'a Grammar,
    /// Global k: how far any vertex may ever be unpacked.
    k: usize,
    d: FxHashMap<ChartItem<V>, Vec<RankedEntry<V>>>,
    cand: FxHashMap<ChartItem<V>, BinaryHeap<Reverse<RankedEntry<V>>>>,
    explored: FxHashSet<RankedEdge<V>>,
}

impl<'a, V: SpanVec> KBest<'a, V> {
    fn new(chart: &'a Chart<V>, grammar: &'a Grammar, k: usize) -> Self {
        KBest {
            chart,
            grammar,
            k,
            d: FxHashMap::default(),
            cand: FxHashMap::default(),
            explored: FxHashSet::default(),
        }
    }

    /// Ensure the `k` best derivations of `v` are in `D[v]`, or as many as
    /// exist.
    fn lazy_kth_best(&mut self, v: ChartItem<V>, k: usize) {
        if !self.cand.contains_key(&v) {
            // seed with the k best edges of the vertex
            let mut edges = self.chart.edges(&v).to_vec();
            edges.sort_by_key(|edge| OrderedFloat(edge.inside));
            edges.truncate(self.k);
            let heap: BinaryHeap<Reverse<RankedEntry<V>>> = edges
                .into_iter()
                .map(|edge| {
                    Reverse(RankedEntry {
                        prob: OrderedFloat(edge.inside),
                        re: RankedEdge {
                            head: v,
                            edge,
                            left: 0,
                            right: if edge.is_binary() { 0 } else { -1 },
                        },
                    })
                })
                .collect();
            self.cand.insert(v, heap);
            self.d.entry(v).or_default();
        }
        while self.d.get(&v).map_or(0, |d| d.len()) < k {
            if let Some(last) = self.d.get(&v).and_then(|d| d.last().copied()) {
                self.lazy_next(last);
            }
            match self.cand.get_mut(&v).and_then(|heap| heap.pop()) {
                Some(Reverse(entry)) => self.d.entry(v).or_default().push(entry),
                None => break,
            }
        }
    }

    /// Push the successors of an extracted ranked edge onto its head's
    /// candidate heap.
    fn lazy_next(&mut self, entry: RankedEntry<V>) {
        let re = entry.re;
        for side in 0..2 {
            let (child, succ) = if side == 0 {
                (re.edge.left, RankedEdge { left: re.left + 1, ..re })
            } else if re.right >= 0 {
                (re.edge.right, RankedEdge { right: re.right + 1, ..re })
            } else {
                break;
            };
            if !self.chart.contains(&child) {
                continue;
            }
            let newrank = (if side == 0 { succ.left } else { succ.right }) as usize;
            self.lazy_kth_best(child, newrank + 1);
            if newrank < self.d.get(&child).map_or(0, |d| d.len())
                && !self.explored.contains(&succ)
            {
                if let Some(prob) = self.get_prob(&succ) {
                    self.cand
                        .entry(re.head)
                        .or_default()
                        .push(Reverse(RankedEntry {
                            prob: OrderedFloat(prob),
                            re: succ,
                        }));
                    self.explored.insert(succ);
                }
            }
        }
    }

    /// Cost of a ranked derivation: the edge's own rule cost plus the
    /// children's costs at the requested ranks. Ranks beyond zero must
    /// already be extracted.
    fn get_prob(&self, re: &RankedEdge<V>) -> Option<f64> {
        let mut prob = re.edge.prob;
        let sides = [(re.edge.left, re.left), (re.edge.right, re.right)];
        for (child, rank) in sides {
            if rank < 0 || !self.chart.contains(&child) {
                continue;
            }
            if let Some(entry) = self.d.get(&child).and_then(|d| d.get(rank as usize)) {
                prob += entry.prob.0;
            } else if rank == 0 {
                prob += self.chart.viterbi_edge(&child)?.inside;
            } else {
                return None;
            }
        }
        Some(prob)
    }

    /// Materialize every ranked edge a derivation depends on; false when a
    /// non-zero rank is missing (the derivation is skipped).
    fn explore(&mut self, re: RankedEdge<V>, depth: usize) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        let sides = [(re.edge.left, re.left), (re.edge.right, re.right)];
        for (child, rank) in sides {
            if rank < 0 || !self.chart.contains(&child) {
                continue;
            }
            if self.d.get(&child).map_or(0, |d| d.len()) <= rank as usize {
                if rank == 0 {
                    self.lazy_kth_best(child, 1);
                } else {
                    return false;
                }
            }
            let entry = match self.d.get(&child).and_then(|d| d.get(rank as usize)) {
                Some(entry) => *entry,
                None => return false,
            };
            if !self.explore(entry.re, depth + 1) {
                return false;
            }
        }
        true
    }

    /// Render a ranked derivation as a bracketed tree string.
    fn derivation(&self, re: &RankedEdge<V>, depth: usize, debin: Option<&str>) -> Option<String> {
        if depth > MAX_DEPTH {
            return None;
        }
        let mut children: Vec<String> = Vec::new();
        let sides = [(re.edge.left, re.left), (re.edge.right, re.right)];
        for (child, rank) in sides {
            if rank < 0 {
                continue;
            }
            if self.chart.contains(&child) {
                let entry = self.d.get(&child)?.get(rank as usize)?;
                children.push(self.derivation(&entry.re, depth + 1, debin)?);
            } else {
                // terminal: the input position stored in the backpointer
                children.push(child.vec.as_index().to_string());
            }
        }
        let label = self.grammar.tolabel(re.head.label);
        match debin {
            Some(marker) if label.contains(marker) => Some(children.join(" ")),
            _ => Some(format!("({} {})", label, children.join(" "))),
        }
    }
}

/// The `k` best derivations of `goal`, best first, as `(tree, cost)`
/// pairs. Labels containing `debin` are spliced out of the output trees.
pub fn lazykbest<V: SpanVec>(
    chart: &Chart<V>,
    goal: ChartItem<V>,
    k: usize,
    grammar: &Grammar,
    debin: Option<&str>,
) -> Vec<(String, f64)> {
    let mut kbest = KBest::new(chart, grammar, k);
    kbest.lazy_kth_best(goal, k);
    let entries: Vec<RankedEntry<V>> = kbest.d.get(&goal).cloned().unwrap_or_default();
    let mut derivations = Vec::with_capacity(entries.len());
    for entry in entries {
        if !kbest.explore(entry.re, 0) {
            continue;
        }
        if let Some(tree) = kbest.derivation(&entry.re, 0, debin) {
            derivations.push((tree, entry.prob.0));
        }
    }
    derivations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse, parse_spans, ParseOptions, ParseResult};

    const LN2: f64 = std::f64::consts::LN_2;

    fn exhaustive_parse(sent: &[&str], grammar: &Grammar) -> ParseResult<u64> {
        let mut opts = ParseOptions::<u64>::new(grammar.toid("S").unwrap());
        opts.exhaustive = true;
        parse_spans(sent, grammar, &opts)
    }

    fn german() -> Grammar {
        Grammar::builder()
            .binary("S", "VP2", "VMFIN", &[&[0, 1, 0]], 1.0)
            .binary("VP2", "VP2", "VAINF", &[&[0], &[0, 1]], 1.0)
            .binary("VP2", "PROAV", "VVPP", &[&[0], &[1]], 0.5)
            .lex("Daruber", "PROAV", 1.0)
            .lex("muss", "VMFIN", 1.0)
            .lex("nachgedacht", "VVPP", 1.0)
            .lex("werden", "VAINF", 1.0)
            .build()
            .unwrap()
    }

    fn ambiguous() -> Grammar {
        Grammar::builder()
            .unary("S", "A", 0.5)
            .binary("S", "S", "S", &[&[0, 1]], 0.25)
            .lex("a", "A", 1.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_best_is_viterbi_derivation() {
        let g = german();
        let sent = ["Daruber", "muss", "nachgedacht", "werden"];
        let result = exhaustive_parse(&sent, &g);
        let goal = result.goal.unwrap();
        let derivations = lazykbest(&result.chart, goal, 1, &g, None);
        assert_eq!(derivations.len(), 1);
        let (tree, prob) = &derivations[0];
        assert_eq!(
            tree,
            "(S (VP2 (VP2 (PROAV 0) (VVPP 2)) (VAINF 3)) (VMFIN 1))"
        );
        assert!((prob - result.viterbi_inside().unwrap()).abs() < 1e-12);
        assert!((prob - LN2).abs() < 1e-12);
    }

    #[test]
    fn test_enumerates_all_derivations() {
        let g = ambiguous();
        let result = exhaustive_parse(&["a", "a", "a"], &g);
        let goal = result.goal.unwrap();
        let derivations = lazykbest(&result.chart, goal, 10, &g, None);
        assert_eq!(derivations.len(), 2);
        let expected = 7.0 * LN2; // three unary steps, two binary steps
        for (_, prob) in &derivations {
            assert!((prob - expected).abs() < 1e-9);
        }
        let trees: Vec<&str> = derivations.iter().map(|(t, _)| t.as_str()).collect();
        assert!(trees.contains(&"(S (S (S (A 0)) (S (A 1))) (S (A 2)))"));
        assert!(trees.contains(&"(S (S (A 0)) (S (S (A 1)) (S (A 2))))"));
    }

    #[test]
    fn test_sorted_without_duplicates() {
        let g = ambiguous();
        let result = exhaustive_parse(&["a", "a", "a", "a"], &g);
        let goal = result.goal.unwrap();
        let derivations = lazykbest(&result.chart, goal, 20, &g, None);
        // five bracketings of four tokens
        assert_eq!(derivations.len(), 5);
        for pair in derivations.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
        let mut trees: Vec<&str> = derivations.iter().map(|(t, _)| t.as_str()).collect();
        trees.sort_unstable();
        trees.dedup();
        assert_eq!(trees.len(), 5);
    }

    #[test]
    fn test_k_truncates() {
        let g = ambiguous();
        let result = exhaustive_parse(&["a", "a", "a", "a"], &g);
        let goal = result.goal.unwrap();
        assert_eq!(lazykbest(&result.chart, goal, 3, &g, None).len(), 3);
    }

    #[test]
    fn test_debinarization_splice() {
        let g = Grammar::builder()
            .binary("S", "NP", "VP|<V-NP>", &[&[0, 1]], 1.0)
            .binary("VP|<V-NP>", "V", "NP", &[&[0, 1]], 1.0)
            .lex("mary", "NP", 1.0)
            .lex("saw", "V", 1.0)
            .lex("john", "NP", 1.0)
            .build()
            .unwrap();
        let result = exhaustive_parse(&["mary", "saw", "john"], &g);
        let goal = result.goal.unwrap();
        let plain = lazykbest(&result.chart, goal, 1, &g, None);
        assert_eq!(plain[0].0, "(S (NP 0) (VP|<V-NP> (V 1) (NP 2)))");
        let spliced = lazykbest(&result.chart, goal, 1, &g, Some("|<"));
        assert_eq!(spliced[0].0, "(S (NP 0) (V 1) (NP 2))");
    }

    #[test]
    fn test_outcome_convenience() {
        let g = german();
        let sent = ["Daruber", "muss", "nachgedacht", "werden"];
        let outcome = parse(&sent, &g, g.toid("S").unwrap(), None, true);
        let derivations = outcome.kbest(2, &g, None);
        assert_eq!(derivations.len(), 1);
        assert!((derivations[0].1 - LN2).abs() < 1e-12);
    }

    #[test]
    fn test_costs_reproduce_insides() {
        // every reported cost re-derives from the rule costs along its tree
        let g = ambiguous();
        let result = exhaustive_parse(&["a", "a", "a"], &g);
        let goal = result.goal.unwrap();
        for (tree, prob) in lazykbest(&result.chart, goal, 10, &g, None) {
            let unaries = tree.matches("(S (A").count();
            let total = tree.matches("(S").count();
            let binaries = total - unaries;
            let expected = unaries as f64 * LN2 + binaries as f64 * (4.0f64).ln();
            assert!((prob - expected).abs() < 1e-9, "{tree}: {prob}");
        }
    }
}
