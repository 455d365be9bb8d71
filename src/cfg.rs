//! Dense CKY parser for the context-free special case.
//!
//! When every yield function is plain concatenation, items reduce to
//! `(label, left, right)` triples and the chart becomes a triangular table
//! with a dense Viterbi matrix. The binary loop is filtered by four
//! split-extent matrices recording, per label, the smallest and largest
//! boundary at which the label has been derived from a given position, so
//! only split points that can possibly combine are visited. Unary rules
//! are closed per cell with a small priority queue, popping cheapest
//! first; closure terminates because every improvement strictly lowers a
//! Viterbi cost.

use std::cmp::Reverse;

use ordered_float::OrderedFloat;
use priority_queue::PriorityQueue;
use rustc_hash::FxHashMap;

use crate::grammar::{Grammar, Label, NO_RULE};
use crate::parse::tag_matches;

/// A `(label, left, right)` triple identifying a CFG chart cell entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CfgItem {
    pub label: Label,
    pub left: u16,
    pub right: u16,
}

/// One derivation of a cell entry. `mid` is the split point for binary
/// edges and equals `right` for unary and lexical edges.
#[derive(Clone, Copy, Debug)]
pub struct CfgEdge {
    pub inside: f64,
    pub prob: f64,
    pub rule_no: u32,
    pub mid: u16,
}

/// Triangular chart of derivations plus the dense Viterbi matrix.
pub struct CfgChart {
    n: usize,
    cells: Vec<Vec<FxHashMap<Label, Vec<CfgEdge>>>>,
    viterbi: Vec<f64>,
}

impl CfgChart {
    fn new(n: usize, nonterminals: usize) -> Self {
        CfgChart {
            n,
            cells: vec![vec![FxHashMap::default(); n + 1]; n],
            viterbi: vec![f64::INFINITY; nonterminals * n * (n + 1)],
        }
    }

    /// Sentence length this chart was built for.
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    fn index(&self, label: Label, left: usize, right: usize) -> usize {
        (label as usize * self.n + left) * (self.n + 1) + right
    }

    /// Viterbi cost of `label` over `[left, right)`; `+inf` when underived.
    #[inline]
    pub fn viterbi(&self, label: Label, left: usize, right: usize) -> f64 {
        self.viterbi[self.index(label, left, right)]
    }

    #[inline]
    fn set_viterbi(&mut self, label: Label, left: usize, right: usize, cost: f64) {
        let idx = self.index(label, left, right);
        self.viterbi[idx] = cost;
    }

    /// Derivations of `label` over `[left, right)`.
    pub fn edges(&self, left: usize, right: usize, label: Label) -> &[CfgEdge] {
        self.cells[left][right]
            .get(&label)
            .map_or(&[], |v| v.as_slice())
    }

    fn add_edge(&mut self, left: usize, right: usize, label: Label, edge: CfgEdge) {
        self.cells[left][right].entry(label).or_default().push(edge);
    }

    /// Labels with at least one derivation over `[left, right)`.
    pub fn labels_in(&self, left: usize, right: usize) -> impl Iterator<Item = Label> + '_ {
        self.cells[left][right].keys().copied()
    }
}

/// Split-extent filter matrices, indexed by `(label, boundary)`.
///
/// For a label `L`: `minsplitright[L, l]` / `maxsplitright[L, l]` are the
/// smallest and largest `r` with `L` derived over `[l, r)`, and
/// `minsplitleft[L, r]` / `maxsplitleft[L, r]` the smallest and largest
/// `l`. Min entries start past the sentence and max entries at -1, so
/// underived labels reject every split.
struct SplitFilter {
    minsplitleft: Vec<i16>,
    maxsplitleft: Vec<i16>,
    minsplitright: Vec<i16>,
    maxsplitright: Vec<i16>,
    width: usize,
}

impl SplitFilter {
    fn new(nonterminals: usize, n: usize) -> Self {
        let size = nonterminals * (n + 1);
        SplitFilter {
            minsplitleft: vec![n as i16 + 1; size],
            maxsplitleft: vec![-1; size],
            minsplitright: vec![n as i16 + 1; size],
            maxsplitright: vec![-1; size],
            width: n + 1,
        }
    }

    #[inline]
    fn at(&self, label: Label, pos: usize) -> usize {
        label as usize * self.width + pos
    }

    /// Record a freshly derived `(label, left, right)` cell.
    fn update(&mut self, label: Label, left: usize, right: usize) {
        let by_left = self.at(label, left);
        let by_right = self.at(label, right);
        self.minsplitright[by_left] = self.minsplitright[by_left].min(right as i16);
        self.maxsplitright[by_left] = self.maxsplitright[by_left].max(right as i16);
        self.minsplitleft[by_right] = self.minsplitleft[by_right].min(left as i16);
        self.maxsplitleft[by_right] = self.maxsplitleft[by_right].max(left as i16);
    }
}

/// Result of a CFG parse: the chart, and the goal item when the start
/// label covers the sentence.
pub struct CfgParseResult {
    pub chart: CfgChart,
    pub goal: Option<CfgItem>,
}

/// Exhaustive CKY over `(label, left, right)` cells with split-extent
/// filtering and per-cell unary closure. The lexical scan follows the same
/// gold-tag rules as the LCFRS parser.
pub fn cfg_parse(
    sent: &[&str],
    grammar: &Grammar,
    start: Label,
    tags: Option<&[&str]>,
) -> CfgParseResult {
    let n = sent.len();
    if let Some(tags) = tags {
        assert_eq!(tags.len(), n, "need one gold tag per token");
    }
    let mut chart = CfgChart::new(n, grammar.nonterminals());
    if n == 0 {
        return CfgParseResult { chart, goal: None };
    }
    let mut filter = SplitFilter::new(grammar.nonterminals(), n);

    // Lexical scan over the span-1 cells.
    for (i, word) in sent.iter().enumerate() {
        let tag = tags.map(|tags| tags[i]);
        let mut recognized = false;
        for lexrule in grammar.lexical(word) {
            if let Some(tag) = tag {
                if !tag_matches(grammar.tolabel(lexrule.lhs), tag) {
                    continue;
                }
            }
            recognized = true;
            admit(
                &mut chart,
                &mut filter,
                lexrule.lhs,
                i,
                i + 1,
                CfgEdge {
                    inside: lexrule.prob,
                    prob: lexrule.prob,
                    rule_no: NO_RULE,
                    mid: (i + 1) as u16,
                },
            );
        }
        if !recognized {
            if let Some(label) = tag.and_then(|tag| grammar.toid(tag)) {
                admit(
                    &mut chart,
                    &mut filter,
                    label,
                    i,
                    i + 1,
                    CfgEdge {
                        inside: 0.0,
                        prob: 0.0,
                        rule_no: NO_RULE,
                        mid: (i + 1) as u16,
                    },
                );
                recognized = true;
            }
        }
        if !recognized {
            return CfgParseResult { chart, goal: None };
        }
        unary_closure(&mut chart, &mut filter, grammar, i, i + 1);
    }

    // Binary combination, shortest spans first.
    for span in 2..=n {
        for left in 0..=n - span {
            let right = left + span;
            for rule in grammar.binary_rules() {
                let narrow_r = filter.minsplitright[filter.at(rule.rhs1, left)] as i32;
                if narrow_r >= right as i32 {
                    continue;
                }
                let narrow_l = filter.maxsplitleft[filter.at(rule.rhs2, right)] as i32;
                if narrow_l < narrow_r {
                    continue;
                }
                let lo = narrow_r.max(filter.minsplitleft[filter.at(rule.rhs2, right)] as i32);
                let hi = narrow_l.min(filter.maxsplitright[filter.at(rule.rhs1, left)] as i32);
                for mid in lo..=hi {
                    let mid = mid as usize;
                    let leftcost = chart.viterbi(rule.rhs1, left, mid);
                    let rightcost = chart.viterbi(rule.rhs2, mid, right);
                    if leftcost.is_finite() && rightcost.is_finite() {
                        admit(
                            &mut chart,
                            &mut filter,
                            rule.lhs,
                            left,
                            right,
                            CfgEdge {
                                inside: rule.prob + leftcost + rightcost,
                                prob: rule.prob,
                                rule_no: rule.no,
                                mid: mid as u16,
                            },
                        );
                    }
                }
            }
            unary_closure(&mut chart, &mut filter, grammar, left, right);
        }
    }

    let goal = if chart.viterbi(start, 0, n).is_finite() {
        Some(CfgItem {
            label: start,
            left: 0,
            right: n as u16,
        })
    } else {
        None
    };
    CfgParseResult { chart, goal }
}

/// Record one derivation; the split filters are only touched when the cell
/// first becomes derivable.
fn admit(
    chart: &mut CfgChart,
    filter: &mut SplitFilter,
    label: Label,
    left: usize,
    right: usize,
    edge: CfgEdge,
) {
    let cost = edge.inside;
    chart.add_edge(left, right, label, edge);
    let current = chart.viterbi(label, left, right);
    if cost < current {
        if current.is_infinite() {
            filter.update(label, left, right);
        }
        chart.set_viterbi(label, left, right, cost);
    }
}

/// Close the cell under unary rules, cheapest child first.
fn unary_closure(
    chart: &mut CfgChart,
    filter: &mut SplitFilter,
    grammar: &Grammar,
    left: usize,
    right: usize,
) {
    let mut agenda: PriorityQueue<Label, Reverse<OrderedFloat<f64>>> = PriorityQueue::new();
    let seed: Vec<Label> = chart.labels_in(left, right).collect();
    for label in seed {
        let cost = chart.viterbi(label, left, right);
        if cost.is_finite() {
            agenda.push(label, Reverse(OrderedFloat(cost)));
        }
    }
    while let Some((child, _)) = agenda.pop() {
        for rule in grammar.unary(child) {
            let cost = rule.prob + chart.viterbi(child, left, right);
            chart.add_edge(
                left,
                right,
                rule.lhs,
                CfgEdge {
                    inside: cost,
                    prob: rule.prob,
                    rule_no: rule.no,
                    mid: right as u16,
                },
            );
            let current = chart.viterbi(rule.lhs, left, right);
            if cost < current {
                if current.is_infinite() {
                    filter.update(rule.lhs, left, right);
                }
                chart.set_viterbi(rule.lhs, left, right, cost);
                agenda.push_increase(rule.lhs, Reverse(OrderedFloat(cost)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse_spans, ParseOptions};

    #[test]
    fn test_unary_chain() {
        let g = Grammar::builder()
            .unary("S", "D", 1.0)
            .binary("D", "NP", "VP", &[&[0, 1]], 1.0)
            .lex("mary", "NP", 1.0)
            .lex("walks", "VP", 1.0)
            .build()
            .unwrap();
        let s = g.toid("S").unwrap();
        let d = g.toid("D").unwrap();
        let result = cfg_parse(&["mary", "walks"], &g, s, None);
        assert!(result.goal.is_some());
        assert!(result.chart.viterbi(s, 0, 2).is_finite());
        assert_eq!(result.chart.edges(0, 2, d).len(), 1);
        assert_eq!(result.chart.edges(0, 2, s).len(), 1);
        let binary = result.chart.edges(0, 2, d)[0];
        assert!(g.rule(binary.rule_no).is_binary());
        assert_eq!(binary.mid, 1);
        let unary = result.chart.edges(0, 2, s)[0];
        assert!(!g.rule(unary.rule_no).is_binary());
    }

    fn attachment_grammar() -> Grammar {
        Grammar::builder()
            .binary("S", "NP", "VP", &[&[0, 1]], 1.0)
            .binary("NP", "Det", "N", &[&[0, 1]], 0.7)
            .binary("NP", "NP", "PP", &[&[0, 1]], 0.2)
            .binary("VP", "V", "NP", &[&[0, 1]], 0.6)
            .binary("VP", "VP", "PP", &[&[0, 1]], 0.4)
            .binary("PP", "P", "NP", &[&[0, 1]], 1.0)
            .lex("the", "Det", 1.0)
            .lex("man", "N", 1.0)
            .lex("telescope", "N", 1.0)
            .lex("saw", "V", 1.0)
            .lex("with", "P", 1.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_viterbi_picks_cheaper_attachment() {
        let g = attachment_grammar();
        let sent = [
            "the", "man", "saw", "the", "man", "with", "the", "telescope",
        ];
        let s = g.toid("S").unwrap();
        let result = cfg_parse(&sent, &g, s, None);
        assert!(result.goal.is_some());
        // verb attachment (0.4) beats noun attachment (0.2)
        let expected = -(0.7f64.ln() * 3.0 + 0.6f64.ln() + 0.4f64.ln());
        assert!((result.chart.viterbi(s, 0, 8) - expected).abs() < 1e-9);
        // the ambiguity shows up as two derivations of the verb phrase
        let vp = g.toid("VP").unwrap();
        assert_eq!(result.chart.edges(2, 8, vp).len(), 2);
    }

    #[test]
    fn test_agrees_with_lcfrs_parser() {
        let g = attachment_grammar();
        let sent = [
            "the", "man", "saw", "the", "man", "with", "the", "telescope",
        ];
        let s = g.toid("S").unwrap();
        let cfg = cfg_parse(&sent, &g, s, None);
        let opts = ParseOptions::<u64>::new(s);
        let lcfrs = parse_spans(&sent, &g, &opts);
        assert!((cfg.chart.viterbi(s, 0, 8) - lcfrs.viterbi_inside().unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_no_parse_leaves_goal_empty() {
        let g = attachment_grammar();
        let s = g.toid("S").unwrap();
        let result = cfg_parse(&["saw", "saw"], &g, s, None);
        assert!(result.goal.is_none());
        assert!(result.chart.viterbi(s, 0, 2).is_infinite());
        // unknown word stops the scan
        let result = cfg_parse(&["the", "quux"], &g, s, None);
        assert!(result.goal.is_none());
    }

    #[test]
    fn test_gold_tags_restrict_scan() {
        let g = attachment_grammar();
        let s = g.toid("S").unwrap();
        // "saw" forced to be a noun: no parse of "the saw saw the man"
        let sent = ["the", "saw", "saw", "the", "man"];
        let result = cfg_parse(&sent, &g, s, Some(&["Det", "N", "V", "Det", "N"]));
        assert!(result.goal.is_some());
        let np = g.toid("NP").unwrap();
        // the tag item for "saw" as N has cost 0
        assert!(result.chart.viterbi(np, 0, 2).is_finite());
    }

    #[test]
    fn test_filters_skip_impossible_splits() {
        let g = attachment_grammar();
        let s = g.toid("S").unwrap();
        let sent = ["the", "man", "saw", "the", "telescope"];
        let result = cfg_parse(&sent, &g, s, None);
        assert!(result.goal.is_some());
        let expected = -(0.7f64.ln() * 2.0 + 0.6f64.ln());
        assert!((result.chart.viterbi(s, 0, 5) - expected).abs() < 1e-9);
        // a cell no rule can build stays empty
        let vp = g.toid("VP").unwrap();
        assert!(result.chart.viterbi(vp, 0, 2).is_infinite());
        assert_eq!(result.chart.edges(0, 2, vp).len(), 0);
    }
}
