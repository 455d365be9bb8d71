//! Agenda-driven CKY parser for probabilistic LCFRS.
//!
//! The parser keeps a chart of discovered items and an agenda of items
//! whose best known edge may still improve. Each pop admits an item with
//! its current best edge, then combines it with the grammar's unary and
//! binary rules against everything already admitted; the yield-function
//! test on span bitmasks decides which binary combinations are legal.
//! Monotone scores make the first pop of an item its Viterbi derivation.
//!
//! Optional machinery: a whitelist restricting which items may enter the
//! agenda (including the split-PCFG projection of discontinuous labels), an
//! outside estimate added to agenda scores, and a first-come admission cap
//! per span. Parse failures are data, not errors: the result carries the
//! chart, an optional goal item, and a diagnostic message.

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::agenda::Agenda;
use crate::chart::Chart;
use crate::grammar::{Grammar, Label, EPSILON, NO_RULE};
use crate::item::{ChartItem, Edge, FatVec, SpanVec};

/// Agenda scores above this cutoff (in `-ln` space) are treated as
/// numerically zero probability and dropped before admission.
pub const SCORE_CUTOFF: f64 = 300.0;

/// Whitelist entry for one label.
#[derive(Clone, Debug)]
pub enum LabelWhitelist<V: SpanVec> {
    /// Allowed spans, compared wholesale.
    Plain(FxHashSet<V>),
    /// Allowed contiguous components, one set per component position.
    Split(Vec<FxHashSet<V>>),
    /// Allowed contiguous components, one set shared by all positions.
    SplitShared(FxHashSet<V>),
}

/// Per-label admission whitelist. A label without an entry is
/// unrestricted; an entry with an empty set blocks the label entirely.
#[derive(Clone, Debug)]
pub struct Whitelist<V: SpanVec> {
    entries: Vec<Option<LabelWhitelist<V>>>,
}

impl<V: SpanVec> Whitelist<V> {
    pub fn new(nonterminals: usize) -> Self {
        Whitelist {
            entries: vec![None; nonterminals],
        }
    }

    pub fn set(&mut self, label: Label, entry: LabelWhitelist<V>) {
        self.entries[label as usize] = Some(entry);
    }

    /// Whether `item` fails the whitelist. With `splitprune`, spans of
    /// discontinuous labels are decomposed into maximal contiguous runs
    /// and each run is looked up as a component (per position for
    /// [`LabelWhitelist::Split`], shared for
    /// [`LabelWhitelist::SplitShared`]).
    fn blocks(&self, item: ChartItem<V>, grammar: &Grammar, splitprune: bool) -> bool {
        let entry = match &self.entries[item.label as usize] {
            None => return false,
            Some(entry) => entry,
        };
        if splitprune && grammar.fanout(item.label) > 1 {
            let mut component = 0;
            let mut pos = item.vec.nextset(0);
            while let Some(start) = pos {
                let end = item.vec.nextunset(start);
                let run = V::run(start, end);
                let allowed = match entry {
                    LabelWhitelist::Split(maps) => {
                        maps.get(component).map_or(false, |m| m.contains(&run))
                    }
                    LabelWhitelist::SplitShared(map) | LabelWhitelist::Plain(map) => {
                        map.contains(&run)
                    }
                };
                if !allowed {
                    return true;
                }
                component += 1;
                pos = item.vec.nextset(end);
            }
            false
        } else {
            let allowed = match entry {
                LabelWhitelist::Plain(map) | LabelWhitelist::SplitShared(map) => {
                    map.contains(&item.vec)
                }
                LabelWhitelist::Split(maps) => {
                    maps.first().map_or(false, |m| m.contains(&item.vec))
                }
            };
            !allowed
        }
    }
}

/// Which outside estimate a tensor holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EstimateKind {
    /// Indexed by (label, words left of the span, words right of it).
    Sx,
    /// Indexed by (label, span length, left + right context, gap length).
    SxLrGaps,
}

/// Outside estimate tensor, row-major over `[label, a, b, c]`.
pub struct Estimates {
    kind: EstimateKind,
    data: Vec<f64>,
    da: usize,
    db: usize,
    dc: usize,
}

impl Estimates {
    pub fn sx(nonterminals: usize, lensent: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), nonterminals * (lensent + 1) * (lensent + 1));
        Estimates {
            kind: EstimateKind::Sx,
            data,
            da: lensent + 1,
            db: lensent + 1,
            dc: 1,
        }
    }

    pub fn sx_lr_gaps(nonterminals: usize, lensent: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(
            data.len(),
            nonterminals * (lensent + 1) * (lensent + 1) * (lensent + 1)
        );
        Estimates {
            kind: EstimateKind::SxLrGaps,
            data,
            da: lensent + 1,
            db: lensent + 1,
            dc: lensent + 1,
        }
    }

    #[inline]
    fn at(&self, label: Label, a: usize, b: usize, c: usize) -> f64 {
        self.data[((label as usize * self.da + a) * self.db + b) * self.dc + c]
    }

    /// The outside cost for a span of the given label.
    pub fn outside<V: SpanVec>(&self, label: Label, vec: V, lensent: usize) -> f64 {
        match self.kind {
            EstimateKind::Sx => {
                let left = vec.nextset(0).unwrap_or(0);
                let right = lensent - vec.length();
                self.at(label, left, right, 0)
            }
            EstimateKind::SxLrGaps => {
                let length = vec.count() as usize;
                let left = vec.nextset(0).unwrap_or(0);
                let gaps = vec.length() - length - left;
                let right = lensent - length - left - gaps;
                self.at(label, length, left + right, gaps)
            }
        }
    }
}

/// Counters collected over one parse.
#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    /// Largest agenda size seen.
    pub maxagenda: usize,
    /// Agenda size when the loop stopped.
    pub agenda_final: usize,
    /// Items with at least one derivation.
    pub items: usize,
    /// Labels with at least one admitted item.
    pub labels: usize,
    /// Total edges in the chart.
    pub edges: usize,
    /// Items rejected by the whitelist.
    pub blocked: usize,
    /// Admitted items pushed back onto the agenda (inconsistent estimate).
    pub readded: usize,
}

impl fmt::Display for ParseStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agenda max {}, now {}, {} items ({} labels), {} edges, {} blocked",
            self.maxagenda, self.agenda_final, self.items, self.labels, self.edges, self.blocked
        )
    }
}

/// Knobs for one parse. `start` is the goal label; everything else
/// defaults to a plain exhaustive-free Viterbi parse.
pub struct ParseOptions<'a, V: SpanVec> {
    /// Goal nonterminal.
    pub start: Label,
    /// Gold part-of-speech tags, one per token; restricts the lexical scan.
    pub tags: Option<&'a [&'a str]>,
    /// Keep deriving after the goal is found, recording every derivation.
    pub exhaustive: bool,
    /// Admission whitelist, usually projected from a coarser chart.
    pub whitelist: Option<&'a Whitelist<V>>,
    /// Decompose discontinuous spans into components for whitelist lookup.
    pub splitprune: bool,
    /// Outside estimate added to agenda scores.
    pub estimates: Option<&'a Estimates>,
    /// First-come admission cap per span; 0 disables. Lossy.
    pub beamwidth: u32,
}

impl<'a, V: SpanVec> ParseOptions<'a, V> {
    pub fn new(start: Label) -> Self {
        ParseOptions {
            start,
            tags: None,
            exhaustive: false,
            whitelist: None,
            splitprune: false,
            estimates: None,
            beamwidth: 0,
        }
    }
}

/// Outcome of one parse: the packed chart, the goal item when the sentence
/// was derived, a diagnostic message, and the counters behind it.
pub struct ParseResult<V: SpanVec> {
    pub chart: Chart<V>,
    pub goal: Option<ChartItem<V>>,
    pub message: String,
    pub stats: ParseStats,
}

impl<V: SpanVec> ParseResult<V> {
    /// Inside cost of the goal's Viterbi derivation.
    pub fn viterbi_inside(&self) -> Option<f64> {
        self.goal
            .as_ref()
            .and_then(|goal| self.chart.viterbi_edge(goal))
            .map(|edge| edge.inside)
    }
}

/// Result of [`parse`], tagged by span width.
pub enum ParseOutcome {
    Narrow(ParseResult<u64>),
    Wide(ParseResult<FatVec>),
}

impl ParseOutcome {
    pub fn goal_found(&self) -> bool {
        match self {
            ParseOutcome::Narrow(r) => r.goal.is_some(),
            ParseOutcome::Wide(r) => r.goal.is_some(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ParseOutcome::Narrow(r) => &r.message,
            ParseOutcome::Wide(r) => &r.message,
        }
    }

    pub fn stats(&self) -> &ParseStats {
        match self {
            ParseOutcome::Narrow(r) => &r.stats,
            ParseOutcome::Wide(r) => &r.stats,
        }
    }

    pub fn viterbi_inside(&self) -> Option<f64> {
        match self {
            ParseOutcome::Narrow(r) => r.viterbi_inside(),
            ParseOutcome::Wide(r) => r.viterbi_inside(),
        }
    }

    /// Rank the k best derivations of the goal; empty when there is none.
    pub fn kbest(&self, k: usize, grammar: &Grammar, debin: Option<&str>) -> Vec<(String, f64)> {
        match self {
            ParseOutcome::Narrow(r) => r
                .goal
                .map(|g| crate::kbest::lazykbest(&r.chart, g, k, grammar, debin))
                .unwrap_or_default(),
            ParseOutcome::Wide(r) => r
                .goal
                .map(|g| crate::kbest::lazykbest(&r.chart, g, k, grammar, debin))
                .unwrap_or_default(),
        }
    }
}

/// Parse a sentence, picking the span width from its length: one machine
/// word under 64 tokens, the wide encoding up to `SLOTS * 64 - 1`.
///
/// Callers needing pruning or estimates use [`parse_spans`] directly with
/// an explicit width.
pub fn parse(
    sent: &[&str],
    grammar: &Grammar,
    start: Label,
    tags: Option<&[&str]>,
    exhaustive: bool,
) -> ParseOutcome {
    if sent.len() < 64 {
        let mut opts = ParseOptions::<u64>::new(start);
        opts.tags = tags;
        opts.exhaustive = exhaustive;
        ParseOutcome::Narrow(parse_spans(sent, grammar, &opts))
    } else {
        let mut opts = ParseOptions::<FatVec>::new(start);
        opts.tags = tags;
        opts.exhaustive = exhaustive;
        ParseOutcome::Wide(parse_spans(sent, grammar, &opts))
    }
}

/// Parse with an explicit span width.
pub fn parse_spans<V: SpanVec>(
    sent: &[&str],
    grammar: &Grammar,
    opts: &ParseOptions<'_, V>,
) -> ParseResult<V> {
    let n = sent.len();
    assert!(
        n <= V::CAPACITY,
        "sentence of {} tokens exceeds the span capacity of {} positions",
        n,
        V::CAPACITY
    );
    if let Some(tags) = opts.tags {
        assert_eq!(tags.len(), n, "need one gold tag per token");
    }

    let mut chart: Chart<V> = Chart::new(grammar.nonterminals());
    let mut agenda: Agenda<V> = Agenda::new();
    let mut stats = ParseStats::default();

    // Lexical scan.
    for (i, word) in sent.iter().enumerate() {
        let tag = opts.tags.map(|tags| tags[i]);
        let mut recognized = false;
        for lexrule in grammar.lexical(word) {
            if let Some(tag) = tag {
                if !tag_matches(grammar.tolabel(lexrule.lhs), tag) {
                    continue;
                }
            }
            recognized = true;
            let item = ChartItem::new(lexrule.lhs, V::bit(i));
            if let Some(score) = scored(lexrule.lhs, item.vec, lexrule.prob, opts, n) {
                let edge = Edge {
                    score,
                    inside: lexrule.prob,
                    prob: lexrule.prob,
                    rule_no: NO_RULE,
                    left: terminal::<V>(i),
                    right: ChartItem::none(),
                };
                agenda.set_if_better(item, edge);
                chart.reserve(item);
            }
        }
        if !recognized {
            // fall back on the gold tag itself when the lexicon has nothing
            if let Some(label) = tag.and_then(|tag| grammar.toid(tag)) {
                let item = ChartItem::new(label, V::bit(i));
                if let Some(score) = scored(label, item.vec, 0.0, opts, n) {
                    let edge = Edge {
                        score,
                        inside: 0.0,
                        prob: 0.0,
                        rule_no: NO_RULE,
                        left: terminal::<V>(i),
                        right: ChartItem::none(),
                    };
                    agenda.set_if_better(item, edge);
                    chart.reserve(item);
                }
                recognized = true;
            }
        }
        if !recognized {
            return ParseResult {
                chart,
                goal: None,
                message: format!("not covered: '{}'", tag.unwrap_or(word)),
                stats,
            };
        }
    }

    let goal = ChartItem::new(opts.start, V::full(n));
    let mut beam: FxHashMap<V, u32> = FxHashMap::default();
    stats.maxagenda = agenda.len();

    while let Some((item, edge)) = agenda.pop() {
        chart.admit(item, edge);
        if item == goal {
            if !opts.exhaustive {
                break;
            }
        } else {
            for rule in grammar.unary(item.label) {
                if beam_block(&mut beam, opts.beamwidth, item.vec) {
                    continue;
                }
                if let Some(score) = scored(rule.lhs, item.vec, rule.prob + edge.inside, opts, n) {
                    let newedge = Edge {
                        score,
                        inside: rule.prob + edge.inside,
                        prob: rule.prob,
                        rule_no: rule.no,
                        left: item,
                        right: ChartItem::none(),
                    };
                    process_edge(
                        ChartItem::new(rule.lhs, item.vec),
                        newedge,
                        grammar,
                        opts,
                        &mut agenda,
                        &mut chart,
                        &mut stats,
                    );
                }
            }
            for rule in grammar.lbinary(item.label) {
                let siblings: Vec<(ChartItem<V>, f64)> = chart
                    .label_items(rule.rhs2)
                    .filter(|(sib, _)| V::compatible(rule, item.vec, sib.vec))
                    .map(|(sib, sibedge)| (*sib, sibedge.inside))
                    .collect();
                for (sib, sibinside) in siblings {
                    let newvec = item.vec.union(sib.vec);
                    if beam_block(&mut beam, opts.beamwidth, newvec) {
                        continue;
                    }
                    let inside = rule.prob + edge.inside + sibinside;
                    if let Some(score) = scored(rule.lhs, newvec, inside, opts, n) {
                        let newedge = Edge {
                            score,
                            inside,
                            prob: rule.prob,
                            rule_no: rule.no,
                            left: item,
                            right: sib,
                        };
                        process_edge(
                            ChartItem::new(rule.lhs, newvec),
                            newedge,
                            grammar,
                            opts,
                            &mut agenda,
                            &mut chart,
                            &mut stats,
                        );
                    }
                }
            }
            for rule in grammar.rbinary(item.label) {
                let siblings: Vec<(ChartItem<V>, f64)> = chart
                    .label_items(rule.rhs1)
                    .filter(|(sib, _)| V::compatible(rule, sib.vec, item.vec))
                    .map(|(sib, sibedge)| (*sib, sibedge.inside))
                    .collect();
                for (sib, sibinside) in siblings {
                    let newvec = sib.vec.union(item.vec);
                    if beam_block(&mut beam, opts.beamwidth, newvec) {
                        continue;
                    }
                    let inside = rule.prob + sibinside + edge.inside;
                    if let Some(score) = scored(rule.lhs, newvec, inside, opts, n) {
                        let newedge = Edge {
                            score,
                            inside,
                            prob: rule.prob,
                            rule_no: rule.no,
                            left: sib,
                            right: item,
                        };
                        process_edge(
                            ChartItem::new(rule.lhs, newvec),
                            newedge,
                            grammar,
                            opts,
                            &mut agenda,
                            &mut chart,
                            &mut stats,
                        );
                    }
                }
            }
        }
        stats.maxagenda = stats.maxagenda.max(agenda.len());
    }

    stats.agenda_final = agenda.len();
    stats.items = chart.item_count();
    stats.labels = chart.label_count();
    stats.edges = chart.edge_count();
    let summary = stats.to_string();
    if chart.viterbi_edge(&goal).is_some() {
        ParseResult {
            chart,
            goal: Some(goal),
            message: summary,
            stats,
        }
    } else {
        ParseResult {
            chart,
            goal: None,
            message: format!("no parse {}", summary),
            stats,
        }
    }
}

/// Agenda/chart arbitration for one candidate edge.
fn process_edge<V: SpanVec>(
    newitem: ChartItem<V>,
    newedge: Edge<V>,
    grammar: &Grammar,
    opts: &ParseOptions<'_, V>,
    agenda: &mut Agenda<V>,
    chart: &mut Chart<V>,
    stats: &mut ParseStats,
) {
    let in_agenda = agenda.contains(&newitem);
    let in_chart = chart.contains(&newitem);
    if !in_agenda && !in_chart {
        // new item
        if let Some(whitelist) = opts.whitelist {
            if whitelist.blocks(newitem, grammar, opts.splitprune) {
                stats.blocked += 1;
                return;
            }
        }
        agenda.set(newitem, newedge);
        chart.reserve(newitem);
    } else if in_agenda && !opts.exhaustive {
        agenda.set_if_better(newitem, newedge);
    } else if in_agenda {
        match agenda.edge(&newitem) {
            Some(queued) if newedge.inside < queued.inside => {
                // decrease-key; the displaced edge is still a derivation
                if let Some(old) = agenda.replace(newitem, newedge) {
                    chart.add_edge(newitem, old);
                }
            }
            _ => chart.add_edge(newitem, newedge),
        }
    } else if chart
        .viterbi_edge(&newitem)
        .map_or(false, |best| newedge.inside < best.inside)
    {
        // cannot happen with a consistent estimate; recover anyway
        log::warn!("updating score in agenda: {:?}", newitem);
        stats.readded += 1;
        agenda.set(newitem, newedge);
    } else if opts.exhaustive {
        chart.add_edge(newitem, newedge);
    }
}

/// Score a candidate, applying the outside estimate and its cutoff.
#[inline]
fn scored<V: SpanVec>(
    label: Label,
    vec: V,
    inside: f64,
    opts: &ParseOptions<'_, V>,
    lensent: usize,
) -> Option<f64> {
    match opts.estimates {
        Some(estimates) => {
            let score = inside + estimates.outside(label, vec, lensent);
            (score <= SCORE_CUTOFF).then_some(score)
        }
        None => Some(inside),
    }
}

#[inline]
fn beam_block<V: SpanVec>(beam: &mut FxHashMap<V, u32>, beamwidth: u32, vec: V) -> bool {
    if beamwidth == 0 {
        return false;
    }
    let count = beam.entry(vec).or_insert(0);
    *count += 1;
    *count > beamwidth
}

/// Terminal backpointer: the Epsilon label with the input position as raw
/// payload.
#[inline]
fn terminal<V: SpanVec>(pos: usize) -> ChartItem<V> {
    ChartItem::new(EPSILON, V::index(pos))
}

/// A part-of-speech label matches a gold tag if equal to it, or if it is a
/// fragment address of it (`tag@...`).
pub(crate) fn tag_matches(label: &str, tag: &str) -> bool {
    label == tag || (label.len() > tag.len() && label.starts_with(tag) && label.as_bytes()[tag.len()] == b'@')
}
