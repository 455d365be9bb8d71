//! Probabilistic chart parsing for linear context-free rewriting systems.
//!
//! This crate provides:
//! - Span bitmask primitives and narrow/wide span encodings
//! - Weighted binarized grammars with compact yield-function encodings
//! - An agenda-driven CKY parser over span bitvectors, with whitelist
//!   pruning, outside estimates, and exhaustive or first-parse modes
//! - A dense CKY parser with split-extent filtering for the context-free
//!   special case
//! - Lazy k-best derivation extraction over finished charts

pub mod agenda;
pub mod bits;
pub mod cfg;
pub mod chart;
pub mod grammar;
pub mod item;
pub mod kbest;
pub mod parse;

// Re-exports for convenience
pub use cfg::{cfg_parse, CfgChart, CfgEdge, CfgItem, CfgParseResult};
pub use chart::Chart;
pub use grammar::{Grammar, GrammarBuilder, GrammarError, Label, LexicalRule, Rule, EPSILON, NO_RULE};
pub use item::{ChartItem, Edge, FatVec, SpanVec, SLOTS};
pub use kbest::{lazykbest, RankedEdge};
pub use parse::{
    parse, parse_spans, EstimateKind, Estimates, LabelWhitelist, ParseOptions, ParseOutcome,
    ParseResult, ParseStats, Whitelist, SCORE_CUTOFF,
};
