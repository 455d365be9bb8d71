//! Grammar representation for probabilistic LCFRS parsing.
//!
//! A grammar holds binarized rewrite rules over interned nonterminal labels
//! plus a lexicon mapping words to part-of-speech rules. Binary rules carry a
//! compact encoding of their yield function (how the children's span tuples
//! interleave into the parent's), and every rule stores its probability as a
//! `-ln p` cost so that lower is better and costs add along a derivation.
//!
//! Rules are indexed three ways for the parser: by first nonterminal on the
//! right-hand side (`lbinary`, and `unary`), by second nonterminal
//! (`rbinary`), and by left-hand side (`bylhs`).

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Interned nonterminal identifier.
pub type Label = u32;

/// The reserved sentinel label; also marks "no right child" in edges.
pub const EPSILON: Label = 0;

/// Rule number marking lexical and tag edges, which have no grammar rule.
pub const NO_RULE: u32 = u32::MAX;

/// Errors raised while assembling a grammar.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GrammarError {
    #[error("the label \"Epsilon\" is reserved")]
    ReservedLabel,
    #[error("yield function has an empty argument")]
    EmptyYield,
    #[error("yield function atom {0} is not 0 or 1")]
    BadAtom(u8),
    #[error("yield function has more than 64 atoms")]
    TooManyAtoms,
    #[error("yield function of a binary rule must use both children")]
    MissingYieldSide,
    #[error("probability {0} outside (0, 1]")]
    InvalidProbability(f64),
    #[error("conflicting fanout for {0}: {1} vs {2}")]
    FanoutMismatch(String, u8, u8),
}

/// A binarized rewrite rule.
///
/// `rhs2 == EPSILON` marks a unary rule. `args` and `lengths` encode the
/// yield function: atom `n` of the flattened yield tuple sits at bit `n`
/// (bit 0 is the first atom); an `args` bit selects the right child, a
/// `lengths` bit marks the last atom of an argument, so the highest set bit
/// of `lengths` gives the atom count.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rule {
    pub lhs: Label,
    pub rhs1: Label,
    pub rhs2: Label,
    pub args: u64,
    pub lengths: u64,
    /// `-ln p` of the rule probability.
    pub prob: f64,
    /// Position of this rule in the grammar's numbering.
    pub no: u32,
}

impl Rule {
    /// Whether this rule has two children on its right-hand side.
    #[inline]
    pub fn is_binary(&self) -> bool {
        self.rhs2 != EPSILON
    }
}

/// A part-of-speech rule from the lexicon.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LexicalRule {
    pub lhs: Label,
    /// `-ln p` of the rule probability.
    pub prob: f64,
}

enum RuleSpec {
    Binary {
        lhs: String,
        rhs1: String,
        rhs2: String,
        yields: Vec<Vec<u8>>,
        prob: f64,
    },
    Unary {
        lhs: String,
        rhs1: String,
        prob: f64,
    },
}

/// Incremental grammar assembly; collect rules and lexicon entries, then
/// [`build`](GrammarBuilder::build).
#[derive(Default)]
pub struct GrammarBuilder {
    rules: Vec<RuleSpec>,
    lexicon: Vec<(String, String, f64)>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        GrammarBuilder::default()
    }

    /// Add a binary rule `lhs -> rhs1 rhs2` with the given yield function
    /// (a tuple of tuples over {0, 1}; 0 picks the next component of `rhs1`,
    /// 1 of `rhs2`) and probability `p` in `(0, 1]`.
    pub fn binary(
        mut self,
        lhs: &str,
        rhs1: &str,
        rhs2: &str,
        yields: &[&[u8]],
        prob: f64,
    ) -> Self {
        self.rules.push(RuleSpec::Binary {
            lhs: lhs.into(),
            rhs1: rhs1.into(),
            rhs2: rhs2.into(),
            yields: yields.iter().map(|a| a.to_vec()).collect(),
            prob,
        });
        self
    }

    /// Add a unary rule `lhs -> rhs1` with probability `p`. The parent span
    /// is the child span, so no yield function is needed.
    pub fn unary(mut self, lhs: &str, rhs1: &str, prob: f64) -> Self {
        self.rules.push(RuleSpec::Unary {
            lhs: lhs.into(),
            rhs1: rhs1.into(),
            prob,
        });
        self
    }

    /// Add a lexicon entry: `word` can be tagged `lhs` with probability `p`.
    pub fn lex(mut self, word: &str, lhs: &str, prob: f64) -> Self {
        self.lexicon.push((word.into(), lhs.into(), prob));
        self
    }

    /// Intern labels, encode yield functions, derive fanouts, and build the
    /// rule indexes.
    pub fn build(self) -> Result<Grammar, GrammarError> {
        let mut grammar = Grammar {
            toid: FxHashMap::default(),
            tolabel: Vec::new(),
            lexical: FxHashMap::default(),
            rules: Vec::new(),
            unary: Vec::new(),
            lbinary: Vec::new(),
            rbinary: Vec::new(),
            bylhs: Vec::new(),
            fanout: Vec::new(),
        };
        grammar.intern("Epsilon");

        // First pass: intern every label so rule tables can be sized.
        for spec in &self.rules {
            match spec {
                RuleSpec::Binary {
                    lhs, rhs1, rhs2, ..
                } => {
                    for name in [lhs, rhs1, rhs2] {
                        if name == "Epsilon" {
                            return Err(GrammarError::ReservedLabel);
                        }
                        grammar.intern(name);
                    }
                }
                RuleSpec::Unary { lhs, rhs1, .. } => {
                    for name in [lhs, rhs1] {
                        if name == "Epsilon" {
                            return Err(GrammarError::ReservedLabel);
                        }
                        grammar.intern(name);
                    }
                }
            }
        }
        for (_, lhs, _) in &self.lexicon {
            if lhs == "Epsilon" {
                return Err(GrammarError::ReservedLabel);
            }
            grammar.intern(lhs);
        }

        let n = grammar.tolabel.len();
        grammar.unary = vec![Vec::new(); n];
        grammar.lbinary = vec![Vec::new(); n];
        grammar.rbinary = vec![Vec::new(); n];
        grammar.bylhs = vec![Vec::new(); n];

        // Fanout constraints: None = not yet determined.
        let mut fanout: Vec<Option<u8>> = vec![None; n];
        fanout[EPSILON as usize] = Some(1);
        let assign = |fanout: &mut Vec<Option<u8>>,
                          label: Label,
                          value: u8,
                          name: &str|
         -> Result<(), GrammarError> {
            match fanout[label as usize] {
                None => {
                    fanout[label as usize] = Some(value);
                    Ok(())
                }
                Some(old) if old == value => Ok(()),
                Some(old) => Err(GrammarError::FanoutMismatch(name.into(), old, value)),
            }
        };

        // Second pass: encode and number the rules.
        for spec in &self.rules {
            let no = grammar.rules.len() as u32;
            let rule = match spec {
                RuleSpec::Binary {
                    lhs,
                    rhs1,
                    rhs2,
                    yields,
                    prob,
                } => {
                    let (args, lengths) = encode_yield(yields)?;
                    let atoms = crate::bits::bitlength(lengths) as u32;
                    let ones = crate::bits::bitcount(args);
                    if ones == 0 || ones == atoms {
                        return Err(GrammarError::MissingYieldSide);
                    }
                    let (l, r1, r2) = (
                        grammar.intern(lhs),
                        grammar.intern(rhs1),
                        grammar.intern(rhs2),
                    );
                    assign(&mut fanout, l, yields.len() as u8, lhs)?;
                    assign(&mut fanout, r1, (atoms - ones) as u8, rhs1)?;
                    assign(&mut fanout, r2, ones as u8, rhs2)?;
                    Rule {
                        lhs: l,
                        rhs1: r1,
                        rhs2: r2,
                        args,
                        lengths,
                        prob: cost(*prob)?,
                        no,
                    }
                }
                RuleSpec::Unary { lhs, rhs1, prob } => Rule {
                    lhs: grammar.intern(lhs),
                    rhs1: grammar.intern(rhs1),
                    rhs2: EPSILON,
                    args: 0,
                    lengths: 1,
                    prob: cost(*prob)?,
                    no,
                },
            };
            grammar.rules.push(rule);
        }

        for (word, lhs, prob) in &self.lexicon {
            let label = grammar.intern(lhs);
            assign(&mut fanout, label, 1, lhs)?;
            grammar
                .lexical
                .entry(word.clone().into_boxed_str())
                .or_default()
                .push(LexicalRule {
                    lhs: label,
                    prob: cost(*prob)?,
                });
        }

        // Propagate fanouts along unary chains until stable.
        let mut changed = true;
        while changed {
            changed = false;
            for rule in &grammar.rules {
                if rule.is_binary() {
                    continue;
                }
                match (
                    fanout[rule.lhs as usize],
                    fanout[rule.rhs1 as usize],
                ) {
                    (None, Some(f)) => {
                        fanout[rule.lhs as usize] = Some(f);
                        changed = true;
                    }
                    (Some(f), None) => {
                        fanout[rule.rhs1 as usize] = Some(f);
                        changed = true;
                    }
                    (Some(a), Some(b)) if a != b => {
                        return Err(GrammarError::FanoutMismatch(
                            grammar.tolabel[rule.lhs as usize].to_string(),
                            a,
                            b,
                        ));
                    }
                    _ => {}
                }
            }
        }
        grammar.fanout = fanout.into_iter().map(|f| f.unwrap_or(1)).collect();

        for rule in grammar.rules.clone() {
            grammar.bylhs[rule.lhs as usize].push(rule);
            if rule.is_binary() {
                grammar.lbinary[rule.rhs1 as usize].push(rule);
                grammar.rbinary[rule.rhs2 as usize].push(rule);
            } else {
                grammar.unary[rule.rhs1 as usize].push(rule);
            }
        }
        Ok(grammar)
    }
}

/// Flatten a yield function into the `(args, lengths)` bit encoding.
fn encode_yield(yields: &[Vec<u8>]) -> Result<(u64, u64), GrammarError> {
    let mut args = 0u64;
    let mut lengths = 0u64;
    let mut n = 0;
    for arg in yields {
        if arg.is_empty() {
            return Err(GrammarError::EmptyYield);
        }
        for &atom in arg {
            if atom > 1 {
                return Err(GrammarError::BadAtom(atom));
            }
            if n >= 64 {
                return Err(GrammarError::TooManyAtoms);
            }
            if atom == 1 {
                args |= 1 << n;
            }
            n += 1;
        }
        lengths |= 1 << (n - 1);
    }
    if n == 0 {
        return Err(GrammarError::EmptyYield);
    }
    Ok((args, lengths))
}

/// Convert a probability to a `-ln p` cost.
fn cost(prob: f64) -> Result<f64, GrammarError> {
    if prob <= 0.0 || prob > 1.0 {
        return Err(GrammarError::InvalidProbability(prob));
    }
    Ok(-prob.ln())
}

/// A weighted binarized LCFRS, indexed for agenda parsing.
#[derive(Debug)]
pub struct Grammar {
    toid: FxHashMap<Box<str>, Label>,
    tolabel: Vec<Box<str>>,
    lexical: FxHashMap<Box<str>, Vec<LexicalRule>>,
    rules: Vec<Rule>,
    unary: Vec<Vec<Rule>>,
    lbinary: Vec<Vec<Rule>>,
    rbinary: Vec<Vec<Rule>>,
    bylhs: Vec<Vec<Rule>>,
    fanout: Vec<u8>,
}

impl Grammar {
    /// Start assembling a grammar.
    pub fn builder() -> GrammarBuilder {
        GrammarBuilder::new()
    }

    fn intern(&mut self, name: &str) -> Label {
        if let Some(&id) = self.toid.get(name) {
            return id;
        }
        let id = self.tolabel.len() as Label;
        let boxed: Box<str> = name.into();
        self.toid.insert(boxed.clone(), id);
        self.tolabel.push(boxed);
        id
    }

    /// Look up a label id by name.
    pub fn toid(&self, name: &str) -> Option<Label> {
        self.toid.get(name).copied()
    }

    /// The name of a label.
    pub fn tolabel(&self, label: Label) -> &str {
        &self.tolabel[label as usize]
    }

    /// Number of interned labels, including the Epsilon sentinel.
    pub fn nonterminals(&self) -> usize {
        self.tolabel.len()
    }

    /// Number of phrasal rules.
    pub fn numrules(&self) -> usize {
        self.rules.len()
    }

    /// Number of span components a label derives.
    #[inline]
    pub fn fanout(&self, label: Label) -> u8 {
        self.fanout[label as usize]
    }

    /// A rule by its number.
    #[inline]
    pub fn rule(&self, no: u32) -> &Rule {
        &self.rules[no as usize]
    }

    /// Part-of-speech rules for a word, empty if unknown.
    pub fn lexical(&self, word: &str) -> &[LexicalRule] {
        self.lexical.get(word).map_or(&[], |v| v.as_slice())
    }

    /// Unary rules whose child is `label`.
    #[inline]
    pub fn unary(&self, label: Label) -> &[Rule] {
        &self.unary[label as usize]
    }

    /// Binary rules whose first child is `label`.
    #[inline]
    pub fn lbinary(&self, label: Label) -> &[Rule] {
        &self.lbinary[label as usize]
    }

    /// Binary rules whose second child is `label`.
    #[inline]
    pub fn rbinary(&self, label: Label) -> &[Rule] {
        &self.rbinary[label as usize]
    }

    /// Rules rewriting `label`.
    pub fn bylhs(&self, label: Label) -> &[Rule] {
        &self.bylhs[label as usize]
    }

    /// All binary rules, in numbering order.
    pub fn binary_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.is_binary())
    }
}
