//! Feature templates and the feature generator.
//!
//! A pattern string has the form `[tag:][name:]item[,item]*`. Each item
//! names one token of an arc label, `AsT`: arc `A` (0 or 1), side `s`
//! (source) or `t` (target), token index `T`. An item of the form
//! `AsT=AsT` compares two tokens instead and contributes the pooled hash of
//! `"true"` or `"false"`.
//!
//! A pattern that references arc 1 after normalization is a bigram pattern,
//! evaluated on each `(incoming, outgoing)` arc pair of a state; otherwise
//! it is a unigram pattern, evaluated on each arc. A pattern whose items all
//! reference arc 1 is rewritten to reference arc 0.

use std::sync::Arc;

use crate::errors::{LoglatError, Result};
use crate::fst::Fst;
use crate::model::{Label, Model};
use crate::pool::StringPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TokenRef {
    arc: u8,
    side: u8,
    tok: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Item {
    first: TokenRef,
    second: Option<TokenRef>,
}

/// A compiled feature template.
#[derive(Debug)]
pub struct Pattern {
    tag: usize,
    name: u64,
    items: Vec<Item>,
}

impl Pattern {
    /// Returns the regularization/activation tag of the template.
    #[inline(always)]
    #[must_use]
    pub fn tag(&self) -> usize {
        self.tag
    }
}

/// Compiles patterns and materializes feature lists on lattices.
pub struct Generator {
    upats: Vec<Pattern>,
    bpats: Vec<Pattern>,
    htrue: u64,
    hfalse: u64,
    hnone: u64,
    on_ref: bool,
    pool: Arc<StringPool>,
}

impl Generator {
    /// Creates a generator. With `on_ref`, feature frequencies are counted
    /// on reference lattices instead of hypothesis lattices.
    #[must_use]
    pub fn new(pool: Arc<StringPool>, on_ref: bool) -> Self {
        let htrue = pool.intern("true", false);
        let hfalse = pool.intern("false", false);
        let hnone = pool.intern("", false);
        Self {
            upats: Vec::new(),
            bpats: Vec::new(),
            htrue,
            hfalse,
            hnone,
            on_ref,
            pool,
        }
    }

    /// Returns the number of unigram templates.
    #[must_use]
    pub fn num_unigram(&self) -> usize {
        self.upats.len()
    }

    /// Returns the number of bigram templates.
    #[must_use]
    pub fn num_bigram(&self) -> usize {
        self.bpats.len()
    }

    /// Compiles a pattern string and adds it to the generator.
    pub fn add_pattern(&mut self, text: &str) -> Result<()> {
        let bad = |what: &str| {
            LoglatError::format(format!("bad pattern '{text}': {what}"))
        };
        let mut s = text;
        let mut tag = 0usize;
        if let Some(pos) = s.find(':') {
            let head = &s[..pos];
            if !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()) {
                tag = head.parse().map_err(|_| bad("tag out of range"))?;
                if tag > 127 {
                    return Err(bad("tag out of range"));
                }
                s = &s[pos + 1..];
            }
        }
        let mut name = 0u64;
        if s.starts_with(|c: char| c.is_ascii_alphabetic()) {
            let pos = s.find(':').ok_or_else(|| bad("unterminated name"))?;
            name = self.pool.intern(&s[..pos], false);
            s = &s[pos + 1..];
        }
        let mut items = Vec::new();
        if !s.is_empty() {
            for part in s.split(',') {
                items.push(parse_item(part.trim()).ok_or_else(|| bad("malformed item"))?);
            }
        }
        // A pattern referencing only the second arc is really a unigram
        // pattern on that arc; shift it down.
        let touches = |items: &[Item], arc: u8| {
            items.iter().any(|it| {
                it.first.arc == arc || it.second.map_or(false, |r| r.arc == arc)
            })
        };
        if !touches(&items, 0) {
            for it in &mut items {
                it.first.arc = 0;
                if let Some(r) = &mut it.second {
                    r.arc = 0;
                }
            }
        }
        let pat = Pattern { tag, name, items };
        if touches(&pat.items, 1) {
            self.bpats.push(pat);
        } else {
            self.upats.push(pat);
        }
        Ok(())
    }

    /// Evaluates one item on a label set (two labels for unigram patterns,
    /// four for bigram patterns).
    fn eval(&self, item: &Item, labels: &[&Label]) -> u64 {
        let h1 = self.token(item.first, labels);
        match item.second {
            None => h1,
            Some(second) => {
                if h1 == self.token(second, labels) {
                    self.htrue
                } else {
                    self.hfalse
                }
            }
        }
    }

    fn token(&self, r: TokenRef, labels: &[&Label]) -> u64 {
        labels[(r.arc * 2 + r.side) as usize]
            .tokens()
            .get(r.tok as usize)
            .copied()
            .unwrap_or(self.hnone)
    }

    fn run(
        &self,
        pats: &[Pattern],
        model: &Model,
        labels: &[&Label],
        hashes: &mut Vec<u64>,
        out: &mut Vec<Arc<crate::model::Feature>>,
        count_freq: bool,
    ) {
        for pat in pats {
            hashes.clear();
            if pat.name != 0 {
                hashes.push(pat.name);
            }
            for item in &pat.items {
                hashes.push(self.eval(item, labels));
            }
            if let Some(ftr) = model.add_feature(pat.tag, hashes, count_freq) {
                out.push(ftr);
            }
        }
    }

    /// Materializes the unigram and bigram feature lists of a lattice.
    ///
    /// Runs every iteration: existing features are found and counted, and
    /// features whose tag became active are created. Occurrence frequencies
    /// are counted on the side configured at construction.
    pub fn generate(&self, model: &Model, fst: &mut Fst) {
        let count_freq = (fst.mult() < 0.0 && self.on_ref) || (fst.mult() > 0.0 && !self.on_ref);
        fst.ensure_adjacency();
        let mut lists = fst.take_feature_lists();
        lists.clear();
        let mut hashes = Vec::new();
        for e in fst.edges() {
            let labels = [&*e.ilbl, &*e.olbl];
            self.run(
                &self.upats,
                model,
                &labels,
                &mut hashes,
                &mut lists.uni,
                count_freq,
            );
            lists.uni_off.push(lists.uni.len() as u32);
        }
        let adj = fst.adjacency();
        for s in 0..fst.num_states() {
            for &ie in adj.in_arcs(s) {
                for &oe in adj.out_arcs(s) {
                    let ai = &fst.edges()[ie as usize];
                    let ao = &fst.edges()[oe as usize];
                    let labels = [&*ai.ilbl, &*ai.olbl, &*ao.ilbl, &*ao.olbl];
                    self.run(
                        &self.bpats,
                        model,
                        &labels,
                        &mut hashes,
                        &mut lists.big,
                        count_freq,
                    );
                    lists.big_off.push(lists.big.len() as u32);
                }
            }
        }
        fst.put_feature_lists(lists);
    }
}

fn parse_token_ref(s: &str) -> Option<(TokenRef, &str)> {
    let arc_end = s.find(|c: char| !c.is_ascii_digit())?;
    let arc: u8 = s[..arc_end].parse().ok()?;
    if arc > 1 {
        return None;
    }
    let side = match s.as_bytes().get(arc_end)? {
        b's' => 0,
        b't' => 1,
        _ => return None,
    };
    let rest = &s[arc_end + 1..];
    let tok_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if tok_end == 0 {
        return None;
    }
    let tok: u32 = rest[..tok_end].parse().ok()?;
    Some((TokenRef { arc, side, tok }, &rest[tok_end..]))
}

fn parse_item(s: &str) -> Option<Item> {
    let (first, rest) = parse_token_ref(s)?;
    if rest.is_empty() {
        return Some(Item {
            first,
            second: None,
        });
    }
    let rest = rest.strip_prefix('=')?;
    let (second, rest) = parse_token_ref(rest)?;
    if !rest.is_empty() {
        return None;
    }
    Some(Item {
        first,
        second: Some(second),
    })
}
