//! Dataset loader for the textual lattice format.
//!
//! A file is a concatenation of samples. Each sample is a sequence of arc
//! lines `src trg inlabel outlabel [w0 w1 ...]`, one line holding the final
//! state identifier, and an `EOS` terminator. State identifiers are
//! arbitrary strings mapped densely in first-appearance order, so the first
//! line's source state becomes the initial state 0. Lines starting with `#`
//! and blank lines are ignored. A line with exactly three fields and a
//! duplicated final-state line are format errors.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use hashbrown::hash_map::RawEntryMut;
use hashbrown::HashMap;

use crate::errors::{LoglatError, Result};
use crate::fst::{Edge, Fst};
use crate::model::{Model, MAX_REAL};

/// An ordered collection of lattices sharing one multiplier per load call.
#[derive(Default)]
pub struct Dataset {
    pub fsts: Vec<Fst>,
}

impl Dataset {
    /// Creates an empty dataset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of lattices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fsts.len()
    }

    /// Returns `true` if the dataset holds no lattice.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fsts.is_empty()
    }

    /// Loads a lattice file, setting `mult` on every sample and validating
    /// the structural invariants. `cache` decides which derived tiers the
    /// validation leaves in place.
    pub fn load(&mut self, path: &Path, model: &Model, mult: f64, cache: u8) -> Result<()> {
        let file = File::open(path).map_err(|e| LoglatError::io(path, e))?;
        let mut lines = BufReader::new(file)
            .lines()
            .map(|l| l.map_err(|e| LoglatError::io(path, e)));
        self.load_lines(&mut lines, model, mult, cache)
    }

    /// Loads lattices from an in-memory buffer; used by tests and smaller
    /// tools.
    pub fn load_reader<R: BufRead>(
        &mut self,
        reader: R,
        model: &Model,
        mult: f64,
        cache: u8,
    ) -> Result<()> {
        let mut lines = reader
            .lines()
            .map(|l| l.map_err(|e| LoglatError::io(Path::new("<input>"), e)));
        self.load_lines(&mut lines, model, mult, cache)
    }

    fn load_lines<I>(&mut self, lines: &mut I, model: &Model, mult: f64, cache: u8) -> Result<()>
    where
        I: Iterator<Item = Result<String>>,
    {
        let mut sample: Vec<(usize, String)> = Vec::new();
        let mut lineno = 0;
        for line in lines {
            lineno += 1;
            let line = line?;
            if is_eos(&line) {
                // An empty sample marks the end of useful input.
                if sample.is_empty() {
                    break;
                }
                self.fsts.push(parse_sample(&sample, model, mult, cache)?);
                sample.clear();
            } else {
                sample.push((lineno, line));
            }
        }
        if !sample.is_empty() {
            self.fsts.push(parse_sample(&sample, model, mult, cache)?);
        }
        Ok(())
    }
}

fn is_eos(line: &str) -> bool {
    let t = line.trim();
    t.strip_prefix("EOS").is_some_and(|rest| rest.trim().is_empty())
}

fn parse_sample(
    lines: &[(usize, String)],
    model: &Model,
    mult: f64,
    cache: u8,
) -> Result<Fst> {
    let mut ids: HashMap<String, u32> = HashMap::new();
    let mut intern = |s: &str| -> u32 {
        let next = ids.len() as u32;
        match ids.raw_entry_mut().from_key(s) {
            RawEntryMut::Occupied(o) => *o.get(),
            RawEntryMut::Vacant(v) => {
                v.insert(s.to_string(), next);
                next
            }
        }
    };
    let mut edges = Vec::new();
    let mut final_tok: Option<&str> = None;
    let mut first_line = 0;
    for (ln, line) in lines {
        if first_line == 0 {
            first_line = *ln;
        }
        if line.starts_with('#') {
            continue;
        }
        let toks: Vec<&str> = line.split_whitespace().take(4 + MAX_REAL).collect();
        match toks.len() {
            0 => continue,
            3 => {
                return Err(LoglatError::format_at("arc line with three fields", *ln));
            }
            1 | 2 => {
                if final_tok.is_some() {
                    return Err(LoglatError::format_at("duplicated final state", *ln));
                }
                final_tok = Some(toks[0]);
            }
            _ => {
                let src = intern(toks[0]);
                let trg = intern(toks[1]);
                let mut wgh = [0.0; MAX_REAL];
                for (slot, tok) in wgh.iter_mut().zip(&toks[4..]) {
                    *slot = tok.parse().unwrap_or(0.0);
                }
                edges.push(Edge {
                    src,
                    trg,
                    ilbl: model.map_source(toks[2]),
                    olbl: model.map_target(toks[3]),
                    wgh,
                });
            }
        }
    }
    let final_tok =
        final_tok.ok_or_else(|| LoglatError::format_at("missing final state", first_line))?;
    if edges.is_empty() {
        return Err(LoglatError::format_at("sample has no arcs", first_line));
    }
    let final_state = intern(final_tok);
    let nstates = ids.len();
    let mut fst = Fst::new(edges, nstates, final_state, mult);
    fst.ensure_orderings()?;
    fst.release(cache);
    Ok(fst)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;
    use std::sync::Arc;

    use crate::pool::StringPool;

    fn new_model() -> Model {
        Model::new(Arc::new(StringPool::new(false)))
    }

    fn load(text: &str) -> Result<Dataset> {
        let model = new_model();
        let mut dat = Dataset::new();
        dat.load_reader(Cursor::new(text), &model, 1.0, 4)?;
        Ok(dat)
    }

    #[test]
    fn test_single_sample() {
        let dat = load("0 1 a x\n0 1 b y\n1\nEOS\n").unwrap();
        assert_eq!(1, dat.len());
        let fst = &dat.fsts[0];
        assert_eq!(2, fst.edges().len());
        assert_eq!(2, fst.num_states());
        assert_eq!(1, fst.final_state());
        assert_eq!(1.0, fst.mult());
    }

    #[test]
    fn test_multiple_samples_and_trailing() {
        // The last sample may omit the EOS mark.
        let dat = load("0 1 a a\n1\nEOS\n0 1 b b\n0 1 c c\n1\n").unwrap();
        assert_eq!(2, dat.len());
        assert_eq!(2, dat.fsts[1].edges().len());
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let dat = load("# header\n0 1 a a\n\n   \n1\nEOS\n").unwrap();
        assert_eq!(1, dat.len());
        assert_eq!(1, dat.fsts[0].edges().len());
    }

    #[test]
    fn test_state_ids_first_appearance() {
        // Identifiers are arbitrary strings; the first seen becomes state 0.
        let dat = load("q0 q1 a a\nq1 end a a\nend\nEOS\n").unwrap();
        let fst = &dat.fsts[0];
        assert_eq!(0, fst.edges()[0].src);
        assert_eq!(1, fst.edges()[0].trg);
        assert_eq!(2, fst.final_state());
    }

    #[test]
    fn test_three_fields_rejected() {
        assert!(load("0 1 a\n1\nEOS\n").is_err());
    }

    #[test]
    fn test_duplicate_final_rejected() {
        assert!(load("0 1 a a\n1\n1\nEOS\n").is_err());
    }

    #[test]
    fn test_missing_final_rejected() {
        assert!(load("0 1 a a\nEOS\n").is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        assert!(load("0 1 a a\n1 2 a a\n2 0 a a\n2\nEOS\n").is_err());
    }

    #[test]
    fn test_extra_columns_ignored() {
        let dat = load("0 1 a a 2.5 junk more\n1\nEOS\n").unwrap();
        let e = &dat.fsts[0].edges()[0];
        assert_eq!(2.5, e.bias());
    }

    #[test]
    fn test_eos_with_spaces() {
        let dat = load("0 1 a a\n1\n  EOS  \n").unwrap();
        assert_eq!(1, dat.len());
    }

    #[test]
    fn test_cached_tiers_respected() {
        let model = new_model();
        let mut dat = Dataset::new();
        dat.load_reader(Cursor::new("0 1 a a\n1\nEOS\n"), &model, 0.0, 2)
            .unwrap();
        // Cache level 2 keeps the orderings built during validation.
        assert_eq!(1, dat.fsts[0].orderings().fwd.len());
    }
}
