//! Viterbi decoding and search-space dumping.
//!
//! The decoder shares the feature generation and psi computation of the
//! gradient engine; the forward recursion swaps the log-space sum for a max
//! and records back-pointers, and the backward pass is replaced by a walk
//! along them. Decoding runs single-threaded: output order must follow
//! dataset order.

use std::io::Write;

use hashbrown::hash_map::RawEntryMut;
use hashbrown::HashMap;

use crate::dataset::Dataset;
use crate::errors::{LoglatError, Result};
use crate::fst::{Fst, Scratch};
use crate::gradient;
use crate::model::Model;
use crate::pattern::Generator;

/// The Viterbi forward step: the same recursion as the gradient forward pass
/// in the tropical semiring, recording the best predecessor arc.
fn viterbi_forward(fst: &Fst, scratch: &mut Scratch) {
    let adj = fst.adjacency();
    for &o in &fst.orderings().fwd {
        let o = o as usize;
        let e = &fst.edges()[o];
        if e.src == 0 {
            scratch.alpha[o] = scratch.psi[o];
            continue;
        }
        let s = e.src as usize;
        let outs = adj.out_arcs(s);
        let no = outs.iter().position(|&x| x as usize == o).unwrap();
        let base = adj.pair_base(s);
        let ocnt = outs.len();
        scratch.alpha[o] = f64::NEG_INFINITY;
        for (ni, &ie) in adj.in_arcs(s).iter().enumerate() {
            let v = scratch.psi[o] + scratch.pair_psi[base + ni * ocnt + no]
                + scratch.alpha[ie as usize];
            if v > scratch.alpha[o] {
                scratch.alpha[o] = v;
                scratch.eback[o] = ie;
            }
        }
    }
}

/// Follows the back-pointers from the best arc into the final state and
/// returns the path's `(in, out)` label hashes in reverse order, with the
/// path score.
fn backtrack(fst: &Fst, scratch: &Scratch) -> (Vec<(u64, u64)>, f64) {
    let mut best = f64::NEG_INFINITY;
    let mut ei = 0usize;
    for (ia, e) in fst.edges().iter().enumerate() {
        if e.trg != fst.final_state() {
            continue;
        }
        if scratch.alpha[ia] > best {
            best = scratch.alpha[ia];
            ei = ia;
        }
    }
    let mut out = Vec::new();
    let mut e = &fst.edges()[ei];
    out.push((e.ilbl.raw(), e.olbl.raw()));
    while e.src != 0 {
        ei = scratch.eback[ei] as usize;
        e = &fst.edges()[ei];
        out.push((e.ilbl.raw(), e.olbl.raw()));
    }
    (out, best)
}

/// Decodes every lattice of the dataset and writes one line per lattice:
/// the best path's `in@out` label pairs in forward order.
pub fn decode<W: Write>(
    model: &Model,
    gen: &Generator,
    dataset: &mut Dataset,
    out: &mut W,
) -> Result<()> {
    let pool = model.pool();
    for fst in &mut dataset.fsts {
        let mut scratch = gradient::prepare(model, gen, fst)?;
        viterbi_forward(fst, &mut scratch);
        let (path, _) = backtrack(fst, &scratch);
        for (ihsh, ohsh) in path.iter().rev() {
            write!(out, "{}@{} ", pool.get(*ihsh), pool.get(*ohsh))
                .map_err(|e| LoglatError::io(std::path::Path::new("<output>"), e))?;
        }
        writeln!(out).map_err(|e| LoglatError::io(std::path::Path::new("<output>"), e))?;
        fst.put_scratch(scratch);
        fst.release(0);
    }
    Ok(())
}

/// Writes the scored search space of every lattice as a compact WFST text
/// table for downstream composition.
///
/// Dump-local states are numbered from 2 (0 is initial, 1 final): each arc
/// of the original lattice becomes a dump state, arcs of the dump connect
/// consecutive original arcs and carry the pair-plus-arc score.
pub fn dump_spaces<W: Write>(
    model: &Model,
    gen: &Generator,
    dataset: &mut Dataset,
    out: &mut W,
) -> Result<()> {
    for fst in &mut dataset.fsts {
        let scratch = gradient::prepare(model, gen, fst)?;
        dump_one(model, fst, &scratch, out)
            .map_err(|e| LoglatError::io(std::path::Path::new("<output>"), e))?;
        fst.put_scratch(scratch);
        fst.release(0);
    }
    Ok(())
}

fn dump_one<W: Write>(
    model: &Model,
    fst: &Fst,
    scratch: &Scratch,
    out: &mut W,
) -> std::io::Result<()> {
    let pool = model.pool();
    let mut ids: HashMap<u32, u32> = HashMap::new();
    let mut map = |arc: u32| -> u32 {
        let next = ids.len() as u32 + 2;
        match ids.raw_entry_mut().from_key(&arc) {
            RawEntryMut::Occupied(o) => *o.get(),
            RawEntryMut::Vacant(v) => {
                v.insert(arc, next);
                next
            }
        }
    };
    let adj = fst.adjacency();
    for &oe in adj.out_arcs(0) {
        let e = &fst.edges()[oe as usize];
        let trg = map(oe);
        writeln!(
            out,
            "0\t{trg}\t{}\t{}\t{:.6}",
            pool.get(e.ilbl.raw()),
            pool.get(e.olbl.raw()),
            scratch.psi[oe as usize],
        )?;
    }
    let mut p = 0;
    for s in 0..fst.num_states() {
        for &ie in adj.in_arcs(s) {
            for &oe in adj.out_arcs(s) {
                let e = &fst.edges()[oe as usize];
                let src = map(ie);
                let trg = map(oe);
                let score = scratch.pair_psi[p] + scratch.psi[oe as usize];
                writeln!(
                    out,
                    "{src}\t{trg}\t{}\t{}\t{score:.6}",
                    pool.get(e.ilbl.raw()),
                    pool.get(e.olbl.raw()),
                )?;
                p += 1;
            }
        }
    }
    for &ie in adj.in_arcs(fst.final_state() as usize) {
        let src = map(ie);
        writeln!(out, "{src}\t1\t<eps>\t<eps>\t0.0")?;
    }
    writeln!(out, "1\nEOS")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;
    use std::sync::Arc;

    use crate::hash::hash_str;
    use crate::pool::StringPool;

    fn setup(pattern: &str) -> (Model, Generator) {
        let pool = Arc::new(StringPool::new(false));
        let model = Model::new(Arc::clone(&pool));
        let mut gen = Generator::new(pool, false);
        gen.add_pattern(pattern).unwrap();
        (model, gen)
    }

    const SPACE: &str = "0 1 a a 2.0\n0 2 b b 1.0\n1 3 c c 1.0\n2 3 d d 3.0\n3\nEOS\n";

    #[test]
    fn test_best_path_by_bias() {
        // b-d scores 4.0 against a-c's 3.0.
        let (model, gen) = setup("0:u:0s0");
        let mut dat = Dataset::new();
        dat.load_reader(Cursor::new(SPACE), &model, 0.0, 0).unwrap();
        let mut out = Vec::new();
        decode(&model, &gen, &mut dat, &mut out).unwrap();
        assert_eq!("b@b d@d \n", String::from_utf8(out).unwrap());
    }

    #[test]
    fn test_feature_weight_flips_path() {
        let (model, gen) = setup("0:u:0s0");
        let mut dat = Dataset::new();
        dat.load_reader(Cursor::new(SPACE), &model, 0.0, 0).unwrap();
        let f = model
            .add_feature(0, &[hash_str("u"), hash_str("a")], false)
            .unwrap();
        f.set_weight(10.0);
        let mut out = Vec::new();
        decode(&model, &gen, &mut dat, &mut out).unwrap();
        assert_eq!("a@a c@c \n", String::from_utf8(out).unwrap());
    }

    #[test]
    fn test_path_score_is_optimal() {
        // Enumerate both paths by hand and compare with the decoder score.
        let (model, gen) = setup("0:u:0s0");
        let mut dat = Dataset::new();
        dat.load_reader(Cursor::new(SPACE), &model, 0.0, 0).unwrap();
        let fst = &mut dat.fsts[0];
        let mut scratch = gradient::prepare(&model, &gen, fst).unwrap();
        viterbi_forward(fst, &mut scratch);
        let (path, score) = backtrack(fst, &scratch);
        assert_eq!(2, path.len());
        assert!((score - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_decode_bigram_scores() {
        // A bigram feature on consecutive source tokens changes the choice.
        let (model, gen) = setup("0:b:0s0,1s0");
        let mut dat = Dataset::new();
        dat.load_reader(Cursor::new(SPACE), &model, 0.0, 0).unwrap();
        // Fire on the a-then-c transition.
        let f = model
            .add_feature(0, &[hash_str("b"), hash_str("a"), hash_str("c")], false)
            .unwrap();
        f.set_weight(5.0);
        let mut out = Vec::new();
        decode(&model, &gen, &mut dat, &mut out).unwrap();
        assert_eq!("a@a c@c \n", String::from_utf8(out).unwrap());
    }

    #[test]
    fn test_dump_space_shape() {
        let (model, gen) = setup("0:u:0s0");
        let mut dat = Dataset::new();
        dat.load_reader(Cursor::new(SPACE), &model, 0.0, 0).unwrap();
        let mut out = Vec::new();
        dump_spaces(&model, &gen, &mut dat, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // 2 initial arcs + 2 pair arcs + 2 final arcs + "1" + "EOS".
        assert_eq!(8, lines.len());
        assert_eq!("1", lines[lines.len() - 2]);
        assert_eq!("EOS", lines[lines.len() - 1]);
        assert!(lines[0].starts_with("0\t"));
        // Final lines route into dump state 1 with epsilon labels.
        assert!(lines[4].split('\t').nth(1) == Some("1"));
    }
}
