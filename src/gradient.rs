//! Gradient of the negative log-likelihood over a dataset.
//!
//! Per lattice: compute the arc and pair log-potentials from the current
//! weights, run the forward and backward recursions in log-space over the
//! topological arc orders, and accumulate the occupation probability of
//! every feature occurrence into the feature's gradient cell, scaled by the
//! lattice multiplier. Hypothesis lattices carry +1 and references -1, so
//! summing over the dataset yields the gradient and value of the negative
//! log-likelihood.
//!
//! Lattices are distributed to a pool of scoped worker threads through an
//! unbounded channel; each lattice is owned by exactly one worker, so the
//! only cross-thread writes are the atomic gradient and frequency updates.

use std::thread;

use crate::dataset::Dataset;
use crate::errors::Result;
use crate::fst::{Fst, Scratch};
use crate::math::logsumexp;
use crate::model::Model;
use crate::pattern::Generator;

/// Computes the arc and pair log-potentials of a lattice into `scratch`.
///
/// For an arc, psi is the sum of its unigram feature weights, its bias, and
/// the gated dense-feature contributions; for an `(incoming, outgoing)` pair
/// it is the sum of the bigram feature weights.
pub(crate) fn compute_psi(model: &Model, fst: &Fst, scratch: &mut Scratch) {
    let feats = fst.feature_lists();
    let adj = fst.adjacency();
    scratch.prepare(fst.edges().len(), adj.num_pairs());
    for (ia, e) in fst.edges().iter().enumerate() {
        let mut sum: f64 = feats.uni(ia).iter().map(|f| f.weight()).sum();
        sum += e.bias();
        for (k, slot) in model.dense_slots().iter().enumerate() {
            // Dense features only count once their tag has been introduced.
            if model.tag_start(slot.tag()) <= model.iteration() {
                sum += slot.feature().weight() * e.wgh[k + 1];
            }
        }
        scratch.psi[ia] = sum;
    }
    let mut p = 0;
    for s in 0..fst.num_states() {
        for _ in adj.in_arcs(s) {
            for _ in adj.out_arcs(s) {
                scratch.pair_psi[p] = feats.big(p).iter().map(|f| f.weight()).sum();
                p += 1;
            }
        }
    }
}

/// The forward recursion: processes arcs in topological order so that every
/// in-arc of an arc's source state is already scored.
fn forward(fst: &Fst, scratch: &mut Scratch) {
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
        let mut alpha = f64::NEG_INFINITY;
        for (ni, &ie) in adj.in_arcs(s).iter().enumerate() {
            let v = scratch.psi[o] + scratch.pair_psi[base + ni * ocnt + no]
                + scratch.alpha[ie as usize];
            alpha = logsumexp(alpha, v);
        }
        scratch.alpha[o] = alpha;
    }
}

/// The backward recursion, dual to [`forward`].
fn backward(fst: &Fst, scratch: &mut Scratch) {
    let adj = fst.adjacency();
    for &i in &fst.orderings().bwd {
        let i = i as usize;
        let e = &fst.edges()[i];
        if e.trg == fst.final_state() {
            scratch.beta[i] = 0.0;
            continue;
        }
        let s = e.trg as usize;
        let ni = adj.in_arcs(s).iter().position(|&x| x as usize == i).unwrap();
        let base = adj.pair_base(s);
        let ocnt = adj.out_arcs(s).len();
        let mut beta = f64::NEG_INFINITY;
        for (no, &oe) in adj.out_arcs(s).iter().enumerate() {
            let v = scratch.psi[oe as usize] + scratch.pair_psi[base + ni * ocnt + no]
                + scratch.beta[oe as usize];
            beta = logsumexp(beta, v);
        }
        scratch.beta[i] = beta;
    }
}

/// The log-partition of the lattice: the sum over arcs entering the final
/// state of their forward scores.
fn normalizer(fst: &Fst, scratch: &Scratch) -> f64 {
    let mut z = f64::NEG_INFINITY;
    for (ia, e) in fst.edges().iter().enumerate() {
        if e.trg == fst.final_state() {
            z = logsumexp(z, scratch.alpha[ia]);
        }
    }
    z
}

/// Accumulates the expected feature counts into the gradient cells and
/// returns the lattice's log-likelihood contribution `mult * Z`.
fn accumulate(model: &Model, fst: &Fst, scratch: &Scratch) -> f64 {
    let z = normalizer(fst, scratch);
    let mult = fst.mult();
    let feats = fst.feature_lists();
    let adj = fst.adjacency();
    for (ia, e) in fst.edges().iter().enumerate() {
        let ex = (scratch.alpha[ia] + scratch.beta[ia] - z).exp();
        for f in feats.uni(ia) {
            f.add_grad(ex * mult);
        }
        for (k, slot) in model.dense_slots().iter().enumerate() {
            slot.feature().add_grad(ex * e.wgh[k + 1] * mult);
        }
    }
    let mut p = 0;
    for s in 0..fst.num_states() {
        let base = adj.pair_base(s);
        debug_assert_eq!(base, p);
        for &ie in adj.in_arcs(s) {
            for &oe in adj.out_arcs(s) {
                let ex = (scratch.alpha[ie as usize]
                    + scratch.pair_psi[p]
                    + scratch.psi[oe as usize]
                    + scratch.beta[oe as usize]
                    - z)
                    .exp();
                for f in feats.big(p) {
                    f.add_grad(ex * mult);
                }
                p += 1;
            }
        }
    }
    mult * z
}

/// Runs one lattice through the whole pipeline.
fn process(model: &Model, gen: &Generator, fst: &mut Fst, cache: u8) -> Result<f64> {
    fst.ensure_orderings()?;
    gen.generate(model, fst);
    let mut scratch = fst.take_scratch();
    compute_psi(model, fst, &mut scratch);
    forward(fst, &mut scratch);
    backward(fst, &mut scratch);
    let fx = accumulate(model, fst, &scratch);
    fst.put_scratch(scratch);
    fst.release(cache);
    Ok(fx)
}

/// Computes the gradient over a dataset with `nthreads` workers.
///
/// Expects the gradient cells to be clear on entry; on return every feature
/// holds its accumulated expectation and the total log-likelihood
/// contribution is returned.
pub fn compute(
    model: &Model,
    gen: &Generator,
    dataset: &mut Dataset,
    nthreads: usize,
    cache: u8,
) -> Result<f64> {
    let (s, r) = crossbeam_channel::unbounded();
    for fst in &mut dataset.fsts {
        s.send(fst).unwrap();
    }
    thread::scope(|scope| {
        let mut threads = Vec::new();
        for _ in 0..nthreads.max(1) {
            let t = scope.spawn(|| -> Result<f64> {
                let mut fx = 0.0;
                while let Ok(fst) = r.try_recv() {
                    fx += process(model, gen, fst, cache)?;
                }
                Ok(fx)
            });
            threads.push(t);
        }
        let mut total = 0.0;
        for t in threads {
            total += t.join().unwrap()?;
        }
        Ok(total)
    })
}

/// Prepares a lattice for decoding: feature lists and log-potentials, with
/// the scratch taken out for the caller.
pub(crate) fn prepare(
    model: &Model,
    gen: &Generator,
    fst: &mut Fst,
) -> Result<Scratch> {
    fst.ensure_orderings()?;
    gen.generate(model, fst);
    let mut scratch = fst.take_scratch();
    compute_psi(model, fst, &mut scratch);
    Ok(scratch)
}
