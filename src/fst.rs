//! Acyclic weighted transducers and their transient working storage.
//!
//! An [`Fst`] keeps its permanent data (arcs, final state, multiplier) apart
//! from four tiers of derived data that the engines rebuild on demand:
//! adjacency, topological arc orderings, generated feature lists, and the
//! numeric scratch (psi, alpha, beta). The cache level decides which tiers
//! survive between passes; see [`Fst::release`].
//!
//! All derived data lives in flat buffers with precomputed prefix offsets,
//! so access to the per-state `(incoming, outgoing)` pair tables is O(1) and
//! dropping a tier is dropping one buffer.

use std::sync::Arc;

use crate::errors::{LoglatError, Result};
use crate::model::{Feature, Label, MAX_REAL};

/// One transition of a lattice.
pub struct Edge {
    pub src: u32,
    pub trg: u32,
    pub ilbl: Arc<Label>,
    pub olbl: Arc<Label>,
    /// Pre-assigned real weights; slot 0 is the arc bias.
    pub wgh: [f64; MAX_REAL],
}

impl Edge {
    /// Returns the arc bias (weight slot 0, or zero when there is none).
    #[inline(always)]
    #[must_use]
    pub fn bias(&self) -> f64 {
        self.wgh.first().copied().unwrap_or(0.0)
    }
}

/// In/out adjacency in prefix-offset form, plus the per-state base index of
/// the flattened `(incoming, outgoing)` pair tables.
pub struct Adjacency {
    in_off: Vec<u32>,
    in_lst: Vec<u32>,
    out_off: Vec<u32>,
    out_lst: Vec<u32>,
    pair_off: Vec<u32>,
}

impl Adjacency {
    fn build(edges: &[Edge], nstates: usize) -> Self {
        let mut in_off = vec![0u32; nstates + 1];
        let mut out_off = vec![0u32; nstates + 1];
        for e in edges {
            in_off[e.trg as usize + 1] += 1;
            out_off[e.src as usize + 1] += 1;
        }
        for s in 0..nstates {
            in_off[s + 1] += in_off[s];
            out_off[s + 1] += out_off[s];
        }
        let mut in_lst = vec![0u32; edges.len()];
        let mut out_lst = vec![0u32; edges.len()];
        let mut in_cur = in_off.clone();
        let mut out_cur = out_off.clone();
        for (ia, e) in edges.iter().enumerate() {
            in_lst[in_cur[e.trg as usize] as usize] = ia as u32;
            in_cur[e.trg as usize] += 1;
            out_lst[out_cur[e.src as usize] as usize] = ia as u32;
            out_cur[e.src as usize] += 1;
        }
        let mut pair_off = vec![0u32; nstates + 1];
        for s in 0..nstates {
            let ni = in_off[s + 1] - in_off[s];
            let no = out_off[s + 1] - out_off[s];
            pair_off[s + 1] = pair_off[s] + ni * no;
        }
        Self {
            in_off,
            in_lst,
            out_off,
            out_lst,
            pair_off,
        }
    }

    /// Arc indices entering state `s`.
    #[inline(always)]
    pub fn in_arcs(&self, s: usize) -> &[u32] {
        &self.in_lst[self.in_off[s] as usize..self.in_off[s + 1] as usize]
    }

    /// Arc indices leaving state `s`.
    #[inline(always)]
    pub fn out_arcs(&self, s: usize) -> &[u32] {
        &self.out_lst[self.out_off[s] as usize..self.out_off[s + 1] as usize]
    }

    /// Base index of state `s` in the flattened pair tables. The pair
    /// `(ni, no)` of state `s` lives at `pair_base(s) + ni * out_degree + no`.
    #[inline(always)]
    pub fn pair_base(&self, s: usize) -> usize {
        self.pair_off[s] as usize
    }

    /// Total number of `(incoming, outgoing)` pairs over all states.
    #[inline(always)]
    pub fn num_pairs(&self) -> usize {
        *self.pair_off.last().unwrap() as usize
    }
}

/// Topologically sorted arc orders, initial-to-final and final-to-initial.
pub struct Orderings {
    pub fwd: Vec<u32>,
    pub bwd: Vec<u32>,
}

/// Feature lists produced by the generator: one unigram list per arc, one
/// bigram list per `(incoming, outgoing)` pair, in flat prefix-offset form.
#[derive(Default)]
pub struct FeatureLists {
    pub uni: Vec<Arc<Feature>>,
    pub uni_off: Vec<u32>,
    pub big: Vec<Arc<Feature>>,
    pub big_off: Vec<u32>,
}

impl FeatureLists {
    pub(crate) fn clear(&mut self) {
        self.uni.clear();
        self.uni_off.clear();
        self.uni_off.push(0);
        self.big.clear();
        self.big_off.clear();
        self.big_off.push(0);
    }

    /// Unigram features of arc `ia`.
    #[inline(always)]
    pub fn uni(&self, ia: usize) -> &[Arc<Feature>] {
        &self.uni[self.uni_off[ia] as usize..self.uni_off[ia + 1] as usize]
    }

    /// Bigram features of flattened pair `p`.
    #[inline(always)]
    pub fn big(&self, p: usize) -> &[Arc<Feature>] {
        &self.big[self.big_off[p] as usize..self.big_off[p + 1] as usize]
    }
}

/// Numeric working storage of the gradient engine and the decoder.
#[derive(Default)]
pub struct Scratch {
    /// Arc log-potentials.
    pub psi: Vec<f64>,
    /// Forward scores.
    pub alpha: Vec<f64>,
    /// Backward scores.
    pub beta: Vec<f64>,
    /// Pair log-potentials, indexed through [`Adjacency::pair_base`].
    pub pair_psi: Vec<f64>,
    /// Best-predecessor arc per arc (decoder only).
    pub eback: Vec<u32>,
}

impl Scratch {
    pub(crate) fn prepare(&mut self, narcs: usize, npairs: usize) {
        self.psi.clear();
        self.psi.resize(narcs, 0.0);
        self.alpha.clear();
        self.alpha.resize(narcs, 0.0);
        self.beta.clear();
        self.beta.resize(narcs, 0.0);
        self.pair_psi.clear();
        self.pair_psi.resize(npairs, 0.0);
        self.eback.clear();
        self.eback.resize(narcs, 0);
    }
}

/// A directed acyclic WFST with a unique initial state (index 0) and a
/// unique final state.
pub struct Fst {
    mult: f64,
    nstates: usize,
    final_state: u32,
    edges: Vec<Edge>,
    adj: Option<Adjacency>,
    sort: Option<Orderings>,
    feats: Option<FeatureLists>,
    scratch: Option<Scratch>,
}

impl Fst {
    pub(crate) fn new(edges: Vec<Edge>, nstates: usize, final_state: u32, mult: f64) -> Self {
        Self {
            mult,
            nstates,
            final_state,
            edges,
            adj: None,
            sort: None,
            feats: None,
            scratch: None,
        }
    }

    /// Returns the arc multiplier: +1 hypothesis, -1 reference, 0 test.
    #[inline(always)]
    pub fn mult(&self) -> f64 {
        self.mult
    }

    #[inline(always)]
    pub fn final_state(&self) -> u32 {
        self.final_state
    }

    #[inline(always)]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[inline(always)]
    pub fn num_states(&self) -> usize {
        self.nstates
    }

    /// Builds the adjacency tier if it is absent.
    pub fn ensure_adjacency(&mut self) {
        if self.adj.is_none() {
            self.adj = Some(Adjacency::build(&self.edges, self.nstates));
        }
    }

    /// Returns the adjacency tier. Panics if it has not been built.
    #[inline(always)]
    pub fn adjacency(&self) -> &Adjacency {
        self.adj.as_ref().unwrap()
    }

    /// Builds the topological arc orderings if absent, verifying that the
    /// lattice has a unique source (state 0), a unique sink (the final
    /// state), and no cycles.
    pub fn ensure_orderings(&mut self) -> Result<()> {
        if self.sort.is_some() {
            return Ok(());
        }
        self.ensure_adjacency();
        let adj = self.adj.as_ref().unwrap();
        let fwd_states = self.toposort(adj, false)?;
        if fwd_states[0] != 0 {
            return Err(LoglatError::invalid_fst("the unique source is not state 0"));
        }
        let bwd_states = self.toposort(adj, true)?;
        if bwd_states[0] != self.final_state {
            return Err(LoglatError::invalid_fst(
                "the unique sink is not the final state",
            ));
        }
        let mut fwd = Vec::with_capacity(self.edges.len());
        for &s in &fwd_states {
            fwd.extend_from_slice(adj.out_arcs(s as usize));
        }
        let mut bwd = Vec::with_capacity(self.edges.len());
        for &s in &bwd_states {
            bwd.extend_from_slice(adj.in_arcs(s as usize));
        }
        self.sort = Some(Orderings { fwd, bwd });
        Ok(())
    }

    /// Topologically sorts the states, from the initial state (`rev` false)
    /// or from the final state (`rev` true). Also checks the structural
    /// invariants, which come for free here.
    fn toposort(&self, adj: &Adjacency, rev: bool) -> Result<Vec<u32>> {
        let n = self.nstates;
        let mut deg: Vec<u32> = (0..n)
            .map(|s| {
                if rev {
                    adj.out_arcs(s).len() as u32
                } else {
                    adj.in_arcs(s).len() as u32
                }
            })
            .collect();
        let mut lst: Vec<u32> = (0..n as u32).collect();
        let mut done = 0;
        while done < n {
            let mut last = done;
            for i in done..n {
                if deg[lst[i] as usize] == 0 {
                    lst.swap(i, last);
                    last += 1;
                }
            }
            if done == 0 && last != 1 {
                return Err(LoglatError::invalid_fst(
                    "lattice does not have a unique extremal state",
                ));
            }
            if last == done {
                return Err(LoglatError::invalid_fst("lattice has a cycle"));
            }
            for i in done..last {
                let s = lst[i] as usize;
                if rev {
                    for &ia in adj.in_arcs(s) {
                        deg[self.edges[ia as usize].src as usize] -= 1;
                    }
                } else {
                    for &ia in adj.out_arcs(s) {
                        deg[self.edges[ia as usize].trg as usize] -= 1;
                    }
                }
            }
            done = last;
        }
        Ok(lst)
    }

    /// Returns the orderings tier. Panics if it has not been built.
    #[inline(always)]
    pub fn orderings(&self) -> &Orderings {
        self.sort.as_ref().unwrap()
    }

    pub(crate) fn take_feature_lists(&mut self) -> FeatureLists {
        self.feats.take().unwrap_or_default()
    }

    pub(crate) fn put_feature_lists(&mut self, feats: FeatureLists) {
        self.feats = Some(feats);
    }

    /// Returns the generated feature lists. Panics if generation has not
    /// run.
    #[inline(always)]
    pub fn feature_lists(&self) -> &FeatureLists {
        self.feats.as_ref().unwrap()
    }

    pub(crate) fn take_scratch(&mut self) -> Scratch {
        self.scratch.take().unwrap_or_default()
    }

    pub(crate) fn put_scratch(&mut self, scratch: Scratch) {
        self.scratch = Some(scratch);
    }

    /// Drops the derived tiers the cache level does not retain: scratch
    /// below 4, feature lists below 3, orderings below 2, adjacency below 1.
    pub fn release(&mut self, cache: u8) {
        if cache < 4 {
            self.scratch = None;
        }
        if cache < 3 {
            self.feats = None;
        }
        if cache < 2 {
            self.sort = None;
        }
        if cache < 1 {
            self.adj = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::Model;
    use crate::pool::StringPool;

    fn edge(model: &Model, src: u32, trg: u32) -> Edge {
        Edge {
            src,
            trg,
            ilbl: model.map_source("a"),
            olbl: model.map_target("a"),
            wgh: [0.0; MAX_REAL],
        }
    }

    fn diamond() -> Fst {
        // 0 -> 1 -> 3 and 0 -> 2 -> 3.
        let model = Model::new(Arc::new(StringPool::new(false)));
        let edges = vec![
            edge(&model, 0, 1),
            edge(&model, 0, 2),
            edge(&model, 1, 3),
            edge(&model, 2, 3),
        ];
        Fst::new(edges, 4, 3, 1.0)
    }

    #[test]
    fn test_adjacency() {
        let mut fst = diamond();
        fst.ensure_adjacency();
        let adj = fst.adjacency();
        assert_eq!(&[] as &[u32], adj.in_arcs(0));
        assert_eq!(&[0, 1], adj.out_arcs(0));
        assert_eq!(&[0], adj.in_arcs(1));
        assert_eq!(&[2], adj.out_arcs(1));
        assert_eq!(&[2, 3], adj.in_arcs(3));
        assert_eq!(&[] as &[u32], adj.out_arcs(3));
        // Pairs: state 1 and state 2 contribute one each.
        assert_eq!(2, adj.num_pairs());
        assert_eq!(0, adj.pair_base(1));
        assert_eq!(1, adj.pair_base(2));
    }

    #[test]
    fn test_toposort_property() {
        let mut fst = diamond();
        fst.ensure_orderings().unwrap();
        let fwd = fst.orderings().fwd.clone();
        assert_eq!(4, fwd.len());
        // Every in-arc of an arc's source appears strictly earlier.
        let pos: Vec<usize> = {
            let mut pos = vec![0; 4];
            for (i, &a) in fwd.iter().enumerate() {
                pos[a as usize] = i;
            }
            pos
        };
        let adj_in: Vec<Vec<u32>> = (0..4)
            .map(|s| fst.adjacency().in_arcs(s).to_vec())
            .collect();
        for (ia, e) in fst.edges().iter().enumerate() {
            for &prev in &adj_in[e.src as usize] {
                assert!(pos[prev as usize] < pos[ia]);
            }
        }
        // Symmetric property backward.
        let bwd = fst.orderings().bwd.clone();
        let pos: Vec<usize> = {
            let mut pos = vec![0; 4];
            for (i, &a) in bwd.iter().enumerate() {
                pos[a as usize] = i;
            }
            pos
        };
        let adj_out: Vec<Vec<u32>> = (0..4)
            .map(|s| fst.adjacency().out_arcs(s).to_vec())
            .collect();
        for (ia, e) in fst.edges().iter().enumerate() {
            for &next in &adj_out[e.trg as usize] {
                assert!(pos[next as usize] < pos[ia]);
            }
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let model = Model::new(Arc::new(StringPool::new(false)));
        let edges = vec![
            edge(&model, 0, 1),
            edge(&model, 1, 2),
            edge(&model, 2, 1),
            edge(&model, 2, 3),
        ];
        let mut fst = Fst::new(edges, 4, 3, 1.0);
        assert!(fst.ensure_orderings().is_err());
    }

    #[test]
    fn test_two_sources_rejected() {
        let model = Model::new(Arc::new(StringPool::new(false)));
        let edges = vec![edge(&model, 0, 2), edge(&model, 1, 2)];
        let mut fst = Fst::new(edges, 3, 2, 1.0);
        assert!(fst.ensure_orderings().is_err());
    }

    #[test]
    fn test_sink_must_be_final() {
        let model = Model::new(Arc::new(StringPool::new(false)));
        let edges = vec![edge(&model, 0, 1), edge(&model, 1, 2)];
        let mut fst = Fst::new(edges, 3, 1, 1.0);
        assert!(fst.ensure_orderings().is_err());
    }

    #[test]
    fn test_release_levels() {
        let mut fst = diamond();
        fst.ensure_orderings().unwrap();
        fst.put_scratch(Scratch::default());
        fst.put_feature_lists(FeatureLists::default());
        fst.release(3);
        assert!(fst.scratch.is_none());
        assert!(fst.feats.is_some());
        fst.release(1);
        assert!(fst.sort.is_none());
        assert!(fst.adj.is_some());
        fst.release(0);
        assert!(fst.adj.is_none());
    }
}
