//! Model object: the feature table and the label vocabularies.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::errors::{LoglatError, Result};
use crate::hash::{hash_str, hash_words};
use crate::map::Map;
use crate::pool::StringPool;
use crate::utils::AtomicF64;

/// Number of pre-assigned real-valued weight slots on each arc. Slot 0 is
/// the arc's own bias; slots 1.. are coefficients of dense features owned by
/// the model.
pub const MAX_REAL: usize = 1;

const KEY_MASK: u64 = u64::MAX >> 8;

/// Extracts the pattern tag from a feature key.
#[inline(always)]
#[must_use]
pub fn tag_of(key: u64) -> usize {
    ((key >> 56) & 0x7F) as usize
}

/// One side of an arc: the hash of the whole string plus the hashes of its
/// `|`-separated tokens, used by the feature generator.
pub struct Label {
    raw: u64,
    toks: Vec<u64>,
}

impl Label {
    fn new(pool: &StringPool, s: &str, mandatory: bool) -> Self {
        let raw = pool.intern(s, mandatory);
        let toks = s.split('|').map(|t| pool.intern(t, mandatory)).collect();
        Self { raw, toks }
    }

    /// Returns the hash of the whole label string.
    #[inline(always)]
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Returns the hashes of the label tokens.
    #[inline(always)]
    #[must_use]
    pub fn tokens(&self) -> &[u64] {
        &self.toks
    }
}

/// A sparse model parameter with the bookkeeping the optimizer needs.
///
/// `g` and `frq` are written concurrently during a gradient pass; the other
/// fields have a single writer at any time but are shared, so everything is
/// atomic.
#[derive(Default)]
pub struct Feature {
    x: AtomicF64,
    g: AtomicF64,
    gp: AtomicF64,
    stp: AtomicF64,
    dlt: AtomicF64,
    frq: std::sync::atomic::AtomicU32,
}

impl Feature {
    #[inline(always)]
    pub fn weight(&self) -> f64 {
        self.x.get()
    }

    #[inline(always)]
    pub fn set_weight(&self, x: f64) {
        self.x.set(x);
    }

    #[inline(always)]
    pub fn grad(&self) -> f64 {
        self.g.get()
    }

    #[inline(always)]
    pub fn set_grad(&self, g: f64) {
        self.g.set(g);
    }

    /// Atomically accumulates into the gradient.
    #[inline(always)]
    pub fn add_grad(&self, inc: f64) {
        self.g.add(inc);
    }

    #[inline(always)]
    pub fn prev_grad(&self) -> f64 {
        self.gp.get()
    }

    #[inline(always)]
    pub fn set_prev_grad(&self, g: f64) {
        self.gp.set(g);
    }

    #[inline(always)]
    pub fn step(&self) -> f64 {
        self.stp.get()
    }

    #[inline(always)]
    pub fn set_step(&self, stp: f64) {
        self.stp.set(stp);
    }

    #[inline(always)]
    pub fn delta(&self) -> f64 {
        self.dlt.get()
    }

    #[inline(always)]
    pub fn set_delta(&self, dlt: f64) {
        self.dlt.set(dlt);
    }

    #[inline(always)]
    pub fn freq(&self) -> u32 {
        self.frq.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn add_freq(&self) {
        self.frq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn reset_freq(&self) {
        self.frq.store(0, std::sync::atomic::Ordering::Relaxed);
    }
}

/// A dense feature slot: the model-owned parameter multiplying one of the
/// per-arc real weight columns.
pub struct DenseSlot {
    ftr: Arc<Feature>,
    tag: usize,
}

impl DenseSlot {
    #[inline(always)]
    pub fn feature(&self) -> &Arc<Feature> {
        &self.ftr
    }

    #[inline(always)]
    pub fn tag(&self) -> usize {
        self.tag
    }
}

/// The model: feature table, label vocabularies, and per-tag activation
/// windows.
pub struct Model {
    ftrs: Map<Arc<Feature>>,
    src: Map<Arc<Label>>,
    trg: Map<Arc<Label>>,
    pool: Arc<StringPool>,
    dense: Vec<DenseSlot>,
    itr: u32,
    min_freq: u32,
    stt: [u32; 128],
    rem: [u32; 128],
    dump: Option<Mutex<BufWriter<File>>>,
}

impl Model {
    /// Creates a new empty model over the given string pool.
    #[must_use]
    pub fn new(pool: Arc<StringPool>) -> Self {
        let ftrs = Map::new();
        let mut dense = Vec::new();
        for i in 1..MAX_REAL {
            let key = (i as u64 & KEY_MASK) | (((128 - i) as u64) << 56);
            let ftr = Arc::clone(ftrs.insert(key, Arc::new(Feature::default())));
            dense.push(DenseSlot {
                ftr,
                tag: 128 - i,
            });
        }
        Self {
            ftrs,
            src: Map::new(),
            trg: Map::new(),
            pool,
            dense,
            itr: 0,
            min_freq: 0,
            stt: [0; 128],
            rem: [u32::MAX; 128],
            dump: None,
        }
    }

    /// Returns the shared string pool.
    #[inline(always)]
    pub fn pool(&self) -> &StringPool {
        &self.pool
    }

    /// Returns the dense feature slots for arc weight columns 1 and up.
    #[inline(always)]
    pub fn dense_slots(&self) -> &[DenseSlot] {
        &self.dense
    }

    /// Returns the current training iteration.
    #[inline(always)]
    pub fn iteration(&self) -> u32 {
        self.itr
    }

    pub fn set_iteration(&mut self, itr: u32) {
        self.itr = itr;
    }

    #[inline(always)]
    pub fn min_freq(&self) -> u32 {
        self.min_freq
    }

    pub fn set_min_freq(&mut self, min_freq: u32) {
        self.min_freq = min_freq;
    }

    /// Returns the iteration at which features of `tag` become insertable.
    #[inline(always)]
    pub fn tag_start(&self, tag: usize) -> u32 {
        self.stt[tag & 0x7F]
    }

    pub fn set_tag_start(&mut self, tag: usize, itr: u32) {
        self.stt[tag & 0x7F] = itr;
    }

    /// Returns the iteration from which features of `tag` are pruned when
    /// their weight is zero.
    #[inline(always)]
    pub fn tag_remove(&self, tag: usize) -> u32 {
        self.rem[tag & 0x7F]
    }

    pub fn set_tag_remove(&mut self, tag: usize, itr: u32) {
        self.rem[tag & 0x7F] = itr;
    }

    /// Redirects newly created features to a dump sink.
    ///
    /// Dumping requires single-threaded operation so the emission order is
    /// stable; the caller is responsible for forcing one worker.
    pub fn set_dump(&mut self, file: File) {
        self.dump = Some(Mutex::new(BufWriter::new(file)));
    }

    /// Interns a label into the source vocabulary.
    pub fn map_source(&self, s: &str) -> Arc<Label> {
        self.map_label(&self.src, s, false)
    }

    /// Interns a label into the target vocabulary.
    ///
    /// Target strings are mandatory in the pool so decoded paths can be
    /// printed.
    pub fn map_target(&self, s: &str) -> Arc<Label> {
        self.map_label(&self.trg, s, true)
    }

    fn map_label(&self, voc: &Map<Arc<Label>>, s: &str, mandatory: bool) -> Arc<Label> {
        let hash = hash_str(s);
        if let Some(lbl) = voc.find(hash) {
            return Arc::clone(lbl);
        }
        let lbl = Arc::new(Label::new(&self.pool, s, mandatory));
        Arc::clone(voc.insert(hash, lbl))
    }

    /// Returns the feature for `(tag, hashes)`, creating it if the tag is
    /// currently active.
    ///
    /// The key packs the tag into the top byte and a 56-bit content hash of
    /// the item hashes below it. An existing feature is always returned,
    /// regardless of the activation window; a missing one is created only
    /// when `stt[tag] <= iteration < rem[tag]`. With `count_freq`, the
    /// occurrence counter is incremented.
    pub fn add_feature(&self, tag: usize, hashes: &[u64], count_freq: bool) -> Option<Arc<Feature>> {
        debug_assert!(tag < 128);
        debug_assert!(!hashes.is_empty());
        let key = (hash_words(hashes) & KEY_MASK) | ((tag as u64) << 56);
        if let Some(ftr) = self.ftrs.find(key) {
            if count_freq {
                ftr.add_freq();
            }
            return Some(Arc::clone(ftr));
        }
        if self.itr < self.stt[tag] || self.itr >= self.rem[tag] {
            return None;
        }
        let fresh = Arc::new(Feature::default());
        let stored = self.ftrs.insert(key, Arc::clone(&fresh));
        if Arc::ptr_eq(stored, &fresh) {
            if let Some(dump) = &self.dump {
                let mut out = dump.lock().unwrap();
                let _ = write!(out, "{key:016x}");
                for h in hashes {
                    let _ = write!(out, " {h:016x}");
                }
                let _ = writeln!(out);
            }
        }
        if count_freq {
            stored.add_freq();
        }
        Some(Arc::clone(stored))
    }

    /// Returns the number of features in the table.
    pub fn num_features(&self) -> usize {
        self.ftrs.count()
    }

    /// Iterates over `(key, feature)` entries.
    pub fn features(&self) -> crate::map::Iter<'_, Arc<Feature>> {
        self.ftrs.iter()
    }

    /// Looks up a feature by its full key.
    pub fn find_feature(&self, key: u64) -> Option<&Arc<Feature>> {
        self.ftrs.find(key)
    }

    /// Unlinks a feature from the table. Memory is reclaimed by the next
    /// [`Self::purge`].
    pub fn remove_feature(&self, key: u64) -> bool {
        self.ftrs.remove(key).is_some()
    }

    /// Reclaims removed features. Requires quiescence, which the exclusive
    /// borrow proves.
    pub fn purge(&mut self) {
        self.ftrs.purge();
    }

    /// Removes every feature with a zero weight.
    pub fn shrink(&mut self) {
        let zeros: Vec<u64> = self
            .ftrs
            .iter()
            .filter(|(_, f)| f.weight() == 0.0)
            .map(|(k, _)| k)
            .collect();
        for key in zeros {
            self.ftrs.remove(key);
        }
        self.ftrs.purge();
    }

    /// Reports total and active (nonzero-weight) feature counts, per tag at
    /// debug level.
    pub fn log_stats(&self) {
        let mut tot = [0u64; 128];
        let mut act = [0u64; 128];
        for (key, ftr) in self.ftrs.iter() {
            let tag = tag_of(key);
            tot[tag] += 1;
            if ftr.weight() != 0.0 {
                act[tag] += 1;
            }
        }
        for tag in 0..128 {
            if tot[tag] != 0 {
                log::debug!("tag-{}={}/{}", tag, act[tag], tot[tag]);
            }
        }
        let a: u64 = act.iter().sum();
        let t: u64 = tot.iter().sum();
        log::info!("ftr={a}/{t}");
    }

    /// Saves the model: one `key weight` line per feature.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| LoglatError::io(path, e))?;
        let mut out = BufWriter::new(file);
        for (key, ftr) in self.ftrs.iter() {
            writeln!(out, "{key:016x} {:.14}", ftr.weight())
                .map_err(|e| LoglatError::io(path, e))?;
        }
        out.flush().map_err(|e| LoglatError::io(path, e))
    }

    /// Loads feature weights saved by [`Self::save`].
    ///
    /// Unknown keys are inserted even when their tag window would forbid
    /// creating them; the pruning sweep reconciles such features later.
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| LoglatError::io(path, e))?;
        for (ln, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| LoglatError::io(path, e))?;
            let mut toks = line.split_whitespace();
            let (key, wgh) = match (toks.next(), toks.next()) {
                (None, _) => continue,
                (Some(k), Some(w)) => (k, w),
                _ => {
                    return Err(LoglatError::format_at("truncated model record", ln + 1));
                }
            };
            let key = u64::from_str_radix(key, 16)
                .map_err(|_| LoglatError::format_at("bad feature key", ln + 1))?;
            let wgh: f64 = wgh
                .parse()
                .map_err(|_| LoglatError::format_at("bad feature weight", ln + 1))?;
            let ftr = match self.ftrs.find(key) {
                Some(ftr) => Arc::clone(ftr),
                None => Arc::clone(self.ftrs.insert(key, Arc::new(Feature::default()))),
            };
            ftr.set_weight(wgh);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_tokens() {
        let pool = Arc::new(StringPool::new(false));
        let model = Model::new(Arc::clone(&pool));
        let lbl = model.map_target("a|bc|d");
        assert_eq!(hash_str("a|bc|d"), lbl.raw());
        assert_eq!(
            vec![hash_str("a"), hash_str("bc"), hash_str("d")],
            lbl.tokens().to_vec()
        );
        assert_eq!("a|bc|d", pool.get(lbl.raw()));
    }

    #[test]
    fn test_label_interned_once() {
        let pool = Arc::new(StringPool::new(false));
        let model = Model::new(pool);
        let a = model.map_source("x|y");
        let b = model.map_source("x|y");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_add_feature_key_tag() {
        let pool = Arc::new(StringPool::new(false));
        let model = Model::new(pool);
        let hashes = [hash_str("a")];
        assert!(model.add_feature(5, &hashes, false).is_some());
        let (key, _) = model.features().next().unwrap();
        assert_eq!(5, tag_of(key));
        assert_eq!(1, model.num_features());
    }

    #[test]
    fn test_add_feature_window() {
        let pool = Arc::new(StringPool::new(false));
        let mut model = Model::new(pool);
        model.set_tag_start(3, 2);
        let hashes = [hash_str("a")];
        // Inactive tag: nothing created.
        assert!(model.add_feature(3, &hashes, false).is_none());
        assert_eq!(0, model.num_features());
        model.set_iteration(2);
        let ftr = model.add_feature(3, &hashes, false).unwrap();
        // Past the removal point the existing feature is still returned.
        model.set_tag_remove(3, 2);
        let again = model.add_feature(3, &hashes, false).unwrap();
        assert!(Arc::ptr_eq(&ftr, &again));
        // But a fresh key is refused.
        assert!(model.add_feature(3, &[hash_str("b")], false).is_none());
    }

    #[test]
    fn test_frequency_counting() {
        let pool = Arc::new(StringPool::new(false));
        let model = Model::new(pool);
        let hashes = [hash_str("a")];
        let ftr = model.add_feature(0, &hashes, true).unwrap();
        model.add_feature(0, &hashes, true);
        model.add_feature(0, &hashes, false);
        assert_eq!(2, ftr.freq());
    }

    #[test]
    fn test_shrink() {
        let pool = Arc::new(StringPool::new(false));
        let mut model = Model::new(pool);
        let a = model.add_feature(0, &[hash_str("a")], false).unwrap();
        model.add_feature(0, &[hash_str("b")], false);
        a.set_weight(1.5);
        model.shrink();
        assert_eq!(1, model.num_features());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.txt");
        let pool = Arc::new(StringPool::new(false));
        let model = Model::new(pool);
        let weights = [(0usize, "a", 0.5), (1, "b", -2.25), (7, "c", 0.1)];
        for (tag, s, w) in weights {
            let ftr = model.add_feature(tag, &[hash_str(s)], false).unwrap();
            ftr.set_weight(w);
        }
        model.save(&path).unwrap();

        let pool = Arc::new(StringPool::new(false));
        let reloaded = Model::new(pool);
        reloaded.load(&path).unwrap();
        assert_eq!(model.num_features(), reloaded.num_features());
        for (tag, s, w) in weights {
            let ftr = reloaded.add_feature(tag, &[hash_str(s)], false).unwrap();
            assert_eq!(w, ftr.weight());
        }
    }

    #[test]
    fn test_load_lenient_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.txt");
        let pool = Arc::new(StringPool::new(false));
        let model = Model::new(pool);
        let ftr = model.add_feature(4, &[hash_str("a")], false).unwrap();
        ftr.set_weight(3.0);
        model.save(&path).unwrap();

        let pool = Arc::new(StringPool::new(false));
        let mut reloaded = Model::new(pool);
        // The tag is not active, but loading reinserts the feature anyway.
        reloaded.set_tag_start(4, 100);
        reloaded.load(&path).unwrap();
        assert_eq!(1, reloaded.num_features());
    }
}
