//! Shared string pool.
//!
//! The core never works with strings directly: every string is hashed on
//! input and only hash values circulate afterwards. The pool stores the
//! inverse mapping from hashes back to strings, which is needed only to
//! print decoded paths and to dump models.
//!
//! Mandatory strings (target-side labels) are always stored; optional ones
//! (source-side labels, pattern names, token fragments) only in store-all
//! mode. The pool is append-only and safe to read and extend concurrently.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::errors::{LoglatError, Result};
use crate::hash::hash_bytes;
use crate::map::Map;

const UNKNOWN: &str = "@@UNKNOWN";

/// Pool mapping 63-bit hashes back to the strings they were computed from.
pub struct StringPool {
    map: Map<Box<str>>,
    all: bool,
}

impl StringPool {
    /// Creates a new empty pool. If `all` is true, every interned string is
    /// stored, otherwise only mandatory ones.
    #[must_use]
    pub fn new(all: bool) -> Self {
        Self {
            map: Map::new(),
            all,
        }
    }

    /// Hashes `buf` and stores the inverse mapping if `mandatory` or the
    /// pool is in store-all mode. Returns the hash.
    pub fn intern_bytes(&self, buf: &[u8], mandatory: bool) -> u64 {
        let hash = hash_bytes(buf);
        if (mandatory || self.all) && self.map.find(hash).is_none() {
            let s = String::from_utf8_lossy(buf).into_owned().into_boxed_str();
            self.map.insert(hash, s);
        }
        hash
    }

    /// Hashes `s` and stores the inverse mapping like [`Self::intern_bytes`].
    pub fn intern(&self, s: &str, mandatory: bool) -> u64 {
        self.intern_bytes(s.as_bytes(), mandatory)
    }

    /// Returns the string associated with `hash`, or a sentinel if the pool
    /// does not know it.
    pub fn get(&self, hash: u64) -> &str {
        self.map.find(hash).map_or(UNKNOWN, |s| s)
    }

    /// Returns the number of stored strings.
    pub fn len(&self) -> usize {
        self.map.count()
    }

    /// Returns `true` if the pool stores no string.
    pub fn is_empty(&self) -> bool {
        self.map.count() == 0
    }

    /// Loads strings from a file, all as mandatory.
    ///
    /// One string per line; the first whitespace-separated token is ignored
    /// (it is the hash when the file comes from [`Self::save`]).
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| LoglatError::io(path, e))?;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| LoglatError::io(path, e))?;
            let rest = line
                .trim_start_matches(|c: char| !c.is_whitespace())
                .trim_start();
            if !rest.is_empty() {
                self.intern(rest, true);
            }
        }
        Ok(())
    }

    /// Saves all stored strings to a file, one `hash string` record per
    /// line.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| LoglatError::io(path, e))?;
        let mut out = BufWriter::new(file);
        for (hash, s) in self.map.iter() {
            writeln!(out, "{hash:016x} {s}").map_err(|e| LoglatError::io(path, e))?;
        }
        out.flush().map_err(|e| LoglatError::io(path, e))
    }
}
