//! Lock-free hash map over 63-bit hashes.
//!
//! This is a split-ordered-list hash table: the canonical structure is a
//! single lock-free sorted singly linked list whose keys are the bit-reversed
//! hashes, with the low bit distinguishing bucket sentinels (0) from data
//! nodes (1). A two-level bucket table stores shortcut pointers into the
//! list; buckets are initialized lazily, each one by inserting a sentinel
//! node after its parent (the bucket index with its most significant set bit
//! cleared). Doubling the table size only adds new entry points, it never
//! moves a node, because the list order is invariant under the doubling.
//!
//! The underlying list is Michael's lock-free sorted list: deletion first
//! tags the victim's `next` pointer (low bit of the pointer value), then
//! unlinks it; searches that encounter a tagged node help with the unlink.
//!
//! Removal never frees memory while shared references may be live. Unlinked
//! nodes are parked in a graveyard reclaimed by [`Map::purge`], which takes
//! `&mut self` so exclusive access proves quiescence. The training loop
//! purges between iterations.
//!
//! References: Shalev & Shavit, "Split-Ordered Lists: Lock-Free Extensible
//! Hash Tables" (JACM 2006); Michael, "High Performance Dynamic Lock-Free
//! Hash Tables and List-Based Sets" (SPAA 2002).

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::SeqCst};
use std::sync::Mutex;

use crate::hash::clear_msb;

const SEGMENT_BITS: usize = 16;
const SEGMENT_SIZE: usize = 1 << SEGMENT_BITS;
const INITIAL_SIZE: usize = 0x10;
const MAX_SIZE: usize = 1 << 32;
const GROW_THRESHOLD: usize = 8;

struct Node<V> {
    next: AtomicPtr<Node<V>>,
    key: u64,
    val: Option<V>,
}

impl<V> Node<V> {
    fn alloc(key: u64, val: Option<V>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            key,
            val,
        }))
    }
}

// Tagged pointers: the low bit marks a node whose successor link is frozen
// because the node is being deleted. Nodes are boxed, so the bit is free.

#[inline(always)]
fn is_tagged<V>(p: *mut Node<V>) -> bool {
    p as usize & 1 == 1
}

#[inline(always)]
fn with_tag<V>(p: *mut Node<V>) -> *mut Node<V> {
    (p as usize | 1) as *mut Node<V>
}

#[inline(always)]
fn without_tag<V>(p: *mut Node<V>) -> *mut Node<V> {
    (p as usize & !1) as *mut Node<V>
}

// Split-order keys: data keys are bit-reversed hashes with the low bit set,
// sentinel keys are bit-reversed bucket indices with the low bit clear. The
// input hashes are 63-bit, so reversal leaves the low bit free.

#[inline(always)]
fn data_key(hash: u64) -> u64 {
    hash.reverse_bits() | 1
}

#[inline(always)]
fn sentinel_key(bucket: u64) -> u64 {
    bucket.reverse_bits() & !1
}

#[inline(always)]
fn key_to_hash(key: u64) -> u64 {
    (key & !1).reverse_bits()
}

#[inline(always)]
fn is_sentinel_key(key: u64) -> bool {
    key & 1 == 0
}

struct Segment<V> {
    slots: Box<[AtomicPtr<Node<V>>]>,
}

impl<V> Segment<V> {
    fn new() -> Self {
        Self {
            slots: (0..SEGMENT_SIZE)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
        }
    }
}

/// A lock-free hash map keyed by 63-bit hashes.
pub struct Map<V> {
    head: Box<Node<V>>,
    segments: Box<[AtomicPtr<Segment<V>>]>,
    size: AtomicUsize,
    count: AtomicUsize,
    graveyard: Mutex<Vec<*mut Node<V>>>,
}

unsafe impl<V: Send + Sync> Send for Map<V> {}
unsafe impl<V: Send + Sync> Sync for Map<V> {}

impl<V> Map<V> {
    /// Creates a new empty map.
    #[must_use]
    pub fn new() -> Self {
        let map = Self {
            head: Box::new(Node {
                next: AtomicPtr::new(ptr::null_mut()),
                key: 0,
                val: None,
            }),
            segments: (0..SEGMENT_SIZE)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            size: AtomicUsize::new(INITIAL_SIZE),
            count: AtomicUsize::new(0),
            graveyard: Mutex::new(Vec::new()),
        };
        // Bucket 0 is the root of the lazy bucket hierarchy and must exist
        // before any operation.
        let segment = Box::into_raw(Box::new(Segment::new()));
        map.segments[0].store(segment, SeqCst);
        let sentinel = Node::alloc(sentinel_key(0), None);
        unsafe {
            let head = map.head_ptr();
            let _ = map.list_insert(head, sentinel);
            (*segment).slots[0].store(sentinel, SeqCst);
        }
        map
    }

    /// Returns the number of entries.
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(SeqCst)
    }

    #[inline]
    fn head_ptr(&self) -> *mut Node<V> {
        &*self.head as *const Node<V> as *mut Node<V>
    }

    /// Searches the list for `key` starting at `head`.
    ///
    /// Returns `(found, prev, cur, next)` such that, at some moment during
    /// the call, `prev -> cur -> next` were consecutive, `prev` and `cur`
    /// were not marked for deletion, and `cur` holds the searched key (found)
    /// or the lowest key greater than it (`cur` may then be null).
    unsafe fn search(
        &self,
        head: *mut Node<V>,
        key: u64,
    ) -> (bool, *mut Node<V>, *mut Node<V>, *mut Node<V>) {
        'retry: loop {
            let mut prev = head;
            let mut cur = (*prev).next.load(SeqCst);
            loop {
                let cur_node = without_tag(cur);
                if cur_node.is_null() {
                    return (false, prev, ptr::null_mut(), ptr::null_mut());
                }
                let cur_key = (*cur_node).key;
                let next = (*cur_node).next.load(SeqCst);
                // The chain is only trusted if prev still points at cur:
                // otherwise some other thread changed the list under us and
                // the walk restarts from the head.
                if (*prev).next.load(SeqCst) != cur_node {
                    continue 'retry;
                }
                if !is_tagged(next) {
                    if cur_key >= key {
                        return (cur_key == key, prev, cur_node, next);
                    }
                    prev = cur_node;
                    cur = next;
                } else {
                    // cur is marked for deletion: help unlink it, or restart
                    // if the chain broke.
                    let next_node = without_tag(next);
                    if (*prev)
                        .next
                        .compare_exchange(cur_node, next_node, SeqCst, SeqCst)
                        .is_err()
                    {
                        continue 'retry;
                    }
                    cur = next_node;
                }
            }
        }
    }

    /// Inserts `node` into the list in key order.
    ///
    /// On success returns `Ok(())`; if the key is already present, returns
    /// the existing node and the caller keeps ownership of `node`.
    unsafe fn list_insert(
        &self,
        head: *mut Node<V>,
        node: *mut Node<V>,
    ) -> Result<(), *mut Node<V>> {
        loop {
            let (found, prev, cur, _) = self.search(head, (*node).key);
            if found {
                return Err(cur);
            }
            (*node).next.store(cur, SeqCst);
            if (*prev)
                .next
                .compare_exchange(cur, node, SeqCst, SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Marks the node with `key` as deleted and unlinks it from the list.
    unsafe fn list_remove(&self, head: *mut Node<V>, key: u64) -> Option<*mut Node<V>> {
        loop {
            let (found, prev, cur, next) = self.search(head, key);
            if !found {
                return None;
            }
            if (*cur)
                .next
                .compare_exchange(next, with_tag(next), SeqCst, SeqCst)
                .is_err()
            {
                continue;
            }
            // The node is now logically deleted. Physically unlink it; on
            // failure a helping search completes the unlink.
            if (*prev)
                .next
                .compare_exchange(cur, next, SeqCst, SeqCst)
                .is_err()
            {
                self.search(head, key);
            }
            return Some(cur);
        }
    }

    /// Returns the list head for `bucket`, initializing the bucket (and,
    /// recursively, its parents) on first touch.
    unsafe fn bucket_head(&self, bucket: u64) -> *mut Node<V> {
        let seg_idx = (bucket >> SEGMENT_BITS) as usize;
        let slot_idx = bucket as usize & (SEGMENT_SIZE - 1);
        let mut segment = self.segments[seg_idx].load(SeqCst);
        if segment.is_null() {
            let fresh = Box::into_raw(Box::new(Segment::new()));
            segment = match self.segments[seg_idx].compare_exchange(
                ptr::null_mut(),
                fresh,
                SeqCst,
                SeqCst,
            ) {
                Ok(_) => fresh,
                Err(existing) => {
                    drop(Box::from_raw(fresh));
                    existing
                }
            };
        }
        let slot = &(*segment).slots[slot_idx];
        let mut head = slot.load(SeqCst);
        if head.is_null() {
            let parent = self.bucket_head(clear_msb(bucket));
            let sentinel = Node::alloc(sentinel_key(bucket), None);
            head = match self.list_insert(parent, sentinel) {
                Ok(()) => sentinel,
                Err(existing) => {
                    drop(Box::from_raw(sentinel));
                    existing
                }
            };
            slot.store(head, SeqCst);
        }
        head
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> u64 {
        hash & (self.size.load(SeqCst) as u64 - 1)
    }

    /// Returns the value associated with `hash`, if present.
    pub fn find(&self, hash: u64) -> Option<&V> {
        let bucket = self.bucket_of(hash);
        unsafe {
            let head = self.bucket_head(bucket);
            let (found, _, cur, _) = self.search(head, data_key(hash));
            if found {
                (*cur).val.as_ref()
            } else {
                None
            }
        }
    }

    /// Inserts `val` under `hash` if the key is absent.
    ///
    /// Returns a reference to the value now associated with the key: the
    /// inserted one, or the previously present one (in which case `val` is
    /// dropped).
    pub fn insert(&self, hash: u64, val: V) -> &V {
        let bucket = self.bucket_of(hash);
        let node = Node::alloc(data_key(hash), Some(val));
        unsafe {
            let head = self.bucket_head(bucket);
            match self.list_insert(head, node) {
                Ok(()) => {
                    let size = self.size.load(SeqCst);
                    let count = self.count.fetch_add(1, SeqCst) + 1;
                    if count / size > GROW_THRESHOLD && size < MAX_SIZE {
                        let _ = self.size.compare_exchange(size, size * 2, SeqCst, SeqCst);
                    }
                    (*node).val.as_ref().unwrap()
                }
                Err(existing) => {
                    drop(Box::from_raw(node));
                    (*existing).val.as_ref().unwrap()
                }
            }
        }
    }

    /// Removes the entry associated with `hash`.
    ///
    /// The entry is unlinked but its memory is only reclaimed by the next
    /// [`Map::purge`]; the returned reference stays valid until then.
    pub fn remove(&self, hash: u64) -> Option<&V> {
        let bucket = self.bucket_of(hash);
        unsafe {
            let head = self.bucket_head(bucket);
            let node = self.list_remove(head, data_key(hash))?;
            self.count.fetch_sub(1, SeqCst);
            self.graveyard.lock().unwrap().push(node);
            (*node).val.as_ref()
        }
    }

    /// Reclaims the memory of removed entries.
    ///
    /// Exclusive access guarantees that no operation holds a reference into
    /// the graveyard.
    pub fn purge(&mut self) {
        let nodes = std::mem::take(&mut *self.graveyard.lock().unwrap());
        for node in nodes {
            unsafe {
                drop(Box::from_raw(node));
            }
        }
    }

    /// Returns a lazy iterator over `(hash, value)` entries in list order.
    ///
    /// The iterator skips bucket sentinels. It is not restartable and
    /// observes a map being concurrently modified on a best-effort basis.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            cur: self.head_ptr(),
            _marker: PhantomData,
        }
    }
}

impl<V> Default for Map<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for Map<V> {
    fn drop(&mut self) {
        unsafe {
            let mut node = without_tag(*self.head.next.get_mut());
            while !node.is_null() {
                let next = without_tag(*(*node).next.get_mut());
                drop(Box::from_raw(node));
                node = next;
            }
            self.purge();
            for slot in self.segments.iter() {
                let segment = slot.load(SeqCst);
                if !segment.is_null() {
                    drop(Box::from_raw(segment));
                }
            }
        }
    }
}

/// Iterator over map entries.
pub struct Iter<'a, V> {
    cur: *mut Node<V>,
    _marker: PhantomData<&'a Map<V>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (u64, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        unsafe {
            loop {
                let next = without_tag((*self.cur).next.load(SeqCst));
                if next.is_null() {
                    return None;
                }
                self.cur = next;
                let key = (*next).key;
                if !is_sentinel_key(key) {
                    return Some((key_to_hash(key), (*next).val.as_ref().unwrap()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::hash::hash_words;

    #[test]
    fn test_insert_find() {
        let map = Map::new();
        for i in 0..100u64 {
            map.insert(hash_words(&[i]), i);
        }
        assert_eq!(100, map.count());
        for i in 0..100u64 {
            assert_eq!(Some(&i), map.find(hash_words(&[i])));
        }
        assert_eq!(None, map.find(hash_words(&[1000])));
    }

    #[test]
    fn test_insert_or_get() {
        let map = Map::new();
        let first = *map.insert(42, 1u64);
        let second = *map.insert(42, 2u64);
        assert_eq!(1, first);
        assert_eq!(1, second);
        assert_eq!(1, map.count());
    }

    #[test]
    fn test_remove() {
        let mut map = Map::new();
        for i in 0..50u64 {
            map.insert(hash_words(&[i]), i);
        }
        for i in (0..50u64).step_by(2) {
            assert_eq!(Some(&i), map.remove(hash_words(&[i])));
        }
        assert_eq!(None, map.remove(hash_words(&[0])));
        assert_eq!(25, map.count());
        for i in 0..50u64 {
            let expected = if i % 2 == 0 { None } else { Some(&i) };
            assert_eq!(expected, map.find(hash_words(&[i])));
        }
        map.purge();
        assert_eq!(25, map.count());
    }

    #[test]
    fn test_iter() {
        let map = Map::new();
        for i in 0..200u64 {
            map.insert(hash_words(&[i]), i);
        }
        let mut values: Vec<u64> = map.iter().map(|(_, &v)| v).collect();
        values.sort_unstable();
        assert_eq!((0..200).collect::<Vec<u64>>(), values);
        for (h, &v) in map.iter() {
            assert_eq!(hash_words(&[v]), h);
        }
    }

    #[test]
    fn test_concurrent_insert() {
        let map = Map::new();
        let per_thread = 1000u64;
        thread::scope(|scope| {
            for t in 0..8u64 {
                let map = &map;
                scope.spawn(move || {
                    for i in 0..per_thread {
                        let key = t * per_thread + i;
                        map.insert(hash_words(&[key]), key);
                    }
                });
            }
        });
        assert_eq!(8000, map.count());
        for key in 0..8 * per_thread {
            assert_eq!(Some(&key), map.find(hash_words(&[key])));
        }
    }

    #[test]
    fn test_concurrent_insert_same_keys() {
        // All threads race on the same keys: exactly one value per key wins
        // and every thread observes a consistent winner.
        let map = Map::new();
        thread::scope(|scope| {
            for t in 0..8u64 {
                let map = &map;
                scope.spawn(move || {
                    for i in 0..500u64 {
                        let v = *map.insert(hash_words(&[i]), t);
                        assert!(v < 8);
                    }
                });
            }
        });
        assert_eq!(500, map.count());
    }

    #[test]
    fn test_concurrent_mixed() {
        let map = Map::new();
        for i in 0..1000u64 {
            map.insert(hash_words(&[i]), i);
        }
        thread::scope(|scope| {
            let m = &map;
            scope.spawn(move || {
                for i in 0..500u64 {
                    m.remove(hash_words(&[i]));
                }
            });
            scope.spawn(move || {
                for i in 1000..1500u64 {
                    m.insert(hash_words(&[i]), i);
                }
            });
            scope.spawn(move || {
                for i in 500..1000u64 {
                    assert_eq!(Some(&i), m.find(hash_words(&[i])));
                }
            });
        });
        assert_eq!(1000, map.count());
        for i in 500..1500u64 {
            assert_eq!(Some(&i), map.find(hash_words(&[i])));
        }
    }
}
