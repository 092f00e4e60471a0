// (C) 2020 Brandon Lewis
//
// The hash table backing the mapping and set types.
//
// This is the most heavily instrumented structure in the runtime:
// every mutation, rehash, and iteration goes through the thread's
// accounting and safety gates.
//
// *Representation*
//
// Open hashing with eight-entry buckets and an overflow link per
// bucket. The bucket array length is zero or a power of two, so the
// initial bucket for a hash h is h & (len - 1). The first bucket is
// stored inline (smallvec), so small tables never allocate a bucket
// array.
//
// Entries live in a slab indexed by u32. A bucket slot stores the
// entry's hash and its slab index; hash zero marks a free slot, and
// the hash producer remaps zero to one so no live entry ever hashes
// to zero. Live entries form a doubly-linked insertion-order list
// threaded through the slab, which survives rehashes: growth rebuilds
// the buckets, never the slab, so iteration cursors are stable for as
// long as mutation is banned.
//
// *Budgets*
//
// Walking a bucket costs one step. Growing the bucket array, adding
// an overflow bucket, and taking a fresh slab slot each charge the
// thread for the allocation before it happens. A budget error from
// the thread propagates unchanged and leaves the table untouched.
//
// *Safety gates*
//
// A frozen table, or a table with live iterators, refuses every
// mutation with a verb-specific error. Freezing is transitive over
// keys and values and one-way.

use std::cell::Cell;
use std::mem;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::safenum::SafeInt;
use crate::thread::Thread;
use crate::value::{Value, MAX_COMPARE_DEPTH};

const BUCKET_ENTRIES: usize = 8;
pub(crate) const NIL: u32 = u32::MAX;

// Load factor: grow when entries >= 8 and entries >= 6.5 * buckets.
fn over_loaded(entries: usize, buckets: usize) -> bool {
    entries >= BUCKET_ENTRIES && 2 * entries >= 13 * buckets
}

// --- hash policy ---
//
// Two deterministic string hashes coexist. Internal tables use the
// fast fxhash mixed with a per-process seed, so table layout is not
// observable across processes. Script-visible hashing (the `hash`
// builtin) must be reproducible and uses 32-bit FNV-1a instead.

lazy_static! {
    static ref TABLE_SEED: u64 = {
        use std::collections::hash_map::RandomState;
        use std::hash::{BuildHasher, Hasher};
        let mut h = RandomState::new().build_hasher();
        h.write_u64(0x75_6c_61_72_6b);
        h.finish()
    };
}

fn fold(h: u64) -> u32 {
    let h = ((h >> 32) ^ h) as u32;
    // Zero is the free-slot marker.
    if h == 0 {
        1
    } else {
        h
    }
}

pub(crate) fn seeded_string_hash(s: &str) -> u32 {
    fold(fxhash::hash64(s) ^ *TABLE_SEED)
}

pub(crate) fn seeded_bytes_hash(b: &[u8]) -> u32 {
    fold(fxhash::hash64(b) ^ *TABLE_SEED)
}

// The script-canonical text hash.
pub fn fnv1a_32(text: &str) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for byte in text.bytes() {
        h ^= byte as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

fn charge_steps(thread: Option<&Thread>, n: u64) -> Result<()> {
    match thread {
        Some(t) => t.add_steps(SafeInt::from(n)),
        None => Ok(()),
    }
}

fn charge_allocs(thread: Option<&Thread>, bytes: usize) -> Result<()> {
    match thread {
        Some(t) => t.add_allocs(SafeInt::from(bytes)),
        None => Ok(()),
    }
}

#[derive(Copy, Clone, Default)]
struct Slot {
    hash: u32,
    index: u32,
}

#[derive(Default)]
struct Bucket {
    slots: [Slot; BUCKET_ENTRIES],
    overflow: Option<Box<Bucket>>,
}

impl Bucket {
    // Zero in place, keeping any overflow boxes allocated.
    fn reset(&mut self) {
        self.slots = Default::default();
        if let Some(overflow) = &mut self.overflow {
            overflow.reset();
        }
    }

    fn chain_len(&self) -> u64 {
        1 + self.overflow.as_ref().map_or(0, |o| o.chain_len())
    }
}

struct Entry {
    hash: u32,
    key: Value,
    value: Value,
    prev: u32,
    next: u32,
}

enum Located {
    Found(u32),
    Free(usize, usize),
    // No free slot anywhere in the chain; carries the depth of the
    // last bucket so the caller can hang a fresh overflow off it.
    Full(usize),
}

pub struct Hashtable {
    buckets: SmallVec<[Bucket; 1]>,
    arena: Vec<Option<Entry>>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    len: u32,
    frozen: Cell<bool>,
    iterators: Cell<u32>,
}

impl Hashtable {
    pub fn new() -> Hashtable {
        Hashtable {
            buckets: SmallVec::new(),
            arena: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
            frozen: Cell::new(false),
            iterators: Cell::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get()
    }

    pub fn buckets(&self) -> usize {
        self.buckets.len()
    }

    fn check_mutable(&self, verb: &'static str) -> Result<()> {
        if self.frozen.get() {
            return Err(Error::Frozen { verb, what: "hash table" });
        }
        if self.iterators.get() > 0 {
            return Err(Error::ActiveIteration { verb, what: "hash table" });
        }
        Ok(())
    }

    fn lookup_index(&self, thread: Option<&Thread>, key: &Value) -> Result<Option<u32>> {
        let hash = key.hash()?;
        if self.buckets.is_empty() {
            return Ok(None);
        }
        let mask = self.buckets.len() as u32 - 1;
        let mut bucket = &self.buckets[(hash & mask) as usize];
        loop {
            charge_steps(thread, 1)?;
            for slot in &bucket.slots {
                if slot.hash == hash {
                    let entry = self.arena[slot.index as usize].as_ref().unwrap();
                    if entry.key.equals(key, MAX_COMPARE_DEPTH)? {
                        return Ok(Some(slot.index));
                    }
                }
            }
            match &bucket.overflow {
                Some(overflow) => bucket = overflow,
                None => return Ok(None),
            }
        }
    }

    pub fn lookup(&self, thread: Option<&Thread>, key: &Value) -> Result<Option<Value>> {
        Ok(self
            .lookup_index(thread, key)?
            .map(|i| self.arena[i as usize].as_ref().unwrap().value.clone()))
    }

    pub fn contains(&self, thread: Option<&Thread>, key: &Value) -> Result<bool> {
        Ok(self.lookup_index(thread, key)?.is_some())
    }

    // Walk the chain of one bucket, recording the first free slot.
    fn locate(
        &self,
        thread: Option<&Thread>,
        hash: u32,
        key: &Value,
        bucket_index: usize,
    ) -> Result<Located> {
        let mut bucket = &self.buckets[bucket_index];
        let mut depth = 0;
        let mut free: Option<(usize, usize)> = None;
        loop {
            charge_steps(thread, 1)?;
            for (si, slot) in bucket.slots.iter().enumerate() {
                if slot.hash == hash {
                    let entry = self.arena[slot.index as usize].as_ref().unwrap();
                    if entry.key.equals(key, MAX_COMPARE_DEPTH)? {
                        return Ok(Located::Found(slot.index));
                    }
                } else if slot.hash == 0 && free.is_none() {
                    free = Some((depth, si));
                }
            }
            match &bucket.overflow {
                Some(overflow) => {
                    bucket = overflow;
                    depth += 1;
                }
                None => break,
            }
        }
        Ok(match free {
            Some((free_depth, si)) => Located::Free(free_depth, si),
            None => Located::Full(depth),
        })
    }

    fn chain_slot(&mut self, bucket_index: usize, depth: usize) -> &mut Bucket {
        let mut bucket = &mut self.buckets[bucket_index];
        for _ in 0..depth {
            let cur = bucket;
            bucket = cur.overflow.as_mut().unwrap();
        }
        bucket
    }

    // Take a slab slot and append it to the insertion-order list.
    fn alloc_entry(&mut self, hash: u32, key: Value, value: Value) -> u32 {
        let entry = Entry {
            hash,
            key,
            value,
            prev: self.tail,
            next: NIL,
        };
        let index = match self.free.pop() {
            Some(i) => {
                self.arena[i as usize] = Some(entry);
                i
            }
            None => {
                self.arena.push(Some(entry));
                (self.arena.len() - 1) as u32
            }
        };
        if self.tail != NIL {
            self.arena[self.tail as usize].as_mut().unwrap().next = index;
        } else {
            self.head = index;
        }
        self.tail = index;
        index
    }

    pub fn insert(
        &mut self,
        thread: Option<&Thread>,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>> {
        self.check_mutable("insert")?;
        let hash = key.hash()?;
        if self.buckets.is_empty() {
            charge_allocs(thread, mem::size_of::<Bucket>())?;
            self.buckets.push(Bucket::default());
        }
        loop {
            let mask = self.buckets.len() as u32 - 1;
            let bucket_index = (hash & mask) as usize;
            match self.locate(thread, hash, &key, bucket_index)? {
                Located::Found(index) => {
                    let entry = self.arena[index as usize].as_mut().unwrap();
                    return Ok(Some(mem::replace(&mut entry.value, value)));
                }
                located => {
                    if over_loaded(self.len as usize + 1, self.buckets.len()) {
                        // Grow, then retry from the top: the rehash
                        // cannot introduce duplicates, and re-running
                        // the probe keeps this path simple.
                        self.grow(thread)?;
                        continue;
                    }
                    // Budget everything first so a breach leaves the
                    // table unchanged.
                    if matches!(located, Located::Full(_)) {
                        charge_allocs(thread, mem::size_of::<Bucket>())?;
                    }
                    if self.free.is_empty() {
                        charge_allocs(thread, mem::size_of::<Entry>())?;
                    }
                    let index = self.alloc_entry(hash, key, value);
                    match located {
                        Located::Free(depth, si) => {
                            self.chain_slot(bucket_index, depth).slots[si] =
                                Slot { hash, index };
                        }
                        Located::Full(depth) => {
                            let mut fresh = Box::new(Bucket::default());
                            fresh.slots[0] = Slot { hash, index };
                            self.chain_slot(bucket_index, depth).overflow = Some(fresh);
                        }
                        Located::Found(_) => unreachable!(),
                    }
                    self.len += 1;
                    return Ok(None);
                }
            }
        }
    }

    // Double the bucket count and rebuild the buckets from the slab,
    // in insertion order. The slab itself is untouched.
    fn grow(&mut self, thread: Option<&Thread>) -> Result<()> {
        let new_count = self.buckets.len() * 2;
        charge_allocs(thread, new_count * mem::size_of::<Bucket>())?;
        let mut buckets: SmallVec<[Bucket; 1]> = SmallVec::with_capacity(new_count);
        for _ in 0..new_count {
            buckets.push(Bucket::default());
        }
        let mask = new_count as u32 - 1;
        let mut i = self.head;
        while i != NIL {
            let entry = self.arena[i as usize].as_ref().unwrap();
            Self::place(&mut buckets, mask, entry.hash, i, thread)?;
            i = entry.next;
        }
        self.buckets = buckets;
        Ok(())
    }

    fn place(
        buckets: &mut SmallVec<[Bucket; 1]>,
        mask: u32,
        hash: u32,
        index: u32,
        thread: Option<&Thread>,
    ) -> Result<()> {
        let mut bucket = &mut buckets[(hash & mask) as usize];
        loop {
            let cur = bucket;
            let mut free = None;
            for si in 0..BUCKET_ENTRIES {
                if cur.slots[si].hash == 0 {
                    free = Some(si);
                    break;
                }
            }
            if let Some(si) = free {
                cur.slots[si] = Slot { hash, index };
                return Ok(());
            }
            if cur.overflow.is_none() {
                charge_allocs(thread, mem::size_of::<Bucket>())?;
                cur.overflow = Some(Box::new(Bucket::default()));
            }
            bucket = cur.overflow.as_mut().unwrap();
        }
    }

    pub fn delete(&mut self, thread: Option<&Thread>, key: &Value) -> Result<Option<Value>> {
        self.check_mutable("delete")?;
        let hash = key.hash()?;
        if self.buckets.is_empty() {
            return Ok(None);
        }
        let mask = self.buckets.len() as u32 - 1;
        let mut bucket = &mut self.buckets[(hash & mask) as usize];
        loop {
            charge_steps(thread, 1)?;
            let cur = bucket;
            for si in 0..BUCKET_ENTRIES {
                let slot = cur.slots[si];
                if slot.hash != hash {
                    continue;
                }
                let matches = self.arena[slot.index as usize]
                    .as_ref()
                    .unwrap()
                    .key
                    .equals(key, MAX_COMPARE_DEPTH)?;
                if !matches {
                    continue;
                }
                // The bucket slot is left empty, not compacted.
                cur.slots[si] = Slot::default();
                let entry = self.arena[slot.index as usize].take().unwrap();
                if entry.prev != NIL {
                    self.arena[entry.prev as usize].as_mut().unwrap().next = entry.next;
                } else {
                    self.head = entry.next;
                }
                if entry.next != NIL {
                    self.arena[entry.next as usize].as_mut().unwrap().prev = entry.prev;
                } else {
                    self.tail = entry.prev;
                }
                self.free.push(slot.index);
                self.len -= 1;
                return Ok(Some(entry.value));
            }
            match cur.overflow.as_mut() {
                Some(overflow) => bucket = overflow,
                None => return Ok(None),
            }
        }
    }

    // Capacity is retained; only the contents go away.
    pub fn clear(&mut self, thread: Option<&Thread>) -> Result<()> {
        self.check_mutable("clear")?;
        let total: u64 = self.buckets.iter().map(Bucket::chain_len).sum();
        charge_steps(thread, total)?;
        for bucket in self.buckets.iter_mut() {
            bucket.reset();
        }
        self.arena.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
        Ok(())
    }

    // Count the distinct elements of `values` that are present in the
    // table, exiting early once every live entry has been seen.
    // Duplicates in the input are counted once, via a bitset over slab
    // indices.
    pub fn count_in<I>(&self, thread: Option<&Thread>, values: I) -> Result<usize>
    where
        I: IntoIterator<Item = Result<Value>>,
    {
        let mut seen = vec![0u64; (self.arena.len() + 63) / 64];
        let mut count = 0usize;
        for value in values {
            if count == self.len as usize {
                break;
            }
            let value = value?;
            if let Some(index) = self.lookup_index(thread, &value)? {
                let (word, bit) = (index as usize / 64, index as usize % 64);
                if seen[word] & (1 << bit) == 0 {
                    seen[word] |= 1 << bit;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn freeze(&self) {
        if self.frozen.get() {
            return;
        }
        self.frozen.set(true);
        let mut i = self.head;
        while i != NIL {
            let entry = self.arena[i as usize].as_ref().unwrap();
            entry.key.freeze();
            entry.value.freeze();
            i = entry.next;
        }
    }

    // --- iteration ---
    //
    // Cursors are slab indices into the insertion-order list. They
    // stay valid because begin_iteration bans mutation until the
    // matching end_iteration. A frozen table needs no ban.

    pub fn begin_iteration(&self) {
        if !self.frozen.get() {
            self.iterators.set(self.iterators.get() + 1);
        }
    }

    pub fn end_iteration(&self) {
        if !self.frozen.get() {
            self.iterators.set(self.iterators.get() - 1);
        }
    }

    pub fn first_index(&self) -> u32 {
        self.head
    }

    pub fn next_index(&self, index: u32) -> u32 {
        self.arena[index as usize].as_ref().unwrap().next
    }

    pub fn entry_at(&self, index: u32) -> (&Value, &Value) {
        let entry = self.arena[index as usize].as_ref().unwrap();
        (&entry.key, &entry.value)
    }

    pub fn keys(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.len as usize);
        let mut i = self.head;
        while i != NIL {
            let entry = self.arena[i as usize].as_ref().unwrap();
            out.push(entry.key.clone());
            i = entry.next;
        }
        out
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        let mut out = Vec::with_capacity(self.len as usize);
        let mut i = self.head;
        while i != NIL {
            let entry = self.arena[i as usize].as_ref().unwrap();
            out.push((entry.key.clone(), entry.value.clone()));
            i = entry.next;
        }
        out
    }
}

impl Default for Hashtable {
    fn default() -> Hashtable {
        Hashtable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    fn str(v: &str) -> Value {
        Value::string(v)
    }

    #[test]
    fn test_insert_lookup_delete() {
        let mut t = Hashtable::new();
        assert_eq!(t.insert(None, str("a"), int(1)), Ok(None));
        assert_eq!(t.insert(None, str("b"), int(2)), Ok(None));
        assert_eq!(t.lookup(None, &str("a")), Ok(Some(int(1))));
        assert_eq!(t.lookup(None, &str("c")), Ok(None));
        // Overwrite returns the old value and keeps the length.
        assert_eq!(t.insert(None, str("a"), int(3)), Ok(Some(int(1))));
        assert_eq!(t.len(), 2);
        assert_eq!(t.delete(None, &str("a")), Ok(Some(int(3))));
        assert_eq!(t.lookup(None, &str("a")), Ok(None));
        assert_eq!(t.delete(None, &str("a")), Ok(None));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut t = Hashtable::new();
        for i in 0..100 {
            t.insert(None, int(i), int(i * 10)).unwrap();
        }
        let keys: Vec<Value> = (0..100).map(int).collect();
        assert_eq!(t.keys(), keys);
        // Power-of-two bucket array after growth.
        assert!(t.buckets().is_power_of_two());
        assert!(t.buckets() > 1);
        for i in 0..100 {
            assert_eq!(t.lookup(None, &int(i)), Ok(Some(int(i * 10))));
        }
    }

    #[test]
    fn test_order_across_delete_and_reinsert() {
        let mut t = Hashtable::new();
        for i in 0..10 {
            t.insert(None, int(i), Value::None).unwrap();
        }
        // Removing the newest entry must fix the tail pointer.
        t.delete(None, &int(9)).unwrap();
        t.delete(None, &int(0)).unwrap();
        t.insert(None, int(0), Value::None).unwrap();
        let mut expected: Vec<Value> = (1..9).map(int).collect();
        expected.push(int(0));
        assert_eq!(t.keys(), expected);
    }

    #[test]
    fn test_clear_retains_capacity() {
        let mut t = Hashtable::new();
        for i in 0..50 {
            t.insert(None, int(i), int(i)).unwrap();
        }
        let buckets = t.buckets();
        t.clear(None).unwrap();
        assert_eq!(t.len(), 0);
        assert_eq!(t.buckets(), buckets);
        assert_eq!(t.lookup(None, &int(3)), Ok(None));
        t.insert(None, int(7), int(7)).unwrap();
        assert_eq!(t.keys(), vec![int(7)]);
    }

    #[test]
    fn test_frozen_rejects_mutation() {
        let mut t = Hashtable::new();
        t.insert(None, int(1), int(1)).unwrap();
        t.freeze();
        assert_eq!(
            t.insert(None, int(2), int(2)),
            Err(Error::Frozen { verb: "insert", what: "hash table" })
        );
        assert_eq!(
            t.delete(None, &int(1)),
            Err(Error::Frozen { verb: "delete", what: "hash table" })
        );
        assert_eq!(
            t.clear(None),
            Err(Error::Frozen { verb: "clear", what: "hash table" })
        );
        // Reads still work.
        assert_eq!(t.lookup(None, &int(1)), Ok(Some(int(1))));
    }

    #[test]
    fn test_iteration_bans_mutation() {
        let mut t = Hashtable::new();
        t.insert(None, int(1), int(1)).unwrap();
        t.begin_iteration();
        assert_eq!(
            t.insert(None, int(2), int(2)),
            Err(Error::ActiveIteration { verb: "insert", what: "hash table" })
        );
        t.end_iteration();
        assert_eq!(t.insert(None, int(2), int(2)), Ok(None));
    }

    #[test]
    fn test_unhashable_key() {
        let mut t = Hashtable::new();
        let list = Value::list(vec![int(1)]);
        assert_eq!(
            t.insert(None, list.clone(), int(1)),
            Err(Error::Unhashable("list"))
        );
        assert_eq!(t.lookup(None, &list), Err(Error::Unhashable("list")));
    }

    #[test]
    fn test_lookup_charges_steps() {
        let mut t = Hashtable::new();
        for i in 0..20 {
            t.insert(None, int(i), int(i)).unwrap();
        }
        let thread = Thread::new();
        t.lookup(Some(&thread), &int(3)).unwrap();
        assert!(thread.steps() >= 1);
    }

    #[test]
    fn test_insert_budget_error_propagates() {
        let thread = Thread::new();
        thread.set_alloc_cap(8);
        let mut t = Hashtable::new();
        assert_eq!(
            t.insert(Some(&thread), int(1), int(1)),
            Err(Error::MemoryBudget)
        );
        assert_eq!(t.len(), 0);
    }

    // Inserts on the owning thread race an observer hammering the
    // step counter with +1/-1 pairs; nothing may spuriously overflow.
    #[test]
    fn test_insert_with_concurrent_observer() {
        use crate::safenum::SafeInt;
        use std::thread as os_thread;

        let thread = Thread::new();
        thread.set_step_cap(1_000_000);
        let handle = thread.handle();
        let observer = os_thread::spawn(move || {
            for _ in 0..10_000 {
                handle.add_steps(SafeInt::from(1u32)).unwrap();
                handle.add_steps(SafeInt::from(-1i64)).unwrap();
            }
        });

        let mut t = Hashtable::new();
        for i in 0..100 {
            t.insert(Some(&thread), int(i), int(i)).unwrap();
            thread.check_steps(SafeInt::from(1u32)).unwrap();
        }
        observer.join().unwrap();
        assert_eq!(t.len(), 100);
        for i in 0..100 {
            assert_eq!(t.lookup(None, &int(i)), Ok(Some(int(i))));
        }
    }

    #[test]
    fn test_count_in_dedupes() {
        let mut t = Hashtable::new();
        for i in 0..5 {
            t.insert(None, int(i), Value::None).unwrap();
        }
        let probe: Vec<Result<Value>> =
            vec![Ok(int(0)), Ok(int(0)), Ok(int(3)), Ok(int(99)), Ok(int(4))];
        assert_eq!(t.count_in(None, probe), Ok(3));
    }

    #[test]
    fn test_count_in_early_exit() {
        let mut t = Hashtable::new();
        t.insert(None, int(1), Value::None).unwrap();
        // The unhashable tail is never reached: the count hits the
        // table's live size first.
        let probe: Vec<Result<Value>> = vec![
            Ok(int(1)),
            Ok(Value::list(vec![])),
        ];
        assert_eq!(t.count_in(None, probe), Ok(1));
    }

    #[test]
    fn test_freeze_is_transitive() {
        let mut t = Hashtable::new();
        let inner = Value::list(vec![int(1)]);
        t.insert(None, str("k"), inner.clone()).unwrap();
        t.freeze();
        assert!(inner.is_frozen());
    }

    #[test]
    fn test_fnv1a_32_vectors() {
        // Standard FNV-1a reference values.
        assert_eq!(fnv1a_32(""), 0x811c_9dc5);
        assert_eq!(fnv1a_32("a"), 0xe40c_292c);
        assert_eq!(fnv1a_32("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_seeded_hash_never_zero() {
        for s in &["", "a", "hello", "\0\0\0"] {
            assert_ne!(seeded_string_hash(s), 0);
        }
    }
}
