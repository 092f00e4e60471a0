// The mapping and set types. Both are thin shells around the
// insertion-ordered hash table; the table owns the safety gates
// (frozen flag, live-iterator count) and all the accounting.

use std::cell::RefCell;

use crate::error::Result;
use crate::hashtable::Hashtable;
use crate::thread::Thread;
use crate::value::Value;

pub struct Dict {
    table: RefCell<Hashtable>,
}

impl Dict {
    pub fn new() -> Dict {
        Dict { table: RefCell::new(Hashtable::new()) }
    }

    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_frozen(&self) -> bool {
        self.table.borrow().is_frozen()
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        self.table.borrow().lookup(None, key)
    }

    pub fn safe_get(&self, thread: &Thread, key: &Value) -> Result<Option<Value>> {
        self.table.borrow().lookup(Some(thread), key)
    }

    pub fn insert(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.table.borrow_mut().insert(None, key, value)
    }

    pub fn safe_insert(
        &self,
        thread: &Thread,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>> {
        self.table.borrow_mut().insert(Some(thread), key, value)
    }

    pub fn delete(&self, thread: Option<&Thread>, key: &Value) -> Result<Option<Value>> {
        self.table.borrow_mut().delete(thread, key)
    }

    pub fn clear(&self, thread: Option<&Thread>) -> Result<()> {
        self.table.borrow_mut().clear(thread)
    }

    pub fn keys(&self) -> Vec<Value> {
        self.table.borrow().keys()
    }

    pub fn values(&self) -> Vec<Value> {
        self.table.borrow().items().into_iter().map(|(_, v)| v).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.table.borrow().items()
    }

    pub fn freeze(&self) {
        self.table.borrow().freeze();
    }

    // --- iteration cursors (see iter.rs) ---

    pub(crate) fn begin_iteration(&self) {
        self.table.borrow().begin_iteration();
    }

    pub(crate) fn end_iteration(&self) {
        self.table.borrow().end_iteration();
    }

    pub(crate) fn first_cursor(&self) -> u32 {
        self.table.borrow().first_index()
    }

    pub(crate) fn next_cursor(&self, cursor: u32) -> u32 {
        self.table.borrow().next_index(cursor)
    }

    pub(crate) fn key_at(&self, cursor: u32) -> Value {
        self.table.borrow().entry_at(cursor).0.clone()
    }
}

impl Default for Dict {
    fn default() -> Dict {
        Dict::new()
    }
}

impl std::fmt::Debug for Dict {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Dict(len={})", self.len())
    }
}

pub struct Set {
    table: RefCell<Hashtable>,
}

impl Set {
    pub fn new() -> Set {
        Set { table: RefCell::new(Hashtable::new()) }
    }

    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_frozen(&self) -> bool {
        self.table.borrow().is_frozen()
    }

    pub fn contains(&self, value: &Value) -> Result<bool> {
        self.table.borrow().contains(None, value)
    }

    pub fn safe_contains(&self, thread: &Thread, value: &Value) -> Result<bool> {
        self.table.borrow().contains(Some(thread), value)
    }

    pub fn insert(&self, value: Value) -> Result<()> {
        self.table.borrow_mut().insert(None, value, Value::None)?;
        Ok(())
    }

    pub fn safe_insert(&self, thread: &Thread, value: Value) -> Result<()> {
        self.table.borrow_mut().insert(Some(thread), value, Value::None)?;
        Ok(())
    }

    pub fn delete(&self, thread: Option<&Thread>, value: &Value) -> Result<Option<Value>> {
        self.table.borrow_mut().delete(thread, value)
    }

    pub fn clear(&self, thread: Option<&Thread>) -> Result<()> {
        self.table.borrow_mut().clear(thread)
    }

    pub fn elems(&self) -> Vec<Value> {
        self.table.borrow().keys()
    }

    pub fn freeze(&self) {
        self.table.borrow().freeze();
    }

    // Self is a subset of the elements yielded so far iff every live
    // entry was seen; count_in dedupes and exits early.
    pub fn is_subset<I>(&self, thread: Option<&Thread>, values: I) -> Result<bool>
    where
        I: IntoIterator<Item = Result<Value>>,
    {
        let count = self.table.borrow().count_in(thread, values)?;
        Ok(count == self.len())
    }

    pub fn is_superset<I>(&self, thread: Option<&Thread>, values: I) -> Result<bool>
    where
        I: IntoIterator<Item = Result<Value>>,
    {
        let table = self.table.borrow();
        for value in values {
            if !table.contains(thread, &value?)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn union(&self, other: &Set) -> Result<Set> {
        let out = Set::new();
        for v in self.elems() {
            out.insert(v)?;
        }
        for v in other.elems() {
            out.insert(v)?;
        }
        Ok(out)
    }

    pub fn intersection(&self, other: &Set) -> Result<Set> {
        let out = Set::new();
        for v in self.elems() {
            if other.contains(&v)? {
                out.insert(v)?;
            }
        }
        Ok(out)
    }

    pub fn difference(&self, other: &Set) -> Result<Set> {
        let out = Set::new();
        for v in self.elems() {
            if !other.contains(&v)? {
                out.insert(v)?;
            }
        }
        Ok(out)
    }

    pub fn symmetric_difference(&self, other: &Set) -> Result<Set> {
        let out = self.difference(other)?;
        for v in other.elems() {
            if !self.contains(&v)? {
                out.insert(v)?;
            }
        }
        Ok(out)
    }

    // --- iteration cursors (see iter.rs) ---

    pub(crate) fn begin_iteration(&self) {
        self.table.borrow().begin_iteration();
    }

    pub(crate) fn end_iteration(&self) {
        self.table.borrow().end_iteration();
    }

    pub(crate) fn first_cursor(&self) -> u32 {
        self.table.borrow().first_index()
    }

    pub(crate) fn next_cursor(&self, cursor: u32) -> u32 {
        self.table.borrow().next_index(cursor)
    }

    pub(crate) fn elem_at(&self, cursor: u32) -> Value {
        self.table.borrow().entry_at(cursor).0.clone()
    }
}

impl Default for Set {
    fn default() -> Set {
        Set::new()
    }
}

impl std::fmt::Debug for Set {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Set(len={})", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    #[test]
    fn test_dict_basics() {
        let d = Dict::new();
        assert_eq!(d.insert(Value::string("a"), int(1)), Ok(None));
        assert_eq!(d.insert(Value::string("b"), int(2)), Ok(None));
        assert_eq!(d.get(&Value::string("a")), Ok(Some(int(1))));
        assert_eq!(d.keys(), vec![Value::string("a"), Value::string("b")]);
        assert_eq!(d.values(), vec![int(1), int(2)]);
        assert_eq!(d.delete(None, &Value::string("a")), Ok(Some(int(1))));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_dict_freeze_blocks_insert() {
        let d = Dict::new();
        d.insert(int(1), int(1)).unwrap();
        d.freeze();
        assert_eq!(
            d.insert(int(2), int(2)),
            Err(Error::Frozen { verb: "insert", what: "hash table" })
        );
    }

    #[test]
    fn test_set_ops() {
        let a = Set::new();
        let b = Set::new();
        for i in 0..4 {
            a.insert(int(i)).unwrap();
        }
        for i in 2..6 {
            b.insert(int(i)).unwrap();
        }
        assert_eq!(
            a.union(&b).unwrap().elems(),
            (0..6).map(int).collect::<Vec<_>>()
        );
        assert_eq!(
            a.intersection(&b).unwrap().elems(),
            vec![int(2), int(3)]
        );
        assert_eq!(a.difference(&b).unwrap().elems(), vec![int(0), int(1)]);
        assert_eq!(
            a.symmetric_difference(&b).unwrap().elems(),
            vec![int(0), int(1), int(4), int(5)]
        );
    }

    #[test]
    fn test_subset_superset() {
        let a = Set::new();
        for i in 0..3 {
            a.insert(int(i)).unwrap();
        }
        let all: Vec<Result<Value>> = (0..5).map(|i| Ok(int(i))).collect();
        let some: Vec<Result<Value>> = vec![Ok(int(0)), Ok(int(1))];
        assert_eq!(a.is_subset(None, all.clone()), Ok(true));
        assert_eq!(a.is_subset(None, some.clone()), Ok(false));
        assert_eq!(a.is_superset(None, some), Ok(true));
        assert_eq!(a.is_superset(None, all), Ok(false));
        // Duplicates in the probe count once.
        let dup: Vec<Result<Value>> =
            vec![Ok(int(0)), Ok(int(0)), Ok(int(1)), Ok(int(1))];
        assert_eq!(a.is_subset(None, dup), Ok(false));
    }
}
