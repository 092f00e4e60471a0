// (C) 2020 Brandon Lewis
//
// The iteration protocol.
//
// Iterating a mutable container opens a "long transaction": the
// source refuses every mutation until the iterator is released. The
// release is encoded in Drop, so it also happens when a host builtin
// panics mid-iteration; the counter cannot leak on unwind.
//
// A *safe* iterator is bound to a thread and charges one step per
// successful next. safe_iterate is the only way builtins are supposed
// to iterate script values: it rejects non-iterables with the
// Unsupported sentinel, rejects iterators that make no capability
// claims whenever the thread requires anything, and wraps
// under-declared iterators in the per-step charging guard.

use std::rc::Rc;

use crate::caps::SafetyFlags;
use crate::dict::{Dict, Set};
use crate::error::{Error, Result};
use crate::hashtable::NIL;
use crate::list::{List, Range};
use crate::safenum::SafeInt;
use crate::thread::{CancelHandle, Thread};
use crate::value::{ForeignIter, Value};

enum Inner {
    Tuple { items: Rc<Vec<Value>>, pos: usize },
    List { list: Rc<List>, pos: usize },
    Dict { dict: Rc<Dict>, cursor: u32 },
    Set { set: Rc<Set>, cursor: u32 },
    Range { range: Rc<Range>, pos: usize },
    Foreign { iter: Box<dyn ForeignIter> },
}

pub struct ValueIter {
    inner: Inner,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inner::Tuple { pos, .. } => f.debug_struct("Tuple").field("pos", pos).finish(),
            Inner::List { pos, .. } => f.debug_struct("List").field("pos", pos).finish(),
            Inner::Dict { cursor, .. } => f.debug_struct("Dict").field("cursor", cursor).finish(),
            Inner::Set { cursor, .. } => f.debug_struct("Set").field("cursor", cursor).finish(),
            Inner::Range { pos, .. } => f.debug_struct("Range").field("pos", pos).finish(),
            Inner::Foreign { .. } => f.debug_struct("Foreign").finish(),
        }
    }
}

impl std::fmt::Debug for ValueIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueIter").field("inner", &self.inner).finish()
    }
}

impl ValueIter {
    // Errors with the Unsupported sentinel for values that do not
    // implement iteration; callers refine the message.
    pub fn new(value: &Value) -> Result<ValueIter> {
        let inner = match value {
            Value::Tuple(items) => Inner::Tuple { items: items.clone(), pos: 0 },
            Value::List(list) => {
                list.begin_iteration();
                Inner::List { list: list.clone(), pos: 0 }
            }
            Value::Dict(dict) => {
                dict.begin_iteration();
                let cursor = dict.first_cursor();
                Inner::Dict { dict: dict.clone(), cursor }
            }
            Value::Set(set) => {
                set.begin_iteration();
                let cursor = set.first_cursor();
                Inner::Set { set: set.clone(), cursor }
            }
            Value::Range(range) => Inner::Range { range: range.clone(), pos: 0 },
            Value::Foreign(f) => Inner::Foreign { iter: f.iterate()? },
            _ => return Err(Error::Unsupported),
        };
        Ok(ValueIter { inner })
    }

    // Some(caps) for iterators that declare a capability set; the
    // built-in iterators all declare full safety. None means the
    // iterator is not safe-capable at all.
    pub fn declared_safety(&self) -> Option<SafetyFlags> {
        match &self.inner {
            Inner::Foreign { iter } => iter.declared_safety(),
            _ => Some(SafetyFlags::SAFE),
        }
    }
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match &mut self.inner {
            Inner::Tuple { items, pos } => {
                let v = items.get(*pos).cloned();
                *pos += v.is_some() as usize;
                v
            }
            Inner::List { list, pos } => {
                let v = list.get(*pos);
                *pos += v.is_some() as usize;
                v
            }
            Inner::Dict { dict, cursor } => {
                if *cursor == NIL {
                    return None;
                }
                let v = dict.key_at(*cursor);
                *cursor = dict.next_cursor(*cursor);
                Some(v)
            }
            Inner::Set { set, cursor } => {
                if *cursor == NIL {
                    return None;
                }
                let v = set.elem_at(*cursor);
                *cursor = set.next_cursor(*cursor);
                Some(v)
            }
            Inner::Range { range, pos } => {
                let v = range.at(*pos).map(Value::Int);
                *pos += v.is_some() as usize;
                v
            }
            Inner::Foreign { iter } => iter.next(),
        }
    }
}

impl Drop for ValueIter {
    fn drop(&mut self) {
        match &self.inner {
            Inner::List { list, .. } => list.end_iteration(),
            Inner::Dict { dict, .. } => dict.end_iteration(),
            Inner::Set { set, .. } => set.end_iteration(),
            _ => {}
        }
    }
}

// A thread-bound iterator. Each successful next charges one step; a
// budget or cancellation error is terminal and parked in the error
// slot, after which the iterator is exhausted.
#[derive(Debug)]
pub struct SafeIter {
    inner: ValueIter,
    handle: CancelHandle,
    err: Option<Error>,
}

impl SafeIter {
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}

impl Iterator for SafeIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Result<Value>> {
        if self.err.is_some() {
            return None;
        }
        let value = self.inner.next()?;
        match self.handle.add_steps(SafeInt::from(1u32)) {
            Ok(()) => Some(Ok(value)),
            Err(e) => {
                self.err = Some(e.clone());
                Some(Err(e))
            }
        }
    }
}

// The iteration entry point for builtins and the evaluator.
pub fn safe_iterate(thread: &Thread, value: &Value) -> Result<SafeIter> {
    thread.check_cancelled()?;
    let inner = ValueIter::new(value)?;
    match inner.declared_safety() {
        None if !thread.required().is_empty() => Err(Error::Unavailable {
            missing: thread.required(),
        }),
        // An under-declared safe iterator is admitted behind the
        // guard: binding is what makes every next charge a step.
        _ => Ok(SafeIter {
            inner,
            handle: thread.handle(),
            err: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Safety;

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    #[test]
    fn test_iterates_in_insertion_order() {
        let dict = Value::dict();
        if let Value::Dict(d) = &dict {
            for i in [3i64, 1, 2] {
                d.insert(int(i), int(i * 10)).unwrap();
            }
        }
        let keys: Vec<Value> = ValueIter::new(&dict).unwrap().collect();
        assert_eq!(keys, vec![int(3), int(1), int(2)]);
    }

    #[test]
    fn test_non_iterable_is_unsupported() {
        assert!(matches!(
            ValueIter::new(&int(1)),
            Err(Error::Unsupported)
        ));
        assert!(matches!(
            ValueIter::new(&Value::string("abc")),
            Err(Error::Unsupported)
        ));
    }

    #[test]
    fn test_iterator_guard_released_on_drop() {
        let list = Value::list(vec![int(1)]);
        let l = match &list {
            Value::List(l) => l.clone(),
            _ => unreachable!(),
        };
        {
            let _it = ValueIter::new(&list).unwrap();
            assert!(l.push(int(2)).is_err());
        }
        assert!(l.push(int(2)).is_ok());
    }

    #[test]
    fn test_safe_iterate_charges_one_step_per_next() {
        let thread = Thread::new();
        let list = Value::list((0..7).map(int).collect());
        let it = safe_iterate(&thread, &list).unwrap();
        let out: Vec<Value> = it.map(|r| r.unwrap()).collect();
        assert_eq!(out.len(), 7);
        assert_eq!(thread.steps(), 7);
    }

    #[test]
    fn test_safe_iterate_step_budget_is_terminal() {
        let thread = Thread::new();
        thread.set_step_cap(3);
        let list = Value::list((0..10).map(int).collect());
        let mut it = safe_iterate(&thread, &list).unwrap();
        let mut ok = 0;
        let mut failed = false;
        while let Some(r) = it.next() {
            match r {
                Ok(_) => ok += 1,
                Err(e) => {
                    assert_eq!(e, Error::StepBudget);
                    failed = true;
                }
            }
        }
        assert!(failed);
        assert_eq!(ok, 3);
        assert_eq!(it.err(), Some(&Error::StepBudget));
        // Terminal: the iterator stays exhausted.
        assert!(it.next().is_none());
    }

    // A comprehension-shaped workload: iterate a range and build a
    // list under a step cap, then recover with uncancel.
    #[test]
    fn test_step_cap_breach_and_recovery() {
        fn build(thread: &Thread, n: i64) -> Result<Value> {
            let range = Value::range(0, n, 1)?;
            let out = Value::list(Vec::new());
            let list = match &out {
                Value::List(l) => l.clone(),
                _ => unreachable!(),
            };
            for item in safe_iterate(thread, &range)? {
                list.safe_push(thread, item?)?;
            }
            Ok(out)
        }

        let thread = Thread::new();
        thread.set_step_cap(1000);

        // Within budget.
        assert!(build(&thread, 900).is_ok());

        // Over budget: the breach reports synchronously...
        assert_eq!(build(&thread, 10_000).unwrap_err(), Error::StepBudget);

        // ...and every subsequent operation reports cancellation.
        assert_eq!(
            build(&thread, 1).unwrap_err(),
            Error::Cancelled("too many steps".into())
        );

        // Raising the cap and uncancelling restores liveness.
        thread.set_step_cap(thread.steps() + 100);
        thread.uncancel();
        assert!(build(&thread, 10).is_ok());
    }

    #[test]
    fn test_unclaimed_iterator_rejected_under_requirements() {
        use crate::value::{Foreign, ForeignIter};

        #[derive(Debug)]
        struct Naive;

        struct NaiveIter;

        impl ForeignIter for NaiveIter {
            fn next(&mut self) -> Option<Value> {
                None
            }
        }

        impl Foreign for Naive {
            fn type_name(&self) -> &'static str {
                "naive"
            }
            fn iterate(&self) -> Result<Box<dyn ForeignIter>> {
                Ok(Box::new(NaiveIter))
            }
        }

        let v = Value::foreign(Rc::new(Naive));

        // Without requirements the host may iterate freely.
        let thread = Thread::new();
        assert!(safe_iterate(&thread, &v).is_ok());

        // Any requirement rejects an iterator with no claims.
        let mut strict = Thread::new();
        strict.require(Safety::MemSafe.into());
        match safe_iterate(&strict, &v) {
            Err(Error::Unavailable { missing }) => {
                assert_eq!(missing, SafetyFlags::from(Safety::MemSafe));
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_guarded_iterator_charges_under_partial_declaration() {
        use crate::value::{Foreign, ForeignIter};

        #[derive(Debug)]
        struct Counted;

        struct CountedIter {
            left: i64,
        }

        impl ForeignIter for CountedIter {
            fn next(&mut self) -> Option<Value> {
                if self.left == 0 {
                    return None;
                }
                self.left -= 1;
                Some(Value::Int(self.left))
            }
            fn declared_safety(&self) -> Option<SafetyFlags> {
                Some(Safety::MemSafe.into())
            }
        }

        impl Foreign for Counted {
            fn type_name(&self) -> &'static str {
                "counted"
            }
            fn iterate(&self) -> Result<Box<dyn ForeignIter>> {
                Ok(Box::new(CountedIter { left: 5 }))
            }
        }

        // The thread requires more than the iterator declares; the
        // guard admits it but charges every next.
        let mut thread = Thread::new();
        thread.require(SafetyFlags::new(Safety::MemSafe | Safety::CpuSafe));
        let v = Value::foreign(Rc::new(Counted));
        let it = safe_iterate(&thread, &v).unwrap();
        assert_eq!(it.count(), 5);
        assert_eq!(thread.steps(), 5);
    }
}
