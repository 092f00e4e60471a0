// (C) 2020 Brandon Lewis
//
// The safe operation layer.
//
// The evaluator and host builtins never touch values directly for
// anything that can allocate, loop, or call back into user code; they
// go through these wrappers, which consult the thread first and
// translate the Unsupported sentinel into messages a script author
// can act on. Budget and cancellation errors pass through unchanged;
// nothing at this layer is allowed to swallow them.

use std::mem;

use crate::builtins::Builtin;
use crate::caps::SafetyFlags;
use crate::error::{Error, Result};
use crate::safenum::SafeInt;
use crate::thread::{round_alloc, Thread};
use crate::value::{BinOp, CompareOp, ReprSink, UnOp, Value, MAX_COMPARE_DEPTH};

// A growing string whose backing store is charged to a thread as it
// grows. Growth is controlled explicitly (doubling, reserve_exact) so
// the charged total is exactly the size-class-rounded capacity.
pub struct SafeStringBuilder<'a> {
    thread: &'a Thread,
    buf: String,
    charged: usize,
}

impl<'a> SafeStringBuilder<'a> {
    pub fn new(thread: &'a Thread) -> SafeStringBuilder<'a> {
        SafeStringBuilder {
            thread,
            buf: String::new(),
            charged: 0,
        }
    }

    pub fn write(&mut self, part: &str) -> Result<()> {
        let needed = self.buf.len() + part.len();
        if needed > self.buf.capacity() {
            let target = needed.max(self.buf.capacity() * 2).max(16);
            let rounded = round_alloc(target);
            let delta = rounded - self.charged;
            self.thread.add_allocs(SafeInt::from(delta))?;
            self.charged = rounded;
            let len = self.buf.len();
            self.buf.reserve_exact(rounded - len);
        }
        self.buf.push_str(part);
        Ok(())
    }

    // Total bytes charged to the thread so far.
    pub fn charged(&self) -> usize {
        self.charged
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

impl ReprSink for SafeStringBuilder<'_> {
    fn write_part(&mut self, part: &str) -> Result<()> {
        self.write(part)
    }
}

// Invoke a callable. The capability check happens here, before the
// function pointer is touched, and a missing-capability failure is
// reported against the callable's name. The debug frame is guard-
// scoped so it unwinds even if the builtin panics.
pub fn safe_call(
    thread: &mut Thread,
    callable: &Value,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    match callable {
        Value::Builtin(b) => {
            let b = b.clone();
            thread.check_permits(b.safety()).map_err(|e| match e {
                Error::Unavailable { missing } => Error::CannotCall {
                    name: b.name().to_string(),
                    missing,
                },
                other => other,
            })?;
            let _frame = thread.frame_guard(b.name());
            b.call_internal(thread, positional, named)
        }
        Value::Foreign(f) => {
            let f = f.clone();
            thread.check_permits(f.declared_safety()).map_err(|e| match e {
                Error::Unavailable { missing } => Error::CannotCall {
                    name: f.type_name().to_string(),
                    missing,
                },
                other => other,
            })?;
            let _frame = thread.frame_guard(f.type_name());
            f.call(thread, positional, named)
        }
        _ => Err(Error::Operation(format!(
            "invalid call of non-function ({})",
            callable.type_name()
        ))),
    }
}

// Binary operation with accounting: one step always, plus the backing
// store of the result for the concatenating cases.
pub fn safe_binary(thread: &Thread, op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    thread.add_steps(SafeInt::from(1u32))?;
    let elem = mem::size_of::<Value>();
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            thread.add_allocs(SafeInt::from(round_alloc(a.len() + b.len())))?;
        }
        (BinOp::Add, Value::Bytes(a), Value::Bytes(b)) => {
            thread.add_allocs(SafeInt::from(round_alloc(a.len() + b.len())))?;
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            thread.add_allocs(SafeInt::from(round_alloc((a.len() + b.len()) * elem)))?;
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            thread.add_allocs(SafeInt::from(round_alloc((a.len() + b.len()) * elem)))?;
        }
        _ => {}
    }
    match Value::binary(op, left, right) {
        Err(Error::Unsupported) => Err(Error::Operation(format!(
            "unsupported binary operation: {} {} {}",
            left.type_name(),
            op,
            right.type_name()
        ))),
        done => done,
    }
}

pub fn safe_unary(thread: &Thread, op: UnOp, operand: &Value) -> Result<Value> {
    thread.add_steps(SafeInt::from(1u32))?;
    match Value::unary(op, operand) {
        Err(Error::Unsupported) => Err(Error::Operation(format!(
            "unsupported unary operation: {} {}",
            op,
            operand.type_name()
        ))),
        done => done,
    }
}

// Comparison is pure and depth-bounded; it needs no thread.
pub fn safe_compare(op: CompareOp, x: &Value, y: &Value) -> Result<bool> {
    match x.compare(op, y, MAX_COMPARE_DEPTH) {
        Err(Error::Unsupported) => Err(Error::Operation(format!(
            "unsupported comparison: {} {} {}",
            x.type_name(),
            op,
            y.type_name()
        ))),
        done => done,
    }
}

// Attribute access that accounts for the returned method closure.
pub fn safe_get_attr(thread: &Thread, value: &Value, name: &str) -> Result<Value> {
    thread.check_cancelled()?;
    let attr = value.attr(name)?;
    if let Value::Builtin(_) = &attr {
        thread.add_allocs(SafeInt::from(round_alloc(mem::size_of::<Builtin>())))?;
    }
    Ok(attr)
}

pub fn safe_set_key(thread: &Thread, mapping: &Value, key: Value, value: Value) -> Result<()> {
    match mapping {
        Value::Dict(d) => {
            d.safe_insert(thread, key, value)?;
            Ok(())
        }
        _ => Err(Error::Operation(format!(
            "{} value does not support key assignment",
            mapping.type_name()
        ))),
    }
}

// The capability-checked, budgeted string form.
pub fn safe_to_string(thread: &Thread, value: &Value) -> Result<String> {
    thread.check_permits(SafetyFlags::SAFE)?;
    let mut sb = SafeStringBuilder::new(thread);
    match value {
        Value::Str(s) => sb.write(s)?,
        _ => {
            let mut visited = Vec::new();
            value.write_repr(&mut sb, &mut visited)?;
        }
    }
    Ok(sb.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::{new_builtin, new_builtin_with_caps};
    use crate::caps::Safety;

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    fn forty_two(
        _thread: &mut Thread,
        _b: &Builtin,
        _pos: &[Value],
        _named: &[(String, Value)],
    ) -> Result<Value> {
        Ok(Value::Int(42))
    }

    #[test]
    fn test_call_admitted_when_declared_superset() {
        // Thread requires {mem, cpu}; builtin declares all four.
        let mut thread = Thread::new();
        thread.require(SafetyFlags::new(Safety::MemSafe | Safety::CpuSafe));
        let f = new_builtin_with_caps("f", SafetyFlags::SAFE, forty_two);
        assert_eq!(safe_call(&mut thread, &f, &[], &[]), Ok(int(42)));
    }

    #[test]
    fn test_call_rejected_when_undeclared() {
        // Thread requires all four; builtin declares nothing.
        let mut thread = Thread::new();
        thread.require(SafetyFlags::SAFE);
        let f = new_builtin("naked", forty_two);
        match safe_call(&mut thread, &f, &[], &[]) {
            Err(Error::CannotCall { name, missing }) => {
                assert_eq!(name, "naked");
                assert_eq!(missing, SafetyFlags::SAFE);
            }
            other => panic!("expected CannotCall, got {:?}", other),
        }
    }

    #[test]
    fn test_call_pushes_and_pops_frame() {
        fn check_depth(
            thread: &mut Thread,
            _b: &Builtin,
            _pos: &[Value],
            _named: &[(String, Value)],
        ) -> Result<Value> {
            Ok(Value::Int(thread.depth() as i64))
        }
        let mut thread = Thread::new();
        let f = new_builtin("probe", check_depth);
        assert_eq!(safe_call(&mut thread, &f, &[], &[]), Ok(int(1)));
        assert_eq!(thread.depth(), 0);
    }

    #[test]
    fn test_call_non_function() {
        let mut thread = Thread::new();
        assert_eq!(
            safe_call(&mut thread, &int(3), &[], &[]),
            Err(Error::Operation("invalid call of non-function (int)".into()))
        );
    }

    #[test]
    fn test_safe_binary_charges_and_refines() {
        let thread = Thread::new();
        assert_eq!(
            safe_binary(&thread, BinOp::Add, &int(1), &int(2)),
            Ok(int(3))
        );
        assert_eq!(thread.steps(), 1);

        let before = thread.allocs();
        let joined = safe_binary(
            &thread,
            BinOp::Add,
            &Value::string("foo"),
            &Value::string("bar"),
        )
        .unwrap();
        assert_eq!(joined, Value::string("foobar"));
        assert!(thread.allocs() > before);

        assert_eq!(
            safe_binary(&thread, BinOp::Sub, &Value::string("a"), &int(1)),
            Err(Error::Operation(
                "unsupported binary operation: string - int".into()
            ))
        );
    }

    #[test]
    fn test_safe_unary_refines() {
        let thread = Thread::new();
        assert_eq!(safe_unary(&thread, UnOp::Neg, &int(3)), Ok(int(-3)));
        assert_eq!(
            safe_unary(&thread, UnOp::Invert, &Value::None),
            Err(Error::Operation(
                "unsupported unary operation: ~ NoneType".into()
            ))
        );
    }

    #[test]
    fn test_safe_compare() {
        assert_eq!(safe_compare(CompareOp::Lt, &int(1), &int(2)), Ok(true));
        assert_eq!(
            safe_compare(CompareOp::Lt, &Value::dict(), &Value::dict()),
            Err(Error::Operation(
                "unsupported comparison: dict < dict".into()
            ))
        );
        // Equality is defined for every type pair.
        assert_eq!(
            safe_compare(CompareOp::Eq, &int(1), &Value::string("1")),
            Ok(false)
        );
    }

    #[test]
    fn test_safe_get_attr_accounts_for_closure() {
        let thread = Thread::new();
        let list = Value::list(vec![int(1)]);
        let method = safe_get_attr(&thread, &list, "append").unwrap();
        assert!(matches!(method, Value::Builtin(_)));
        assert!(thread.allocs() > 0);
        assert!(matches!(
            safe_get_attr(&thread, &list, "nope"),
            Err(Error::NoAttr { .. })
        ));
    }

    #[test]
    fn test_safe_set_key() {
        let thread = Thread::new();
        let dict = Value::dict();
        safe_set_key(&thread, &dict, Value::string("k"), int(1)).unwrap();
        assert_eq!(dict.get(&Value::string("k")), Ok(Some(int(1))));
        assert_eq!(
            safe_set_key(&thread, &int(1), int(0), int(0)),
            Err(Error::Operation(
                "int value does not support key assignment".into()
            ))
        );
    }

    #[test]
    fn test_safe_to_string_budgeted() {
        let thread = Thread::new();
        assert_eq!(
            safe_to_string(&thread, &Value::list(vec![int(1), int(2)])),
            Ok("[1, 2]".to_string())
        );
        assert!(thread.allocs() > 0);

        let tight = Thread::new();
        tight.set_alloc_cap(4);
        assert_eq!(
            safe_to_string(&tight, &Value::string("a long enough string")),
            Err(Error::MemoryBudget)
        );
    }

    #[test]
    fn test_builder_charges_capacity_classes() {
        let thread = Thread::new();
        let mut sb = SafeStringBuilder::new(&thread);
        sb.write("0123456789").unwrap();
        assert_eq!(thread.allocs(), round_alloc(16) as u64);
        assert_eq!(sb.charged(), round_alloc(16));
        // Within capacity: no extra charge.
        sb.write("ab").unwrap();
        assert_eq!(thread.allocs(), round_alloc(16) as u64);
        assert_eq!(sb.finish(), "0123456789ab");
    }

    #[test]
    fn test_cancelled_thread_blocks_operations() {
        let mut thread = Thread::new();
        thread.cancel("deadline");
        let err = Err(Error::Cancelled("deadline".to_string()));
        assert_eq!(safe_binary(&thread, BinOp::Add, &int(1), &int(2)), err.clone());
        assert_eq!(safe_unary(&thread, UnOp::Neg, &int(1)), err.clone());
        assert_eq!(
            safe_get_attr(&thread, &Value::list(vec![]), "append"),
            err.clone()
        );
        let f = new_builtin_with_caps("f", SafetyFlags::SAFE, forty_two);
        assert_eq!(safe_call(&mut thread, &f, &[], &[]), err);
    }
}
