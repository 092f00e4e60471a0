// (C) 2020 Brandon Lewis
//
// Host-registered functions and the sandbox-relevant standard
// builtins.
//
// A builtin is a name, a function pointer, an optional bound
// receiver, and a declared capability set; it is immutable once
// constructed. The declared set is a *claim*; enforcement happens in
// safe_call (ops.rs), which checks the claim against the thread's
// requirements before the pointer is ever invoked. A builtin
// constructed with new() claims nothing and is therefore only
// callable by threads that require nothing.

use std::fmt;
use std::rc::Rc;

use crate::caps::SafetyFlags;
use crate::dict::{Dict, Set};
use crate::error::{Error, Result};
use crate::hashtable::fnv1a_32;
use crate::iter::safe_iterate;
use crate::list::List;
use crate::ops::SafeStringBuilder;
use crate::safenum::SafeInt;
use crate::thread::{round_alloc, Thread};
use crate::value::Value;

pub type NativeFn = fn(&mut Thread, &Builtin, &[Value], &[(String, Value)]) -> Result<Value>;

pub struct Builtin {
    name: String,
    f: NativeFn,
    recv: Option<Value>,
    safety: SafetyFlags,
}

impl Builtin {
    pub fn new(name: &str, f: NativeFn) -> Builtin {
        Builtin {
            name: name.to_string(),
            f,
            recv: None,
            safety: SafetyFlags::NOT_SAFE,
        }
    }

    // Builder-style: consumed and returned so declarations read as
    // Builtin::new(...).declare_safety(...).
    pub fn declare_safety(mut self, caps: SafetyFlags) -> Builtin {
        self.safety = caps;
        self
    }

    // A new closure over the same function with a receiver attached;
    // the declared capabilities carry over.
    pub fn bind_receiver(&self, recv: Value) -> Builtin {
        Builtin {
            name: self.name.clone(),
            f: self.f,
            recv: Some(recv),
            safety: self.safety,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn safety(&self) -> SafetyFlags {
        self.safety
    }

    pub fn receiver(&self) -> Option<&Value> {
        self.recv.as_ref()
    }

    // Invocation without the capability check; the evaluator and
    // hosts go through safe_call instead.
    pub fn call_internal(
        &self,
        thread: &mut Thread,
        positional: &[Value],
        named: &[(String, Value)],
    ) -> Result<Value> {
        (self.f)(thread, self, positional, named)
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

pub fn new_builtin(name: &str, f: NativeFn) -> Value {
    Value::Builtin(Rc::new(Builtin::new(name, f)))
}

pub fn new_builtin_with_caps(name: &str, caps: SafetyFlags, f: NativeFn) -> Value {
    Value::Builtin(Rc::new(Builtin::new(name, f).declare_safety(caps)))
}

// The built-in bindings a host typically installs into its globals.
pub fn universe() -> Vec<(&'static str, Value)> {
    vec![
        ("print", new_builtin_with_caps("print", SafetyFlags::SAFE, print_)),
        ("hash", new_builtin_with_caps("hash", SafetyFlags::SAFE, hash_)),
        ("len", new_builtin_with_caps("len", SafetyFlags::SAFE, len_)),
        ("type", new_builtin_with_caps("type", SafetyFlags::SAFE, type_)),
        ("freeze", new_builtin_with_caps("freeze", SafetyFlags::SAFE, freeze_)),
        ("range", new_builtin_with_caps("range", SafetyFlags::SAFE, range_)),
    ]
}

// --- argument plumbing ---

fn no_named(b: &Builtin, named: &[(String, Value)]) -> Result<()> {
    if named.is_empty() {
        Ok(())
    } else {
        Err(Error::Operation(format!(
            "{}: unexpected keyword argument {:?}",
            b.name(),
            named[0].0
        )))
    }
}

fn arity(b: &Builtin, positional: &[Value], min: usize, max: usize) -> Result<()> {
    if positional.len() < min || positional.len() > max {
        return Err(Error::Operation(format!(
            "{}: got {} arguments, want {}",
            b.name(),
            positional.len(),
            if min == max {
                format!("{}", min)
            } else {
                format!("{} to {}", min, max)
            }
        )));
    }
    Ok(())
}

fn want_int(b: &Builtin, v: &Value) -> Result<i64> {
    match v {
        Value::Int(i) => Ok(*i),
        _ => Err(Error::Operation(format!(
            "{}: got {}, want int",
            b.name(),
            v.type_name()
        ))),
    }
}

fn recv_list(b: &Builtin) -> Result<Rc<List>> {
    match b.receiver() {
        Some(Value::List(l)) => Ok(l.clone()),
        _ => Err(Error::Operation(format!("{}: not bound to a list", b.name()))),
    }
}

fn recv_dict(b: &Builtin) -> Result<Rc<Dict>> {
    match b.receiver() {
        Some(Value::Dict(d)) => Ok(d.clone()),
        _ => Err(Error::Operation(format!("{}: not bound to a dict", b.name()))),
    }
}

fn recv_set(b: &Builtin) -> Result<Rc<Set>> {
    match b.receiver() {
        Some(Value::Set(s)) => Ok(s.clone()),
        _ => Err(Error::Operation(format!("{}: not bound to a set", b.name()))),
    }
}

// Account for a fresh vector of n values before building it.
fn charge_vec(thread: &Thread, n: usize) -> Result<()> {
    thread.add_allocs(SafeInt::from(round_alloc(
        n * std::mem::size_of::<Value>(),
    )))
}

// --- standard builtins ---

// Renders its arguments (str form) into a budgeted string and hands
// the text to the host's print hook. Without a hook the text goes to
// the host error stream and the rendering allocation is refunded:
// the thread never pays for output nobody asked to keep. That refund
// is particular to print, not a general pattern.
fn print_(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    let mut sb = SafeStringBuilder::new(thread);
    for (i, v) in positional.iter().enumerate() {
        if i > 0 {
            sb.write(" ")?;
        }
        match v {
            Value::Str(s) => sb.write(s)?,
            _ => {
                let mut visited = Vec::new();
                v.write_repr(&mut sb, &mut visited)?;
            }
        }
    }
    let charged = sb.charged();
    let text = sb.finish();
    if !thread.emit_print(&text) {
        eprintln!("{}", text);
        thread.add_allocs(SafeInt::from(charged).neg())?;
    }
    Ok(Value::None)
}

// Reproducible 32-bit FNV-1a over text, sign-extended the way the
// dialect exposes it.
fn hash_(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 1)?;
    thread.add_steps(SafeInt::from(1u32))?;
    match &positional[0] {
        Value::Str(s) => Ok(Value::Int(fnv1a_32(s) as i32 as i64)),
        v => Err(Error::Operation(format!(
            "hash: got {}, want string",
            v.type_name()
        ))),
    }
}

fn len_(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 1)?;
    thread.add_steps(SafeInt::from(1u32))?;
    match positional[0].len() {
        Ok(n) => Ok(Value::Int(n as i64)),
        Err(Error::Unsupported) => Err(Error::Operation(format!(
            "len: value of type {} has no len",
            positional[0].type_name()
        ))),
        Err(e) => Err(e),
    }
}

fn type_(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 1)?;
    thread.add_steps(SafeInt::from(1u32))?;
    Ok(Value::string(positional[0].type_name()))
}

fn freeze_(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 1)?;
    thread.add_steps(SafeInt::from(1u32))?;
    positional[0].freeze();
    Ok(positional[0].clone())
}

fn range_(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 3)?;
    thread.add_steps(SafeInt::from(1u32))?;
    match positional.len() {
        1 => Value::range(0, want_int(b, &positional[0])?, 1),
        2 => Value::range(
            want_int(b, &positional[0])?,
            want_int(b, &positional[1])?,
            1,
        ),
        _ => Value::range(
            want_int(b, &positional[0])?,
            want_int(b, &positional[1])?,
            want_int(b, &positional[2])?,
        ),
    }
}

// --- bound methods ---

static LIST_METHODS: &[(&str, NativeFn)] = &[
    ("append", list_append),
    ("clear", list_clear),
    ("extend", list_extend),
];

static DICT_METHODS: &[(&str, NativeFn)] = &[
    ("clear", dict_clear),
    ("get", dict_get),
    ("items", dict_items),
    ("keys", dict_keys),
    ("values", dict_values),
];

static SET_METHODS: &[(&str, NativeFn)] = &[
    ("add", set_add),
    ("clear", set_clear),
    ("issubset", set_issubset),
    ("issuperset", set_issuperset),
    ("remove", set_remove),
];

// Attribute lookup on the container types: a hit closes the method
// over the receiver. Bound methods are fully safe: their effects are
// confined to accounted script values.
pub(crate) fn method_attr(recv: &Value, name: &str) -> Result<Value> {
    let table: &[(&str, NativeFn)] = match recv {
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Set(_) => SET_METHODS,
        _ => &[],
    };
    for (n, f) in table {
        if *n == name {
            let b = Builtin::new(name, *f).declare_safety(SafetyFlags::SAFE);
            return Ok(Value::Builtin(Rc::new(b.bind_receiver(recv.clone()))));
        }
    }
    Err(Error::NoAttr {
        type_name: recv.type_name(),
        attr: name.to_string(),
    })
}

// Appends every positional argument, charging for array growth.
fn list_append(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    let list = recv_list(b)?;
    for v in positional {
        list.safe_push(thread, v.clone())?;
    }
    Ok(Value::None)
}

fn list_clear(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 0, 0)?;
    let list = recv_list(b)?;
    list.clear(Some(&*thread))?;
    Ok(Value::None)
}

fn list_extend(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 1)?;
    let list = recv_list(b)?;
    let it = match safe_iterate(thread, &positional[0]) {
        Err(Error::Unsupported) => Err(Error::Operation(format!(
            "extend: got {}, want iterable",
            positional[0].type_name()
        ))),
        other => other,
    }?;
    for v in it {
        list.safe_push(thread, v?)?;
    }
    Ok(Value::None)
}

fn dict_clear(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 0, 0)?;
    recv_dict(b)?.clear(Some(&*thread))?;
    Ok(Value::None)
}

fn dict_get(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 2)?;
    let dict = recv_dict(b)?;
    match dict.safe_get(thread, &positional[0])? {
        Some(v) => Ok(v),
        None => Ok(positional.get(1).cloned().unwrap_or(Value::None)),
    }
}

fn dict_items(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 0, 0)?;
    let dict = recv_dict(b)?;
    charge_vec(thread, dict.len())?;
    let items = dict
        .items()
        .into_iter()
        .map(|(k, v)| Value::tuple(vec![k, v]))
        .collect();
    Ok(Value::list(items))
}

fn dict_keys(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 0, 0)?;
    let dict = recv_dict(b)?;
    charge_vec(thread, dict.len())?;
    Ok(Value::list(dict.keys()))
}

fn dict_values(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 0, 0)?;
    let dict = recv_dict(b)?;
    charge_vec(thread, dict.len())?;
    Ok(Value::list(dict.values()))
}

fn set_add(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 1)?;
    recv_set(b)?.safe_insert(thread, positional[0].clone())?;
    Ok(Value::None)
}

fn set_clear(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 0, 0)?;
    recv_set(b)?.clear(Some(&*thread))?;
    Ok(Value::None)
}

fn set_remove(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 1)?;
    let set = recv_set(b)?;
    match set.delete(Some(&*thread), &positional[0])? {
        Some(_) => Ok(Value::None),
        None => Err(Error::Operation(format!(
            "remove: {} not in set",
            positional[0].to_repr()
        ))),
    }
}

fn set_issubset(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 1)?;
    let set = recv_set(b)?;
    let it = safe_iterate(thread, &positional[0])?;
    Ok(Value::Bool(set.is_subset(Some(&*thread), it)?))
}

fn set_issuperset(
    thread: &mut Thread,
    b: &Builtin,
    positional: &[Value],
    named: &[(String, Value)],
) -> Result<Value> {
    no_named(b, named)?;
    arity(b, positional, 1, 1)?;
    let set = recv_set(b)?;
    let it = safe_iterate(thread, &positional[0])?;
    Ok(Value::Bool(set.is_superset(Some(&*thread), it)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    fn call(thread: &mut Thread, v: &Value, pos: &[Value]) -> Result<Value> {
        match v {
            Value::Builtin(b) => b.call_internal(thread, pos, &[]),
            _ => panic!("not a builtin"),
        }
    }

    fn lookup(name: &str) -> Value {
        universe()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .unwrap()
    }

    #[test]
    fn test_builtin_declarations() {
        let b = Builtin::new("f", len_);
        assert_eq!(b.safety(), SafetyFlags::NOT_SAFE);
        let b = b.declare_safety(SafetyFlags::SAFE);
        assert_eq!(b.safety(), SafetyFlags::SAFE);
        let bound = b.bind_receiver(int(1));
        assert_eq!(bound.safety(), SafetyFlags::SAFE);
        assert_eq!(bound.receiver(), Some(&int(1)));
        assert_eq!(bound.name(), "f");
    }

    #[test]
    fn test_print_uses_hook() {
        let mut thread = Thread::new();
        let seen = Rc::new(RefCell::new(String::new()));
        let sink = seen.clone();
        thread.set_print_hook(move |text| {
            sink.borrow_mut().push_str(text);
        });
        let print = lookup("print");
        call(&mut thread, &print, &[Value::string("x ="), int(3)]).unwrap();
        assert_eq!(*seen.borrow(), "x = 3");
        // With a hook the rendering stays charged.
        assert!(thread.allocs() > 0);
    }

    #[test]
    fn test_print_without_hook_refunds() {
        let mut thread = Thread::new();
        let print = lookup("print");
        call(&mut thread, &print, &[Value::string("unseen")]).unwrap();
        assert_eq!(thread.allocs(), 0);
    }

    #[test]
    fn test_hash_is_fnv1a() {
        let mut thread = Thread::new();
        let hash = lookup("hash");
        assert_eq!(
            call(&mut thread, &hash, &[Value::string("foobar")]),
            Ok(int(0xbf9c_f968u32 as i32 as i64))
        );
        assert_eq!(
            call(&mut thread, &hash, &[int(1)]),
            Err(Error::Operation("hash: got int, want string".into()))
        );
    }

    #[test]
    fn test_len_and_type() {
        let mut thread = Thread::new();
        assert_eq!(
            call(&mut thread, &lookup("len"), &[Value::string("abc")]),
            Ok(int(3))
        );
        assert_eq!(
            call(&mut thread, &lookup("len"), &[int(1)]),
            Err(Error::Operation("len: value of type int has no len".into()))
        );
        assert_eq!(
            call(&mut thread, &lookup("type"), &[Value::dict()]),
            Ok(Value::string("dict"))
        );
    }

    #[test]
    fn test_range_builtin() {
        let mut thread = Thread::new();
        let range = lookup("range");
        let r = call(&mut thread, &range, &[int(3)]).unwrap();
        assert_eq!(r.len(), Ok(3));
        let r = call(&mut thread, &range, &[int(1), int(7), int(2)]).unwrap();
        assert_eq!(r.index(2), Ok(int(5)));
    }

    #[test]
    fn test_list_append_method() {
        let mut thread = Thread::new();
        let list = Value::list(vec![int(1), int(3), int(5)]);
        let append = list.attr("append").unwrap();
        call(&mut thread, &append, &[int(-1), int(-1)]).unwrap();
        assert_eq!(
            list,
            Value::list(vec![int(1), int(3), int(5), int(-1), int(-1)])
        );
        assert!(thread.allocs() > 0);
    }

    #[test]
    fn test_dict_methods() {
        let mut thread = Thread::new();
        let dict = Value::dict();
        if let Value::Dict(d) = &dict {
            d.insert(Value::string("a"), int(1)).unwrap();
            d.insert(Value::string("b"), int(2)).unwrap();
        }
        let get = dict.attr("get").unwrap();
        assert_eq!(
            call(&mut thread, &get, &[Value::string("a")]),
            Ok(int(1))
        );
        assert_eq!(
            call(&mut thread, &get, &[Value::string("z"), int(9)]),
            Ok(int(9))
        );
        let keys = dict.attr("keys").unwrap();
        assert_eq!(
            call(&mut thread, &keys, &[]),
            Ok(Value::list(vec![Value::string("a"), Value::string("b")]))
        );
        let items = dict.attr("items").unwrap();
        assert_eq!(
            call(&mut thread, &items, &[]),
            Ok(Value::list(vec![
                Value::tuple(vec![Value::string("a"), int(1)]),
                Value::tuple(vec![Value::string("b"), int(2)]),
            ]))
        );
    }

    #[test]
    fn test_set_methods() {
        let mut thread = Thread::new();
        let set = Value::set();
        let add = set.attr("add").unwrap();
        for i in 0..3 {
            call(&mut thread, &add, &[int(i)]).unwrap();
        }
        let issubset = set.attr("issubset").unwrap();
        assert_eq!(
            call(&mut thread, &issubset, &[Value::list((0..5).map(int).collect())]),
            Ok(Value::Bool(true))
        );
        let issuperset = set.attr("issuperset").unwrap();
        assert_eq!(
            call(&mut thread, &issuperset, &[Value::list(vec![int(0), int(2)])]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            call(&mut thread, &issuperset, &[Value::list(vec![int(9)])]),
            Ok(Value::Bool(false))
        );
        let remove = set.attr("remove").unwrap();
        call(&mut thread, &remove, &[int(1)]).unwrap();
        assert_eq!(
            call(&mut thread, &remove, &[int(1)]),
            Err(Error::Operation("remove: 1 not in set".into()))
        );
    }

    #[test]
    fn test_extend_rejects_non_iterable() {
        let mut thread = Thread::new();
        let list = Value::list(vec![]);
        let extend = list.attr("extend").unwrap();
        assert_eq!(
            call(&mut thread, &extend, &[int(1)]),
            Err(Error::Operation("extend: got int, want iterable".into()))
        );
    }
}
