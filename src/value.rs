// (C) 2020 Brandon Lewis
//
// The runtime value model.
//
// *Values*
//
// - none, bool, int, float, string, bytes, tuple, list, dict, set,
//   range, builtin (optionally bound to a receiver).
//
// Built-in variants form a closed tagged union; host-registered types
// hang off the single Foreign extension trait. Values are
// reference-like: cheap to clone, shared via Rc, with interior
// mutability and a one-way frozen flag on the mutable payloads.
//
// *Contract*
//
// Every value has a type name, a truth value, a transitive one-way
// freeze, a hash (which may fail: mutable containers are unhashable),
// and two string forms (str and repr). Everything else is optional
// capability: comparison, arithmetic, indexing, slicing, membership,
// attributes. An operand that does not implement an operation
// declines with the well-known Unsupported sentinel so the dispatch
// site can refine the message.
//
// *Cycles*
//
// Lists and mappings can contain themselves. Printing carries an
// explicit visited-path list and renders "..." at a revisit;
// comparison carries a depth counter and fails at zero. Neither
// relies on the host language noticing the cycle.

use std::fmt;
use std::rc::Rc;

use crate::builtins::Builtin;
use crate::caps::SafetyFlags;
use crate::dict::{Dict, Set};
use crate::error::{Error, Result};
use crate::hashtable::{seeded_bytes_hash, seeded_string_hash};
use crate::list::{slice_seq, List, Range};
use crate::thread::Thread;

// Bound on recursive comparison of (possibly cyclic) containers.
pub const MAX_COMPARE_DEPTH: u32 = 100;

// Arithmetic and logic operations.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    In,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UnOp {
    Neg,
    Plus,
    Invert,
    Not,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::In => "in",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for UnOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            UnOp::Neg => "-",
            UnOp::Plus => "+",
            UnOp::Invert => "~",
            UnOp::Not => "not",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

// Which operand a foreign binary dispatch is standing in for.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Side {
    Left,
    Right,
}

// The extension point for host-registered value types. Everything has
// a conservative default: opaque, truthy, unhashable, implements
// nothing. A foreign iterator additionally states whether it is
// safe-capable (declares its own capability set); None means the
// sandbox must reject it whenever the thread requires anything.
pub trait Foreign: fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn truth(&self) -> bool {
        true
    }

    fn freeze(&self) {}

    fn hash(&self) -> Result<u32> {
        Err(Error::Unhashable(self.type_name()))
    }

    fn repr(&self) -> String {
        format!("<{}>", self.type_name())
    }

    fn attr(&self, attr: &str) -> Result<Value> {
        Err(Error::NoAttr {
            type_name: self.type_name(),
            attr: attr.to_string(),
        })
    }

    fn iterate(&self) -> Result<Box<dyn ForeignIter>> {
        Err(Error::Unsupported)
    }

    fn call(
        &self,
        _thread: &mut Thread,
        _positional: &[Value],
        _named: &[(String, Value)],
    ) -> Result<Value> {
        Err(Error::Unsupported)
    }

    fn declared_safety(&self) -> SafetyFlags {
        SafetyFlags::NOT_SAFE
    }

    fn binary(&self, _op: BinOp, _other: &Value, _side: Side) -> Result<Value> {
        Err(Error::Unsupported)
    }

    fn unary(&self, _op: UnOp) -> Result<Value> {
        Err(Error::Unsupported)
    }
}

pub trait ForeignIter {
    fn next(&mut self) -> Option<Value>;

    // Some(caps) marks a safe-capable iterator; None means the
    // iterator makes no claims at all.
    fn declared_safety(&self) -> Option<SafetyFlags> {
        None
    }
}

#[derive(Clone, Debug)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<String>),
    Bytes(Rc<Vec<u8>>),
    Tuple(Rc<Vec<Value>>),
    List(Rc<List>),
    Dict(Rc<Dict>),
    Set(Rc<Set>),
    Range(Rc<Range>),
    Builtin(Rc<Builtin>),
    Foreign(Rc<dyn Foreign>),
}

fn overflow() -> Error {
    Error::Operation("integer overflow".to_string())
}

fn nonzero(h: u32) -> u32 {
    if h == 0 {
        1
    } else {
        h
    }
}

fn hash_i64(v: i64) -> u32 {
    let u = (v as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    nonzero(((u >> 32) ^ u) as u32)
}

// Floored division, the convention scripts expect: -7 // 2 == -4.
fn floor_div(a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        return Err(Error::Operation("integer division by zero".to_string()));
    }
    let q = a.checked_div(b).ok_or_else(overflow)?;
    if a % b != 0 && (a < 0) != (b < 0) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn floor_mod(a: i64, b: i64) -> Result<i64> {
    let q = floor_div(a, b)?;
    Ok(a - q * b)
}

fn shift_amount(b: i64) -> Result<u32> {
    if (0..64).contains(&b) {
        Ok(b as u32)
    } else {
        Err(Error::Operation("shift count out of range".to_string()))
    }
}

// Factors out the boiler plate in operator method implementations.
//
// Each matcher takes the method name and a white-list of operand
// patterns that actually implement the operator; anything not listed
// declines with the Unsupported sentinel, and the dispatch site
// refines the message.
macro_rules! operator {
    (un $name:ident { $( $p:pat => $e:expr ),+ $(,)? }) => {
        pub fn $name (&self) -> Result<Value> {
            use Value::*;
            #[allow(unreachable_patterns)]
            match self {
                $($p => Ok($e)),+ ,
                _ => Err(Error::Unsupported)
            }
        }
    };

    (bin $name:ident { $( $p:pat => $e:expr ),+ $(,)? }) => {
        pub fn $name (&self, other: &Value) -> Result<Value> {
            use Value::*;
            #[allow(unreachable_patterns)]
            match (self, other) {
                $($p => Ok($e)),+ ,
                _ => Err(Error::Unsupported)
            }
        }
    };
}

impl Value {
    pub fn string(s: &str) -> Value {
        Value::Str(Rc::new(s.to_string()))
    }

    pub fn bytes(b: Vec<u8>) -> Value {
        Value::Bytes(Rc::new(b))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(List::new(items)))
    }

    pub fn dict() -> Value {
        Value::Dict(Rc::new(Dict::new()))
    }

    pub fn set() -> Value {
        Value::Set(Rc::new(Set::new()))
    }

    pub fn range(start: i64, stop: i64, step: i64) -> Result<Value> {
        Ok(Value::Range(Rc::new(Range::new(start, stop, step)?)))
    }

    pub fn foreign(f: Rc<dyn Foreign>) -> Value {
        Value::Foreign(f)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Foreign(f) => f.type_name(),
        }
    }

    pub fn truth(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::List(l) => l.len() > 0,
            Value::Dict(d) => d.len() > 0,
            Value::Set(s) => s.len() > 0,
            Value::Range(r) => r.len() > 0,
            Value::Builtin(_) => true,
            Value::Foreign(f) => f.truth(),
        }
    }

    // Transitive, idempotent, one-way.
    pub fn freeze(&self) {
        match self {
            Value::Tuple(t) => {
                for v in t.iter() {
                    v.freeze();
                }
            }
            Value::List(l) => l.freeze(),
            Value::Dict(d) => d.freeze(),
            Value::Set(s) => s.freeze(),
            Value::Builtin(b) => {
                if let Some(recv) = b.receiver() {
                    recv.freeze();
                }
            }
            Value::Foreign(f) => f.freeze(),
            _ => {}
        }
    }

    // Immutable values count as frozen.
    pub fn is_frozen(&self) -> bool {
        match self {
            Value::Tuple(t) => t.iter().all(Value::is_frozen),
            Value::List(l) => l.is_frozen(),
            Value::Dict(d) => d.is_frozen(),
            Value::Set(s) => s.is_frozen(),
            _ => true,
        }
    }

    // Never returns zero: zero marks a free table slot, so the
    // producer remaps it to one.
    pub fn hash(&self) -> Result<u32> {
        match self {
            Value::None => Ok(0x23d6_7f4b),
            Value::Bool(false) => Ok(0x2f00_7d17),
            Value::Bool(true) => Ok(0x7c30_d2a5),
            Value::Int(i) => Ok(hash_i64(*i)),
            Value::Float(f) => {
                // An integral float must hash like the equal int.
                let f = if *f == 0.0 { 0.0 } else { *f };
                if f == f.trunc() && f.abs() < 9_007_199_254_740_992.0 {
                    Ok(hash_i64(f as i64))
                } else {
                    Ok(nonzero(((f.to_bits() >> 32) ^ f.to_bits()) as u32))
                }
            }
            Value::Str(s) => Ok(seeded_string_hash(s)),
            Value::Bytes(b) => Ok(seeded_bytes_hash(b)),
            Value::Tuple(t) => {
                let mut h: u32 = 0x3456_789d;
                for v in t.iter() {
                    h = h.wrapping_mul(0x0100_0193) ^ v.hash()?;
                }
                Ok(nonzero(h))
            }
            Value::List(_) | Value::Dict(_) | Value::Set(_) | Value::Range(_) => {
                Err(Error::Unhashable(self.type_name()))
            }
            Value::Builtin(b) => Ok(seeded_string_hash(b.name())),
            Value::Foreign(f) => f.hash(),
        }
    }

    // Structural equality, bounded by depth to survive cyclic values.
    pub fn equals(&self, other: &Value, depth: u32) -> Result<bool> {
        use Value::*;
        match (self, other) {
            (None, None) => Ok(true),
            (Bool(a), Bool(b)) => Ok(a == b),
            (Int(a), Int(b)) => Ok(a == b),
            (Float(a), Float(b)) => Ok(a == b),
            (Int(a), Float(b)) | (Float(b), Int(a)) => Ok(*a as f64 == *b),
            (Str(a), Str(b)) => Ok(a == b),
            (Bytes(a), Bytes(b)) => Ok(a == b),
            (Tuple(a), Tuple(b)) => eq_elements(a, b, depth),
            (List(a), List(b)) => {
                let a = a.items();
                let b = b.items();
                eq_elements(&a, &b, depth)
            }
            (Dict(a), Dict(b)) => {
                if depth == 0 {
                    return Err(Error::ComparisonDepth);
                }
                if a.len() != b.len() {
                    return Ok(false);
                }
                for (k, v) in a.items() {
                    match b.get(&k)? {
                        Option::Some(w) if v.equals(&w, depth - 1)? => {}
                        _ => return Ok(false),
                    }
                }
                Ok(true)
            }
            (Set(a), Set(b)) => {
                if depth == 0 {
                    return Err(Error::ComparisonDepth);
                }
                if a.len() != b.len() {
                    return Ok(false);
                }
                for v in a.elems() {
                    if !b.contains(&v)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (Range(a), Range(b)) => Ok(a.same_sequence(b)),
            (Builtin(a), Builtin(b)) => Ok(Rc::ptr_eq(a, b)),
            (Foreign(a), Foreign(b)) => {
                Ok(Rc::ptr_eq(a, b) || std::ptr::eq(a.as_ref(), b.as_ref()))
            }
            _ => Ok(false),
        }
    }

    // Three-way comparison for the ordered subset of types. Unordered
    // operands decline with the sentinel.
    pub fn cmp_values(&self, other: &Value, depth: u32) -> Result<std::cmp::Ordering> {
        use Value::*;
        match (self, other) {
            (Int(a), Int(b)) => Ok(a.cmp(b)),
            (Float(a), Float(b)) => a
                .partial_cmp(b)
                .ok_or_else(|| Error::Operation("cannot compare NaN".to_string())),
            (Int(a), Float(b)) => (*a as f64)
                .partial_cmp(b)
                .ok_or_else(|| Error::Operation("cannot compare NaN".to_string())),
            (Float(a), Int(b)) => a
                .partial_cmp(&(*b as f64))
                .ok_or_else(|| Error::Operation("cannot compare NaN".to_string())),
            (Str(a), Str(b)) => Ok(a.cmp(b)),
            (Bytes(a), Bytes(b)) => Ok(a.cmp(b)),
            (Bool(a), Bool(b)) => Ok(a.cmp(b)),
            (Tuple(a), Tuple(b)) => cmp_elements(a, b, depth),
            (List(a), List(b)) => {
                let a = a.items();
                let b = b.items();
                cmp_elements(&a, &b, depth)
            }
            _ => Err(Error::Unsupported),
        }
    }

    // One of the six comparison operators. Equality works on every
    // type; ordering only on the ordered ones.
    pub fn compare(&self, op: CompareOp, other: &Value, depth: u32) -> Result<bool> {
        use std::cmp::Ordering;
        match op {
            CompareOp::Eq => self.equals(other, depth),
            CompareOp::Ne => Ok(!self.equals(other, depth)?),
            _ => {
                let ord = self.cmp_values(other, depth)?;
                Ok(match op {
                    CompareOp::Lt => ord == Ordering::Less,
                    CompareOp::Le => ord != Ordering::Greater,
                    CompareOp::Gt => ord == Ordering::Greater,
                    CompareOp::Ge => ord != Ordering::Less,
                    CompareOp::Eq | CompareOp::Ne => unreachable!(),
                })
            }
        }
    }

    operator! { bin add {
        (Int(a), Int(b)) => Int(a.checked_add(*b).ok_or_else(overflow)?),
        (Float(a), Float(b)) => Float(a + b),
        (Int(a), Float(b)) => Float(*a as f64 + b),
        (Float(a), Int(b)) => Float(a + *b as f64),
        (Str(a), Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Str(Rc::new(s))
        },
        (Bytes(a), Bytes(b)) => {
            let mut v = Vec::with_capacity(a.len() + b.len());
            v.extend_from_slice(a);
            v.extend_from_slice(b);
            Bytes(Rc::new(v))
        },
        (Tuple(a), Tuple(b)) => {
            let mut v = a.as_ref().clone();
            v.extend_from_slice(b);
            Tuple(Rc::new(v))
        },
        (List(a), List(b)) => {
            let mut v = a.items();
            v.extend(b.items());
            Value::list(v)
        },
    } }

    operator! { bin sub {
        (Int(a), Int(b)) => Int(a.checked_sub(*b).ok_or_else(overflow)?),
        (Float(a), Float(b)) => Float(a - b),
        (Int(a), Float(b)) => Float(*a as f64 - b),
        (Float(a), Int(b)) => Float(a - *b as f64),
        (Set(a), Set(b)) => Set(Rc::new(a.difference(b)?)),
    } }

    operator! { bin mul {
        (Int(a), Int(b)) => Int(a.checked_mul(*b).ok_or_else(overflow)?),
        (Float(a), Float(b)) => Float(a * b),
        (Int(a), Float(b)) => Float(*a as f64 * b),
        (Float(a), Int(b)) => Float(a * *b as f64),
    } }

    operator! { bin div {
        (Int(a), Int(b)) => {
            if *b == 0 {
                return Err(Error::Operation("real division by zero".to_string()));
            }
            Float(*a as f64 / *b as f64)
        },
        (Float(a), Float(b)) => {
            if *b == 0.0 {
                return Err(Error::Operation("real division by zero".to_string()));
            }
            Float(a / b)
        },
        (Int(a), Float(b)) => {
            if *b == 0.0 {
                return Err(Error::Operation("real division by zero".to_string()));
            }
            Float(*a as f64 / b)
        },
        (Float(a), Int(b)) => {
            if *b == 0 {
                return Err(Error::Operation("real division by zero".to_string()));
            }
            Float(a / *b as f64)
        },
    } }

    operator! { bin floordiv {
        (Int(a), Int(b)) => Int(floor_div(*a, *b)?),
        (Float(a), Float(b)) => {
            if *b == 0.0 {
                return Err(Error::Operation("real division by zero".to_string()));
            }
            Float((a / b).floor())
        },
    } }

    operator! { bin modulo {
        (Int(a), Int(b)) => {
            if *b == 0 {
                return Err(Error::Operation("integer modulo by zero".to_string()));
            }
            Int(floor_mod(*a, *b)?)
        },
        (Float(a), Float(b)) => {
            if *b == 0.0 {
                return Err(Error::Operation("float modulo by zero".to_string()));
            }
            Float(a - (a / b).floor() * b)
        },
    } }

    operator! { bin bitand {
        (Int(a), Int(b)) => Int(a & b),
        (Set(a), Set(b)) => Set(Rc::new(a.intersection(b)?)),
    } }

    operator! { bin bitor {
        (Int(a), Int(b)) => Int(a | b),
        (Set(a), Set(b)) => Set(Rc::new(a.union(b)?)),
    } }

    operator! { bin bitxor {
        (Int(a), Int(b)) => Int(a ^ b),
        (Set(a), Set(b)) => Set(Rc::new(a.symmetric_difference(b)?)),
    } }

    operator! { bin shl {
        (Int(a), Int(b)) => Int(a.checked_shl(shift_amount(*b)?).ok_or_else(overflow)?),
    } }

    operator! { bin shr {
        (Int(a), Int(b)) => Int(a >> shift_amount(*b)?),
    } }

    operator! { un neg {
        Int(a) => Int(a.checked_neg().ok_or_else(overflow)?),
        Float(a) => Float(-a),
    } }

    operator! { un plus {
        Int(a) => Int(*a),
        Float(a) => Float(*a),
    } }

    operator! { un invert {
        Int(a) => Int(!a),
    } }

    // Membership: `item in self`.
    pub fn contains(&self, item: &Value) -> Result<bool> {
        match self {
            Value::Str(s) => match item {
                Value::Str(sub) => Ok(s.contains(sub.as_str())),
                _ => Err(Error::Unsupported),
            },
            Value::Tuple(t) => seq_contains(t, item),
            Value::List(l) => seq_contains(&l.items(), item),
            Value::Dict(d) => Ok(d.get(item)?.is_some()),
            Value::Set(s) => s.contains(item),
            Value::Range(r) => match item {
                Value::Int(i) => Ok(r.contains(*i)),
                _ => Ok(false),
            },
            _ => Err(Error::Unsupported),
        }
    }

    // Binary dispatch: the built-in table first, then each foreign
    // side gets a chance before the operation is declined for good.
    pub fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
        let builtin = match op {
            BinOp::Add => left.add(right),
            BinOp::Sub => left.sub(right),
            BinOp::Mul => left.mul(right),
            BinOp::Div => left.div(right),
            BinOp::FloorDiv => left.floordiv(right),
            BinOp::Mod => left.modulo(right),
            BinOp::BitAnd => left.bitand(right),
            BinOp::BitOr => left.bitor(right),
            BinOp::BitXor => left.bitxor(right),
            BinOp::Shl => left.shl(right),
            BinOp::Shr => left.shr(right),
            BinOp::In => return right.contains(left).map(Value::Bool),
        };
        match builtin {
            Err(Error::Unsupported) => {}
            done => return done,
        }
        if let Value::Foreign(f) = left {
            match f.binary(op, right, Side::Left) {
                Err(Error::Unsupported) => {}
                done => return done,
            }
        }
        if let Value::Foreign(f) = right {
            match f.binary(op, left, Side::Right) {
                Err(Error::Unsupported) => {}
                done => return done,
            }
        }
        Err(Error::Unsupported)
    }

    pub fn unary(op: UnOp, v: &Value) -> Result<Value> {
        let builtin = match op {
            UnOp::Neg => v.neg(),
            UnOp::Plus => v.plus(),
            UnOp::Invert => v.invert(),
            UnOp::Not => return Ok(Value::Bool(!v.truth())),
        };
        match builtin {
            Err(Error::Unsupported) => {}
            done => return done,
        }
        if let Value::Foreign(f) = v {
            return f.unary(op);
        }
        Err(Error::Unsupported)
    }

    // Known length, for sequences and sized collections.
    pub fn len(&self) -> Result<usize> {
        match self {
            Value::Str(s) => Ok(s.chars().count()),
            Value::Bytes(b) => Ok(b.len()),
            Value::Tuple(t) => Ok(t.len()),
            Value::List(l) => Ok(l.len()),
            Value::Dict(d) => Ok(d.len()),
            Value::Set(s) => Ok(s.len()),
            Value::Range(r) => Ok(r.len()),
            _ => Err(Error::Unsupported),
        }
    }

    // Random access; the caller supplies a normalised index.
    pub fn index(&self, i: usize) -> Result<Value> {
        let oob = || Error::Operation(format!("index {} out of range", i));
        match self {
            Value::Str(s) => s
                .chars()
                .nth(i)
                .map(|c| Value::string(&c.to_string()))
                .ok_or_else(oob),
            Value::Bytes(b) => b.get(i).map(|&x| Value::Int(x as i64)).ok_or_else(oob),
            Value::Tuple(t) => t.get(i).cloned().ok_or_else(oob),
            Value::List(l) => l.get(i).ok_or_else(oob),
            Value::Range(r) => r.at(i).map(Value::Int).ok_or_else(oob),
            _ => Err(Error::Unsupported),
        }
    }

    // Slice with the sign-of-step convention: for positive steps,
    // 0 <= start <= end <= len; for negative steps,
    // -1 <= end <= start < len. Callers supply normalised bounds.
    pub fn slice(&self, start: i64, end: i64, step: i64) -> Result<Value> {
        if step == 0 {
            return Err(Error::Operation("slice step cannot be zero".to_string()));
        }
        match self {
            Value::Str(s) => {
                let chars: Vec<Value> = s
                    .chars()
                    .map(|c| Value::string(&c.to_string()))
                    .collect();
                let picked = slice_seq(&chars, start, end, step);
                let mut out = String::new();
                for v in picked {
                    if let Value::Str(c) = v {
                        out.push_str(&c);
                    }
                }
                Ok(Value::string(&out))
            }
            Value::Bytes(b) => {
                let items: Vec<Value> = b.iter().map(|&x| Value::Int(x as i64)).collect();
                let picked = slice_seq(&items, start, end, step);
                let out: Vec<u8> = picked
                    .into_iter()
                    .map(|v| match v {
                        Value::Int(i) => i as u8,
                        _ => 0,
                    })
                    .collect();
                Ok(Value::bytes(out))
            }
            Value::Tuple(t) => Ok(Value::tuple(slice_seq(t, start, end, step))),
            Value::List(l) => Ok(Value::list(slice_seq(&l.items(), start, end, step))),
            Value::Range(r) => Ok(Value::Range(Rc::new(r.slice(start, end, step)))),
            _ => Err(Error::Unsupported),
        }
    }

    // Dotted attribute access. The capability-aware variant that
    // accounts for the method closure lives in ops.rs.
    pub fn attr(&self, name: &str) -> Result<Value> {
        match self {
            Value::List(_) | Value::Dict(_) | Value::Set(_) => {
                crate::builtins::method_attr(self, name)
            }
            Value::Foreign(f) => f.attr(name),
            _ => Err(Error::NoAttr {
                type_name: self.type_name(),
                attr: name.to_string(),
            }),
        }
    }

    // Mapping access: (value, found).
    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        match self {
            Value::Dict(d) => d.get(key),
            _ => Err(Error::Unsupported),
        }
    }

    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.as_ref().clone(),
            _ => self.to_repr(),
        }
    }

    pub fn to_repr(&self) -> String {
        let mut out = String::new();
        let mut visited = Vec::new();
        // A plain String sink never fails.
        let _ = self.write_repr(&mut out, &mut visited);
        out
    }

    // Renders into a sink, tracking the path of visited containers so
    // a cyclic value prints "..." instead of recursing forever. The
    // sink is either a plain String (host-native form) or the
    // budgeted builder in ops.rs (sandbox-safe form).
    pub fn write_repr(
        &self,
        out: &mut dyn ReprSink,
        visited: &mut Vec<*const ()>,
    ) -> Result<()> {
        match self {
            Value::None => out.write_part("None")?,
            Value::Bool(true) => out.write_part("True")?,
            Value::Bool(false) => out.write_part("False")?,
            Value::Int(i) => out.write_part(&i.to_string())?,
            Value::Float(f) => out.write_part(&format!("{:?}", f))?,
            Value::Str(s) => out.write_part(&format!("{:?}", s.as_str()))?,
            Value::Bytes(b) => {
                out.write_part("b\"")?;
                for &byte in b.iter() {
                    if (0x20..0x7f).contains(&byte) && byte != b'"' && byte != b'\\' {
                        out.write_part(&(byte as char).to_string())?;
                    } else {
                        out.write_part(&format!("\\x{:02x}", byte))?;
                    }
                }
                out.write_part("\"")?;
            }
            Value::Tuple(t) => {
                let ptr = Rc::as_ptr(t) as *const ();
                if visited.contains(&ptr) {
                    return out.write_part("(...)");
                }
                visited.push(ptr);
                out.write_part("(")?;
                for (i, v) in t.iter().enumerate() {
                    if i > 0 {
                        out.write_part(", ")?;
                    }
                    v.write_repr(out, visited)?;
                }
                if t.len() == 1 {
                    out.write_part(",")?;
                }
                out.write_part(")")?;
                visited.pop();
            }
            Value::List(l) => {
                let ptr = Rc::as_ptr(l) as *const ();
                if visited.contains(&ptr) {
                    return out.write_part("[...]");
                }
                visited.push(ptr);
                out.write_part("[")?;
                for (i, v) in l.items().iter().enumerate() {
                    if i > 0 {
                        out.write_part(", ")?;
                    }
                    v.write_repr(out, visited)?;
                }
                out.write_part("]")?;
                visited.pop();
            }
            Value::Dict(d) => {
                let ptr = Rc::as_ptr(d) as *const ();
                if visited.contains(&ptr) {
                    return out.write_part("{...}");
                }
                visited.push(ptr);
                out.write_part("{")?;
                for (i, (k, v)) in d.items().iter().enumerate() {
                    if i > 0 {
                        out.write_part(", ")?;
                    }
                    k.write_repr(out, visited)?;
                    out.write_part(": ")?;
                    v.write_repr(out, visited)?;
                }
                out.write_part("}")?;
                visited.pop();
            }
            Value::Set(s) => {
                let ptr = Rc::as_ptr(s) as *const ();
                if visited.contains(&ptr) {
                    return out.write_part("set(...)");
                }
                visited.push(ptr);
                out.write_part("set([")?;
                for (i, v) in s.elems().iter().enumerate() {
                    if i > 0 {
                        out.write_part(", ")?;
                    }
                    v.write_repr(out, visited)?;
                }
                out.write_part("])")?;
                visited.pop();
            }
            Value::Range(r) => out.write_part(&r.repr())?,
            Value::Builtin(b) => {
                if b.receiver().is_some() {
                    out.write_part(&format!("<built-in method {}>", b.name()))?;
                } else {
                    out.write_part(&format!("<built-in function {}>", b.name()))?;
                }
            }
            Value::Foreign(f) => out.write_part(&f.repr())?,
        }
        Ok(())
    }
}

// Where rendered text lands. The String impl is infallible; the
// budgeted builder in ops.rs charges the thread per write and fails
// when the budget runs out.
pub trait ReprSink {
    fn write_part(&mut self, part: &str) -> Result<()>;
}

impl ReprSink for String {
    fn write_part(&mut self, part: &str) -> Result<()> {
        self.push_str(part);
        Ok(())
    }
}

fn eq_elements(a: &[Value], b: &[Value], depth: u32) -> Result<bool> {
    if depth == 0 {
        return Err(Error::ComparisonDepth);
    }
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b.iter()) {
        if !x.equals(y, depth - 1)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn cmp_elements(a: &[Value], b: &[Value], depth: u32) -> Result<std::cmp::Ordering> {
    if depth == 0 {
        return Err(Error::ComparisonDepth);
    }
    for (x, y) in a.iter().zip(b.iter()) {
        if !x.equals(y, depth - 1)? {
            return x.cmp_values(y, depth - 1);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

fn seq_contains(items: &[Value], item: &Value) -> Result<bool> {
    for v in items {
        if v.equals(item, MAX_COMPARE_DEPTH)? {
            return Ok(true);
        }
    }
    Ok(false)
}

// Handy in tests and for hosts; equality errors read as "not equal".
impl PartialEq for Value {
    fn eq(&self, rhs: &Self) -> bool {
        self.equals(rhs, MAX_COMPARE_DEPTH).unwrap_or(false)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}
