// Host data handling: the environment a host hands to an evaluation
// is inter-convertible with JSON.

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::safenum::SafeInt;
use crate::thread::Thread;
use crate::value::Value;

pub fn json_to_value(json: &Json) -> Result<Value> {
    match json {
        Json::Null => Ok(Value::None),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(Error::Operation(format!("number out of range: {}", n)))
            }
        }
        Json::String(s) => Ok(Value::string(s)),
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(json_to_value(item)?);
            }
            Ok(Value::list(out))
        }
        Json::Object(fields) => {
            let dict = Value::dict();
            if let Value::Dict(d) = &dict {
                for (k, v) in fields {
                    d.insert(Value::string(k), json_to_value(v)?)?;
                }
            }
            Ok(dict)
        }
    }
}

// Budget-aware variant for untrusted documents: one step per node,
// so a pathological input is stopped by the step cap rather than by
// the host's patience.
pub fn safe_json_to_value(thread: &Thread, json: &Json) -> Result<Value> {
    thread.add_steps(SafeInt::from(1u32))?;
    match json {
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(safe_json_to_value(thread, item)?);
            }
            Ok(Value::list(out))
        }
        Json::Object(fields) => {
            let dict = Value::dict();
            if let Value::Dict(d) = &dict {
                for (k, v) in fields {
                    d.safe_insert(thread, Value::string(k), safe_json_to_value(thread, v)?)?;
                }
            }
            Ok(dict)
        }
        other => json_to_value(other),
    }
}

pub fn value_to_json(value: &Value) -> Result<Json> {
    match value {
        Value::None => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::Int(i) => Ok(Json::from(*i)),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| Error::Operation("non-finite float in JSON".to_string())),
        Value::Str(s) => Ok(Json::String(s.as_ref().clone())),
        Value::Tuple(items) => items.iter().map(value_to_json).collect::<Result<Vec<_>>>().map(Json::Array),
        Value::List(l) => l.items().iter().map(value_to_json).collect::<Result<Vec<_>>>().map(Json::Array),
        Value::Set(s) => s.elems().iter().map(value_to_json).collect::<Result<Vec<_>>>().map(Json::Array),
        Value::Dict(d) => {
            let mut out = serde_json::Map::new();
            for (k, v) in d.items() {
                match k {
                    Value::Str(name) => {
                        out.insert(name.as_ref().clone(), value_to_json(&v)?);
                    }
                    other => {
                        return Err(Error::Operation(format!(
                            "dict key of type {} not representable in JSON",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(Json::Object(out))
        }
        other => Err(Error::Operation(format!(
            "value of type {} not representable in JSON",
            other.type_name()
        ))),
    }
}
