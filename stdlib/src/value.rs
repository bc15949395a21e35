//! Conversion between guest values and `serde_json::Value`.
//!
//! Tables whose keys are exactly `1..=n` become arrays; every other table
//! becomes an object with stringified keys. An empty table reads as an empty
//! object. JSON `null` is pushed as `nil`.

use anyhow::{Result, anyhow, bail};
use luau_bridge::{StackOps, TableOps, Type};
use serde_json::{Map, Number, Value};

/// Deepest table nesting accepted in either direction; also stops cycles.
pub const MAX_DEPTH: usize = 64;

/// Largest magnitude a double represents without losing integer precision.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Read the value at `idx` as JSON. The stack is left unchanged.
pub fn read_value<S: StackOps + ?Sized>(s: &S, idx: i32) -> Result<Value> {
    let idx = s.abs_index(idx);
    read_at(s, idx, 0)
}

/// Push `value` onto the stack.
pub fn push_value<S: StackOps + ?Sized>(s: &S, value: &Value) -> Result<()> {
    push_at(s, value, 0)
}

/// Number conversion used for both values and object keys.
pub fn number_value(n: f64) -> Result<Value> {
    if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        return Ok(Value::from(n as i64));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| anyhow!("cannot convert non-finite number {n}"))
}

fn read_at<S: StackOps + ?Sized>(s: &S, idx: i32, depth: usize) -> Result<Value> {
    match s.type_of(idx) {
        Type::Nil => Ok(Value::Null),
        Type::Boolean => Ok(Value::Bool(s.to_boolean(idx))),
        Type::Number => number_value(s.to_number(idx)),
        Type::String => {
            let bytes = s.to_bytes(idx).unwrap_or_default();
            Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        }
        Type::Table => read_table(s, idx, depth),
        other => bail!("cannot convert a {} value", other.name()),
    }
}

enum Key {
    Name(String),
    Index(f64),
}

fn read_table<S: StackOps + ?Sized>(s: &S, idx: i32, depth: usize) -> Result<Value> {
    if depth >= MAX_DEPTH {
        bail!("table nesting exceeds {MAX_DEPTH} levels");
    }
    if !s.check_stack(3) {
        bail!("stack overflow while reading a table");
    }

    let len = s.obj_len(idx);
    let mut entries = Vec::new();
    s.push_nil();
    while s.next(idx) {
        // Keys are read without coercion; converting a number key in place
        // would break the traversal.
        let key = match s.type_of(-2) {
            Type::String => {
                let bytes = s.to_bytes(-2).unwrap_or_default();
                Key::Name(String::from_utf8_lossy(&bytes).into_owned())
            }
            Type::Number => Key::Index(s.to_number(-2)),
            other => {
                s.pop(2);
                bail!("cannot convert a table with {} keys", other.name());
            }
        };
        let value = match read_at(s, s.top(), depth + 1) {
            Ok(value) => value,
            Err(err) => {
                s.pop(2);
                return Err(err);
            }
        };
        s.pop(1);
        entries.push((key, value));
    }

    if is_sequence(&entries, len) {
        let mut items = vec![Value::Null; len];
        for (key, value) in entries {
            if let Key::Index(n) = key {
                items[n as usize - 1] = value;
            }
        }
        return Ok(Value::Array(items));
    }

    let mut object = Map::with_capacity(entries.len());
    for (key, value) in entries {
        let name = match key {
            Key::Name(name) => name,
            Key::Index(n) => number_value(n)?.to_string(),
        };
        object.insert(name, value);
    }
    Ok(Value::Object(object))
}

fn is_sequence(entries: &[(Key, Value)], len: usize) -> bool {
    len > 0
        && entries.len() == len
        && entries.iter().all(|(key, _)| match key {
            Key::Index(n) => n.fract() == 0.0 && *n >= 1.0 && *n <= len as f64,
            Key::Name(_) => false,
        })
}

fn push_at<S: StackOps + ?Sized>(s: &S, value: &Value, depth: usize) -> Result<()> {
    if depth >= MAX_DEPTH {
        bail!("value nesting exceeds {MAX_DEPTH} levels");
    }
    if !s.check_stack(2) {
        bail!("stack overflow while pushing a value");
    }
    match value {
        Value::Null => s.push_nil(),
        Value::Bool(b) => s.push_boolean(*b),
        Value::Number(n) => s.push_number(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(text) => s.push_bytes(text.as_bytes()),
        Value::Array(items) => {
            s.create_table(items.len().try_into().unwrap_or(0), 0);
            let table = s.top();
            for (i, item) in items.iter().enumerate() {
                if let Err(err) = push_at(s, item, depth + 1) {
                    s.pop(1);
                    return Err(err);
                }
                if let Err(err) = s.raw_set_index(table, i as i64 + 1) {
                    s.pop(1);
                    return Err(err.into());
                }
            }
        }
        Value::Object(fields) => {
            s.create_table(0, fields.len().try_into().unwrap_or(0));
            let table = s.top();
            for (key, item) in fields {
                s.push_bytes(key.as_bytes());
                if let Err(err) = push_at(s, item, depth + 1) {
                    s.pop(2);
                    return Err(err);
                }
                if let Err(err) = s.raw_set(table) {
                    s.pop(1);
                    return Err(err.into());
                }
            }
        }
    }
    Ok(())
}
