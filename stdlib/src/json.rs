//! `json.encode(value [, pretty])` and `json.decode(text)`.

use luau_bridge::{Error, Frame, Outcome, Result, StackOps};

use crate::value::{push_value, read_value};
use crate::{Export, Library, bad_argument};

#[derive(Debug)]
pub struct JsonLibrary;

impl Default for JsonLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLibrary {
    pub fn new() -> Self {
        Self
    }
}

impl Library for JsonLibrary {
    fn name(&self) -> &str {
        "json"
    }

    fn description(&self) -> &str {
        "JSON encoding and decoding of guest values"
    }

    fn exports(&self) -> Vec<Export> {
        vec![Export::new("encode", json_encode), Export::new("decode", json_decode)]
    }
}

fn json_encode(frame: &Frame) -> Result<Outcome> {
    if frame.arg_count() < 1 {
        return Err(bad_argument(1, "encode", "value", frame));
    }
    let value = read_value(frame, 1).map_err(|e| Error::runtime(format!("json.encode: {e}")))?;
    let pretty = frame.arg_count() >= 2 && frame.to_boolean(2);
    let text = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .map_err(|e| Error::runtime(format!("json.encode: {e}")))?;
    frame.push_string(&text);
    Ok(Outcome::returns(1))
}

/// Returns the decoded value, or `nil` plus the parse error.
fn json_decode(frame: &Frame) -> Result<Outcome> {
    if !frame.is_string(1) {
        return Err(bad_argument(1, "decode", "string", frame));
    }
    let bytes = frame.to_bytes(1).unwrap_or_default();
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) => {
            push_value(frame, &value).map_err(|e| Error::runtime(format!("json.decode: {e}")))?;
            Ok(Outcome::returns(1))
        }
        Err(err) => {
            frame.push_nil();
            frame.push_string(&err.to_string());
            Ok(Outcome::returns(2))
        }
    }
}
