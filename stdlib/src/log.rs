//! `log.debug/info/warn/error(...)`, forwarded to `tracing` under the
//! `lbridge::script` target.

use luau_bridge::{Frame, Outcome, Result, StackOps, Type};
use tracing::{debug, error, info, warn};

use crate::value::read_value;
use crate::{Export, Library};

#[derive(Debug, Clone, Copy)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug)]
pub struct LogLibrary;

impl Default for LogLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl LogLibrary {
    pub fn new() -> Self {
        Self
    }
}

impl Library for LogLibrary {
    fn name(&self) -> &str {
        "log"
    }

    fn description(&self) -> &str {
        "Structured logging for scripts"
    }

    fn exports(&self) -> Vec<Export> {
        vec![
            Export::new("debug", |frame: &Frame| emit(frame, Level::Debug)),
            Export::new("info", |frame: &Frame| emit(frame, Level::Info)),
            Export::new("warn", |frame: &Frame| emit(frame, Level::Warn)),
            Export::new("error", |frame: &Frame| emit(frame, Level::Error)),
        ]
    }
}

fn emit(frame: &Frame, level: Level) -> Result<Outcome> {
    let message = format_args_line(frame);
    match level {
        Level::Debug => debug!(target: "lbridge::script", "{}", message),
        Level::Info => info!(target: "lbridge::script", "{}", message),
        Level::Warn => warn!(target: "lbridge::script", "{}", message),
        Level::Error => error!(target: "lbridge::script", "{}", message),
    }
    Ok(Outcome::NONE)
}

/// Every argument rendered and joined with single spaces. Tables are shown
/// as JSON when they convert cleanly.
pub fn format_args_line(frame: &Frame) -> String {
    (1..=frame.arg_count())
        .map(|idx| render(frame, idx))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render(frame: &Frame, idx: i32) -> String {
    match frame.type_of(idx) {
        Type::Nil => "nil".to_string(),
        Type::Boolean => frame.to_boolean(idx).to_string(),
        Type::Number | Type::String => {
            let bytes = frame.to_bytes(idx).unwrap_or_default();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Type::Table => match read_value(frame, idx) {
            Ok(value) => value.to_string(),
            Err(_) => "table".to_string(),
        },
        other => other.name().to_string(),
    }
}
