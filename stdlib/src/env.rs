//! Read-only access to the host environment.

use luau_bridge::{Frame, Outcome, Result, StackOps};

use crate::{Export, Library, bad_argument};

#[derive(Debug)]
pub struct EnvLibrary;

impl Default for EnvLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvLibrary {
    pub fn new() -> Self {
        Self
    }
}

impl Library for EnvLibrary {
    fn name(&self) -> &str {
        "env"
    }

    fn description(&self) -> &str {
        "Environment variable lookup"
    }

    fn exports(&self) -> Vec<Export> {
        vec![
            Export::new("get", env_get),
            Export::new("has", env_has),
            Export::new("os", env_os),
            Export::new("arch", env_arch),
        ]
    }
}

fn variable_name(frame: &Frame, function: &str) -> Result<String> {
    frame
        .to_string(1)
        .filter(|name| !name.is_empty() && !name.contains(['=', '\0']))
        .ok_or_else(|| bad_argument(1, function, "variable name", frame))
}

/// `env.get(name [, default])`: the variable's value, else `default`, else nil.
fn env_get(frame: &Frame) -> Result<Outcome> {
    let name = variable_name(frame, "get")?;
    match std::env::var(&name) {
        Ok(value) => frame.push_string(&value),
        Err(_) if frame.arg_count() >= 2 => frame.push_value(2),
        Err(_) => frame.push_nil(),
    }
    Ok(Outcome::returns(1))
}

fn env_has(frame: &Frame) -> Result<Outcome> {
    let name = variable_name(frame, "has")?;
    frame.push_boolean(std::env::var_os(&name).is_some());
    Ok(Outcome::returns(1))
}

fn env_os(frame: &Frame) -> Result<Outcome> {
    frame.push_string(std::env::consts::OS);
    Ok(Outcome::returns(1))
}

fn env_arch(frame: &Frame) -> Result<Outcome> {
    frame.push_string(std::env::consts::ARCH);
    Ok(Outcome::returns(1))
}
