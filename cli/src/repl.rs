use rustyline::{DefaultEditor, error::ReadlineError};

use luau_bridge::{Error, Exec, RunOptions, StackOps, State, Type};

use crate::config::Settings;
use crate::runner::build_state;

const REPL_CHUNK: &str = "=stdin";

fn print_repl_help() {
    eprintln!("Commands: :quit | :exit | :q, :help, :mem");
}

fn should_continue_multiline(buf: &str) -> bool {
    // Simple bracket/brace/paren balance check; continue if unbalanced or trailing '\\'
    let mut paren = 0i32;
    let mut brace = 0i32;
    let mut bracket = 0i32;
    for ch in buf.chars() {
        match ch {
            '(' => paren += 1,
            ')' => paren -= 1,
            '{' => brace += 1,
            '}' => brace -= 1,
            '[' => bracket += 1,
            ']' => bracket -= 1,
            _ => {}
        }
    }
    let trailing_backslash = buf.trim_end().ends_with('\\');
    paren > 0 || brace > 0 || bracket > 0 || trailing_backslash
}

/// An unfinished block (`function ... ` without `end`) fails to compile at
/// the end of input; such input keeps reading.
pub(crate) fn is_incomplete(err: &Error) -> bool {
    matches!(err, Error::Compile(message) if message.contains("<eof>"))
}

/// Render the value at `idx` the way the REPL echoes results.
pub(crate) fn render_value(state: &State, idx: i32) -> String {
    match state.type_of(idx) {
        Type::Nil => "nil".to_string(),
        Type::Boolean => state.to_boolean(idx).to_string(),
        Type::String => format!("{:?}", String::from_utf8_lossy(&state.to_bytes(idx).unwrap_or_default())),
        Type::Number => {
            let n = state.to_number(idx);
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", n as i64)
            } else {
                n.to_string()
            }
        }
        other => other.name().to_string(),
    }
}

/// Evaluate one REPL entry: first as an expression (`return <src>`), then as
/// statements. Returns the rendered results.
pub(crate) fn eval_entry(state: &State, src: &str, settings: &Settings) -> Result<Vec<String>, Error> {
    let options = RunOptions::default().chunk_name(REPL_CHUNK).opt_level(settings.opt_level);
    state.set_top(0);
    let expression = format!("return {}", src);
    let outcome = match state.run_source(expression.as_bytes(), &options) {
        Err(Error::Compile(_)) => state.run_source(src.as_bytes(), &options),
        other => other,
    };
    outcome?;
    let values = (1..=state.top()).map(|idx| render_value(state, idx)).collect();
    state.set_top(0);
    Ok(values)
}

pub fn run(settings: &Settings) -> anyhow::Result<()> {
    let state = build_state(settings)?;

    // In-memory line editor with history and arrow key support
    let mut rl = DefaultEditor::new()?;

    eprintln!("{}", luau_bridge::version());
    print_repl_help();

    loop {
        let mut acc = String::new();
        // Read one or more lines using rustyline until complete
        loop {
            let prompt = if acc.is_empty() { "> " } else { "... " };
            match rl.readline(prompt) {
                Ok(line) => {
                    let trimmed = line.trim_end();

                    // Commands only when starting fresh
                    if acc.is_empty() && trimmed.starts_with(':') {
                        match trimmed {
                            ":quit" | ":exit" | ":q" => return Ok(()),
                            ":help" => print_repl_help(),
                            ":mem" => eprintln!("{} bytes", state.memory_usage()),
                            _ => eprintln!("Unknown command. Type :help for help."),
                        }
                        break;
                    }

                    // Support line continuation via trailing '\\' (strip it)
                    if trimmed.ends_with('\\') {
                        acc.push_str(trimmed.strip_suffix('\\').unwrap_or(trimmed));
                        acc.push('\n');
                        continue;
                    }

                    acc.push_str(trimmed);
                    acc.push('\n');
                    if should_continue_multiline(&acc) {
                        continue;
                    }
                    match luau_bridge::compile(acc.as_bytes(), settings.opt_level) {
                        Err(err) if is_incomplete(&err) => continue,
                        _ => break,
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    // Ctrl-C: clear current buffer and prompt again
                    acc.clear();
                    eprintln!("^C");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    // Ctrl-D: exit if nothing pending; otherwise treat as submit
                    if acc.trim().is_empty() {
                        println!();
                        return Ok(());
                    }
                    break;
                }
                Err(e) => {
                    eprintln!("Readline error: {}", e);
                    continue;
                }
            }
        }

        let final_src = acc.trim_end().to_string();
        if final_src.trim().is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(final_src.as_str());

        match eval_entry(&state, &final_src, settings) {
            Ok(values) if values.is_empty() => {}
            Ok(values) => println!("{}", values.join("\t")),
            Err(e) => eprintln!("Error: {}", e.message()),
        }
    }
}
