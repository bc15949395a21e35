use std::io::IsTerminal;
use std::path::{Component, Path, PathBuf};
use std::sync::Once;

use anyhow::Context;
use clap::{Parser, Subcommand};

mod config;
mod repl;
mod runner;

use config::{CliConfig, Settings};

static TRACE_INIT: Once = Once::new();
const DEFAULT_TRACE_FILTER: &str = "luau_bridge=info,lbridge=info";
/// Script logs stay visible when tracing is not switched on.
const SCRIPT_LOG_FILTER: &str = "lbridge::script=info";

/// Extension written by `compile` when no output path is given.
const BYTECODE_EXTENSION: &str = "luauc";

#[derive(Debug, Parser)]
#[command(name = "lbridge", author, version, about = "Run Luau scripts through luau-bridge", long_about = None)]
struct CliArgs {
    /// Subcommands like `compile FILE`
    #[command(subcommand)]
    command: Option<Commands>,

    /// If no subcommand, treat as a script file to run
    #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
    file: Option<PathBuf>,

    /// Config file (defaults to ./lbridge.toml when present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory `require` loads modules from
    #[arg(long, global = true, value_name = "DIR")]
    libs_dir: Option<PathBuf>,

    /// Compiler optimization level (0-2)
    #[arg(short = 'O', long = "opt-level", global = true, value_name = "LEVEL")]
    opt_level: Option<i32>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a script file.
    Run {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
        /// Run inside a coroutine driven by an event loop; `time.sleep` yields to it
        #[arg(long = "async")]
        async_mode: bool,
    },
    /// Compile a script to a bytecode file.
    Compile {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
        /// Output path (defaults to FILE with a `.luauc` extension)
        #[arg(short, long, value_parser = parse_sanitized_path)]
        output: Option<PathBuf>,
    },
    /// Run a bytecode file produced by `compile`.
    RunBytecode {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
        #[arg(long = "async")]
        async_mode: bool,
    },
    /// Compile a script without running it.
    Check {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
    },
}

fn sanitize_path(raw: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(raw);

    for comp in p.components() {
        if matches!(comp, Component::ParentDir) {
            return Err(anyhow::anyhow!(
                "Parent directory components ('..') are not allowed in file paths."
            ));
        }
    }

    Ok(p.to_path_buf())
}

fn parse_sanitized_path(raw: &str) -> Result<PathBuf, String> {
    sanitize_path(raw).map_err(|e| e.to_string())
}

fn env_toggle_enabled(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    !(trimmed.eq_ignore_ascii_case("0") || trimmed.eq_ignore_ascii_case("false") || trimmed.eq_ignore_ascii_case("off"))
}

fn filter_expr_from(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("1")
        || trimmed.eq_ignore_ascii_case("true")
        || trimmed.eq_ignore_ascii_case("on")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Filter for the stderr subscriber: `LBRIDGE_TRACE` switches full tracing
/// on (its value, else `RUST_LOG`, else the default filter); without it only
/// script logs are shown.
fn trace_filter(raw: Option<&str>, rust_log: Option<String>) -> String {
    match raw {
        Some(raw) if env_toggle_enabled(raw) => filter_expr_from(raw)
            .or(rust_log)
            .unwrap_or_else(|| DEFAULT_TRACE_FILTER.to_string()),
        _ => SCRIPT_LOG_FILTER.to_string(),
    }
}

fn init_tracing() {
    TRACE_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let raw = std::env::var("LBRIDGE_TRACE").ok();
        let expr = trace_filter(raw.as_deref(), std::env::var("RUST_LOG").ok());
        let filter = EnvFilter::try_new(&expr).unwrap_or_else(|_| EnvFilter::new(DEFAULT_TRACE_FILTER));

        let _ = fmt()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_env_filter(filter)
            .try_init();
    });
}

fn default_output(file: &Path) -> PathBuf {
    file.with_extension(BYTECODE_EXTENSION)
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let CliArgs {
        command,
        file,
        config,
        libs_dir,
        opt_level,
    } = CliArgs::parse();

    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    let file_config = CliConfig::load(config.as_deref(), &cwd)?;
    let mut settings = Settings::resolve(file_config, libs_dir, opt_level)?;

    let Some(cmd) = command else {
        return match file {
            Some(path) => runner::run_file(&path, &settings),
            // No args: enter REPL
            None => repl::run(&settings),
        };
    };

    match cmd {
        Commands::Run { file, async_mode } => {
            settings.async_mode = async_mode;
            runner::run_file(&file, &settings)
        }
        Commands::Compile { file, output } => {
            let bytecode = runner::compile_file(&file, &settings)?;
            let output = output.unwrap_or_else(|| default_output(&file));
            std::fs::write(&output, &bytecode)
                .with_context(|| format!("Failed to write bytecode '{}'", output.display()))?;
            println!("Compiled {} -> {} ({} bytes)", file.display(), output.display(), bytecode.len());
            Ok(())
        }
        Commands::RunBytecode { file, async_mode } => {
            settings.async_mode = async_mode;
            let bytecode =
                std::fs::read(&file).with_context(|| format!("Failed to read bytecode '{}'", file.display()))?;
            runner::run_bytecode(&bytecode, &runner::chunk_name(&file), &settings)
        }
        Commands::Check { file } => {
            runner::compile_file(&file, &settings)?;
            println!("{}: ok", file.display());
            Ok(())
        }
    }
}
