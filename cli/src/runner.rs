use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use luau_bridge::{CoStatus, Exec, RunOptions, StackOps, State, TableOps, Thread, Type};
use luau_bridge_stdlib::LibraryRegistry;
use luau_bridge_stdlib::http::{self, HttpResponse};
use tracing::debug;

use crate::config::Settings;

/// Chunk name for a script file, shown in guest error messages.
pub fn chunk_name(path: &Path) -> String {
    format!("@{}", path.display())
}

/// Fresh state with the standard and host libraries installed and the
/// configured globals removed.
pub fn build_state(settings: &Settings) -> anyhow::Result<State> {
    let state = State::new()?;
    state.open_libs();
    LibraryRegistry::standard(&settings.stdlib_config())?.install(&state)?;
    for name in &settings.sandbox {
        state
            .remove_global(name)
            .with_context(|| format!("Failed to sandbox global '{}'", name))?;
    }
    Ok(state)
}

pub fn read_source(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read file '{}'", path.display()))
}

pub fn compile_file(path: &Path, settings: &Settings) -> anyhow::Result<Vec<u8>> {
    let source = read_source(path)?;
    Ok(luau_bridge::compile(&source, settings.opt_level)?)
}

/// Run a script file to completion.
pub fn run_file(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    if settings.async_mode {
        let bytecode = compile_file(path, settings)?;
        return run_bytecode(&bytecode, &chunk_name(path), settings);
    }
    let source = read_source(path)?;
    let state = build_state(settings)?;
    let options = RunOptions::default()
        .chunk_name(chunk_name(path))
        .opt_level(settings.opt_level);
    state.run_source(&source, &options)?;
    Ok(())
}

pub fn run_bytecode(bytecode: &[u8], chunk: &str, settings: &Settings) -> anyhow::Result<()> {
    let state = build_state(settings)?;
    if settings.async_mode {
        return run_event_loop(&state, bytecode, chunk);
    }
    state.load_bytecode(bytecode, chunk)?;
    state.pcall(0, 0)?;
    Ok(())
}

/// Run the chunk inside a coroutine on a single-threaded tokio runtime.
///
/// A yield tagged `"http"` carries a request table; the request runs on the
/// blocking pool and the coroutine is resumed with the response table.
/// Any other yield is a timer request: a numeric first value is a delay in
/// milliseconds, anything else resumes on the next tick. The coroutine is
/// resumed with the milliseconds that actually elapsed.
pub fn run_event_loop(state: &State, bytecode: &[u8], chunk: &str) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("Failed to start event loop")?;
    runtime.block_on(drive(state, bytecode, chunk))
}

async fn drive(state: &State, bytecode: &[u8], chunk: &str) -> anyhow::Result<()> {
    let thread = state.new_thread()?;
    thread.load_bytecode(bytecode, chunk)?;

    let mut nargs = 0;
    let mut ticks = 0u64;
    loop {
        let resume = thread.resume(nargs);
        match resume.status {
            CoStatus::Ok => {
                debug!(ticks, "script finished");
                return Ok(());
            }
            CoStatus::Yield if is_http_request(&thread, resume.nresults) => {
                let response = match http::read_request(&thread, -resume.nresults + 1) {
                    Ok(request) => tokio::task::spawn_blocking(move || http::execute(&request))
                        .await
                        .unwrap_or_else(|e| HttpResponse::failed(format!("request failed: {}", e))),
                    Err(message) => HttpResponse::failed(message),
                };
                thread.set_top(0);
                http::push_response(&thread, &response)?;
                nargs = 1;
                ticks += 1;
            }
            CoStatus::Yield => {
                let delay = if resume.nresults > 0 && thread.is_number(-resume.nresults) {
                    thread.to_number(-resume.nresults).max(0.0)
                } else {
                    0.0
                };
                thread.set_top(0);

                let Ok(delay) = Duration::try_from_secs_f64(delay / 1000.0) else {
                    anyhow::bail!("invalid sleep request: {} ms", delay);
                };
                let started = Instant::now();
                if delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(delay).await;
                }
                thread.push_number(started.elapsed().as_secs_f64() * 1000.0);
                nargs = 1;
                ticks += 1;
            }
            status => {
                let message = thread.last_error().unwrap_or_else(|| "unknown error".to_string());
                anyhow::bail!("runtime error ({:?}): {}", status, message);
            }
        }
    }
}

fn is_http_request(thread: &Thread, nresults: i32) -> bool {
    nresults >= 2
        && thread.type_of(-nresults) == Type::String
        && thread.to_string(-nresults).as_deref() == Some(http::YIELD_TAG)
}
