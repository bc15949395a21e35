//! Host libraries for luau-bridge scripts.
//!
//! Every library is a set of host closures registered as external functions
//! through one shared [`FunctionTable`], so the closures may capture state
//! (the key–value store, the module cache) that a plain function pointer
//! could not.

pub mod env;
pub mod http;
pub mod json;
pub mod kv;
pub mod log;
pub mod require;
pub mod time;
pub mod value;

#[cfg(test)]
mod env_test;
#[cfg(test)]
mod registry_test;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use luau_bridge::{Frame, FuncReg, FunctionTable, HostFn, OptLevel, Outcome, StackOps, State, TableOps};
use tracing::debug;

pub use kv::KvStore;

/// A host function exported by a library under `name`.
#[derive(Clone)]
pub struct Export {
    pub name: &'static str,
    pub func: Arc<HostFn>,
}

impl Export {
    pub fn new<F>(name: &'static str, func: F) -> Self
    where
        F: Fn(&Frame) -> luau_bridge::Result<Outcome> + Send + Sync + 'static,
    {
        Self {
            name,
            func: Arc::new(func),
        }
    }
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Export").field("name", &self.name).finish()
    }
}

/// A group of host functions installed into a state.
pub trait Library: Send + Sync + std::fmt::Debug {
    /// Global name the library is installed under.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn enabled(&self) -> bool {
        true
    }

    /// Functions the library exports.
    fn exports(&self) -> Vec<Export>;

    /// Install the exports into `state`. The default binds a global table
    /// named after the library holding every export.
    fn install(&self, state: &State, functions: &FunctionTable) -> Result<()> {
        let exports = self.exports();
        let ids: Vec<_> = exports
            .iter()
            .map(|export| {
                let qualified = format!("{}.{}", self.name(), export.name);
                functions.insert_shared(&qualified, Arc::clone(&export.func))
            })
            .collect();
        let regs: Vec<FuncReg<'_>> = exports
            .iter()
            .zip(ids)
            .map(|(export, id)| FuncReg::external(export.name, id))
            .collect();

        state.create_table(0, regs.len() as i32);
        if let Err(err) = state.set_funcs(-1, &regs) {
            state.pop(1);
            return Err(err.into());
        }
        state.set_global(self.name())?;
        Ok(())
    }
}

/// Settings shared by the standard library set.
#[derive(Debug, Clone)]
pub struct StdlibConfig {
    /// Directory `require` resolves modules against; `require` is not
    /// installed without one.
    pub libs_dir: Option<PathBuf>,
    pub opt_level: OptLevel,
    /// `time.sleep` and `http.request` yield to the host instead of blocking
    /// when the caller runs inside a coroutine.
    pub async_yield: bool,
    pub kv: Arc<KvStore>,
}

impl Default for StdlibConfig {
    fn default() -> Self {
        Self {
            libs_dir: None,
            opt_level: OptLevel::O2,
            async_yield: false,
            kv: Arc::new(KvStore::new()),
        }
    }
}

/// Ordered set of libraries sharing one dispatcher.
#[derive(Debug, Default)]
pub struct LibraryRegistry {
    libraries: Vec<Box<dyn Library>>,
    functions: Arc<FunctionTable>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every standard library configured by `config`.
    pub fn standard(config: &StdlibConfig) -> Result<Self> {
        let mut registry = Self::new();
        register_stdlib_libraries(&mut registry, config)?;
        Ok(registry)
    }

    pub fn register_library(&mut self, library: Box<dyn Library>) -> Result<()> {
        if self.libraries.iter().any(|lib| lib.name() == library.name()) {
            bail!("library '{}' is already registered", library.name());
        }
        self.libraries.push(library);
        Ok(())
    }

    pub fn get_library(&self, name: &str) -> Result<&dyn Library> {
        self.libraries
            .iter()
            .find(|lib| lib.name() == name)
            .map(|lib| lib.as_ref())
            .ok_or_else(|| anyhow!("library '{}' not found", name))
    }

    pub fn library_names(&self) -> Vec<String> {
        self.libraries.iter().map(|lib| lib.name().to_string()).collect()
    }

    pub fn functions(&self) -> &Arc<FunctionTable> {
        &self.functions
    }

    /// Make the shared function table the state's dispatcher and install
    /// every enabled library.
    pub fn install(&self, state: &State) -> Result<()> {
        state.set_dispatcher(Arc::clone(&self.functions));
        for library in self.libraries.iter().filter(|lib| lib.enabled()) {
            library.install(state, &self.functions)?;
            debug!(library = library.name(), "installed host library");
        }
        Ok(())
    }
}

/// Register all standard libraries with the given registry.
pub fn register_stdlib_libraries(registry: &mut LibraryRegistry, config: &StdlibConfig) -> Result<()> {
    registry.register_library(Box::new(json::JsonLibrary::new()))?;
    registry.register_library(Box::new(time::TimeLibrary::new(config.async_yield)))?;
    registry.register_library(Box::new(env::EnvLibrary::new()))?;
    registry.register_library(Box::new(log::LogLibrary::new()))?;
    registry.register_library(Box::new(kv::KvLibrary::new(Arc::clone(&config.kv))))?;
    registry.register_library(Box::new(http::HttpLibrary::new(config.async_yield)))?;
    if let Some(dir) = &config.libs_dir {
        let require = require::RequireLibrary::new(dir.clone(), config.opt_level);
        require.precompile()?;
        registry.register_library(Box::new(require))?;
    }
    Ok(())
}

/// Message for a missing or mistyped argument.
pub(crate) fn bad_argument(position: i32, function: &str, expected: &str, frame: &Frame) -> luau_bridge::Error {
    luau_bridge::Error::runtime(format!(
        "invalid argument #{position} to '{function}' ({expected} expected, got {})",
        if position > frame.top() {
            "no value"
        } else {
            frame.type_name(position)
        }
    ))
}
