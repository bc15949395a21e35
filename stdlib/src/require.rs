//! `require(name)`: load a module from the library directory.
//!
//! `name` resolves to `<libs_dir>/<name>.luau` or `<libs_dir>/<name>/init.luau`.
//! Modules are compiled once; [`RequireLibrary::precompile`] fills the
//! bytecode cache up front. A module's result is cached in the `__loaded`
//! global table and returned by later calls. A module that returns nothing
//! is recorded as `true`.
//!
//! Failures are not guest errors: `require` logs them and returns `nil`
//! plus a message.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use dashmap::{DashMap, DashSet};
use luau_bridge::{Exec, Frame, FunctionTable, OptLevel, Outcome, StackOps, State, TableOps, Type, compile};
use tracing::{debug, warn};

use crate::{Export, Library};

/// Global table holding every loaded module's result.
pub const LOADED_TABLE: &str = "__loaded";

/// Reject names that could escape the library directory.
pub fn validate_module_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("module name cannot be empty");
    }
    if name.contains("..") {
        bail!("module name '{name}' contains a path traversal sequence");
    }
    if name.starts_with('/') || name.starts_with('\\') {
        bail!("module name '{name}' starts with a path separator");
    }
    if name.chars().nth(1) == Some(':') {
        bail!("module name '{name}' is an absolute path");
    }
    if name.contains('\0') {
        bail!("module name contains a NUL byte");
    }
    Ok(())
}

#[derive(Debug)]
struct Loader {
    libs_dir: PathBuf,
    opt_level: OptLevel,
    bytecode: DashMap<String, Arc<[u8]>>,
    loading: DashSet<String>,
}

impl Loader {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        [
            self.libs_dir.join(format!("{name}.luau")),
            self.libs_dir.join(name).join("init.luau"),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
    }

    fn compile_file(&self, path: &Path) -> Result<Arc<[u8]>> {
        let source = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let bytecode = compile(&source, self.opt_level).map_err(|e| anyhow!("{}: {}", path.display(), e))?;
        Ok(Arc::from(bytecode))
    }

    fn bytecode_for(&self, name: &str) -> Result<Arc<[u8]>> {
        if let Some(cached) = self.bytecode.get(name) {
            return Ok(Arc::clone(cached.value()));
        }
        let path = self
            .locate(name)
            .ok_or_else(|| anyhow!("module '{}' not found in {}", name, self.libs_dir.display()))?;
        let bytecode = self.compile_file(&path)?;
        self.bytecode.insert(name.to_string(), Arc::clone(&bytecode));
        Ok(bytecode)
    }

    fn walk(&self, dir: &Path, errors: &mut Vec<String>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                errors.push(format!("failed to read {}: {}", dir.display(), err));
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, errors);
                continue;
            }
            if path.extension().is_none_or(|ext| ext != "luau") {
                continue;
            }
            let Some(name) = module_name(&self.libs_dir, &path) else {
                continue;
            };
            match self.compile_file(&path) {
                Ok(bytecode) => {
                    debug!(module = %name, bytes = bytecode.len(), "precompiled module");
                    self.bytecode.insert(name, bytecode);
                }
                Err(err) => errors.push(format!("{err:#}")),
            }
        }
    }
}

/// Module name for a file below `base`: the relative path without the
/// `.luau` extension, `init` files named after their directory.
fn module_name(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?.with_extension("");
    let mut parts: Vec<String> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.len() > 1 && parts.last().is_some_and(|last| last == "init") {
        parts.pop();
    }
    Some(parts.join("/"))
}

/// Removes the module from the in-progress set when loading ends.
struct LoadingGuard<'a> {
    loading: &'a DashSet<String>,
    name: String,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.loading.remove(&self.name);
    }
}

#[derive(Debug)]
pub struct RequireLibrary {
    loader: Arc<Loader>,
}

impl RequireLibrary {
    pub fn new(libs_dir: PathBuf, opt_level: OptLevel) -> Self {
        let libs_dir = fs::canonicalize(&libs_dir).unwrap_or(libs_dir);
        Self {
            loader: Arc::new(Loader {
                libs_dir,
                opt_level,
                bytecode: DashMap::new(),
                loading: DashSet::new(),
            }),
        }
    }

    pub fn libs_dir(&self) -> &Path {
        &self.loader.libs_dir
    }

    /// Compile every `.luau` file below the library directory into the
    /// cache. A missing directory is not an error; every compile failure is
    /// reported together.
    pub fn precompile(&self) -> Result<usize> {
        if !self.loader.libs_dir.is_dir() {
            return Ok(0);
        }
        let mut errors = Vec::new();
        self.loader.walk(&self.loader.libs_dir, &mut errors);
        if !errors.is_empty() {
            bail!("failed to precompile modules:\n  {}", errors.join("\n  "));
        }
        debug!(count = self.loader.bytecode.len(), "precompiled modules");
        Ok(self.loader.bytecode.len())
    }

    /// Names currently held in the bytecode cache, sorted.
    pub fn cached_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loader.bytecode.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

impl Library for RequireLibrary {
    fn name(&self) -> &str {
        "require"
    }

    fn description(&self) -> &str {
        "Module loading from the library directory"
    }

    fn exports(&self) -> Vec<Export> {
        let loader = Arc::clone(&self.loader);
        vec![Export::new("require", move |frame: &Frame| {
            require(frame, &loader)
        })]
    }

    /// `require` is a global function, not a table.
    fn install(&self, state: &State, functions: &FunctionTable) -> Result<()> {
        state.new_table();
        state.set_global(LOADED_TABLE)?;
        for export in self.exports() {
            let id = functions.insert_shared(export.name, export.func);
            state.register_external(export.name, id)?;
        }
        Ok(())
    }
}

fn fail(frame: &Frame, name: &str, message: String) -> Outcome {
    warn!(module = %name, "require failed: {}", message);
    frame.push_nil();
    frame.push_string(&message);
    Outcome::returns(2)
}

fn require(frame: &Frame, loader: &Loader) -> luau_bridge::Result<Outcome> {
    let name = frame.to_string(1).unwrap_or_default();
    if let Err(err) = validate_module_name(&name) {
        return Ok(fail(frame, &name, err.to_string()));
    }

    if frame.get_global(LOADED_TABLE)? != Type::Table {
        frame.pop(1);
        frame.new_table();
        frame.push_value(-1);
        frame.set_global(LOADED_TABLE)?;
    }
    let loaded = frame.top();
    if frame.get_field(loaded, &name)? != Type::Nil {
        return Ok(Outcome::returns(1));
    }
    frame.pop(1);

    if !loader.loading.insert(name.clone()) {
        warn!(module = %name, "circular require");
        frame.push_nil();
        return Ok(Outcome::returns(1));
    }
    let _guard = LoadingGuard {
        loading: &loader.loading,
        name: name.clone(),
    };

    let bytecode = match loader.bytecode_for(&name) {
        Ok(bytecode) => bytecode,
        Err(err) => return Ok(fail(frame, &name, format!("{err:#}"))),
    };
    if let Err(err) = frame.load_bytecode(&bytecode, &format!("@{name}")) {
        return Ok(fail(frame, &name, err.message().to_string()));
    }
    if let Err(err) = frame.pcall(0, 1) {
        return Ok(fail(frame, &name, err.message().to_string()));
    }
    if frame.is_nil(-1) {
        frame.pop(1);
        frame.push_boolean(true);
    }
    frame.push_value(-1);
    frame.set_field(loaded, &name)?;
    Ok(Outcome::returns(1))
}
