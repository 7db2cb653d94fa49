//! Module loading: dotted import paths resolve to source files or
//! registered native modules, each loaded at most once per canonical key.
//!
//! Resolution order for `import a.b.c`:
//! 1. `<current dir>/a/b/c.b`
//! 2. `<root>/a/b/c.b` for each configured root (executable directory plus
//!    every `BLADE_PATH` entry, supplied by the embedder).
//! 3. `<root>/libs/a/b/c.b`
//! 4. A registered native module named `a.b.c`.
//!
//! First hit wins. Source modules are cached under their canonical file
//! path (so two dotted spellings of one file share a module object) and
//! registered *before* execution, which is what terminates import cycles.

use std::path::PathBuf;
use std::rc::Rc;

use log::trace;

use crate::error::VmError;
use crate::modules;
use crate::object::{new_table, Module, Obj};
use crate::value::ObjId;
use crate::vm::Vm;

/// Source-file extension.
const EXTENSION: &str = "b";

/// Create an empty (source) module object and register it in the module
/// table so it is rooted and importable.
pub(crate) fn create_module(vm: &mut Vm, name: &str, path: &str) -> ObjId {
    let module = vm.heap.alloc(Obj::Module(Module {
        name: Rc::from(name),
        path: Rc::from(path),
        values: new_table(),
        is_native: false,
        unload: None,
    }));
    vm.modules.insert(path.to_string(), module);
    module
}

/// Resolve and (on first use) execute the module for a dotted import path.
pub(crate) fn load_module(vm: &mut Vm, dotted: &str) -> Result<ObjId, VmError> {
    if let Some(&module) = vm.modules.get(dotted) {
        return Ok(module);
    }

    for candidate in candidates(vm, dotted) {
        trace!("import {}: trying {}", dotted, candidate.display());
        if candidate.is_file() {
            return load_source_module(vm, dotted, candidate);
        }
    }

    let provider = vm
        .native_modules
        .iter()
        .find(|m| m.name() == dotted)
        .map(Rc::clone);
    if let Some(provider) = provider {
        let module = modules::instantiate(vm, Rc::clone(&provider));
        vm.modules.insert(dotted.to_string(), module);
        provider.preload(vm);
        trace!("import {}: resolved to native module", dotted);
        return Ok(module);
    }

    Err(vm.import_error(&format!("module '{}' not found", dotted)))
}

fn candidates(vm: &Vm, dotted: &str) -> Vec<PathBuf> {
    let mut relative = PathBuf::new();
    for part in dotted.split('.') {
        relative.push(part);
    }
    relative.set_extension(EXTENSION);

    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(&relative));
    }
    for root in &vm.import_roots {
        paths.push(root.join(&relative));
    }
    for root in &vm.import_roots {
        paths.push(root.join("libs").join(&relative));
    }
    paths
}

fn load_source_module(vm: &mut Vm, dotted: &str, path: PathBuf) -> Result<ObjId, VmError> {
    let canonical = path
        .canonicalize()
        .unwrap_or_else(|_| path.clone())
        .display()
        .to_string();
    if let Some(&module) = vm.modules.get(&canonical) {
        // A different dotted spelling already loaded this file.
        vm.modules.insert(dotted.to_string(), module);
        return Ok(module);
    }

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(error) => {
            return Err(vm.import_error(&format!(
                "cannot read module '{}' at {}: {}",
                dotted,
                path.display(),
                error
            )));
        }
    };

    let leaf = dotted.rsplit('.').next().unwrap_or(dotted).to_string();
    let module = create_module(vm, &leaf, &canonical);
    vm.modules.insert(dotted.to_string(), module);

    let function = match crate::compiler::compile(&source, &mut vm.heap, module, "", false) {
        Ok(function) => function,
        Err(diagnostics) => {
            return Err(vm.import_error(&format!(
                "module '{}' failed to compile: {}",
                dotted, diagnostics
            )));
        }
    };
    vm.execute_function(function)?;
    trace!("import {}: executed {}", dotted, canonical);
    Ok(module)
}
