//! The embedding API: compile and run Blade source against a persistent
//! top-level module.
//!
//! A [`Runtime`] owns one VM. Globals defined by one `run` call stay
//! visible to the next, which is what the REPL builds on. Output from
//! `echo`/`print` goes to stdout by default, or into a buffer retrievable
//! with [`Runtime::take_output`] when buffering is enabled — the form all
//! of the integration tests use.

use std::path::PathBuf;
use std::rc::Rc;

use crate::compiler;
use crate::error::{Error, Result, VmError};
use crate::heap::DEFAULT_GC_THRESHOLD;
use crate::loader;
use crate::modules::NativeModule;
use crate::value::{stringify, ObjId, Value};
use crate::vm::Vm;

/// Construction-time knobs for a [`Runtime`].
pub struct RuntimeOptions {
    /// Initial GC threshold in bytes (the CLI's `-g`).
    pub gc_threshold: usize,
    /// Capture `echo`/`print` output instead of writing to stdout.
    pub buffer_output: bool,
    /// Extra import roots searched after the current directory.
    pub import_roots: Vec<PathBuf>,
    /// Arguments exposed to scripts via `os.args()`.
    pub script_args: Vec<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            buffer_output: true,
            import_roots: Vec::new(),
            script_args: Vec::new(),
        }
    }
}

pub struct Runtime {
    vm: Vm,
    main_module: ObjId,
}

impl Runtime {
    /// A runtime with buffered output and default limits.
    pub fn new() -> Runtime {
        Runtime::with_options(RuntimeOptions::default())
    }

    pub fn with_options(options: RuntimeOptions) -> Runtime {
        let mut vm = Vm::new(options.gc_threshold, options.buffer_output);
        crate::modules::register_defaults(&mut vm);
        for root in options.import_roots {
            vm.add_import_root(root);
        }
        vm.set_script_args(options.script_args);
        let main_module = loader::create_module(&mut vm, "main", "<main>");
        Runtime { vm, main_module }
    }

    /// Register an additional native module importable from scripts.
    pub fn register_module(&mut self, module: Rc<dyn NativeModule>) {
        self.vm.register_native_module(module);
    }

    /// Evaluate source in the top-level module. A trailing expression
    /// statement becomes the returned value; globals persist across calls.
    pub fn run(&mut self, source: &str) -> Result<Value> {
        self.execute(source, true)
    }

    /// Run source as a script: no implicit result, statements only.
    pub fn run_script(&mut self, source: &str) -> Result<Value> {
        self.execute(source, false)
    }

    /// Read and run a script file, adding its directory as an import root.
    pub fn run_file(&mut self, path: &std::path::Path) -> Result<Value> {
        let source = std::fs::read_to_string(path)?;
        if let Some(parent) = path.parent() {
            self.vm.add_import_root(parent.to_path_buf());
        }
        self.execute(&source, false)
    }

    /// Parse-check only (`-j`): compile and discard.
    pub fn check(&mut self, source: &str) -> Result<()> {
        compiler::compile(source, &mut self.vm.heap, self.main_module, "", false)
            .map(|_| ())
            .map_err(Error::Compile)
    }

    /// Compile and render the bytecode without executing (`-d` uses this
    /// before running).
    pub fn disassemble(&mut self, source: &str) -> Result<String> {
        let function = compiler::compile(source, &mut self.vm.heap, self.main_module, "", false)
            .map_err(Error::Compile)?;
        Ok(crate::debug::disassemble(&self.vm.heap, function))
    }

    fn execute(&mut self, source: &str, interactive: bool) -> Result<Value> {
        let function =
            compiler::compile(source, &mut self.vm.heap, self.main_module, "", interactive)
                .map_err(Error::Compile)?;
        match self.vm.execute_function(function) {
            Ok(value) => Ok(value),
            Err(VmError::Throw(value)) => {
                let trace = self.vm.render_uncaught(value);
                self.vm.reset_after_error();
                Err(Error::Runtime(trace))
            }
            Err(VmError::Overflow(what)) => {
                self.vm.reset_after_error();
                Err(Error::StackOverflow(what.to_string()))
            }
            Err(VmError::Exit(code)) => {
                self.vm.reset_after_error();
                Err(Error::Exit(code))
            }
        }
    }

    /// Drain captured output (buffered runtimes only).
    pub fn take_output(&mut self) -> String {
        self.vm.take_output()
    }

    /// Human-readable form of a value, honoring `@to_string` overloads.
    pub fn display(&mut self, value: Value) -> String {
        self.vm
            .display_value(value)
            .unwrap_or_else(|_| stringify(&self.vm.heap, value))
    }

    /// Live heap object count; exposed for tests and diagnostics.
    pub fn heap_objects(&self) -> usize {
        self.vm.heap.object_count()
    }

    /// Bytes currently accounted to the heap.
    pub fn heap_bytes(&self) -> usize {
        self.vm.heap.bytes_allocated()
    }

    /// Force a full collection at a safe point.
    pub fn collect_now(&mut self) {
        self.vm.collect_garbage();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}
