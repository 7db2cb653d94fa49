//! The bytecode virtual machine.
//!
//! A stack machine with three logical registers: the value stack, the
//! call-frame stack, and the instruction pointer of the innermost frame.
//! The main loop fetches one [`Op`] per iteration and dispatches through
//! [`Vm::execute`]; errors surface as [`VmError::Throw`] values and are
//! routed through the handler stack by [`Vm::unwind`].
//!
//! Garbage collection, stack-overflow checks, and handler bookkeeping all
//! happen between opcodes — the safe point. Reentrant calls (operator
//! overloads, `@to_string`, the iterator protocol, callback-taking builtin
//! methods) run the same loop against a frame floor and return when the
//! frame stack drains back to it.

use std::io::Write as _;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::{Blob, Op, NO_FILTER, NO_TARGET};
use crate::error::{RuntimeTrace, TraceFrame, VmError};
use crate::heap::Heap;
use crate::loader;
use crate::methods;
use crate::modules::NativeModule;
use crate::object::{
    new_table, BoundMethod, Closure, Instance, NativeFn, NativeFunction, Obj, Table, Upvalue,
};
use crate::operators;
use crate::value::{stringify, DictKey, ObjId, Value};

/// Fixed maximum call depth; exceeding it is fatal (exit code 71).
pub const FRAMES_MAX: usize = 1024;
/// Fixed maximum value-stack depth.
pub const STACK_MAX: usize = 64 * 1024;

/// One activation record.
pub(crate) struct CallFrame {
    pub closure: ObjId,
    pub code: Rc<Blob>,
    /// Index of the *next* instruction to execute.
    pub ip: usize,
    /// Stack slot of the callee / receiver; locals index from here.
    pub base: usize,
    /// Module whose globals this frame resolves against.
    pub module: ObjId,
}

/// An installed `try` handler.
struct Handler {
    /// Frame the handler belongs to (index into the frame stack).
    frame: usize,
    /// Value-stack height at `Try`; the unwinder truncates back to it.
    stack_len: usize,
    /// Resolved class filter, or None for catch-all.
    filter: Option<Value>,
    catch_ip: Option<usize>,
    finally_ip: Option<usize>,
}

/// What a `finally` block owes when it completes.
enum PendingAction {
    /// Normal entry; nothing deferred.
    Normal,
    Throw(Value),
    Return(Value),
    Jump { target: usize, trys: u16 },
}

/// One deferred action, pushed when a `finally` block is entered and
/// consumed by its `EndTry`. A stack (tagged by frame and handler depth)
/// keeps nested finallys and reentrant calls from clobbering each other.
struct PendingEntry {
    action: PendingAction,
    /// Frame whose finally this belongs to; dropped when that frame pops.
    frame: usize,
    /// Handler-stack depth when the finally was entered. A later unwind
    /// that cuts below this depth aborts the finally, and the entry with
    /// it.
    floor: usize,
}

enum Flow {
    Normal,
    Return,
}

/// The builtin exception class hierarchy, rooted at `Exception`.
pub(crate) struct CoreClasses {
    pub exception: ObjId,
    pub type_error: ObjId,
    pub value_error: ObjId,
    pub argument_error: ObjId,
    pub property_error: ObjId,
    pub range_error: ObjId,
    pub name_error: ObjId,
    pub import_error: ObjId,
}

impl CoreClasses {
    fn each(&self) -> [ObjId; 8] {
        [
            self.exception,
            self.type_error,
            self.value_error,
            self.argument_error,
            self.property_error,
            self.range_error,
            self.name_error,
            self.import_error,
        ]
    }
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues ordered ascending by captured stack slot; at most one
    /// per slot.
    open_upvalues: Vec<ObjId>,
    handlers: Vec<Handler>,
    pendings: Vec<PendingEntry>,
    /// Loaded modules by canonical path or native name; each loads once.
    pub(crate) modules: IndexMap<String, ObjId, fnv::FnvBuildHasher>,
    /// Registered native-module providers, consulted by the import loader.
    pub(crate) native_modules: Vec<Rc<dyn NativeModule>>,
    /// Names visible in every module scope: native functions and the
    /// builtin exception classes.
    pub(crate) builtins: Table<ObjId>,
    pub(crate) core: CoreClasses,
    pub(crate) import_roots: Vec<std::path::PathBuf>,
    pub(crate) script_args: Vec<String>,
    buffer_output: bool,
    out: String,
    /// Trace captured when the most recent unwind started.
    last_trace: Vec<TraceFrame>,
}

impl Vm {
    pub(crate) fn new(gc_threshold: usize, buffer_output: bool) -> Vm {
        let mut heap = Heap::new(gc_threshold);
        let core = install_exception_classes(&mut heap);
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            pendings: Vec::new(),
            modules: IndexMap::with_hasher(fnv::FnvBuildHasher::default()),
            native_modules: Vec::new(),
            builtins: new_table(),
            core,
            import_roots: Vec::new(),
            script_args: Vec::new(),
            buffer_output,
            out: String::new(),
            last_trace: Vec::new(),
        };
        let classes = vm.core.each();
        for class in classes {
            let name_id = match vm.heap.get(class) {
                Obj::Class(c) => c.name,
                _ => unreachable!(),
            };
            vm.builtins.insert(name_id, Value::Obj(class));
        }
        crate::builtins::install(&mut vm);
        vm
    }

    pub(crate) fn register_native_module(&mut self, module: Rc<dyn NativeModule>) {
        self.native_modules.push(module);
    }

    pub(crate) fn set_script_args(&mut self, args: Vec<String>) {
        self.script_args = args;
    }

    pub(crate) fn add_import_root(&mut self, root: std::path::PathBuf) {
        self.import_roots.push(root);
    }

    // -----------------------------------------------------------------------
    // Public-ish helpers for native code
    // -----------------------------------------------------------------------

    /// Allocate (intern) a string value.
    pub fn make_string(&mut self, text: &str) -> Value {
        self.heap.intern_value(text)
    }

    pub fn make_list(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.heap.alloc(Obj::List(items)))
    }

    pub fn make_bytes(&mut self, bytes: Vec<u8>) -> Value {
        Value::Obj(self.heap.alloc(Obj::Bytes(bytes)))
    }

    /// Borrow the text of a string value, if it is one.
    pub fn string_of(&self, value: Value) -> Option<&str> {
        match value {
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Str(s) => Some(&s.text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Total stringification honoring `@to_string` overloads.
    pub fn display_value(&mut self, value: Value) -> Result<String, VmError> {
        if let Value::Obj(id) = value {
            if let Obj::Instance(_) = self.heap.get(id) {
                let to_string = self.heap.intern("@to_string");
                if self.find_method(value, to_string).is_some() {
                    let result = self.call_sync_method(value, to_string, &[])?;
                    return Ok(match self.string_of(result) {
                        Some(text) => text.to_string(),
                        None => stringify(&self.heap, result),
                    });
                }
            }
        }
        Ok(stringify(&self.heap, value))
    }

    // -----------------------------------------------------------------------
    // Error construction
    // -----------------------------------------------------------------------

    /// Build an exception instance of `class` and wrap it for raising.
    pub(crate) fn make_error(&mut self, class: ObjId, message: &str) -> VmError {
        let mut properties = new_table();
        let message_key = self.heap.intern("message");
        let message_value = self.heap.intern_value(message);
        properties.insert(message_key, message_value);
        let type_key = self.heap.intern("type");
        let class_name = match self.heap.get(class) {
            Obj::Class(c) => Value::Obj(c.name),
            _ => Value::Nil,
        };
        properties.insert(type_key, class_name);
        let instance = self.heap.alloc(Obj::Instance(Instance {
            class,
            properties,
        }));
        VmError::Throw(Value::Obj(instance))
    }

    pub fn type_error(&mut self, message: &str) -> VmError {
        let class = self.core.type_error;
        self.make_error(class, message)
    }

    pub fn value_error(&mut self, message: &str) -> VmError {
        let class = self.core.value_error;
        self.make_error(class, message)
    }

    pub fn argument_error(&mut self, message: &str) -> VmError {
        let class = self.core.argument_error;
        self.make_error(class, message)
    }

    pub fn property_error(&mut self, message: &str) -> VmError {
        let class = self.core.property_error;
        self.make_error(class, message)
    }

    pub fn range_error(&mut self, message: &str) -> VmError {
        let class = self.core.range_error;
        self.make_error(class, message)
    }

    pub fn name_error(&mut self, message: &str) -> VmError {
        let class = self.core.name_error;
        self.make_error(class, message)
    }

    pub fn import_error(&mut self, message: &str) -> VmError {
        let class = self.core.import_error;
        self.make_error(class, message)
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    pub(crate) fn write_out(&mut self, text: &str) {
        if self.buffer_output {
            self.out.push_str(text);
        } else {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
    }

    pub(crate) fn take_output(&mut self) -> String {
        std::mem::take(&mut self.out)
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Wrap a compiled script function in a closure and run it to
    /// completion.
    pub(crate) fn execute_function(&mut self, function: ObjId) -> Result<Value, VmError> {
        let closure = self.heap.alloc(Obj::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.call_sync(Value::Obj(closure), &[])
    }

    /// Call any callable synchronously: push it with its arguments, run the
    /// dispatch loop until the frame stack drains back to the caller, and
    /// return the produced value. This is the reentry point used by
    /// operator overloads, iterators, and callback-taking builtins.
    pub(crate) fn call_sync(&mut self, callee: Value, args: &[Value]) -> Result<Value, VmError> {
        let floor = self.frames.len();
        self.stack.push(callee);
        for &arg in args {
            self.stack.push(arg);
        }
        self.call_value(callee, args.len() as u8)?;
        if self.frames.len() > floor {
            self.run_internal(floor)
        } else {
            Ok(self.stack.pop().unwrap_or(Value::Nil))
        }
    }

    /// Invoke a method on a receiver synchronously (by interned name id).
    pub(crate) fn call_sync_method(
        &mut self,
        receiver: Value,
        name: ObjId,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let Some(method) = self.find_method(receiver, name) else {
            let name_text = self.heap.str_text(name).to_string();
            return Err(self.property_error(&format!(
                "'{}' has no method {}",
                receiver.type_name(&self.heap),
                name_text
            )));
        };
        let floor = self.frames.len();
        // The receiver occupies the callee slot and becomes local 0.
        self.stack.push(receiver);
        for &arg in args {
            self.stack.push(arg);
        }
        self.call_with_receiver(method, args.len() as u8)?;
        if self.frames.len() > floor {
            self.run_internal(floor)
        } else {
            Ok(self.stack.pop().unwrap_or(Value::Nil))
        }
    }

    /// Resolve a method id on an instance (or class statics) receiver.
    pub(crate) fn find_method(&self, receiver: Value, name: ObjId) -> Option<ObjId> {
        let id = receiver.as_obj()?;
        match self.heap.get(id) {
            Obj::Instance(instance) => match self.heap.get(instance.class) {
                Obj::Class(class) => class.methods.get(&name).and_then(|v| v.as_obj()),
                _ => None,
            },
            Obj::Class(class) => class.statics.get(&name).and_then(|v| v.as_obj()),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // The dispatch loop
    // -----------------------------------------------------------------------

    fn run_internal(&mut self, floor: usize) -> Result<Value, VmError> {
        loop {
            // Safe point: collection and limit checks between opcodes only.
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            if self.stack.len() > STACK_MAX {
                return Err(VmError::Overflow("value stack limit exceeded"));
            }

            let op = {
                let frame = self.frames.last_mut().expect("no active frame");
                let op = frame.code.code[frame.ip];
                frame.ip += 1;
                op
            };

            match self.execute(op) {
                Ok(Flow::Normal) => {}
                Ok(Flow::Return) => {
                    if self.frames.len() == floor {
                        return Ok(self.stack.pop().unwrap_or(Value::Nil));
                    }
                }
                Err(VmError::Throw(value)) => self.unwind(value, floor)?,
                Err(fatal) => return Err(fatal),
            }
        }
    }

    fn execute(&mut self, op: Op) -> Result<Flow, VmError> {
        match op {
            Op::Nil => self.stack.push(Value::Nil),
            Op::True => self.stack.push(Value::Bool(true)),
            Op::False => self.stack.push(Value::Bool(false)),
            Op::Empty => self.stack.push(Value::Empty),
            Op::Const(index) => {
                let value = self.constant(index);
                self.stack.push(value);
            }
            Op::Pop => {
                self.stack.pop();
            }
            Op::PopN(count) => {
                let len = self.stack.len().saturating_sub(count as usize);
                self.stack.truncate(len);
            }
            Op::Dup => {
                let top = self.peek(0);
                self.stack.push(top);
            }
            Op::DupTwo => {
                let below = self.peek(1);
                let top = self.peek(0);
                self.stack.push(below);
                self.stack.push(top);
            }

            // --- Locals / upvalues / globals ---
            Op::GetLocal(slot) => {
                let base = self.frame_base();
                let value = self.stack[base + slot as usize];
                self.stack.push(value);
            }
            Op::SetLocal(slot) => {
                let base = self.frame_base();
                let value = self.peek(0);
                self.stack[base + slot as usize] = value;
            }
            Op::GetUpvalue(index) => {
                let value = self.read_upvalue(index);
                self.stack.push(value);
            }
            Op::SetUpvalue(index) => {
                let value = self.peek(0);
                self.write_upvalue(index, value);
            }
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.stack.pop();
            }
            Op::GetGlobal(index) => {
                let name = self.constant_name(index);
                match self.lookup_global(name) {
                    Some(value) => self.stack.push(value),
                    None => {
                        let text = self.heap.str_text(name).to_string();
                        return Err(self.name_error(&format!("'{}' is not defined", text)));
                    }
                }
            }
            Op::SetGlobal(index) => {
                let name = self.constant_name(index);
                let value = self.peek(0);
                let module = self.frames.last().expect("frame").module;
                let defined = match self.heap.get_mut(module) {
                    Obj::Module(m) => {
                        if m.values.contains_key(&name) {
                            m.values.insert(name, value);
                            true
                        } else {
                            false
                        }
                    }
                    _ => false,
                };
                if !defined {
                    let text = self.heap.str_text(name).to_string();
                    return Err(self.name_error(&format!("'{}' is not defined", text)));
                }
            }
            Op::DefineGlobal(index) => {
                let name = self.constant_name(index);
                let value = self.stack.pop().unwrap_or(Value::Nil);
                let module = self.frames.last().expect("frame").module;
                if let Obj::Module(m) = self.heap.get_mut(module) {
                    m.values.insert(name, value);
                }
            }
            Op::PopToLocal(count) => {
                let base = self.frame_base();
                self.stack.truncate(base + count as usize);
            }

            // --- Arithmetic / logic ---
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::FloorDiv
            | Op::Mod
            | Op::Pow
            | Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::Shl
            | Op::Shr
            | Op::UShr => self.binary_arith(op)?,
            Op::Negate => {
                let value = self.peek(0);
                let result = operators::negate(&self.heap, value)
                    .map_err(|message| self.type_error(&message))?;
                self.stack.pop();
                self.stack.push(result);
            }
            Op::Not => {
                let value = self.stack.pop().unwrap_or(Value::Nil);
                let truthy = value.is_truthy(&self.heap);
                self.stack.push(Value::Bool(!truthy));
            }
            Op::BitNot => {
                let value = self.peek(0);
                let result = operators::bit_not(&self.heap, value)
                    .map_err(|message| self.type_error(&message))?;
                self.stack.pop();
                self.stack.push(result);
            }
            Op::Equal => self.equality_op()?,
            Op::Greater | Op::GreaterEqual | Op::Less | Op::LessEqual => self.compare_op(op)?,

            // --- Containers ---
            Op::Range => {
                let upper = self.peek(0);
                let lower = self.peek(1);
                let result = operators::make_range(&mut self.heap, lower, upper)
                    .map_err(|message| self.type_error(&message))?;
                self.stack.truncate(self.stack.len() - 2);
                self.stack.push(result);
            }
            Op::BuildList(count) => {
                let start = self.stack.len() - count as usize;
                let items: Vec<Value> = self.stack.drain(start..).collect();
                let id = self.heap.alloc(Obj::List(items));
                self.stack.push(Value::Obj(id));
            }
            Op::BuildDict(count) => self.build_dict(count)?,
            Op::BuildString(count) => self.build_string(count)?,
            Op::Index => {
                let index = self.peek(0);
                let target = self.peek(1);
                let result = self.index_value(target, index)?;
                self.stack.truncate(self.stack.len() - 2);
                self.stack.push(result);
            }
            Op::SetIndex => {
                let value = self.peek(0);
                let index = self.peek(1);
                let target = self.peek(2);
                self.set_index(target, index, value)?;
                self.stack.truncate(self.stack.len() - 3);
                self.stack.push(value);
            }
            Op::GetProperty(index) => {
                let name = self.constant_name(index);
                self.get_property(name)?;
            }
            Op::SetProperty(index) => {
                let name = self.constant_name(index);
                self.set_property(name)?;
            }
            Op::Invoke { name, argc } => {
                let name_id = self.constant_name(name);
                self.invoke(name_id, argc)?;
            }
            Op::SuperInvoke { name, argc } => {
                let name_id = self.constant_name(name);
                self.super_invoke(name_id, argc)?;
            }

            // --- Control flow ---
            Op::Jump(target) | Op::Loop(target) => {
                self.frames.last_mut().expect("frame").ip = target as usize;
            }
            Op::JumpIfFalse(target) => {
                let value = self.stack.pop().unwrap_or(Value::Nil);
                if !value.is_truthy(&self.heap) {
                    self.frames.last_mut().expect("frame").ip = target as usize;
                }
            }
            Op::JumpIfFalseOrPop(target) => {
                let value = self.peek(0);
                if !value.is_truthy(&self.heap) {
                    self.frames.last_mut().expect("frame").ip = target as usize;
                } else {
                    self.stack.pop();
                }
            }
            Op::JumpIfTrueOrPop(target) => {
                let value = self.peek(0);
                if value.is_truthy(&self.heap) {
                    self.frames.last_mut().expect("frame").ip = target as usize;
                } else {
                    self.stack.pop();
                }
            }
            Op::JumpIfNotNilOrPop(target) => {
                let value = self.peek(0);
                if !value.is_nil() {
                    self.frames.last_mut().expect("frame").ip = target as usize;
                } else {
                    self.stack.pop();
                }
            }
            Op::JumpIfNil(target) => {
                let value = self.stack.pop().unwrap_or(Value::Nil);
                if value.is_nil() {
                    self.frames.last_mut().expect("frame").ip = target as usize;
                }
            }
            Op::Call(argc) => {
                let callee = self.peek(argc as usize);
                self.call_value(callee, argc)?;
            }
            Op::Return => {
                let value = self.stack.pop().unwrap_or(Value::Nil);
                // A return written inside a finally body overrides whatever
                // that finally was going to resume.
                let frame = self.frames.len() - 1;
                self.pendings.retain(|entry| entry.frame != frame);
                return self.do_return(value);
            }

            // --- Closures / classes ---
            Op::Closure(index) => self.make_closure(index)?,
            Op::Class(index) => {
                let name = self.constant_name(index);
                let id = self.heap.alloc(Obj::Class(crate::object::Class {
                    name,
                    superclass: None,
                    fields: new_table(),
                    statics: new_table(),
                    methods: new_table(),
                }));
                self.stack.push(Value::Obj(id));
            }
            Op::Inherit => self.inherit()?,
            Op::Method(index) => {
                let name = self.constant_name(index);
                self.install_method(name, false)?;
            }
            Op::StaticMethod(index) => {
                let name = self.constant_name(index);
                self.install_method(name, true)?;
            }
            Op::Field(index) => {
                let name = self.constant_name(index);
                let value = self.stack.pop().unwrap_or(Value::Nil);
                let class = self.peek(0).as_obj().expect("class on stack");
                if let Obj::Class(c) = self.heap.get_mut(class) {
                    c.fields.insert(name, value);
                }
            }
            Op::StaticField(index) => {
                let name = self.constant_name(index);
                let value = self.stack.pop().unwrap_or(Value::Nil);
                let class = self.peek(0).as_obj().expect("class on stack");
                if let Obj::Class(c) = self.heap.get_mut(class) {
                    c.statics.insert(name, value);
                }
            }

            // --- Exceptions ---
            Op::Try {
                filter,
                catch,
                finally,
            } => {
                let filter_value = if filter == NO_FILTER {
                    None
                } else {
                    let name = self.constant_name(filter);
                    match self.lookup_global(name) {
                        Some(value) => Some(value),
                        None => {
                            let text = self.heap.str_text(name).to_string();
                            return Err(self.name_error(&format!("'{}' is not defined", text)));
                        }
                    }
                };
                self.handlers.push(Handler {
                    frame: self.frames.len() - 1,
                    stack_len: self.stack.len(),
                    filter: filter_value,
                    catch_ip: (catch != NO_TARGET).then_some(catch as usize),
                    finally_ip: (finally != NO_TARGET).then_some(finally as usize),
                });
            }
            Op::PopTry => {
                self.handlers.pop();
            }
            Op::Raise => {
                let value = self.stack.pop().unwrap_or(Value::Nil);
                return Err(VmError::Throw(value));
            }
            Op::BeginFinally => {
                let frame = self.frames.len() - 1;
                let floor = self.handlers.len();
                self.pendings.push(PendingEntry {
                    action: PendingAction::Normal,
                    frame,
                    floor,
                });
            }
            Op::EndTry => match self.pendings.pop().map(|entry| entry.action) {
                None | Some(PendingAction::Normal) => {}
                Some(PendingAction::Throw(value)) => return Err(VmError::Throw(value)),
                Some(PendingAction::Return(value)) => return self.do_return(value),
                Some(PendingAction::Jump { target, trys }) => self.unwind_jump(trys, target)?,
            },
            Op::Unwind { trys, target } => self.unwind_jump(trys, target as usize)?,

            // --- Iteration ---
            Op::IterNext => {
                let key = self.peek(0);
                let iterable = self.peek(1);
                let next = self.iter_next(iterable, key)?;
                self.stack.truncate(self.stack.len() - 2);
                self.stack.push(next);
            }
            Op::IterGet => {
                let key = self.peek(0);
                let iterable = self.peek(1);
                let element = self.iter_get(iterable, key)?;
                self.stack.truncate(self.stack.len() - 2);
                self.stack.push(element);
            }

            // --- Modules / output ---
            Op::Import(index) => {
                let path = {
                    let name = self.constant_name(index);
                    self.heap.str_text(name).to_string()
                };
                let module = loader::load_module(self, &path)?;
                self.stack.push(Value::Obj(module));
            }
            Op::ImportMember(index) => {
                let name = self.constant_name(index);
                let module = self.peek(0).as_obj().expect("module on stack");
                let value = match self.heap.get(module) {
                    Obj::Module(m) => m.values.get(&name).copied(),
                    _ => None,
                };
                let Some(value) = value else {
                    let text = self.heap.str_text(name).to_string();
                    return Err(self.import_error(&format!("module does not export '{}'", text)));
                };
                let current = self.frames.last().expect("frame").module;
                if let Obj::Module(m) = self.heap.get_mut(current) {
                    m.values.insert(name, value);
                }
            }
            Op::ImportAll => {
                let module = self.peek(0).as_obj().expect("module on stack");
                let exports: Vec<(ObjId, Value)> = match self.heap.get(module) {
                    Obj::Module(m) => m.values.iter().map(|(k, v)| (*k, *v)).collect(),
                    _ => Vec::new(),
                };
                let current = self.frames.last().expect("frame").module;
                if let Obj::Module(m) = self.heap.get_mut(current) {
                    for (name, value) in exports {
                        m.values.insert(name, value);
                    }
                }
            }
            Op::Echo => {
                let value = self.peek(0);
                let text = self.display_value(value)?;
                self.stack.pop();
                self.write_out(&text);
                self.write_out("\n");
            }
        }
        Ok(Flow::Normal)
    }

    // -----------------------------------------------------------------------
    // Frame / stack access helpers
    // -----------------------------------------------------------------------

    fn frame_base(&self) -> usize {
        self.frames.last().expect("frame").base
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn constant(&self, index: u16) -> Value {
        self.frames.last().expect("frame").code.constants[index as usize]
    }

    fn constant_name(&self, index: u16) -> ObjId {
        self.constant(index).as_obj().expect("name constant")
    }

    fn pop_args(&mut self, argc: u8) -> Vec<Value> {
        let start = self.stack.len() - argc as usize;
        self.stack.drain(start..).collect()
    }

    fn lookup_global(&self, name: ObjId) -> Option<Value> {
        let module = self.frames.last().expect("frame").module;
        if let Obj::Module(m) = self.heap.get(module) {
            if let Some(&value) = m.values.get(&name) {
                return Some(value);
            }
        }
        self.builtins.get(&name).copied()
    }

    // -----------------------------------------------------------------------
    // Upvalues
    // -----------------------------------------------------------------------

    fn read_upvalue(&self, index: u16) -> Value {
        let closure = self.frames.last().expect("frame").closure;
        let upvalue = match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[index as usize],
            _ => panic!("frame closure is not a closure"),
        };
        match self.heap.get(upvalue) {
            Obj::Upvalue(Upvalue::Open(slot)) => self.stack[*slot],
            Obj::Upvalue(Upvalue::Closed(value)) => *value,
            _ => panic!("upvalue slot holds non-upvalue"),
        }
    }

    fn write_upvalue(&mut self, index: u16, value: Value) {
        let closure = self.frames.last().expect("frame").closure;
        let upvalue = match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[index as usize],
            _ => panic!("frame closure is not a closure"),
        };
        match self.heap.get_mut(upvalue) {
            Obj::Upvalue(Upvalue::Open(slot)) => {
                let slot = *slot;
                self.stack[slot] = value;
            }
            Obj::Upvalue(Upvalue::Closed(stored)) => *stored = value,
            _ => panic!("upvalue slot holds non-upvalue"),
        }
    }

    /// Find or create the open upvalue for a stack slot. Two closures
    /// capturing the same local share one upvalue object.
    fn capture_upvalue(&mut self, slot: usize) -> ObjId {
        let mut insert_at = self.open_upvalues.len();
        for (i, &id) in self.open_upvalues.iter().enumerate() {
            let open_slot = match self.heap.get(id) {
                Obj::Upvalue(Upvalue::Open(s)) => *s,
                _ => continue,
            };
            if open_slot == slot {
                return id;
            }
            if open_slot > slot {
                insert_at = i;
                break;
            }
        }
        let id = self.heap.alloc(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, id);
        id
    }

    /// Close every open upvalue at or above `from`, copying the stack
    /// value in. Must run while those slots are still live.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&id) = self.open_upvalues.last() {
            let slot = match self.heap.get(id) {
                Obj::Upvalue(Upvalue::Open(s)) => *s,
                _ => break,
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.get_mut(id) = Obj::Upvalue(Upvalue::Closed(value));
            self.open_upvalues.pop();
        }
    }

    fn make_closure(&mut self, index: u16) -> Result<(), VmError> {
        let function = self.constant(index).as_obj().expect("function constant");
        let descriptors = match self.heap.get(function) {
            Obj::Function(f) => f.upvalues.clone(),
            _ => panic!("closure constant is not a function"),
        };
        let base = self.frame_base();
        let enclosing = self.frames.last().expect("frame").closure;
        let mut upvalues = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.from_parent_local {
                upvalues.push(self.capture_upvalue(base + descriptor.index as usize));
            } else {
                let forwarded = match self.heap.get(enclosing) {
                    Obj::Closure(c) => c.upvalues[descriptor.index as usize],
                    _ => panic!("enclosing frame closure missing"),
                };
                upvalues.push(forwarded);
            }
        }
        let id = self.heap.alloc(Obj::Closure(Closure { function, upvalues }));
        self.stack.push(Value::Obj(id));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), VmError> {
        let Some(id) = callee.as_obj() else {
            let name = callee.type_name(&self.heap);
            return Err(self.type_error(&format!("'{}' is not callable", name)));
        };
        enum Kind {
            Closure,
            Native,
            Bound(Value, ObjId),
            BoundNative(Value, Rc<str>),
            Class,
            Other(&'static str),
        }
        let kind = match self.heap.get(id) {
            Obj::Closure(_) => Kind::Closure,
            Obj::Native(_) => Kind::Native,
            Obj::BoundMethod(b) => Kind::Bound(b.receiver, b.method),
            Obj::BoundNative(b) => Kind::BoundNative(b.receiver, Rc::clone(&b.name)),
            Obj::Class(_) => Kind::Class,
            other => Kind::Other(other.type_name()),
        };
        match kind {
            Kind::Closure => self.call_closure(id, argc),
            Kind::Native => self.call_native(id, argc),
            Kind::Bound(receiver, method) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = receiver;
                self.call_with_receiver(method, argc)
            }
            Kind::BoundNative(receiver, name) => {
                let args = self.pop_args(argc);
                self.stack.pop(); // the bound-native object
                let result = methods::invoke_builtin(self, receiver, &name, args)?;
                self.stack.push(result);
                Ok(())
            }
            Kind::Class => self.construct(id, argc),
            Kind::Other(name) => Err(self.type_error(&format!("'{}' is not callable", name))),
        }
    }

    fn call_closure(&mut self, closure: ObjId, argc: u8) -> Result<(), VmError> {
        let (name, arity, is_variadic, code, module) = {
            let function = match self.heap.get(closure) {
                Obj::Closure(c) => c.function,
                _ => panic!("call_closure on non-closure"),
            };
            match self.heap.get(function) {
                Obj::Function(f) => (
                    Rc::clone(&f.name),
                    f.arity as usize,
                    f.is_variadic,
                    Rc::clone(&f.code),
                    f.module,
                ),
                _ => panic!("closure function missing"),
            }
        };

        let mut argc = argc as usize;
        if is_variadic {
            let named = arity - 1;
            if argc < named {
                return Err(self.argument_error(&format!(
                    "{}() expects at least {} argument(s), got {}",
                    name, named, argc
                )));
            }
            let start = self.stack.len() - (argc - named);
            let rest: Vec<Value> = self.stack.drain(start..).collect();
            let list = self.heap.alloc(Obj::List(rest));
            self.stack.push(Value::Obj(list));
            argc = arity;
        } else if argc != arity {
            return Err(self.argument_error(&format!(
                "{}() expects {} argument(s), got {}",
                name, arity, argc
            )));
        }

        if self.frames.len() >= FRAMES_MAX {
            return Err(VmError::Overflow("call stack limit exceeded"));
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame {
            closure,
            code,
            ip: 0,
            base,
            module,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjId, argc: u8) -> Result<(), VmError> {
        let (name, min, max, func) = match self.heap.get(native) {
            Obj::Native(n) => (Rc::clone(&n.name), n.min_arity, n.max_arity, Rc::clone(&n.func)),
            _ => panic!("call_native on non-native"),
        };
        if argc < min || (max != u8::MAX && argc > max) {
            return Err(self.argument_error(&format!(
                "{}() takes {} argument(s), got {}",
                name,
                arity_text(min, max),
                argc
            )));
        }
        let args = self.pop_args(argc);
        self.stack.pop(); // callee
        let result = self.run_native(&func, &args);
        self.stack.push(result?);
        Ok(())
    }

    /// Run a native function with its arguments pinned, so reentrant
    /// natives cannot lose them to a collection triggered mid-call.
    fn run_native(&mut self, func: &NativeFn, args: &[Value]) -> Result<Value, VmError> {
        let mut pinned = 0usize;
        for arg in args {
            if let Value::Obj(id) = arg {
                self.heap.pin(*id);
                pinned += 1;
            }
        }
        let result = func(self, args);
        for _ in 0..pinned {
            self.heap.unpin();
        }
        result
    }

    /// Call a method value — closure or native — whose receiver is already
    /// sitting in the callee slot.
    fn call_with_receiver(&mut self, method: ObjId, argc: u8) -> Result<(), VmError> {
        match self.heap.get(method) {
            Obj::Closure(_) => self.call_closure(method, argc),
            Obj::Native(_) => {
                let (name, min, max, func) = match self.heap.get(method) {
                    Obj::Native(n) => {
                        (Rc::clone(&n.name), n.min_arity, n.max_arity, Rc::clone(&n.func))
                    }
                    _ => unreachable!(),
                };
                if argc < min || (max != u8::MAX && argc > max) {
                    return Err(self.argument_error(&format!(
                        "{}() takes {} argument(s), got {}",
                        name,
                        arity_text(min, max),
                        argc
                    )));
                }
                let mut args = self.pop_args(argc);
                let receiver = self.stack.pop().unwrap_or(Value::Nil);
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(receiver);
                full.append(&mut args);
                let result = self.run_native(&func, &full)?;
                self.stack.push(result);
                Ok(())
            }
            other => {
                let name = other.type_name();
                Err(self.type_error(&format!("'{}' is not callable", name)))
            }
        }
    }

    /// Class call: allocate an instance, seed it from the field-initializer
    /// table, and run `@new` when the class defines one.
    fn construct(&mut self, class: ObjId, argc: u8) -> Result<(), VmError> {
        let new_key = self.heap.intern("@new");
        let (fields, ctor, class_name) = match self.heap.get(class) {
            Obj::Class(c) => (
                c.fields.clone(),
                c.methods.get(&new_key).and_then(|v| v.as_obj()),
                c.name,
            ),
            _ => panic!("construct on non-class"),
        };

        let instance = self.heap.alloc(Obj::Instance(Instance {
            class,
            properties: fields,
        }));
        let slot = self.stack.len() - argc as usize - 1;

        match ctor {
            Some(ctor) => {
                self.stack[slot] = Value::Obj(instance);
                self.call_with_receiver(ctor, argc)
            }
            None => {
                if argc != 0 {
                    let name = self.heap.str_text(class_name).to_string();
                    return Err(self.argument_error(&format!(
                        "{}() takes no constructor arguments, got {}",
                        name, argc
                    )));
                }
                let top = self.stack.len() - 1;
                self.stack[top] = Value::Obj(instance);
                Ok(())
            }
        }
    }

    fn invoke(&mut self, name: ObjId, argc: u8) -> Result<(), VmError> {
        let receiver = self.peek(argc as usize);
        enum Target {
            Value(Value),
            Method(ObjId),
            Builtin,
            Missing(&'static str),
        }
        let target = match receiver.as_obj().map(|id| self.heap.get(id)) {
            Some(Obj::Instance(instance)) => {
                if let Some(&field) = instance.properties.get(&name) {
                    Target::Value(field)
                } else {
                    match self.heap.get(instance.class) {
                        Obj::Class(c) => match c.methods.get(&name).and_then(|v| v.as_obj()) {
                            Some(method) => Target::Method(method),
                            None => Target::Missing("instance"),
                        },
                        _ => Target::Missing("instance"),
                    }
                }
            }
            Some(Obj::Class(class)) => match class.statics.get(&name) {
                Some(&value) => Target::Value(value),
                None => Target::Missing("class"),
            },
            Some(Obj::Module(module)) => match module.values.get(&name) {
                Some(&value) => Target::Value(value),
                None => Target::Missing("module"),
            },
            _ => Target::Builtin,
        };
        match target {
            Target::Value(value) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = value;
                self.call_value(value, argc)
            }
            Target::Method(method) => self.call_with_receiver(method, argc),
            Target::Builtin => {
                let args = self.pop_args(argc);
                self.stack.pop(); // receiver
                let name_text = self.heap.str_text(name).to_string();
                let result = methods::invoke_builtin(self, receiver, &name_text, args)?;
                self.stack.push(result);
                Ok(())
            }
            Target::Missing(kind) => {
                let name_text = self.heap.str_text(name).to_string();
                Err(self.property_error(&format!("{} has no property '{}'", kind, name_text)))
            }
        }
    }

    /// `parent.m(...)`: look the method up on the *defining* class's
    /// superclass, so overrides further down never recurse into themselves.
    fn super_invoke(&mut self, name: ObjId, argc: u8) -> Result<(), VmError> {
        let closure = self.frames.last().expect("frame").closure;
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => panic!("frame closure missing"),
        };
        let defining_class = match self.heap.get(function) {
            Obj::Function(f) => f.bound_class,
            _ => None,
        };
        let superclass = defining_class.and_then(|class| match self.heap.get(class) {
            Obj::Class(c) => c.superclass,
            _ => None,
        });
        let method = superclass.and_then(|sup| match self.heap.get(sup) {
            Obj::Class(c) => c.methods.get(&name).and_then(|v| v.as_obj()),
            _ => None,
        });
        match method {
            Some(method) => self.call_with_receiver(method, argc),
            None => {
                let text = self.heap.str_text(name).to_string();
                Err(self.property_error(&format!("superclass has no method '{}'", text)))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    fn get_property(&mut self, name: ObjId) -> Result<(), VmError> {
        let receiver = self.peek(0);
        enum Found {
            Value(Value),
            Bind(ObjId),
            BuiltinMethod,
            Missing(&'static str),
        }
        let found = match receiver.as_obj().map(|id| self.heap.get(id)) {
            Some(Obj::Instance(instance)) => {
                if let Some(&value) = instance.properties.get(&name) {
                    Found::Value(value)
                } else {
                    match self.heap.get(instance.class) {
                        Obj::Class(c) => match c.methods.get(&name).and_then(|v| v.as_obj()) {
                            Some(method) => Found::Bind(method),
                            None => Found::Missing("instance"),
                        },
                        _ => Found::Missing("instance"),
                    }
                }
            }
            Some(Obj::Class(class)) => match class.statics.get(&name) {
                Some(&value) => Found::Value(value),
                None => Found::Missing("class"),
            },
            Some(Obj::Module(module)) => match module.values.get(&name) {
                Some(&value) => Found::Value(value),
                None => Found::Missing("module"),
            },
            _ => {
                let name_text = self.heap.str_text(name);
                if methods::has_method(&self.heap, receiver, name_text) {
                    Found::BuiltinMethod
                } else {
                    Found::Missing("value")
                }
            }
        };
        match found {
            Found::Value(value) => {
                self.stack.pop();
                self.stack.push(value);
                Ok(())
            }
            Found::Bind(method) => {
                self.stack.pop();
                let bound = self.heap.alloc(Obj::BoundMethod(BoundMethod {
                    receiver,
                    method,
                }));
                self.stack.push(Value::Obj(bound));
                Ok(())
            }
            Found::BuiltinMethod => {
                self.stack.pop();
                let name_text: Rc<str> = Rc::from(self.heap.str_text(name));
                let bound = self.heap.alloc(Obj::BoundNative(crate::object::BoundNative {
                    receiver,
                    name: name_text,
                }));
                self.stack.push(Value::Obj(bound));
                Ok(())
            }
            Found::Missing(kind) => {
                let text = self.heap.str_text(name).to_string();
                Err(self.property_error(&format!("{} has no property '{}'", kind, text)))
            }
        }
    }

    fn set_property(&mut self, name: ObjId) -> Result<(), VmError> {
        let value = self.peek(0);
        let receiver = self.peek(1);
        let ok = match receiver.as_obj() {
            Some(id) => match self.heap.get_mut(id) {
                Obj::Instance(instance) => {
                    instance.properties.insert(name, value);
                    true
                }
                Obj::Class(class) => {
                    class.statics.insert(name, value);
                    true
                }
                _ => false,
            },
            None => false,
        };
        if !ok {
            let kind = receiver.type_name(&self.heap);
            return Err(self.type_error(&format!("cannot set properties on {}", kind)));
        }
        self.stack.truncate(self.stack.len() - 2);
        self.stack.push(value);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Class machinery
    // -----------------------------------------------------------------------

    /// Flatten the superclass into the class on top of the stack: methods
    /// and field initializers copy down so dispatch is one lookup.
    fn inherit(&mut self) -> Result<(), VmError> {
        let superclass = self.stack.pop().unwrap_or(Value::Nil);
        let class = self.peek(0).as_obj().expect("class on stack");
        let Some(super_id) = superclass.as_obj() else {
            let kind = superclass.type_name(&self.heap);
            return Err(self.type_error(&format!("cannot inherit from {}", kind)));
        };
        let (methods, fields) = match self.heap.get(super_id) {
            Obj::Class(c) => (c.methods.clone(), c.fields.clone()),
            _ => {
                let kind = superclass.type_name(&self.heap);
                return Err(self.type_error(&format!("cannot inherit from {}", kind)));
            }
        };
        if let Obj::Class(c) = self.heap.get_mut(class) {
            c.superclass = Some(super_id);
            c.methods = methods;
            c.fields = fields;
        }
        Ok(())
    }

    fn install_method(&mut self, name: ObjId, is_static: bool) -> Result<(), VmError> {
        let method = self.stack.pop().unwrap_or(Value::Nil);
        let class = self.peek(0).as_obj().expect("class on stack");
        // Stamp the defining class on the function for `parent` dispatch.
        if let Some(method_id) = method.as_obj() {
            let function = match self.heap.get(method_id) {
                Obj::Closure(c) => Some(c.function),
                _ => None,
            };
            if let Some(function) = function {
                if let Obj::Function(f) = self.heap.get_mut(function) {
                    f.bound_class = Some(class);
                }
            }
        }
        if let Obj::Class(c) = self.heap.get_mut(class) {
            if is_static {
                c.statics.insert(name, method);
            } else {
                c.methods.insert(name, method);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Arithmetic with operator-overload dispatch
    // -----------------------------------------------------------------------

    fn binary_arith(&mut self, op: Op) -> Result<(), VmError> {
        let right = self.peek(0);
        let left = self.peek(1);

        if let Some(name) = overload_name(op) {
            if self.is_instance(left) {
                let name_id = self.heap.intern(name);
                if self.find_method(left, name_id).is_some() {
                    let result = self.call_sync_method(left, name_id, &[right])?;
                    self.stack.truncate(self.stack.len() - 2);
                    self.stack.push(result);
                    return Ok(());
                }
            }
        }

        let result = match op {
            Op::Add => operators::add(&mut self.heap, left, right),
            Op::Sub => operators::sub(&self.heap, left, right),
            Op::Mul => operators::mul(&mut self.heap, left, right),
            Op::Div => operators::div(&self.heap, left, right),
            Op::FloorDiv => operators::floor_div(&self.heap, left, right),
            Op::Mod => operators::modulo(&self.heap, left, right),
            Op::Pow => operators::pow(&self.heap, left, right),
            Op::BitAnd => operators::bit_and(&self.heap, left, right),
            Op::BitOr => operators::bit_or(&self.heap, left, right),
            Op::BitXor => operators::bit_xor(&self.heap, left, right),
            Op::Shl => operators::shl(&self.heap, left, right),
            Op::Shr => operators::shr(&self.heap, left, right),
            Op::UShr => operators::ushr(&self.heap, left, right),
            _ => unreachable!("binary_arith on non-arith op"),
        };
        let result = result.map_err(|message| self.type_error(&message))?;
        self.stack.truncate(self.stack.len() - 2);
        self.stack.push(result);
        Ok(())
    }

    fn equality_op(&mut self) -> Result<(), VmError> {
        let right = self.peek(0);
        let left = self.peek(1);
        if self.is_instance(left) {
            let eq = self.heap.intern("@eq");
            if self.find_method(left, eq).is_some() {
                let result = self.call_sync_method(left, eq, &[right])?;
                self.stack.truncate(self.stack.len() - 2);
                self.stack.push(result);
                return Ok(());
            }
        }
        let result = Value::Bool(left.equals(right));
        self.stack.truncate(self.stack.len() - 2);
        self.stack.push(result);
        Ok(())
    }

    fn compare_op(&mut self, op: Op) -> Result<(), VmError> {
        use std::cmp::Ordering;
        let right = self.peek(0);
        let left = self.peek(1);

        if self.is_instance(left) {
            let direct = match op {
                Op::Greater => "@gt",
                Op::GreaterEqual => "@ge",
                Op::Less => "@lt",
                Op::LessEqual => "@le",
                _ => unreachable!(),
            };
            let direct_id = self.heap.intern(direct);
            if self.find_method(left, direct_id).is_some() {
                let result = self.call_sync_method(left, direct_id, &[right])?;
                self.stack.truncate(self.stack.len() - 2);
                self.stack.push(result);
                return Ok(());
            }
            // Fall back to a three-way @cmp returning a number.
            let cmp_id = self.heap.intern("@cmp");
            if self.find_method(left, cmp_id).is_some() {
                let ordering = self.call_sync_method(left, cmp_id, &[right])?;
                let n = ordering.as_number().unwrap_or(f64::NAN);
                let truth = match op {
                    Op::Greater => n > 0.0,
                    Op::GreaterEqual => n >= 0.0,
                    Op::Less => n < 0.0,
                    Op::LessEqual => n <= 0.0,
                    _ => unreachable!(),
                };
                self.stack.truncate(self.stack.len() - 2);
                self.stack.push(Value::Bool(truth));
                return Ok(());
            }
        }

        let symbol = match op {
            Op::Greater => ">",
            Op::GreaterEqual => ">=",
            Op::Less => "<",
            Op::LessEqual => "<=",
            _ => unreachable!(),
        };
        let ordering = operators::compare(&self.heap, symbol, left, right);
        let result = match ordering {
            Ok(ordering) => {
                let truth = match op {
                    Op::Greater => ordering == Ordering::Greater,
                    Op::GreaterEqual => ordering != Ordering::Less,
                    Op::Less => ordering == Ordering::Less,
                    Op::LessEqual => ordering != Ordering::Greater,
                    _ => unreachable!(),
                };
                Value::Bool(truth)
            }
            Err(message) => {
                // NaN comparisons are false, not errors.
                if let (Value::Number(_), Value::Number(_)) = (left, right) {
                    Value::Bool(false)
                } else {
                    return Err(self.type_error(&message));
                }
            }
        };
        self.stack.truncate(self.stack.len() - 2);
        self.stack.push(result);
        Ok(())
    }

    fn is_instance(&self, value: Value) -> bool {
        matches!(
            value.as_obj().map(|id| self.heap.get(id)),
            Some(Obj::Instance(_))
        )
    }

    // -----------------------------------------------------------------------
    // Containers
    // -----------------------------------------------------------------------

    fn build_dict(&mut self, count: u16) -> Result<(), VmError> {
        let start = self.stack.len() - (count as usize * 2);
        let raw: Vec<Value> = self.stack.drain(start..).collect();
        let mut dict = crate::object::Dict::new();
        for pair in raw.chunks(2) {
            let key = DictKey::from_value(pair[0], &self.heap)
                .map_err(|kind| self.type_error(&format!("'{}' cannot be a dict key", kind)))?;
            dict.insert(key, pair[1]);
        }
        let id = self.heap.alloc(Obj::Dict(dict));
        self.stack.push(Value::Obj(id));
        Ok(())
    }

    /// Join interpolation parts into one interned string. Parts stay on
    /// the stack while they stringify so a collection triggered by a
    /// `@to_string` override cannot free them.
    fn build_string(&mut self, count: u16) -> Result<(), VmError> {
        let mut text = String::new();
        for i in 0..count as usize {
            let index = self.stack.len() - count as usize + i;
            let part = self.stack[index];
            text.push_str(&self.display_value(part)?);
        }
        self.stack.truncate(self.stack.len() - count as usize);
        let value = self.heap.intern_value(&text);
        self.stack.push(value);
        Ok(())
    }

    fn index_value(&mut self, target: Value, index: Value) -> Result<Value, VmError> {
        let Some(id) = target.as_obj() else {
            let kind = target.type_name(&self.heap);
            return Err(self.type_error(&format!("{} is not indexable", kind)));
        };
        enum Out {
            Done(Value),
            Char(char),
            BadIndex(&'static str),
            OutOfRange(String),
            BadKey(&'static str),
            MissingKey,
            NotIndexable(&'static str),
        }
        let out = match self.heap.get(id) {
            Obj::List(items) => match integral(index) {
                Some(raw) => {
                    let len = items.len() as i64;
                    let actual = if raw < 0 { len + raw } else { raw };
                    if actual >= 0 && actual < len {
                        Out::Done(items[actual as usize])
                    } else {
                        Out::OutOfRange(format!("list index {} out of range", raw))
                    }
                }
                None => Out::BadIndex("list"),
            },
            Obj::Bytes(bytes) => match integral(index) {
                Some(raw) => {
                    let len = bytes.len() as i64;
                    let actual = if raw < 0 { len + raw } else { raw };
                    if actual >= 0 && actual < len {
                        Out::Done(Value::Number(bytes[actual as usize] as f64))
                    } else {
                        Out::OutOfRange(format!("bytes index {} out of range", raw))
                    }
                }
                None => Out::BadIndex("bytes"),
            },
            Obj::Str(s) => match integral(index) {
                Some(raw) => {
                    let count = s.text.chars().count() as i64;
                    let actual = if raw < 0 { count + raw } else { raw };
                    if actual >= 0 && actual < count {
                        let ch = s.text.chars().nth(actual as usize).unwrap();
                        Out::Char(ch)
                    } else {
                        Out::OutOfRange(format!("string index {} out of range", raw))
                    }
                }
                None => Out::BadIndex("string"),
            },
            Obj::Range(range) => match integral(index) {
                Some(raw) if raw >= 0 && raw < range.len() => {
                    Out::Done(Value::Number((range.lower + raw) as f64))
                }
                Some(raw) => Out::OutOfRange(format!("range index {} out of range", raw)),
                None => Out::BadIndex("range"),
            },
            Obj::Dict(dict) => match DictKey::from_value(index, &self.heap) {
                Ok(key) => match dict.get(key) {
                    Some(value) => Out::Done(value),
                    None => Out::MissingKey,
                },
                Err(kind) => Out::BadKey(kind),
            },
            other => Out::NotIndexable(other.type_name()),
        };
        match out {
            Out::Done(value) => Ok(value),
            Out::Char(ch) => {
                let mut buffer = [0u8; 4];
                Ok(self.heap.intern_value(ch.encode_utf8(&mut buffer)))
            }
            Out::BadIndex(kind) => {
                Err(self.type_error(&format!("{} indices must be integers", kind)))
            }
            Out::OutOfRange(message) => Err(self.range_error(&message)),
            Out::BadKey(kind) => {
                Err(self.type_error(&format!("'{}' cannot be a dict key", kind)))
            }
            Out::MissingKey => {
                let text = stringify(&self.heap, index);
                Err(self.range_error(&format!("dict has no key {}", text)))
            }
            Out::NotIndexable(kind) => {
                Err(self.type_error(&format!("{} is not indexable", kind)))
            }
        }
    }

    fn set_index(&mut self, target: Value, index: Value, value: Value) -> Result<(), VmError> {
        let Some(id) = target.as_obj() else {
            let kind = target.type_name(&self.heap);
            return Err(self.type_error(&format!("{} does not support index assignment", kind)));
        };
        enum Fail {
            None,
            BadIndex(&'static str),
            OutOfRange(String),
            BadKey(&'static str),
            BadByte,
            Unsupported(&'static str),
        }
        let key = DictKey::from_value(index, &self.heap);
        let fail = match self.heap.get_mut(id) {
            Obj::List(items) => match integral(index) {
                Some(raw) => {
                    let len = items.len() as i64;
                    let actual = if raw < 0 { len + raw } else { raw };
                    if actual < 0 {
                        Fail::OutOfRange(format!("list index {} out of range", raw))
                    } else {
                        // Writing past the end grows the list, filling the
                        // gap with `empty` holes.
                        if actual as usize >= items.len() {
                            items.resize(actual as usize + 1, Value::Empty);
                        }
                        items[actual as usize] = value;
                        Fail::None
                    }
                }
                None => Fail::BadIndex("list"),
            },
            Obj::Bytes(bytes) => match (integral(index), value) {
                (Some(raw), Value::Number(byte))
                    if byte.fract() == 0.0 && (0.0..=255.0).contains(&byte) =>
                {
                    let len = bytes.len() as i64;
                    let actual = if raw < 0 { len + raw } else { raw };
                    if actual >= 0 && actual < len {
                        bytes[actual as usize] = byte as u8;
                        Fail::None
                    } else {
                        Fail::OutOfRange(format!("bytes index {} out of range", raw))
                    }
                }
                (Some(_), _) => Fail::BadByte,
                (None, _) => Fail::BadIndex("bytes"),
            },
            Obj::Dict(dict) => match key {
                Ok(key) => {
                    dict.insert(key, value);
                    Fail::None
                }
                Err(kind) => Fail::BadKey(kind),
            },
            other => Fail::Unsupported(other.type_name()),
        };
        match fail {
            Fail::None => Ok(()),
            Fail::BadIndex(kind) => {
                Err(self.type_error(&format!("{} indices must be integers", kind)))
            }
            Fail::OutOfRange(message) => Err(self.range_error(&message)),
            Fail::BadKey(kind) => Err(self.type_error(&format!("'{}' cannot be a dict key", kind))),
            Fail::BadByte => Err(self.value_error("bytes values must be integers in 0..255")),
            Fail::Unsupported(kind) => {
                Err(self.type_error(&format!("{} does not support index assignment", kind)))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Iterator protocol
    // -----------------------------------------------------------------------

    /// `@itern`: next key after `key`, nil when exhausted; a nil key asks
    /// for the first key.
    fn iter_next(&mut self, iterable: Value, key: Value) -> Result<Value, VmError> {
        let Some(id) = iterable.as_obj() else {
            let kind = iterable.type_name(&self.heap);
            return Err(self.type_error(&format!("{} is not iterable", kind)));
        };
        enum Out {
            Done(Value),
            Instance,
            NotIterable(&'static str),
            BadKey,
        }
        let out = match self.heap.get(id) {
            Obj::List(items) => Out::Done(sequence_next(key, items.len())?),
            Obj::Bytes(bytes) => Out::Done(sequence_next(key, bytes.len())?),
            Obj::Range(range) => Out::Done(sequence_next(key, range.len() as usize)?),
            Obj::Str(s) => {
                // Keys are byte offsets aligned to code-point boundaries.
                let text = &s.text;
                match key {
                    Value::Nil => {
                        if text.is_empty() {
                            Out::Done(Value::Nil)
                        } else {
                            Out::Done(Value::Number(0.0))
                        }
                    }
                    Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => {
                        let offset = n as usize;
                        match text.get(offset..).and_then(|rest| rest.chars().next()) {
                            Some(ch) => {
                                let next = offset + ch.len_utf8();
                                if next < text.len() {
                                    Out::Done(Value::Number(next as f64))
                                } else {
                                    Out::Done(Value::Nil)
                                }
                            }
                            None => Out::Done(Value::Nil),
                        }
                    }
                    _ => Out::BadKey,
                }
            }
            Obj::Dict(dict) => match key {
                Value::Nil => match dict.entries.keys().next() {
                    Some(first) => Out::Done(first.to_value()),
                    None => Out::Done(Value::Nil),
                },
                _ => match DictKey::from_value(key, &self.heap) {
                    Ok(dk) => match dict.entries.get_index_of(&dk) {
                        Some(position) => match dict.entries.get_index(position + 1) {
                            Some((next, _)) => Out::Done(next.to_value()),
                            None => Out::Done(Value::Nil),
                        },
                        None => Out::Done(Value::Nil),
                    },
                    Err(_) => Out::BadKey,
                },
            },
            Obj::Instance(_) => Out::Instance,
            other => Out::NotIterable(other.type_name()),
        };
        match out {
            Out::Done(value) => Ok(value),
            Out::Instance => {
                let itern = self.heap.intern("@itern");
                self.call_sync_method(iterable, itern, &[key])
            }
            Out::NotIterable(kind) => {
                Err(self.type_error(&format!("{} is not iterable", kind)))
            }
            Out::BadKey => Err(self.type_error("invalid iterator key")),
        }
    }

    /// `@iter`: element for `key`.
    fn iter_get(&mut self, iterable: Value, key: Value) -> Result<Value, VmError> {
        let Some(id) = iterable.as_obj() else {
            let kind = iterable.type_name(&self.heap);
            return Err(self.type_error(&format!("{} is not iterable", kind)));
        };
        if let Obj::Instance(_) = self.heap.get(id) {
            let iter = self.heap.intern("@iter");
            return self.call_sync_method(iterable, iter, &[key]);
        }
        if let Obj::Str(s) = self.heap.get(id) {
            // String iteration keys are byte offsets, not char indices.
            let text = Rc::clone(&s.text);
            if let Value::Number(n) = key {
                if n.fract() == 0.0 && n >= 0.0 {
                    let offset = n as usize;
                    if let Some(ch) = text.get(offset..).and_then(|rest| rest.chars().next()) {
                        let mut buffer = [0u8; 4];
                        return Ok(self.heap.intern_value(ch.encode_utf8(&mut buffer)));
                    }
                }
            }
            return Err(self.range_error("string iterator key out of range"));
        }
        if let Obj::Dict(_) = self.heap.get(id) {
            let dk = DictKey::from_value(key, &self.heap)
                .map_err(|_| self.type_error("invalid iterator key"))?;
            let value = match self.heap.get(id) {
                Obj::Dict(dict) => dict.get(dk),
                _ => None,
            };
            return Ok(value.unwrap_or(Value::Nil));
        }
        self.index_value(iterable, key)
    }

    // -----------------------------------------------------------------------
    // Return / unwind machinery
    // -----------------------------------------------------------------------

    /// Record the action a `finally` must resume, then enter it.
    fn defer_into_finally(&mut self, action: PendingAction, finally_ip: usize) {
        let frame = self.frames.len() - 1;
        let floor = self.handlers.len();
        self.pendings.push(PendingEntry {
            action,
            frame,
            floor,
        });
        self.frames.last_mut().expect("frame").ip = finally_ip;
    }

    /// Drop deferred actions belonging to a frame that just popped.
    fn drop_frame_pendings(&mut self, frame: usize) {
        self.pendings.retain(|entry| entry.frame != frame);
    }

    /// Drop deferred actions of finallys aborted by an unwind that cut the
    /// handler stack below their entry depth.
    fn drop_aborted_pendings(&mut self, frame: usize) {
        let depth = self.handlers.len();
        self.pendings
            .retain(|entry| entry.frame != frame || entry.floor <= depth);
    }

    /// Return `value` from the current frame, detouring through any
    /// pending `finally` blocks of this frame first.
    fn do_return(&mut self, value: Value) -> Result<Flow, VmError> {
        let frame_index = self.frames.len() - 1;
        while let Some(handler) = self.handlers.last() {
            if handler.frame != frame_index {
                break;
            }
            let handler = self.handlers.pop().expect("handler");
            if let Some(finally_ip) = handler.finally_ip {
                self.close_upvalues(handler.stack_len);
                self.stack.truncate(handler.stack_len);
                self.defer_into_finally(PendingAction::Return(value), finally_ip);
                return Ok(Flow::Normal);
            }
        }
        let frame = self.frames.pop().expect("frame");
        self.close_upvalues(frame.base);
        self.stack.truncate(frame.base);
        self.stack.push(value);
        self.drop_frame_pendings(self.frames.len());
        Ok(Flow::Return)
    }

    /// Leave a loop across `trys` protected regions (break/continue),
    /// visiting each intervening `finally` before landing on `target`.
    fn unwind_jump(&mut self, mut trys: u16, target: usize) -> Result<(), VmError> {
        while trys > 0 {
            let handler = self.handlers.pop().expect("unwind without handler");
            trys -= 1;
            if let Some(finally_ip) = handler.finally_ip {
                self.close_upvalues(handler.stack_len);
                self.stack.truncate(handler.stack_len);
                self.defer_into_finally(PendingAction::Jump { target, trys }, finally_ip);
                return Ok(());
            }
        }
        self.frames.last_mut().expect("frame").ip = target;
        Ok(())
    }

    /// Route a raised value to the innermost matching handler at or above
    /// `floor`. Errors propagate past the floor to the native caller.
    fn unwind(&mut self, value: Value, floor: usize) -> Result<(), VmError> {
        self.last_trace = self.capture_trace();
        self.stamp_stacktrace(value);

        loop {
            let in_range = self
                .handlers
                .last()
                .is_some_and(|handler| handler.frame >= floor);
            if !in_range {
                break;
            }
            let handler = self.handlers.pop().expect("handler");

            // Pop frames above the handler's, closing their upvalues while
            // the slots are still live.
            while self.frames.len() - 1 > handler.frame {
                let frame = self.frames.pop().expect("frame");
                self.close_upvalues(frame.base);
                self.drop_frame_pendings(self.frames.len());
            }

            if let Some(catch_ip) = handler.catch_ip {
                let matched = match handler.filter {
                    None => true,
                    Some(filter) => self.instance_matches(value, filter),
                };
                if matched {
                    self.close_upvalues(handler.stack_len);
                    self.stack.truncate(handler.stack_len);
                    self.drop_aborted_pendings(handler.frame);
                    if let Some(finally_ip) = handler.finally_ip {
                        // The catch body runs under a finally-only handler
                        // so a raise inside it still reaches the finally.
                        self.handlers.push(Handler {
                            frame: handler.frame,
                            stack_len: handler.stack_len,
                            filter: None,
                            catch_ip: None,
                            finally_ip: Some(finally_ip),
                        });
                    }
                    self.stack.push(value);
                    self.frames.last_mut().expect("frame").ip = catch_ip;
                    return Ok(());
                }
            }

            if let Some(finally_ip) = handler.finally_ip {
                self.close_upvalues(handler.stack_len);
                self.stack.truncate(handler.stack_len);
                self.drop_aborted_pendings(handler.frame);
                self.defer_into_finally(PendingAction::Throw(value), finally_ip);
                return Ok(());
            }
        }

        // No handler within this loop's region: drain to the floor and let
        // the caller (native boundary or public API) deal with it.
        while self.frames.len() > floor {
            let frame = self.frames.pop().expect("frame");
            self.close_upvalues(frame.base);
            self.stack.truncate(frame.base);
            self.drop_frame_pendings(self.frames.len());
        }
        Err(VmError::Throw(value))
    }

    /// Does `value` match a `catch Klass` filter — is it an instance of
    /// the class or of any subclass?
    fn instance_matches(&self, value: Value, filter: Value) -> bool {
        let Some(filter_class) = filter.as_obj() else {
            return false;
        };
        let Some(id) = value.as_obj() else {
            return false;
        };
        let mut class = match self.heap.get(id) {
            Obj::Instance(instance) => Some(instance.class),
            _ => None,
        };
        while let Some(current) = class {
            if current == filter_class {
                return true;
            }
            class = match self.heap.get(current) {
                Obj::Class(c) => c.superclass,
                _ => None,
            };
        }
        false
    }

    fn capture_trace(&self) -> Vec<TraceFrame> {
        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function_name = match self.heap.get(frame.closure) {
                Obj::Closure(c) => match self.heap.get(c.function) {
                    Obj::Function(f) => {
                        if f.name.is_empty() {
                            "<script>".to_string()
                        } else {
                            f.name.to_string()
                        }
                    }
                    _ => "<script>".to_string(),
                },
                _ => "<script>".to_string(),
            };
            let module_name = match self.heap.get(frame.module) {
                Obj::Module(m) => m.name.to_string(),
                _ => "?".to_string(),
            };
            let line = frame.code.lines.line_at(frame.ip.saturating_sub(1));
            frames.push(TraceFrame {
                function: function_name,
                module: module_name,
                line,
            });
        }
        frames
    }

    /// Fill the `stacktrace` property of a raised exception instance.
    fn stamp_stacktrace(&mut self, value: Value) {
        let Some(id) = value.as_obj() else { return };
        if !matches!(self.heap.get(id), Obj::Instance(_)) {
            return;
        }
        let key = self.heap.intern("stacktrace");
        let already = match self.heap.get(id) {
            Obj::Instance(instance) => instance
                .properties
                .get(&key)
                .is_some_and(|v| !v.is_nil()),
            _ => true,
        };
        if already {
            return;
        }
        let rendered: Vec<String> = self
            .capture_trace()
            .iter()
            .map(|f| format!("at {} ({}:{})", f.function, f.module, f.line))
            .collect();
        let text = self.heap.intern_value(&rendered.join("\n"));
        if let Obj::Instance(instance) = self.heap.get_mut(id) {
            instance.properties.insert(key, text);
        }
    }

    /// Render an escaped (uncaught) exception for the public API.
    pub(crate) fn render_uncaught(&mut self, value: Value) -> RuntimeTrace {
        let message_key = self.heap.intern("message");
        let (kind, message) = match value.as_obj() {
            Some(id) => match self.heap.get(id) {
                Obj::Instance(instance) => {
                    let class_name = match self.heap.get(instance.class) {
                        Obj::Class(c) => self.heap.str_text(c.name).to_string(),
                        _ => "Exception".to_string(),
                    };
                    let message = instance
                        .properties
                        .get(&message_key)
                        .map(|&v| stringify(&self.heap, v))
                        .unwrap_or_default();
                    (class_name, message)
                }
                other => (other.type_name().to_string(), other.to_display(&self.heap)),
            },
            None => (
                value.type_name(&self.heap).to_string(),
                stringify(&self.heap, value),
            ),
        };
        RuntimeTrace {
            kind,
            message,
            frames: std::mem::take(&mut self.last_trace),
        }
    }

    /// Clear transient execution state after an error so the VM (and a
    /// REPL on top of it) can keep going.
    pub(crate) fn reset_after_error(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.handlers.clear();
        self.open_upvalues.clear();
        self.pendings.clear();
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Mark every root, trace, purge dead interned strings, sweep, then
    /// run module unload hooks against the coherent VM.
    pub(crate) fn collect_garbage(&mut self) {
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
            self.heap.mark_object(frame.module);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        for handler in &self.handlers {
            if let Some(filter) = handler.filter {
                self.heap.mark_value(filter);
            }
        }
        let pending_values: Vec<Value> = self
            .pendings
            .iter()
            .filter_map(|entry| match &entry.action {
                PendingAction::Throw(value) | PendingAction::Return(value) => Some(*value),
                _ => None,
            })
            .collect();
        for value in pending_values {
            self.heap.mark_value(value);
        }
        let modules: Vec<ObjId> = self.modules.values().copied().collect();
        for module in modules {
            self.heap.mark_object(module);
        }
        let builtins: Vec<(ObjId, Value)> =
            self.builtins.iter().map(|(k, v)| (*k, *v)).collect();
        for (name, value) in builtins {
            self.heap.mark_object(name);
            self.heap.mark_value(value);
        }
        for class in self.core.each() {
            self.heap.mark_object(class);
        }
        self.heap.mark_pins();

        self.heap.trace();
        self.heap.purge_interned();
        let unloads = self.heap.sweep();
        for hook in unloads {
            hook(self);
        }
    }
}

/// Sequence iteration helper shared by lists, bytes, and ranges: integer
/// keys 0..len.
fn sequence_next(key: Value, len: usize) -> Result<Value, VmError> {
    Ok(match key {
        Value::Nil => {
            if len == 0 {
                Value::Nil
            } else {
                Value::Number(0.0)
            }
        }
        Value::Number(n) => {
            let next = n as i64 + 1;
            if next >= 0 && (next as usize) < len {
                Value::Number(next as f64)
            } else {
                Value::Nil
            }
        }
        _ => Value::Nil,
    })
}

fn integral(value: Value) -> Option<i64> {
    match value {
        Value::Number(n) if n.fract() == 0.0 => Some(n as i64),
        _ => None,
    }
}

fn arity_text(min: u8, max: u8) -> String {
    if max == u8::MAX {
        format!("at least {}", min)
    } else if min == max {
        format!("{}", min)
    } else {
        format!("{} to {}", min, max)
    }
}

fn overload_name(op: Op) -> Option<&'static str> {
    Some(match op {
        Op::Add => "@add",
        Op::Sub => "@sub",
        Op::Mul => "@mul",
        Op::Div => "@div",
        Op::Mod => "@mod",
        Op::BitAnd => "@and",
        Op::BitOr => "@or",
        Op::BitXor => "@xor",
        Op::Shl => "@shl",
        Op::Shr => "@shr",
        _ => return None,
    })
}

/// Build the builtin exception hierarchy. Every class shares one native
/// constructor that stores the message and type name on the instance.
fn install_exception_classes(heap: &mut Heap) -> CoreClasses {
    let ctor: NativeFn = Rc::new(|vm: &mut Vm, args: &[Value]| {
        let receiver = args[0];
        let message = match args.get(1) {
            None | Some(Value::Nil) => String::new(),
            Some(&v) => match vm.string_of(v) {
                Some(text) => text.to_string(),
                None => stringify(&vm.heap, v),
            },
        };
        let message_value = vm.heap.intern_value(&message);
        let message_key = vm.heap.intern("message");
        let type_key = vm.heap.intern("type");
        let class_name = match receiver.as_obj().map(|id| vm.heap.get(id)) {
            Some(Obj::Instance(instance)) => match vm.heap.get(instance.class) {
                Obj::Class(c) => Value::Obj(c.name),
                _ => Value::Nil,
            },
            _ => Value::Nil,
        };
        if let Some(id) = receiver.as_obj() {
            if let Obj::Instance(instance) = vm.heap.get_mut(id) {
                instance.properties.insert(message_key, message_value);
                instance.properties.insert(type_key, class_name);
            }
        }
        Ok(receiver)
    });

    let define = |heap: &mut Heap, name: &str, superclass: Option<ObjId>| -> ObjId {
        let name_id = heap.intern(name);
        let new_key = heap.intern("@new");
        let native = heap.alloc(Obj::Native(NativeFunction {
            name: Rc::from("@new"),
            min_arity: 0,
            max_arity: 1,
            func: Rc::clone(&ctor),
        }));
        let mut methods = new_table();
        methods.insert(new_key, Value::Obj(native));
        heap.alloc(Obj::Class(crate::object::Class {
            name: name_id,
            superclass,
            fields: new_table(),
            statics: new_table(),
            methods,
        }))
    };

    let exception = define(heap, "Exception", None);
    CoreClasses {
        type_error: define(heap, "TypeError", Some(exception)),
        value_error: define(heap, "ValueError", Some(exception)),
        argument_error: define(heap, "ArgumentError", Some(exception)),
        property_error: define(heap, "PropertyError", Some(exception)),
        range_error: define(heap, "RangeError", Some(exception)),
        name_error: define(heap, "NameError", Some(exception)),
        import_error: define(heap, "ImportError", Some(exception)),
        exception,
    }
}
