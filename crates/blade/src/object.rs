//! Heap object variants and their payload types.
//!
//! Every object with identity lives in the VM arena as one [`Obj`] variant.
//! The GC header (mark bit, survival age) is kept alongside the object in
//! [`crate::heap::GcBox`]; this module only defines the payloads and the
//! operations that need no VM context (sizing, display, field walking for
//! the collector).

use std::any::Any;
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::{Blob, UpvalueDesc};
use crate::error::VmError;
use crate::heap::Heap;
use crate::value::{format_number, DictKey, ObjId, Value};
use crate::vm::Vm;

/// Insertion-ordered table used for dicts, module globals, instance
/// properties, and class tables. Iteration follows insertion order;
/// removal followed by reinsertion places the key at the end.
pub type Table<K> = IndexMap<K, Value, fnv::FnvBuildHasher>;

pub fn new_table<K: std::hash::Hash + Eq>() -> Table<K> {
    IndexMap::with_hasher(fnv::FnvBuildHasher::default())
}

/// Signature of a host-implemented function. Receives the VM (for heap
/// access and reentrant calls) and the argument span; methods see their
/// receiver as `args[0]`.
pub type NativeFn = Rc<dyn Fn(&mut Vm, &[Value]) -> Result<Value, VmError>>;

/// Hook run when a native module is unloaded during a GC sweep or at VM
/// shutdown.
pub type UnloadFn = Rc<dyn Fn(&mut Vm)>;

/// A heap object.
pub enum Obj {
    Str(BString),
    List(Vec<Value>),
    Bytes(Vec<u8>),
    Dict(Dict),
    Range(Range),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    /// A builtin method bound to its receiver on property access, e.g. the
    /// value of `"hi".length` before it is called.
    BoundNative(BoundNative),
    Native(NativeFunction),
    File(FileHandle),
    Pointer(Pointer),
    Module(Module),
}

/// An interned, immutable string with its precomputed FNV-1a hash.
pub struct BString {
    pub text: Rc<str>,
    pub hash: u32,
}

/// An insertion-ordered mapping. The [`IndexMap`] provides both the
/// ordered key sequence (iteration order) and the hashed lookup the C
/// original kept as two separate structures.
pub struct Dict {
    pub entries: Table<DictKey>,
}

impl Dict {
    pub fn new() -> Self {
        Dict {
            entries: new_table(),
        }
    }

    /// `get` returns nil on a missing key; it never raises.
    pub fn get(&self, key: DictKey) -> Option<Value> {
        self.entries.get(&key).copied()
    }

    pub fn insert(&mut self, key: DictKey, value: Value) {
        self.entries.insert(key, value);
    }

    /// Removes preserving the order of the remaining entries, so that a
    /// later reinsertion of the same key lands at the end.
    pub fn remove(&mut self, key: DictKey) -> Option<Value> {
        self.entries.shift_remove(&key)
    }
}

/// A lazy, restartable `[lower, upper)` integer sequence.
#[derive(Clone, Copy)]
pub struct Range {
    pub lower: i64,
    pub upper: i64,
}

impl Range {
    pub fn len(&self) -> i64 {
        (self.upper - self.lower).max(0)
    }
}

/// A compiled function: arity, upvalue descriptors, and its [`Blob`].
pub struct Function {
    pub name: Rc<str>,
    /// Total declared parameters, the variadic one included.
    pub arity: u8,
    /// When set, the final parameter collects trailing arguments as a list.
    pub is_variadic: bool,
    pub upvalues: Vec<UpvalueDesc>,
    pub code: Rc<Blob>,
    /// The module this function was compiled in; globals resolve here.
    pub module: ObjId,
    /// For methods: the class the method was defined on. `parent.m(...)`
    /// starts its lookup at this class's superclass, so overrides in
    /// subclasses never recurse into themselves.
    pub bound_class: Option<ObjId>,
}

/// A function plus its captured upvalues.
pub struct Closure {
    pub function: ObjId,
    pub upvalues: Vec<ObjId>,
}

/// A captured variable: open while its defining frame is live (indexing
/// into the VM value stack), closed (owning) afterwards.
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A class object. Method tables are flattened at `Inherit` time so that
/// dispatch is a single lookup.
pub struct Class {
    /// Interned class name.
    pub name: ObjId,
    pub superclass: Option<ObjId>,
    /// Per-instance field initializers, copied into each new instance.
    pub fields: Table<ObjId>,
    /// Static properties and static methods.
    pub statics: Table<ObjId>,
    /// Instance methods, operator methods (`@add`, ...) and the `@new`
    /// constructor.
    pub methods: Table<ObjId>,
}

pub struct Instance {
    pub class: ObjId,
    pub properties: Table<ObjId>,
}

/// `(receiver, closure)` pair produced when a method is read as a value.
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjId,
}

pub struct BoundNative {
    pub receiver: Value,
    pub name: Rc<str>,
}

/// A host function exposed to the language.
pub struct NativeFunction {
    pub name: Rc<str>,
    /// Inclusive argument bounds; `max == u8::MAX` means unbounded.
    pub min_arity: u8,
    pub max_arity: u8,
    pub func: NativeFn,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

/// An OS file. The handle is opened lazily by the first read or write and
/// closed either explicitly (`close()`, idempotent) or by the GC finalizer.
pub struct FileHandle {
    pub path: Rc<str>,
    pub mode: FileMode,
    pub handle: RefCell<Option<fs::File>>,
    pub is_std: bool,
}

impl FileHandle {
    pub fn is_open(&self) -> bool {
        self.is_std || self.handle.borrow().is_some()
    }

    pub fn close(&self) {
        // Dropping the fs::File releases the descriptor.
        self.handle.borrow_mut().take();
    }
}

/// Typed opaque host pointer used by native modules to stash state on the
/// heap; the payload drops when the object is swept.
pub struct Pointer {
    pub tag: &'static str,
    pub data: Box<dyn Any>,
}

/// A loaded module: its values table is both export surface and global
/// scope for code compiled inside it.
pub struct Module {
    pub name: Rc<str>,
    pub path: Rc<str>,
    pub values: Table<ObjId>,
    pub is_native: bool,
    pub unload: Option<UnloadFn>,
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "string",
            Obj::List(_) => "list",
            Obj::Bytes(_) => "bytes",
            Obj::Dict(_) => "dict",
            Obj::Range(_) => "range",
            Obj::Function(_) | Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) | Obj::BoundNative(_) | Obj::Native(_) => "function",
            Obj::File(_) => "file",
            Obj::Pointer(_) => "pointer",
            Obj::Module(_) => "module",
        }
    }

    /// Canonical display form. Total: every object renders to something.
    pub fn to_display(&self, heap: &Heap) -> String {
        match self {
            Obj::Str(s) => s.text.to_string(),
            Obj::List(items) => {
                let inner: Vec<String> = items.iter().map(|v| quote_value(heap, *v)).collect();
                format!("[{}]", inner.join(", "))
            }
            Obj::Bytes(bytes) => {
                let inner: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
                format!("({})", inner.join(" "))
            }
            Obj::Dict(dict) => {
                let inner: Vec<String> = dict
                    .entries
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}: {}",
                            quote_value(heap, k.to_value()),
                            quote_value(heap, *v)
                        )
                    })
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Obj::Range(r) => format!("<range {}..{}>", r.lower, r.upper),
            Obj::Function(f) => format!("<function {}>", f.name),
            Obj::Closure(c) => match heap.get(c.function) {
                Obj::Function(f) => format!("<function {}>", f.name),
                _ => "<function>".to_string(),
            },
            Obj::Upvalue(_) => "<upvalue>".to_string(),
            Obj::Class(c) => format!("<class {}>", heap.str_text(c.name)),
            Obj::Instance(i) => match heap.get(i.class) {
                Obj::Class(c) => format!("<{} instance>", heap.str_text(c.name)),
                _ => "<instance>".to_string(),
            },
            Obj::BoundMethod(b) => heap.get(b.method).to_display(heap),
            Obj::BoundNative(b) => format!("<native method {}>", b.name),
            Obj::Native(n) => format!("<native function {}>", n.name),
            Obj::File(f) => format!("<file {}>", f.path),
            Obj::Pointer(p) => format!("<pointer {}>", p.tag),
            Obj::Module(m) => format!("<module {}>", m.name),
        }
    }

    /// Approximate resident size, recomputed for survivors at each sweep to
    /// keep the allocation counter honest about grown containers.
    pub fn footprint(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::Str(s) => s.text.len(),
            Obj::List(items) => items.capacity() * std::mem::size_of::<Value>(),
            Obj::Bytes(bytes) => bytes.capacity(),
            Obj::Dict(d) => d.entries.capacity() * (std::mem::size_of::<DictKey>() + std::mem::size_of::<Value>()),
            Obj::Function(f) => {
                f.code.code.len() * std::mem::size_of::<crate::bytecode::Op>()
                    + f.code.constants.len() * std::mem::size_of::<Value>()
            }
            Obj::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjId>(),
            Obj::Class(c) => (c.fields.len() + c.statics.len() + c.methods.len()) * 16,
            Obj::Instance(i) => i.properties.capacity() * 16,
            Obj::Module(m) => m.values.capacity() * 16,
            _ => 0,
        }
    }
}

/// Display form used *inside* containers, where strings keep their quotes
/// so `[1, 'a']` round-trips readably.
fn quote_value(heap: &Heap, value: Value) -> String {
    match value {
        Value::Obj(id) => match heap.get(id) {
            Obj::Str(s) => format!("'{}'", s.text),
            other => other.to_display(heap),
        },
        Value::Number(n) => format_number(n),
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Empty => "<empty>".to_string(),
    }
}
