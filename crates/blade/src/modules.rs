//! Native modules: the host-side module ABI and the builtin providers.
//!
//! A native module is a named table of host-implemented functions, fields,
//! and classes. Providers implement [`NativeModule`] and are registered on
//! the VM; the import loader instantiates them on first `import`, runs the
//! optional `preload` hook, and arranges for `unload` to run when the
//! module object is collected (or at VM shutdown).
//!
//! Builtin providers: `math`, `os`, `base64`, and `json`.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::VmError;
use crate::object::{new_table, Module, NativeFn, NativeFunction, Obj};
use crate::value::{ObjId, Value};
use crate::vm::Vm;

/// A host-provided module field: the getter runs at instantiation time.
pub struct FieldReg {
    pub name: &'static str,
    pub is_static: bool,
    pub getter: Rc<dyn Fn(&mut Vm) -> Value>,
}

/// A host-provided function.
pub struct FuncReg {
    pub name: &'static str,
    pub is_static: bool,
    pub min_arity: u8,
    pub max_arity: u8,
    pub func: NativeFn,
}

/// A host-provided class: fields seed instances, functions become methods
/// (static ones land on the class object).
pub struct ClassReg {
    pub name: &'static str,
    pub fields: Vec<FieldReg>,
    pub functions: Vec<FuncReg>,
}

/// The native-module interface. Implement it and register the value with
/// the runtime to make `import <name>` resolve to it.
pub trait NativeModule {
    fn name(&self) -> &'static str;
    fn fields(&self) -> Vec<FieldReg> {
        Vec::new()
    }
    fn functions(&self) -> Vec<FuncReg>;
    fn classes(&self) -> Vec<ClassReg> {
        Vec::new()
    }
    /// Runs once, right after the module object is built.
    fn preload(&self, _vm: &mut Vm) {}
    /// Runs when the module object is swept or the VM shuts down.
    fn unload(&self, _vm: &mut Vm) {}
}

/// Shorthand for building a [`FuncReg`] from a plain function pointer.
pub fn func(
    name: &'static str,
    min_arity: u8,
    max_arity: u8,
    f: fn(&mut Vm, &[Value]) -> Result<Value, VmError>,
) -> FuncReg {
    FuncReg {
        name,
        is_static: true,
        min_arity,
        max_arity,
        func: Rc::new(f),
    }
}

/// Register every builtin provider on a fresh VM.
pub(crate) fn register_defaults(vm: &mut Vm) {
    vm.register_native_module(Rc::new(MathModule));
    vm.register_native_module(Rc::new(OsModule));
    vm.register_native_module(Rc::new(Base64Module));
    vm.register_native_module(Rc::new(JsonModule));
}

/// Build the `Module` heap object for a provider.
pub(crate) fn instantiate(vm: &mut Vm, provider: Rc<dyn NativeModule>) -> ObjId {
    let name = provider.name();
    let mut values = new_table();

    for reg in provider.functions() {
        let key = vm.heap.intern(reg.name);
        let native = vm.heap.alloc(Obj::Native(NativeFunction {
            name: Rc::from(reg.name),
            min_arity: reg.min_arity,
            max_arity: reg.max_arity,
            func: reg.func,
        }));
        values.insert(key, Value::Obj(native));
    }
    for reg in provider.fields() {
        let key = vm.heap.intern(reg.name);
        let value = (reg.getter)(vm);
        values.insert(key, value);
    }
    for class_reg in provider.classes() {
        let class_key = vm.heap.intern(class_reg.name);
        let class = instantiate_class(vm, class_reg);
        values.insert(class_key, Value::Obj(class));
    }

    let unload_provider = Rc::clone(&provider);
    vm.heap.alloc(Obj::Module(Module {
        name: Rc::from(name),
        path: Rc::from(format!("<native:{}>", name).as_str()),
        values,
        is_native: true,
        unload: Some(Rc::new(move |vm: &mut Vm| unload_provider.unload(vm))),
    }))
}

fn instantiate_class(vm: &mut Vm, reg: ClassReg) -> ObjId {
    let name_id = vm.heap.intern(reg.name);
    let mut fields = new_table();
    let mut statics = new_table();
    let mut methods = new_table();
    for field in reg.fields {
        let key = vm.heap.intern(field.name);
        let value = (field.getter)(vm);
        if field.is_static {
            statics.insert(key, value);
        } else {
            fields.insert(key, value);
        }
    }
    for function in reg.functions {
        let key = vm.heap.intern(function.name);
        let native = vm.heap.alloc(Obj::Native(NativeFunction {
            name: Rc::from(function.name),
            min_arity: function.min_arity,
            max_arity: function.max_arity,
            func: function.func,
        }));
        if function.is_static {
            statics.insert(key, Value::Obj(native));
        } else {
            methods.insert(key, Value::Obj(native));
        }
    }
    vm.heap.alloc(Obj::Class(crate::object::Class {
        name: name_id,
        superclass: None,
        fields,
        statics,
        methods,
    }))
}

// ---------------------------------------------------------------------------
// math
// ---------------------------------------------------------------------------

struct MathModule;

/// First argument as f64; nil coerces to 0 like the reference stdlib.
fn number_arg(vm: &mut Vm, args: &[Value], index: usize) -> Result<f64, VmError> {
    match args.get(index) {
        Some(Value::Number(n)) => Ok(*n),
        Some(Value::Nil) | None => Ok(0.0),
        Some(other) => {
            let kind = other.type_name(&vm.heap);
            Err(vm.type_error(&format!("expected a number argument, got {}", kind)))
        }
    }
}

macro_rules! math_fn {
    ($name:ident, $method:ident) => {
        fn $name(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
            let x = number_arg(vm, args, 0)?;
            Ok(Value::Number(x.$method()))
        }
    };
}

math_fn!(math_sin, sin);
math_fn!(math_cos, cos);
math_fn!(math_tan, tan);
math_fn!(math_sinh, sinh);
math_fn!(math_cosh, cosh);
math_fn!(math_tanh, tanh);
math_fn!(math_asin, asin);
math_fn!(math_acos, acos);
math_fn!(math_atan, atan);
math_fn!(math_asinh, asinh);
math_fn!(math_acosh, acosh);
math_fn!(math_atanh, atanh);
math_fn!(math_exp, exp);
math_fn!(math_expm1, exp_m1);
math_fn!(math_ceil, ceil);
math_fn!(math_round, round);
math_fn!(math_floor, floor);
math_fn!(math_sqrt, sqrt);
math_fn!(math_log, ln);
math_fn!(math_log2, log2);
math_fn!(math_log10, log10);
math_fn!(math_log1p, ln_1p);

fn math_atan2(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let y = number_arg(vm, args, 0)?;
    let x = number_arg(vm, args, 1)?;
    Ok(Value::Number(y.atan2(x)))
}

impl NativeModule for MathModule {
    fn name(&self) -> &'static str {
        "math"
    }

    fn fields(&self) -> Vec<FieldReg> {
        fn constant(name: &'static str, value: f64) -> FieldReg {
            FieldReg {
                name,
                is_static: true,
                getter: Rc::new(move |_vm| Value::Number(value)),
            }
        }
        vec![
            constant("Pi", std::f64::consts::PI),
            constant("E", std::f64::consts::E),
            constant("Tau", std::f64::consts::TAU),
            constant("Infinity", f64::INFINITY),
            constant("NaN", f64::NAN),
        ]
    }

    fn functions(&self) -> Vec<FuncReg> {
        vec![
            func("sin", 1, 1, math_sin),
            func("cos", 1, 1, math_cos),
            func("tan", 1, 1, math_tan),
            func("sinh", 1, 1, math_sinh),
            func("cosh", 1, 1, math_cosh),
            func("tanh", 1, 1, math_tanh),
            func("asin", 1, 1, math_asin),
            func("acos", 1, 1, math_acos),
            func("atan", 1, 1, math_atan),
            func("atan2", 2, 2, math_atan2),
            func("asinh", 1, 1, math_asinh),
            func("acosh", 1, 1, math_acosh),
            func("atanh", 1, 1, math_atanh),
            func("exp", 1, 1, math_exp),
            func("expm1", 1, 1, math_expm1),
            func("ceil", 1, 1, math_ceil),
            func("round", 1, 1, math_round),
            func("floor", 1, 1, math_floor),
            func("sqrt", 1, 1, math_sqrt),
            func("log", 1, 1, math_log),
            func("log2", 1, 1, math_log2),
            func("log10", 1, 1, math_log10),
            func("log1p", 1, 1, math_log1p),
        ]
    }
}

// ---------------------------------------------------------------------------
// os
// ---------------------------------------------------------------------------

struct OsModule;

fn os_platform(vm: &mut Vm, _args: &[Value]) -> Result<Value, VmError> {
    Ok(vm.make_string(std::env::consts::OS))
}

/// `env(name)` reads, `env(name, value)` sets.
fn os_env(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let name = match vm.string_of(args[0]) {
        Some(text) => text.to_string(),
        None => return Err(vm.type_error("env() expects a variable name string")),
    };
    match args.get(1) {
        None => match std::env::var(&name) {
            Ok(value) => Ok(vm.make_string(&value)),
            Err(_) => Ok(Value::Nil),
        },
        Some(&value) => {
            let text = match vm.string_of(value) {
                Some(text) => text.to_string(),
                None => return Err(vm.type_error("env() value must be a string")),
            };
            std::env::set_var(name, text);
            Ok(Value::Nil)
        }
    }
}

fn os_args(vm: &mut Vm, _args: &[Value]) -> Result<Value, VmError> {
    let raw = vm.script_args.clone();
    let values: Vec<Value> = raw.iter().map(|a| vm.make_string(a)).collect();
    Ok(vm.make_list(values))
}

fn os_cwd(vm: &mut Vm, _args: &[Value]) -> Result<Value, VmError> {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    Ok(vm.make_string(&cwd))
}

fn os_time(_vm: &mut Vm, _args: &[Value]) -> Result<Value, VmError> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(seconds))
}

fn os_exit(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let code = match args.first() {
        Some(Value::Number(n)) => *n as i32,
        None => 0,
        _ => return Err(vm.type_error("exit() expects an integer code")),
    };
    Err(VmError::Exit(code))
}

impl NativeModule for OsModule {
    fn name(&self) -> &'static str {
        "os"
    }

    fn functions(&self) -> Vec<FuncReg> {
        vec![
            func("platform", 0, 0, os_platform),
            func("env", 1, 2, os_env),
            func("args", 0, 0, os_args),
            func("cwd", 0, 0, os_cwd),
            func("time", 0, 0, os_time),
            func("exit", 0, 1, os_exit),
        ]
    }
}

// ---------------------------------------------------------------------------
// base64
// ---------------------------------------------------------------------------

struct Base64Module;

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(BASE64_ALPHABET[(triple >> 18) as usize & 0x3f] as char);
        out.push(BASE64_ALPHABET[(triple >> 12) as usize & 0x3f] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(triple >> 6) as usize & 0x3f] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[triple as usize & 0x3f] as char
        } else {
            '='
        });
    }
    out
}

fn base64_decode_text(text: &str) -> Option<Vec<u8>> {
    fn value_of(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some((c - b'A') as u32),
            b'a'..=b'z' => Some((c - b'a') as u32 + 26),
            b'0'..=b'9' => Some((c - b'0') as u32 + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let cleaned: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b'=')
        .collect();
    let mut out = Vec::with_capacity(cleaned.len() * 3 / 4);
    for chunk in cleaned.chunks(4) {
        let mut acc: u32 = 0;
        for &c in chunk {
            acc = (acc << 6) | value_of(c)?;
        }
        match chunk.len() {
            4 => {
                out.push((acc >> 16) as u8);
                out.push((acc >> 8) as u8);
                out.push(acc as u8);
            }
            3 => {
                acc <<= 6;
                out.push((acc >> 16) as u8);
                out.push((acc >> 8) as u8);
            }
            2 => {
                acc <<= 12;
                out.push((acc >> 16) as u8);
            }
            _ => return None,
        }
    }
    Some(out)
}

fn base64_encode(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let data: Vec<u8> = match args[0].as_obj().map(|id| vm.heap.get(id)) {
        Some(Obj::Bytes(bytes)) => bytes.clone(),
        Some(Obj::Str(s)) => s.text.as_bytes().to_vec(),
        _ => {
            let kind = args[0].type_name(&vm.heap);
            return Err(vm.type_error(&format!("encode() expects bytes or string, got {}", kind)));
        }
    };
    let encoded = base64_encode_bytes(&data);
    Ok(vm.make_string(&encoded))
}

fn base64_decode(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let text = match vm.string_of(args[0]) {
        Some(text) => text.to_string(),
        None => return Err(vm.type_error("decode() expects a string")),
    };
    match base64_decode_text(&text) {
        Some(bytes) => Ok(vm.make_bytes(bytes)),
        None => Err(vm.value_error("invalid base64 input")),
    }
}

impl NativeModule for Base64Module {
    fn name(&self) -> &'static str {
        "base64"
    }

    fn functions(&self) -> Vec<FuncReg> {
        vec![
            func("encode", 1, 1, base64_encode),
            func("decode", 1, 1, base64_decode),
        ]
    }
}

// ---------------------------------------------------------------------------
// json
// ---------------------------------------------------------------------------

struct JsonModule;

fn json_to_value(vm: &mut Vm, json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => vm.make_string(s),
        serde_json::Value::Array(items) => {
            let list = vm.heap.alloc(Obj::List(Vec::with_capacity(items.len())));
            vm.heap.pin(list);
            for item in items {
                let value = json_to_value(vm, item);
                if let Obj::List(out) = vm.heap.get_mut(list) {
                    out.push(value);
                }
            }
            vm.heap.unpin();
            Value::Obj(list)
        }
        serde_json::Value::Object(map) => {
            let dict = vm.heap.alloc(Obj::Dict(crate::object::Dict::new()));
            vm.heap.pin(dict);
            for (key, item) in map {
                let key = vm.heap.str_key(key);
                let value = json_to_value(vm, item);
                if let Obj::Dict(out) = vm.heap.get_mut(dict) {
                    out.insert(key, value);
                }
            }
            vm.heap.unpin();
            Value::Obj(dict)
        }
    }
}

fn value_to_json(vm: &mut Vm, value: Value) -> Result<serde_json::Value, VmError> {
    Ok(match value {
        Value::Nil | Value::Empty => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Number(n) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Obj(id) => {
            enum Shape {
                Str(String),
                List(Vec<Value>),
                Dict(Vec<(Value, Value)>),
                Bad(&'static str),
            }
            let shape = match vm.heap.get(id) {
                Obj::Str(s) => Shape::Str(s.text.to_string()),
                Obj::List(items) => Shape::List(items.clone()),
                Obj::Dict(d) => {
                    Shape::Dict(d.entries.iter().map(|(k, v)| (k.to_value(), *v)).collect())
                }
                other => Shape::Bad(other.type_name()),
            };
            match shape {
                Shape::Str(s) => serde_json::Value::String(s),
                Shape::List(items) => {
                    let mut array = Vec::with_capacity(items.len());
                    for item in items {
                        array.push(value_to_json(vm, item)?);
                    }
                    serde_json::Value::Array(array)
                }
                Shape::Dict(entries) => {
                    let mut map = serde_json::Map::with_capacity(entries.len());
                    for (key, item) in entries {
                        let key_text = crate::value::stringify(&vm.heap, key);
                        map.insert(key_text, value_to_json(vm, item)?);
                    }
                    serde_json::Value::Object(map)
                }
                Shape::Bad(kind) => {
                    return Err(
                        vm.value_error(&format!("{} cannot be serialized to json", kind))
                    );
                }
            }
        }
    })
}

fn json_encode(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let json = value_to_json(vm, args[0])?;
    let pretty = args
        .get(1)
        .map(|v| v.is_truthy(&vm.heap))
        .unwrap_or(false);
    let text = if pretty {
        serde_json::to_string_pretty(&json)
    } else {
        serde_json::to_string(&json)
    };
    match text {
        Ok(text) => Ok(vm.make_string(&text)),
        Err(error) => Err(vm.value_error(&format!("json encode failed: {}", error))),
    }
}

fn json_decode(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let text = match vm.string_of(args[0]) {
        Some(text) => text.to_string(),
        None => return Err(vm.type_error("decode() expects a string")),
    };
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => Ok(json_to_value(vm, &json)),
        Err(error) => Err(vm.value_error(&format!("invalid json: {}", error))),
    }
}

impl NativeModule for JsonModule {
    fn name(&self) -> &'static str {
        "json"
    }

    fn functions(&self) -> Vec<FuncReg> {
        vec![
            func("encode", 1, 2, json_encode),
            func("decode", 1, 1, json_decode),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let data = b"hello blade";
        let encoded = base64_encode_bytes(data);
        assert_eq!(encoded, "aGVsbG8gYmxhZGU=");
        assert_eq!(base64_decode_text(&encoded).unwrap(), data.to_vec());
    }

    #[test]
    fn base64_handles_all_padding_widths() {
        for text in ["", "a", "ab", "abc", "abcd"] {
            let encoded = base64_encode_bytes(text.as_bytes());
            assert_eq!(
                base64_decode_text(&encoded).unwrap(),
                text.as_bytes().to_vec(),
                "round trip for {:?}",
                text
            );
        }
    }

    #[test]
    fn base64_rejects_garbage() {
        assert!(base64_decode_text("!!!!").is_none());
    }
}
