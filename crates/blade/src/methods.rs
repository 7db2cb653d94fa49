//! Builtin methods on strings, lists, dicts, bytes, ranges, files, and
//! number scalars.
//!
//! These are native functions bound to their receiver on property access
//! and dispatched by name on `Invoke`. Everything here runs inside one VM
//! opcode, so any method that re-enters the VM (the callback-taking
//! `each`/`map`/`filter`/`some`/`every`/`reduce` family) must keep its
//! intermediate objects pinned — the receiver and arguments are pinned
//! centrally by [`invoke_builtin`].

use crate::error::VmError;
use crate::heap::Heap;
use crate::object::{Dict, FileMode, Obj};
use crate::value::{stringify, DictKey, ObjId, Value};
use crate::vm::Vm;

const STRING_METHODS: &[&str] = &[
    "length",
    "upper",
    "lower",
    "trim",
    "ltrim",
    "rtrim",
    "split",
    "index_of",
    "starts_with",
    "ends_with",
    "contains",
    "replace",
    "count",
    "to_number",
    "to_list",
    "to_string",
];

const LIST_METHODS: &[&str] = &[
    "length",
    "append",
    "extend",
    "pop",
    "shift",
    "insert",
    "remove",
    "remove_at",
    "index_of",
    "contains",
    "first",
    "last",
    "reverse",
    "sort",
    "join",
    "clear",
    "clone",
    "each",
    "map",
    "filter",
    "some",
    "every",
    "reduce",
    "to_string",
];

const DICT_METHODS: &[&str] = &[
    "length",
    "add",
    "set",
    "get",
    "contains",
    "extend",
    "keys",
    "values",
    "remove",
    "is_empty",
    "find_key",
    "clear",
    "clone",
    "compact",
    "to_list",
    "each",
    "filter",
    "some",
    "every",
    "reduce",
    "to_string",
];

const BYTES_METHODS: &[&str] = &[
    "length", "get", "append", "extend", "to_list", "to_string", "clone",
];

const RANGE_METHODS: &[&str] = &["lower", "upper", "length", "to_list", "to_string"];

const FILE_METHODS: &[&str] = &[
    "read", "write", "exists", "close", "path", "mode", "is_open", "to_string",
];

const SCALAR_METHODS: &[&str] = &["to_string"];

/// Whether property access on this receiver can bind a builtin method of
/// the given name.
pub(crate) fn has_method(heap: &Heap, receiver: Value, name: &str) -> bool {
    let table: &[&str] = match receiver {
        Value::Obj(id) => match heap.get(id) {
            Obj::Str(_) => STRING_METHODS,
            Obj::List(_) => LIST_METHODS,
            Obj::Dict(_) => DICT_METHODS,
            Obj::Bytes(_) => BYTES_METHODS,
            Obj::Range(_) => RANGE_METHODS,
            Obj::File(_) => FILE_METHODS,
            _ => return false,
        },
        Value::Number(_) | Value::Bool(_) | Value::Nil => SCALAR_METHODS,
        Value::Empty => return false,
    };
    table.contains(&name)
}

/// Dispatch a builtin method call. Pins the receiver and every object
/// argument for the duration, since callback-taking methods can trigger a
/// collection mid-flight.
pub(crate) fn invoke_builtin(
    vm: &mut Vm,
    receiver: Value,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, VmError> {
    let mut pinned = 0usize;
    if let Value::Obj(id) = receiver {
        vm.heap.pin(id);
        pinned += 1;
    }
    for arg in &args {
        if let Value::Obj(id) = arg {
            vm.heap.pin(*id);
            pinned += 1;
        }
    }
    let result = dispatch(vm, receiver, name, &args);
    for _ in 0..pinned {
        vm.heap.unpin();
    }
    result
}

fn dispatch(vm: &mut Vm, receiver: Value, name: &str, args: &[Value]) -> Result<Value, VmError> {
    match receiver {
        Value::Obj(id) => match vm.heap.get(id) {
            Obj::Str(_) => string_method(vm, id, name, args),
            Obj::List(_) => list_method(vm, id, name, args),
            Obj::Dict(_) => dict_method(vm, id, name, args),
            Obj::Bytes(_) => bytes_method(vm, id, name, args),
            Obj::Range(_) => range_method(vm, id, name, args),
            Obj::File(_) => file_method(vm, id, name, args),
            other => {
                let kind = other.type_name();
                Err(vm.property_error(&format!("{} has no method '{}'", kind, name)))
            }
        },
        scalar => scalar_method(vm, scalar, name, args),
    }
}

fn want(vm: &mut Vm, name: &str, args: &[Value], count: usize) -> Result<(), VmError> {
    if args.len() != count {
        return Err(vm.argument_error(&format!(
            "{}() takes {} argument(s), got {}",
            name,
            count,
            args.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

fn scalar_method(vm: &mut Vm, receiver: Value, name: &str, args: &[Value]) -> Result<Value, VmError> {
    match name {
        "to_string" => {
            want(vm, name, args, 0)?;
            let text = stringify(&vm.heap, receiver);
            Ok(vm.make_string(&text))
        }
        _ => {
            let kind = receiver.type_name(&vm.heap);
            Err(vm.property_error(&format!("{} has no method '{}'", kind, name)))
        }
    }
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn string_method(vm: &mut Vm, id: ObjId, name: &str, args: &[Value]) -> Result<Value, VmError> {
    let text: std::rc::Rc<str> = match vm.heap.get(id) {
        Obj::Str(s) => std::rc::Rc::clone(&s.text),
        _ => unreachable!(),
    };
    match name {
        "length" => {
            want(vm, name, args, 0)?;
            Ok(Value::Number(text.chars().count() as f64))
        }
        "upper" => {
            want(vm, name, args, 0)?;
            Ok(vm.make_string(&text.to_uppercase()))
        }
        "lower" => {
            want(vm, name, args, 0)?;
            Ok(vm.make_string(&text.to_lowercase()))
        }
        "trim" => {
            want(vm, name, args, 0)?;
            Ok(vm.make_string(text.trim()))
        }
        "ltrim" => {
            want(vm, name, args, 0)?;
            Ok(vm.make_string(text.trim_start()))
        }
        "rtrim" => {
            want(vm, name, args, 0)?;
            Ok(vm.make_string(text.trim_end()))
        }
        "split" => {
            want(vm, name, args, 1)?;
            let separator = expect_string(vm, args[0], "split")?;
            let parts: Vec<String> = if separator.is_empty() {
                text.chars().map(|c| c.to_string()).collect()
            } else {
                text.split(separator.as_str()).map(str::to_string).collect()
            };
            let values: Vec<Value> = parts.iter().map(|p| vm.make_string(p)).collect();
            Ok(vm.make_list(values))
        }
        "index_of" => {
            want(vm, name, args, 1)?;
            let needle = expect_string(vm, args[0], "index_of")?;
            match text.find(needle.as_str()) {
                Some(byte) => {
                    let chars = text[..byte].chars().count();
                    Ok(Value::Number(chars as f64))
                }
                None => Ok(Value::Number(-1.0)),
            }
        }
        "starts_with" => {
            want(vm, name, args, 1)?;
            let prefix = expect_string(vm, args[0], "starts_with")?;
            Ok(Value::Bool(text.starts_with(prefix.as_str())))
        }
        "ends_with" => {
            want(vm, name, args, 1)?;
            let suffix = expect_string(vm, args[0], "ends_with")?;
            Ok(Value::Bool(text.ends_with(suffix.as_str())))
        }
        "contains" => {
            want(vm, name, args, 1)?;
            let needle = expect_string(vm, args[0], "contains")?;
            Ok(Value::Bool(text.contains(needle.as_str())))
        }
        "replace" => {
            want(vm, name, args, 2)?;
            let from = expect_string(vm, args[0], "replace")?;
            let to = expect_string(vm, args[1], "replace")?;
            Ok(vm.make_string(&text.replace(from.as_str(), to.as_str())))
        }
        "count" => {
            want(vm, name, args, 1)?;
            let needle = expect_string(vm, args[0], "count")?;
            if needle.is_empty() {
                return Ok(Value::Number(0.0));
            }
            Ok(Value::Number(text.matches(needle.as_str()).count() as f64))
        }
        "to_number" => {
            want(vm, name, args, 0)?;
            let trimmed = text.trim();
            match trimmed.parse::<f64>() {
                Ok(n) => Ok(Value::Number(n)),
                Err(_) => Err(vm.value_error(&format!("'{}' is not a valid number", trimmed))),
            }
        }
        "to_list" => {
            want(vm, name, args, 0)?;
            let values: Vec<Value> = text
                .chars()
                .map(|c| {
                    let mut buffer = [0u8; 4];
                    vm.make_string(c.encode_utf8(&mut buffer))
                })
                .collect();
            Ok(vm.make_list(values))
        }
        "to_string" => {
            want(vm, name, args, 0)?;
            Ok(Value::Obj(id))
        }
        _ => Err(vm.property_error(&format!("string has no method '{}'", name))),
    }
}

fn expect_string(vm: &mut Vm, value: Value, method: &str) -> Result<String, VmError> {
    match vm.string_of(value) {
        Some(text) => Ok(text.to_string()),
        None => {
            let kind = value.type_name(&vm.heap);
            Err(vm.type_error(&format!("{}() expects a string argument, got {}", method, kind)))
        }
    }
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

fn list_method(vm: &mut Vm, id: ObjId, name: &str, args: &[Value]) -> Result<Value, VmError> {
    match name {
        "length" => {
            want(vm, name, args, 0)?;
            let len = list_len(vm, id);
            Ok(Value::Number(len as f64))
        }
        "append" => {
            want(vm, name, args, 1)?;
            if let Obj::List(items) = vm.heap.get_mut(id) {
                items.push(args[0]);
            }
            Ok(Value::Nil)
        }
        "extend" => {
            want(vm, name, args, 1)?;
            let other = expect_list(vm, args[0], "extend")?;
            if let Obj::List(items) = vm.heap.get_mut(id) {
                items.extend_from_slice(&other);
            }
            Ok(Value::Nil)
        }
        "pop" => {
            want(vm, name, args, 0)?;
            if let Obj::List(items) = vm.heap.get_mut(id) {
                Ok(items.pop().unwrap_or(Value::Nil))
            } else {
                Ok(Value::Nil)
            }
        }
        "shift" => {
            want(vm, name, args, 0)?;
            if let Obj::List(items) = vm.heap.get_mut(id) {
                if items.is_empty() {
                    Ok(Value::Nil)
                } else {
                    Ok(items.remove(0))
                }
            } else {
                Ok(Value::Nil)
            }
        }
        "insert" => {
            want(vm, name, args, 2)?;
            let index = expect_index(vm, args[1], "insert")?;
            let len = list_len(vm, id);
            if index > len {
                return Err(vm.range_error(&format!("insert index {} out of range", index)));
            }
            if let Obj::List(items) = vm.heap.get_mut(id) {
                items.insert(index, args[0]);
            }
            Ok(Value::Nil)
        }
        "remove" => {
            want(vm, name, args, 1)?;
            let position = {
                let items = match vm.heap.get(id) {
                    Obj::List(items) => items,
                    _ => unreachable!(),
                };
                items.iter().position(|v| v.equals(args[0]))
            };
            if let Some(position) = position {
                if let Obj::List(items) = vm.heap.get_mut(id) {
                    items.remove(position);
                }
                Ok(Value::Bool(true))
            } else {
                Ok(Value::Bool(false))
            }
        }
        "remove_at" => {
            want(vm, name, args, 1)?;
            let index = expect_index(vm, args[0], "remove_at")?;
            let len = list_len(vm, id);
            if index >= len {
                return Err(vm.range_error(&format!("remove_at index {} out of range", index)));
            }
            if let Obj::List(items) = vm.heap.get_mut(id) {
                Ok(items.remove(index))
            } else {
                Ok(Value::Nil)
            }
        }
        "index_of" => {
            want(vm, name, args, 1)?;
            let position = match vm.heap.get(id) {
                Obj::List(items) => items.iter().position(|v| v.equals(args[0])),
                _ => None,
            };
            Ok(Value::Number(position.map(|p| p as f64).unwrap_or(-1.0)))
        }
        "contains" => {
            want(vm, name, args, 1)?;
            let found = match vm.heap.get(id) {
                Obj::List(items) => items.iter().any(|v| v.equals(args[0])),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "first" => {
            want(vm, name, args, 0)?;
            match vm.heap.get(id) {
                Obj::List(items) => Ok(items.first().copied().unwrap_or(Value::Nil)),
                _ => Ok(Value::Nil),
            }
        }
        "last" => {
            want(vm, name, args, 0)?;
            match vm.heap.get(id) {
                Obj::List(items) => Ok(items.last().copied().unwrap_or(Value::Nil)),
                _ => Ok(Value::Nil),
            }
        }
        "reverse" => {
            want(vm, name, args, 0)?;
            let mut items = clone_list(vm, id);
            items.reverse();
            Ok(vm.make_list(items))
        }
        "sort" => {
            want(vm, name, args, 0)?;
            let mut items = clone_list(vm, id);
            let mut failed = false;
            items.sort_by(|a, b| {
                crate::operators::compare(&vm.heap, "<", *a, *b).unwrap_or_else(|_| {
                    failed = true;
                    std::cmp::Ordering::Equal
                })
            });
            if failed {
                return Err(vm.value_error("sort() requires uniformly comparable elements"));
            }
            if let Obj::List(stored) = vm.heap.get_mut(id) {
                *stored = items;
            }
            Ok(Value::Obj(id))
        }
        "join" => {
            want(vm, name, args, 1)?;
            let separator = expect_string(vm, args[0], "join")?;
            let items = clone_list(vm, id);
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                parts.push(vm.display_value(item)?);
            }
            Ok(vm.make_string(&parts.join(&separator)))
        }
        "clear" => {
            want(vm, name, args, 0)?;
            if let Obj::List(items) = vm.heap.get_mut(id) {
                items.clear();
            }
            Ok(Value::Nil)
        }
        "clone" => {
            want(vm, name, args, 0)?;
            let items = clone_list(vm, id);
            Ok(vm.make_list(items))
        }
        "each" => {
            want(vm, name, args, 1)?;
            let items = clone_list(vm, id);
            for (index, item) in items.into_iter().enumerate() {
                let call_args = callback_args(vm, args[0], item, Value::Number(index as f64));
                vm.call_sync(args[0], &call_args)?;
            }
            Ok(Value::Nil)
        }
        "map" => {
            want(vm, name, args, 1)?;
            let items = clone_list(vm, id);
            let result = vm.heap.alloc(Obj::List(Vec::with_capacity(items.len())));
            vm.heap.pin(result);
            for (index, item) in items.into_iter().enumerate() {
                let call_args = callback_args(vm, args[0], item, Value::Number(index as f64));
                let mapped = match vm.call_sync(args[0], &call_args) {
                    Ok(value) => value,
                    Err(error) => {
                        vm.heap.unpin();
                        return Err(error);
                    }
                };
                if let Obj::List(out) = vm.heap.get_mut(result) {
                    out.push(mapped);
                }
            }
            vm.heap.unpin();
            Ok(Value::Obj(result))
        }
        "filter" => {
            want(vm, name, args, 1)?;
            let items = clone_list(vm, id);
            let result = vm.heap.alloc(Obj::List(Vec::new()));
            vm.heap.pin(result);
            for (index, item) in items.into_iter().enumerate() {
                let call_args = callback_args(vm, args[0], item, Value::Number(index as f64));
                let keep = match vm.call_sync(args[0], &call_args) {
                    Ok(value) => value,
                    Err(error) => {
                        vm.heap.unpin();
                        return Err(error);
                    }
                };
                if keep.is_truthy(&vm.heap) {
                    if let Obj::List(out) = vm.heap.get_mut(result) {
                        out.push(item);
                    }
                }
            }
            vm.heap.unpin();
            Ok(Value::Obj(result))
        }
        "some" => {
            want(vm, name, args, 1)?;
            let items = clone_list(vm, id);
            for (index, item) in items.into_iter().enumerate() {
                let call_args = callback_args(vm, args[0], item, Value::Number(index as f64));
                if vm.call_sync(args[0], &call_args)?.is_truthy(&vm.heap) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "every" => {
            want(vm, name, args, 1)?;
            let items = clone_list(vm, id);
            for (index, item) in items.into_iter().enumerate() {
                let call_args = callback_args(vm, args[0], item, Value::Number(index as f64));
                if !vm.call_sync(args[0], &call_args)?.is_truthy(&vm.heap) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "reduce" => {
            if args.is_empty() || args.len() > 2 {
                return Err(vm.argument_error("reduce() takes 1 or 2 arguments"));
            }
            let items = clone_list(vm, id);
            let mut iterator = items.into_iter();
            let mut accumulator = match args.get(1) {
                Some(&initial) => initial,
                None => iterator.next().unwrap_or(Value::Nil),
            };
            for item in iterator {
                accumulator = vm.call_sync(args[0], &[accumulator, item])?;
            }
            Ok(accumulator)
        }
        "to_string" => {
            want(vm, name, args, 0)?;
            let text = vm.heap.get(id).to_display(&vm.heap);
            Ok(vm.make_string(&text))
        }
        _ => Err(vm.property_error(&format!("list has no method '{}'", name))),
    }
}

fn list_len(vm: &Vm, id: ObjId) -> usize {
    match vm.heap.get(id) {
        Obj::List(items) => items.len(),
        _ => 0,
    }
}

fn clone_list(vm: &Vm, id: ObjId) -> Vec<Value> {
    match vm.heap.get(id) {
        Obj::List(items) => items.clone(),
        _ => Vec::new(),
    }
}

fn expect_list(vm: &mut Vm, value: Value, method: &str) -> Result<Vec<Value>, VmError> {
    match value.as_obj().map(|id| vm.heap.get(id)) {
        Some(Obj::List(items)) => Ok(items.clone()),
        _ => {
            let kind = value.type_name(&vm.heap);
            Err(vm.type_error(&format!("{}() expects a list argument, got {}", method, kind)))
        }
    }
}

fn expect_index(vm: &mut Vm, value: Value, method: &str) -> Result<usize, VmError> {
    match value {
        Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => Ok(n as usize),
        _ => Err(vm.type_error(&format!("{}() expects a non-negative integer index", method))),
    }
}

/// Adapt callback arity the way the iteration tools do: a one-parameter
/// callback sees the value, a two-parameter one also sees the key/index.
fn callback_args(vm: &Vm, callback: Value, value: Value, key: Value) -> Vec<Value> {
    let arity = match callback.as_obj().map(|id| vm.heap.get(id)) {
        Some(Obj::Closure(c)) => match vm.heap.get(c.function) {
            Obj::Function(f) => f.arity as usize,
            _ => 1,
        },
        Some(Obj::Native(n)) => n.min_arity as usize,
        _ => 1,
    };
    if arity >= 2 {
        vec![value, key]
    } else {
        vec![value]
    }
}

// ---------------------------------------------------------------------------
// Dicts (semantics follow the authoritative core implementation: get()
// returns nil on a miss, files are rejected as keys, clone pins its copy
// while it is built)
// ---------------------------------------------------------------------------

fn dict_method(vm: &mut Vm, id: ObjId, name: &str, args: &[Value]) -> Result<Value, VmError> {
    match name {
        "length" => {
            want(vm, name, args, 0)?;
            let len = match vm.heap.get(id) {
                Obj::Dict(d) => d.entries.len(),
                _ => 0,
            };
            Ok(Value::Number(len as f64))
        }
        "add" => {
            want(vm, name, args, 2)?;
            let key = dict_key(vm, args[0])?;
            let exists = match vm.heap.get(id) {
                Obj::Dict(d) => d.entries.contains_key(&key),
                _ => false,
            };
            if exists {
                let text = stringify(&vm.heap, args[0]);
                return Err(vm.value_error(&format!("duplicate key {} at add()", text)));
            }
            if let Obj::Dict(d) = vm.heap.get_mut(id) {
                d.insert(key, args[1]);
            }
            Ok(Value::Nil)
        }
        "set" => {
            want(vm, name, args, 2)?;
            let key = dict_key(vm, args[0])?;
            if let Obj::Dict(d) = vm.heap.get_mut(id) {
                d.insert(key, args[1]);
            }
            Ok(Value::Nil)
        }
        "get" => {
            if args.is_empty() || args.len() > 2 {
                return Err(vm.argument_error("get() takes 1 or 2 arguments"));
            }
            let key = dict_key(vm, args[0])?;
            let value = match vm.heap.get(id) {
                Obj::Dict(d) => d.get(key),
                _ => None,
            };
            Ok(value.unwrap_or_else(|| args.get(1).copied().unwrap_or(Value::Nil)))
        }
        "contains" => {
            want(vm, name, args, 1)?;
            let key = dict_key(vm, args[0])?;
            let found = match vm.heap.get(id) {
                Obj::Dict(d) => d.entries.contains_key(&key),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "extend" => {
            want(vm, name, args, 1)?;
            let other = match args[0].as_obj().map(|oid| vm.heap.get(oid)) {
                Some(Obj::Dict(d)) => d.entries.clone(),
                _ => {
                    let kind = args[0].type_name(&vm.heap);
                    return Err(
                        vm.type_error(&format!("extend() expects a dict argument, got {}", kind))
                    );
                }
            };
            if let Obj::Dict(d) = vm.heap.get_mut(id) {
                for (key, value) in other {
                    d.insert(key, value);
                }
            }
            Ok(Value::Nil)
        }
        "keys" => {
            want(vm, name, args, 0)?;
            let keys: Vec<Value> = match vm.heap.get(id) {
                Obj::Dict(d) => d.entries.keys().map(|k| k.to_value()).collect(),
                _ => Vec::new(),
            };
            Ok(vm.make_list(keys))
        }
        "values" => {
            want(vm, name, args, 0)?;
            let values: Vec<Value> = match vm.heap.get(id) {
                Obj::Dict(d) => d.entries.values().copied().collect(),
                _ => Vec::new(),
            };
            Ok(vm.make_list(values))
        }
        "remove" => {
            want(vm, name, args, 1)?;
            let key = dict_key(vm, args[0])?;
            let removed = match vm.heap.get_mut(id) {
                Obj::Dict(d) => d.remove(key),
                _ => None,
            };
            Ok(removed.unwrap_or(Value::Nil))
        }
        "is_empty" => {
            want(vm, name, args, 0)?;
            let empty = match vm.heap.get(id) {
                Obj::Dict(d) => d.entries.is_empty(),
                _ => true,
            };
            Ok(Value::Bool(empty))
        }
        "find_key" => {
            want(vm, name, args, 1)?;
            let key = match vm.heap.get(id) {
                Obj::Dict(d) => d
                    .entries
                    .iter()
                    .find(|(_, v)| v.equals(args[0]))
                    .map(|(k, _)| k.to_value()),
                _ => None,
            };
            Ok(key.unwrap_or(Value::Nil))
        }
        "clear" => {
            want(vm, name, args, 0)?;
            if let Obj::Dict(d) = vm.heap.get_mut(id) {
                d.entries.clear();
            }
            Ok(Value::Nil)
        }
        "clone" => {
            want(vm, name, args, 0)?;
            let copy = vm.heap.alloc(Obj::Dict(Dict::new()));
            vm.heap.pin(copy);
            let entries = match vm.heap.get(id) {
                Obj::Dict(d) => d.entries.clone(),
                _ => Default::default(),
            };
            if let Obj::Dict(d) = vm.heap.get_mut(copy) {
                d.entries = entries;
            }
            vm.heap.unpin();
            Ok(Value::Obj(copy))
        }
        "compact" => {
            want(vm, name, args, 0)?;
            let entries: Vec<(DictKey, Value)> = match vm.heap.get(id) {
                Obj::Dict(d) => d
                    .entries
                    .iter()
                    .filter(|(_, v)| !v.is_nil())
                    .map(|(k, v)| (*k, *v))
                    .collect(),
                _ => Vec::new(),
            };
            let mut dict = Dict::new();
            for (key, value) in entries {
                dict.insert(key, value);
            }
            Ok(Value::Obj(vm.heap.alloc(Obj::Dict(dict))))
        }
        "to_list" => {
            want(vm, name, args, 0)?;
            let (keys, values): (Vec<Value>, Vec<Value>) = match vm.heap.get(id) {
                Obj::Dict(d) => (
                    d.entries.keys().map(|k| k.to_value()).collect(),
                    d.entries.values().copied().collect(),
                ),
                _ => (Vec::new(), Vec::new()),
            };
            let keys_list = vm.make_list(keys);
            let keys_id = keys_list.as_obj().unwrap();
            vm.heap.pin(keys_id);
            let values_list = vm.make_list(values);
            let values_id = values_list.as_obj().unwrap();
            vm.heap.pin(values_id);
            let result = vm.make_list(vec![keys_list, values_list]);
            vm.heap.unpin();
            vm.heap.unpin();
            Ok(result)
        }
        "each" => {
            want(vm, name, args, 1)?;
            for (key, value) in dict_entries(vm, id) {
                let call_args = callback_args(vm, args[0], value, key);
                vm.call_sync(args[0], &call_args)?;
            }
            Ok(Value::Nil)
        }
        "filter" => {
            want(vm, name, args, 1)?;
            let result = vm.heap.alloc(Obj::Dict(Dict::new()));
            vm.heap.pin(result);
            for (key, value) in dict_entries(vm, id) {
                let call_args = callback_args(vm, args[0], value, key);
                let keep = match vm.call_sync(args[0], &call_args) {
                    Ok(v) => v,
                    Err(error) => {
                        vm.heap.unpin();
                        return Err(error);
                    }
                };
                if keep.is_truthy(&vm.heap) {
                    let dk = match dict_key(vm, key) {
                        Ok(dk) => dk,
                        Err(error) => {
                            vm.heap.unpin();
                            return Err(error);
                        }
                    };
                    if let Obj::Dict(d) = vm.heap.get_mut(result) {
                        d.insert(dk, value);
                    }
                }
            }
            vm.heap.unpin();
            Ok(Value::Obj(result))
        }
        "some" => {
            want(vm, name, args, 1)?;
            for (key, value) in dict_entries(vm, id) {
                let call_args = callback_args(vm, args[0], value, key);
                if vm.call_sync(args[0], &call_args)?.is_truthy(&vm.heap) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "every" => {
            want(vm, name, args, 1)?;
            for (key, value) in dict_entries(vm, id) {
                let call_args = callback_args(vm, args[0], value, key);
                if !vm.call_sync(args[0], &call_args)?.is_truthy(&vm.heap) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "reduce" => {
            if args.is_empty() || args.len() > 2 {
                return Err(vm.argument_error("reduce() takes 1 or 2 arguments"));
            }
            let entries = dict_entries(vm, id);
            let mut iterator = entries.into_iter();
            let mut accumulator = match args.get(1) {
                Some(&initial) => initial,
                None => iterator.next().map(|(_, v)| v).unwrap_or(Value::Nil),
            };
            for (_, value) in iterator {
                accumulator = vm.call_sync(args[0], &[accumulator, value])?;
            }
            Ok(accumulator)
        }
        "to_string" => {
            want(vm, name, args, 0)?;
            let text = vm.heap.get(id).to_display(&vm.heap);
            Ok(vm.make_string(&text))
        }
        _ => Err(vm.property_error(&format!("dict has no method '{}'", name))),
    }
}

fn dict_key(vm: &mut Vm, value: Value) -> Result<DictKey, VmError> {
    DictKey::from_value(value, &vm.heap)
        .map_err(|kind| vm.type_error(&format!("'{}' cannot be a dict key", kind)))
}

fn dict_entries(vm: &Vm, id: ObjId) -> Vec<(Value, Value)> {
    match vm.heap.get(id) {
        Obj::Dict(d) => d
            .entries
            .iter()
            .map(|(k, v)| (k.to_value(), *v))
            .collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Bytes
// ---------------------------------------------------------------------------

fn bytes_method(vm: &mut Vm, id: ObjId, name: &str, args: &[Value]) -> Result<Value, VmError> {
    match name {
        "length" => {
            want(vm, name, args, 0)?;
            let len = match vm.heap.get(id) {
                Obj::Bytes(b) => b.len(),
                _ => 0,
            };
            Ok(Value::Number(len as f64))
        }
        "get" => {
            want(vm, name, args, 1)?;
            let index = expect_index(vm, args[0], "get")?;
            match vm.heap.get(id) {
                Obj::Bytes(b) if index < b.len() => Ok(Value::Number(b[index] as f64)),
                _ => Err(vm.range_error(&format!("bytes index {} out of range", index))),
            }
        }
        "append" => {
            want(vm, name, args, 1)?;
            let byte = match args[0] {
                Value::Number(n) if n.fract() == 0.0 && (0.0..=255.0).contains(&n) => n as u8,
                _ => return Err(vm.value_error("bytes values must be integers in 0..255")),
            };
            if let Obj::Bytes(b) = vm.heap.get_mut(id) {
                b.push(byte);
            }
            Ok(Value::Nil)
        }
        "extend" => {
            want(vm, name, args, 1)?;
            let other = match args[0].as_obj().map(|oid| vm.heap.get(oid)) {
                Some(Obj::Bytes(b)) => b.clone(),
                _ => {
                    let kind = args[0].type_name(&vm.heap);
                    return Err(
                        vm.type_error(&format!("extend() expects a bytes argument, got {}", kind))
                    );
                }
            };
            if let Obj::Bytes(b) = vm.heap.get_mut(id) {
                b.extend_from_slice(&other);
            }
            Ok(Value::Nil)
        }
        "to_list" => {
            want(vm, name, args, 0)?;
            let values: Vec<Value> = match vm.heap.get(id) {
                Obj::Bytes(b) => b.iter().map(|&byte| Value::Number(byte as f64)).collect(),
                _ => Vec::new(),
            };
            Ok(vm.make_list(values))
        }
        "to_string" => {
            want(vm, name, args, 0)?;
            let text = match vm.heap.get(id) {
                Obj::Bytes(b) => String::from_utf8_lossy(b).to_string(),
                _ => String::new(),
            };
            Ok(vm.make_string(&text))
        }
        "clone" => {
            want(vm, name, args, 0)?;
            let bytes = match vm.heap.get(id) {
                Obj::Bytes(b) => b.clone(),
                _ => Vec::new(),
            };
            Ok(vm.make_bytes(bytes))
        }
        _ => Err(vm.property_error(&format!("bytes has no method '{}'", name))),
    }
}

// ---------------------------------------------------------------------------
// Ranges
// ---------------------------------------------------------------------------

fn range_method(vm: &mut Vm, id: ObjId, name: &str, args: &[Value]) -> Result<Value, VmError> {
    let range = match vm.heap.get(id) {
        Obj::Range(r) => *r,
        _ => unreachable!(),
    };
    match name {
        "lower" => {
            want(vm, name, args, 0)?;
            Ok(Value::Number(range.lower as f64))
        }
        "upper" => {
            want(vm, name, args, 0)?;
            Ok(Value::Number(range.upper as f64))
        }
        "length" => {
            want(vm, name, args, 0)?;
            Ok(Value::Number(range.len() as f64))
        }
        "to_list" => {
            want(vm, name, args, 0)?;
            let values: Vec<Value> = (range.lower..range.upper)
                .map(|n| Value::Number(n as f64))
                .collect();
            Ok(vm.make_list(values))
        }
        "to_string" => {
            want(vm, name, args, 0)?;
            let text = vm.heap.get(id).to_display(&vm.heap);
            Ok(vm.make_string(&text))
        }
        _ => Err(vm.property_error(&format!("range has no method '{}'", name))),
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

fn file_method(vm: &mut Vm, id: ObjId, name: &str, args: &[Value]) -> Result<Value, VmError> {
    use std::io::{Read, Write};

    let (path, mode) = match vm.heap.get(id) {
        Obj::File(f) => (f.path.to_string(), f.mode),
        _ => unreachable!(),
    };
    match name {
        "read" => {
            want(vm, name, args, 0)?;
            if mode != FileMode::Read {
                return Err(vm.value_error("file is not open for reading"));
            }
            let opened = std::fs::File::open(&path);
            let mut handle = match opened {
                Ok(handle) => handle,
                Err(error) => {
                    return Err(vm.value_error(&format!("cannot open '{}': {}", path, error)))
                }
            };
            let mut contents = String::new();
            if let Err(error) = handle.read_to_string(&mut contents) {
                return Err(vm.value_error(&format!("cannot read '{}': {}", path, error)));
            }
            Ok(vm.make_string(&contents))
        }
        "write" => {
            want(vm, name, args, 1)?;
            let text = expect_string(vm, args[0], "write")?;
            if mode == FileMode::Read {
                return Err(vm.value_error("file is not open for writing"));
            }
            let result = if mode == FileMode::Append {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .and_then(|mut handle| handle.write_all(text.as_bytes()))
            } else {
                std::fs::write(&path, text.as_bytes())
            };
            match result {
                Ok(()) => Ok(Value::Number(text.len() as f64)),
                Err(error) => Err(vm.value_error(&format!("cannot write '{}': {}", path, error))),
            }
        }
        "exists" => {
            want(vm, name, args, 0)?;
            Ok(Value::Bool(std::path::Path::new(&path).exists()))
        }
        "close" => {
            want(vm, name, args, 0)?;
            if let Obj::File(f) = vm.heap.get(id) {
                f.close();
            }
            Ok(Value::Nil)
        }
        "path" => {
            want(vm, name, args, 0)?;
            Ok(vm.make_string(&path))
        }
        "mode" => {
            want(vm, name, args, 0)?;
            let text = match mode {
                FileMode::Read => "r",
                FileMode::Write => "w",
                FileMode::Append => "a",
            };
            Ok(vm.make_string(text))
        }
        "is_open" => {
            want(vm, name, args, 0)?;
            let open = match vm.heap.get(id) {
                Obj::File(f) => f.is_open(),
                _ => false,
            };
            Ok(Value::Bool(open))
        }
        "to_string" => {
            want(vm, name, args, 0)?;
            let text = vm.heap.get(id).to_display(&vm.heap);
            Ok(vm.make_string(&text))
        }
        _ => Err(vm.property_error(&format!("file has no method '{}'", name))),
    }
}
