//! Global native functions available in every module scope.
//!
//! Installed once at VM construction into the builtin table, which global
//! lookup consults after the current module's own values.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::VmError;
use crate::object::{FileHandle, FileMode, NativeFunction, Obj, Range};
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn install(vm: &mut Vm) {
    define(vm, "print", 0, u8::MAX, builtin_print);
    define(vm, "abs", 1, 1, builtin_abs);
    define(vm, "min", 1, u8::MAX, builtin_min);
    define(vm, "max", 1, u8::MAX, builtin_max);
    define(vm, "sum", 1, 1, builtin_sum);
    define(vm, "chr", 1, 1, builtin_chr);
    define(vm, "ord", 1, 1, builtin_ord);
    define(vm, "hex", 1, 1, builtin_hex);
    define(vm, "bin", 1, 1, builtin_bin);
    define(vm, "oct", 1, 1, builtin_oct);
    define(vm, "to_string", 1, 1, builtin_to_string);
    define(vm, "to_number", 1, 1, builtin_to_number);
    define(vm, "typeof", 1, 1, builtin_typeof);
    define(vm, "time", 0, 0, builtin_time);
    define(vm, "microtime", 0, 0, builtin_microtime);
    define(vm, "rand", 0, 0, builtin_rand);
    define(vm, "file", 1, 2, builtin_file);
    define(vm, "bytes", 1, 1, builtin_bytes);
    define(vm, "range", 1, 2, builtin_range);
    define(vm, "id", 1, 1, builtin_id);
}

fn define(
    vm: &mut Vm,
    name: &'static str,
    min_arity: u8,
    max_arity: u8,
    func: fn(&mut Vm, &[Value]) -> Result<Value, VmError>,
) {
    let name_id = vm.heap.intern(name);
    let native = vm.heap.alloc(Obj::Native(NativeFunction {
        name: Rc::from(name),
        min_arity,
        max_arity,
        func: Rc::new(func),
    }));
    vm.builtins.insert(name_id, Value::Obj(native));
}

/// `print(...)`: space-separated, no trailing newline (`echo` adds one).
fn builtin_print(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let mut parts = Vec::with_capacity(args.len());
    for &arg in args {
        parts.push(vm.display_value(arg)?);
    }
    vm.write_out(&parts.join(" "));
    Ok(Value::Nil)
}

fn builtin_abs(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    match args[0] {
        Value::Number(n) => Ok(Value::Number(n.abs())),
        other => {
            let kind = other.type_name(&vm.heap);
            Err(vm.type_error(&format!("abs() expects a number, got {}", kind)))
        }
    }
}

fn builtin_min(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    fold_numbers(vm, "min", args, f64::min)
}

fn builtin_max(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    fold_numbers(vm, "max", args, f64::max)
}

/// min/max over either a single list or the argument span itself.
fn fold_numbers(
    vm: &mut Vm,
    name: &str,
    args: &[Value],
    fold: fn(f64, f64) -> f64,
) -> Result<Value, VmError> {
    let numbers = collect_numbers(vm, name, args)?;
    if numbers.is_empty() {
        return Err(vm.value_error(&format!("{}() of an empty sequence", name)));
    }
    Ok(Value::Number(numbers.into_iter().reduce(fold).unwrap()))
}

fn builtin_sum(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let numbers = collect_numbers(vm, "sum", args)?;
    Ok(Value::Number(numbers.into_iter().sum()))
}

fn collect_numbers(vm: &mut Vm, name: &str, args: &[Value]) -> Result<Vec<f64>, VmError> {
    let values: Vec<Value> = if args.len() == 1 {
        match args[0].as_obj().map(|id| vm.heap.get(id)) {
            Some(Obj::List(items)) => items.clone(),
            _ => args.to_vec(),
        }
    } else {
        args.to_vec()
    };
    let mut numbers = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::Number(n) => numbers.push(n),
            other => {
                let kind = other.type_name(&vm.heap);
                return Err(vm.type_error(&format!("{}() expects numbers, got {}", name, kind)));
            }
        }
    }
    Ok(numbers)
}

fn builtin_chr(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    match args[0] {
        Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => match char::from_u32(n as u32) {
            Some(ch) => {
                let mut buffer = [0u8; 4];
                Ok(vm.make_string(ch.encode_utf8(&mut buffer)))
            }
            None => Err(vm.value_error(&format!("chr() argument {} is not a code point", n))),
        },
        _ => Err(vm.type_error("chr() expects a non-negative integer")),
    }
}

fn builtin_ord(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let text = match vm.string_of(args[0]) {
        Some(text) => text.to_string(),
        None => return Err(vm.type_error("ord() expects a string")),
    };
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Ok(Value::Number(ch as u32 as f64)),
        _ => Err(vm.value_error("ord() expects a single character")),
    }
}

fn builtin_hex(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    radix_string(vm, "hex", args[0], 16)
}

fn builtin_bin(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    radix_string(vm, "bin", args[0], 2)
}

fn builtin_oct(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    radix_string(vm, "oct", args[0], 8)
}

fn radix_string(vm: &mut Vm, name: &str, value: Value, radix: u32) -> Result<Value, VmError> {
    match value {
        Value::Number(n) if n.fract() == 0.0 => {
            let v = n as i64;
            let magnitude = v.unsigned_abs();
            let digits = match radix {
                2 => format!("{:b}", magnitude),
                8 => format!("{:o}", magnitude),
                _ => format!("{:x}", magnitude),
            };
            let text = if v < 0 {
                format!("-{}", digits)
            } else {
                digits
            };
            Ok(vm.make_string(&text))
        }
        _ => Err(vm.type_error(&format!("{}() expects an integer", name))),
    }
}

fn builtin_to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let text = vm.display_value(args[0])?;
    Ok(vm.make_string(&text))
}

fn builtin_to_number(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    match args[0] {
        Value::Number(n) => Ok(Value::Number(n)),
        Value::Bool(b) => Ok(Value::Number(if b { 1.0 } else { 0.0 })),
        other => match vm.string_of(other) {
            Some(text) => {
                let trimmed = text.trim().to_string();
                match trimmed.parse::<f64>() {
                    Ok(n) => Ok(Value::Number(n)),
                    Err(_) => {
                        Err(vm.value_error(&format!("'{}' is not a valid number", trimmed)))
                    }
                }
            }
            None => {
                let kind = other.type_name(&vm.heap);
                Err(vm.type_error(&format!("to_number() expects a string or number, got {}", kind)))
            }
        },
    }
}

fn builtin_typeof(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let name = args[0].type_name(&vm.heap).to_string();
    Ok(vm.make_string(&name))
}

fn builtin_time(_vm: &mut Vm, _args: &[Value]) -> Result<Value, VmError> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(seconds.floor()))
}

fn builtin_microtime(_vm: &mut Vm, _args: &[Value]) -> Result<Value, VmError> {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as f64)
        .unwrap_or(0.0);
    Ok(Value::Number(micros))
}

thread_local! {
    static RAND_STATE: Cell<u64> = const { Cell::new(0) };
}

/// xorshift64*, seeded from the clock on first use.
fn builtin_rand(_vm: &mut Vm, _args: &[Value]) -> Result<Value, VmError> {
    let value = RAND_STATE.with(|state| {
        let mut x = state.get();
        if x == 0 {
            x = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9e3779b97f4a7c15)
                | 1;
        }
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        state.set(x);
        x.wrapping_mul(0x2545f4914f6cdd1d)
    });
    Ok(Value::Number((value >> 11) as f64 / (1u64 << 53) as f64))
}

fn builtin_file(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let path = match vm.string_of(args[0]) {
        Some(text) => text.to_string(),
        None => return Err(vm.type_error("file() expects a path string")),
    };
    let mode_text = match args.get(1) {
        None => "r".to_string(),
        Some(&mode) => match vm.string_of(mode) {
            Some(text) => text.to_string(),
            None => return Err(vm.type_error("file() mode must be a string")),
        },
    };
    let mode = match mode_text.as_str() {
        "r" => FileMode::Read,
        "w" => FileMode::Write,
        "a" => FileMode::Append,
        other => return Err(vm.value_error(&format!("invalid file mode '{}'", other))),
    };
    let id = vm.heap.alloc(Obj::File(FileHandle {
        path: Rc::from(path.as_str()),
        mode,
        handle: std::cell::RefCell::new(None),
        is_std: false,
    }));
    Ok(Value::Obj(id))
}

/// `bytes(n)` — a zeroed buffer; `bytes([..])` — from a list of byte
/// values.
fn builtin_bytes(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    match args[0] {
        Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => Ok(vm.make_bytes(vec![0; n as usize])),
        Value::Obj(id) => {
            let items = match vm.heap.get(id) {
                Obj::List(items) => items.clone(),
                other => {
                    let kind = other.type_name();
                    return Err(
                        vm.type_error(&format!("bytes() expects a size or list, got {}", kind))
                    );
                }
            };
            let mut bytes = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Number(b) if b.fract() == 0.0 && (0.0..=255.0).contains(&b) => {
                        bytes.push(b as u8)
                    }
                    _ => return Err(vm.value_error("bytes values must be integers in 0..255")),
                }
            }
            Ok(vm.make_bytes(bytes))
        }
        _ => Err(vm.type_error("bytes() expects a size or list")),
    }
}

fn builtin_range(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let bounds = match (args.first(), args.get(1)) {
        (Some(&Value::Number(upper)), None) if upper.fract() == 0.0 => Some((0, upper as i64)),
        (Some(&Value::Number(lower)), Some(&Value::Number(upper)))
            if lower.fract() == 0.0 && upper.fract() == 0.0 =>
        {
            Some((lower as i64, upper as i64))
        }
        _ => None,
    };
    match bounds {
        Some((lower, upper)) => Ok(Value::Obj(vm.heap.alloc(Obj::Range(Range {
            lower,
            upper,
        })))),
        None => Err(vm.type_error("range() expects integer bounds")),
    }
}

/// Arena id of a heap object, nil for scalars. Useful for identity checks.
fn builtin_id(_vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    match args[0] {
        Value::Obj(id) => Ok(Value::Number(id.0 as f64)),
        _ => Ok(Value::Nil),
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;

    #[test]
    fn interning_makes_id_stable_for_equal_strings() {
        let mut runtime = Runtime::new();
        let result = runtime.run("id('abc') == id('ab' + 'c')").unwrap();
        assert!(matches!(result, crate::value::Value::Bool(true)));
    }
}
