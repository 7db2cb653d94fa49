//! Bytecode disassembler backing the CLI's `-d` flag.

use crate::bytecode::Op;
use crate::heap::Heap;
use crate::object::Obj;
use crate::value::{stringify, ObjId, Value};

/// Render a function and, recursively, every function in its constant
/// pool.
pub fn disassemble(heap: &Heap, function: ObjId) -> String {
    let mut out = String::new();
    let mut queue = vec![function];
    let mut seen = vec![function];
    while let Some(current) = queue.pop() {
        disassemble_one(heap, current, &mut out);
        if let Obj::Function(f) = heap.get(current) {
            for constant in &f.code.constants {
                if let Value::Obj(id) = constant {
                    if matches!(heap.get(*id), Obj::Function(_)) && !seen.contains(id) {
                        seen.push(*id);
                        queue.push(*id);
                    }
                }
            }
        }
    }
    out
}

fn disassemble_one(heap: &Heap, function: ObjId, out: &mut String) {
    let Obj::Function(f) = heap.get(function) else {
        return;
    };
    let name: &str = if f.name.is_empty() {
        "<script>"
    } else {
        &f.name
    };
    out.push_str(&format!("== {} ==\n", name));
    let mut last_line = u32::MAX;
    for (offset, op) in f.code.code.iter().enumerate() {
        let line = f.code.lines.line_at(offset);
        if line == last_line {
            out.push_str(&format!("{:04}    | ", offset));
        } else {
            out.push_str(&format!("{:04} {:4} ", offset, line));
            last_line = line;
        }
        out.push_str(&render_op(heap, &f.code.constants, *op));
        out.push('\n');
    }
}

fn render_op(heap: &Heap, constants: &[Value], op: Op) -> String {
    let constant = |index: u16| -> String {
        constants
            .get(index as usize)
            .map(|&v| stringify(heap, v))
            .unwrap_or_else(|| "?".to_string())
    };
    match op {
        Op::Const(i) => format!("Const {} ({})", i, constant(i)),
        Op::GetGlobal(i) => format!("GetGlobal {} ({})", i, constant(i)),
        Op::SetGlobal(i) => format!("SetGlobal {} ({})", i, constant(i)),
        Op::DefineGlobal(i) => format!("DefineGlobal {} ({})", i, constant(i)),
        Op::GetProperty(i) => format!("GetProperty {} ({})", i, constant(i)),
        Op::SetProperty(i) => format!("SetProperty {} ({})", i, constant(i)),
        Op::Closure(i) => format!("Closure {} ({})", i, constant(i)),
        Op::Class(i) => format!("Class {} ({})", i, constant(i)),
        Op::Method(i) => format!("Method {} ({})", i, constant(i)),
        Op::StaticMethod(i) => format!("StaticMethod {} ({})", i, constant(i)),
        Op::Field(i) => format!("Field {} ({})", i, constant(i)),
        Op::StaticField(i) => format!("StaticField {} ({})", i, constant(i)),
        Op::Import(i) => format!("Import {} ({})", i, constant(i)),
        Op::ImportMember(i) => format!("ImportMember {} ({})", i, constant(i)),
        Op::Invoke { name, argc } => {
            format!("Invoke {} ({}) argc={}", name, constant(name), argc)
        }
        Op::SuperInvoke { name, argc } => {
            format!("SuperInvoke {} ({}) argc={}", name, constant(name), argc)
        }
        Op::Try {
            filter,
            catch,
            finally,
        } => format!(
            "Try filter={} catch={} finally={}",
            if filter == crate::bytecode::NO_FILTER {
                "-".to_string()
            } else {
                constant(filter)
            },
            target_text(catch),
            target_text(finally),
        ),
        Op::Unwind { trys, target } => format!("Unwind trys={} target={}", trys, target),
        other => format!("{:?}", other),
    }
}

fn target_text(target: u32) -> String {
    if target == crate::bytecode::NO_TARGET {
        "-".to_string()
    } else {
        target.to_string()
    }
}
