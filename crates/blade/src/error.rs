//! Public error types and the internal exception representation.
//!
//! Runtime exceptions travel through the VM as *data* (`VmError::Throw`
//! carrying a [`Value`]) rather than as host panics, so the interpreter can
//! unwind through native frames safely. Only at the public API boundary are
//! they rendered into [`Error::Runtime`] with a formatted stack trace.

use std::fmt;

use crate::value::Value;

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// One or more compile-time diagnostics. Not catchable from the language.
    #[error("{0}")]
    Compile(CompileDiagnostics),

    /// An uncaught runtime exception, rendered with its stack trace.
    #[error("{0}")]
    Runtime(RuntimeTrace),

    /// The VM exceeded a fixed frame or value-stack limit. Fatal.
    #[error("stack overflow: {0}")]
    StackOverflow(String),

    /// A script requested termination via `os.exit(code)`.
    #[error("exit with code {0}")]
    Exit(i32),

    /// Host I/O failure while reading a script or module file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The process exit code conventionally associated with this error.
    ///
    /// `65` for compile errors, `70` for uncaught runtime exceptions and
    /// `71` for internal failures, matching BSD sysexits.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Compile(_) => 65,
            Error::Runtime(_) => 70,
            Error::StackOverflow(_) => 71,
            Error::Exit(code) => *code,
            Error::Io(_) => 74,
        }
    }
}

/// A single compile-time diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: u32,
    pub message: String,
}

/// The collected diagnostics of one failed compilation.
///
/// The compiler recovers at statement boundaries after each error, so a
/// single pass can report several of these (at most one per line).
#[derive(Debug, Clone)]
pub struct CompileDiagnostics {
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for CompileDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "SyntaxError at line {}: {}", d.line, d.message)?;
        }
        Ok(())
    }
}

/// One entry of a rendered stack trace, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    /// Function name, or `<script>` for a module's top level.
    pub function: String,
    /// The module the frame was executing in.
    pub module: String,
    /// Source line of the faulting or calling instruction.
    pub line: u32,
}

/// An uncaught runtime exception with its class, message, and call trace.
#[derive(Debug, Clone)]
pub struct RuntimeTrace {
    /// Exception class name, e.g. `TypeError`.
    pub kind: String,
    pub message: String,
    /// Call frames at the point of the raise, innermost first.
    pub frames: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uncaught {}: {}", self.kind, self.message)?;
        for frame in &self.frames {
            write!(
                f,
                "\n  at {} ({}:{})",
                frame.function, frame.module, frame.line
            )?;
        }
        Ok(())
    }
}

/// Control-flow error used inside the VM and returned by native functions.
///
/// `Throw` is a catchable language exception travelling as data; the
/// remaining variants bypass `try`/`catch` handlers entirely. Native module
/// code constructs these through the `Vm` error helpers rather than
/// directly.
#[derive(Debug, Clone)]
pub enum VmError {
    /// A raised value (almost always an `Exception` instance) looking for a
    /// handler.
    Throw(Value),
    /// Frame or value stack exceeded its fixed cap. Uncatchable.
    Overflow(&'static str),
    /// `os.exit(code)` was called. Uncatchable.
    Exit(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_diagnostics_render_one_per_line() {
        let errs = CompileDiagnostics {
            diagnostics: vec![
                Diagnostic {
                    line: 1,
                    message: "unexpected ')'".to_string(),
                },
                Diagnostic {
                    line: 4,
                    message: "expected expression".to_string(),
                },
            ],
        };
        let text = errs.to_string();
        assert!(text.contains("line 1"));
        assert!(text.contains("line 4"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn runtime_trace_lists_frames_innermost_first() {
        let trace = RuntimeTrace {
            kind: "TypeError".to_string(),
            message: "bad operand".to_string(),
            frames: vec![
                TraceFrame {
                    function: "inner".to_string(),
                    module: "main".to_string(),
                    line: 7,
                },
                TraceFrame {
                    function: "<script>".to_string(),
                    module: "main".to_string(),
                    line: 2,
                },
            ],
        };
        let text = trace.to_string();
        let inner = text.find("inner").unwrap();
        let outer = text.find("<script>").unwrap();
        assert!(inner < outer);
    }
}
