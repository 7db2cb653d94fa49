//! Exception semantics: raising, catching, filters, finally ordering, and
//! the error taxonomy.

use blade::{Error, Runtime};
use pretty_assertions::assert_eq;

fn output(source: &str) -> String {
    let mut runtime = Runtime::new();
    if let Err(error) = runtime.run_script(source) {
        panic!("script failed: {}\n--- output so far ---\n{}", error, runtime.take_output());
    }
    runtime.take_output()
}

fn failure(source: &str) -> Error {
    let mut runtime = Runtime::new();
    runtime.run_script(source).expect_err("script should fail")
}

#[test]
fn try_catch_with_finally() {
    let source = "
try { raise Exception('oops') } catch Exception as e { echo e.message } finally { echo 'done' }
";
    assert_eq!(output(source), "oops\ndone\n");
}

#[test]
fn finally_runs_on_fall_through() {
    assert_eq!(output("try { echo 'a' } finally { echo 'f' }"), "a\nf\n");
}

#[test]
fn finally_runs_on_return() {
    let source = "
def f() { try { return 'r' } finally { echo 'fin' } }
echo f()
";
    assert_eq!(output(source), "fin\nr\n");
}

#[test]
fn finally_runs_when_raise_escapes() {
    let source = "
def g() { try { raise Exception('x') } finally { echo 'inner' } }
try { g() } catch Exception { echo 'outer' }
";
    assert_eq!(output(source), "inner\nouter\n");
}

#[test]
fn finally_runs_on_break_and_continue() {
    let source = "
while (true) { try { break } finally { echo 'fb' } }
echo 'after'
var i = 0
while (i < 3) { i += 1; try { continue } finally { echo 'fc' } }
";
    assert_eq!(output(source), "fb\nafter\nfc\nfc\nfc\n");
}

#[test]
fn finally_runs_exactly_once_when_caught() {
    let source = "
var log = []
try { raise Exception('e') } catch Exception { log.append('catch') } finally { log.append('finally') }
echo log
";
    assert_eq!(output(source), "['catch', 'finally']\n");
}

#[test]
fn raise_inside_catch_still_reaches_finally() {
    let source = "
try {
  try { raise Exception('first') } catch Exception { raise Exception('second') } finally { echo 'fin' }
} catch Exception as e { echo e.message }
";
    assert_eq!(output(source), "fin\nsecond\n");
}

#[test]
fn catch_filter_matches_subclasses() {
    let source = "
try { raise TypeError('t') } catch Exception as e { echo e.type }
";
    assert_eq!(output(source), "TypeError\n");
}

#[test]
fn catch_filter_mismatch_propagates() {
    let source = "
try { try { raise ValueError('v') } catch TypeError { echo 'no' } } catch ValueError { echo 'yes' }
";
    assert_eq!(output(source), "yes\n");
}

#[test]
fn runtime_errors_are_catchable() {
    assert_eq!(
        output("try { echo 1 + 'x' } catch TypeError { echo 'type' }"),
        "type\n"
    );
    assert_eq!(
        output("try { echo missing } catch NameError { echo 'name' }"),
        "name\n"
    );
    assert_eq!(
        output("try { echo [1][5] } catch RangeError { echo 'range' }"),
        "range\n"
    );
    assert_eq!(
        output("try { echo nil.whatever() } catch PropertyError { echo 'prop' }"),
        "prop\n"
    );
    assert_eq!(
        output("try { echo 'abc'.to_number() } catch ValueError { echo 'value' }"),
        "value\n"
    );
    let arity = "
def one(a) { return a }
try { one(1, 2) } catch ArgumentError { echo 'arity' }
";
    assert_eq!(output(arity), "arity\n");
    assert_eq!(
        output("try { import no.such.thing } catch ImportError { echo 'import' }"),
        "import\n"
    );
}

#[test]
fn uncaught_exceptions_carry_class_message_and_trace() {
    let source = "
def inner() { raise ValueError('broken') }
def outer() { return inner() }
outer()
";
    match failure(source) {
        Error::Runtime(trace) => {
            assert_eq!(trace.kind, "ValueError");
            assert_eq!(trace.message, "broken");
            // Innermost first.
            assert_eq!(trace.frames[0].function, "inner");
            assert_eq!(trace.frames[1].function, "outer");
        }
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn exceptions_record_a_stacktrace_property() {
    let source = "
def boom() { raise Exception('x') }
try { boom() } catch Exception as e { echo e.stacktrace.contains('boom') }
";
    assert_eq!(output(source), "true\n");
}

#[test]
fn deep_recursion_is_a_fatal_overflow() {
    let source = "
def down() { return down() }
down()
";
    assert!(matches!(failure(source), Error::StackOverflow(_)));
}

#[test]
fn overflow_is_not_catchable() {
    let source = "
def down() { return down() }
try { down() } catch Exception { echo 'caught' }
";
    assert!(matches!(failure(source), Error::StackOverflow(_)));
}

#[test]
fn compile_errors_report_per_statement() {
    let source = "var = 1\nvar also broken\nvar fine = 2";
    match failure(source) {
        Error::Compile(diags) => {
            assert!(diags.diagnostics.len() >= 2, "got {:?}", diags.diagnostics);
        }
        other => panic!("expected a compile error, got {:?}", other),
    }
}

#[test]
fn shadowing_in_same_scope_is_a_compile_error() {
    let source = "def f() { var a = 1\nvar a = 2 }";
    assert!(matches!(failure(source), Error::Compile(_)));
}

#[test]
fn reading_local_in_own_initializer_is_a_compile_error() {
    let source = "def f() { var a = a }";
    assert!(matches!(failure(source), Error::Compile(_)));
}

#[test]
fn break_outside_loop_is_a_compile_error() {
    assert!(matches!(failure("break"), Error::Compile(_)));
}

#[test]
fn catchall_catch_takes_anything() {
    assert_eq!(
        output("try { raise Exception('any') } catch { echo 'got it' }"),
        "got it\n"
    );
}

#[test]
fn runtime_survives_an_error() {
    let mut runtime = Runtime::new();
    assert!(runtime.run("missing_name").is_err());
    let value = runtime.run("1 + 1").unwrap();
    assert_eq!(runtime.display(value), "2");
}
