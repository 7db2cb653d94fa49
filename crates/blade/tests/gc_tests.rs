//! Collector behavior observed through the public API: interning
//! identity, survival of rooted data, and bounded growth under allocation
//! pressure.

use blade::{Runtime, RuntimeOptions, Value};

fn pressured_runtime() -> Runtime {
    Runtime::with_options(RuntimeOptions {
        // A tiny threshold forces many collection cycles.
        gc_threshold: 32 * 1024,
        ..RuntimeOptions::default()
    })
}

#[test]
fn equal_string_literals_are_identical() {
    let mut runtime = Runtime::new();
    let value = runtime.run("id('hello') == id('hel' + 'lo')").unwrap();
    assert!(matches!(value, Value::Bool(true)));
}

#[test]
fn interning_survives_collections() {
    let mut runtime = pressured_runtime();
    let value = runtime
        .run(
            "
var probe = 'keep-me'
for i in 0..5000 { var junk = ['x' + i.to_string(), [i, i]] }
probe == 'keep' + '-me'
",
        )
        .unwrap();
    assert!(matches!(value, Value::Bool(true)));
}

#[test]
fn allocation_pressure_stays_bounded() {
    let mut runtime = pressured_runtime();
    runtime
        .run_script(
            "
for i in 0..20000 { var t = [i, i * 2, 'x' + i.to_string()] }
echo 'done'
",
        )
        .unwrap();
    assert_eq!(runtime.take_output(), "done\n");

    // After a full collection only the runtime's own structures (builtins,
    // native modules, the main module) and a handful of interned names
    // should remain — nothing proportional to the 20k iterations.
    runtime.collect_now();
    assert!(
        runtime.heap_objects() < 1000,
        "live objects after sweep: {}",
        runtime.heap_objects()
    );
}

#[test]
fn rooted_globals_survive_pressure() {
    let mut runtime = pressured_runtime();
    runtime
        .run_script(
            "
var keep = []
for i in 0..100 { keep.append(i * 3) }
for i in 0..10000 { var junk = ['junk' + i.to_string()] }
echo keep.length()
echo keep[99]
",
        )
        .unwrap();
    assert_eq!(runtime.take_output(), "100\n297\n");
}

#[test]
fn closures_keep_captures_alive_across_collections() {
    let mut runtime = pressured_runtime();
    runtime
        .run_script(
            "
def make() { var secret = 'captured-value'; return || { return secret } }
var f = make()
for i in 0..10000 { var junk = [i.to_string()] }
echo f()
",
        )
        .unwrap();
    assert_eq!(runtime.take_output(), "captured-value\n");
}

#[test]
fn collection_counter_visible_through_byte_accounting() {
    let mut runtime = pressured_runtime();
    runtime
        .run_script("for i in 0..20000 { var t = [i, i, i, i, i, i, i, i] }")
        .unwrap();
    // The heap shrank back; live bytes are far below what 20k lists of
    // eight values would occupy if they had leaked.
    runtime.collect_now();
    assert!(
        runtime.heap_bytes() < 512 * 1024,
        "heap bytes after sweep: {}",
        runtime.heap_bytes()
    );
}

#[test]
fn dicts_with_every_scalar_key_kind() {
    let mut runtime = Runtime::new();
    runtime
        .run_script(
            "
var d = {}
d[nil] = 'nil-key'
d[true] = 'bool-key'
d[1.5] = 'num-key'
d['s'] = 'str-key'
echo d.length()
echo d[1.5]
",
        )
        .unwrap();
    assert_eq!(runtime.take_output(), "4\nnum-key\n");
}

#[test]
fn collection_keys_are_rejected() {
    let mut runtime = Runtime::new();
    runtime
        .run_script(
            "
var d = {}
try { d[[1]] = 1 } catch TypeError { echo 'list rejected' }
try { d[file('x.txt')] = 1 } catch TypeError { echo 'file rejected' }
",
        )
        .unwrap();
    assert_eq!(
        runtime.take_output(),
        "list rejected\nfile rejected\n"
    );
}
