//! End-to-end language tests driven through the public `Runtime` API with
//! buffered output.

use blade::{Runtime, Value};
use pretty_assertions::assert_eq;

fn output(source: &str) -> String {
    let mut runtime = Runtime::new();
    if let Err(error) = runtime.run_script(source) {
        panic!("script failed: {}\n--- output so far ---\n{}", error, runtime.take_output());
    }
    runtime.take_output()
}

fn eval(source: &str) -> String {
    let mut runtime = Runtime::new();
    let value = runtime.run(source).expect("evaluation failed");
    runtime.display(value)
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(output("echo 2 + 3 * 4"), "14\n");
    assert_eq!(eval("(2 + 3) * 4"), "20");
    assert_eq!(eval("2 ** 3 ** 2"), "512"); // right associative
    assert_eq!(eval("10 / 4"), "2.5");
    assert_eq!(eval("10 // 3"), "3");
    assert_eq!(eval("-2 ** 2"), "-4"); // unary binds looser than **
}

#[test]
fn number_literals() {
    assert_eq!(eval("0xff"), "255");
    assert_eq!(eval("0b1010"), "10");
    assert_eq!(eval("0o17"), "15");
    assert_eq!(eval("1_000_000"), "1000000");
    assert_eq!(eval("2.5e2"), "250");
}

#[test]
fn list_and_dict_literals() {
    assert_eq!(
        output("var d = { 'a': 1, 'b': [2,3] }\necho d['b'][1]"),
        "3\n"
    );
    assert_eq!(eval("[1, 2, 3].length()"), "3");
    assert_eq!(eval("var d = {'x': 1}\nd.length()"), "1");
}

#[test]
fn fibonacci() {
    let source = "
def fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2) }
echo fib(10)
";
    assert_eq!(output(source), "55\n");
}

#[test]
fn string_interpolation_and_interning() {
    let source = "var a = 'hi'; var b = 'h' + 'i'; echo a == b; echo '${a}!'";
    assert_eq!(output(source), "true\nhi!\n");
}

#[test]
fn interpolation_embeds_expressions() {
    assert_eq!(eval("'${1 + 2} and ${'x'}'"), "3 and x");
    assert_eq!(eval("'${ {'k': 41}['k'] + 1 }'"), "42");
}

#[test]
fn closure_capture_is_shared() {
    let source = "
def make() { var a = 0; return [|| { a = a + 1; return a }, || { return a }] }
var fs = make()
fs[0]()
fs[0]()
echo fs[1]()
";
    assert_eq!(output(source), "2\n");
}

#[test]
fn upvalues_close_per_call() {
    let source = "
def counter() { var n = 0; return || { n += 1; return n } }
var c1 = counter()
var c2 = counter()
c1()
c1()
echo c1()
echo c2()
";
    assert_eq!(output(source), "3\n1\n");
}

#[test]
fn modulo_takes_divisor_sign() {
    assert_eq!(output("echo 7 % 3"), "1\n");
    assert_eq!(output("echo -7 % 3"), "2\n");
    assert_eq!(output("echo 7 % -3"), "-2\n");
    assert_eq!(output("echo -7 % -3"), "-1\n");
    // a == (a // b) * b + (a % b)
    assert_eq!(eval("(-7 // 3) * 3 + (-7 % 3)"), "-7");
}

#[test]
fn truthiness_contract() {
    // 0 is truthy; empty containers are falsy.
    assert_eq!(eval("0 and 'zero-truthy'"), "zero-truthy");
    assert_eq!(eval("'' or 'empty-falsy'"), "empty-falsy");
    assert_eq!(eval("[] or 'list'"), "list");
    assert_eq!(eval("var d = {}\nd or 'dict'"), "dict");
    assert_eq!(eval("nil ?? 'fallback'"), "fallback");
    assert_eq!(eval("false ?? 'kept'"), "false"); // ?? only bridges nil
}

#[test]
fn while_and_numeric_for() {
    let source = "
var total = 0
for (var i = 0; i < 5; i += 1) { total += i }
echo total
var count = 0
while (count < 5) { count += 1 }
echo count
";
    assert_eq!(output(source), "10\n5\n");
}

#[test]
fn do_while_runs_at_least_once() {
    let source = "
var n = 10
do { echo n; n += 1 } while (n < 3)
";
    assert_eq!(output(source), "10\n");
}

#[test]
fn loop_with_break_and_continue() {
    let source = "
var total = 0
var i = 0
loop {
  i += 1
  if (i > 10) break
  if (i % 2 == 0) continue
  total += i
}
echo total
";
    // 1 + 3 + 5 + 7 + 9
    assert_eq!(output(source), "25\n");
}

#[test]
fn iterator_over_range_list_dict_string() {
    let source = "
var out = []
for i in 0..4 { out.append(i) }
echo out
for x in [10, 20] { out.append(x) }
echo out.length()
var keys = []
for k in { 'a': 1, 'b': 2 } { keys.append(k) }
echo keys
var chars = []
for c in 'héllo' { chars.append(c) }
echo chars.length()
echo chars[1]
";
    assert_eq!(
        output(source),
        "[0, 1, 2, 3]\n6\n['a', 'b']\n5\né\n"
    );
}

#[test]
fn dict_iteration_order_is_insertion_order() {
    let source = "
var d = {}
d['a'] = 1
d['b'] = 2
d['c'] = 3
d.remove('b')
d['b'] = 9
echo d.keys()
";
    assert_eq!(output(source), "['a', 'c', 'b']\n");
}

#[test]
fn dict_get_returns_nil_on_miss() {
    assert_eq!(eval("var d = {'a': 1}\nd.get('missing')"), "nil");
    assert_eq!(eval("var d = {'a': 1}\nd.get('missing', 42)"), "42");
}

#[test]
fn variadic_functions_bind_a_list() {
    let source = "
def tail(first, ...rest) { return rest }
echo tail(1, 2, 3).length()
echo tail(1)
";
    assert_eq!(output(source), "2\n[]\n");
}

#[test]
fn lambda_expression_bodies() {
    assert_eq!(output("var double = |x| x * 2\necho double(21)"), "42\n");
    assert_eq!(
        output("echo [1, 2, 3].map(|x| x + 1)"),
        "[2, 3, 4]\n"
    );
}

#[test]
fn list_methods() {
    let source = "
var xs = [3, 1, 2]
xs.append(4)
echo xs.length()
echo xs.sort()
echo xs.filter(|x| x % 2 == 0)
echo xs.reduce(|acc, x| acc + x)
echo [1, 2].join('-')
";
    assert_eq!(output(source), "4\n[1, 2, 3, 4]\n[2, 4]\n10\n1-2\n");
}

#[test]
fn string_methods() {
    assert_eq!(eval("'Hello'.upper()"), "HELLO");
    assert_eq!(eval("'  x  '.trim()"), "x");
    assert_eq!(eval("'a,b,c'.split(',')"), "['a', 'b', 'c']");
    assert_eq!(eval("'hello'.index_of('llo')"), "2");
    assert_eq!(eval("'3.5'.to_number() + 1"), "4.5");
    assert_eq!(eval("'hello'.replace('l', 'L')"), "heLLo");
}

#[test]
fn bytes_literals_and_methods() {
    assert_eq!(eval("b'abc'.length()"), "3");
    assert_eq!(eval("b'\\x41\\x42'.to_string()"), "AB");
    let source = "
var buf = bytes(2)
buf[0] = 65
buf[1] = 66
echo buf.to_string()
";
    assert_eq!(output(source), "AB\n");
}

#[test]
fn compound_assignment_targets() {
    let source = "
var n = 1
n += 4
echo n
var xs = [1, 2]
xs[0] += 10
echo xs
";
    assert_eq!(output(source), "5\n[11, 2]\n");
}

#[test]
fn list_holes_fill_with_empty() {
    let source = "
var xs = [1]
xs[3] = 4
echo xs.length()
echo xs[3]
";
    assert_eq!(output(source), "4\n4\n");
}

#[test]
fn print_is_unterminated_and_spaced() {
    assert_eq!(output("print('a', 1, true)"), "a 1 true");
}

#[test]
fn import_native_math() {
    let source = "
import math
echo math.floor(3.7)
echo math.sqrt(16)
";
    assert_eq!(output(source), "3\n4\n");
}

#[test]
fn import_member_extraction() {
    let source = "
import math { floor, sqrt }
echo floor(2.9) + sqrt(9)
";
    assert_eq!(output(source), "5\n");
}

#[test]
fn json_module_round_trip() {
    let source = "
import json
var decoded = json.decode('{\"a\": [1, 2], \"b\": \"x\"}')
echo decoded['a'][1]
echo json.encode([1, 'two', nil])
";
    assert_eq!(output(source), "2\n[1,\"two\",null]\n");
}

#[test]
fn base64_module() {
    let source = "
import base64
echo base64.encode('hello blade')
echo base64.decode('aGk=').to_string()
";
    assert_eq!(output(source), "aGVsbG8gYmxhZGU=\nhi\n");
}

#[test]
fn run_returns_trailing_expression() {
    let mut runtime = Runtime::new();
    let value = runtime.run("var x = 20\nx + 22").unwrap();
    assert!(matches!(value, Value::Number(n) if n == 42.0));
    // Globals persist across calls, like a REPL session.
    let again = runtime.run("x").unwrap();
    assert!(matches!(again, Value::Number(n) if n == 20.0));
}

#[test]
fn nested_closures_capture_through_levels() {
    let source = "
def outer() {
  var a = 1
  def middle() {
    def inner() { return a + 10 }
    return inner
  }
  return middle()
}
echo outer()()
";
    assert_eq!(output(source), "11\n");
}

#[test]
fn bound_builtin_methods_are_first_class() {
    let source = "
var up = 'hi'.upper
echo up()
";
    assert_eq!(output(source), "HI\n");
}

#[test]
fn raw_strings_skip_escapes_and_interpolation() {
    assert_eq!(eval(r"r'a\nb'"), "a\\nb");
}
