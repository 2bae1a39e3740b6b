/// End-to-end execution tests through the public context API.
///
/// These cover:
///   • Arithmetic fast paths and string concatenation
///   • Recursion, closures and register promotion
///   • Fast-array growth, property and accessor dispatch
///   • try/catch unwinding and strict-mode runtime errors
///   • for-in / for-of, switch, labels, generators, promises
use quark::context::Context;
use quark::errors::EngineError;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn eval_str(ctx: &mut Context, src: &str) -> String {
    let value = ctx.eval(src).expect("script should succeed");
    ctx.to_display_string(value).expect("displayable result")
}

fn eval_one(src: &str) -> String {
    let mut ctx = Context::with_default_options();
    eval_str(&mut ctx, src)
}

fn eval_err(src: &str) -> (String, String) {
    let mut ctx = Context::with_default_options();
    match ctx.eval(src) {
        Err(EngineError::Uncaught { class, message }) => (class, message),
        other => panic!("expected an uncaught error, got {other:?}"),
    }
}

// ─── Literal scenarios ────────────────────────────────────────────────────────

#[test]
fn test_small_int_arithmetic() {
    assert_eq!(eval_one("var x = 1 + 2; x * 10;"), "30");
}

#[test]
fn test_recursive_factorial() {
    assert_eq!(
        eval_one("function f(n) { return n <= 1 ? 1 : n * f(n - 1); } f(6);"),
        "720"
    );
}

#[test]
fn test_fast_array_growth() {
    assert_eq!(
        eval_one("var a = []; for (var i = 0; i < 1000; i++) a.push(i); a.length;"),
        "1000"
    );
}

#[test]
fn test_try_catch_property_access() {
    assert_eq!(eval_one("try { throw { m: \"x\" }; } catch (e) { e.m; }"), "x");
}

#[test]
fn test_accessor_in_object_literal() {
    assert_eq!(eval_one("({ get x() { return 42; } }).x;"), "42");
}

#[test]
fn test_string_concat_length() {
    assert_eq!(eval_one("var s = \"ab\" + \"cd\"; s.length;"), "4");
}

#[test]
fn test_strict_undeclared_assignment() {
    let (class, _) = eval_err("\"use strict\"; a = 1;");
    assert_eq!(class, "ReferenceError");
}

// ─── Expressions and operators ────────────────────────────────────────────────

#[test]
fn test_numeric_semantics() {
    assert_eq!(eval_one("0.1 + 0.2 === 0.3;"), "false");
    assert_eq!(eval_one("1 / 0;"), "Infinity");
    assert_eq!(eval_one("0 / 0 === 0 / 0;"), "false", "NaN is never equal to itself");
    assert_eq!(eval_one("1 / -0;"), "-Infinity", "-0 survives the number model");
    assert_eq!(eval_one("2147483647 + 1;"), "2147483648", "small-int overflow widens");
}

#[test]
fn test_loose_vs_strict_equality() {
    assert_eq!(eval_one("1 == \"1\";"), "true");
    assert_eq!(eval_one("1 === \"1\";"), "false");
    assert_eq!(eval_one("null == undefined;"), "true");
    assert_eq!(eval_one("null === undefined;"), "false");
    assert_eq!(eval_one("\"abc\" === \"ab\" + \"c\";"), "true");
}

#[test]
fn test_bitwise_and_shifts() {
    assert_eq!(eval_one("(0xF0 | 0x0F) & 0xFF;"), "255");
    assert_eq!(eval_one("1 << 31;"), "-2147483648");
    assert_eq!(eval_one("-1 >>> 28;"), "15");
    assert_eq!(eval_one("~5;"), "-6");
}

#[test]
fn test_logical_shortcuts() {
    assert_eq!(eval_one("var n = 0; function bump() { n++; return true; } false && bump(); n;"), "0");
    assert_eq!(eval_one("1 || 2;"), "1");
    assert_eq!(eval_one("0 || 2;"), "2");
    assert_eq!(eval_one("null ?? \"fallback\";"), "fallback");
    assert_eq!(eval_one("0 ?? \"fallback\";"), "0", "?? only reacts to nullish");
}

#[test]
fn test_update_and_compound_assignment() {
    assert_eq!(eval_one("var i = 5; i++ + i;"), "11");
    assert_eq!(eval_one("var i = 5; ++i + i;"), "12");
    assert_eq!(eval_one("var o = { n: 3 }; o.n += 4; o.n;"), "7");
    assert_eq!(eval_one("var a = [1]; a[0] *= 8; a[0];"), "8");
}

#[test]
fn test_typeof_and_void() {
    assert_eq!(eval_one("typeof 1;"), "number");
    assert_eq!(eval_one("typeof \"s\";"), "string");
    assert_eq!(eval_one("typeof undefined;"), "undefined");
    assert_eq!(eval_one("typeof null;"), "object");
    assert_eq!(eval_one("typeof function () {};"), "function");
    assert_eq!(eval_one("typeof missing;"), "undefined", "typeof never throws on unresolved");
    assert_eq!(eval_one("void 42;"), "undefined");
}

#[test]
fn test_conditional_and_sequence() {
    assert_eq!(eval_one("(1, 2, 3);"), "3");
    assert_eq!(eval_one("true ? \"a\" : \"b\";"), "a");
}

#[test]
fn test_template_literals() {
    assert_eq!(eval_one("var n = 6; `n=${n * 7}!`;"), "n=42!");
    assert_eq!(eval_one("`${1}${2}`;"), "12");
}

// ─── Bindings and scope ───────────────────────────────────────────────────────

#[test]
fn test_closures_capture_environment() {
    assert_eq!(
        eval_one(
            "function make(x) { return function (y) { return x + y; }; } \
             var add5 = make(5); add5(10);"
        ),
        "15"
    );
    assert_eq!(
        eval_one(
            "function counter() { var n = 0; return function () { return ++n; }; } \
             var c = counter(); c(); c(); c();"
        ),
        "3"
    );
}

#[test]
fn test_let_const_block_scope() {
    assert_eq!(eval_one("var x = 1; { let x = 2; } x;"), "1");
    let (class, _) = eval_err("{ const c = 1; c = 2; }");
    assert_eq!(class, "TypeError");
    let (class, _) = eval_err("{ let t = u; let u = 1; }");
    assert_eq!(class, "ReferenceError");
}

#[test]
fn test_arguments_object() {
    assert_eq!(
        eval_one("function f() { return arguments.length + arguments[0]; } f(10, 20);"),
        "12"
    );
}

#[test]
fn test_rest_parameters() {
    assert_eq!(
        eval_one("function f(a, ...rest) { return rest.length; } f(1, 2, 3, 4);"),
        "3"
    );
}

#[test]
fn test_arrow_functions_and_this() {
    assert_eq!(eval_one("var f = (a, b) => a * b; f(6, 7);"), "42");
    assert_eq!(
        eval_one(
            "var o = { n: 40, get: function () { var f = () => this.n + 2; return f(); } }; \
             o.get();"
        ),
        "42"
    );
}

#[test]
fn test_hoisted_function_declarations() {
    assert_eq!(eval_one("var r = early(); function early() { return \"ok\"; } r;"), "ok");
}

// ─── Control flow ─────────────────────────────────────────────────────────────

#[test]
fn test_loops() {
    assert_eq!(eval_one("var s = 0; for (var i = 1; i <= 10; i++) s += i; s;"), "55");
    assert_eq!(eval_one("var n = 0; while (n < 5) n++; n;"), "5");
    assert_eq!(eval_one("var n = 10; do { n++; } while (false); n;"), "11");
}

#[test]
fn test_break_continue_labels() {
    assert_eq!(
        eval_one("var s = 0; for (var i = 0; i < 10; i++) { if (i === 5) break; s += i; } s;"),
        "10"
    );
    assert_eq!(
        eval_one("var s = 0; for (var i = 0; i < 5; i++) { if (i % 2) continue; s += i; } s;"),
        "6"
    );
    assert_eq!(
        eval_one(
            "var hits = 0; \
             outer: for (var i = 0; i < 3; i++) { \
               for (var j = 0; j < 3; j++) { if (j === 1) continue outer; hits++; } \
             } hits;"
        ),
        "3"
    );
}

#[test]
fn test_switch_fallthrough_and_default() {
    let src = "function pick(v) { \
                 var out = \"\"; \
                 switch (v) { \
                   case 1: out += \"one \"; \
                   case 2: out += \"two\"; break; \
                   default: out = \"other\"; \
                 } return out; }";
    assert_eq!(eval_one(&format!("{src} pick(1);")), "one two");
    assert_eq!(eval_one(&format!("{src} pick(2);")), "two");
    assert_eq!(eval_one(&format!("{src} pick(9);")), "other");
}

#[test]
fn test_for_in_enumerates_keys() {
    assert_eq!(
        eval_one("var ks = \"\"; var o = { a: 1, b: 2 }; for (var k in o) ks += k; ks;"),
        "ab"
    );
    assert_eq!(
        eval_one("var s = 0; var a = [10, 20, 30]; for (var i in a) s += a[i]; s;"),
        "60"
    );
}

#[test]
fn test_for_of_iterates_values() {
    assert_eq!(eval_one("var s = 0; for (var v of [1, 2, 3]) s += v; s;"), "6");
    assert_eq!(eval_one("var out = \"\"; for (var c of \"abc\") out = c + out; out;"), "cba");
}

// ─── Exceptions ───────────────────────────────────────────────────────────────

#[test]
fn test_finally_runs_on_both_paths() {
    // Normal first try: "t" then its finally "f". Second try: the throw
    // unwinds to the catch ("c", not straight to finally), and the catch's
    // normal completion still runs the finally ("F").
    assert_eq!(
        eval_one(
            "var log = \"\"; \
             try { log += \"t\"; } finally { log += \"f\"; } \
             try { throw 1; } catch (e) { log += \"c\"; } finally { log += \"F\"; } log;"
        ),
        "tfcF"
    );
}

#[test]
fn test_finally_only_rethrows_to_outer_catch() {
    assert_eq!(
        eval_one(
            "var log = \"\"; \
             try { try { throw \"x\"; } finally { log += \"f\"; } } \
             catch (e) { log += e; } log;"
        ),
        "fx"
    );
}

#[test]
fn test_throw_in_catch_still_runs_finally() {
    assert_eq!(
        eval_one(
            "var log = \"\"; \
             try { \
               try { throw \"a\"; } catch (e) { log += e; throw \"b\"; } \
               finally { log += \"f\"; } \
             } catch (e) { log += e; } log;"
        ),
        "afb"
    );
}

#[test]
fn test_break_runs_pending_finally() {
    assert_eq!(
        eval_one(
            "var log = \"\"; \
             for (var i = 0; i < 3; i++) { \
               try { if (i === 1) break; log += i; } finally { log += \"f\"; } \
             } log;"
        ),
        "0ff"
    );
}

#[test]
fn test_continue_runs_pending_finally() {
    assert_eq!(
        eval_one(
            "var log = \"\"; \
             for (var i = 0; i < 3; i++) { \
               try { if (i !== 1) continue; log += i; } finally { log += \"f\"; } \
             } log;"
        ),
        "f1ff"
    );
}

#[test]
fn test_labeled_break_crosses_intervening_finally() {
    assert_eq!(
        eval_one(
            "var log = \"\"; \
             outer: for (var i = 0; i < 2; i++) { \
               try { \
                 for (var j = 0; j < 2; j++) { \
                   if (j === 1) break outer; \
                   log += j; \
                 } \
               } finally { log += \"f\"; } \
             } log;"
        ),
        "0f"
    );
}

#[test]
fn test_return_runs_pending_finally() {
    assert_eq!(
        eval_one(
            "var log = \"\"; \
             function f() { try { return \"r\"; } finally { log += \"F\"; } } \
             f() + log;"
        ),
        "rF"
    );
}

#[test]
fn test_nested_try_rethrow() {
    assert_eq!(
        eval_one(
            "var seen = \"\"; \
             try { try { throw \"inner\"; } catch (e) { seen += e; throw \"outer\"; } } \
             catch (e) { seen += e; } seen;"
        ),
        "innerouter"
    );
}

#[test]
fn test_error_classes_and_messages() {
    let (class, message) = eval_err("null.x;");
    assert_eq!(class, "TypeError");
    assert!(message.contains("null"), "message names the nullish base: {message}");

    let (class, _) = eval_err("missing();");
    assert_eq!(class, "ReferenceError");

    let (class, message) = eval_err("throw new RangeError(\"too big\");");
    assert_eq!(class, "RangeError");
    assert_eq!(message, "too big");
}

#[test]
fn test_call_stack_overflow_is_range_error() {
    let (class, message) = eval_err("function f() { return f(); } f();");
    assert_eq!(class, "RangeError");
    assert!(message.contains("call stack"));
}

#[test]
fn test_thrown_value_does_not_need_to_be_error() {
    assert_eq!(eval_one("try { throw 42; } catch (e) { e; }"), "42");
}

// ─── Objects and prototypes ───────────────────────────────────────────────────

#[test]
fn test_prototype_chain_through_new() {
    assert_eq!(
        eval_one(
            "function Point(x) { this.x = x; } \
             Point.prototype.double = function () { return this.x * 2; }; \
             new Point(21).double();"
        ),
        "42"
    );
}

#[test]
fn test_instanceof_and_in() {
    assert_eq!(eval_one("function A() {} new A() instanceof A;"), "true");
    assert_eq!(eval_one("\"a\" in { a: 1 };"), "true");
    assert_eq!(eval_one("\"b\" in { a: 1 };"), "false");
    assert_eq!(eval_one("0 in [7];"), "true");
}

#[test]
fn test_delete_and_redefinition() {
    assert_eq!(eval_one("var o = { a: 1 }; delete o.a; \"a\" in o;"), "false");
    assert_eq!(
        eval_one(
            "var o = {}; Object.defineProperty(o, \"k\", { value: 9, configurable: false }); \
             delete o.k; o.k;"
        ),
        "9",
        "non-configurable properties survive delete in sloppy mode"
    );
}

#[test]
fn test_getter_setter_dispatch() {
    assert_eq!(
        eval_one(
            "var store = 0; \
             var o = { get v() { return store; }, set v(x) { store = x * 2; } }; \
             o.v = 21; o.v;"
        ),
        "42"
    );
}

#[test]
fn test_object_builtins() {
    assert_eq!(eval_one("Object.keys({ a: 1, b: 2 }).join(\",\");"), "a,b");
    assert_eq!(eval_one("var p = {}; Object.getPrototypeOf(Object.create(p)) === p;"), "true");
    assert_eq!(eval_one("({}).hasOwnProperty(\"x\");"), "false");
    assert_eq!(eval_one("({x: 1}).hasOwnProperty(\"x\");"), "true");
}

#[test]
fn test_array_builtins() {
    assert_eq!(eval_one("[3, 1, 2].indexOf(2);"), "2");
    assert_eq!(eval_one("[1, 2, 3].slice(1).join(\"-\");"), "2-3");
    assert_eq!(eval_one("var a = [1, 2]; a.pop() + a.length;"), "3");
    assert_eq!(eval_one("Array.isArray([]);"), "true");
    assert_eq!(eval_one("Array.isArray({});"), "false");
    assert_eq!(eval_one("new Array(3).length;"), "3");
}

#[test]
fn test_string_builtins() {
    assert_eq!(eval_one("\"hello\".charAt(1);"), "e");
    assert_eq!(eval_one("\"hello\".indexOf(\"llo\");"), "2");
    assert_eq!(eval_one("\"hello\".slice(1, 3);"), "el");
    assert_eq!(eval_one("String.fromCharCode(113, 107);"), "qk");
    assert_eq!(eval_one("String(42);"), "42");
}

#[test]
fn test_number_conversions() {
    assert_eq!(eval_one("Number(\"42\") === 42;"), "true");
    assert_eq!(eval_one("Number(\"0x10\");"), "16");
    assert_eq!(eval_one("Number(\"12px\") === Number(\"12px\");"), "false", "NaN result");
    assert_eq!(eval_one("(255).toString(16);"), "ff");
    assert_eq!(eval_one("parseInt(\"  42abc\");"), "42");
    assert_eq!(eval_one("parseFloat(\"3.5rest\");"), "3.5");
    assert_eq!(eval_one("isNaN(\"not a number\");"), "true");
}

#[test]
fn test_math_builtins() {
    assert_eq!(eval_one("Math.floor(3.7);"), "3");
    assert_eq!(eval_one("Math.max(1, 9, 4);"), "9");
    assert_eq!(eval_one("Math.abs(-5);"), "5");
    assert_eq!(eval_one("Math.pow(2, 10);"), "1024");
    assert_eq!(eval_one("var r = Math.random(); r >= 0 && r < 1;"), "true");
}

#[test]
fn test_function_call_apply_bind() {
    let src = "function who() { return this.name; } var o = { name: \"w\" };";
    assert_eq!(eval_one(&format!("{src} who.call(o);")), "w");
    assert_eq!(eval_one(&format!("{src} who.apply(o, []);")), "w");
    assert_eq!(eval_one(&format!("{src} var b = who.bind(o); b();")), "w");
    assert_eq!(
        eval_one("function add(a, b) { return a + b; } add.bind(null, 40)(2);"),
        "42"
    );
}

// ─── Generators and promises ──────────────────────────────────────────────────

#[test]
fn test_generator_protocol() {
    assert_eq!(
        eval_one(
            "function* g() { yield 1; yield 2; } var it = g(); \
             it.next().value + it.next().value + (it.next().done ? 100 : 0);"
        ),
        "103"
    );
}

#[test]
fn test_generator_receives_sent_values() {
    assert_eq!(
        eval_one(
            "function* echo() { var got = yield \"first\"; yield got * 2; } \
             var it = echo(); it.next(); it.next(21).value;"
        ),
        "42"
    );
}

#[test]
fn test_generator_in_for_of() {
    assert_eq!(
        eval_one("function* seq() { yield 1; yield 2; yield 3; } \
                  var s = 0; for (var v of seq()) s += v; s;"),
        "6"
    );
}

#[test]
fn test_promise_then_runs_on_microtask_queue() {
    let mut ctx = Context::with_default_options();
    eval_str(&mut ctx, "var r = 0; Promise.resolve(5).then(function (v) { r = v * 2; });");
    assert_eq!(eval_str(&mut ctx, "r;"), "10");
}

#[test]
fn test_promise_rejection_reaches_catch() {
    let mut ctx = Context::with_default_options();
    eval_str(
        &mut ctx,
        "var r = \"\"; Promise.reject(\"no\").catch(function (e) { r = \"got:\" + e; });",
    );
    assert_eq!(eval_str(&mut ctx, "r;"), "got:no");
}

#[test]
fn test_async_function_resolves() {
    let mut ctx = Context::with_default_options();
    eval_str(
        &mut ctx,
        "var out = 0; \
         async function f() { var v = await 20; return v + 22; } \
         f().then(function (x) { out = x; });",
    );
    assert_eq!(eval_str(&mut ctx, "out;"), "42");
}

// ─── Memory behaviour ─────────────────────────────────────────────────────────

#[test]
fn test_dropped_objects_are_collected() {
    let mut ctx = Context::with_default_options();
    eval_str(&mut ctx, "1;");
    ctx.collect_garbage();
    let baseline = ctx.heap_stats().live_cells;

    eval_str(&mut ctx, "for (var i = 0; i < 10000; i++) { var o = { n: i, arr: [i] }; } 0;");
    ctx.collect_garbage();
    let after = ctx.heap_stats().live_cells;

    // Everything allocated in the loop is unreachable; only interned
    // literals and a couple of lazily materialised built-ins may remain.
    assert!(
        after <= baseline + 32,
        "live cells grew from {baseline} to {after}: loop garbage survived"
    );
}

#[test]
fn test_gc_survives_live_data() {
    let mut ctx = Context::with_default_options();
    eval_str(&mut ctx, "var keep = []; for (var i = 0; i < 100; i++) keep.push({ n: i });");
    ctx.collect_garbage();
    assert_eq!(eval_str(&mut ctx, "keep.length;"), "100");
    assert_eq!(eval_str(&mut ctx, "keep[99].n;"), "99");
}

#[test]
fn test_eval_builtin() {
    assert_eq!(eval_one("eval(\"1 + 2\") + 4;"), "7");
    assert_eq!(eval_one("eval(\"var inside = 5;\"); inside;"), "5");
}

#[test]
fn test_external_function_registration() {
    let mut ctx = Context::with_default_options();
    ctx.register_external_function(
        "hostDouble",
        std::rc::Rc::new(|ctx, _this, args| {
            let n = ctx.to_number(args.first().copied().unwrap_or(quark::Value::UNDEFINED))?;
            ctx.number_value(n * 2.0)
        }),
    )
    .expect("registration");
    assert_eq!(eval_str(&mut ctx, "hostDouble(21);"), "42");
}
