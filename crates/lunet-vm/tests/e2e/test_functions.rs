use crate::helpers::*;

#[test]
fn test_simple_call() {
    run_check_nums(
        "local function double(n) return n * 2 end\nreturn double(21)",
        &[42.0],
    );
}

#[test]
fn test_multiple_returns() {
    run_check_nums(
        "local function f() return 1, 2, 3 end\nreturn f()",
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_multiple_assignment_from_call() {
    run_check_nums(
        "local function f() return 1, 2, 3 end\nlocal a, b = f()\nreturn a, b",
        &[1.0, 2.0],
    );
}

#[test]
fn test_missing_results_pad_nil() {
    let results = run_lua("local function f() return 1 end\nlocal a, b = f()\nreturn a, b");
    assert_num(&results, 0, 1.0);
    assert_nil(&results, 1);
}

#[test]
fn test_extra_arguments_dropped() {
    run_check_nums(
        "local function f(a, b) return a + b end\nreturn f(1, 2, 3, 4)",
        &[3.0],
    );
}

#[test]
fn test_missing_arguments_are_nil() {
    let results = run_lua("local function f(a, b) return b end\nreturn f(1)");
    assert_nil(&results, 0);
}

#[test]
fn test_varargs_basic() {
    run_check_nums(
        "local function f(...) return ... end\nreturn f(7, 8, 9)",
        &[7.0, 8.0, 9.0],
    );
}

#[test]
fn test_varargs_with_fixed_params() {
    run_check_nums(
        "local function f(a, ...) return a * 10, ... end\nreturn f(1, 2, 3)",
        &[10.0, 2.0, 3.0],
    );
}

#[test]
fn test_select_over_varargs() {
    run_check_nums(
        "local function f(...) return select('#', ...) end\nreturn f(), f(1), f(1, nil, 3)",
        &[0.0, 1.0, 3.0],
    );
}

#[test]
fn test_vararg_forwarding() {
    run_check_nums(
        r#"
local function inner(...) return select('#', ...) end
local function outer(...) return inner(...) end
return outer(1, 2, 3, 4)
"#,
        &[4.0],
    );
}

#[test]
fn test_method_call() {
    run_check_nums(
        r#"
local obj = { value = 42 }
function obj:get() return self.value end
return obj:get()
"#,
        &[42.0],
    );
}

#[test]
fn test_dotted_function_name() {
    run_check_nums(
        r#"
local m = {}
function m.helper(n) return n + 1 end
return m.helper(9)
"#,
        &[10.0],
    );
}

#[test]
fn test_fibonacci() {
    run_check_nums(
        r#"
local function fib(n)
  if n <= 1 then return n end
  return fib(n - 1) + fib(n - 2)
end
return fib(10)
"#,
        &[55.0],
    );
}

#[test]
fn test_tail_call_runs_in_constant_frames() {
    // A large self-tail-recursive iteration count completes without the
    // frame stack growing.
    let (results, vm) = run_lua_vm(
        r#"
local function loop(n)
  if n == 0 then return "done" end
  return loop(n - 1)
end
return loop(100000)
"#,
    );
    assert_str(&results, 0, "done", &vm);
    assert!(vm.call_stack.is_empty());
}

#[test]
fn test_mutual_tail_recursion() {
    let (results, vm) = run_lua_vm(
        r#"
local is_even, is_odd
function is_even(n)
  if n == 0 then return true end
  return is_odd(n - 1)
end
function is_odd(n)
  if n == 0 then return false end
  return is_even(n - 1)
end
return is_even(50000)
"#,
    );
    assert_bool(&results, 0, true);
    let _ = vm;
}

#[test]
fn test_deep_non_tail_recursion_overflows() {
    let msg = run_lua_err(
        r#"
local function down(n)
  return 1 + down(n + 1)
end
return down(0)
"#,
    );
    assert!(msg.contains("stack overflow"), "got: {msg}");
}

#[test]
fn test_call_nil_error() {
    let msg = run_lua_err("undefined_function()");
    assert!(msg.contains("attempt to call a nil value"), "got: {msg}");
}

#[test]
fn test_functions_are_values() {
    run_check_nums(
        r#"
local ops = {
  add = function(a, b) return a + b end,
  mul = function(a, b) return a * b end,
}
return ops.add(2, 3), ops.mul(2, 3)
"#,
        &[5.0, 6.0],
    );
}

#[test]
fn test_unpack_results() {
    run_check_nums("return unpack({4, 5, 6})", &[4.0, 5.0, 6.0]);
}

#[test]
fn test_paren_truncates_to_one_value() {
    run_check_nums(
        "local function f() return 1, 2, 3 end\nreturn (f())",
        &[1.0],
    );
}
