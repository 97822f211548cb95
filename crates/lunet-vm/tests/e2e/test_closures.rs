use crate::helpers::*;

#[test]
fn test_capture_by_reference() {
    // Captures are by reference: both closures observe the
    // same variable.
    run_check_nums(
        r#"
local x = 1
local function f() x = x + 1 return x end
f()
return f(), x
"#,
        &[3.0, 3.0],
    );
}

#[test]
fn test_sibling_closures_share_upvalue() {
    run_check_nums(
        r#"
local x = 1
local function inc() x = x + 1 end
local function get() return x end
inc()
inc()
return get()
"#,
        &[3.0],
    );
}

#[test]
fn test_counter_survives_frame() {
    run_check_nums(
        r#"
local function counter()
  local n = 0
  return function()
    n = n + 1
    return n
  end
end
local c = counter()
c()
c()
return c()
"#,
        &[3.0],
    );
}

#[test]
fn test_counters_are_independent() {
    run_check_nums(
        r#"
local function counter()
  local n = 0
  return function() n = n + 1 return n end
end
local a = counter()
local b = counter()
a() a() a()
b()
return a(), b()
"#,
        &[4.0, 2.0],
    );
}

#[test]
fn test_loop_iterations_capture_fresh_locals() {
    // Each iteration's `v` is a distinct variable; CLOSE promotes it when
    // the block exits.
    run_check_nums(
        r#"
local fs = {}
for i = 1, 3 do
  local v = i * 10
  fs[i] = function() return v end
end
return fs[1](), fs[2](), fs[3]()
"#,
        &[10.0, 20.0, 30.0],
    );
}

#[test]
fn test_while_loop_capture() {
    run_check_nums(
        r#"
local fs = {}
local i = 1
while i <= 2 do
  local v = i
  fs[i] = function() return v end
  i = i + 1
end
return fs[1](), fs[2]()
"#,
        &[1.0, 2.0],
    );
}

#[test]
fn test_nested_capture_through_two_levels() {
    run_check_nums(
        r#"
local x = 5
local function outer()
  local function inner()
    return x + 1
  end
  return inner()
end
return outer()
"#,
        &[6.0],
    );
}

#[test]
fn test_upvalue_written_through_inner() {
    run_check_nums(
        r#"
local acc = 0
local function add(n)
  local function bump() acc = acc + n end
  bump()
end
add(3)
add(4)
return acc
"#,
        &[7.0],
    );
}

#[test]
fn test_parameter_captured() {
    run_check_nums(
        r#"
local function make_adder(n)
  return function(x) return x + n end
end
local add2 = make_adder(2)
local add10 = make_adder(10)
return add2(5), add10(5)
"#,
        &[7.0, 15.0],
    );
}

#[test]
fn test_break_closes_captured_locals() {
    run_check_nums(
        r#"
local f
while true do
  local v = 99
  f = function() return v end
  break
end
return f()
"#,
        &[99.0],
    );
}

#[test]
fn test_recursion_through_local_function() {
    run_check_nums(
        r#"
local function fact(n)
  if n <= 1 then return 1 end
  return n * fact(n - 1)
end
return fact(6)
"#,
        &[720.0],
    );
}
