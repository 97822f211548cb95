use crate::helpers::*;

#[test]
fn test_if_elseif_else() {
    let src = |n: i32| {
        format!(
            r#"
local n = {n}
if n < 10 then return "small"
elseif n < 100 then return "medium"
else return "large" end
"#
        )
    };
    let (r, vm) = run_lua_vm(&src(5));
    assert_str(&r, 0, "small", &vm);
    let (r, vm) = run_lua_vm(&src(50));
    assert_str(&r, 0, "medium", &vm);
    let (r, vm) = run_lua_vm(&src(500));
    assert_str(&r, 0, "large", &vm);
}

#[test]
fn test_while_loop() {
    run_check_nums(
        "local n, sum = 1, 0\nwhile n <= 10 do sum = sum + n n = n + 1 end\nreturn sum",
        &[55.0],
    );
}

#[test]
fn test_while_break() {
    run_check_nums(
        r#"
local n = 0
while true do
  n = n + 1
  if n == 7 then break end
end
return n
"#,
        &[7.0],
    );
}

#[test]
fn test_repeat_until() {
    run_check_nums(
        "local n = 0\nrepeat n = n + 1 until n >= 5\nreturn n",
        &[5.0],
    );
}

#[test]
fn test_repeat_condition_sees_block_local() {
    run_check_nums(
        r#"
local n = 0
repeat
  n = n + 1
  local done = n >= 3
until done
return n
"#,
        &[3.0],
    );
}

#[test]
fn test_numeric_for() {
    run_check_nums(
        "local sum = 0\nfor i = 1, 10 do sum = sum + i end\nreturn sum",
        &[55.0],
    );
}

#[test]
fn test_numeric_for_step() {
    run_check_nums(
        "local sum = 0\nfor i = 10, 1, -2 do sum = sum + i end\nreturn sum",
        &[30.0],
    );
}

#[test]
fn test_numeric_for_never_entered() {
    run_check_nums(
        "local sum = 0\nfor i = 5, 1 do sum = sum + i end\nreturn sum",
        &[0.0],
    );
}

#[test]
fn test_numeric_for_fractional_step() {
    run_check_nums(
        "local count = 0\nfor i = 0, 1, 0.25 do count = count + 1 end\nreturn count",
        &[5.0],
    );
}

#[test]
fn test_for_loop_variable_not_visible_after() {
    // The loop variable is scoped to the body; the outer `i` is intact.
    run_check_nums(
        "local i = 99\nfor i = 1, 3 do end\nreturn i",
        &[99.0],
    );
}

#[test]
fn test_for_step_must_be_number() {
    let msg = run_lua_err("for i = 1, 2, {} do end");
    assert!(msg.contains("'for' step must be a number"), "got: {msg}");
}

#[test]
fn test_for_initial_value_error() {
    let msg = run_lua_err("local t = {}\nfor i = t, 2 do end");
    assert!(msg.contains("'for' initial value must be a number"), "got: {msg}");
}

#[test]
fn test_generic_for_with_numeric_iterator() {
    run_check_nums(
        r#"
local function iter(limit, n)
  if n < limit then return n + 1 end
end
local sum = 0
for n in iter, 5, 0 do sum = sum + n end
return sum
"#,
        &[15.0],
    );
}

#[test]
fn test_and_or_select_values() {
    let results = run_lua("return (nil or 5), (false and 7), (1 and 2), (nil and 1)");
    assert_num(&results, 0, 5.0);
    assert_bool(&results, 1, false);
    assert_num(&results, 2, 2.0);
    assert_nil(&results, 3);
}

#[test]
fn test_short_circuit_skips_evaluation() {
    run_check_nums(
        r#"
local calls = 0
local function bump() calls = calls + 1 return true end
local _ = false and bump()
local _ = true or bump()
return calls
"#,
        &[0.0],
    );
}

#[test]
fn test_not_operator() {
    let results = run_lua("local z = 0\nreturn not nil, not z, not 'x'");
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, false);
}

#[test]
fn test_nested_loops_with_break() {
    run_check_nums(
        r#"
local hits = 0
for i = 1, 3 do
  for j = 1, 3 do
    if j == 2 then break end
    hits = hits + 1
  end
end
return hits
"#,
        &[3.0],
    );
}

#[test]
fn test_complex_condition() {
    run_check_nums(
        r#"
local a, b, c = 1, nil, 3
if (a and not b) and (c > 2 or a == 0) then return 1 end
return 0
"#,
        &[1.0],
    );
}
