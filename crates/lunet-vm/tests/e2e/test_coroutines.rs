use crate::helpers::*;

#[test]
fn test_resume_yield_resume() {
    // Values flow in through resume and out through yield; resuming a
    // dead coroutine reports failure.
    let (results, vm) = run_lua_vm(
        r#"
local co = coroutine.create(function(a)
  local b = coroutine.yield(a + 1)
  return b * 2
end)
local ok1, v1 = coroutine.resume(co, 5)
local ok2, v2 = coroutine.resume(co, 10)
local ok3, msg = coroutine.resume(co)
return ok1, v1, ok2, v2, ok3, msg
"#,
    );
    assert_bool(&results, 0, true);
    assert_num(&results, 1, 6.0);
    assert_bool(&results, 2, true);
    assert_num(&results, 3, 20.0);
    assert_bool(&results, 4, false);
    assert_str(&results, 5, "cannot resume dead coroutine", &vm);
}

#[test]
fn test_multiple_values_both_directions() {
    run_check_nums(
        r#"
local co = coroutine.create(function(a, b)
  local c, d = coroutine.yield(a + b)
  return c + d
end)
local _, s = coroutine.resume(co, 1, 2)
local _, t = coroutine.resume(co, 10, 20)
return s, t
"#,
        &[3.0, 30.0],
    );
}

#[test]
fn test_status_transitions() {
    let (results, vm) = run_lua_vm(
        r#"
local co = coroutine.create(function()
  coroutine.yield()
end)
local before = coroutine.status(co)
coroutine.resume(co)
local mid = coroutine.status(co)
coroutine.resume(co)
local after = coroutine.status(co)
return before, mid, after
"#,
    );
    assert_str(&results, 0, "suspended", &vm);
    assert_str(&results, 1, "suspended", &vm);
    assert_str(&results, 2, "dead", &vm);
}

#[test]
fn test_status_running_inside() {
    let (results, vm) = run_lua_vm(
        r#"
local co
co = coroutine.create(function()
  return coroutine.status(co)
end)
local _, status = coroutine.resume(co)
return status
"#,
    );
    assert_str(&results, 0, "running", &vm);
}

#[test]
fn test_running_identity() {
    let results = run_lua(
        r#"
local co
co = coroutine.create(function()
  return coroutine.running() == co
end)
local _, same = coroutine.resume(co)
return same, coroutine.running() == nil
"#,
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
}

#[test]
fn test_error_kills_coroutine() {
    let (results, vm) = run_lua_vm(
        r#"
local co = coroutine.create(function()
  error("pow")
end)
local ok, msg = coroutine.resume(co)
return ok, msg, coroutine.status(co)
"#,
    );
    assert_bool(&results, 0, false);
    let id = results[1].as_string_id().expect("message");
    assert!(vm.strings.get_str_lossy(id).contains("pow"));
    assert_str(&results, 2, "dead", &vm);
}

#[test]
fn test_wrap_generator() {
    run_check_nums(
        r#"
local gen = coroutine.wrap(function()
  coroutine.yield(1)
  coroutine.yield(2)
  return 3
end)
return gen(), gen(), gen()
"#,
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_wrap_raises_errors() {
    let results = run_lua(
        r#"
local gen = coroutine.wrap(function()
  error("bad generator")
end)
local ok, msg = pcall(gen)
return ok, msg
"#,
    );
    assert_bool(&results, 0, false);
}

#[test]
fn test_wrap_as_iterator() {
    run_check_nums(
        r#"
local function range(n)
  return coroutine.wrap(function()
    for i = 1, n do coroutine.yield(i) end
  end)
end
local sum = 0
for x in range(4) do sum = sum + x end
return sum
"#,
        &[10.0],
    );
}

#[test]
fn test_yield_in_tail_position() {
    run_check_nums(
        r#"
local co = coroutine.create(function()
  return coroutine.yield(1)
end)
local _, first = coroutine.resume(co)
local ok, second = coroutine.resume(co, 42)
return first, second
"#,
        &[1.0, 42.0],
    );
}

#[test]
fn test_yield_from_main_thread_errors() {
    let msg = run_lua_err("coroutine.yield()");
    assert!(msg.contains("outside a coroutine"), "got: {msg}");
}

#[test]
fn test_yield_across_native_boundary_errors() {
    // The iterator call in a generic for is a native boundary; yielding
    // through it cannot work.
    let (results, vm) = run_lua_vm(
        r#"
local co = coroutine.create(function()
  for _ in function() return coroutine.yield() end do end
end)
local ok, msg = coroutine.resume(co)
return ok, msg
"#,
    );
    assert_bool(&results, 0, false);
    let id = results[1].as_string_id().expect("message");
    assert!(
        vm.strings.get_str_lossy(id).contains("boundary"),
        "got: {}",
        vm.strings.get_str_lossy(id)
    );
}

#[test]
fn test_nested_coroutines() {
    run_check_nums(
        r#"
local inner = coroutine.create(function()
  coroutine.yield(10)
  return 20
end)
local outer = coroutine.create(function()
  local _, a = coroutine.resume(inner)
  coroutine.yield(a + 1)
  local _, b = coroutine.resume(inner)
  return b + 1
end)
local _, x = coroutine.resume(outer)
local _, y = coroutine.resume(outer)
return x, y
"#,
        &[11.0, 21.0],
    );
}

#[test]
fn test_coroutines_share_globals() {
    run_check_nums(
        r#"
shared = 0
local co = coroutine.create(function()
  shared = shared + 5
end)
coroutine.resume(co)
return shared
"#,
        &[5.0],
    );
}

#[test]
fn test_coroutine_keeps_own_locals() {
    run_check_nums(
        r#"
local function body()
  local count = 0
  while true do
    count = count + 1
    coroutine.yield(count)
  end
end
local a = coroutine.create(body)
local b = coroutine.create(body)
local _, a1 = coroutine.resume(a)
local _, a2 = coroutine.resume(a)
local _, b1 = coroutine.resume(b)
return a1, a2, b1
"#,
        &[1.0, 2.0, 1.0],
    );
}

#[test]
fn test_closure_created_inside_coroutine_usable_outside() {
    run_check_nums(
        r#"
local co = coroutine.create(function()
  local n = 7
  coroutine.yield(function() return n end)
end)
local _, f = coroutine.resume(co)
return f()
"#,
        &[7.0],
    );
}

#[test]
fn test_resume_non_function_fails_at_create() {
    let msg = run_lua_err("coroutine.create(42)");
    assert!(msg.contains("function expected"), "got: {msg}");
}
