use crate::helpers::*;

#[test]
fn test_pcall_catches_error() {
    let (results, vm) = run_lua_vm(
        r#"
local ok, msg = pcall(function() error("boom") end)
return ok, msg
"#,
    );
    assert_bool(&results, 0, false);
    let id = results[1].as_string_id().expect("message");
    assert!(vm.strings.get_str_lossy(id).contains("boom"));
    // Frame depth is fully restored after the protected call returns.
    assert!(vm.call_stack.is_empty());
}

#[test]
fn test_pcall_success_passes_results() {
    let results = run_lua("return pcall(function() return 1, 2 end)");
    assert_bool(&results, 0, true);
    assert_num(&results, 1, 1.0);
    assert_num(&results, 2, 2.0);
}

#[test]
fn test_pcall_forwards_arguments() {
    run_check_nums(
        "local _, r = pcall(function(a, b) return a * b end, 6, 7)\nreturn r",
        &[42.0],
    );
}

#[test]
fn test_error_message_carries_position() {
    let (results, vm) = run_lua_vm(
        "local ok, msg = pcall(function()\nerror('here')\nend)\nreturn msg",
    );
    let id = results[0].as_string_id().expect("message");
    let msg = vm.strings.get_str_lossy(id);
    assert!(msg.contains("test:2:"), "got: {msg}");
    assert!(msg.contains("here"));
}

#[test]
fn test_error_level_zero_is_raw() {
    let (results, vm) = run_lua_vm("local _, msg = pcall(function() error('raw', 0) end)\nreturn msg");
    assert_str(&results, 0, "raw", &vm);
}

#[test]
fn test_error_with_table_value() {
    run_check_nums(
        r#"
local ok, e = pcall(function() error({ code = 42 }) end)
if ok then return -1 end
return e.code
"#,
        &[42.0],
    );
}

#[test]
fn test_runtime_type_errors_are_catchable() {
    let (results, vm) = run_lua_vm(
        r#"
local ok1, m1 = pcall(function() local x return x + 1 end)
local ok2, m2 = pcall(function() local t return t.field end)
local ok3, m3 = pcall(function() local f return f() end)
return ok1, m1, ok2, m2, ok3, m3
"#,
    );
    assert_bool(&results, 0, false);
    assert_bool(&results, 2, false);
    assert_bool(&results, 4, false);
    let text = |i: usize| {
        let id = results[i].as_string_id().expect("message");
        vm.strings.get_str_lossy(id).into_owned()
    };
    assert!(text(1).contains("attempt to perform arithmetic on a nil value"));
    assert!(text(3).contains("attempt to index a nil value"));
    assert!(text(5).contains("attempt to call a nil value"));
}

#[test]
fn test_execution_continues_after_pcall() {
    run_check_nums(
        r#"
local caught = 0
for i = 1, 50 do
  local ok = pcall(function() error(i) end)
  if not ok then caught = caught + 1 end
end
return caught
"#,
        &[50.0],
    );
}

#[test]
fn test_nested_pcall() {
    let results = run_lua(
        r#"
local ok_outer, ok_inner, msg = pcall(function()
  return pcall(function() error("deep") end)
end)
return ok_outer, ok_inner
"#,
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
}

#[test]
fn test_xpcall_handler_transforms_error() {
    let (results, vm) = run_lua_vm(
        r#"
local ok, out = xpcall(
  function() error("oops") end,
  function(m) return "handled: " .. m end
)
return ok, out
"#,
    );
    assert_bool(&results, 0, false);
    let id = results[1].as_string_id().expect("message");
    let msg = vm.strings.get_str_lossy(id);
    assert!(msg.starts_with("handled: "), "got: {msg}");
    assert!(msg.contains("oops"));
}

#[test]
fn test_xpcall_success() {
    let results = run_lua("return xpcall(function() return 9 end, function() end)");
    assert_bool(&results, 0, true);
    assert_num(&results, 1, 9.0);
}

#[test]
fn test_error_in_error_handler() {
    let (results, vm) = run_lua_vm(
        r#"
local ok, msg = xpcall(
  function() error("first") end,
  function() error("second") end
)
return ok, msg
"#,
    );
    assert_bool(&results, 0, false);
    assert_str(&results, 1, "error in error handling", &vm);
}

#[test]
fn test_assert_message() {
    let (results, vm) = run_lua_vm("local _, msg = pcall(function() assert(false, 'custom') end)\nreturn msg");
    assert_str(&results, 0, "custom", &vm);
}

#[test]
fn test_assert_passes_through() {
    run_check_nums("return assert(41 + 1)", &[42.0]);
}

#[test]
fn test_uncaught_error_terminates() {
    let msg = run_lua_err("error('top level')");
    assert!(msg.contains("top level"), "got: {msg}");
}

#[test]
fn test_pcall_restores_depth_under_load() {
    let (results, vm) = run_lua_vm(
        r#"
local function risky(n)
  if n % 2 == 0 then error("even") end
  return n
end
local total = 0
for i = 1, 20 do
  local ok, v = pcall(risky, i)
  if ok then total = total + v end
end
return total
"#,
    );
    // 1 + 3 + ... + 19
    assert_num(&results, 0, 100.0);
    assert!(vm.call_stack.is_empty());
    assert!(vm.open_upvals.is_empty());
}

#[test]
fn test_upvalues_closed_during_unwind() {
    run_check_nums(
        r#"
local captured
pcall(function()
  local v = 5
  captured = function() return v end
  error("unwind")
end)
return captured()
"#,
        &[5.0],
    );
}
