use crate::helpers::*;

#[test]
fn test_index_function_called_once_with_table_and_key() {
    // A missing key invokes the __index function exactly once, with the
    // table and the key as arguments.
    let (results, vm) = run_lua_vm(
        r#"
local calls, seen_t, seen_k = 0, nil, nil
local t = setmetatable({}, { __index = function(tbl, key)
  calls = calls + 1
  seen_t, seen_k = tbl, key
  return "fallback"
end })
local v = t.missing
return v, calls, seen_t == t, seen_k
"#,
    );
    assert_str(&results, 0, "fallback", &vm);
    assert_num(&results, 1, 1.0);
    assert_bool(&results, 2, true);
    assert_str(&results, 3, "missing", &vm);
}

#[test]
fn test_index_not_consulted_for_present_keys() {
    run_check_nums(
        r#"
local calls = 0
local t = setmetatable({ here = 7 }, { __index = function()
  calls = calls + 1
end })
local v = t.here
return v, calls
"#,
        &[7.0, 0.0],
    );
}

#[test]
fn test_index_table_chain() {
    run_check_nums(
        r#"
local grandparent = { answer = 42 }
local parent = setmetatable({}, { __index = grandparent })
local child = setmetatable({}, { __index = parent })
return child.answer
"#,
        &[42.0],
    );
}

#[test]
fn test_newindex_diverts_writes() {
    run_check_nums(
        r#"
local log = {}
local t = setmetatable({}, { __newindex = function(tbl, k, v)
  log[k] = v
end })
t.x = 5
return log.x, rawget(t, 'x') == nil and 1 or 0
"#,
        &[5.0, 1.0],
    );
}

#[test]
fn test_newindex_skipped_for_existing_keys() {
    run_check_nums(
        r#"
local t = setmetatable({ x = 1 }, { __newindex = function() error("blocked") end })
t.x = 2
return t.x
"#,
        &[2.0],
    );
}

#[test]
fn test_arithmetic_metamethods() {
    run_check_nums(
        r#"
local mt = {
  __add = function(a, b) return a.v + b.v end,
  __mul = function(a, b) return a.v * b.v end,
  __unm = function(a) return -a.v end,
}
local a = setmetatable({ v = 3 }, mt)
local b = setmetatable({ v = 4 }, mt)
return a + b, a * b, -a
"#,
        &[7.0, 12.0, -3.0],
    );
}

#[test]
fn test_add_tries_right_operand() {
    run_check_nums(
        r#"
local mt = { __add = function(a, b)
  if type(a) == 'number' then return a + b.v end
  return a.v + b
end }
local obj = setmetatable({ v = 10 }, mt)
return 1 + obj, obj + 1
"#,
        &[11.0, 11.0],
    );
}

#[test]
fn test_eq_metamethod() {
    let results = run_lua(
        r#"
local mt = { __eq = function(a, b) return a.id == b.id end }
local a = setmetatable({ id = 1 }, mt)
local b = setmetatable({ id = 1 }, mt)
local c = setmetatable({ id = 2 }, mt)
return a == b, a == c, a ~= c
"#,
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, true);
}

#[test]
fn test_eq_not_consulted_across_types() {
    let results = run_lua(
        r#"
local mt = { __eq = function() return true end }
local a = setmetatable({}, mt)
return a == 1, a == "x"
"#,
    );
    assert_bool(&results, 0, false);
    assert_bool(&results, 1, false);
}

#[test]
fn test_lt_and_le_metamethods() {
    let results = run_lua(
        r#"
local mt = {
  __lt = function(a, b) return a.v < b.v end,
  __le = function(a, b) return a.v <= b.v end,
}
local small = setmetatable({ v = 1 }, mt)
local big = setmetatable({ v = 2 }, mt)
return small < big, big < small, small <= small, big > small
"#,
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, true);
    assert_bool(&results, 3, true);
}

#[test]
fn test_le_falls_back_to_negated_lt() {
    let results = run_lua(
        r#"
local mt = { __lt = function(a, b) return a.v < b.v end }
local small = setmetatable({ v = 1 }, mt)
local big = setmetatable({ v = 2 }, mt)
return small <= big, big <= small
"#,
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
}

#[test]
fn test_call_metamethod() {
    run_check_nums(
        r#"
local callable = setmetatable({ bias = 10 }, {
  __call = function(self, n) return self.bias + n end,
})
return callable(5)
"#,
        &[15.0],
    );
}

#[test]
fn test_concat_metamethod() {
    let (results, vm) = run_lua_vm(
        r#"
local mt = { __concat = function(a, b)
  local left = type(a) == 'table' and a.name or a
  local right = type(b) == 'table' and b.name or b
  return left .. "|" .. right
end }
local obj = setmetatable({ name = "obj" }, mt)
return "x" .. obj, obj .. "y"
"#,
    );
    assert_str(&results, 0, "x|obj", &vm);
    assert_str(&results, 1, "obj|y", &vm);
}

#[test]
fn test_len_on_tables_is_raw() {
    // In 5.1 the length operator does not consult table metatables.
    run_check_nums(
        "local t = setmetatable({1, 2}, { __len = function() return 99 end })\nreturn #t",
        &[2.0],
    );
}

#[test]
fn test_tostring_metamethod() {
    let (results, vm) = run_lua_vm(
        r#"
local obj = setmetatable({}, { __tostring = function() return "pretty" end })
return tostring(obj), tostring(12)
"#,
    );
    assert_str(&results, 0, "pretty", &vm);
    assert_str(&results, 1, "12", &vm);
}

#[test]
fn test_metatable_protection() {
    let results = run_lua(
        r#"
local t = setmetatable({}, { __metatable = "locked" })
local shadow = getmetatable(t)
local ok = pcall(setmetatable, t, {})
return shadow == "locked", ok
"#,
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
}

#[test]
fn test_metamethod_cycle_hits_loop_guard() {
    let msg = run_lua_err(
        r#"
local t = {}
setmetatable(t, { __index = t })
return t.x
"#,
    );
    assert!(msg.contains("loop in gettable"), "got: {msg}");
}

#[test]
fn test_globals_respect_env_metatable() {
    // Globals resolve through the environment table, so its metatable
    // participates.
    run_check_nums(
        r#"
setmetatable(_G, { __index = function(_, k) return 123 end })
return totally_undefined
"#,
        &[123.0],
    );
}

#[test]
fn test_rawget_bypasses_index() {
    let results = run_lua(
        r#"
local t = setmetatable({}, { __index = function() return "shadow" end })
return rawget(t, 'k') == nil, t.k
"#,
    );
    assert_bool(&results, 0, true);
}
