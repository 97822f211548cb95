use crate::helpers::*;

#[test]
fn test_set_get() {
    run_check_nums(
        "local t = {}\nt[1] = 10\nt.x = 20\nreturn t[1], t.x",
        &[10.0, 20.0],
    );
}

#[test]
fn test_nil_assignment_deletes() {
    let results = run_lua("local t = {}\nt[1] = 1\nt[1] = nil\nreturn t[1]");
    assert_nil(&results, 0);
}

#[test]
fn test_deleted_key_excluded_from_iteration() {
    run_check_nums(
        r#"
local t = { a = 1, b = 2, c = 3 }
t.b = nil
local count = 0
for k, v in pairs(t) do count = count + 1 end
return count
"#,
        &[2.0],
    );
}

#[test]
fn test_sequential_fill_and_length() {
    // Sequentially filled tables report their exact element count.
    run_check_nums(
        "local t = {}\nfor i = 1, 5 do t[i] = i * i end\nreturn t[3], #t",
        &[9.0, 5.0],
    );
}

#[test]
fn test_length_of_constructor() {
    run_check_nums("local t = {10, 20, 30}\nreturn #t", &[3.0]);
}

#[test]
fn test_border_property_with_holes() {
    // With holes any border is acceptable; assert the property itself.
    let results = run_lua(
        r#"
local t = {}
t[1] = 1
t[2] = 2
t[4] = 4
local n = #t
return (n == 0 or t[n] ~= nil), t[n + 1] == nil
"#,
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
}

#[test]
fn test_constructor_mixed_fields() {
    run_check_nums(
        "local t = {10, x = 20, [30] = 40, 50}\nreturn t[1], t.x, t[30], t[2]",
        &[10.0, 20.0, 40.0, 50.0],
    );
}

#[test]
fn test_constructor_expands_last_call() {
    run_check_nums(
        "local function f() return 2, 3 end\nlocal t = {1, f()}\nreturn #t, t[2], t[3]",
        &[3.0, 2.0, 3.0],
    );
}

#[test]
fn test_constructor_truncates_inner_call() {
    run_check_nums(
        "local function f() return 2, 3 end\nlocal t = {f(), 9}\nreturn #t, t[1], t[2]",
        &[2.0, 2.0, 9.0],
    );
}

#[test]
fn test_large_constructor_batches() {
    // Exercises more than one SETLIST flush.
    let elems: Vec<String> = (1..=120).map(|i| i.to_string()).collect();
    let src = format!(
        "local t = {{{}}}\nreturn #t, t[1], t[60], t[120]",
        elems.join(",")
    );
    run_check_nums(&src, &[120.0, 1.0, 60.0, 120.0]);
}

#[test]
fn test_nested_tables() {
    run_check_nums(
        "local t = { inner = { value = 42 } }\nreturn t.inner.value",
        &[42.0],
    );
}

#[test]
fn test_float_keys_match_integer_keys() {
    run_check_nums(
        "local t = {}\nt[2] = 7\nlocal k = 1.0 + 1.0\nreturn t[k]",
        &[7.0],
    );
}

#[test]
fn test_reverse_fill() {
    run_check_nums(
        "local t = {}\nfor i = 64, 1, -1 do t[i] = i end\nreturn #t, t[1], t[64]",
        &[64.0, 1.0, 64.0],
    );
}

#[test]
fn test_pairs_iterates_everything() {
    run_check_nums(
        r#"
local t = { 1, 2, 3, x = 10, y = 20 }
local sum = 0
for k, v in pairs(t) do sum = sum + v end
return sum
"#,
        &[36.0],
    );
}

#[test]
fn test_ipairs_stops_at_hole() {
    run_check_nums(
        r#"
local t = { 1, 2, 3 }
t[5] = 5
local sum = 0
for i, v in ipairs(t) do sum = sum + v end
return sum
"#,
        &[6.0],
    );
}

#[test]
fn test_next_directly() {
    let results = run_lua(
        r#"
local t = { 7 }
local k, v = next(t)
local k2 = next(t, k)
return k, v, k2 == nil
"#,
    );
    assert_num(&results, 0, 1.0);
    assert_num(&results, 1, 7.0);
    assert_bool(&results, 2, true);
}

#[test]
fn test_table_index_nil_error() {
    let msg = run_lua_err("local t = {}\nlocal k = nil\nt[k] = 1");
    assert!(msg.contains("table index is nil"), "got: {msg}");
}

#[test]
fn test_boolean_and_table_keys() {
    let (results, vm) = run_lua_vm(
        r#"
local t = {}
local key = {}
t[true] = 'yes'
t[key] = 'obj'
return t[true], t[key], t[{}] == nil
"#,
    );
    assert_str(&results, 0, "yes", &vm);
    assert_str(&results, 1, "obj", &vm);
    assert_bool(&results, 2, true);
}
