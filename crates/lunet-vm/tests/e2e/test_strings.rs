use crate::helpers::*;

#[test]
fn test_concat() {
    let (results, vm) = run_lua_vm("return 'hello' .. ' ' .. 'world'");
    assert_str(&results, 0, "hello world", &vm);
}

#[test]
fn test_concat_numbers() {
    let (results, vm) = run_lua_vm("local n = 4\nreturn 'x=' .. n, 1 .. 2");
    assert_str(&results, 0, "x=4", &vm);
    assert_str(&results, 1, "12", &vm);
}

#[test]
fn test_concat_right_associative() {
    let (results, vm) = run_lua_vm("return 'a' .. 'b' .. 'c' .. 'd'");
    assert_str(&results, 0, "abcd", &vm);
}

#[test]
fn test_concat_nil_errors() {
    let msg = run_lua_err("local x\nreturn 'a' .. x");
    assert!(msg.contains("attempt to concatenate a nil value"), "got: {msg}");
}

#[test]
fn test_length_operator() {
    run_check_nums("return #'hello', #''", &[5.0, 0.0]);
}

#[test]
fn test_string_equality_by_content() {
    let results = run_lua("return 'abc' == 'ab' .. 'c'");
    assert_bool(&results, 0, true);
}

#[test]
fn test_string_ordering() {
    let results = run_lua("return 'abc' < 'abd', 'Z' < 'a', 'abc' <= 'abc'");
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true); // byte order
    assert_bool(&results, 2, true);
}

#[test]
fn test_escapes() {
    run_check_nums("return #'a\\tb', #'\\065', #'\\\\'", &[3.0, 1.0, 1.0]);
}

#[test]
fn test_long_strings() {
    let (results, vm) = run_lua_vm("return [[line1\nline2]]");
    assert_str(&results, 0, "line1\nline2", &vm);
}

#[test]
fn test_tostring_of_values() {
    let (results, vm) = run_lua_vm("return tostring(nil), tostring(true), tostring(1.5)");
    assert_str(&results, 0, "nil", &vm);
    assert_str(&results, 1, "true", &vm);
    assert_str(&results, 2, "1.5", &vm);
}

#[test]
fn test_tonumber() {
    let results = run_lua("return tonumber('42'), tonumber('0x10'), tonumber('nope'), tonumber('ff', 16)");
    assert_num(&results, 0, 42.0);
    assert_num(&results, 1, 16.0);
    assert_nil(&results, 2);
    assert_num(&results, 3, 255.0);
}

#[test]
fn test_number_formatting_in_concat() {
    let (results, vm) = run_lua_vm("return '' .. 3, '' .. 2.5, '' .. -0.5");
    assert_str(&results, 0, "3", &vm);
    assert_str(&results, 1, "2.5", &vm);
    assert_str(&results, 2, "-0.5", &vm);
}

#[test]
fn test_type_names() {
    let (results, vm) = run_lua_vm(
        "return type(nil), type(true), type(1), type('s'), type({}), type(print)",
    );
    assert_str(&results, 0, "nil", &vm);
    assert_str(&results, 1, "boolean", &vm);
    assert_str(&results, 2, "number", &vm);
    assert_str(&results, 3, "string", &vm);
    assert_str(&results, 4, "table", &vm);
    assert_str(&results, 5, "function", &vm);
}
