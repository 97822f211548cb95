use crate::helpers::*;

#[test]
fn test_constant_expression() {
    run_check_nums("return 1 + 2 * 3", &[7.0]);
}

#[test]
fn test_runtime_arithmetic() {
    run_check_nums(
        "local a, b = 10, 3\nreturn a + b, a - b, a * b, a / b, a % b",
        &[13.0, 7.0, 30.0, 10.0 / 3.0, 1.0],
    );
}

#[test]
fn test_pow_right_associative() {
    run_check_nums("return 2 ^ 3 ^ 2", &[512.0]);
}

#[test]
fn test_unary_minus_binds_below_pow() {
    run_check_nums("return -2 ^ 2", &[-4.0]);
}

#[test]
fn test_floored_modulo() {
    run_check_nums(
        "local a, b = -7, 3\nreturn a % b, 7 % -3",
        &[2.0, -2.0],
    );
}

#[test]
fn test_division_by_zero_is_infinity() {
    let results = run_lua("local z = 0\nreturn 1 / z, -1 / z");
    assert_eq!(results[0].as_number(), Some(f64::INFINITY));
    assert_eq!(results[1].as_number(), Some(f64::NEG_INFINITY));
}

#[test]
fn test_zero_over_zero_is_nan() {
    let results = run_lua("local z = 0\nreturn 0 / z ~= 0 / z");
    assert_bool(&results, 0, true);
}

#[test]
fn test_string_coercion() {
    run_check_nums("return '10' + 5, '3' * '4'", &[15.0, 12.0]);
}

#[test]
fn test_pow_negative_base() {
    let results = run_lua("local e = 0.5\nreturn (-4) ^ e ~= (-4) ^ e");
    // NaN outside the real domain.
    assert_bool(&results, 0, true);
    run_check_nums("local b = -2\nreturn b ^ 3", &[-8.0]);
}

#[test]
fn test_comparisons() {
    let results = run_lua("return 1 < 2, 2 <= 2, 3 > 2, 2 >= 3, 1 == 1, 1 ~= 1");
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, true);
    assert_bool(&results, 3, false);
    assert_bool(&results, 4, true);
    assert_bool(&results, 5, false);
}

#[test]
fn test_comparison_in_condition() {
    run_check_nums(
        "local n = 7\nif n > 5 then return 1 else return 2 end",
        &[1.0],
    );
}

#[test]
fn test_equality_across_types() {
    let results = run_lua("return nil == false, 0 == '0', '1' == 1");
    assert_bool(&results, 0, false);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, false);
}

#[test]
fn test_arithmetic_type_error() {
    let msg = run_lua_err("local x = nil\nreturn x + 1");
    assert!(
        msg.contains("attempt to perform arithmetic on a nil value"),
        "got: {msg}"
    );
}

#[test]
fn test_compare_mixed_types_error() {
    let msg = run_lua_err("local s = 'a'\nreturn s < 1");
    assert!(msg.contains("attempt to compare"), "got: {msg}");
}

#[test]
fn test_unary_minus_on_string() {
    run_check_nums("return -'5'", &[-5.0]);
}
