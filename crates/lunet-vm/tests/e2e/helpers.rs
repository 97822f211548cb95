use lunet_core::value::Value;
use lunet_vm::dispatch;
use lunet_vm::vm::Vm;

/// Compile and execute Lua source, returning the results and the VM for
/// further inspection.
pub fn run_lua_vm(source: &str) -> (Vec<Value>, Vm) {
    let mut vm = Vm::new();
    let chunk = vm
        .load_chunk(source.as_bytes(), "=test")
        .unwrap_or_else(|e| panic!("compile error: {e}"));
    let results = dispatch::call_function(&mut vm, chunk, &[])
        .unwrap_or_else(|e| panic!("runtime error: {e}"));
    (results, vm)
}

/// Compile and execute Lua source, returning the result values.
pub fn run_lua(source: &str) -> Vec<Value> {
    run_lua_vm(source).0
}

/// Compile and execute Lua source, expecting a runtime error; returns its
/// message.
pub fn run_lua_err(source: &str) -> String {
    let mut vm = Vm::new();
    let chunk = vm
        .load_chunk(source.as_bytes(), "=test")
        .unwrap_or_else(|e| panic!("compile error: {e}"));
    match dispatch::call_function(&mut vm, chunk, &[]) {
        Err(e) => {
            let v = e.into_value(&mut vm.strings);
            match v {
                Value::String(id) => vm.strings.get_str_lossy(id).into_owned(),
                other => format!("{other:?}"),
            }
        }
        Ok(vals) => panic!("expected error, got {} results: {vals:?}", vals.len()),
    }
}

/// Check that results[idx] is a number with the expected value.
pub fn assert_num(results: &[Value], idx: usize, expected: f64) {
    let got = results
        .get(idx)
        .and_then(Value::as_number)
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected number {expected}", results.get(idx)));
    assert!(
        (got - expected).abs() < 1e-9,
        "result[{idx}] = {got}, expected {expected}"
    );
}

/// Check that results[idx] is a boolean with the expected value.
pub fn assert_bool(results: &[Value], idx: usize, expected: bool) {
    let got = results
        .get(idx)
        .and_then(Value::as_boolean)
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected bool {expected}", results.get(idx)));
    assert_eq!(got, expected, "result[{idx}]");
}

/// Check that results[idx] is nil.
pub fn assert_nil(results: &[Value], idx: usize) {
    assert!(
        results.get(idx).is_some_and(Value::is_nil),
        "result[{idx}] = {:?}, expected nil",
        results.get(idx)
    );
}

/// Check that results[idx] is a string with the expected contents.
pub fn assert_str(results: &[Value], idx: usize, expected: &str, vm: &Vm) {
    let id = results
        .get(idx)
        .and_then(Value::as_string_id)
        .unwrap_or_else(|| {
            panic!("result[{idx}] = {:?}, expected string \"{expected}\"", results.get(idx))
        });
    let got = vm.strings.get_str_lossy(id);
    assert_eq!(got, expected, "result[{idx}]");
}

/// Run Lua source and check the results against expected numbers.
pub fn run_check_nums(source: &str, expected: &[f64]) {
    let results = run_lua(source);
    assert_eq!(
        results.len(),
        expected.len(),
        "expected {} results, got {}: {results:?}",
        expected.len(),
        results.len()
    );
    for (i, &exp) in expected.iter().enumerate() {
        assert_num(&results, i, exp);
    }
}
