use crate::helpers::*;
use lunet_compiler::compiler::compile;
use lunet_vm::binary_chunk;
use lunet_vm::dispatch;
use lunet_vm::vm::Vm;

#[test]
fn test_precompiled_chunk_executes() {
    let (proto, strings) = compile(b"return 6 * 7", "=dumped").unwrap();
    let bytes = binary_chunk::dump(&proto, &strings);

    let mut vm = Vm::new();
    let chunk = vm.load_chunk(&bytes, "=dumped").unwrap();
    let results = dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    assert_num(&results, 0, 42.0);
}

#[test]
fn test_precompiled_chunk_with_functions() {
    let source = br#"
local function make(n)
  return function() return n * 2 end
end
return make(21)()
"#;
    let (proto, strings) = compile(source, "=dumped").unwrap();
    let bytes = binary_chunk::dump(&proto, &strings);

    let mut vm = Vm::new();
    let chunk = vm.load_chunk(&bytes, "=dumped").unwrap();
    let results = dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    assert_num(&results, 0, 42.0);
}

#[test]
fn test_precompiled_chunk_uses_globals() {
    let (proto, strings) = compile(b"return shared + 1", "=dumped").unwrap();
    let bytes = binary_chunk::dump(&proto, &strings);

    let mut vm = Vm::new();
    vm.set_global("shared", lunet_core::value::Value::Number(9.0));
    let chunk = vm.load_chunk(&bytes, "=dumped").unwrap();
    let results = dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    assert_num(&results, 0, 10.0);
}

#[test]
fn test_corrupt_chunk_rejected() {
    let mut vm = Vm::new();
    let err = vm.load_chunk(b"\x1BLuaXXXX", "=bad").unwrap_err();
    assert!(
        err.contains("version mismatch") || err.contains("incompatible"),
        "got: {err}"
    );
}

#[test]
fn test_source_chunk_still_loads() {
    // The loader only engages on the signature byte.
    let mut vm = Vm::new();
    let chunk = vm.load_chunk(b"return 'plain source'", "=src").unwrap();
    let results = dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    let id = results[0].as_string_id().unwrap();
    assert_eq!(vm.strings.get_str_lossy(id), "plain source");
}
