//! The bytecode dispatch loop and call protocol.
//!
//! Lua-to-Lua calls never recurse into the host: `CALL` pushes a frame
//! and the same loop continues in it, so Lua-level recursion is bounded
//! only by the frame-stack limit. Host recursion happens only at
//! re-entrant native boundaries (metamethods, protected calls, iterator
//! calls), counted by `boundary_depth`.

use crate::arith::{self, ArithOp, ArithResult};
use crate::callinfo::CallInfo;
use crate::coerce;
use crate::compare::{self, CompareResult};
use crate::error::LuaError;
use crate::metamethod::get_metamethod;
use crate::vm::{
    format_source_name, CoroutineStatus, LuaThread, ResumeAction, Vm, MAIN_THREAD_ID,
    MAX_CALL_DEPTH, MAX_NATIVE_DEPTH,
};
use lunet_compiler::compiler::fb_to_int;
use lunet_compiler::opcode::{rk_constant_index, rk_is_constant, OpCode};
use lunet_compiler::proto::Constant;
use lunet_core::heap::{GcIdx, LuaClosure, NativeContext, NativeError, NativeFunction};
use lunet_core::string::StringId;
use lunet_core::value::Value;
use lunet_stdlib::base::display_value;

/// Upper bound on `__index`/`__newindex` chains, preventing metatable
/// cycles from looping forever.
const MAX_TAG_LOOP: usize = 100;

/// Constructor list elements per SETLIST batch.
const FIELDS_PER_FLUSH: usize = 50;

/// Convert a compile-time constant to a runtime value.
pub fn constant_to_value(k: &Constant) -> Value {
    match k {
        Constant::Nil => Value::Nil,
        Constant::Boolean(b) => Value::Boolean(*b),
        Constant::Number(n) => Value::Number(*n),
        Constant::String(id) => Value::String(*id),
    }
}

/// Build a runtime error carrying "source:line:" position information
/// from the active frame.
fn rt_error(vm: &Vm, msg: impl Into<String>) -> LuaError {
    let msg = msg.into();
    if let Some(ci) = vm.call_stack.last() {
        let proto = &vm.protos[ci.proto_idx];
        let line = proto.get_line(ci.pc.saturating_sub(1));
        if let Some(src) = proto.source {
            let name = vm.strings.get_str_lossy(src).into_owned();
            return LuaError::Runtime(format!("{}:{}: {}", format_source_name(&name), line, msg));
        }
    }
    LuaError::Runtime(msg)
}

/// Read an RK operand: constant-pool entry when the high bit is set,
/// register otherwise.
fn rk_value(vm: &Vm, ci_idx: usize, base: usize, operand: u32) -> Value {
    if rk_is_constant(operand) {
        let proto = &vm.protos[vm.call_stack[ci_idx].proto_idx];
        constant_to_value(&proto.constants[rk_constant_index(operand)])
    } else {
        vm.stack[base + operand as usize]
    }
}

/// Metamethod name for an arithmetic operation.
fn arith_event(vm: &Vm, op: ArithOp) -> StringId {
    match op {
        ArithOp::Add => vm.mm.add,
        ArithOp::Sub => vm.mm.sub,
        ArithOp::Mul => vm.mm.mul,
        ArithOp::Div => vm.mm.div,
        ArithOp::Mod => vm.mm.mod_,
        ArithOp::Pow => vm.mm.pow,
    }
}

/// Shared binary-metamethod dispatch: try the left operand's handler,
/// then the right's.
fn arith_metamethod(
    vm: &mut Vm,
    event: StringId,
    a: Value,
    b: Value,
) -> Result<Value, LuaError> {
    let handler = get_metamethod(a, event, &vm.heap).or_else(|| get_metamethod(b, event, &vm.heap));
    match handler {
        Some(h) => {
            let results = call_function(vm, h, &[a, b])?;
            Ok(results.first().copied().unwrap_or(Value::Nil))
        }
        None => {
            // Blame the operand that is not a number.
            let culprit = if coerce::to_number(a, &vm.strings).is_none() {
                a
            } else {
                b
            };
            Err(rt_error(
                vm,
                format!(
                    "attempt to perform arithmetic on a {} value",
                    culprit.type_name()
                ),
            ))
        }
    }
}

/// Order metamethods require both operands to share the same handler.
fn same_handler(vm: &Vm, a: Value, b: Value, event: StringId) -> Option<Value> {
    let h1 = get_metamethod(a, event, &vm.heap)?;
    let h2 = get_metamethod(b, event, &vm.heap)?;
    if h1 == h2 {
        Some(h1)
    } else {
        None
    }
}

fn order_error(vm: &Vm, a: Value, b: Value) -> LuaError {
    let (ta, tb) = (a.type_name(), b.type_name());
    if ta == tb {
        rt_error(vm, format!("attempt to compare two {ta} values"))
    } else {
        rt_error(vm, format!("attempt to compare {ta} with {tb}"))
    }
}

fn less_than(vm: &mut Vm, a: Value, b: Value) -> Result<bool, LuaError> {
    match compare::lua_lt(a, b, &vm.strings) {
        CompareResult::Ok(v) => Ok(v),
        CompareResult::NeedMetamethod => match same_handler(vm, a, b, vm.mm.lt) {
            Some(h) => {
                let r = call_function(vm, h, &[a, b])?;
                Ok(r.first().copied().unwrap_or(Value::Nil).is_truthy())
            }
            None => Err(order_error(vm, a, b)),
        },
    }
}

fn less_equal(vm: &mut Vm, a: Value, b: Value) -> Result<bool, LuaError> {
    match compare::lua_le(a, b, &vm.strings) {
        CompareResult::Ok(v) => Ok(v),
        CompareResult::NeedMetamethod => {
            if let Some(h) = same_handler(vm, a, b, vm.mm.le) {
                let r = call_function(vm, h, &[a, b])?;
                return Ok(r.first().copied().unwrap_or(Value::Nil).is_truthy());
            }
            // `a <= b` falls back to `not (b < a)`.
            if let Some(h) = same_handler(vm, a, b, vm.mm.lt) {
                let r = call_function(vm, h, &[b, a])?;
                return Ok(!r.first().copied().unwrap_or(Value::Nil).is_truthy());
            }
            Err(order_error(vm, a, b))
        }
    }
}

fn equals(vm: &mut Vm, a: Value, b: Value) -> Result<bool, LuaError> {
    let (eq, needs_mm) = compare::lua_eq(a, b);
    if eq || !needs_mm {
        return Ok(eq);
    }
    match same_handler(vm, a, b, vm.mm.eq) {
        Some(h) => {
            let r = call_function(vm, h, &[a, b])?;
            Ok(r.first().copied().unwrap_or(Value::Nil).is_truthy())
        }
        None => Ok(false),
    }
}

/// Indexing with `__index` chains, bounded by the tag-loop guard.
pub fn table_index(vm: &mut Vm, mut t: Value, key: Value) -> Result<Value, LuaError> {
    for _ in 0..MAX_TAG_LOOP {
        if let Some(idx) = t.as_table_idx() {
            let raw = vm.heap.get_table(idx).raw_get(key);
            if !raw.is_nil() {
                return Ok(raw);
            }
            match get_metamethod(t, vm.mm.index, &vm.heap) {
                None => return Ok(Value::Nil),
                Some(h) if h.is_function() => {
                    let r = call_function(vm, h, &[t, key])?;
                    return Ok(r.first().copied().unwrap_or(Value::Nil));
                }
                Some(h) => t = h, // chase the chain
            }
        } else {
            match get_metamethod(t, vm.mm.index, &vm.heap) {
                None => {
                    return Err(rt_error(
                        vm,
                        format!("attempt to index a {} value", t.type_name()),
                    ))
                }
                Some(h) if h.is_function() => {
                    let r = call_function(vm, h, &[t, key])?;
                    return Ok(r.first().copied().unwrap_or(Value::Nil));
                }
                Some(h) => t = h,
            }
        }
    }
    Err(rt_error(vm, "loop in gettable"))
}

/// Assignment with `__newindex` chains, bounded like `table_index`.
pub fn table_newindex(vm: &mut Vm, mut t: Value, key: Value, value: Value) -> Result<(), LuaError> {
    for _ in 0..MAX_TAG_LOOP {
        if let Some(idx) = t.as_table_idx() {
            let existing = vm.heap.get_table(idx).raw_get(key);
            if !existing.is_nil() {
                // The key exists: plain store, no metamethod.
                return vm
                    .heap
                    .get_table_mut(idx)
                    .raw_set(key, value)
                    .map_err(|e| rt_error(vm, e));
            }
            match get_metamethod(t, vm.mm.newindex, &vm.heap) {
                None => {
                    return vm
                        .heap
                        .get_table_mut(idx)
                        .raw_set(key, value)
                        .map_err(|e| rt_error(vm, e));
                }
                Some(h) if h.is_function() => {
                    call_function(vm, h, &[t, key, value])?;
                    return Ok(());
                }
                Some(h) => t = h,
            }
        } else {
            match get_metamethod(t, vm.mm.newindex, &vm.heap) {
                None => {
                    return Err(rt_error(
                        vm,
                        format!("attempt to index a {} value", t.type_name()),
                    ))
                }
                Some(h) if h.is_function() => {
                    call_function(vm, h, &[t, key, value])?;
                    return Ok(());
                }
                Some(h) => t = h,
            }
        }
    }
    Err(rt_error(vm, "loop in settable"))
}

/// Concatenate stack values `first..=last`, folding runs of strings and
/// numbers into one buffer pass and using `__concat` pairwise otherwise.
fn concat_range(vm: &mut Vm, first: usize, last: usize) -> Result<Value, LuaError> {
    let mut values: Vec<Value> = vm.stack[first..=last].to_vec();
    while values.len() > 1 {
        let n = values.len();
        let right = values[n - 1];
        let left = values[n - 2];
        if arith::is_concatable(left) && arith::is_concatable(right) {
            // Take the longest concatable suffix in one pass.
            let mut start = n - 2;
            while start > 0 && arith::is_concatable(values[start - 1]) {
                start -= 1;
            }
            match arith::concat_values(&values[start..], &mut vm.strings) {
                ArithResult::Ok(v) => {
                    values.truncate(start);
                    values.push(v);
                }
                ArithResult::NeedMetamethod => unreachable!("suffix was checked concatable"),
            }
        } else {
            let handler = get_metamethod(left, vm.mm.concat, &vm.heap)
                .or_else(|| get_metamethod(right, vm.mm.concat, &vm.heap));
            let Some(h) = handler else {
                let culprit = if arith::is_concatable(left) { right } else { left };
                return Err(rt_error(
                    vm,
                    format!("attempt to concatenate a {} value", culprit.type_name()),
                ));
            };
            let r = call_function(vm, h, &[left, right])?;
            values.truncate(n - 2);
            values.push(r.first().copied().unwrap_or(Value::Nil));
        }
    }
    Ok(values.pop().unwrap_or(Value::Nil))
}

/// Set up a frame for a Lua closure whose value sits at `func_pos` with
/// `num_args` arguments above it. For variadic functions the fixed
/// parameters are relocated above the raw arguments, which stay in place
/// for VARARG. The whole register window comes up nil.
fn push_lua_frame(
    vm: &mut Vm,
    closure_idx: GcIdx<LuaClosure>,
    func_pos: usize,
    num_args: usize,
    num_results: i32,
) -> Result<(), LuaError> {
    if vm.call_stack.len() >= MAX_CALL_DEPTH {
        return Err(LuaError::StackOverflow);
    }
    let proto_idx = vm.heap.get_closure(closure_idx).proto_idx;
    let proto = &vm.protos[proto_idx];
    let num_params = proto.num_params as usize;
    let is_vararg = proto.is_vararg;
    let max_stack = proto.max_stack_size as usize;

    let mut ci = CallInfo::new(0, proto_idx);
    ci.num_results = num_results;
    ci.closure_idx = Some(closure_idx);
    ci.func_stack_idx = func_pos;

    if is_vararg {
        let raw_base = func_pos + 1;
        let base = raw_base + num_args;
        vm.ensure_stack(base, max_stack);
        let copied = num_params.min(num_args);
        for i in 0..copied {
            vm.stack[base + i] = vm.stack[raw_base + i];
        }
        for i in copied..max_stack {
            vm.stack[base + i] = Value::Nil;
        }
        ci.base = base;
        ci.vararg_base = Some(raw_base);
        vm.stack_top = base + max_stack;
    } else {
        let base = func_pos + 1;
        vm.ensure_stack(base, max_stack);
        for i in num_args.min(num_params)..max_stack {
            vm.stack[base + i] = Value::Nil;
        }
        ci.base = base;
        vm.stack_top = base + max_stack;
    }
    vm.call_stack.push(ci);
    Ok(())
}

/// Pop the returning frame and copy/pad its results to where the caller
/// wants them.
fn return_from_call(vm: &mut Vm, results: &[Value]) {
    let ci = vm.call_stack.pop().expect("return without a frame");
    let dest = ci.func_stack_idx;
    if ci.num_results < 0 {
        vm.ensure_stack(dest, results.len());
        vm.stack[dest..dest + results.len()].copy_from_slice(results);
        // Open call: the consumer reads the produced count off the top.
        vm.stack_top = dest + results.len();
    } else {
        let wanted = ci.num_results as usize;
        vm.ensure_stack(dest, wanted);
        for i in 0..wanted {
            vm.stack[dest + i] = results.get(i).copied().unwrap_or(Value::Nil);
        }
        // Fixed call: the top returns to the caller's window ceiling.
        if let Some(caller) = vm.call_stack.last() {
            vm.stack_top = caller.base + vm.protos[caller.proto_idx].max_stack_size as usize;
        }
    }
}

/// What a call target resolved to.
enum Callee {
    Lua(GcIdx<LuaClosure>),
    Native(GcIdx<NativeFunction>),
}

/// Resolve the value at `func_pos` to something callable, applying the
/// `__call` metamethod once by splicing the handler in front of the
/// original value.
fn resolve_callee(
    vm: &mut Vm,
    func_pos: usize,
    num_args: usize,
) -> Result<(Callee, usize), LuaError> {
    let func = vm.stack[func_pos];
    match func {
        Value::Closure(idx) => return Ok((Callee::Lua(idx), num_args)),
        Value::Native(idx) => return Ok((Callee::Native(idx), num_args)),
        _ => {}
    }
    let Some(handler) = get_metamethod(func, vm.mm.call, &vm.heap) else {
        return Err(rt_error(
            vm,
            format!("attempt to call a {} value", func.type_name()),
        ));
    };
    // Shift the value and its arguments up one slot; the handler becomes
    // the callee and the original value its first argument.
    vm.ensure_stack(func_pos, num_args + 2);
    for i in (0..=num_args).rev() {
        vm.stack[func_pos + 1 + i] = vm.stack[func_pos + i];
    }
    vm.stack[func_pos] = handler;
    if vm.stack_top > func_pos {
        vm.stack_top += 1;
    }
    match handler {
        Value::Closure(idx) => Ok((Callee::Lua(idx), num_args + 1)),
        Value::Native(idx) => Ok((Callee::Native(idx), num_args + 1)),
        other => Err(rt_error(
            vm,
            format!("attempt to call a {} value", other.type_name()),
        )),
    }
}

/// Call a function value re-entrantly (metamethods, iterators, protected
/// calls, the embedding API). Lua frames started here run in a nested
/// dispatch loop that returns when the frame finishes.
pub fn call_function(vm: &mut Vm, func: Value, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    if vm.boundary_depth >= MAX_NATIVE_DEPTH {
        return Err(LuaError::Runtime("C stack overflow".to_string()));
    }
    vm.boundary_depth += 1;
    let result = call_function_inner(vm, func, args);
    vm.boundary_depth -= 1;
    result
}

fn call_function_inner(vm: &mut Vm, func: Value, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    match func {
        Value::Closure(closure_idx) => {
            let func_pos = vm.stack_top;
            vm.ensure_stack(func_pos, args.len() + 1);
            vm.stack[func_pos] = func;
            for (i, &arg) in args.iter().enumerate() {
                vm.stack[func_pos + 1 + i] = arg;
            }
            let saved_depth = vm.call_stack.len();
            let saved_top = vm.stack_top;
            push_lua_frame(vm, closure_idx, func_pos, args.len(), -1)?;
            let result = execute_from(vm, saved_depth + 1);
            match result {
                Err(LuaError::Yield(_)) => result, // coroutine state stays live
                other => {
                    if other.is_err() && vm.call_stack.len() > saved_depth {
                        // Close upvalues the discarded frames still hold open.
                        let level = vm.call_stack[saved_depth].func_stack_idx;
                        vm.close_upvalues(level);
                    }
                    vm.call_stack.truncate(saved_depth);
                    vm.stack_top = saved_top;
                    other
                }
            }
        }
        Value::Native(idx) => call_native(vm, idx, args),
        other => {
            let Some(handler) = get_metamethod(other, vm.mm.call, &vm.heap) else {
                return Err(rt_error(
                    vm,
                    format!("attempt to call a {} value", other.type_name()),
                ));
            };
            let mut new_args = Vec::with_capacity(args.len() + 1);
            new_args.push(other);
            new_args.extend_from_slice(args);
            call_function_inner(vm, handler, &new_args)
        }
    }
}

/// Invoke a native function, routing the VM-coupled builtins to their
/// real implementations.
pub(crate) fn call_native(
    vm: &mut Vm,
    idx: GcIdx<NativeFunction>,
    args: &[Value],
) -> Result<Vec<Value>, LuaError> {
    if idx == vm.stdlib.pcall {
        return do_pcall(vm, args);
    }
    if idx == vm.stdlib.xpcall {
        return do_xpcall(vm, args);
    }
    if idx == vm.stdlib.error {
        return Err(do_error(vm, args));
    }
    if idx == vm.stdlib.tostring {
        let v = args.first().copied().unwrap_or(Value::Nil);
        let s = tostring_value(vm, v)?;
        return Ok(vec![s]);
    }
    if idx == vm.stdlib.pairs {
        let t = args.first().copied().unwrap_or(Value::Nil);
        if !matches!(t, Value::Table(_)) {
            return Err(rt_error(
                vm,
                format!("bad argument #1 to 'pairs' (table expected, got {})", t.type_name()),
            ));
        }
        return Ok(vec![vm.stdlib.next_value, t, Value::Nil]);
    }
    if idx == vm.stdlib.ipairs {
        let t = args.first().copied().unwrap_or(Value::Nil);
        if !matches!(t, Value::Table(_)) {
            return Err(rt_error(
                vm,
                format!("bad argument #1 to 'ipairs' (table expected, got {})", t.type_name()),
            ));
        }
        return Ok(vec![vm.stdlib.ipairs_iter_value, t, Value::Number(0.0)]);
    }
    if idx == vm.stdlib.coro_create {
        let f = args.first().copied().unwrap_or(Value::Nil);
        if !f.is_function() {
            return Err(rt_error(
                vm,
                format!("bad argument #1 to 'create' (function expected, got {})", f.type_name()),
            ));
        }
        return Ok(vec![Value::Thread(vm.create_thread(f))]);
    }
    if idx == vm.stdlib.coro_resume {
        return do_resume(vm, args);
    }
    if idx == vm.stdlib.coro_yield {
        return Err(yield_error_or_transport(vm, args));
    }
    if idx == vm.stdlib.coro_status {
        return do_status(vm, args);
    }
    if idx == vm.stdlib.coro_wrap {
        return do_wrap(vm, args);
    }
    if idx == vm.stdlib.coro_wrap_resume {
        return do_wrap_resume(vm, args);
    }
    if idx == vm.stdlib.coro_running {
        let v = match vm.running_thread {
            Some(id) => Value::Thread(lunet_core::value::ThreadId(id as u32)),
            None => Value::Nil,
        };
        return Ok(vec![v]);
    }

    // Ordinary native: runs in the current host frame.
    let native_fn = vm.heap.get_native(idx).func;
    let result = {
        let mut ctx = NativeContext {
            args,
            heap: &mut vm.heap,
            strings: &mut vm.strings,
        };
        native_fn(&mut ctx)
    };
    result.map_err(|e| match e {
        NativeError::Message(msg) => rt_error(vm, msg),
        NativeError::Value(v) => LuaError::Value(v),
    })
}

/// `tostring` with `__tostring` dispatch.
pub fn tostring_value(vm: &mut Vm, v: Value) -> Result<Value, LuaError> {
    if let Some(handler) = get_metamethod(v, vm.mm.tostring, &vm.heap) {
        let r = call_function(vm, handler, &[v])?;
        return Ok(r.first().copied().unwrap_or(Value::Nil));
    }
    let s = display_value(v, &vm.heap, &vm.strings);
    Ok(Value::String(vm.strings.intern(s.as_bytes())))
}

// ---- Protected calls ----

fn do_pcall(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let func = args.first().copied().unwrap_or(Value::Nil);
    let call_args = args.get(1..).unwrap_or(&[]);
    match call_function(vm, func, call_args) {
        Ok(results) => {
            let mut all = vec![Value::Boolean(true)];
            all.extend(results);
            Ok(all)
        }
        Err(LuaError::Yield(vals)) => Err(LuaError::Yield(vals)),
        Err(e) => {
            let err_val = e.into_value(&mut vm.strings);
            Ok(vec![Value::Boolean(false), err_val])
        }
    }
}

fn do_xpcall(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let func = args.first().copied().unwrap_or(Value::Nil);
    let handler = args.get(1).copied().unwrap_or(Value::Nil);
    // xpcall passes no extra arguments to the function in 5.1.
    match call_function(vm, func, &[]) {
        Ok(results) => {
            let mut all = vec![Value::Boolean(true)];
            all.extend(results);
            Ok(all)
        }
        Err(LuaError::Yield(vals)) => Err(LuaError::Yield(vals)),
        Err(e) => {
            // The handler runs before the protected frame is conceptually
            // discarded, so it may inspect the error freely.
            let err_val = e.into_value(&mut vm.strings);
            match call_function(vm, handler, &[err_val]) {
                Ok(results) => {
                    let mut all = vec![Value::Boolean(false)];
                    all.extend(results);
                    Ok(all)
                }
                Err(_handler_err) => {
                    // The handler itself failed: a distinct condition so
                    // broken handlers cannot masquerade as ordinary errors.
                    let msg = Value::String(vm.strings.intern(b"error in error handling"));
                    Ok(vec![Value::Boolean(false), msg])
                }
            }
        }
    }
}

/// `error(message [, level])`: string messages gain position information
/// pointing at the given call level.
fn do_error(vm: &mut Vm, args: &[Value]) -> LuaError {
    let msg = args.first().copied().unwrap_or(Value::Nil);
    let level = match args.get(1) {
        Some(Value::Number(n)) => *n as i64,
        _ => 1,
    };
    if let (Value::String(id), true) = (msg, level > 0) {
        let depth = vm.call_stack.len();
        if depth >= level as usize {
            let ci = &vm.call_stack[depth - level as usize];
            let proto = &vm.protos[ci.proto_idx];
            let line = proto.get_line(ci.pc.saturating_sub(1));
            if let Some(src) = proto.source {
                let name = vm.strings.get_str_lossy(src).into_owned();
                let text = format!(
                    "{}:{}: {}",
                    format_source_name(&name),
                    line,
                    vm.strings.get_str_lossy(id)
                );
                return LuaError::Value(Value::String(vm.strings.intern(text.as_bytes())));
            }
        }
    }
    LuaError::Value(msg)
}

// ---- Coroutines ----

/// `coroutine.yield` transport, or the boundary error when yielding here
/// is impossible.
fn yield_error_or_transport(vm: &mut Vm, args: &[Value]) -> LuaError {
    if vm.running_thread.is_none() {
        return rt_error(vm, "attempt to yield from outside a coroutine");
    }
    if vm.boundary_depth != vm.yield_base {
        // A non-resumable native frame sits between the yield and its
        // resume.
        return rt_error(vm, "attempt to yield across metamethod/C-call boundary");
    }
    LuaError::Yield(args.to_vec())
}

fn do_status(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let Some(Value::Thread(id)) = args.first() else {
        return Err(rt_error(vm, "bad argument #1 to 'status' (coroutine expected)"));
    };
    let name = vm.thread_status(*id).name();
    Ok(vec![Value::String(vm.strings.intern(name.as_bytes()))])
}

/// resume(thread, args...) -> (true, results...) | (false, message)
fn do_resume(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let Some(Value::Thread(thread_id)) = args.first().copied() else {
        return Err(rt_error(vm, "bad argument #1 to 'resume' (coroutine expected)"));
    };
    let id = thread_id.0 as usize;
    let resume_args = args.get(1..).unwrap_or(&[]);

    let failure = |vm: &mut Vm, msg: &str| {
        let m = Value::String(vm.strings.intern(msg.as_bytes()));
        Ok(vec![Value::Boolean(false), m])
    };
    match vm.threads[id].status {
        CoroutineStatus::Dead => return failure(vm, "cannot resume dead coroutine"),
        CoroutineStatus::Running | CoroutineStatus::Normal => {
            return failure(vm, "cannot resume non-suspended coroutine")
        }
        CoroutineStatus::Suspended => {}
    }

    // Park the caller and install the coroutine's stacks.
    let caller_id = vm.running_thread.unwrap_or(MAIN_THREAD_ID);
    let caller_state = vm.save_running_state(caller_id, CoroutineStatus::Normal);
    if let Some(cid) = vm.running_thread {
        vm.threads[cid].status = CoroutineStatus::Normal;
    }
    vm.caller_stack.push(caller_state);
    let coro_state = std::mem::replace(&mut vm.threads[id], LuaThread::placeholder(id));
    let started = coro_state.started;
    let resume_action = coro_state.resume_action.clone();
    vm.restore_running_state(coro_state);
    vm.running_thread = Some(id);

    let saved_yield_base = vm.yield_base;
    vm.yield_base = vm.boundary_depth;

    let result = if !started {
        start_coroutine(vm, resume_args)
    } else {
        continue_coroutine(vm, resume_action, resume_args)
    };

    vm.yield_base = saved_yield_base;

    // Switch back to the caller.
    let caller_state = vm.caller_stack.pop().expect("resume without saved caller");
    let outcome = match result {
        Ok(values) => {
            let state = vm.save_running_state(id, CoroutineStatus::Dead);
            vm.threads[id] = state;
            let mut all = vec![Value::Boolean(true)];
            all.extend(values);
            Ok(all)
        }
        Err(LuaError::Yield(values)) => {
            let mut state = vm.save_running_state(id, CoroutineStatus::Suspended);
            state.resume_action = vm.pending_resume.take();
            vm.threads[id] = state;
            let mut all = vec![Value::Boolean(true)];
            all.extend(values);
            Ok(all)
        }
        Err(e) => {
            let state = vm.save_running_state(id, CoroutineStatus::Dead);
            vm.threads[id] = state;
            let err_val = e.into_value(&mut vm.strings);
            Ok(vec![Value::Boolean(false), err_val])
        }
    };
    vm.restore_running_state(caller_state);
    vm.running_thread = if caller_id == MAIN_THREAD_ID {
        None
    } else {
        vm.threads[caller_id].status = CoroutineStatus::Running;
        Some(caller_id)
    };
    outcome
}

/// First resume: set up the body call on the coroutine's empty stack.
fn start_coroutine(vm: &mut Vm, resume_args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let func = vm.stack[0];
    vm.ensure_stack(1, resume_args.len() + 1);
    for (i, &arg) in resume_args.iter().enumerate() {
        vm.stack[1 + i] = arg;
    }
    vm.stack_top = 1 + resume_args.len();
    match func {
        Value::Closure(closure_idx) => {
            push_lua_frame(vm, closure_idx, 0, resume_args.len(), -1)?;
            execute_from(vm, 1)
        }
        Value::Native(idx) => call_native(vm, idx, resume_args),
        other => Err(rt_error(
            vm,
            format!("attempt to call a {} value", other.type_name()),
        )),
    }
}

/// Subsequent resume: hand the resume arguments to the suspended yield
/// site and continue the dispatch loop.
fn continue_coroutine(
    vm: &mut Vm,
    action: Option<ResumeAction>,
    resume_args: &[Value],
) -> Result<Vec<Value>, LuaError> {
    match action {
        Some(ResumeAction::Call {
            result_base,
            num_results,
        }) => {
            if num_results < 0 {
                vm.ensure_stack(result_base, resume_args.len());
                for (i, &v) in resume_args.iter().enumerate() {
                    vm.stack[result_base + i] = v;
                }
                vm.stack_top = result_base + resume_args.len();
            } else {
                vm.ensure_stack(result_base, num_results as usize);
                for i in 0..num_results as usize {
                    vm.stack[result_base + i] =
                        resume_args.get(i).copied().unwrap_or(Value::Nil);
                }
            }
            execute_from(vm, 1)
        }
        Some(ResumeAction::Return) => {
            // The yield sat in a tail position: the resumed values are the
            // frame's return values.
            let results = resume_args.to_vec();
            let base = vm.call_stack.last().expect("suspended frame").base;
            vm.close_upvalues(base);
            if vm.call_stack.len() <= 1 {
                vm.call_stack.pop();
                return Ok(results);
            }
            return_from_call(vm, &results);
            execute_from(vm, 1)
        }
        None => Err(rt_error(vm, "cannot resume dead coroutine")),
    }
}

fn do_wrap(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let f = args.first().copied().unwrap_or(Value::Nil);
    if !f.is_function() {
        return Err(rt_error(
            vm,
            format!("bad argument #1 to 'wrap' (function expected, got {})", f.type_name()),
        ));
    }
    let thread = Value::Thread(vm.create_thread(f));
    // A callable wrapper: wrapper[1] holds the thread; __call resumes it.
    let wrapper = vm.heap.alloc_table(1, 0);
    vm.heap.get_table_mut(wrapper).raw_seti(1, thread);
    let mt = vm.heap.alloc_table(0, 1);
    let wrap_resume = Value::Native(vm.stdlib.coro_wrap_resume);
    let call_key = vm.mm.call;
    vm.heap.get_table_mut(mt).raw_set_str(call_key, wrap_resume);
    vm.heap.get_table_mut(wrapper).metatable = Some(mt);
    Ok(vec![Value::Table(wrapper)])
}

/// The `__call` target of wrapped coroutines: resumes and unwraps,
/// raising the error instead of returning a flag.
fn do_wrap_resume(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let wrapper = args.first().copied().unwrap_or(Value::Nil);
    let Some(wrapper_idx) = wrapper.as_table_idx() else {
        return Err(rt_error(vm, "cannot resume dead coroutine"));
    };
    let thread = vm.heap.get_table(wrapper_idx).raw_geti(1);
    let mut resume_args = vec![thread];
    resume_args.extend_from_slice(args.get(1..).unwrap_or(&[]));
    let result = do_resume(vm, &resume_args)?;
    let ok = result
        .first()
        .copied()
        .unwrap_or(Value::Nil)
        .is_truthy();
    if ok {
        Ok(result[1..].to_vec())
    } else {
        let err = result.get(1).copied().unwrap_or(Value::Nil);
        match err {
            Value::String(id) => Err(LuaError::Runtime(
                vm.strings.get_str_lossy(id).into_owned(),
            )),
            other => Err(LuaError::Value(other)),
        }
    }
}

/// Run the dispatch loop until the frame at `entry_depth - 1` returns.
/// The entry frame itself is left on the call stack; the caller truncates.
pub fn execute_from(vm: &mut Vm, entry_depth: usize) -> Result<Vec<Value>, LuaError> {
    loop {
        let ci_idx = vm.call_stack.len() - 1;
        let base = vm.call_stack[ci_idx].base;
        let pc = vm.call_stack[ci_idx].pc;

        let proto = &vm.protos[vm.call_stack[ci_idx].proto_idx];
        if pc >= proto.code.len() {
            // Fell off the end: behave like an empty return.
            vm.close_upvalues(base);
            if vm.call_stack.len() <= entry_depth {
                return Ok(vec![]);
            }
            return_from_call(vm, &[]);
            continue;
        }
        let inst = proto.code[pc];
        vm.call_stack[ci_idx].pc += 1;

        let op = inst.opcode();
        let a = inst.a() as usize;

        match op {
            OpCode::Move => {
                let b = inst.b() as usize;
                vm.stack[base + a] = vm.stack[base + b];
            }

            OpCode::LoadK => {
                let proto = &vm.protos[vm.call_stack[ci_idx].proto_idx];
                vm.stack[base + a] = constant_to_value(&proto.constants[inst.bx() as usize]);
            }

            OpCode::LoadBool => {
                vm.stack[base + a] = Value::Boolean(inst.b() != 0);
                if inst.c() != 0 {
                    vm.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::LoadNil => {
                let b = inst.b() as usize;
                for i in a..=b {
                    vm.stack[base + i] = Value::Nil;
                }
            }

            OpCode::GetUpval => {
                let b = inst.b() as usize;
                let closure_idx = vm.call_stack[ci_idx]
                    .closure_idx
                    .expect("Lua frame has a closure");
                let uv = vm.heap.get_closure(closure_idx).upvalues[b];
                vm.stack[base + a] = vm.get_upval_value(uv);
            }

            OpCode::SetUpval => {
                let b = inst.b() as usize;
                let closure_idx = vm.call_stack[ci_idx]
                    .closure_idx
                    .expect("Lua frame has a closure");
                let uv = vm.heap.get_closure(closure_idx).upvalues[b];
                let v = vm.stack[base + a];
                vm.set_upval_value(uv, v);
            }

            OpCode::GetGlobal => {
                let proto = &vm.protos[vm.call_stack[ci_idx].proto_idx];
                let key = constant_to_value(&proto.constants[inst.bx() as usize]);
                let closure_idx = vm.call_stack[ci_idx]
                    .closure_idx
                    .expect("Lua frame has a closure");
                let env = vm.heap.get_closure(closure_idx).env;
                let result = table_index(vm, Value::Table(env), key)?;
                vm.stack[base + a] = result;
            }

            OpCode::SetGlobal => {
                let proto = &vm.protos[vm.call_stack[ci_idx].proto_idx];
                let key = constant_to_value(&proto.constants[inst.bx() as usize]);
                let closure_idx = vm.call_stack[ci_idx]
                    .closure_idx
                    .expect("Lua frame has a closure");
                let env = vm.heap.get_closure(closure_idx).env;
                let value = vm.stack[base + a];
                table_newindex(vm, Value::Table(env), key, value)?;
            }

            OpCode::GetTable => {
                let t = vm.stack[base + inst.b() as usize];
                let key = rk_value(vm, ci_idx, base, inst.c());
                let result = table_index(vm, t, key)?;
                vm.stack[base + a] = result;
            }

            OpCode::SetTable => {
                let t = vm.stack[base + a];
                let key = rk_value(vm, ci_idx, base, inst.b());
                let value = rk_value(vm, ci_idx, base, inst.c());
                table_newindex(vm, t, key, value)?;
            }

            OpCode::NewTable => {
                let narray = fb_to_int(inst.b()) as usize;
                let nhash = fb_to_int(inst.c()) as usize;
                let t = vm.heap.alloc_table(narray, nhash);
                vm.stack[base + a] = Value::Table(t);
            }

            OpCode::Self_ => {
                let obj = vm.stack[base + inst.b() as usize];
                let key = rk_value(vm, ci_idx, base, inst.c());
                vm.stack[base + a + 1] = obj;
                let method = table_index(vm, obj, key)?;
                vm.stack[base + a] = method;
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                let rb = rk_value(vm, ci_idx, base, inst.b());
                let rc = rk_value(vm, ci_idx, base, inst.c());
                let aop = match op {
                    OpCode::Add => ArithOp::Add,
                    OpCode::Sub => ArithOp::Sub,
                    OpCode::Mul => ArithOp::Mul,
                    OpCode::Div => ArithOp::Div,
                    OpCode::Mod => ArithOp::Mod,
                    _ => ArithOp::Pow,
                };
                let result = match arith::arith_op(aop, rb, rc, &vm.strings) {
                    ArithResult::Ok(v) => v,
                    ArithResult::NeedMetamethod => {
                        let event = arith_event(vm, aop);
                        arith_metamethod(vm, event, rb, rc)?
                    }
                };
                vm.stack[base + a] = result;
            }

            OpCode::Unm => {
                let rb = vm.stack[base + inst.b() as usize];
                let result = match arith::arith_unm(rb, &vm.strings) {
                    ArithResult::Ok(v) => v,
                    ArithResult::NeedMetamethod => {
                        let event = vm.mm.unm;
                        arith_metamethod(vm, event, rb, rb)?
                    }
                };
                vm.stack[base + a] = result;
            }

            OpCode::Not => {
                let rb = vm.stack[base + inst.b() as usize];
                vm.stack[base + a] = Value::Boolean(rb.is_falsy());
            }

            OpCode::Len => {
                let rb = vm.stack[base + inst.b() as usize];
                let result = match rb {
                    Value::String(id) => Value::Number(vm.strings.get_bytes(id).len() as f64),
                    Value::Table(t) => Value::Number(vm.heap.get_table(t).length() as f64),
                    other => {
                        let Some(handler) = get_metamethod(other, vm.mm.len, &vm.heap) else {
                            return Err(rt_error(
                                vm,
                                format!("attempt to get length of a {} value", other.type_name()),
                            ));
                        };
                        let r = call_function(vm, handler, &[other])?;
                        r.first().copied().unwrap_or(Value::Nil)
                    }
                };
                vm.stack[base + a] = result;
            }

            OpCode::Concat => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                let result = concat_range(vm, base + b, base + c)?;
                vm.stack[base + a] = result;
            }

            OpCode::Jmp => {
                let sbx = inst.sbx();
                let ci = &mut vm.call_stack[ci_idx];
                ci.pc = (ci.pc as i64 + sbx as i64) as usize;
            }

            OpCode::Eq => {
                let rb = rk_value(vm, ci_idx, base, inst.b());
                let rc = rk_value(vm, ci_idx, base, inst.c());
                let result = equals(vm, rb, rc)?;
                if result != (a != 0) {
                    vm.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::Lt => {
                let rb = rk_value(vm, ci_idx, base, inst.b());
                let rc = rk_value(vm, ci_idx, base, inst.c());
                let result = less_than(vm, rb, rc)?;
                if result != (a != 0) {
                    vm.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::Le => {
                let rb = rk_value(vm, ci_idx, base, inst.b());
                let rc = rk_value(vm, ci_idx, base, inst.c());
                let result = less_equal(vm, rb, rc)?;
                if result != (a != 0) {
                    vm.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::Test => {
                let c = inst.c();
                if (vm.stack[base + a].is_falsy() as u32) == c {
                    vm.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::TestSet => {
                let rb = vm.stack[base + inst.b() as usize];
                if (rb.is_falsy() as u32) == inst.c() {
                    vm.call_stack[ci_idx].pc += 1;
                } else {
                    vm.stack[base + a] = rb;
                }
            }

            OpCode::Call => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                let func_pos = base + a;
                let num_args = if b == 0 {
                    vm.stack_top - (func_pos + 1)
                } else {
                    b - 1
                };
                let num_results = if c == 0 { -1 } else { c as i32 - 1 };

                match resolve_callee(vm, func_pos, num_args)? {
                    (Callee::Lua(closure_idx), num_args) => {
                        push_lua_frame(vm, closure_idx, func_pos, num_args, num_results)?;
                        // Continue the same loop in the new frame.
                    }
                    (Callee::Native(native_idx), num_args) => {
                        let args: Vec<Value> =
                            vm.stack[func_pos + 1..func_pos + 1 + num_args].to_vec();
                        match call_native(vm, native_idx, &args) {
                            Ok(results) => {
                                if num_results < 0 {
                                    vm.ensure_stack(func_pos, results.len());
                                    vm.stack[func_pos..func_pos + results.len()]
                                        .copy_from_slice(&results);
                                    vm.stack_top = func_pos + results.len();
                                } else {
                                    let wanted = num_results as usize;
                                    vm.ensure_stack(func_pos, wanted);
                                    for i in 0..wanted {
                                        vm.stack[func_pos + i] =
                                            results.get(i).copied().unwrap_or(Value::Nil);
                                    }
                                    let max_stack = vm.protos
                                        [vm.call_stack[ci_idx].proto_idx]
                                        .max_stack_size
                                        as usize;
                                    vm.stack_top = base + max_stack;
                                }
                            }
                            Err(LuaError::Yield(vals)) => {
                                // Remember where the resumed values go.
                                vm.pending_resume = Some(ResumeAction::Call {
                                    result_base: func_pos,
                                    num_results,
                                });
                                return Err(LuaError::Yield(vals));
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            OpCode::TailCall => {
                let b = inst.b() as usize;
                let func_pos = base + a;
                let num_args = if b == 0 {
                    vm.stack_top - (func_pos + 1)
                } else {
                    b - 1
                };

                match resolve_callee(vm, func_pos, num_args)? {
                    (Callee::Lua(closure_idx), num_args) => {
                        // The returning frame's upvalues close now; then the
                        // callee's registers splice down over the old frame.
                        vm.close_upvalues(base);
                        let dest = vm.call_stack[ci_idx].func_stack_idx;
                        for i in 0..=num_args {
                            vm.stack[dest + i] = vm.stack[func_pos + i];
                        }
                        let num_results = vm.call_stack[ci_idx].num_results;
                        vm.call_stack.pop();
                        push_lua_frame(vm, closure_idx, dest, num_args, num_results)?;
                    }
                    (Callee::Native(native_idx), num_args) => {
                        let args: Vec<Value> =
                            vm.stack[func_pos + 1..func_pos + 1 + num_args].to_vec();
                        match call_native(vm, native_idx, &args) {
                            Ok(results) => {
                                vm.close_upvalues(base);
                                if vm.call_stack.len() <= entry_depth {
                                    return Ok(results);
                                }
                                return_from_call(vm, &results);
                            }
                            Err(LuaError::Yield(vals)) => {
                                vm.pending_resume = Some(ResumeAction::Return);
                                return Err(LuaError::Yield(vals));
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            OpCode::Return => {
                let b = inst.b() as usize;
                let mut results = Vec::new();
                if b == 0 {
                    for i in (base + a)..vm.stack_top {
                        results.push(vm.stack[i]);
                    }
                } else {
                    for i in 0..b - 1 {
                        results.push(vm.stack[base + a + i]);
                    }
                }
                vm.close_upvalues(base);
                if vm.call_stack.len() <= entry_depth {
                    return Ok(results);
                }
                return_from_call(vm, &results);
            }

            OpCode::ForPrep => {
                let init = for_number(vm, base + a, "'for' initial value")?;
                let limit = for_number(vm, base + a + 1, "'for' limit")?;
                let step = for_number(vm, base + a + 2, "'for' step")?;
                vm.stack[base + a] = Value::Number(init - step);
                vm.stack[base + a + 1] = Value::Number(limit);
                vm.stack[base + a + 2] = Value::Number(step);
                let sbx = inst.sbx();
                let ci = &mut vm.call_stack[ci_idx];
                ci.pc = (ci.pc as i64 + sbx as i64) as usize;
            }

            OpCode::ForLoop => {
                let index = vm.stack[base + a].as_number().expect("FORPREP normalized");
                let limit = vm.stack[base + a + 1].as_number().expect("FORPREP normalized");
                let step = vm.stack[base + a + 2].as_number().expect("FORPREP normalized");
                let next = index + step;
                let keep_going = if step > 0.0 { next <= limit } else { next >= limit };
                if keep_going {
                    vm.stack[base + a] = Value::Number(next);
                    vm.stack[base + a + 3] = Value::Number(next);
                    let sbx = inst.sbx();
                    let ci = &mut vm.call_stack[ci_idx];
                    ci.pc = (ci.pc as i64 + sbx as i64) as usize;
                }
            }

            OpCode::TForLoop => {
                let c = inst.c() as usize;
                let iter = vm.stack[base + a];
                let state = vm.stack[base + a + 1];
                let control = vm.stack[base + a + 2];
                let results = call_function(vm, iter, &[state, control])?;
                for i in 0..c {
                    vm.stack[base + a + 3 + i] = results.get(i).copied().unwrap_or(Value::Nil);
                }
                let first = vm.stack[base + a + 3];
                if first.is_nil() {
                    vm.call_stack[ci_idx].pc += 1; // skip the back jump
                } else {
                    vm.stack[base + a + 2] = first; // update the control variable
                }
            }

            OpCode::SetList => {
                let b = inst.b() as usize;
                let mut c = inst.c() as usize;
                if c == 0 {
                    // Batch index stored in the following raw word.
                    let proto = &vm.protos[vm.call_stack[ci_idx].proto_idx];
                    c = proto.code[vm.call_stack[ci_idx].pc].0 as usize;
                    vm.call_stack[ci_idx].pc += 1;
                }
                let t = vm.stack[base + a]
                    .as_table_idx()
                    .expect("SETLIST target is the constructor's table");
                let count = if b == 0 {
                    vm.stack_top - (base + a + 1)
                } else {
                    b
                };
                let offset = (c - 1) * FIELDS_PER_FLUSH;
                for i in 1..=count {
                    let v = vm.stack[base + a + i];
                    vm.heap.get_table_mut(t).raw_seti((offset + i) as i64, v);
                }
            }

            OpCode::Close => {
                vm.close_upvalues(base + a);
            }

            OpCode::Closure => {
                let bx = inst.bx() as usize;
                let parent_proto_idx = vm.call_stack[ci_idx].proto_idx;
                let child_idx = vm.proto_children[parent_proto_idx][bx];
                let num_upvalues = vm.protos[child_idx].num_upvalues as usize;
                let parent_closure_idx = vm.call_stack[ci_idx]
                    .closure_idx
                    .expect("Lua frame has a closure");
                let env = vm.heap.get_closure(parent_closure_idx).env;

                // Consume one pseudo-instruction per upvalue binding.
                let mut upvals = Vec::with_capacity(num_upvalues);
                for _ in 0..num_upvalues {
                    let pc = vm.call_stack[ci_idx].pc;
                    let pseudo = vm.protos[parent_proto_idx].code[pc];
                    vm.call_stack[ci_idx].pc += 1;
                    match pseudo.opcode() {
                        OpCode::Move => {
                            let slot = base + pseudo.b() as usize;
                            upvals.push(vm.find_or_create_open_upval(slot));
                        }
                        OpCode::GetUpval => {
                            let parent = vm.heap.get_closure(parent_closure_idx);
                            upvals.push(parent.upvalues[pseudo.b() as usize]);
                        }
                        _ => unreachable!("CLOSURE pseudo-instruction"),
                    }
                }
                let closure = vm.heap.alloc_closure(child_idx, upvals, env);
                vm.stack[base + a] = Value::Closure(closure);
            }

            OpCode::Vararg => {
                let b = inst.b() as usize;
                let ci = &vm.call_stack[ci_idx];
                let num_params = vm.protos[ci.proto_idx].num_params as usize;
                let (vararg_start, vararg_count) = match ci.vararg_base {
                    Some(raw_base) => {
                        let start = raw_base + num_params;
                        (start, ci.base.saturating_sub(start))
                    }
                    None => (0, 0),
                };
                let wanted = if b == 0 { vararg_count } else { b - 1 };
                vm.ensure_stack(base + a, wanted.max(1));
                for i in 0..wanted {
                    vm.stack[base + a + i] = if i < vararg_count {
                        vm.stack[vararg_start + i]
                    } else {
                        Value::Nil
                    };
                }
                if b == 0 {
                    vm.stack_top = base + a + wanted;
                }
            }
        }
    }
}

/// Numeric-for operand coercion with the reference error messages.
fn for_number(vm: &mut Vm, slot: usize, what: &str) -> Result<f64, LuaError> {
    let v = vm.stack[slot];
    match coerce::to_number(v, &vm.strings) {
        Some(n) => Ok(n),
        None => Err(rt_error(vm, format!("{what} must be a number"))),
    }
}
