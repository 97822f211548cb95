//! Code-generation primitives: jump lists, register discharge, RK
//! operands, and operator emission. The parser in `mod.rs` drives these.
//!
//! Forward jumps are chained through the instruction stream itself: a
//! pending jump's sBx field holds the offset to the next pending jump in
//! the list, with `NO_JUMP` terminating the chain. Patching walks the
//! chain once the destination is known.

use crate::compiler::expr::{BinOp, ExpDesc, ExpKind, UnOp, NO_JUMP};
use crate::compiler::scope::MAX_REGISTERS;
use crate::compiler::{CompileError, Compiler};
use crate::opcode::{
    rk_as_constant, rk_is_constant, Instruction, OpCode, MAX_C, MAX_INDEX_RK, MAX_SBX, NO_REG,
};
use crate::proto::Constant;
use lunet_core::number;
use lunet_core::string::StringId;

/// Marker for "as many results as produced" in call/return counts.
pub const MULTRET: i32 = -1;

/// Constructor list elements per SETLIST flush.
pub const FIELDS_PER_FLUSH: u32 = 50;

/// Key for the per-function constant-dedup map.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ConstKey {
    Nil,
    Boolean(bool),
    /// Bit pattern, so 0.0 and -0.0 stay distinct and NaN matches itself.
    Number(u64),
    String(StringId),
}

impl<'a> Compiler<'a> {
    // ---- Instruction emission ----

    /// Append an instruction, first redirecting any jumps pending to this
    /// position. Returns its pc.
    pub(crate) fn code(&mut self, inst: Instruction) -> i32 {
        self.discharge_jpc();
        let line = self.lexer.last_line;
        self.fs_mut().proto.emit(inst, line) as i32
    }

    pub(crate) fn code_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> i32 {
        self.code(Instruction::abc(op, a, b, c))
    }

    pub(crate) fn code_abx(&mut self, op: OpCode, a: u32, bx: u32) -> i32 {
        self.code(Instruction::abx(op, a, bx))
    }

    pub(crate) fn code_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> i32 {
        self.code(Instruction::asbx(op, a, sbx))
    }

    /// Next pc to be emitted.
    pub(crate) fn current_pc(&self) -> i32 {
        self.fs().proto.code_len() as i32
    }

    /// Rewrite the line recorded for the last emitted instruction.
    pub(crate) fn fix_line(&mut self, line: u32) {
        let fs = self.fs_mut();
        let pc = fs.proto.code_len();
        fs.proto.line_info[pc - 1] = line;
    }

    // ---- Register bookkeeping ----

    pub(crate) fn check_stack(&mut self, n: u32) -> Result<(), CompileError> {
        let new_stack = self.fs().freereg + n;
        if new_stack > self.fs().proto.max_stack_size as u32 {
            if new_stack >= MAX_REGISTERS {
                return Err(self.syntax_error("function or expression too complex"));
            }
            self.fs_mut().proto.max_stack_size = new_stack as u8;
        }
        Ok(())
    }

    pub(crate) fn reserve_regs(&mut self, n: u32) -> Result<(), CompileError> {
        self.check_stack(n)?;
        self.fs_mut().freereg += n;
        Ok(())
    }

    fn free_reg(&mut self, reg: u32) {
        if !rk_is_constant(reg) && reg >= self.fs().nactvar {
            self.fs_mut().freereg -= 1;
            debug_assert_eq!(reg, self.fs().freereg);
        }
    }

    pub(crate) fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(reg) = e.kind {
            self.free_reg(reg);
        }
    }

    // ---- Constant pool ----

    pub(crate) fn add_constant(&mut self, k: Constant) -> u32 {
        let key = match &k {
            Constant::Nil => ConstKey::Nil,
            Constant::Boolean(b) => ConstKey::Boolean(*b),
            Constant::Number(n) => ConstKey::Number(n.to_bits()),
            Constant::String(id) => ConstKey::String(*id),
        };
        let fs = self.fs_mut();
        if let Some(&idx) = fs.constants_map.get(&key) {
            return idx;
        }
        let idx = fs.proto.constants.len() as u32;
        fs.proto.constants.push(k);
        fs.constants_map.insert(key, idx);
        idx
    }

    pub(crate) fn number_constant(&mut self, n: f64) -> u32 {
        self.add_constant(Constant::Number(n))
    }

    pub(crate) fn string_constant(&mut self, id: StringId) -> u32 {
        self.add_constant(Constant::String(id))
    }

    fn bool_constant(&mut self, b: bool) -> u32 {
        self.add_constant(Constant::Boolean(b))
    }

    fn nil_constant(&mut self) -> u32 {
        self.add_constant(Constant::Nil)
    }

    // ---- Jump lists ----

    /// Emit an unconditional jump, carrying along any jumps already
    /// pending to this position. Returns the jump's pc for later patching.
    pub(crate) fn jump(&mut self) -> i32 {
        let saved = self.fs().jpc;
        self.fs_mut().jpc = NO_JUMP;
        let j = self.code_asbx(OpCode::Jmp, 0, NO_JUMP);
        self.concat_jump(j, saved)
    }

    /// Mark the current position as a jump target.
    pub(crate) fn get_label(&mut self) -> i32 {
        let pc = self.current_pc();
        self.fs_mut().last_target = pc;
        pc
    }

    fn discharge_jpc(&mut self) {
        let jpc = self.fs().jpc;
        let pc = self.current_pc();
        self.patch_list_aux(jpc, pc, NO_REG, pc);
        self.fs_mut().jpc = NO_JUMP;
    }

    /// Resolve one jump to its destination. Out-of-range offsets are
    /// recorded on the function state and reported when it closes.
    fn fix_jump(&mut self, at: i32, dest: i32) {
        let offset = dest - (at + 1);
        debug_assert_ne!(dest, NO_JUMP);
        if offset.abs() > MAX_SBX {
            self.fs_mut().jump_overflow = true;
            return;
        }
        self.fs_mut().proto.code[at as usize].set_sbx(offset);
    }

    /// Follow one link of a jump chain.
    fn get_jump(&self, at: i32) -> i32 {
        let offset = self.fs().proto.code[at as usize].sbx();
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            at + 1 + offset
        }
    }

    /// The instruction controlling a jump: the preceding test, if any.
    fn get_jump_control(&self, at: i32) -> i32 {
        if at >= 1 && self.fs().proto.code[at as usize - 1].opcode().is_test() {
            at - 1
        } else {
            at
        }
    }

    /// Concatenate two jump lists, returning the head of the result.
    pub(crate) fn concat_jump(&mut self, l1: i32, l2: i32) -> i32 {
        if l2 == NO_JUMP {
            return l1;
        }
        if l1 == NO_JUMP {
            return l2;
        }
        let mut list = l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2);
        l1
    }

    pub(crate) fn patch_list(&mut self, list: i32, target: i32) {
        if target == self.current_pc() {
            self.patch_to_here(list);
        } else {
            debug_assert!(target < self.current_pc());
            self.patch_list_aux(list, target, NO_REG, target);
        }
    }

    /// Queue a jump list to be patched to the next emitted instruction.
    pub(crate) fn patch_to_here(&mut self, list: i32) {
        self.get_label();
        let jpc = self.fs().jpc;
        let merged = self.concat_jump(jpc, list);
        self.fs_mut().jpc = merged;
    }

    /// Patch every jump in `list`: jumps whose TESTSET produces a value go
    /// to `vtarget` with their destination register set to `reg`; the rest
    /// go to `dtarget`.
    fn patch_list_aux(&mut self, mut list: i32, vtarget: i32, reg: u32, dtarget: i32) {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget);
            } else {
                self.fix_jump(list, dtarget);
            }
            list = next;
        }
    }

    /// Patch a TESTSET's destination register, or demote it to a plain
    /// TEST when no value is wanted. Returns false for other controls.
    fn patch_test_reg(&mut self, node: i32, reg: u32) -> bool {
        let at = self.get_jump_control(node) as usize;
        let instr = self.fs().proto.code[at];
        if instr.opcode() != OpCode::TestSet {
            return false;
        }
        if reg != NO_REG && reg != instr.b() {
            self.fs_mut().proto.code[at].set_a(reg);
        } else {
            // No register wants the value, or it is already there.
            self.fs_mut().proto.code[at] = Instruction::abc(OpCode::Test, instr.b(), 0, instr.c());
        }
        true
    }

    /// Does any jump in the list fail to produce a value?
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let at = self.get_jump_control(list) as usize;
            if self.fs().proto.code[at].opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    fn invert_jump(&mut self, pc: i32) {
        let at = self.get_jump_control(pc) as usize;
        let instr = &mut self.fs_mut().proto.code[at];
        debug_assert!(instr.opcode().is_test());
        debug_assert!(!matches!(instr.opcode(), OpCode::TestSet | OpCode::Test));
        let a = instr.a();
        instr.set_a(if a == 0 { 1 } else { 0 });
    }

    fn cond_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> i32 {
        self.code_abc(op, a, b, c);
        self.jump()
    }

    /// Emit a conditional jump on `e`'s truthiness. `cond` is the
    /// truthiness that jumps.
    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> Result<i32, CompileError> {
        if let ExpKind::Relocatable(pc) = e.kind {
            let instr = self.fs().proto.code[pc as usize];
            if instr.opcode() == OpCode::Not && pc as usize == self.fs().proto.code_len() - 1 {
                // Fold the NOT into an inverted test.
                self.fs_mut().proto.code.pop();
                self.fs_mut().proto.line_info.pop();
                return Ok(self.cond_jump(OpCode::Test, instr.b(), 0, !cond as u32));
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        let reg = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("discharged expression is in a register"),
        };
        Ok(self.cond_jump(OpCode::TestSet, NO_REG, reg, cond as u32))
    }

    // ---- Expression discharge ----

    /// Turn variable accesses into instructions (or pending relocatable
    /// instructions); close open calls/varargs to one value.
    pub(crate) fn discharge_vars(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Local(reg) => e.kind = ExpKind::NonReloc(reg),
            ExpKind::Upvalue(idx) => {
                e.kind = ExpKind::Relocatable(self.code_abc(OpCode::GetUpval, 0, idx, 0));
            }
            ExpKind::Global(k) => {
                e.kind = ExpKind::Relocatable(self.code_abx(OpCode::GetGlobal, 0, k));
            }
            ExpKind::Indexed { table, key } => {
                self.free_reg(key);
                self.free_reg(table);
                e.kind = ExpKind::Relocatable(self.code_abc(OpCode::GetTable, 0, table, key));
            }
            ExpKind::Call(_) | ExpKind::Vararg(_) => self.set_one_return(e),
            _ => {} // there is one value available (somewhere)
        }
    }

    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u32) {
        self.discharge_vars(e);
        match e.kind {
            ExpKind::Nil => self.code_nil(reg, 1),
            ExpKind::False | ExpKind::True => {
                let b = (e.kind == ExpKind::True) as u32;
                self.code_abc(OpCode::LoadBool, reg, b, 0);
            }
            ExpKind::Constant(k) => {
                self.code_abx(OpCode::LoadK, reg, k);
            }
            ExpKind::Number(n) => {
                let k = self.number_constant(n);
                self.code_abx(OpCode::LoadK, reg, k);
            }
            ExpKind::Relocatable(pc) => {
                self.fs_mut().proto.code[pc as usize].set_a(reg);
            }
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.code_abc(OpCode::Move, reg, r, 0);
                }
            }
            ExpKind::Void | ExpKind::Jump(_) => return,
            _ => unreachable!("variable kinds were discharged"),
        }
        e.kind = ExpKind::NonReloc(reg);
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::NonReloc(_)) {
            self.reserve_regs(1)?;
            let reg = self.fs().freereg - 1;
            self.discharge_to_reg(e, reg);
        }
        Ok(())
    }

    /// Put the expression's value in `reg`, resolving any pending
    /// true/false jumps with LOADBOOL materialization when needed.
    fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u32) {
        self.discharge_to_reg(e, reg);
        if let ExpKind::Jump(pc) = e.kind {
            e.t = self.concat_jump(e.t, pc); // put this jump in the true list
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP; // position of an eventual LOADBOOL false
            let mut p_t = NO_JUMP; // position of an eventual LOADBOOL true
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if matches!(e.kind, ExpKind::Jump(_)) {
                    NO_JUMP
                } else {
                    self.jump()
                };
                p_f = self.code_label(reg, 0, 1);
                p_t = self.code_label(reg, 1, 0);
                self.patch_to_here(fj);
            }
            let final_pos = self.get_label();
            self.patch_list_aux(e.f, final_pos, reg, p_f);
            self.patch_list_aux(e.t, final_pos, reg, p_t);
        }
        e.init(ExpKind::NonReloc(reg));
    }

    /// LOADBOOL that doubles as a jump target (its C arg skips the next
    /// instruction when set).
    fn code_label(&mut self, a: u32, b: u32, jump: u32) -> i32 {
        self.get_label();
        self.code_abc(OpCode::LoadBool, a, b, jump)
    }

    pub(crate) fn exp_to_next_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e);
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.fs().freereg - 1;
        self.exp_to_reg(e, reg);
        Ok(())
    }

    /// Ensure the expression is in some register, returning it.
    pub(crate) fn exp_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<u32, CompileError> {
        self.discharge_vars(e);
        if let ExpKind::NonReloc(reg) = e.kind {
            if !e.has_jumps() {
                return Ok(reg);
            }
            if reg >= self.fs().nactvar {
                // Not a local: resolve the jumps onto it in place.
                self.exp_to_reg(e, reg);
                return Ok(reg);
            }
        }
        self.exp_to_next_reg(e)?;
        match e.kind {
            ExpKind::NonReloc(reg) => Ok(reg),
            _ => unreachable!(),
        }
    }

    /// Ensure the expression has a definite value (register or constant).
    pub(crate) fn exp_to_val(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if e.has_jumps() {
            self.exp_to_any_reg(e)?;
        } else {
            self.discharge_vars(e);
        }
        Ok(())
    }

    /// Encode the expression as an RK operand: a small constant index with
    /// the constant bit set, or a register.
    pub(crate) fn exp_to_rk(&mut self, e: &mut ExpDesc) -> Result<u32, CompileError> {
        self.exp_to_val(e)?;
        match e.kind {
            ExpKind::Nil | ExpKind::True | ExpKind::False | ExpKind::Number(_) => {
                if self.fs().proto.constants.len() <= MAX_INDEX_RK as usize {
                    let k = match e.kind {
                        ExpKind::Nil => self.nil_constant(),
                        ExpKind::True => self.bool_constant(true),
                        ExpKind::False => self.bool_constant(false),
                        ExpKind::Number(n) => self.number_constant(n),
                        _ => unreachable!(),
                    };
                    e.kind = ExpKind::Constant(k);
                    return Ok(rk_as_constant(k));
                }
            }
            ExpKind::Constant(k) if k <= MAX_INDEX_RK => {
                return Ok(rk_as_constant(k));
            }
            _ => {}
        }
        // Not a constant in the right range: put it in a register.
        self.exp_to_any_reg(e)
    }

    /// Assign `e` to the variable described by `var`.
    pub(crate) fn store_var(&mut self, var: &ExpDesc, e: &mut ExpDesc) -> Result<(), CompileError> {
        match var.kind {
            ExpKind::Local(reg) => {
                self.free_exp(e);
                self.exp_to_reg(e, reg);
                return Ok(());
            }
            ExpKind::Upvalue(idx) => {
                let reg = self.exp_to_any_reg(e)?;
                self.code_abc(OpCode::SetUpval, reg, idx, 0);
            }
            ExpKind::Global(k) => {
                let reg = self.exp_to_any_reg(e)?;
                self.code_abx(OpCode::SetGlobal, reg, k);
            }
            ExpKind::Indexed { table, key } => {
                let rk = self.exp_to_rk(e)?;
                self.code_abc(OpCode::SetTable, table, key, rk);
            }
            _ => unreachable!("invalid assignment target"),
        }
        self.free_exp(e);
        Ok(())
    }

    /// Close an open call or vararg to exactly one result.
    pub(crate) fn set_one_return(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call(pc) => {
                let a = self.fs().proto.code[pc as usize].a();
                e.kind = ExpKind::NonReloc(a);
            }
            ExpKind::Vararg(pc) => {
                self.fs_mut().proto.code[pc as usize].set_b(2);
                e.kind = ExpKind::Relocatable(pc);
            }
            _ => {}
        }
    }

    /// Fix the number of results an open call or vararg produces.
    pub(crate) fn set_returns(&mut self, e: &ExpDesc, nresults: i32) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Call(pc) => {
                self.fs_mut().proto.code[pc as usize].set_c((nresults + 1) as u32);
            }
            ExpKind::Vararg(pc) => {
                let freereg = self.fs().freereg;
                let instr = &mut self.fs_mut().proto.code[pc as usize];
                instr.set_b((nresults + 1) as u32);
                instr.set_a(freereg);
                self.reserve_regs(1)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn set_multret(&mut self, e: &ExpDesc) -> Result<(), CompileError> {
        self.set_returns(e, MULTRET)
    }

    // ---- Operators ----

    pub(crate) fn prefix(&mut self, op: UnOp, e: &mut ExpDesc) -> Result<(), CompileError> {
        let mut fake = ExpDesc::new(ExpKind::Number(0.0));
        match op {
            UnOp::Minus => {
                if !e.is_numeral() {
                    self.exp_to_any_reg(e)?;
                }
                self.code_arith(OpCode::Unm, e, &mut fake)
            }
            UnOp::Not => self.code_not(e),
            UnOp::Len => {
                self.exp_to_any_reg(e)?;
                self.code_arith(OpCode::Len, e, &mut fake)
            }
        }
    }

    /// Prepare the left operand before the right side is parsed.
    pub(crate) fn infix(&mut self, op: BinOp, e: &mut ExpDesc) -> Result<(), CompileError> {
        match op {
            BinOp::And => self.go_if_true(e),
            BinOp::Or => self.go_if_false(e),
            BinOp::Concat => self.exp_to_next_reg(e), // operand goes on the stack
            _ => {
                if !e.is_numeral() {
                    self.exp_to_rk(e)?;
                }
                Ok(())
            }
        }
    }

    /// Combine the operands once both sides are parsed.
    pub(crate) fn posfix(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        mut e2: ExpDesc,
    ) -> Result<(), CompileError> {
        match op {
            BinOp::And => {
                debug_assert_eq!(e1.t, NO_JUMP); // closed by go_if_true
                self.discharge_vars(&mut e2);
                e2.f = self.concat_jump(e2.f, e1.f);
                *e1 = e2;
            }
            BinOp::Or => {
                debug_assert_eq!(e1.f, NO_JUMP); // closed by go_if_false
                self.discharge_vars(&mut e2);
                e2.t = self.concat_jump(e2.t, e1.t);
                *e1 = e2;
            }
            BinOp::Concat => {
                self.exp_to_val(&mut e2)?;
                if let ExpKind::Relocatable(pc) = e2.kind {
                    if self.fs().proto.code[pc as usize].opcode() == OpCode::Concat {
                        // Chain onto the run: `a .. (b .. c)` becomes one
                        // CONCAT over consecutive registers.
                        let reg = match e1.kind {
                            ExpKind::NonReloc(r) => r,
                            _ => unreachable!("infix placed e1 on the stack"),
                        };
                        debug_assert_eq!(reg + 1, self.fs().proto.code[pc as usize].b());
                        self.free_exp(e1);
                        self.fs_mut().proto.code[pc as usize].set_b(reg);
                        e1.init(ExpKind::Relocatable(pc));
                        return Ok(());
                    }
                }
                self.exp_to_next_reg(&mut e2)?;
                self.code_arith(OpCode::Concat, e1, &mut e2)?;
            }
            BinOp::Add => self.code_arith(OpCode::Add, e1, &mut e2)?,
            BinOp::Sub => self.code_arith(OpCode::Sub, e1, &mut e2)?,
            BinOp::Mul => self.code_arith(OpCode::Mul, e1, &mut e2)?,
            BinOp::Div => self.code_arith(OpCode::Div, e1, &mut e2)?,
            BinOp::Mod => self.code_arith(OpCode::Mod, e1, &mut e2)?,
            BinOp::Pow => self.code_arith(OpCode::Pow, e1, &mut e2)?,
            BinOp::Eq => self.code_comparison(OpCode::Eq, true, e1, &mut e2)?,
            BinOp::NotEq => self.code_comparison(OpCode::Eq, false, e1, &mut e2)?,
            BinOp::Lt => self.code_comparison(OpCode::Lt, true, e1, &mut e2)?,
            BinOp::LtEq => self.code_comparison(OpCode::Le, true, e1, &mut e2)?,
            BinOp::Gt => self.code_comparison(OpCode::Lt, false, e1, &mut e2)?,
            BinOp::GtEq => self.code_comparison(OpCode::Le, false, e1, &mut e2)?,
        }
        Ok(())
    }

    fn code_arith(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        if const_fold(op, e1, e2) {
            return Ok(());
        }
        let o1 = self.exp_to_rk(e1)?;
        let o2 = if op != OpCode::Unm && op != OpCode::Len {
            self.exp_to_rk(e2)?
        } else {
            0
        };
        self.free_exp(e2);
        self.free_exp(e1);
        e1.kind = ExpKind::Relocatable(self.code_abc(op, 0, o1, o2));
        Ok(())
    }

    fn code_comparison(
        &mut self,
        op: OpCode,
        cond: bool,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let mut o1 = self.exp_to_rk(e1)?;
        let mut o2 = self.exp_to_rk(e2)?;
        self.free_exp(e2);
        self.free_exp(e1);
        let mut cond = cond;
        if !cond && op != OpCode::Eq {
            // Exchange the operands to express `>` and `>=` with `<`/`<=`.
            std::mem::swap(&mut o1, &mut o2);
            cond = true;
        }
        e1.kind = ExpKind::Jump(self.cond_jump(op, cond as u32, o1, o2));
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e);
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::Constant(_) | ExpKind::Number(_) | ExpKind::True => {
                e.kind = ExpKind::False;
            }
            ExpKind::Jump(pc) => self.invert_jump(pc),
            ExpKind::Relocatable(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let reg = match e.kind {
                    ExpKind::NonReloc(r) => r,
                    _ => unreachable!(),
                };
                e.kind = ExpKind::Relocatable(self.code_abc(OpCode::Not, 0, reg, 0));
            }
            _ => unreachable!(),
        }
        // Values produced for the old lists are inverted now; drop them.
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    /// Emit code so execution falls through when `e` is true; false exits
    /// join `e.f`.
    pub(crate) fn go_if_true(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e);
        let last_jump = match e.kind {
            ExpKind::Constant(_) | ExpKind::Number(_) | ExpKind::True => NO_JUMP,
            ExpKind::False => self.jump(),
            ExpKind::Jump(pc) => {
                self.invert_jump(pc);
                pc
            }
            _ => self.jump_on_cond(e, false)?,
        };
        e.f = self.concat_jump(e.f, last_jump);
        let t = e.t;
        self.patch_to_here(t);
        e.t = NO_JUMP;
        Ok(())
    }

    /// Emit code so execution falls through when `e` is false; true exits
    /// join `e.t`.
    pub(crate) fn go_if_false(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e);
        let last_jump = match e.kind {
            ExpKind::Nil | ExpKind::False => NO_JUMP,
            ExpKind::True => self.jump(),
            ExpKind::Jump(pc) => pc,
            _ => self.jump_on_cond(e, true)?,
        };
        e.t = self.concat_jump(e.t, last_jump);
        let f = e.f;
        self.patch_to_here(f);
        e.f = NO_JUMP;
        Ok(())
    }

    // ---- Structured emission helpers ----

    /// Load nil into `n` registers starting at `from`, merging with an
    /// immediately preceding LOADNIL when possible.
    pub(crate) fn code_nil(&mut self, from: u32, n: u32) {
        if self.current_pc() > self.fs().last_target {
            if self.current_pc() == 0 {
                // Function start: registers come up nil already.
                return;
            }
            let previous = self.current_pc() as usize - 1;
            let instr = self.fs().proto.code[previous];
            if instr.opcode() == OpCode::LoadNil {
                let pfrom = instr.a();
                let pto = instr.b();
                if pfrom <= from && from <= pto + 1 {
                    if from + n - 1 > pto {
                        self.fs_mut().proto.code[previous].set_b(from + n - 1);
                    }
                    return;
                }
            }
        }
        self.code_abc(OpCode::LoadNil, from, from + n - 1, 0);
    }

    /// Rewrite `t` as an indexed access `t[k]`.
    pub(crate) fn indexed(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> Result<(), CompileError> {
        let key = self.exp_to_rk(k)?;
        let table = match t.kind {
            ExpKind::NonReloc(r) | ExpKind::Local(r) => r,
            _ => unreachable!("table was placed in a register"),
        };
        t.kind = ExpKind::Indexed { table, key };
        Ok(())
    }

    /// Emit SELF for a method call `e:key(...)`.
    pub(crate) fn code_self(
        &mut self,
        e: &mut ExpDesc,
        key: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        self.exp_to_any_reg(e)?;
        let obj = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        self.free_exp(e);
        let func = self.fs().freereg;
        self.reserve_regs(2)?;
        let k = self.exp_to_rk(key)?;
        self.code_abc(OpCode::Self_, func, obj, k);
        self.free_exp(key);
        e.init(ExpKind::NonReloc(func));
        Ok(())
    }

    /// Emit SETLIST for a constructor batch.
    pub(crate) fn code_setlist(&mut self, base: u32, nelems: u32, tostore: i32) {
        let c = (nelems - 1) / FIELDS_PER_FLUSH + 1;
        let b = if tostore == MULTRET { 0 } else { tostore as u32 };
        debug_assert!(tostore != 0);
        if c <= MAX_C {
            self.code_abc(OpCode::SetList, base, b, c);
        } else {
            self.code_abc(OpCode::SetList, base, b, 0);
            // The batch index goes in the next raw instruction word.
            self.code(Instruction(c));
        }
        self.fs_mut().freereg = base + 1; // free registers holding list values
    }

    pub(crate) fn code_return(&mut self, first: u32, nret: i32) {
        self.code_abc(OpCode::Return, first, (nret + 1) as u32, 0);
    }
}

/// Compile-time arithmetic on two numeric literals. Division/modulo by
/// zero and NaN results are left for the runtime.
fn const_fold(op: OpCode, e1: &mut ExpDesc, e2: &ExpDesc) -> bool {
    if !e1.is_numeral() || !e2.is_numeral() {
        return false;
    }
    let v1 = match e1.kind {
        ExpKind::Number(n) => n,
        _ => unreachable!(),
    };
    let v2 = match e2.kind {
        ExpKind::Number(n) => n,
        _ => unreachable!(),
    };
    let r = match op {
        OpCode::Add => v1 + v2,
        OpCode::Sub => v1 - v2,
        OpCode::Mul => v1 * v2,
        OpCode::Div => {
            if v2 == 0.0 {
                return false; // do not attempt to divide by 0
            }
            v1 / v2
        }
        OpCode::Mod => {
            if v2 == 0.0 {
                return false;
            }
            number::lua_mod(v1, v2)
        }
        OpCode::Pow => number::lua_pow(v1, v2),
        OpCode::Unm => -v1,
        OpCode::Len => return false, // no constant folding for 'len'
        _ => unreachable!(),
    };
    if r.is_nan() {
        return false; // do not attempt to produce NaN
    }
    e1.kind = ExpKind::Number(r);
    true
}
