//! Single-pass Lua 5.1 compiler: source to Proto bytecode.
//!
//! Parsing functions call the code-generation primitives in `code.rs`
//! directly; no AST is materialized.

pub mod code;
pub mod expr;
pub mod scope;

use crate::lexer::{LexError, Lexer};
use crate::opcode::OpCode;
use crate::proto::{LocalVar, Proto};
use crate::token::Token;
use code::{ConstKey, FIELDS_PER_FLUSH, MULTRET};
use expr::{BinOp, ExpDesc, ExpKind, UnOp, NO_JUMP, UNARY_PRIORITY};
use lunet_core::number::number_to_display;
use lunet_core::string::{StringId, StringInterner};
use scope::{BlockScope, UpvalBinding, MAX_LOCAL_VARS, MAX_SYNTAX_DEPTH, MAX_UPVALUES};
use std::collections::HashMap;
use std::fmt;

/// Compiler error: malformed grammar (or a propagated lexical error).
/// Fatal to the compile; there is no recovery.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError {
            message: e.message,
            line: e.line,
        }
    }
}

/// State for one function being compiled.
pub(crate) struct FuncState {
    pub proto: Proto,
    /// Dedup map from constant value to pool index.
    pub(crate) constants_map: HashMap<ConstKey, u32>,
    /// Number of active local variables.
    pub nactvar: u32,
    /// Active-variable stack: indexes into `proto.local_vars`.
    pub actvar: Vec<u32>,
    /// Chain of open blocks.
    pub blocks: Vec<BlockScope>,
    /// First free register.
    pub freereg: u32,
    /// List of pending jumps to the next instruction.
    pub jpc: i32,
    /// pc of the last jump target (guards peephole rewrites).
    pub last_target: i32,
    /// Upvalue bindings, resolved while compiling nested closures.
    pub upvalues: Vec<UpvalBinding>,
    /// Set when a jump offset exceeded the sBx range; reported when the
    /// function closes.
    pub jump_overflow: bool,
}

impl FuncState {
    fn new(source: Option<StringId>, line_defined: u32) -> Self {
        let mut proto = Proto::new(source);
        proto.line_defined = line_defined;
        FuncState {
            proto,
            constants_map: HashMap::new(),
            nactvar: 0,
            actvar: Vec::new(),
            blocks: Vec::new(),
            freereg: 0,
            jpc: NO_JUMP,
            last_target: -1,
            upvalues: Vec::new(),
            jump_overflow: false,
        }
    }
}

/// Resolution of a name against enclosing scopes.
enum VarResolution {
    Global,
    Local(u32),
    Upval(u32),
}

/// The compiler: the lexer plus a stack of function states.
pub struct Compiler<'a> {
    pub(crate) lexer: Lexer<'a>,
    pub(crate) func_stack: Vec<FuncState>,
    source: Option<StringId>,
    nesting: u32,
}

/// Compile Lua source to a Proto. This is the public entry point.
pub fn compile(source: &[u8], chunk_name: &str) -> Result<(Proto, StringInterner), CompileError> {
    let (result, strings) = compile_with_strings(source, chunk_name, StringInterner::new());
    result.map(|proto| (proto, strings))
}

/// Compile reusing an existing interner (so a VM can load multiple chunks
/// into one string table). The interner is returned even when the compile
/// fails.
pub fn compile_with_strings(
    source: &[u8],
    chunk_name: &str,
    strings: StringInterner,
) -> (Result<Proto, CompileError>, StringInterner) {
    let mut compiler = Compiler::new(source, strings);
    let result = compiler.compile_chunk(chunk_name);
    let strings = std::mem::take(&mut compiler.lexer.strings);
    (result, strings)
}

impl<'a> Compiler<'a> {
    fn new(source: &'a [u8], strings: StringInterner) -> Self {
        Compiler {
            lexer: Lexer::with_strings(source, strings),
            func_stack: Vec::new(),
            source: None,
            nesting: 0,
        }
    }

    fn compile_chunk(&mut self, chunk_name: &str) -> Result<Proto, CompileError> {
        let source_id = self.lexer.strings.intern(chunk_name.as_bytes());
        self.source = Some(source_id);
        self.open_func(0);
        self.fs_mut().proto.is_vararg = true;
        self.chunk()?;
        match self.current_token()? {
            Token::Eof => {}
            _ => return Err(self.error_expected(&Token::Eof)),
        }
        let fs = self.close_func()?;
        debug_assert!(self.func_stack.is_empty());
        Ok(fs.proto)
    }

    pub(crate) fn fs(&self) -> &FuncState {
        self.func_stack.last().unwrap()
    }

    pub(crate) fn fs_mut(&mut self) -> &mut FuncState {
        self.func_stack.last_mut().unwrap()
    }

    // ---- Errors ----

    /// Text of the current token, for "near '...'" diagnostics.
    fn current_token_text(&self) -> String {
        match self.lexer.current() {
            Ok(st) => match &st.token {
                Token::Name(id) | Token::String(id) => {
                    self.lexer.strings.get_str_lossy(*id).into_owned()
                }
                Token::Number(n) => number_to_display(*n),
                other => format!("{other}"),
            },
            Err(_) => "?".to_string(),
        }
    }

    pub(crate) fn syntax_error(&self, msg: impl Into<String>) -> CompileError {
        CompileError {
            message: format!("{} near '{}'", msg.into(), self.current_token_text()),
            line: self.current_line(),
        }
    }

    fn error_expected(&self, tok: &Token) -> CompileError {
        self.syntax_error(format!("'{tok}' expected"))
    }

    fn error_limit(&self, limit: usize, what: &str) -> CompileError {
        let line_defined = self.fs().proto.line_defined;
        let message = if line_defined == 0 {
            format!("main function has more than {limit} {what}")
        } else {
            format!("function at line {line_defined} has more than {limit} {what}")
        };
        CompileError {
            message,
            line: self.current_line(),
        }
    }

    // ---- Token helpers ----

    fn current_token(&self) -> Result<&Token, CompileError> {
        self.lexer.current().map(|st| &st.token).map_err(|e| CompileError {
            message: e.message.clone(),
            line: e.line,
        })
    }

    /// Line of the current token.
    fn current_line(&self) -> u32 {
        match self.lexer.current() {
            Ok(st) => st.line,
            Err(e) => e.line,
        }
    }

    fn check(&self, expected: &Token) -> bool {
        self.current_token().map(|t| t == expected).unwrap_or(false)
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        Ok(self.lexer.advance()?.token)
    }

    fn test_next(&mut self, expected: &Token) -> Result<bool, CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.error_expected(expected))
        }
    }

    /// Like `expect`, but for block terminators: names the construct being
    /// closed when it opened on an earlier line.
    fn check_match(
        &mut self,
        what: &Token,
        who: &Token,
        where_line: u32,
    ) -> Result<(), CompileError> {
        if self.test_next(what)? {
            return Ok(());
        }
        if where_line == self.current_line() {
            Err(self.error_expected(what))
        } else {
            Err(self.syntax_error(format!(
                "'{what}' expected (to close '{who}' at line {where_line})"
            )))
        }
    }

    fn expect_name(&mut self) -> Result<StringId, CompileError> {
        match self.current_token()?.clone() {
            Token::Name(id) => {
                self.advance()?;
                Ok(id)
            }
            _ => Err(self.syntax_error("<name> expected")),
        }
    }

    /// Parse a name as a string constant expression.
    fn checkname(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        let name = self.expect_name()?;
        let k = self.string_constant(name);
        e.init(ExpKind::Constant(k));
        Ok(())
    }

    fn block_follow(&self) -> bool {
        matches!(
            self.current_token(),
            Ok(Token::Else) | Ok(Token::ElseIf) | Ok(Token::End) | Ok(Token::Until) | Ok(Token::Eof)
        )
    }

    fn enter_level(&mut self) -> Result<(), CompileError> {
        self.nesting += 1;
        if self.nesting > MAX_SYNTAX_DEPTH {
            return Err(self.syntax_error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.nesting -= 1;
    }

    // ---- Function open/close ----

    fn open_func(&mut self, line_defined: u32) {
        self.func_stack
            .push(FuncState::new(self.source, line_defined));
    }

    fn close_func(&mut self) -> Result<FuncState, CompileError> {
        self.remove_vars(0);
        self.code_return(0, 0); // final return
        if self.fs().jump_overflow {
            return Err(self.syntax_error("control structure too long"));
        }
        let mut fs = self.func_stack.pop().unwrap();
        fs.proto.num_upvalues = fs.upvalues.len() as u8;
        debug_assert!(fs.blocks.is_empty());
        Ok(fs)
    }

    // ---- Local variables and scopes ----

    fn register_local_var(&mut self, name: StringId) -> u32 {
        let fs = self.fs_mut();
        let idx = fs.proto.local_vars.len() as u32;
        fs.proto.local_vars.push(LocalVar {
            name,
            start_pc: 0,
            end_pc: 0,
        });
        idx
    }

    /// Declare a local; it only becomes active via `adjust_local_vars`.
    fn new_local_var(&mut self, name: StringId, n: usize) -> Result<(), CompileError> {
        if self.fs().nactvar as usize + n + 1 > MAX_LOCAL_VARS {
            return Err(self.error_limit(MAX_LOCAL_VARS, "local variables"));
        }
        let idx = self.register_local_var(name);
        let fs = self.fs_mut();
        let pos = fs.nactvar as usize + n;
        if fs.actvar.len() <= pos {
            fs.actvar.resize(pos + 1, 0);
        }
        fs.actvar[pos] = idx;
        Ok(())
    }

    fn adjust_local_vars(&mut self, nvars: usize) {
        let fs = self.fs_mut();
        fs.nactvar += nvars as u32;
        let pc = fs.proto.code_len() as u32;
        for i in 0..nvars {
            let idx = fs.actvar[fs.nactvar as usize - nvars + i];
            fs.proto.local_vars[idx as usize].start_pc = pc;
        }
    }

    fn remove_vars(&mut self, to_level: u32) {
        let fs = self.fs_mut();
        let pc = fs.proto.code_len() as u32;
        while fs.nactvar > to_level {
            fs.nactvar -= 1;
            let idx = fs.actvar[fs.nactvar as usize];
            fs.proto.local_vars[idx as usize].end_pc = pc;
        }
    }

    fn enter_block(&mut self, is_breakable: bool) {
        let nactvar = self.fs().nactvar;
        debug_assert_eq!(self.fs().freereg, nactvar);
        self.fs_mut()
            .blocks
            .push(BlockScope::new(is_breakable, nactvar));
    }

    fn leave_block(&mut self) {
        let bl = self.fs_mut().blocks.pop().expect("mismatched block");
        self.remove_vars(bl.nactvar);
        if bl.has_upval {
            self.code_abc(OpCode::Close, bl.nactvar, 0, 0);
        }
        debug_assert!(!bl.is_breakable || !bl.has_upval);
        let nactvar = self.fs().nactvar;
        self.fs_mut().freereg = nactvar;
        self.patch_to_here(bl.break_list);
    }

    // ---- Name resolution ----

    fn search_var_at(&self, fs_idx: usize, name: StringId) -> Option<u32> {
        let fs = &self.func_stack[fs_idx];
        for i in (0..fs.nactvar as usize).rev() {
            let idx = fs.actvar[i];
            if fs.proto.local_vars[idx as usize].name == name {
                return Some(i as u32);
            }
        }
        None
    }

    /// Mark the innermost block of `fs_idx` containing the local at
    /// `level` so the block emits CLOSE on exit.
    fn mark_upval(&mut self, fs_idx: usize, level: u32) {
        let fs = &mut self.func_stack[fs_idx];
        for b in fs.blocks.iter_mut().rev() {
            if b.nactvar <= level {
                b.has_upval = true;
                return;
            }
        }
    }

    /// Register an upvalue of function `fs_idx`, reusing an existing slot
    /// for the same binding.
    fn index_upvalue(
        &mut self,
        fs_idx: usize,
        name: StringId,
        from_local: bool,
        index: u32,
    ) -> Result<u32, CompileError> {
        let fs = &self.func_stack[fs_idx];
        for (i, up) in fs.upvalues.iter().enumerate() {
            if up.from_local == from_local && up.index == index {
                return Ok(i as u32);
            }
        }
        if fs.upvalues.len() + 1 > MAX_UPVALUES {
            return Err(self.error_limit(MAX_UPVALUES, "upvalues"));
        }
        let fs = &mut self.func_stack[fs_idx];
        fs.upvalues.push(UpvalBinding { from_local, index });
        fs.proto.upvalue_names.push(name);
        Ok((fs.upvalues.len() - 1) as u32)
    }

    /// Resolve a free variable through enclosing scopes: local register,
    /// captured upvalue chain, or global.
    fn single_var_aux(
        &mut self,
        fs_idx: usize,
        name: StringId,
        base: bool,
    ) -> Result<VarResolution, CompileError> {
        if let Some(level) = self.search_var_at(fs_idx, name) {
            if !base {
                // The local will be captured as an upvalue.
                self.mark_upval(fs_idx, level);
            }
            return Ok(VarResolution::Local(level));
        }
        if fs_idx == 0 {
            return Ok(VarResolution::Global);
        }
        match self.single_var_aux(fs_idx - 1, name, false)? {
            VarResolution::Global => Ok(VarResolution::Global),
            VarResolution::Local(reg) => {
                Ok(VarResolution::Upval(self.index_upvalue(fs_idx, name, true, reg)?))
            }
            VarResolution::Upval(idx) => {
                Ok(VarResolution::Upval(self.index_upvalue(fs_idx, name, false, idx)?))
            }
        }
    }

    fn single_var(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        let name = self.expect_name()?;
        let top = self.func_stack.len() - 1;
        match self.single_var_aux(top, name, true)? {
            VarResolution::Local(reg) => v.init(ExpKind::Local(reg)),
            VarResolution::Upval(idx) => v.init(ExpKind::Upvalue(idx)),
            VarResolution::Global => {
                let k = self.string_constant(name);
                v.init(ExpKind::Global(k));
            }
        }
        Ok(())
    }

    // ---- Expressions ----

    fn expr(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.sub_expression(v, 0)?;
        Ok(())
    }

    fn unary_op(&self) -> Option<UnOp> {
        match self.current_token() {
            Ok(Token::Not) => Some(UnOp::Not),
            Ok(Token::Minus) => Some(UnOp::Minus),
            Ok(Token::Hash) => Some(UnOp::Len),
            _ => None,
        }
    }

    fn binary_op(&self) -> Option<BinOp> {
        match self.current_token() {
            Ok(Token::Plus) => Some(BinOp::Add),
            Ok(Token::Minus) => Some(BinOp::Sub),
            Ok(Token::Star) => Some(BinOp::Mul),
            Ok(Token::Slash) => Some(BinOp::Div),
            Ok(Token::Percent) => Some(BinOp::Mod),
            Ok(Token::Caret) => Some(BinOp::Pow),
            Ok(Token::DotDot) => Some(BinOp::Concat),
            Ok(Token::NotEqual) => Some(BinOp::NotEq),
            Ok(Token::Equal) => Some(BinOp::Eq),
            Ok(Token::Less) => Some(BinOp::Lt),
            Ok(Token::LessEq) => Some(BinOp::LtEq),
            Ok(Token::Greater) => Some(BinOp::Gt),
            Ok(Token::GreaterEq) => Some(BinOp::GtEq),
            Ok(Token::And) => Some(BinOp::And),
            Ok(Token::Or) => Some(BinOp::Or),
            _ => None,
        }
    }

    /// Operator precedence parser:
    /// `subexpr -> (simpleexp | unop subexpr) { binop subexpr }`
    /// where `binop` binds tighter than `limit`. Returns the first
    /// operator that did not bind.
    fn sub_expression(
        &mut self,
        v: &mut ExpDesc,
        limit: u8,
    ) -> Result<Option<BinOp>, CompileError> {
        self.enter_level()?;
        if let Some(uop) = self.unary_op() {
            self.advance()?;
            self.sub_expression(v, UNARY_PRIORITY)?;
            self.prefix(uop, v)?;
        } else {
            self.simple_expression(v)?;
        }
        let mut op = self.binary_op();
        while let Some(binop) = op {
            let (left, right) = binop.priority();
            if left <= limit {
                break;
            }
            self.advance()?;
            self.infix(binop, v)?;
            let mut v2 = ExpDesc::void();
            let next_op = self.sub_expression(&mut v2, right)?;
            self.posfix(binop, v, v2)?;
            op = next_op;
        }
        self.leave_level();
        Ok(op)
    }

    /// simpleexp -> NUMBER | STRING | NIL | true | false | ... |
    ///              constructor | FUNCTION body | primaryexp
    fn simple_expression(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        match self.current_token()?.clone() {
            Token::Number(n) => {
                v.init(ExpKind::Number(n));
            }
            Token::String(id) => {
                let k = self.string_constant(id);
                v.init(ExpKind::Constant(k));
            }
            Token::Nil => v.init(ExpKind::Nil),
            Token::True => v.init(ExpKind::True),
            Token::False => v.init(ExpKind::False),
            Token::DotDotDot => {
                if !self.fs().proto.is_vararg {
                    return Err(self.syntax_error("cannot use '...' outside a vararg function"));
                }
                let pc = self.code_abc(OpCode::Vararg, 0, 1, 0);
                v.init(ExpKind::Vararg(pc));
            }
            Token::LBrace => return self.constructor(v),
            Token::Function => {
                let line = self.current_line();
                self.advance()?;
                return self.function_body(v, false, line);
            }
            _ => return self.primary_expression(v),
        }
        self.advance()?;
        Ok(())
    }

    /// prefixexp -> NAME | '(' expr ')'
    fn prefix_expression(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        match self.current_token()?.clone() {
            Token::LParen => {
                let line = self.current_line();
                self.advance()?;
                self.expr(v)?;
                self.check_match(&Token::RParen, &Token::LParen, line)?;
                self.discharge_vars(v);
                Ok(())
            }
            Token::Name(_) => self.single_var(v),
            _ => Err(self.syntax_error("unexpected symbol")),
        }
    }

    /// primaryexp ->
    ///   prefixexp { '.' NAME | '[' exp ']' | ':' NAME funcargs | funcargs }
    fn primary_expression(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.prefix_expression(v)?;
        loop {
            match self.current_token()?.clone() {
                Token::Dot => self.field(v)?,
                Token::LBracket => {
                    self.exp_to_any_reg(v)?;
                    let mut key = ExpDesc::void();
                    self.yindex(&mut key)?;
                    self.indexed(v, &mut key)?;
                }
                Token::Colon => {
                    self.advance()?;
                    let mut key = ExpDesc::void();
                    self.checkname(&mut key)?;
                    self.code_self(v, &mut key)?;
                    self.funcargs(v)?;
                }
                Token::LParen | Token::String(_) | Token::LBrace => {
                    self.exp_to_next_reg(v)?;
                    self.funcargs(v)?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// field -> ['.' | ':'] NAME
    fn field(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.exp_to_any_reg(v)?;
        self.advance()?; // skip the dot or colon
        let mut key = ExpDesc::void();
        self.checkname(&mut key)?;
        self.indexed(v, &mut key)
    }

    /// index -> '[' expr ']'
    fn yindex(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.advance()?; // skip '['
        self.expr(v)?;
        self.exp_to_val(v)?;
        self.expect(&Token::RBracket)
    }

    /// explist1 -> expr { ',' expr }. Returns the expression count; the
    /// last expression stays open in `v`.
    fn explist1(&mut self, v: &mut ExpDesc) -> Result<u32, CompileError> {
        let mut n = 1;
        self.expr(v)?;
        while self.test_next(&Token::Comma)? {
            self.exp_to_next_reg(v)?;
            self.expr(v)?;
            n += 1;
        }
        Ok(n)
    }

    fn funcargs(&mut self, f: &mut ExpDesc) -> Result<(), CompileError> {
        let line = self.current_line();
        let mut args = ExpDesc::void();
        match self.current_token()?.clone() {
            Token::LParen => {
                if line != self.lexer.last_line {
                    return Err(
                        self.syntax_error("ambiguous syntax (function call x new statement)")
                    );
                }
                self.advance()?;
                if self.check(&Token::RParen) {
                    args.kind = ExpKind::Void;
                } else {
                    self.explist1(&mut args)?;
                    self.set_multret(&args)?;
                }
                self.check_match(&Token::RParen, &Token::LParen, line)?;
            }
            Token::LBrace => self.constructor(&mut args)?,
            Token::String(id) => {
                let k = self.string_constant(id);
                args.init(ExpKind::Constant(k));
                self.advance()?;
            }
            _ => return Err(self.syntax_error("function arguments expected")),
        }
        let base = match f.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("callee was placed in a register"),
        };
        let nparams = if args.has_multret() {
            MULTRET
        } else {
            if !matches!(args.kind, ExpKind::Void) {
                self.exp_to_next_reg(&mut args)?;
            }
            (self.fs().freereg - (base + 1)) as i32
        };
        let pc = self.code_abc(OpCode::Call, base, (nparams + 1) as u32, 2);
        f.init(ExpKind::Call(pc));
        self.fix_line(line);
        // The call removes the function and arguments and leaves one
        // result (unless changed).
        self.fs_mut().freereg = base + 1;
        Ok(())
    }

    // ---- Table constructors ----

    fn constructor(&mut self, t: &mut ExpDesc) -> Result<(), CompileError> {
        let line = self.current_line();
        let pc = self.code_abc(OpCode::NewTable, 0, 0, 0);
        let mut na = 0u32; // array elements
        let mut nh = 0u32; // record elements
        let mut tostore = 0u32; // array elements pending flush
        let mut v = ExpDesc::void(); // last list item read
        t.init(ExpKind::Relocatable(pc));
        self.exp_to_next_reg(t)?; // fix table at stack top
        let table_reg = match t.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        self.expect(&Token::LBrace)?;
        loop {
            if self.check(&Token::RBrace) {
                break;
            }
            // Close the previous list field.
            if !matches!(v.kind, ExpKind::Void) {
                self.exp_to_next_reg(&mut v)?;
                v = ExpDesc::void();
                if tostore == FIELDS_PER_FLUSH {
                    self.code_setlist(table_reg, na, tostore as i32);
                    tostore = 0;
                }
            }
            match self.current_token()?.clone() {
                Token::Name(_) => {
                    // Either a `name = expr` record field or a list item.
                    if self.lexer.peek_ahead()?.token == Token::Assign {
                        self.record_field(table_reg, &mut nh)?;
                    } else {
                        self.expr(&mut v)?;
                        na += 1;
                        tostore += 1;
                    }
                }
                Token::LBracket => self.record_field(table_reg, &mut nh)?,
                _ => {
                    self.expr(&mut v)?;
                    na += 1;
                    tostore += 1;
                }
            }
            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semi)? {
                break;
            }
        }
        self.check_match(&Token::RBrace, &Token::LBrace, line)?;
        if tostore > 0 {
            if v.has_multret() {
                self.set_multret(&v)?;
                self.code_setlist(table_reg, na, MULTRET);
                na -= 1; // the last expression provides an unknown count
            } else {
                if !matches!(v.kind, ExpKind::Void) {
                    self.exp_to_next_reg(&mut v)?;
                }
                self.code_setlist(table_reg, na, tostore as i32);
            }
        }
        // Record the size hints in the NEWTABLE instruction.
        let instr = &mut self.fs_mut().proto.code[pc as usize];
        instr.set_b(int_to_fb(na));
        instr.set_c(int_to_fb(nh));
        Ok(())
    }

    /// recfield -> (NAME | '[' exp1 ']') = exp1
    fn record_field(&mut self, table_reg: u32, nh: &mut u32) -> Result<(), CompileError> {
        let reg = self.fs().freereg;
        let mut key = ExpDesc::void();
        if matches!(self.current_token()?, Token::Name(_)) {
            self.checkname(&mut key)?;
        } else {
            self.yindex(&mut key)?;
        }
        *nh += 1;
        self.expect(&Token::Assign)?;
        let rk_key = self.exp_to_rk(&mut key)?;
        let mut val = ExpDesc::void();
        self.expr(&mut val)?;
        let rk_val = self.exp_to_rk(&mut val)?;
        self.code_abc(OpCode::SetTable, table_reg, rk_key, rk_val);
        self.fs_mut().freereg = reg; // free registers
        Ok(())
    }

    // ---- Function bodies ----

    /// body -> '(' parlist ')' chunk END
    fn function_body(
        &mut self,
        e: &mut ExpDesc,
        need_self: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        self.open_func(line);
        self.expect(&Token::LParen)?;
        if need_self {
            let self_name = self.lexer.strings.intern(b"self");
            self.new_local_var(self_name, 0)?;
            self.adjust_local_vars(1);
        }
        self.parlist()?;
        self.expect(&Token::RParen)?;
        self.chunk()?;
        self.fs_mut().proto.last_line_defined = self.lexer.line();
        self.check_match(&Token::End, &Token::Function, line)?;
        let child = self.close_func()?;
        self.push_closure(child, e)
    }

    /// parlist -> [ param { ',' param } ]
    fn parlist(&mut self) -> Result<(), CompileError> {
        let mut nparams = 0;
        if !self.check(&Token::RParen) {
            loop {
                match self.current_token()?.clone() {
                    Token::Name(name) => {
                        self.advance()?;
                        self.new_local_var(name, nparams)?;
                        nparams += 1;
                    }
                    Token::DotDotDot => {
                        self.advance()?;
                        self.fs_mut().proto.is_vararg = true;
                    }
                    _ => return Err(self.syntax_error("<name> or '...' expected")),
                }
                if self.fs().proto.is_vararg || !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.adjust_local_vars(nparams);
        let nactvar = self.fs().nactvar;
        self.fs_mut().proto.num_params = nactvar as u8;
        self.reserve_regs(nactvar)
    }

    /// Emit CLOSURE plus one pseudo-instruction per upvalue binding; the
    /// VM consumes them when it builds the closure.
    fn push_closure(&mut self, child: FuncState, v: &mut ExpDesc) -> Result<(), CompileError> {
        let np = self.fs().proto.protos.len() as u32;
        self.fs_mut().proto.protos.push(child.proto);
        let pc = self.code_abx(OpCode::Closure, 0, np);
        v.init(ExpKind::Relocatable(pc));
        for binding in &child.upvalues {
            let op = if binding.from_local {
                OpCode::Move
            } else {
                OpCode::GetUpval
            };
            self.code_abc(op, 0, binding.index, 0);
        }
        Ok(())
    }

    // ---- Statements ----

    /// chunk -> { stat [';'] }
    fn chunk(&mut self) -> Result<(), CompileError> {
        let mut is_last = false;
        self.enter_level()?;
        while !is_last && !self.block_follow() {
            is_last = self.statement()?;
            self.test_next(&Token::Semi)?;
            let nactvar = self.fs().nactvar;
            debug_assert!(self.fs().freereg >= nactvar);
            self.fs_mut().freereg = nactvar;
        }
        self.leave_level();
        Ok(())
    }

    /// block -> chunk, in its own scope.
    fn block(&mut self) -> Result<(), CompileError> {
        self.enter_block(false);
        self.chunk()?;
        debug_assert_eq!(self.fs().blocks.last().unwrap().break_list, NO_JUMP);
        self.leave_block();
        Ok(())
    }

    /// Returns true when the statement must be the last in its block.
    fn statement(&mut self) -> Result<bool, CompileError> {
        let line = self.current_line();
        match self.current_token()? {
            Token::If => {
                self.stat_if(line)?;
                Ok(false)
            }
            Token::While => {
                self.stat_while(line)?;
                Ok(false)
            }
            Token::Do => {
                self.advance()?;
                self.block()?;
                self.check_match(&Token::End, &Token::Do, line)?;
                Ok(false)
            }
            Token::For => {
                self.stat_for(line)?;
                Ok(false)
            }
            Token::Repeat => {
                self.stat_repeat(line)?;
                Ok(false)
            }
            Token::Function => {
                self.stat_function(line)?;
                Ok(false)
            }
            Token::Local => {
                self.advance()?;
                if self.test_next(&Token::Function)? {
                    self.stat_local_function(line)?;
                } else {
                    self.stat_local()?;
                }
                Ok(false)
            }
            Token::Return => {
                self.stat_return()?;
                Ok(true)
            }
            Token::Break => {
                self.advance()?;
                self.break_stat()?;
                Ok(true)
            }
            _ => {
                self.stat_expr_or_assign()?;
                Ok(false)
            }
        }
    }

    /// cond -> exp, producing the false-exit jump list.
    fn cond(&mut self) -> Result<i32, CompileError> {
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        if v.kind == ExpKind::Nil {
            v.kind = ExpKind::False; // all falses are equal here
        }
        self.go_if_true(&mut v)?;
        Ok(v.f)
    }

    /// ifstat -> IF cond THEN block {ELSEIF cond THEN block} [ELSE block] END
    fn stat_if(&mut self, line: u32) -> Result<(), CompileError> {
        let mut escape_list = NO_JUMP;
        let mut false_list = self.test_then_block()?;
        while self.check(&Token::ElseIf) {
            let j = self.jump();
            escape_list = self.concat_jump(escape_list, j);
            self.patch_to_here(false_list);
            false_list = self.test_then_block()?;
        }
        if self.check(&Token::Else) {
            let j = self.jump();
            escape_list = self.concat_jump(escape_list, j);
            self.patch_to_here(false_list);
            self.advance()?; // skip ELSE (after patch, for correct line info)
            self.block()?;
        } else {
            escape_list = self.concat_jump(escape_list, false_list);
        }
        self.patch_to_here(escape_list);
        self.check_match(&Token::End, &Token::If, line)
    }

    fn test_then_block(&mut self) -> Result<i32, CompileError> {
        self.advance()?; // skip IF or ELSEIF
        let cond_exit = self.cond()?;
        self.expect(&Token::Then)?;
        self.block()?;
        Ok(cond_exit)
    }

    /// whilestat -> WHILE cond DO block END
    fn stat_while(&mut self, line: u32) -> Result<(), CompileError> {
        self.advance()?; // skip WHILE
        let while_init = self.get_label();
        let cond_exit = self.cond()?;
        self.enter_block(true);
        self.expect(&Token::Do)?;
        self.block()?;
        let back = self.jump();
        self.patch_list(back, while_init);
        self.check_match(&Token::End, &Token::While, line)?;
        self.leave_block();
        self.patch_to_here(cond_exit); // false conditions finish the loop
        Ok(())
    }

    /// repeatstat -> REPEAT block UNTIL cond
    /// The condition can see the block's locals, so the scope only closes
    /// after it is compiled.
    fn stat_repeat(&mut self, line: u32) -> Result<(), CompileError> {
        let repeat_init = self.get_label();
        self.enter_block(true); // loop block
        self.enter_block(false); // scope block
        self.advance()?; // skip REPEAT
        self.chunk()?;
        self.check_match(&Token::Until, &Token::Repeat, line)?;
        let cond_exit = self.cond()?;
        let upval = self.fs().blocks.last().unwrap().has_upval;
        if !upval {
            self.leave_block(); // finish scope
            self.patch_list(cond_exit, repeat_init); // close the loop
        } else {
            // Locals are captured: the backward path must CLOSE them.
            self.break_stat()?; // if condition then break
            self.patch_to_here(cond_exit); // else...
            self.leave_block(); // finish scope...
            let j = self.jump();
            self.patch_list(j, repeat_init); // and repeat
        }
        self.leave_block(); // finish loop
        Ok(())
    }

    /// forstat -> FOR (fornum | forlist) END
    fn stat_for(&mut self, line: u32) -> Result<(), CompileError> {
        self.enter_block(true); // scope for loop and control variables
        self.advance()?; // skip FOR
        let varname = self.expect_name()?;
        match self.current_token()? {
            Token::Assign => self.stat_for_num(varname, line)?,
            Token::Comma | Token::In => self.stat_for_list(varname)?,
            _ => return Err(self.syntax_error("'=' or 'in' expected")),
        }
        self.check_match(&Token::End, &Token::For, line)?;
        self.leave_block(); // break jumps to this point
        Ok(())
    }

    fn exp1(&mut self) -> Result<(), CompileError> {
        let mut e = ExpDesc::void();
        self.expr(&mut e)?;
        self.exp_to_next_reg(&mut e)
    }

    /// fornum -> NAME = exp1,exp1[,exp1] forbody
    fn stat_for_num(&mut self, varname: StringId, line: u32) -> Result<(), CompileError> {
        let base = self.fs().freereg;
        let index_name = self.lexer.strings.intern(b"(for index)");
        let limit_name = self.lexer.strings.intern(b"(for limit)");
        let step_name = self.lexer.strings.intern(b"(for step)");
        self.new_local_var(index_name, 0)?;
        self.new_local_var(limit_name, 1)?;
        self.new_local_var(step_name, 2)?;
        self.new_local_var(varname, 3)?;
        self.advance()?; // skip '='
        self.exp1()?; // initial value
        self.expect(&Token::Comma)?;
        self.exp1()?; // limit
        if self.test_next(&Token::Comma)? {
            self.exp1()?; // optional step
        } else {
            // default step = 1
            let k = self.number_constant(1.0);
            let reg = self.fs().freereg;
            self.code_abx(OpCode::LoadK, reg, k);
            self.reserve_regs(1)?;
        }
        self.for_body(base, line, 1, true)
    }

    /// forlist -> NAME {,NAME} IN explist1 forbody
    fn stat_for_list(&mut self, index_name: StringId) -> Result<(), CompileError> {
        let base = self.fs().freereg;
        let gen_name = self.lexer.strings.intern(b"(for generator)");
        let state_name = self.lexer.strings.intern(b"(for state)");
        let control_name = self.lexer.strings.intern(b"(for control)");
        self.new_local_var(gen_name, 0)?;
        self.new_local_var(state_name, 1)?;
        self.new_local_var(control_name, 2)?;
        let mut nvars = 3;
        self.new_local_var(index_name, nvars)?;
        nvars += 1;
        while self.test_next(&Token::Comma)? {
            let name = self.expect_name()?;
            self.new_local_var(name, nvars)?;
            nvars += 1;
        }
        self.expect(&Token::In)?;
        let line = self.lexer.line();
        let mut e = ExpDesc::void();
        let nexps = self.explist1(&mut e)?;
        self.adjust_assign(3, nexps as usize, &mut e)?;
        self.check_stack(3)?; // extra space to call the iterator
        self.for_body(base, line, (nvars - 3) as u32, false)
    }

    /// forbody -> DO block
    fn for_body(
        &mut self,
        base: u32,
        line: u32,
        nvars: u32,
        is_numeric: bool,
    ) -> Result<(), CompileError> {
        self.adjust_local_vars(3); // control variables
        self.expect(&Token::Do)?;
        let prep = if is_numeric {
            self.code_asbx(OpCode::ForPrep, base, NO_JUMP)
        } else {
            self.jump()
        };
        self.enter_block(false); // scope for declared variables
        self.adjust_local_vars(nvars as usize);
        self.reserve_regs(nvars)?;
        self.block()?;
        self.leave_block();
        self.patch_to_here(prep);
        let end_for = if is_numeric {
            self.code_asbx(OpCode::ForLoop, base, NO_JUMP)
        } else {
            self.code_abc(OpCode::TForLoop, base, 0, nvars)
        };
        self.fix_line(line); // pretend the loop instruction starts the loop
        let back = if is_numeric { end_for } else { self.jump() };
        self.patch_list(back, prep + 1);
        Ok(())
    }

    /// funcstat -> FUNCTION funcname body
    fn stat_function(&mut self, line: u32) -> Result<(), CompileError> {
        self.advance()?; // skip FUNCTION
        let mut v = ExpDesc::void();
        let need_self = self.funcname(&mut v)?;
        let mut b = ExpDesc::void();
        self.function_body(&mut b, need_self, line)?;
        self.store_var(&v, &mut b)?;
        self.fix_line(line); // definition "happens" in the first line
        Ok(())
    }

    /// funcname -> NAME {field} [':' NAME]
    fn funcname(&mut self, v: &mut ExpDesc) -> Result<bool, CompileError> {
        self.single_var(v)?;
        let mut need_self = false;
        while self.check(&Token::Dot) {
            self.field(v)?;
        }
        if self.check(&Token::Colon) {
            need_self = true;
            self.field(v)?;
        }
        Ok(need_self)
    }

    /// local function NAME body — the name is in scope inside the body,
    /// so recursion works.
    fn stat_local_function(&mut self, line: u32) -> Result<(), CompileError> {
        let name = self.expect_name()?;
        self.new_local_var(name, 0)?;
        let reg = self.fs().freereg;
        let v = ExpDesc::new(ExpKind::Local(reg));
        self.reserve_regs(1)?;
        self.adjust_local_vars(1);
        let mut b = ExpDesc::void();
        self.function_body(&mut b, false, line)?;
        self.store_var(&v, &mut b)?;
        // Debug info only sees the variable after this point.
        let fs = self.fs_mut();
        let idx = fs.actvar[fs.nactvar as usize - 1];
        fs.proto.local_vars[idx as usize].start_pc = fs.proto.code_len() as u32;
        Ok(())
    }

    /// localstat -> LOCAL NAME {',' NAME} ['=' explist1]
    fn stat_local(&mut self) -> Result<(), CompileError> {
        let mut nvars = 0;
        loop {
            let name = self.expect_name()?;
            self.new_local_var(name, nvars)?;
            nvars += 1;
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        let mut e = ExpDesc::void();
        let nexps = if self.test_next(&Token::Assign)? {
            self.explist1(&mut e)? as usize
        } else {
            0
        };
        self.adjust_assign(nvars, nexps, &mut e)?;
        self.adjust_local_vars(nvars);
        Ok(())
    }

    /// retstat -> RETURN [explist1]
    fn stat_return(&mut self) -> Result<(), CompileError> {
        self.advance()?; // skip RETURN
        let first;
        let nret: i32;
        if self.block_follow() || self.check(&Token::Semi) {
            first = 0;
            nret = 0;
        } else {
            let mut e = ExpDesc::void();
            let n = self.explist1(&mut e)? as i32;
            if e.has_multret() {
                self.set_multret(&e)?;
                if let ExpKind::Call(pc) = e.kind {
                    if n == 1 {
                        // A lone call in return position becomes a tail
                        // call reusing the caller's frame.
                        self.fs_mut().proto.code[pc as usize].set_opcode(OpCode::TailCall);
                        debug_assert_eq!(
                            self.fs().proto.code[pc as usize].a(),
                            self.fs().nactvar
                        );
                    }
                }
                first = self.fs().nactvar;
                nret = MULTRET;
            } else if n == 1 {
                first = self.exp_to_any_reg(&mut e)?;
                nret = 1;
            } else {
                self.exp_to_next_reg(&mut e)?;
                first = self.fs().nactvar;
                nret = n;
                debug_assert_eq!(nret, (self.fs().freereg - first) as i32);
            }
        }
        self.code_return(first, nret);
        Ok(())
    }

    fn break_stat(&mut self) -> Result<(), CompileError> {
        let mut upval = false;
        let mut target = None;
        for (i, b) in self.fs().blocks.iter().enumerate().rev() {
            if b.is_breakable {
                target = Some(i);
                break;
            }
            upval |= b.has_upval;
        }
        let Some(i) = target else {
            return Err(self.syntax_error("no loop to break"));
        };
        if upval {
            let nactvar = self.fs().blocks[i].nactvar;
            self.code_abc(OpCode::Close, nactvar, 0, 0);
        }
        let j = self.jump();
        let break_list = self.fs().blocks[i].break_list;
        let merged = self.concat_jump(break_list, j);
        self.fs_mut().blocks[i].break_list = merged;
        Ok(())
    }

    /// stat -> func | assignment
    fn stat_expr_or_assign(&mut self) -> Result<(), CompileError> {
        let mut v = ExpDesc::void();
        self.primary_expression(&mut v)?;
        if let ExpKind::Call(pc) = v.kind {
            // A call statement uses no results.
            self.fs_mut().proto.code[pc as usize].set_c(1);
            Ok(())
        } else {
            self.assignment(v)
        }
    }

    fn assignment(&mut self, first: ExpDesc) -> Result<(), CompileError> {
        let mut targets = vec![first];
        loop {
            let valid = matches!(
                targets.last().unwrap().kind,
                ExpKind::Local(_) | ExpKind::Upvalue(_) | ExpKind::Global(_) | ExpKind::Indexed { .. }
            );
            if !valid {
                return Err(self.syntax_error("syntax error"));
            }
            if self.test_next(&Token::Comma)? {
                let mut nv = ExpDesc::void();
                self.primary_expression(&mut nv)?;
                if let ExpKind::Local(reg) = nv.kind {
                    self.check_assignment_conflict(&mut targets, reg)?;
                }
                targets.push(nv);
            } else {
                self.expect(&Token::Assign)?;
                break;
            }
        }

        let nvars = targets.len();
        let mut e = ExpDesc::void();
        let nexps = self.explist1(&mut e)? as usize;
        if nexps != nvars {
            self.adjust_assign(nvars, nexps, &mut e)?;
            if nexps > nvars {
                self.fs_mut().freereg -= (nexps - nvars) as u32; // remove extra values
            }
        } else {
            self.set_one_return(&mut e);
            self.store_var(targets.last().unwrap(), &mut e)?;
            targets.pop();
        }
        // Remaining targets take values off the top of the stack.
        for target in targets.iter().rev() {
            let mut val = ExpDesc::new(ExpKind::NonReloc(self.fs().freereg - 1));
            self.store_var(target, &mut val)?;
        }
        Ok(())
    }

    /// A local on the left of a multiple assignment may also appear inside
    /// an earlier indexed target; when it does, the earlier target must
    /// use a saved copy of the local's current value.
    fn check_assignment_conflict(
        &mut self,
        targets: &mut [ExpDesc],
        vreg: u32,
    ) -> Result<(), CompileError> {
        let extra = self.fs().freereg; // eventual position of the saved copy
        let mut conflict = false;
        for t in targets.iter_mut() {
            if let ExpKind::Indexed { table, key } = &mut t.kind {
                if *table == vreg {
                    conflict = true;
                    *table = extra;
                }
                if *key == vreg {
                    conflict = true;
                    *key = extra;
                }
            }
        }
        if conflict {
            self.code_abc(OpCode::Move, extra, vreg, 0); // make the copy
            self.reserve_regs(1)?;
        }
        Ok(())
    }

    /// Balance `nvars` assignment targets against `nexps` parsed values,
    /// expanding or truncating the last expression and nil-filling.
    fn adjust_assign(
        &mut self,
        nvars: usize,
        nexps: usize,
        e: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let mut extra = nvars as i32 - nexps as i32;
        if e.has_multret() {
            extra += 1; // includes the call itself
            if extra < 0 {
                extra = 0;
            }
            self.set_returns(e, extra)?; // the last expression provides the difference
            if extra > 1 {
                self.reserve_regs((extra - 1) as u32)?;
            }
        } else {
            if !matches!(e.kind, ExpKind::Void) {
                self.exp_to_next_reg(e)?; // close last expression
            }
            if extra > 0 {
                let reg = self.fs().freereg;
                self.reserve_regs(extra as u32)?;
                self.code_nil(reg, extra as u32);
            }
        }
        Ok(())
    }
}

/// "Floating byte" encoding for constructor size hints:
/// `(eeeeexxx)` meaning `(1xxx) << (eeeee - 1)` when `eeeee > 0`.
fn int_to_fb(mut x: u32) -> u32 {
    let mut e = 0;
    while x >= 16 {
        x = (x + 1) >> 1;
        e += 1;
    }
    if x < 8 {
        x
    } else {
        ((e + 1) << 3) | (x - 8)
    }
}

/// Decode the floating-byte encoding back to a size hint.
pub fn fb_to_int(x: u32) -> u32 {
    let e = (x >> 3) & 0x1f;
    if e == 0 {
        x
    } else {
        ((x & 7) + 8) << (e - 1)
    }
}
