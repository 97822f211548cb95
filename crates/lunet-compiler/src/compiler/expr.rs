//! Expression descriptors: where a parsed (sub-)expression's value lives,
//! plus the pending conditional-jump lists that short-circuit evaluation
//! threads through the code.

/// Sentinel terminating a jump list.
pub const NO_JUMP: i32 = -1;

/// Where an expression's value currently lives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExpKind {
    /// No value (empty expression list, statement result).
    Void,
    Nil,
    True,
    False,
    /// Numeric literal, not yet in the constant pool.
    Number(f64),
    /// Constant pool index.
    Constant(u32),
    /// Local variable in a register.
    Local(u32),
    /// Upvalue at the given index.
    Upvalue(u32),
    /// Global variable: constant-pool index of its name.
    Global(u32),
    /// Indexed access: table register plus RK-encoded key.
    Indexed { table: u32, key: u32 },
    /// Result of a comparison: pc of the pending jump.
    Jump(i32),
    /// Instruction at pc whose destination register is not yet set.
    Relocatable(i32),
    /// Value fixed in a register.
    NonReloc(u32),
    /// Open function call: pc of the CALL instruction.
    Call(i32),
    /// Open vararg: pc of the VARARG instruction.
    Vararg(i32),
}

/// A parsed expression: its kind plus backpatch lists of jumps taken when
/// the expression is true (`t`) or false (`f`).
#[derive(Clone, Debug)]
pub struct ExpDesc {
    pub kind: ExpKind,
    /// Patch list of exits when true.
    pub t: i32,
    /// Patch list of exits when false.
    pub f: i32,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> Self {
        ExpDesc {
            kind,
            t: NO_JUMP,
            f: NO_JUMP,
        }
    }

    pub fn void() -> Self {
        ExpDesc::new(ExpKind::Void)
    }

    /// Reset to a new kind, clearing jump lists.
    pub fn init(&mut self, kind: ExpKind) {
        self.kind = kind;
        self.t = NO_JUMP;
        self.f = NO_JUMP;
    }

    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// A numeric literal with no pending jumps (foldable).
    pub fn is_numeral(&self) -> bool {
        matches!(self.kind, ExpKind::Number(_)) && self.t == NO_JUMP && self.f == NO_JUMP
    }

    /// Open call or vararg: may produce any number of values.
    pub fn has_multret(&self) -> bool {
        matches!(self.kind, ExpKind::Call(_) | ExpKind::Vararg(_))
    }
}

/// Binary operators, in the order the code generator dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    NotEq,
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Minus,
    Not,
    Len,
}

impl BinOp {
    /// (left, right) binding priorities; right < left makes the operator
    /// right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => (3, 3),
            BinOp::Concat => (5, 4), // right-associative
            BinOp::Add | BinOp::Sub => (6, 6),
            BinOp::Mul | BinOp::Div | BinOp::Mod => (7, 7),
            BinOp::Pow => (10, 9), // right-associative
        }
    }
}

/// Priority of unary operators.
pub const UNARY_PRIORITY: u8 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_descriptor_has_no_jumps() {
        let e = ExpDesc::new(ExpKind::Nil);
        assert!(!e.has_jumps());
        assert_eq!(e.t, NO_JUMP);
    }

    #[test]
    fn test_is_numeral() {
        assert!(ExpDesc::new(ExpKind::Number(1.0)).is_numeral());
        let mut e = ExpDesc::new(ExpKind::Number(1.0));
        e.t = 3;
        assert!(!e.is_numeral());
        assert!(!ExpDesc::new(ExpKind::Nil).is_numeral());
    }

    #[test]
    fn test_priorities() {
        let (_, add_r) = BinOp::Add.priority();
        let (mul_l, _) = BinOp::Mul.priority();
        assert!(mul_l > add_r);
        let (pow_l, pow_r) = BinOp::Pow.priority();
        assert!(pow_r < pow_l);
        let (cat_l, cat_r) = BinOp::Concat.priority();
        assert!(cat_r < cat_l);
        assert!(UNARY_PRIORITY > BinOp::Add.priority().0);
        assert!(UNARY_PRIORITY < BinOp::Pow.priority().0);
    }
}
