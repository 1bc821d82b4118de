use serde::Serialize;
use std::fmt;

/// Binary operators. Operands are popped right then left; the result is
/// pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    /// Shift left by the low byte of the right operand.
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
    /// Signed division.
    Div,
    /// Signed remainder.
    Rem,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 11] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Xor,
        BinaryOp::Shl,
        BinaryOp::Shr,
        BinaryOp::Sar,
        BinaryOp::Div,
        BinaryOp::Rem,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Comparisons of `left` against `right` for conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    Eq,
    Ne,
    /// Signed less than.
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned lower.
    Lo,
    /// Unsigned lower or same.
    Ls,
    /// Unsigned higher.
    Hi,
    /// Unsigned higher or same.
    Hs,
}

impl Compare {
    pub const ALL: [Compare; 10] = [
        Compare::Eq,
        Compare::Ne,
        Compare::Lt,
        Compare::Le,
        Compare::Gt,
        Compare::Ge,
        Compare::Lo,
        Compare::Ls,
        Compare::Hi,
        Compare::Hs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Compare::Eq => "eq",
            Compare::Ne => "ne",
            Compare::Lt => "lt",
            Compare::Le => "le",
            Compare::Gt => "gt",
            Compare::Ge => "ge",
            Compare::Lo => "lo",
            Compare::Ls => "ls",
            Compare::Hi => "hi",
            Compare::Hs => "hs",
        }
    }
}

/// One bytecode instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// Push a constant.
    Immediate(i32),
    Binary(BinaryOp),
    Unary(UnaryOp),
    /// Pop right and left, branch to the label if `left cond right`.
    CompareBranch { cond: Compare, label: usize },
    Jump(usize),
    /// Define the next label in declaration order.
    Label,
    /// Push a copy of the slot at this depth.
    Pull(usize),
    /// Pop the top and store it into the slot at this depth.
    Shove(usize),
    /// Pop this many slots.
    Drop(usize),
    /// Pop `args` arguments, call `function`, push `returns` results.
    Call { function: usize, args: usize, returns: usize },
    Return,
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Immediate(v) => write!(f, "imm {}", v),
            Insn::Binary(op) => write!(f, "{}", binary_name(*op)),
            Insn::Unary(UnaryOp::Neg) => write!(f, "neg"),
            Insn::Unary(UnaryOp::Not) => write!(f, "not"),
            Insn::CompareBranch { cond, label } => write!(f, "b{} L{}", cond.name(), label),
            Insn::Jump(label) => write!(f, "jump L{}", label),
            Insn::Label => write!(f, "label"),
            Insn::Pull(n) => write!(f, "pull {}", n),
            Insn::Shove(n) => write!(f, "shove {}", n),
            Insn::Drop(n) => write!(f, "drop {}", n),
            Insn::Call { function, args, returns } => {
                write!(f, "call #{} ({} -> {})", function, args, returns)
            }
            Insn::Return => write!(f, "ret"),
        }
    }
}

pub fn binary_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Xor => "xor",
        BinaryOp::Shl => "shl",
        BinaryOp::Shr => "shr",
        BinaryOp::Sar => "sar",
        BinaryOp::Div => "div",
        BinaryOp::Rem => "rem",
    }
}

/// Static facts about a function that the compiler needs up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FunctionShape {
    pub args: usize,
    pub returns: usize,
    /// Number of `Label` instructions.
    pub labels: usize,
    /// Deepest operand stack reached, arguments included.
    pub max_depth: usize,
    /// Whether a call directly followed by a return may reuse the frame.
    pub tail_call: bool,
}

/// A pull-style source of bytecode for one function.
pub trait BytecodeReader {
    fn shape(&self) -> &FunctionShape;
    fn next_insn(&mut self) -> Option<Insn>;
}

/// A parsed function.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub shape: FunctionShape,
    pub code: Vec<Insn>,
}

impl Function {
    pub fn reader(&self) -> FunctionReader<'_> {
        FunctionReader { shape: &self.shape, code: &self.code, pc: 0 }
    }
}

/// Reads the instructions of a [`Function`] in order.
pub struct FunctionReader<'a> {
    shape: &'a FunctionShape,
    code: &'a [Insn],
    pc: usize,
}

impl BytecodeReader for FunctionReader<'_> {
    fn shape(&self) -> &FunctionShape {
        self.shape
    }

    fn next_insn(&mut self) -> Option<Insn> {
        let insn = self.code.get(self.pc).copied();
        self.pc += 1;
        insn
    }
}

/// All functions of one source file. Calls refer to functions by index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub functions: Vec<Function>,
}

impl Module {
    pub fn find(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_yields_code_in_order() {
        let function = Function {
            name: "f".to_string(),
            shape: FunctionShape { args: 1, returns: 1, max_depth: 1, ..Default::default() },
            code: vec![Insn::Immediate(1), Insn::Binary(BinaryOp::Add), Insn::Return],
        };
        let mut reader = function.reader();
        assert_eq!(reader.shape().args, 1);
        assert_eq!(reader.next_insn(), Some(Insn::Immediate(1)));
        assert_eq!(reader.next_insn(), Some(Insn::Binary(BinaryOp::Add)));
        assert_eq!(reader.next_insn(), Some(Insn::Return));
        assert_eq!(reader.next_insn(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Insn::CompareBranch { cond: Compare::Ge, label: 2 }.to_string(), "bge L2");
        assert_eq!(Insn::Binary(BinaryOp::Sar).to_string(), "sar");
    }
}
