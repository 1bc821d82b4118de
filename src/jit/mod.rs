//! Thumb JIT backend.
//!
//! This module turns stack-machine bytecode into ARMv6-M Thumb code:
//! - Instruction encoding (`thumb`)
//! - Constant synthesis (`immediate`)
//! - In-place assembler with branch relaxation and a literal pool
//! - Register window allocator for the operand stack
//! - The compiler driver tying them together
//!
//! Generated code calls back into the runtime through the VM table (see
//! `vmcall`) for frame setup, calls and division.

pub mod assembler;
pub mod compiler;
pub mod disasm;
pub mod immediate;
pub mod regalloc;
pub mod thumb;
pub mod vmcall;

pub use assembler::{Assembled, Assembler, Label, Literal};
pub use compiler::{CompiledFunction, compile, compile_function};
pub use regalloc::{AllocState, Placement, RegisterAllocator};

/// Errors that end the compilation of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitError {
    /// Code and literal pool met inside the buffer.
    BufferExhausted,
    /// More distinct literals than the pool can index.
    LiteralPoolFull,
    /// The frame would not be addressable with `[sp, #imm8*4]`.
    FrameTooLarge { words: usize },
    TooManyLabels { count: usize },
    TooManyArguments { count: usize },
    TooManyReturns { count: usize },
    /// A call target index that does not fit a VM table control word.
    FunctionOutOfRange { index: usize },
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::BufferExhausted => write!(f, "code buffer exhausted"),
            JitError::LiteralPoolFull => write!(f, "literal pool full"),
            JitError::FrameTooLarge { words } => {
                write!(f, "frame of {} words exceeds 255", words)
            }
            JitError::TooManyLabels { count } => {
                write!(f, "{} labels exceed the per-function limit", count)
            }
            JitError::TooManyArguments { count } => {
                write!(f, "{} arguments exceed the limit of {}", count, vmcall::MAX_ARGS)
            }
            JitError::TooManyReturns { count } => {
                write!(f, "{} results exceed the limit of {}", count, vmcall::MAX_RETURNS)
            }
            JitError::FunctionOutOfRange { index } => {
                write!(f, "function index {} exceeds {}", index, vmcall::MAX_FUNCTION)
            }
        }
    }
}

impl std::error::Error for JitError {}
