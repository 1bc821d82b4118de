//! Stack-machine bytecode consumed by the JIT.
//!
//! Functions operate on an operand stack of 32-bit values. Arguments are
//! the bottom slots on entry and results the bottom slots at `ret`.

mod ops;
pub mod parser;

pub use ops::*;
pub use parser::{ParseError, parse};
