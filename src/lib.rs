//! thumbjit - a Thumb (ARMv6-M) JIT for a stack-machine bytecode
//!
//! This library provides the bytecode parser, the code generator and a
//! reference machine for running what it produces.
//! For C/C++ embedding, use the FFI module functions.

pub mod bytecode;
pub mod config;
pub mod ffi;
pub mod jit;
#[cfg(feature = "sim")]
pub mod sim;

// Re-export commonly used types
pub use bytecode::{Function, FunctionShape, Insn, Module, ParseError, parse};
pub use config::{JitConfig, OutputFormat};
pub use jit::{CompiledFunction, JitError, compile, compile_function};

// Re-export FFI types for C bindings
pub use ffi::*;
