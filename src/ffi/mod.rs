//! C FFI for embedding the compiler.
//!
//! A host parses bytecode text into a module handle and compiles its
//! functions into buffers it owns. All public functions use `extern "C"` ABI.
//!
//! # Safety
//!
//! All FFI functions that take raw pointers require:
//! - Non-null pointers (unless documented otherwise)
//! - Valid modules created by `thumbjit_module_new()`
//! - Output buffers valid for the capacity passed alongside them

mod module;
mod types;

pub use module::*;
pub use types::*;

/// Version information
pub const THUMBJIT_VERSION_MAJOR: u32 = 0;
pub const THUMBJIT_VERSION_MINOR: u32 = 1;
pub const THUMBJIT_VERSION_PATCH: u32 = 0;

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn thumbjit_version() -> *const std::ffi::c_char {
    static VERSION: &[u8] = b"0.1.0\0";
    VERSION.as_ptr() as *const std::ffi::c_char
}
