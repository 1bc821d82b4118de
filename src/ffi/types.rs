//! FFI type definitions for the C API.

use crate::bytecode::Module;
use crate::config::JitConfig;
use std::ffi::CString;

/// Result codes for FFI operations.
///
/// These map to the `thumbjit_result` enum in C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbjitResult {
    /// Operation succeeded
    Ok = 0,
    /// Source text could not be parsed
    ErrorParse = 1,
    /// Code generation failed (buffer, pool or shape limits)
    ErrorCompile = 2,
    /// Invalid argument passed to function
    ErrorInvalidArg = 3,
    /// Function not found
    ErrorNotFound = 4,
}

impl ThumbjitResult {
    pub fn is_ok(self) -> bool {
        self == ThumbjitResult::Ok
    }

    pub fn is_err(self) -> bool {
        self != ThumbjitResult::Ok
    }
}

/// Opaque module handle.
///
/// Created by `thumbjit_module_new()`, holds parsed bytecode and the
/// configuration used to compile it.
#[repr(C)]
pub struct ThumbjitModule {
    _private: [u8; 0],
}

/// Internal state behind a `ThumbjitModule` pointer.
pub(crate) struct ModuleWrapper {
    pub module: Module,
    pub config: JitConfig,
    /// Last error message (as CString for FFI compatibility)
    pub last_error: Option<CString>,
}

impl ModuleWrapper {
    pub fn new() -> Self {
        Self {
            module: Module::default(),
            config: JitConfig::default(),
            last_error: None,
        }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(CString::new(message.into()).unwrap_or_default());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }
}

impl Default for ModuleWrapper {
    fn default() -> Self {
        Self::new()
    }
}
