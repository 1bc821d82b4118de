//! Module lifecycle and compilation FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use super::types::{ModuleWrapper, ThumbjitModule, ThumbjitResult};
use crate::bytecode::parse;
use crate::jit::compile;
use std::ffi::{CStr, c_char};

pub(crate) unsafe fn get_wrapper<'a>(module: *const ThumbjitModule) -> Option<&'a ModuleWrapper> {
    if module.is_null() {
        None
    } else {
        Some(&*(module as *const ModuleWrapper))
    }
}

pub(crate) unsafe fn get_wrapper_mut<'a>(module: *mut ThumbjitModule) -> Option<&'a mut ModuleWrapper> {
    if module.is_null() {
        None
    } else {
        Some(&mut *(module as *mut ModuleWrapper))
    }
}

/// Create an empty module.
///
/// The returned module must be freed with `thumbjit_module_free()`.
#[unsafe(no_mangle)]
pub extern "C" fn thumbjit_module_new() -> *mut ThumbjitModule {
    Box::into_raw(Box::new(ModuleWrapper::new())) as *mut ThumbjitModule
}

/// Free a module.
///
/// # Safety
///
/// `module` must be NULL or a pointer returned by `thumbjit_module_new()`
/// that has not been freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thumbjit_module_free(module: *mut ThumbjitModule) {
    if module.is_null() {
        return;
    }
    let _ = Box::from_raw(module as *mut ModuleWrapper);
}

/// Enable or disable `[JIT]` trace output on stderr.
///
/// # Safety
///
/// `module` must be NULL or a valid module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thumbjit_set_trace(module: *mut ThumbjitModule, enabled: bool) {
    if let Some(wrapper) = get_wrapper_mut(module) {
        wrapper.config.trace_jit = enabled;
    }
}

/// Parse bytecode source text, replacing the module's functions.
///
/// # Returns
/// - `THUMBJIT_OK` on success
/// - `THUMBJIT_ERROR_INVALID_ARG` if a pointer is NULL or the text is not UTF-8
/// - `THUMBJIT_ERROR_PARSE` if the source is malformed
///
/// # Safety
///
/// `source` must point to a null-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thumbjit_load_source(
    module: *mut ThumbjitModule,
    source: *const c_char,
) -> ThumbjitResult {
    let Some(wrapper) = get_wrapper_mut(module) else {
        return ThumbjitResult::ErrorInvalidArg;
    };
    if source.is_null() {
        wrapper.set_error("source pointer is NULL");
        return ThumbjitResult::ErrorInvalidArg;
    }
    let Ok(text) = CStr::from_ptr(source).to_str() else {
        wrapper.set_error("source is not valid UTF-8");
        return ThumbjitResult::ErrorInvalidArg;
    };
    match parse(text) {
        Ok(parsed) => {
            wrapper.module = parsed;
            wrapper.clear_error();
            ThumbjitResult::Ok
        }
        Err(e) => {
            wrapper.set_error(e.to_string());
            ThumbjitResult::ErrorParse
        }
    }
}

/// Number of functions in the module.
///
/// # Safety
///
/// `module` must be NULL or a valid module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thumbjit_function_count(module: *const ThumbjitModule) -> usize {
    get_wrapper(module).map_or(0, |w| w.module.functions.len())
}

/// Index of the function called `name`, or -1.
///
/// # Safety
///
/// `name` must point to a null-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thumbjit_find_function(
    module: *const ThumbjitModule,
    name: *const c_char,
) -> i32 {
    let Some(wrapper) = get_wrapper(module) else {
        return -1;
    };
    if name.is_null() {
        return -1;
    }
    CStr::from_ptr(name)
        .to_str()
        .ok()
        .and_then(|name| wrapper.module.find(name))
        .map_or(-1, |index| index as i32)
}

/// Compile function `index` into the caller's buffer.
///
/// On success `*out_len` receives the total size in halfwords (code,
/// padding and literal pool) and `*out_code_len`, if not NULL, the size
/// of the code alone.
///
/// # Safety
///
/// `buf` must be valid for writes of `capacity` halfwords and `out_len`
/// must be a valid pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thumbjit_compile(
    module: *mut ThumbjitModule,
    index: usize,
    buf: *mut u16,
    capacity: usize,
    out_len: *mut usize,
    out_code_len: *mut usize,
) -> ThumbjitResult {
    let Some(wrapper) = get_wrapper_mut(module) else {
        return ThumbjitResult::ErrorInvalidArg;
    };
    if buf.is_null() || out_len.is_null() {
        wrapper.set_error("output pointer is NULL");
        return ThumbjitResult::ErrorInvalidArg;
    }
    let Some(function) = wrapper.module.functions.get(index) else {
        wrapper.set_error(format!("no function #{}", index));
        return ThumbjitResult::ErrorNotFound;
    };

    let out = std::slice::from_raw_parts_mut(buf, capacity);
    match compile(&mut function.reader(), out, &wrapper.config) {
        Ok(assembled) => {
            *out_len = assembled.len;
            if !out_code_len.is_null() {
                *out_code_len = assembled.code_len;
            }
            wrapper.clear_error();
            ThumbjitResult::Ok
        }
        Err(e) => {
            let message = format!("{}: {}", function.name, e);
            wrapper.set_error(message);
            ThumbjitResult::ErrorCompile
        }
    }
}

/// Get the last error message, or NULL if there is none.
///
/// The pointer is valid until the next call on this module.
///
/// # Safety
///
/// `module` must be NULL or a valid module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thumbjit_get_error(module: *const ThumbjitModule) -> *const c_char {
    get_wrapper(module)
        .and_then(|w| w.last_error.as_ref())
        .map_or(std::ptr::null(), |e| e.as_ptr())
}

/// Clear the last error.
///
/// # Safety
///
/// `module` must be NULL or a valid module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thumbjit_clear_error(module: *mut ThumbjitModule) {
    if let Some(wrapper) = get_wrapper_mut(module) {
        wrapper.clear_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::jit::compile_function;
    use std::ffi::CString;

    const SOURCE: &str = ".func square args=1 returns=1\n pull 0\n mul\n.func big returns=1\n imm 0x12345678\n";

    unsafe fn loaded() -> *mut ThumbjitModule {
        let module = thumbjit_module_new();
        let source = CString::new(SOURCE).unwrap();
        assert_eq!(thumbjit_load_source(module, source.as_ptr()), ThumbjitResult::Ok);
        module
    }

    unsafe fn error_text(module: *const ThumbjitModule) -> String {
        CStr::from_ptr(thumbjit_get_error(module)).to_str().unwrap().to_string()
    }

    #[test]
    fn test_lifecycle() {
        unsafe {
            let module = loaded();
            assert_eq!(thumbjit_function_count(module), 2);
            let name = CString::new("big").unwrap();
            assert_eq!(thumbjit_find_function(module, name.as_ptr()), 1);
            let name = CString::new("missing").unwrap();
            assert_eq!(thumbjit_find_function(module, name.as_ptr()), -1);
            thumbjit_module_free(module);
            thumbjit_module_free(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_compile_into_buffer() {
        unsafe {
            let module = loaded();
            let mut buf = [0u16; 64];
            let mut len = 0;
            let mut code_len = 0;
            let result = thumbjit_compile(module, 1, buf.as_mut_ptr(), buf.len(), &mut len, &mut code_len);
            assert_eq!(result, ThumbjitResult::Ok);
            assert!(thumbjit_get_error(module).is_null());

            let parsed = crate::bytecode::parse(SOURCE).unwrap();
            let expected = compile_function(&parsed.functions[1], &JitConfig::default()).unwrap();
            assert_eq!(&buf[..len], expected.code.as_slice());
            assert_eq!(code_len, expected.code_len);
            thumbjit_module_free(module);
        }
    }

    #[test]
    fn test_errors() {
        unsafe {
            let module = loaded();
            let mut buf = [0u16; 4];
            let mut len = 0;

            let result = thumbjit_compile(module, 0, buf.as_mut_ptr(), buf.len(), &mut len, std::ptr::null_mut());
            assert_eq!(result, ThumbjitResult::ErrorCompile);
            assert_eq!(error_text(module), "square: code buffer exhausted");

            let result = thumbjit_compile(module, 9, buf.as_mut_ptr(), buf.len(), &mut len, std::ptr::null_mut());
            assert_eq!(result, ThumbjitResult::ErrorNotFound);

            let bad = CString::new(".func f\n frobnicate\n").unwrap();
            assert_eq!(thumbjit_load_source(module, bad.as_ptr()), ThumbjitResult::ErrorParse);
            assert!(error_text(module).starts_with("line 2:"));
            thumbjit_clear_error(module);
            assert!(thumbjit_get_error(module).is_null());

            assert_eq!(
                thumbjit_load_source(std::ptr::null_mut(), bad.as_ptr()),
                ThumbjitResult::ErrorInvalidArg
            );
            thumbjit_module_free(module);
        }
    }
}
