//! C ABI of the model container.
//!
//! Handles are process-local opaque pointers. Every entry point returns an
//! [`AOTInductorError`] status; zero means success and callers must treat
//! any other value as failure. A description of the last failure on the
//! calling thread is available from [`AOTInductorGetLastError`].
//!
//! Model crates emit the entry points with [`export_model_container!`];
//! callers go through [`client::AotContainer`], which turns status codes
//! back into `Result`s.
//!
//! [`export_model_container!`]: crate::export_model_container

pub mod client;
pub mod export;
mod foreign;

pub use client::{AotContainer, ContainerApi};
pub use foreign::{ExposedTensor, ForeignProxy, ForeignTensor, ProxyBridge};

use std::cell::RefCell;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

/// Status code returned by every entry point.
pub type AOTInductorError = i32;

pub const AOTI_RUNTIME_SUCCESS: AOTInductorError = 0;
/// Initialization, execution or other unclassified failure.
pub const AOTI_RUNTIME_FAILURE: AOTInductorError = 1;
/// Arity, dtype or shape mismatch, invalid handle, out-of-range index.
pub const AOTI_RUNTIME_CONTRACT_VIOLATION: AOTInductorError = 2;
/// The proxy executor failed while servicing a delegated operator.
pub const AOTI_RUNTIME_DELEGATED_FAILURE: AOTInductorError = 3;
/// Every instance of the container has been retired.
pub const AOTI_RUNTIME_EXHAUSTED: AOTInductorError = 4;

#[repr(C)]
pub struct AOTInductorModelContainerOpaque {
    _private: [u8; 0],
}
pub type AOTInductorModelContainerHandle = *mut AOTInductorModelContainerOpaque;

#[repr(C)]
pub struct AOTInductorStreamOpaque {
    _private: [u8; 0],
}
pub type AOTInductorStreamHandle = *mut AOTInductorStreamOpaque;

/// Accessor table through which the array library exposes one tensor.
///
/// `sizes` must point to `ndim` extents and `data_ptr` to `nbytes` bytes of
/// contiguous storage; both must stay valid for the duration of the call the
/// handle is passed to. `dtype` returns a nul-terminated token such as
/// `"float32"`.
#[repr(C)]
pub struct AOTInductorTensorInterface {
    pub ctx: *mut c_void,
    pub dtype: unsafe extern "C" fn(ctx: *mut c_void) -> *const c_char,
    pub ndim: unsafe extern "C" fn(ctx: *mut c_void) -> i64,
    pub sizes: unsafe extern "C" fn(ctx: *mut c_void) -> *const i64,
    pub data_ptr: unsafe extern "C" fn(ctx: *mut c_void) -> *mut c_void,
    pub nbytes: unsafe extern "C" fn(ctx: *mut c_void) -> usize,
}
pub type AOTInductorTensorHandle = *mut AOTInductorTensorInterface;

/// Callback table for delegated operators.
#[repr(C)]
pub struct AOTInductorProxyExecutor {
    pub ctx: *mut c_void,
    pub call_function: unsafe extern "C" fn(
        ctx: *mut c_void,
        extern_node_index: i32,
        num_ints: i32,
        flatten_int_args: *mut i64,
        num_tensors: i32,
        flatten_tensor_args: *mut AOTInductorTensorHandle,
    ) -> AOTInductorError,
}
pub type AOTInductorProxyExecutorHandle = *mut AOTInductorProxyExecutor;

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

/// Record `msg` as the last error of the calling thread.
pub(crate) fn set_last_error(msg: &str) {
    let msg = CString::new(msg.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|e| *e.borrow_mut() = msg);
}

/// Last error recorded on the calling thread.
pub fn last_error() -> String {
    LAST_ERROR.with(|e| e.borrow().to_string_lossy().into_owned())
}

/// Message describing the most recent failure on the calling thread.
///
/// The pointer stays valid until the next failing call on the same thread.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn AOTInductorGetLastError() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ptr())
}

/// Read a nul-terminated string from the boundary.
///
/// # Safety
///
/// `ptr` must be null or point to a nul-terminated string.
pub(crate) unsafe fn read_cstr(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}
