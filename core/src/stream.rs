//! Device stream identifier.

use std::ffi::c_void;
use std::ptr::NonNull;

/// Non-null reference to a device execution queue owned by the stream
/// runtime. The container passes it through to the compiled graph and never
/// dereferences it. `Option<StreamHandle>::None` selects the default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(NonNull<c_void>);

// SAFETY: the handle is an identifier only. Any synchronization the stream
// requires is provided by the stream runtime that owns it.
unsafe impl Send for StreamHandle {}
unsafe impl Sync for StreamHandle {}

impl StreamHandle {
    /// Wrap a raw stream pointer. Returns `None` for null.
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}
