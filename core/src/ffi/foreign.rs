//! Adapters between the C accessor tables and the Rust tensor/proxy traits.

use std::ffi::{c_void, CStr};
use std::marker::PhantomData;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::slice;

use super::{
    last_error, set_last_error, AOTInductorError, AOTInductorProxyExecutor, AOTInductorProxyExecutorHandle,
    AOTInductorTensorHandle, AOTInductorTensorInterface, AOTI_RUNTIME_FAILURE,
    AOTI_RUNTIME_SUCCESS,
};
use crate::error::{ContainerError, ProxyError, Result};
use crate::proxy::{ProxyCall, ProxyExecutor};
use crate::tensor::{DType, Tensor, TensorMut};

/// Tensor owned by the array library, read through its accessor table.
pub struct ForeignTensor<'a> {
    dtype: DType,
    sizes: Vec<i64>,
    data: *mut u8,
    nbytes: usize,
    _storage: PhantomData<&'a mut [u8]>,
}

impl<'a> ForeignTensor<'a> {
    /// Query dtype, sizes and storage through the accessor table.
    ///
    /// # Safety
    ///
    /// `handle` must be null or point to a valid accessor table whose
    /// storage stays valid and unaliased for `'a`.
    pub unsafe fn from_handle(handle: AOTInductorTensorHandle) -> Result<Self> {
        let iface = handle
            .as_ref()
            .ok_or_else(|| ContainerError::invalid_handle("null tensor handle"))?;

        let dtype_ptr = (iface.dtype)(iface.ctx);
        if dtype_ptr.is_null() {
            return Err(ContainerError::invalid_handle("tensor reported a null dtype"));
        }
        let token = CStr::from_ptr(dtype_ptr).to_string_lossy();
        let dtype: DType = token.parse().map_err(|_| {
            ContainerError::invalid_handle(format!("tensor reported unknown dtype {:?}", token))
        })?;

        let ndim = (iface.ndim)(iface.ctx);
        if ndim < 0 {
            return Err(ContainerError::invalid_handle(format!(
                "tensor reported negative rank {}",
                ndim
            )));
        }
        let sizes = if ndim == 0 {
            Vec::new()
        } else {
            let sizes_ptr = (iface.sizes)(iface.ctx);
            if sizes_ptr.is_null() {
                return Err(ContainerError::invalid_handle("tensor reported null sizes"));
            }
            slice::from_raw_parts(sizes_ptr, ndim as usize).to_vec()
        };

        let data = (iface.data_ptr)(iface.ctx) as *mut u8;
        let nbytes = (iface.nbytes)(iface.ctx);
        if data.is_null() && nbytes > 0 {
            return Err(ContainerError::invalid_handle("tensor reported null storage"));
        }

        Ok(Self {
            dtype,
            sizes,
            data,
            nbytes,
            _storage: PhantomData,
        })
    }
}

impl Tensor for ForeignTensor<'_> {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    fn as_bytes(&self) -> &[u8] {
        if self.nbytes == 0 {
            return &[];
        }
        // SAFETY: checked non-null in from_handle; validity for 'a is the
        // caller's contract.
        unsafe { slice::from_raw_parts(self.data, self.nbytes) }
    }
}

impl TensorMut for ForeignTensor<'_> {
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.nbytes == 0 {
            return &mut [];
        }
        // SAFETY: as above; exclusive access follows from &mut self.
        unsafe { slice::from_raw_parts_mut(self.data, self.nbytes) }
    }
}

enum Borrowed<'a> {
    Shared(&'a dyn Tensor),
    Unique(&'a mut dyn TensorMut),
}

impl Borrowed<'_> {
    fn dtype(&self) -> DType {
        match self {
            Self::Shared(t) => t.dtype(),
            Self::Unique(t) => t.dtype(),
        }
    }

    fn sizes(&self) -> &[i64] {
        match self {
            Self::Shared(t) => t.sizes(),
            Self::Unique(t) => t.sizes(),
        }
    }

    fn nbytes(&self) -> usize {
        match self {
            Self::Shared(t) => t.as_bytes().len(),
            Self::Unique(t) => t.as_bytes().len(),
        }
    }

    fn data_ptr(&mut self) -> *mut c_void {
        match self {
            // Read-only storage; receivers must not write through it.
            Self::Shared(t) => t.as_bytes().as_ptr() as *mut c_void,
            Self::Unique(t) => t.as_bytes_mut().as_mut_ptr() as *mut c_void,
        }
    }
}

/// A Rust tensor published through the C accessor table.
pub struct ExposedTensor<'a> {
    // Boxed so `ctx` keeps pointing at it when the wrapper moves.
    tensor: Box<Borrowed<'a>>,
    table: AOTInductorTensorInterface,
}

impl<'a> ExposedTensor<'a> {
    /// Publish a tensor that receivers may only read.
    pub fn shared(tensor: &'a dyn Tensor) -> Self {
        Self::new(Borrowed::Shared(tensor))
    }

    /// Publish a tensor that receivers may write.
    pub fn unique(tensor: &'a mut dyn TensorMut) -> Self {
        Self::new(Borrowed::Unique(tensor))
    }

    fn new(borrowed: Borrowed<'a>) -> Self {
        let mut tensor = Box::new(borrowed);
        let ctx = &mut *tensor as *mut Borrowed<'a> as *mut c_void;
        Self {
            tensor,
            table: AOTInductorTensorInterface {
                ctx,
                dtype: exposed_dtype,
                ndim: exposed_ndim,
                sizes: exposed_sizes,
                data_ptr: exposed_data_ptr,
                nbytes: exposed_nbytes,
            },
        }
    }

    /// Handle valid while `self` is alive and not moved.
    pub fn handle(&mut self) -> AOTInductorTensorHandle {
        debug_assert_eq!(
            self.table.ctx,
            &mut *self.tensor as *mut Borrowed<'a> as *mut c_void
        );
        &mut self.table
    }
}

unsafe extern "C" fn exposed_dtype(ctx: *mut c_void) -> *const c_char {
    let tensor = &*(ctx as *const Borrowed<'_>);
    tensor.dtype().as_cstr().as_ptr()
}

unsafe extern "C" fn exposed_ndim(ctx: *mut c_void) -> i64 {
    let tensor = &*(ctx as *const Borrowed<'_>);
    tensor.sizes().len() as i64
}

unsafe extern "C" fn exposed_sizes(ctx: *mut c_void) -> *const i64 {
    let tensor = &*(ctx as *const Borrowed<'_>);
    tensor.sizes().as_ptr()
}

unsafe extern "C" fn exposed_data_ptr(ctx: *mut c_void) -> *mut c_void {
    let tensor = &mut *(ctx as *mut Borrowed<'_>);
    tensor.data_ptr()
}

unsafe extern "C" fn exposed_nbytes(ctx: *mut c_void) -> usize {
    let tensor = &*(ctx as *const Borrowed<'_>);
    tensor.nbytes()
}

/// Proxy executor supplied through the C boundary.
pub struct ForeignProxy {
    table: NonNull<AOTInductorProxyExecutor>,
}

// SAFETY: a proxy executor shared across instances must itself tolerate
// concurrent invocation; that is part of the boundary contract.
unsafe impl Send for ForeignProxy {}
unsafe impl Sync for ForeignProxy {}

impl ForeignProxy {
    /// Wrap a proxy handle. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// A non-null `handle` must point to a valid callback table for as long
    /// as the returned value is used.
    pub unsafe fn from_handle(handle: AOTInductorProxyExecutorHandle) -> Option<Self> {
        NonNull::new(handle).map(|table| Self { table })
    }
}

impl ProxyExecutor for ForeignProxy {
    fn call_function(&self, call: &mut ProxyCall<'_, '_>) -> std::result::Result<(), ProxyError> {
        let node = i32::try_from(call.extern_node_index)
            .map_err(|_| ProxyError::new("extern node index exceeds i32"))?;
        let mut ints = call.int_args.to_vec();
        let mut exposed: Vec<ExposedTensor<'_>> = call
            .tensor_args
            .iter_mut()
            .map(|t| ExposedTensor::unique(&mut **t))
            .collect();
        let mut handles: Vec<AOTInductorTensorHandle> =
            exposed.iter_mut().map(|e| e.handle()).collect();

        // The side channel is left untouched on success; a changed message
        // after a failure is the executor's own reason.
        let previous = last_error();
        // SAFETY: the table is valid per from_handle; the argument arrays
        // outlive the call.
        let code = unsafe {
            let table = self.table.as_ref();
            (table.call_function)(
                table.ctx,
                node,
                ints.len() as i32,
                ints.as_mut_ptr(),
                handles.len() as i32,
                handles.as_mut_ptr(),
            )
        };
        if code == AOTI_RUNTIME_SUCCESS {
            Ok(())
        } else {
            let reason = last_error();
            if reason.is_empty() || reason == previous {
                Err(ProxyError::new(format!("proxy executor returned status {}", code)))
            } else {
                Err(ProxyError::new(format!(
                    "proxy executor returned status {}: {}",
                    code, reason
                )))
            }
        }
    }
}

/// Publishes a Rust [`ProxyExecutor`] as a C callback table.
pub struct ProxyBridge<'a> {
    _executor: Box<&'a dyn ProxyExecutor>,
    table: AOTInductorProxyExecutor,
}

impl<'a> ProxyBridge<'a> {
    pub fn new(executor: &'a dyn ProxyExecutor) -> Self {
        let mut executor = Box::new(executor);
        let ctx = &mut *executor as *mut &'a dyn ProxyExecutor as *mut c_void;
        Self {
            _executor: executor,
            table: AOTInductorProxyExecutor {
                ctx,
                call_function: bridge_call_function,
            },
        }
    }

    /// Handle valid while `self` is alive and not moved.
    pub fn handle(&mut self) -> AOTInductorProxyExecutorHandle {
        &mut self.table
    }
}

unsafe extern "C" fn bridge_call_function(
    ctx: *mut c_void,
    extern_node_index: i32,
    num_ints: i32,
    flatten_int_args: *mut i64,
    num_tensors: i32,
    flatten_tensor_args: *mut AOTInductorTensorHandle,
) -> AOTInductorError {
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        let executor = *(ctx as *const &dyn ProxyExecutor);
        let int_args: &[i64] = if num_ints <= 0 || flatten_int_args.is_null() {
            &[]
        } else {
            slice::from_raw_parts(flatten_int_args, num_ints as usize)
        };
        let handles: &[AOTInductorTensorHandle] =
            if num_tensors <= 0 || flatten_tensor_args.is_null() {
                &[]
            } else {
                slice::from_raw_parts(flatten_tensor_args, num_tensors as usize)
            };
        let mut tensors = handles
            .iter()
            .map(|&h| ForeignTensor::from_handle(h))
            .collect::<Result<Vec<_>>>()?;
        let mut args: Vec<&mut dyn TensorMut> = tensors
            .iter_mut()
            .map(|t| t as &mut dyn TensorMut)
            .collect();

        let node = extern_node_index.max(0) as usize;
        let mut call = ProxyCall {
            extern_node_index: node,
            int_args,
            tensor_args: &mut args,
        };
        executor
            .call_function(&mut call)
            .map_err(|e| ContainerError::Delegated {
                node,
                message: e.to_string(),
            })
    }));

    match outcome {
        Ok(Ok(())) => AOTI_RUNTIME_SUCCESS,
        Ok(Err(e)) => {
            set_last_error(&e.to_string());
            e.status()
        }
        Err(_) => {
            set_last_error("proxy executor panicked");
            AOTI_RUNTIME_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::HostTensor;

    #[test]
    fn test_exposed_tensor_round_trips_metadata() {
        let mut host = HostTensor::zeros(DType::I32, &[2, 3]);
        let mut exposed = ExposedTensor::unique(&mut host);
        let handle = exposed.handle();

        let mut foreign = unsafe { ForeignTensor::from_handle(handle) }.unwrap();
        assert_eq!(foreign.dtype(), DType::I32);
        assert_eq!(foreign.sizes(), &[2, 3]);
        assert_eq!(foreign.as_bytes().len(), 24);
        foreign.as_bytes_mut()[0] = 7;
        drop(foreign);
        drop(exposed);
        assert_eq!(host.as_bytes()[0], 7);
    }

    #[test]
    fn test_null_handles() {
        assert!(matches!(
            unsafe { ForeignTensor::from_handle(std::ptr::null_mut()) },
            Err(ContainerError::InvalidHandle(_))
        ));
        assert!(unsafe { ForeignProxy::from_handle(std::ptr::null_mut()) }.is_none());
    }

    #[test]
    fn test_proxy_bridge_round_trip() {
        let double = |call: &mut ProxyCall<'_, '_>| {
            let factor = call.int_args[0] as u8;
            for b in call.tensor_args[0].as_bytes_mut() {
                *b *= factor;
            }
            Ok::<(), ProxyError>(())
        };
        let mut bridge = ProxyBridge::new(&double);
        let foreign = unsafe { ForeignProxy::from_handle(bridge.handle()) }.unwrap();

        let mut scratch = HostTensor::zeros(DType::U8, &[2]);
        scratch.as_bytes_mut().copy_from_slice(&[3, 4]);
        let mut args: [&mut dyn TensorMut; 1] = [&mut scratch];
        let mut call = ProxyCall {
            extern_node_index: 5,
            int_args: &[2],
            tensor_args: &mut args,
        };
        foreign.call_function(&mut call).unwrap();
        assert_eq!(scratch.as_bytes(), &[6, 8]);
    }

    #[test]
    fn test_proxy_bridge_reports_failure() {
        let failing =
            |_: &mut ProxyCall<'_, '_>| Err::<(), ProxyError>(ProxyError::new("kernel missing"));
        let mut bridge = ProxyBridge::new(&failing);
        let foreign = unsafe { ForeignProxy::from_handle(bridge.handle()) }.unwrap();

        let mut call = ProxyCall {
            extern_node_index: 1,
            int_args: &[],
            tensor_args: &mut [],
        };
        let err = foreign.call_function(&mut call).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("proxy executor returned status 3"), "{}", msg);
        assert!(msg.contains("kernel missing"), "{}", msg);
    }
}
