//! Caller-side wrapper over the exported entry points.
//!
//! Every status code is translated into a `Result` right after the call,
//! with the message taken from the last-error side channel.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;
use std::slice;
use tracing::warn;

use super::{
    AOTInductorError, AOTInductorModelContainerHandle, AOTInductorProxyExecutorHandle,
    AOTInductorStreamHandle, AOTInductorTensorHandle, ExposedTensor, AOTI_RUNTIME_SUCCESS,
};
use crate::error::{ContainerError, Result};
use crate::stream::StreamHandle;
use crate::tensor::{DType, Shape, Tensor, TensorMut};

type SignatureStringFn =
    unsafe extern "C" fn(AOTInductorModelContainerHandle, usize, *mut *const c_char) -> AOTInductorError;
type MaxShapeFn = unsafe extern "C" fn(
    AOTInductorModelContainerHandle,
    usize,
    *mut *const i64,
    *mut i64,
) -> AOTInductorError;
type CountFn = unsafe extern "C" fn(AOTInductorModelContainerHandle, *mut usize) -> AOTInductorError;

/// Entry points of one compiled model.
#[derive(Clone, Copy)]
pub struct ContainerApi {
    pub create: unsafe extern "C" fn(
        *mut AOTInductorModelContainerHandle,
        usize,
        bool,
        *const c_char,
    ) -> AOTInductorError,
    pub delete: unsafe extern "C" fn(AOTInductorModelContainerHandle) -> AOTInductorError,
    #[allow(clippy::type_complexity)]
    pub run: unsafe extern "C" fn(
        AOTInductorModelContainerHandle,
        *const AOTInductorTensorHandle,
        usize,
        *const AOTInductorTensorHandle,
        usize,
        AOTInductorStreamHandle,
        AOTInductorProxyExecutorHandle,
        *mut *const i64,
        *mut i64,
    ) -> AOTInductorError,
    pub get_num_inputs: CountFn,
    pub get_input_name: SignatureStringFn,
    pub get_input_dtype: SignatureStringFn,
    pub get_num_outputs: CountFn,
    pub get_output_name: SignatureStringFn,
    pub get_output_dtype: SignatureStringFn,
    pub get_max_input_shape: MaxShapeFn,
    pub get_max_output_shape: MaxShapeFn,
    pub get_last_error: unsafe extern "C" fn() -> *const c_char,
}

impl ContainerApi {
    /// Get the last error message from the runtime.
    fn last_error(&self) -> String {
        unsafe {
            let err_ptr = (self.get_last_error)();
            if err_ptr.is_null() {
                "Unknown error".to_string()
            } else {
                CStr::from_ptr(err_ptr).to_string_lossy().into_owned()
            }
        }
    }

    fn check(&self, code: AOTInductorError) -> Result<()> {
        if code == AOTI_RUNTIME_SUCCESS {
            Ok(())
        } else {
            Err(ContainerError::Status {
                code,
                message: self.last_error(),
            })
        }
    }
}

/// Model container reached through its C entry points.
///
/// # Example
///
/// ```ignore
/// aoti_container::export_model_container!(AffineGraph, || AffineGraph::builder().build());
///
/// let container = AotContainer::create(container_api(), 2, true, None)?;
/// let input = HostTensor::zeros(DType::F32, &[2, 4]);
/// let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
/// let shapes = container.run(&[&input], &mut [&mut output], None, None)?;
/// ```
pub struct AotContainer {
    api: ContainerApi,
    handle: AOTInductorModelContainerHandle,
}

// SAFETY: the runtime coordinates concurrent runs itself and introspection
// is read-only.
unsafe impl Send for AotContainer {}
unsafe impl Sync for AotContainer {}

impl AotContainer {
    /// Create a container with `num_models` instances.
    ///
    /// # Errors
    ///
    /// Returns an error if the binaries directory does not exist (device
    /// mode only) or the runtime reports a failure.
    pub fn create(
        api: ContainerApi,
        num_models: usize,
        is_cpu: bool,
        cubin_dir: Option<&Path>,
    ) -> Result<Self> {
        let dir_cstr = match cubin_dir {
            Some(dir) if !is_cpu => {
                if !dir.exists() {
                    return Err(ContainerError::FileNotFound(dir.to_path_buf()));
                }
                let dir_str = dir.to_string_lossy();
                Some(
                    CString::new(dir_str.as_ref())
                        .map_err(|_| ContainerError::init("Invalid path encoding"))?,
                )
            }
            _ => None,
        };
        let dir_ptr = dir_cstr.as_ref().map_or(ptr::null(), |s| s.as_ptr());

        let mut handle: AOTInductorModelContainerHandle = ptr::null_mut();
        let code = unsafe { (api.create)(&mut handle, num_models, is_cpu, dir_ptr) };
        api.check(code)?;
        if handle.is_null() {
            return Err(ContainerError::invalid_handle(
                "runtime reported success but returned a null container",
            ));
        }
        Ok(Self { api, handle })
    }

    /// Raw handle, for calling entry points the wrapper does not cover.
    pub fn as_raw(&self) -> AOTInductorModelContainerHandle {
        self.handle
    }

    /// Delete the container, reporting a refusal instead of logging it.
    ///
    /// If deletion is refused, `Drop` retries once as `self` goes out of
    /// scope and logs a warning if that fails too.
    pub fn close(mut self) -> Result<()> {
        let code = unsafe { (self.api.delete)(self.handle) };
        self.api.check(code)?;
        self.handle = ptr::null_mut();
        Ok(())
    }

    pub fn num_inputs(&self) -> Result<usize> {
        self.count(self.api.get_num_inputs)
    }

    pub fn num_outputs(&self) -> Result<usize> {
        self.count(self.api.get_num_outputs)
    }

    pub fn input_name(&self, index: usize) -> Result<String> {
        self.string(self.api.get_input_name, index)
    }

    pub fn output_name(&self, index: usize) -> Result<String> {
        self.string(self.api.get_output_name, index)
    }

    pub fn input_dtype(&self, index: usize) -> Result<DType> {
        self.string(self.api.get_input_dtype, index)?.parse()
    }

    pub fn output_dtype(&self, index: usize) -> Result<DType> {
        self.string(self.api.get_output_dtype, index)?.parse()
    }

    pub fn max_input_shape(&self, index: usize) -> Result<Shape> {
        self.shape(self.api.get_max_input_shape, index)
    }

    pub fn max_output_shape(&self, index: usize) -> Result<Shape> {
        self.shape(self.api.get_max_output_shape, index)
    }

    /// Run inference and return the actual shape of every output.
    ///
    /// `outputs` must be allocated at or above the maximum output sizes.
    /// `proxy` is a callback table, e.g. from [`ProxyBridge`](super::ProxyBridge).
    pub fn run(
        &self,
        inputs: &[&dyn Tensor],
        outputs: &mut [&mut dyn TensorMut],
        stream: Option<StreamHandle>,
        proxy: Option<AOTInductorProxyExecutorHandle>,
    ) -> Result<Vec<Shape>> {
        let mut exposed_inputs: Vec<ExposedTensor<'_>> =
            inputs.iter().map(|&t| ExposedTensor::shared(t)).collect();
        let mut exposed_outputs: Vec<ExposedTensor<'_>> = outputs
            .iter_mut()
            .map(|t| ExposedTensor::unique(&mut **t))
            .collect();
        let input_handles: Vec<AOTInductorTensorHandle> =
            exposed_inputs.iter_mut().map(|e| e.handle()).collect();
        let output_handles: Vec<AOTInductorTensorHandle> =
            exposed_outputs.iter_mut().map(|e| e.handle()).collect();

        let n_out = output_handles.len();
        let mut sizes: Vec<*const i64> = vec![ptr::null(); n_out];
        let mut ndims: Vec<i64> = vec![0; n_out];
        let stream_ptr = stream.map_or(ptr::null_mut(), |s| s.as_raw()) as AOTInductorStreamHandle;

        let code = unsafe {
            (self.api.run)(
                self.handle,
                input_handles.as_ptr(),
                input_handles.len(),
                output_handles.as_ptr(),
                n_out,
                stream_ptr,
                proxy.unwrap_or(ptr::null_mut()),
                sizes.as_mut_ptr(),
                ndims.as_mut_ptr(),
            )
        };
        self.api.check(code)?;

        sizes
            .iter()
            .zip(&ndims)
            .map(|(&ptr, &ndim)| {
                if ndim == 0 {
                    return Ok(Shape::default());
                }
                if ptr.is_null() || ndim < 0 {
                    return Err(ContainerError::execution("runtime returned no output shape"));
                }
                // SAFETY: valid until the next run on this thread.
                Ok(Shape::from_slice(unsafe {
                    slice::from_raw_parts(ptr, ndim as usize)
                }))
            })
            .collect()
    }

    fn count(&self, f: CountFn) -> Result<usize> {
        let mut n = 0usize;
        self.api.check(unsafe { f(self.handle, &mut n) })?;
        Ok(n)
    }

    fn string(&self, f: SignatureStringFn, index: usize) -> Result<String> {
        let mut s: *const c_char = ptr::null();
        self.api.check(unsafe { f(self.handle, index, &mut s) })?;
        if s.is_null() {
            return Err(ContainerError::invalid_handle("runtime returned a null string"));
        }
        Ok(unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned())
    }

    fn shape(&self, f: MaxShapeFn, index: usize) -> Result<Shape> {
        let mut sizes: *const i64 = ptr::null();
        let mut ndim = 0i64;
        self.api
            .check(unsafe { f(self.handle, index, &mut sizes, &mut ndim) })?;
        if ndim == 0 {
            return Ok(Shape::default());
        }
        if sizes.is_null() || ndim < 0 {
            return Err(ContainerError::invalid_handle("runtime returned an invalid shape"));
        }
        Ok(Shape::from_slice(unsafe {
            slice::from_raw_parts(sizes, ndim as usize)
        }))
    }
}

impl Drop for AotContainer {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            let code = unsafe { (self.api.delete)(self.handle) };
            if code != AOTI_RUNTIME_SUCCESS {
                warn!("container delete failed: {}", self.api.last_error());
            }
        }
    }
}
