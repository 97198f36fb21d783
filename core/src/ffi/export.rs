//! Generic bodies of the exported entry points.
//!
//! A model crate calls [`export_model_container!`](crate::export_model_container)
//! with its graph type; the macro emits one `extern "C"` function per entry
//! point, each forwarding to the matching function here. Every body runs
//! under `catch_unwind`, so neither errors nor panics cross the boundary.

use std::cell::RefCell;
use std::ffi::c_void;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::slice;
use tracing::error;

use super::{
    read_cstr, set_last_error, AOTInductorError, AOTInductorModelContainerHandle,
    AOTInductorProxyExecutorHandle, AOTInductorStreamHandle, AOTInductorTensorHandle,
    ForeignProxy, ForeignTensor, AOTI_RUNTIME_FAILURE, AOTI_RUNTIME_SUCCESS,
};
use crate::container::ModelContainer;
use crate::error::{ContainerError, IoKind, Result};
use crate::graph::CompiledGraph;
use crate::proxy::ProxyExecutor;
use crate::stream::StreamHandle;
use crate::tensor::{Shape, Tensor, TensorMut};

thread_local! {
    // Backing storage for the size pointers handed out by `run`.
    static OUTPUT_SIZES: RefCell<Vec<Shape>> = const { RefCell::new(Vec::new()) };
}

/// Run `body`, converting errors and panics into a status code.
fn guard(body: impl FnOnce() -> Result<()>) -> AOTInductorError {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => AOTI_RUNTIME_SUCCESS,
        Ok(Err(e)) => {
            set_last_error(&e.to_string());
            e.status()
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            set_last_error(&format!("panic in model runtime: {}", msg));
            AOTI_RUNTIME_FAILURE
        }
    }
}

fn non_null<T>(ptr: *mut T, what: &str) -> Result<*mut T> {
    if ptr.is_null() {
        Err(ContainerError::invalid_handle(format!("null {}", what)))
    } else {
        Ok(ptr)
    }
}

/// # Safety
///
/// `handle` must be null or come from [`create`] with the same `G`, and not
/// have been deleted.
unsafe fn container<'a, G: CompiledGraph>(
    handle: AOTInductorModelContainerHandle,
) -> Result<&'a ModelContainer<G>> {
    let ptr = non_null(handle, "container handle")?;
    Ok(&*(ptr as *const ModelContainer<G>))
}

/// # Safety
///
/// `ptr` must be null or point to `len` readable handles.
unsafe fn handle_slice<'a>(
    ptr: *const AOTInductorTensorHandle,
    len: usize,
    what: &str,
) -> Result<&'a [AOTInductorTensorHandle]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(ContainerError::invalid_handle(format!("null {} array", what)));
    }
    Ok(slice::from_raw_parts(ptr, len))
}

/// Create a container for graphs produced by `load`.
///
/// # Safety
///
/// `container_handle` must be writable; `cubin_dir` must be null or a
/// nul-terminated string.
pub unsafe fn create<G, F>(
    container_handle: *mut AOTInductorModelContainerHandle,
    num_models: usize,
    is_cpu: bool,
    cubin_dir: *const c_char,
    load: F,
) -> AOTInductorError
where
    G: CompiledGraph,
    F: FnOnce() -> Result<G>,
{
    guard(|| {
        let out = non_null(container_handle, "container handle out-parameter")?;
        let cubin_dir = read_cstr(cubin_dir).map(PathBuf::from);
        let graph = load().map_err(|e| match e {
            ContainerError::Init(_) => e,
            other => ContainerError::init(format!("loading compiled graph: {}", other)),
        })?;
        let container = ModelContainer::create(graph, num_models, is_cpu, cubin_dir.as_deref())?;
        *out = Box::into_raw(Box::new(container)) as AOTInductorModelContainerHandle;
        Ok(())
    })
}

/// Release a container.
///
/// Refuses, without freeing, while runs are still in flight. Detection is
/// best effort: only runs holding an instance are counted, so a caller still
/// waiting for one (or woken but not yet re-locked) is not seen. Callers
/// must not delete a container that other threads may still use.
///
/// # Safety
///
/// `handle` must be null or a live handle from [`create`] with the same `G`.
pub unsafe fn delete<G: CompiledGraph>(handle: AOTInductorModelContainerHandle) -> AOTInductorError {
    guard(|| {
        let in_flight = container::<G>(handle)?.in_flight();
        if in_flight > 0 {
            error!(in_flight, "refusing to delete container with runs in flight");
            return Err(ContainerError::execution(format!(
                "container still has {} run(s) in flight",
                in_flight
            )));
        }
        drop(Box::from_raw(handle as *mut ModelContainer<G>));
        Ok(())
    })
}

/// Run inference.
///
/// On success `ret_output_ndims[i]` receives the rank of output `i` and
/// `ret_output_sizes[i]` a pointer to its extents, valid until the next run
/// on the calling thread. Either out-array may be null.
///
/// # Safety
///
/// `handle` must be a live container handle; the handle arrays must hold
/// `num_inputs` / `num_outputs` valid tensor handles; stream and proxy
/// handles must be null or valid; non-null out-arrays must have room for
/// `num_outputs` entries.
#[allow(clippy::too_many_arguments)]
pub unsafe fn run<G: CompiledGraph>(
    handle: AOTInductorModelContainerHandle,
    input_handles: *const AOTInductorTensorHandle,
    num_inputs: usize,
    output_handles: *const AOTInductorTensorHandle,
    num_outputs: usize,
    stream_handle: AOTInductorStreamHandle,
    proxy_executor_handle: AOTInductorProxyExecutorHandle,
    ret_output_sizes: *mut *const i64,
    ret_output_ndims: *mut i64,
) -> AOTInductorError {
    guard(|| {
        let container = container::<G>(handle)?;

        // Check arity before reading any handle.
        if num_inputs != container.num_inputs() {
            return Err(ContainerError::Arity {
                kind: IoKind::Input,
                expected: container.num_inputs(),
                actual: num_inputs,
            });
        }
        if num_outputs != container.num_outputs() {
            return Err(ContainerError::Arity {
                kind: IoKind::Output,
                expected: container.num_outputs(),
                actual: num_outputs,
            });
        }

        let inputs = handle_slice(input_handles, num_inputs, "input handle")?
            .iter()
            .map(|&h| ForeignTensor::from_handle(h))
            .collect::<Result<Vec<_>>>()?;
        let mut outputs = handle_slice(output_handles, num_outputs, "output handle")?
            .iter()
            .map(|&h| ForeignTensor::from_handle(h))
            .collect::<Result<Vec<_>>>()?;

        let input_refs: Vec<&dyn Tensor> = inputs.iter().map(|t| t as &dyn Tensor).collect();
        let mut output_refs: Vec<&mut dyn TensorMut> = outputs
            .iter_mut()
            .map(|t| t as &mut dyn TensorMut)
            .collect();

        let stream = StreamHandle::from_raw(stream_handle as *mut c_void);
        let proxy = ForeignProxy::from_handle(proxy_executor_handle);
        let shapes = container.run(
            &input_refs,
            &mut output_refs,
            stream,
            proxy.as_ref().map(|p| p as &dyn ProxyExecutor),
        )?;

        if !ret_output_ndims.is_null() {
            for (i, shape) in shapes.iter().enumerate() {
                *ret_output_ndims.add(i) = shape.rank() as i64;
            }
        }
        OUTPUT_SIZES.with(|stored| {
            let mut stored = stored.borrow_mut();
            *stored = shapes;
            if !ret_output_sizes.is_null() {
                for (i, shape) in stored.iter().enumerate() {
                    *ret_output_sizes.add(i) = shape.dims().as_ptr();
                }
            }
        });
        Ok(())
    })
}

/// # Safety
///
/// `handle` must be a live container handle; `ret` must be writable.
pub unsafe fn count<G: CompiledGraph>(
    handle: AOTInductorModelContainerHandle,
    kind: IoKind,
    ret: *mut usize,
) -> AOTInductorError {
    guard(|| {
        let container = container::<G>(handle)?;
        let out = non_null(ret, "count out-parameter")?;
        *out = container.signature().entries(kind).len();
        Ok(())
    })
}

/// Name of a signature entry. The string lives as long as the container.
///
/// # Safety
///
/// `handle` must be a live container handle; `ret` must be writable.
pub unsafe fn name<G: CompiledGraph>(
    handle: AOTInductorModelContainerHandle,
    kind: IoKind,
    index: usize,
    ret: *mut *const c_char,
) -> AOTInductorError {
    guard(|| {
        let container = container::<G>(handle)?;
        let out = non_null(ret, "name out-parameter")?;
        *out = container.signature().entry(kind, index)?.name_cstr().as_ptr();
        Ok(())
    })
}

/// Dtype token of a signature entry. The string is static.
///
/// # Safety
///
/// `handle` must be a live container handle; `ret` must be writable.
pub unsafe fn dtype<G: CompiledGraph>(
    handle: AOTInductorModelContainerHandle,
    kind: IoKind,
    index: usize,
    ret: *mut *const c_char,
) -> AOTInductorError {
    guard(|| {
        let container = container::<G>(handle)?;
        let out = non_null(ret, "dtype out-parameter")?;
        *out = container.signature().entry(kind, index)?.dtype.as_cstr().as_ptr();
        Ok(())
    })
}

/// Maximum shape of a signature entry. The extents live as long as the
/// container.
///
/// # Safety
///
/// `handle` must be a live container handle; both out-parameters must be
/// writable.
pub unsafe fn max_shape<G: CompiledGraph>(
    handle: AOTInductorModelContainerHandle,
    kind: IoKind,
    index: usize,
    ret_sizes: *mut *const i64,
    ret_ndim: *mut i64,
) -> AOTInductorError {
    guard(|| {
        let container = container::<G>(handle)?;
        let sizes_out = non_null(ret_sizes, "sizes out-parameter")?;
        let ndim_out = non_null(ret_ndim, "ndim out-parameter")?;
        let max = &container.signature().entry(kind, index)?.max_shape;
        *sizes_out = max.dims().as_ptr();
        *ndim_out = max.rank() as i64;
        Ok(())
    })
}

/// Emit the C entry points for a compiled graph type.
///
/// `$load` is an expression evaluating to a `FnOnce() -> Result<$graph>`
/// that loads the compiled graph; it runs once per container creation.
/// Also emits `container_api()`, returning the same entry points as a
/// [`ContainerApi`](crate::ffi::ContainerApi) table.
///
/// ```ignore
/// aoti_container::export_model_container!(
///     aoti_container::reference::AffineGraph,
///     || aoti_container::reference::AffineGraph::builder().build()
/// );
/// ```
#[macro_export]
macro_rules! export_model_container {
    ($graph:ty, $load:expr) => {
        /// # Safety
        ///
        /// See `aoti_container::ffi::export::create`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerCreate(
            container_handle: *mut $crate::ffi::AOTInductorModelContainerHandle,
            num_models: usize,
            is_cpu: bool,
            cubin_dir: *const ::std::os::raw::c_char,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::create::<$graph, _>(
                container_handle,
                num_models,
                is_cpu,
                cubin_dir,
                $load,
            )
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::delete`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerDelete(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::delete::<$graph>(container_handle)
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::run`.
        #[no_mangle]
        #[allow(non_snake_case, clippy::too_many_arguments)]
        pub unsafe extern "C" fn AOTInductorModelContainerRun(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
            input_handles: *const $crate::ffi::AOTInductorTensorHandle,
            num_inputs: usize,
            output_handles: *const $crate::ffi::AOTInductorTensorHandle,
            num_outputs: usize,
            stream_handle: $crate::ffi::AOTInductorStreamHandle,
            proxy_executor_handle: $crate::ffi::AOTInductorProxyExecutorHandle,
            ret_output_sizes: *mut *const i64,
            ret_output_ndims: *mut i64,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::run::<$graph>(
                container_handle,
                input_handles,
                num_inputs,
                output_handles,
                num_outputs,
                stream_handle,
                proxy_executor_handle,
                ret_output_sizes,
                ret_output_ndims,
            )
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::count`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerGetNumInputs(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
            ret_num_inputs: *mut usize,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::count::<$graph>(
                container_handle,
                $crate::IoKind::Input,
                ret_num_inputs,
            )
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::name`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerGetInputName(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
            input_idx: usize,
            ret_input_names: *mut *const ::std::os::raw::c_char,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::name::<$graph>(
                container_handle,
                $crate::IoKind::Input,
                input_idx,
                ret_input_names,
            )
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::dtype`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerGetInputDtype(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
            input_idx: usize,
            ret_input_dtypes: *mut *const ::std::os::raw::c_char,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::dtype::<$graph>(
                container_handle,
                $crate::IoKind::Input,
                input_idx,
                ret_input_dtypes,
            )
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::count`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerGetNumOutputs(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
            ret_num_outputs: *mut usize,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::count::<$graph>(
                container_handle,
                $crate::IoKind::Output,
                ret_num_outputs,
            )
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::name`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerGetOutputName(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
            output_idx: usize,
            ret_output_names: *mut *const ::std::os::raw::c_char,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::name::<$graph>(
                container_handle,
                $crate::IoKind::Output,
                output_idx,
                ret_output_names,
            )
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::dtype`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerGetOutputDtype(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
            output_idx: usize,
            ret_output_dtypes: *mut *const ::std::os::raw::c_char,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::dtype::<$graph>(
                container_handle,
                $crate::IoKind::Output,
                output_idx,
                ret_output_dtypes,
            )
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::max_shape`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerGetMaxInputShape(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
            input_idx: usize,
            ret_input_sizes: *mut *const i64,
            ret_input_ndim: *mut i64,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::max_shape::<$graph>(
                container_handle,
                $crate::IoKind::Input,
                input_idx,
                ret_input_sizes,
                ret_input_ndim,
            )
        }

        /// # Safety
        ///
        /// See `aoti_container::ffi::export::max_shape`.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn AOTInductorModelContainerGetMaxOutputShape(
            container_handle: $crate::ffi::AOTInductorModelContainerHandle,
            output_idx: usize,
            ret_output_sizes: *mut *const i64,
            ret_output_ndim: *mut i64,
        ) -> $crate::ffi::AOTInductorError {
            $crate::ffi::export::max_shape::<$graph>(
                container_handle,
                $crate::IoKind::Output,
                output_idx,
                ret_output_sizes,
                ret_output_ndim,
            )
        }

        /// Entry points emitted above, as a function table.
        pub fn container_api() -> $crate::ffi::ContainerApi {
            $crate::ffi::ContainerApi {
                create: AOTInductorModelContainerCreate,
                delete: AOTInductorModelContainerDelete,
                run: AOTInductorModelContainerRun,
                get_num_inputs: AOTInductorModelContainerGetNumInputs,
                get_input_name: AOTInductorModelContainerGetInputName,
                get_input_dtype: AOTInductorModelContainerGetInputDtype,
                get_num_outputs: AOTInductorModelContainerGetNumOutputs,
                get_output_name: AOTInductorModelContainerGetOutputName,
                get_output_dtype: AOTInductorModelContainerGetOutputDtype,
                get_max_input_shape: AOTInductorModelContainerGetMaxInputShape,
                get_max_output_shape: AOTInductorModelContainerGetMaxOutputShape,
                get_last_error: $crate::ffi::AOTInductorGetLastError,
            }
        }
    };
}
