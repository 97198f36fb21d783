//! Delegated operator execution.
//!
//! Operators the compiled graph could not inline are sent to a
//! [`ProxyExecutor`] as a [`ProxyCall`] request and executed synchronously
//! on the calling thread.

use crate::error::ProxyError;
use crate::tensor::TensorMut;

/// Request descriptor for one delegated operator.
pub struct ProxyCall<'a, 'b> {
    /// Index of the extern node inside the compiled graph.
    pub extern_node_index: usize,
    /// Flattened integer arguments.
    pub int_args: &'a [i64],
    /// Flattened tensor arguments. The executor may write into them.
    pub tensor_args: &'a mut [&'b mut dyn TensorMut],
}

/// Executes operators that the compiled graph delegates.
///
/// One executor may be passed to runs on several instances at once, so
/// implementations must tolerate concurrent calls.
pub trait ProxyExecutor: Send + Sync {
    fn call_function(&self, call: &mut ProxyCall<'_, '_>) -> Result<(), ProxyError>;
}

impl<F> ProxyExecutor for F
where
    F: Fn(&mut ProxyCall<'_, '_>) -> Result<(), ProxyError> + Send + Sync,
{
    fn call_function(&self, call: &mut ProxyCall<'_, '_>) -> Result<(), ProxyError> {
        self(call)
    }
}
