//! Pooled model container.
//!
//! A [`ModelContainer`] owns a fixed number of [`ModelInstance`]s built from
//! one shared [`CompiledGraph`] and dispatches each run to a free instance.

mod instance;
mod pool;
mod signature;

pub use instance::ModelInstance;
pub use pool::{InstancePool, Lease, PoolStats};
pub use signature::{ModelSignature, TensorSignature};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ContainerConfig;
use crate::error::{ContainerError, IoKind, Result};
use crate::graph::{CompiledGraph, ExecutionMode, InstanceOptions, RunContext};
use crate::proxy::ProxyExecutor;
use crate::stream::StreamHandle;
use crate::tensor::{DType, Shape, Tensor, TensorMut};

/// Pool of model instances sharing one compiled graph.
///
/// Every instance is built from the same `Arc<G>`, so input/output arity,
/// names, dtypes and maximum shapes are identical across the pool and fixed
/// for the container's lifetime.
///
/// # Example
///
/// ```ignore
/// use aoti_container::{HostTensor, ModelContainer, DType};
/// use aoti_container::reference::AffineGraph;
///
/// let graph = AffineGraph::builder().max_shape(&[4, 4]).build()?;
/// let container = ModelContainer::create(graph, 2, true, None)?;
///
/// let input = HostTensor::zeros(DType::F32, &[2, 4]);
/// let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
/// let shapes = container.run(&[&input], &mut [&mut output], None, None)?;
/// assert_eq!(shapes[0].dims(), &[2, 4]);
/// ```
pub struct ModelContainer<G: CompiledGraph> {
    graph: Arc<G>,
    pool: InstancePool<ModelInstance<G>>,
    mode: ExecutionMode,
    cubin_dir: Option<PathBuf>,
}

impl<G: CompiledGraph> ModelContainer<G> {
    /// Build `num_models` instances of `graph`.
    ///
    /// In CPU mode `cubin_dir` is ignored. Creation is all-or-nothing: if
    /// any instance fails to bind, the ones already built are dropped before
    /// the error is returned.
    pub fn create(
        graph: G,
        num_models: usize,
        is_cpu: bool,
        cubin_dir: Option<&Path>,
    ) -> Result<Self> {
        if num_models == 0 {
            return Err(ContainerError::init("num_models must be at least 1"));
        }
        let mode = ExecutionMode::from_is_cpu(is_cpu);
        let cubin_dir = if mode.is_cpu() {
            None
        } else {
            cubin_dir.map(Path::to_path_buf)
        };
        let graph = Arc::new(graph);

        let mut instances = Vec::with_capacity(num_models);
        for index in 0..num_models {
            let options = InstanceOptions {
                index,
                mode,
                cubin_dir: cubin_dir.as_deref(),
            };
            match ModelInstance::load(Arc::clone(&graph), &options) {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    warn!(
                        failed = index,
                        torn_down = instances.len(),
                        "container creation failed: {}",
                        e
                    );
                    drop(instances);
                    return Err(e);
                }
            }
        }

        let signature = graph.signature();
        info!(
            num_models,
            %mode,
            inputs = signature.inputs.len(),
            outputs = signature.outputs.len(),
            "model container created"
        );

        Ok(Self {
            graph,
            pool: InstancePool::new(instances),
            mode,
            cubin_dir,
        })
    }

    /// Build a container from the `container` section of a config file.
    pub fn from_config(graph: G, config: &ContainerConfig) -> Result<Self> {
        let mode: ExecutionMode = config.device.parse()?;
        Self::create(
            graph,
            config.num_models,
            mode.is_cpu(),
            config.cubin_dir.as_deref(),
        )
    }

    /// Run inference on one free instance, blocking until one is available.
    ///
    /// `outputs` must be allocated at or above the maximum output sizes.
    /// Returns the actual shape of every output. Requests that violate the
    /// signature are rejected before any instance is acquired, so outputs
    /// stay untouched and no instance is consumed.
    pub fn run(
        &self,
        inputs: &[&dyn Tensor],
        outputs: &mut [&mut dyn TensorMut],
        stream: Option<StreamHandle>,
        proxy: Option<&dyn ProxyExecutor>,
    ) -> Result<Vec<Shape>> {
        self.check_request(inputs, outputs, proxy)?;
        let lease = self.pool.acquire()?;
        self.dispatch(lease, inputs, outputs, RunContext { stream, proxy })
    }

    /// Like [`run`](Self::run), but fails with [`ContainerError::Timeout`]
    /// if no instance frees up within `timeout`.
    pub fn run_timeout(
        &self,
        inputs: &[&dyn Tensor],
        outputs: &mut [&mut dyn TensorMut],
        stream: Option<StreamHandle>,
        proxy: Option<&dyn ProxyExecutor>,
        timeout: Duration,
    ) -> Result<Vec<Shape>> {
        self.check_request(inputs, outputs, proxy)?;
        let lease = self.pool.acquire_timeout(timeout)?;
        self.dispatch(lease, inputs, outputs, RunContext { stream, proxy })
    }

    fn check_request(
        &self,
        inputs: &[&dyn Tensor],
        outputs: &[&mut dyn TensorMut],
        proxy: Option<&dyn ProxyExecutor>,
    ) -> Result<()> {
        let signature = self.graph.signature();
        signature.validate_inputs(inputs)?;
        signature.validate_outputs(outputs)?;
        if proxy.is_none() && self.graph.num_extern_nodes() > 0 {
            return Err(ContainerError::MissingProxy);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        mut lease: Lease<'_, ModelInstance<G>>,
        inputs: &[&dyn Tensor],
        outputs: &mut [&mut dyn TensorMut],
        ctx: RunContext<'_>,
    ) -> Result<Vec<Shape>> {
        let index = lease.index();
        debug!(instance = index, "dispatching run");
        match lease.run(inputs, outputs, &ctx) {
            Ok(shapes) => Ok(shapes),
            Err(e) if e.preserves_instance() => Err(e),
            Err(e) => {
                warn!(instance = index, "retiring instance after failed run: {}", e);
                lease.retire();
                Err(e)
            }
        }
    }

    pub fn signature(&self) -> &ModelSignature {
        self.graph.signature()
    }

    pub fn num_models(&self) -> usize {
        self.pool.len()
    }

    pub fn is_cpu(&self) -> bool {
        self.mode.is_cpu()
    }

    /// Binaries directory used to resolve device kernels, if any.
    pub fn cubin_dir(&self) -> Option<&Path> {
        self.cubin_dir.as_deref()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Runs currently holding an instance.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn num_inputs(&self) -> usize {
        self.signature().inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.signature().outputs.len()
    }

    pub fn input_name(&self, index: usize) -> Result<&str> {
        Ok(&self.signature().entry(IoKind::Input, index)?.name)
    }

    pub fn output_name(&self, index: usize) -> Result<&str> {
        Ok(&self.signature().entry(IoKind::Output, index)?.name)
    }

    pub fn input_dtype(&self, index: usize) -> Result<DType> {
        Ok(self.signature().entry(IoKind::Input, index)?.dtype)
    }

    pub fn output_dtype(&self, index: usize) -> Result<DType> {
        Ok(self.signature().entry(IoKind::Output, index)?.dtype)
    }

    /// Largest shape the input at `index` may take.
    pub fn max_input_shape(&self, index: usize) -> Result<&Shape> {
        Ok(&self.signature().entry(IoKind::Input, index)?.max_shape)
    }

    /// Largest shape the output at `index` may take.
    pub fn max_output_shape(&self, index: usize) -> Result<&Shape> {
        Ok(&self.signature().entry(IoKind::Output, index)?.max_shape)
    }
}

impl<G: CompiledGraph> Drop for ModelContainer<G> {
    fn drop(&mut self) {
        info!(num_models = self.pool.len(), "model container released");
    }
}
