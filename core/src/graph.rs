//! Boundary to the ahead-of-time compiled model graph.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::container::ModelSignature;
use crate::error::{ContainerError, Result};
use crate::proxy::{ProxyCall, ProxyExecutor};
use crate::stream::StreamHandle;
use crate::tensor::{Shape, Tensor, TensorMut};

/// Where instances execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Host-side execution; any binaries directory is ignored.
    #[default]
    Cpu,
    /// Device execution with kernels resolved per instance.
    Device,
}

impl ExecutionMode {
    pub fn from_is_cpu(is_cpu: bool) -> Self {
        if is_cpu {
            Self::Cpu
        } else {
            Self::Device
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl FromStr for ExecutionMode {
    type Err = ContainerError;

    /// Parse a device string like "cpu", "cuda", "cuda:0", "gpu".
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if s == "cpu" {
            Ok(Self::Cpu)
        } else if s == "cuda" || s == "gpu" {
            Ok(Self::Device)
        } else if let Some(idx) = s.strip_prefix("cuda:") {
            idx.parse::<usize>()
                .map_err(|_| ContainerError::config(format!("Invalid CUDA index: {}", idx)))?;
            Ok(Self::Device)
        } else {
            Err(ContainerError::config(format!("Invalid device: {}", s)))
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Device => write!(f, "device"),
        }
    }
}

/// Parameters handed to each instance while it binds the compiled graph.
#[derive(Debug, Clone, Copy)]
pub struct InstanceOptions<'a> {
    /// Position of the instance in the pool.
    pub index: usize,
    pub mode: ExecutionMode,
    /// Directory holding auxiliary device binaries. Always `None` in CPU mode.
    pub cubin_dir: Option<&'a Path>,
}

/// Per-call execution environment.
pub struct RunContext<'a> {
    pub stream: Option<StreamHandle>,
    pub proxy: Option<&'a dyn ProxyExecutor>,
}

impl RunContext<'_> {
    /// Send a delegated operator to the proxy executor.
    pub fn delegate(&self, call: &mut ProxyCall<'_, '_>) -> Result<()> {
        let node = call.extern_node_index;
        let proxy = self.proxy.ok_or(ContainerError::MissingProxy)?;
        proxy
            .call_function(call)
            .map_err(|e| ContainerError::Delegated {
                node,
                message: e.to_string(),
            })
    }
}

/// A compiled, fixed-topology model.
///
/// One value is shared read-only by every instance in a container. Mutable
/// per-instance state lives in [`CompiledGraph::Scratch`], which the
/// container hands to exactly one run at a time.
pub trait CompiledGraph: Send + Sync + 'static {
    /// Intermediate buffers and resolved kernels owned by one instance.
    type Scratch: Send + 'static;

    /// Input/output signature. Must not change after construction.
    fn signature(&self) -> &ModelSignature;

    /// Number of operators this graph delegates to a proxy executor.
    fn num_extern_nodes(&self) -> usize {
        0
    }

    /// Allocate and bind the state for one instance.
    fn instantiate(&self, options: &InstanceOptions<'_>) -> Result<Self::Scratch>;

    /// Execute once and return the actual shape of every output.
    ///
    /// Inputs and outputs have already been checked against the signature.
    /// Contract violations found here must be reported before `scratch` is
    /// modified; any other error retires the instance.
    fn execute(
        &self,
        scratch: &mut Self::Scratch,
        inputs: &[&dyn Tensor],
        outputs: &mut [&mut dyn TensorMut],
        ctx: &RunContext<'_>,
    ) -> Result<Vec<Shape>>;
}
