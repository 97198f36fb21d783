//! Reference compiled graph.
//!
//! [`AffineGraph`] computes `y = x * scale + bias` elementwise over one
//! dynamically-shaped `float32` input. With `extern_op` enabled it hands the
//! intermediate buffer to the proxy executor as extern node 0 between the
//! affine step and the output copy, which exercises the delegation path.
//! The CLI and the tests use it as a stand-in for generated model code.

use crate::config::ModelConfig;
use crate::container::{ModelSignature, TensorSignature};
use crate::error::{ContainerError, Result};
use crate::graph::{CompiledGraph, ExecutionMode, InstanceOptions, RunContext};
use crate::proxy::ProxyCall;
use crate::tensor::{read_f32, write_f32, DType, HostTensor, Shape, Tensor, TensorMut};

/// Extern node index used for the delegated operator.
pub const AFFINE_EXTERN_NODE: usize = 0;

pub struct AffineGraph {
    signature: ModelSignature,
    scale: f32,
    bias: f32,
    extern_op: bool,
    device_capable: bool,
}

/// Builder for [`AffineGraph`].
#[derive(Debug, Clone)]
pub struct AffineGraphBuilder {
    input_name: String,
    output_name: String,
    max_shape: Vec<i64>,
    scale: f32,
    bias: f32,
    extern_op: bool,
    device_capable: bool,
}

impl Default for AffineGraphBuilder {
    fn default() -> Self {
        Self {
            input_name: "x".to_string(),
            output_name: "y".to_string(),
            max_shape: vec![4, 4],
            scale: 1.0,
            bias: 0.0,
            extern_op: false,
            device_capable: true,
        }
    }
}

impl AffineGraphBuilder {
    pub fn names(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input_name = input.into();
        self.output_name = output.into();
        self
    }

    pub fn max_shape(mut self, dims: &[i64]) -> Self {
        self.max_shape = dims.to_vec();
        self
    }

    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn bias(mut self, bias: f32) -> Self {
        self.bias = bias;
        self
    }

    /// Delegate a step to the proxy executor on every run.
    pub fn extern_op(mut self, enabled: bool) -> Self {
        self.extern_op = enabled;
        self
    }

    /// Whether instances can bind in device mode.
    pub fn device_capable(mut self, capable: bool) -> Self {
        self.device_capable = capable;
        self
    }

    pub fn build(self) -> Result<AffineGraph> {
        let signature = ModelSignature::new(
            vec![TensorSignature::new(self.input_name, DType::F32, &self.max_shape)?],
            vec![TensorSignature::new(self.output_name, DType::F32, &self.max_shape)?],
        );
        Ok(AffineGraph {
            signature,
            scale: self.scale,
            bias: self.bias,
            extern_op: self.extern_op,
            device_capable: self.device_capable,
        })
    }
}

impl AffineGraph {
    pub fn builder() -> AffineGraphBuilder {
        AffineGraphBuilder::default()
    }

    /// Build from the `model` section of a config file.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        if config.dtype != DType::F32 {
            return Err(ContainerError::config(format!(
                "Reference graph only supports float32, got {}",
                config.dtype
            )));
        }
        Self::builder()
            .names(&config.input, &config.output)
            .max_shape(&config.max_shape)
            .scale(config.scale)
            .bias(config.bias)
            .extern_op(config.extern_op)
            .build()
    }
}

/// Per-instance intermediate buffer, sized for the maximum shape.
pub struct AffineScratch {
    buffer: HostTensor,
}

impl CompiledGraph for AffineGraph {
    type Scratch = AffineScratch;

    fn signature(&self) -> &ModelSignature {
        &self.signature
    }

    fn num_extern_nodes(&self) -> usize {
        usize::from(self.extern_op)
    }

    fn instantiate(&self, options: &InstanceOptions<'_>) -> Result<AffineScratch> {
        if options.mode == ExecutionMode::Device {
            if !self.device_capable {
                return Err(ContainerError::init(format!(
                    "instance {}: no device available",
                    options.index
                )));
            }
            if let Some(dir) = options.cubin_dir {
                if !dir.is_dir() {
                    return Err(ContainerError::init(format!(
                        "instance {}: binaries directory {} is not a directory",
                        options.index,
                        dir.display()
                    )));
                }
            }
        }
        let max_shape = &self.signature.inputs[0].max_shape;
        Ok(AffineScratch {
            buffer: HostTensor::zeros(DType::F32, max_shape.dims()),
        })
    }

    fn execute(
        &self,
        scratch: &mut AffineScratch,
        inputs: &[&dyn Tensor],
        outputs: &mut [&mut dyn TensorMut],
        ctx: &RunContext<'_>,
    ) -> Result<Vec<Shape>> {
        let input = inputs[0];
        let shape = input.shape();
        let numel = shape.numel();

        let values: Vec<f32> = read_f32(input.as_bytes(), numel)
            .into_iter()
            .map(|v| v * self.scale + self.bias)
            .collect();
        write_f32(scratch.buffer.as_bytes_mut(), &values);

        if self.extern_op {
            let mut args: [&mut dyn TensorMut; 1] = [&mut scratch.buffer];
            let mut call = ProxyCall {
                extern_node_index: AFFINE_EXTERN_NODE,
                int_args: &[numel as i64],
                tensor_args: &mut args,
            };
            ctx.delegate(&mut call)?;
        }

        let nbytes = numel * DType::F32.size_in_bytes();
        outputs[0].as_bytes_mut()[..nbytes].copy_from_slice(&scratch.buffer.as_bytes()[..nbytes]);
        Ok(vec![shape])
    }
}
