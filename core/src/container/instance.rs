//! One runnable copy of a compiled graph.

use std::sync::Arc;
use tracing::debug;

use crate::error::{ContainerError, Result};
use crate::graph::{CompiledGraph, InstanceOptions, RunContext};
use crate::tensor::{Shape, Tensor, TensorMut};

/// Shared graph plus the scratch state this instance owns exclusively.
pub struct ModelInstance<G: CompiledGraph> {
    index: usize,
    graph: Arc<G>,
    scratch: G::Scratch,
    runs: u64,
}

impl<G: CompiledGraph> ModelInstance<G> {
    /// Bind `graph` for one pool slot.
    pub fn load(graph: Arc<G>, options: &InstanceOptions<'_>) -> Result<Self> {
        let scratch = graph.instantiate(options).map_err(|e| match e {
            ContainerError::Init(_) => e,
            other => ContainerError::init(format!("instance {}: {}", options.index, other)),
        })?;
        debug!(instance = options.index, mode = %options.mode, "instance bound");
        Ok(Self {
            index: options.index,
            graph,
            scratch,
            runs: 0,
        })
    }

    /// Execute the graph once. Inputs and outputs must already be validated.
    pub fn run(
        &mut self,
        inputs: &[&dyn Tensor],
        outputs: &mut [&mut dyn TensorMut],
        ctx: &RunContext<'_>,
    ) -> Result<Vec<Shape>> {
        let shapes = self
            .graph
            .execute(&mut self.scratch, inputs, outputs, ctx)?;
        self.graph.signature().validate_output_shapes(&shapes)?;
        self.runs += 1;
        debug!(instance = self.index, runs = self.runs, ?shapes, "run complete");
        Ok(shapes)
    }
}
