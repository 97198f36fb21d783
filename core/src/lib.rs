//! aoti-container: pooled execution container for ahead-of-time compiled models.
//!
//! A [`ModelContainer`] wraps a fixed number of instances of one compiled
//! graph and runs requests on whichever instance is free. It reports the
//! model's input/output signature, including the maximum shape of every
//! tensor, and forwards operators the graph could not compile to a
//! caller-supplied [`ProxyExecutor`].
//!
//! The same container is reachable through a C ABI: model crates emit the
//! `AOTInductorModelContainer*` entry points with
//! [`export_model_container!`], and callers use [`AotContainer`], which turns
//! status codes back into `Result`s.
//!
//! # Example
//!
//! ```ignore
//! use aoti_container::reference::AffineGraph;
//! use aoti_container::{DType, HostTensor, ModelContainer};
//!
//! // Two instances, host execution
//! let graph = AffineGraph::builder().max_shape(&[4, 4]).scale(2.0).build()?;
//! let container = ModelContainer::create(graph, 2, true, None)?;
//!
//! // Output slots are allocated at the maximum shape
//! let input = HostTensor::from_f32(&[2, 4], &[1.0; 8])?;
//! let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
//!
//! let shapes = container.run(&[&input], &mut [&mut output], None, None)?;
//! println!("output shape: {}", shapes[0]);
//! ```
//!
//! # Concurrency
//!
//! `run` may be called from any number of threads. At most `num_models`
//! runs execute at once; further callers block until an instance frees up.
//! Instances that fail mid-run are retired rather than reused.

pub mod cli;
pub mod config;
pub mod container;
pub mod error;
pub mod ffi;
pub mod graph;
pub mod proxy;
pub mod reference;
pub mod stream;
pub mod tensor;

// Re-export commonly used types
pub use container::{ModelContainer, ModelSignature, PoolStats, TensorSignature};
pub use error::{ContainerError, ErrorClass, IoKind, ProxyError, Result};
pub use ffi::AotContainer;
pub use graph::{CompiledGraph, ExecutionMode, InstanceOptions, RunContext};
pub use proxy::{ProxyCall, ProxyExecutor};
pub use stream::StreamHandle;
pub use tensor::{DType, HostTensor, Shape, Tensor, TensorMut};
