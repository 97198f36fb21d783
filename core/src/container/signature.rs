//! Input/output signature and run-request validation.

use serde::Serialize;
use std::ffi::{CStr, CString};

use crate::error::{ContainerError, IoKind, Result};
use crate::tensor::{DType, Shape, Tensor, TensorMut};

/// One declared input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorSignature {
    pub name: String,
    pub dtype: DType,
    pub max_shape: Shape,
    #[serde(skip)]
    name_c: CString,
}

impl TensorSignature {
    pub fn new(name: impl Into<String>, dtype: DType, max_shape: &[i64]) -> Result<Self> {
        let name = name.into();
        let name_c = CString::new(name.as_str())
            .map_err(|_| ContainerError::config(format!("Invalid signature name: {:?}", name)))?;
        if max_shape.iter().any(|&d| d < 0) {
            return Err(ContainerError::config(format!(
                "Negative extent in maximum shape of {}",
                name
            )));
        }
        let max_shape = Shape::from_slice(max_shape);
        let fits = max_shape
            .checked_numel()
            .and_then(|n| n.checked_mul(dtype.size_in_bytes()))
            .is_some();
        if !fits {
            return Err(ContainerError::config(format!(
                "Maximum shape {} of {} overflows the addressable size",
                max_shape, name
            )));
        }
        Ok(Self {
            name,
            dtype,
            max_shape,
            name_c,
        })
    }

    /// Name as a nul-terminated string that lives as long as the signature.
    pub fn name_cstr(&self) -> &CStr {
        &self.name_c
    }

    /// Bytes needed to hold a tensor at the maximum shape.
    pub fn max_nbytes(&self) -> usize {
        self.max_shape.numel().saturating_mul(self.dtype.size_in_bytes())
    }
}

/// Ordered inputs and outputs of a compiled graph. Index `i` always names
/// the same logical tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSignature {
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
}

impl ModelSignature {
    pub fn new(inputs: Vec<TensorSignature>, outputs: Vec<TensorSignature>) -> Self {
        Self { inputs, outputs }
    }

    pub fn entries(&self, kind: IoKind) -> &[TensorSignature] {
        match kind {
            IoKind::Input => &self.inputs,
            IoKind::Output => &self.outputs,
        }
    }

    /// Entry at `index`, or an out-of-range error.
    pub fn entry(&self, kind: IoKind, index: usize) -> Result<&TensorSignature> {
        let entries = self.entries(kind);
        entries.get(index).ok_or(ContainerError::IndexOutOfRange {
            kind,
            index,
            count: entries.len(),
        })
    }

    pub fn validate_inputs(&self, inputs: &[&dyn Tensor]) -> Result<()> {
        check_arity(IoKind::Input, self.inputs.len(), inputs.len())?;
        for (index, (sig, tensor)) in self.inputs.iter().zip(inputs).enumerate() {
            check_dtype(IoKind::Input, index, sig.dtype, tensor.dtype())?;
            let shape = tensor.shape();
            if !shape.fits_within(&sig.max_shape) {
                return Err(ContainerError::ShapeOutOfBounds {
                    kind: IoKind::Input,
                    index,
                    actual: shape,
                    max: sig.max_shape.clone(),
                });
            }
            let needed = shape.numel().saturating_mul(sig.dtype.size_in_bytes());
            if tensor.as_bytes().len() < needed {
                return Err(ContainerError::invalid_handle(format!(
                    "input {} of shape {} is backed by {} bytes, needs {}",
                    index,
                    shape,
                    tensor.as_bytes().len(),
                    needed
                )));
            }
        }
        Ok(())
    }

    pub fn validate_outputs(&self, outputs: &[&mut dyn TensorMut]) -> Result<()> {
        check_arity(IoKind::Output, self.outputs.len(), outputs.len())?;
        for (index, (sig, slot)) in self.outputs.iter().zip(outputs).enumerate() {
            check_dtype(IoKind::Output, index, sig.dtype, slot.dtype())?;
            let available = slot.as_bytes().len();
            if available < sig.max_nbytes() {
                return Err(ContainerError::OutputCapacity {
                    index,
                    required: sig.max_nbytes(),
                    available,
                });
            }
        }
        Ok(())
    }

    /// Check shapes produced by a run against the declared output bounds.
    pub fn validate_output_shapes(&self, shapes: &[Shape]) -> Result<()> {
        if shapes.len() != self.outputs.len() {
            return Err(ContainerError::execution(format!(
                "graph reported {} output shapes for {} outputs",
                shapes.len(),
                self.outputs.len()
            )));
        }
        for (index, (sig, shape)) in self.outputs.iter().zip(shapes).enumerate() {
            if !shape.fits_within(&sig.max_shape) {
                return Err(ContainerError::execution(format!(
                    "output {} has shape {}, beyond declared maximum {}",
                    index, shape, sig.max_shape
                )));
            }
        }
        Ok(())
    }
}

fn check_arity(kind: IoKind, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(ContainerError::Arity {
            kind,
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_dtype(kind: IoKind, index: usize, expected: DType, actual: DType) -> Result<()> {
    if expected != actual {
        return Err(ContainerError::DtypeMismatch {
            kind,
            index,
            expected,
            actual,
        });
    }
    Ok(())
}
