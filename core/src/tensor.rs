//! Tensor capability traits and a host-side tensor implementation.
//!
//! The container never inspects concrete array types. It reads dtype, sizes
//! and raw bytes through [`Tensor`] and writes results through [`TensorMut`].
//! Array libraries implement these traits (or the C accessor table in
//! [`crate::ffi`]) for their own storage.

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::ffi::CStr;
use std::fmt;
use std::str::FromStr;

use crate::error::{ContainerError, Result};

/// Element type, identified across the boundary by a string token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// String token used in signatures and at the C boundary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "uint8",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    /// Nul-terminated token with static lifetime.
    pub fn as_cstr(&self) -> &'static CStr {
        match self {
            Self::Bool => c"bool",
            Self::U8 => c"uint8",
            Self::I8 => c"int8",
            Self::I16 => c"int16",
            Self::I32 => c"int32",
            Self::I64 => c"int64",
            Self::F16 => c"float16",
            Self::BF16 => c"bfloat16",
            Self::F32 => c"float32",
            Self::F64 => c"float64",
        }
    }

    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::I16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

impl FromStr for DType {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "bool" => Ok(Self::Bool),
            "uint8" => Ok(Self::U8),
            "int8" => Ok(Self::I8),
            "int16" => Ok(Self::I16),
            "int32" => Ok(Self::I32),
            "int64" => Ok(Self::I64),
            "float16" => Ok(Self::F16),
            "bfloat16" => Ok(Self::BF16),
            "float32" => Ok(Self::F32),
            "float64" => Ok(Self::F64),
            other => Err(ContainerError::config(format!("Unknown dtype: {}", other))),
        }
    }
}

impl TryFrom<String> for DType {
    type Error = ContainerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DType> for String {
    fn from(value: DType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-dimension extents, in the `int64` convention of the C boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub SmallVec<[i64; 6]>);

impl Shape {
    pub fn from_slice(d: &[i64]) -> Self {
        Self(d.iter().copied().collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    /// Element count. A rank-0 shape holds one element.
    ///
    /// Saturates at `usize::MAX`; use [`checked_numel`](Self::checked_numel)
    /// where overflow must be detected.
    pub fn numel(&self) -> usize {
        self.checked_numel().unwrap_or(usize::MAX)
    }

    /// Element count, or `None` if it does not fit in `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| {
            acc.checked_mul(usize::try_from(d.max(0)).ok()?)
        })
    }

    /// True if `self` has the same rank as `max` and no dimension exceeds it.
    pub fn fits_within(&self, max: &Shape) -> bool {
        self.rank() == max.rank()
            && self
                .0
                .iter()
                .zip(max.0.iter())
                .all(|(&d, &m)| d >= 0 && d <= m)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_slice())
    }
}

/// Read access to a tensor owned by someone else.
pub trait Tensor {
    fn dtype(&self) -> DType;

    fn sizes(&self) -> &[i64];

    /// Contiguous element storage.
    fn as_bytes(&self) -> &[u8];

    fn shape(&self) -> Shape {
        Shape::from_slice(self.sizes())
    }
}

/// Write access, used for caller-provided output slots and delegated
/// operator arguments.
pub trait TensorMut: Tensor {
    fn as_bytes_mut(&mut self) -> &mut [u8];
}

/// Host-resident contiguous tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dtype: DType,
    shape: Shape,
    data: Vec<u8>,
}

impl HostTensor {
    /// Zero-filled tensor.
    pub fn zeros(dtype: DType, sizes: &[i64]) -> Self {
        let shape = Shape::from_slice(sizes);
        let data = vec![0u8; shape.numel().saturating_mul(dtype.size_in_bytes())];
        Self { dtype, shape, data }
    }

    /// `float32` tensor from values in row-major order.
    pub fn from_f32(sizes: &[i64], values: &[f32]) -> Result<Self> {
        let shape = Shape::from_slice(sizes);
        if shape.numel() != values.len() {
            return Err(ContainerError::config(format!(
                "{} values do not fill shape {}",
                values.len(),
                shape
            )));
        }
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Ok(Self {
            dtype: DType::F32,
            shape,
            data,
        })
    }

    /// `float32` tensor from an ndarray.
    pub fn from_array(array: &ArrayD<f32>) -> Self {
        let sizes: Vec<i64> = array.shape().iter().map(|&s| s as i64).collect();
        let contiguous = array.as_standard_layout();
        let data = contiguous.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self {
            dtype: DType::F32,
            shape: Shape::from_slice(&sizes),
            data,
        }
    }

    /// Leading `shape.numel()` elements decoded as `float32`.
    ///
    /// Output slots are allocated at the maximum shape; pass the actual
    /// shape reported by the run to read only the valid prefix.
    pub fn to_f32_vec(&self, shape: &Shape) -> Result<Vec<f32>> {
        if self.dtype != DType::F32 {
            return Err(ContainerError::config(format!(
                "Cannot read {} tensor as float32",
                self.dtype
            )));
        }
        let needed = shape.numel().saturating_mul(4);
        if needed > self.data.len() {
            return Err(ContainerError::config(format!(
                "Shape {} needs {} bytes, tensor holds {}",
                shape,
                needed,
                self.data.len()
            )));
        }
        Ok(read_f32(&self.data, shape.numel()))
    }

    /// Leading elements as an ndarray of the given shape.
    pub fn to_array(&self, shape: &Shape) -> Result<ArrayD<f32>> {
        let values = self.to_f32_vec(shape)?;
        let dims: Vec<usize> = shape.dims().iter().map(|&d| d as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&dims), values)
            .map_err(|e| ContainerError::config(format!("Array shape error: {}", e)))
    }
}

impl Tensor for HostTensor {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn sizes(&self) -> &[i64] {
        self.shape.dims()
    }

    fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl TensorMut for HostTensor {
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Decode native-endian `float32` values from the front of `bytes`.
pub(crate) fn read_f32(bytes: &[u8], count: usize) -> Vec<f32> {
    bytes[..count * 4]
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Encode `values` as native-endian `float32` at the front of `bytes`.
pub(crate) fn write_f32(bytes: &mut [u8], values: &[f32]) {
    for (dst, v) in bytes.chunks_exact_mut(4).zip(values) {
        dst.copy_from_slice(&v.to_ne_bytes());
    }
}
