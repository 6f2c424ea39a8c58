use smallvec::SmallVec;

use crate::error::{QuantError, Result};

/// Dimension sizes; networks here never exceed rank 4.
pub type Shape = SmallVec<[usize; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    I8,
    I32,
}

/// Tagged payload. Layer operations pattern-match on the variant instead of
/// probing a runtime "is quantized" flag.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
    I32(Vec<i32>),
}

/// A multi-dimensional array with an explicit dtype tag. Immutable once
/// produced; each layer owns its output tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    shape: Shape,
}

impl Tensor {
    pub fn from_f32(data: Vec<f32>, shape: &[usize]) -> Self {
        assert_eq!(data.len(), shape.iter().product::<usize>(), "data length must match shape");
        Tensor { data: TensorData::F32(data), shape: shape.iter().copied().collect() }
    }

    pub fn from_i8(data: Vec<i8>, shape: &[usize]) -> Self {
        assert_eq!(data.len(), shape.iter().product::<usize>(), "data length must match shape");
        Tensor { data: TensorData::I8(data), shape: shape.iter().copied().collect() }
    }

    pub fn from_i32(data: Vec<i32>, shape: &[usize]) -> Self {
        assert_eq!(data.len(), shape.iter().product::<usize>(), "data length must match shape");
        Tensor { data: TensorData::I32(data), shape: shape.iter().copied().collect() }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match &self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::I8(_) => DType::I8,
            TensorData::I32(_) => DType::I32,
        }
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> Option<&[i8]> {
        match &self.data {
            TensorData::I8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Fails with `ShapeMismatch` unless this tensor has exactly `expected`
    /// dimensions; `layer` names the pipeline stage for diagnostics.
    pub fn expect_shape(&self, layer: &str, expected: &[usize]) -> Result<()> {
        if self.shape.as_slice() != expected {
            return Err(QuantError::ShapeMismatch {
                layer: layer.to_string(),
                expected: expected.to_vec(),
                actual: self.shape.to_vec(),
            });
        }
        Ok(())
    }

    /// Borrow one channel plane of a rank-3 f32 tensor in CHW layout.
    pub fn channel_plane(&self, c: usize) -> Option<&[f32]> {
        let data = self.as_f32()?;
        if self.shape.len() != 3 || c >= self.shape[0] {
            return None;
        }
        let plane = self.shape[1] * self.shape[2];
        Some(&data[c * plane..(c + 1) * plane])
    }
}
