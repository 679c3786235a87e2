//! Tensors carried through the coordinator.
//!
//! The coordinator never does model math, it only moves, sums, scales and compares
//! parameter-shaped buffers. A [`Tensor`] is therefore a flat `f32` vector plus a
//! dynamic shape: gradients, master weights and optimizer moments all use it.
//!
//! Low-precision training weights live in [`TrainingTensor`], which stores its
//! elements in the [`Precision`] the model trains in (`f16`, `bf16` or `f32`).
//!
//! ```rust
//! use shardstate::tensor::Tensor;
//!
//! let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
//! assert_eq!(t.shape(), &[2, 3]);
//! assert_eq!(t.numel(), 6);
//! ```

use crate::error::{Result, ShardError};
use serde::{Deserialize, Serialize};

pub mod precision;

pub use precision::{Precision, TrainingTensor};

/// A dense, row-major `f32` tensor with a runtime shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor from flat data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `ShardError::ShapeMismatch` if `data.len()` is not the product of `shape`.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(ShardError::ShapeMismatch {
                context: "tensor data".to_string(),
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    /// Creates a tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Creates a tensor filled with `value`.
    pub fn full(shape: &[usize], value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![value; size],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consumes the tensor and returns its flat data.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Element-wise `self += other`.
    ///
    /// # Errors
    ///
    /// Returns `ShardError::ShapeMismatch` if the shapes differ.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        self.check_same_shape(other, "add_assign")?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += *b;
        }
        Ok(())
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    /// Resets every element to zero, keeping the shape.
    pub fn fill_zero(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Sum of squared elements, accumulated in `f64`.
    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|&v| (v as f64) * (v as f64)).sum()
    }

    /// Returns `true` if any element is NaN or infinite.
    pub fn has_non_finite(&self) -> bool {
        self.data.iter().any(|v| !v.is_finite())
    }

    /// Largest absolute element-wise difference, or `None` if shapes differ.
    pub fn max_abs_diff(&self, other: &Tensor) -> Option<f32> {
        if self.shape != other.shape {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max),
        )
    }

    /// Shape equality plus element-wise `|a - b| <= tolerance`.
    pub fn approx_eq(&self, other: &Tensor, tolerance: f32) -> bool {
        matches!(self.max_abs_diff(other), Some(d) if d <= tolerance)
    }

    fn check_same_shape(&self, other: &Tensor, context: &str) -> Result<()> {
        if self.shape != other.shape {
            return Err(ShardError::ShapeMismatch {
                context: context.to_string(),
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_bad_shape() {
        let result = Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]);
        assert!(matches!(result, Err(ShardError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_add_assign_and_scale() {
        let mut a = Tensor::new(vec![1.0, 3.0], vec![2]).unwrap();
        let b = Tensor::new(vec![1.0, 5.0], vec![2]).unwrap();
        a.add_assign(&b).unwrap();
        a.scale(0.5);
        assert_eq!(a.data(), &[1.0, 4.0]);
    }

    #[test]
    fn test_add_assign_shape_mismatch() {
        let mut a = Tensor::zeros(&[2, 3]);
        let b = Tensor::zeros(&[3, 2]);
        assert!(a.add_assign(&b).is_err());
    }

    #[test]
    fn test_approx_eq() {
        let a = Tensor::new(vec![0.1, 0.2], vec![2]).unwrap();
        let b = Tensor::new(vec![0.1004, 0.1996], vec![2]).unwrap();
        assert!(a.approx_eq(&b, 1e-3));
        assert!(!a.approx_eq(&b, 1e-4));
        assert!(!a.approx_eq(&Tensor::zeros(&[1, 2]), 1.0));
    }

    #[test]
    fn test_zero_sized_tensor() {
        let t = Tensor::zeros(&[0, 4]);
        assert_eq!(t.numel(), 0);
        assert_eq!(t.sum_squares(), 0.0);
    }
}
