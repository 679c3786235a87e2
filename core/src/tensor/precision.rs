//! Floating-point precisions and low-precision training storage.
//!
//! Under mixed precision the forward and backward passes read weights in a
//! 16-bit format while the optimizer updates a wider master copy. The 16-bit
//! formats come from the `half` crate.

use crate::error::{Result, ShardError};
use crate::tensor::Tensor;
use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage precision of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
    Bf16,
}

impl Precision {
    /// Width of one element in bits.
    pub const fn bits(&self) -> u32 {
        match self {
            Precision::F32 => 32,
            Precision::F16 | Precision::Bf16 => 16,
        }
    }

    /// Whether a master in `self` can hold every value of `training` without loss.
    ///
    /// A master must either be `f32` or match the training precision exactly;
    /// `f16` and `bf16` have different exponent ranges and cannot stand in for
    /// each other.
    pub fn can_hold(&self, training: Precision) -> bool {
        *self == Precision::F32 || *self == training
    }

    /// Rounds an `f32` to the nearest value representable in this precision.
    pub fn round(&self, value: f32) -> f32 {
        match self {
            Precision::F32 => value,
            Precision::F16 => f16::from_f32(value).to_f32(),
            Precision::Bf16 => bf16::from_f32(value).to_f32(),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::F32 => write!(f, "f32"),
            Precision::F16 => write!(f, "f16"),
            Precision::Bf16 => write!(f, "bf16"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TrainingStorage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
}

/// A training weight stored in its training precision.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingTensor {
    shape: Vec<usize>,
    storage: TrainingStorage,
}

impl TrainingTensor {
    /// Downcasts an `f32` tensor into `precision`.
    pub fn from_tensor(tensor: &Tensor, precision: Precision) -> Self {
        let data = tensor.data();
        let storage = match precision {
            Precision::F32 => TrainingStorage::F32(data.to_vec()),
            Precision::F16 => TrainingStorage::F16(data.iter().map(|&v| f16::from_f32(v)).collect()),
            Precision::Bf16 => {
                TrainingStorage::Bf16(data.iter().map(|&v| bf16::from_f32(v)).collect())
            }
        };
        Self {
            shape: tensor.shape().to_vec(),
            storage,
        }
    }

    pub fn precision(&self) -> Precision {
        match self.storage {
            TrainingStorage::F32(_) => Precision::F32,
            TrainingStorage::F16(_) => Precision::F16,
            TrainingStorage::Bf16(_) => Precision::Bf16,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Upcasts into an `f32` tensor. Exact for every precision.
    pub fn to_tensor(&self) -> Tensor {
        let data = match &self.storage {
            TrainingStorage::F32(v) => v.clone(),
            TrainingStorage::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            TrainingStorage::Bf16(v) => v.iter().map(|x| x.to_f32()).collect(),
        };
        // Storage length always matches the shape it was built with.
        Tensor {
            shape: self.shape.clone(),
            data,
        }
    }

    /// Overwrites the stored values with `source`, rounding into the training precision.
    ///
    /// # Errors
    ///
    /// Returns `ShardError::ShapeMismatch` if `source` has a different shape.
    pub fn assign(&mut self, source: &Tensor) -> Result<()> {
        if source.shape() != self.shape.as_slice() {
            return Err(ShardError::ShapeMismatch {
                context: "training weight".to_string(),
                expected: self.shape.clone(),
                got: source.shape().to_vec(),
            });
        }
        let src = source.data();
        match &mut self.storage {
            TrainingStorage::F32(v) => v.copy_from_slice(src),
            TrainingStorage::F16(v) => v
                .iter_mut()
                .zip(src)
                .for_each(|(d, &s)| *d = f16::from_f32(s)),
            TrainingStorage::Bf16(v) => v
                .iter_mut()
                .zip(src)
                .for_each(|(d, &s)| *d = bf16::from_f32(s)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_can_hold() {
        assert!(Precision::F32.can_hold(Precision::F16));
        assert!(Precision::F16.can_hold(Precision::F16));
        assert!(!Precision::F16.can_hold(Precision::Bf16));
        assert!(!Precision::Bf16.can_hold(Precision::F32));
    }

    #[test]
    fn test_f16_round_trip_is_lossy_but_close() {
        let t = Tensor::new(vec![0.1, 0.2, 0.3], vec![3]).unwrap();
        let low = TrainingTensor::from_tensor(&t, Precision::F16);
        assert_eq!(low.precision(), Precision::F16);
        let back = low.to_tensor();
        assert!(back.approx_eq(&t, 1e-3));
        assert_ne!(back.data()[0], 0.1);
        assert_eq!(back.data()[0], Precision::F16.round(0.1));
    }

    #[test]
    fn test_assign_rounds_into_precision() {
        let mut low = TrainingTensor::from_tensor(&Tensor::zeros(&[2]), Precision::Bf16);
        let src = Tensor::new(vec![1.0009765625, -2.5], vec![2]).unwrap();
        low.assign(&src).unwrap();
        let back = low.to_tensor();
        assert_eq!(back.data()[1], -2.5);
        assert_eq!(back.data()[0], Precision::Bf16.round(1.0009765625));
    }

    #[test]
    fn test_assign_shape_mismatch() {
        let mut low = TrainingTensor::from_tensor(&Tensor::zeros(&[2, 2]), Precision::F16);
        assert!(low.assign(&Tensor::zeros(&[4])).is_err());
    }
}
