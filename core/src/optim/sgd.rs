use super::{check_shapes, hyper_f32, state_or_zeros, Hyperparameters, Optimizer, OptimizerRecord, ScalarValue};
use crate::error::Result;
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Stochastic Gradient Descent (SGD) optimizer with optional momentum.
///
/// Updates parameters using the rule:
/// `buf = momentum * buf + grad; param = param - learning_rate * buf`
///
/// With `momentum == 0` this is plain SGD and the record carries no tensors.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn default_hyperparameters(&self) -> Hyperparameters {
        let mut hyper = Hyperparameters::new();
        hyper.insert("lr".into(), ScalarValue::Float(self.learning_rate));
        hyper.insert("momentum".into(), ScalarValue::Float(self.momentum));
        hyper
    }

    fn update(
        &self,
        hyper: &Hyperparameters,
        param: &mut Tensor,
        grad: &Tensor,
        record: Option<&OptimizerRecord>,
    ) -> Result<OptimizerRecord> {
        check_shapes(param, grad)?;

        let lr = hyper_f32(hyper, "lr")?;
        let momentum = hyper_f32(hyper, "momentum")?;
        let step = record.map_or(0, |r| r.step) + 1;

        if momentum == 0.0 {
            param
                .data_mut()
                .par_iter_mut()
                .zip(grad.data().par_iter())
                .for_each(|(p, g)| {
                    *p -= lr * *g;
                });
            return Ok(OptimizerRecord::new(step));
        }

        let mut buf = state_or_zeros(record, "momentum_buffer", param.shape())?;
        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .zip(buf.data_mut().par_iter_mut())
            .for_each(|((p, g), b)| {
                *b = momentum * *b + *g;
                *p -= lr * *b;
            });

        Ok(OptimizerRecord::new(step).with_tensor("momentum_buffer", buf))
    }
}
