use super::{check_shapes, hyper_f32, state_or_zeros, Hyperparameters, Optimizer, OptimizerRecord, ScalarValue};
use crate::error::Result;
use crate::tensor::Tensor;
use rayon::prelude::*;

/// AdamW optimizer.
///
/// Implements Adam algorithm with Weight Decay fix as described in [Decoupled Weight Decay Regularization](https://arxiv.org/abs/1711.05101).
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^t) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^t) \\
/// & \theta_t = \theta_{t-1} - \eta (\hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) + \lambda \theta_{t-1})
/// \end{aligned}
/// $$
///
/// Hyperparameter keys: `lr`, `beta1`, `beta2`, `eps`, `weight_decay`.
/// Record keys: `exp_avg` ($m$), `exp_avg_sq` ($v$).
#[derive(Debug, Clone)]
pub struct AdamW {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl AdamW {
    /// Creates a new AdamW optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The learning rate ($\eta$).
    ///
    /// Defaults: `beta1` 0.9, `beta2` 0.999, `eps` 1e-8, `weight_decay` 0.01.
    /// Group hyperparameters override these per group.
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
        }
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for AdamW {
    fn default_hyperparameters(&self) -> Hyperparameters {
        [
            ("lr", self.learning_rate),
            ("beta1", self.beta1),
            ("beta2", self.beta2),
            ("eps", self.epsilon),
            ("weight_decay", self.weight_decay),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ScalarValue::Float(v)))
        .collect()
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
        let b1 = hyper_f32(hyper, "beta1")?;
        let b2 = hyper_f32(hyper, "beta2")?;
        let eps = hyper_f32(hyper, "eps")?;
        let lambda = hyper_f32(hyper, "weight_decay")?;

        let mut m = state_or_zeros(record, "exp_avg", param.shape())?;
        let mut v = state_or_zeros(record, "exp_avg_sq", param.shape())?;
        let step = record.map_or(0, |r| r.step) + 1;

        // Bias correction terms
        let bias_correction1 = (1.0 - f64::from(b1).powi(step as i32)) as f32;
        let bias_correction2 = (1.0 - f64::from(b2).powi(step as i32)) as f32;

        // Parallel update
        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .zip(m.data_mut().par_iter_mut())
            .zip(v.data_mut().par_iter_mut())
            .for_each(|(((p, g), m_elem), v_elem)| {
                *m_elem = b1 * *m_elem + (1.0 - b1) * *g;
                *v_elem = b2 * *v_elem + (1.0 - b2) * *g * *g;

                let m_hat = *m_elem / bias_correction1;
                let v_hat = *v_elem / bias_correction2;

                // p = p - lr * (m_hat / (sqrt(v_hat) + eps) + lambda * p)
                *p -= lr * (m_hat / (v_hat.sqrt() + eps) + lambda * *p);
            });

        Ok(OptimizerRecord::new(step)
            .with_tensor("exp_avg", m)
            .with_tensor("exp_avg_sq", v))
    }
}
