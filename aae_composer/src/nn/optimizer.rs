// Optimizer selection for one model.
//
// `OptParams` is plain configuration and can be shared by value; `build`
// turns it into a candle optimizer over a model's own variables, so the
// generator and the discriminator step independently even when a loss runs
// through both.

use crate::error::Result;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptMethod {
    Sgd,
    Adam { beta1: f64, beta2: f64, epsilon: f64 },
}

/// Optimizer settings for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptParams {
    pub method: OptMethod,
    /// Probability of dropping a unit in training forward passes.
    pub dropout_rate: f64,
}

impl OptParams {
    pub fn adam() -> Self {
        OptParams {
            method: OptMethod::Adam {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            },
            dropout_rate: 0.0,
        }
    }

    pub fn sgd() -> Self {
        OptParams {
            method: OptMethod::Sgd,
            dropout_rate: 0.0,
        }
    }

    pub fn with_dropout(mut self, dropout_rate: f64) -> Self {
        self.dropout_rate = dropout_rate;
        self
    }

    pub fn build(&self, vars: Vec<Var>, learning_rate: f64) -> Result<ModelOptimizer> {
        Ok(match self.method {
            OptMethod::Sgd => ModelOptimizer::Sgd(SGD::new(vars, learning_rate)?),
            OptMethod::Adam {
                beta1,
                beta2,
                epsilon,
            } => ModelOptimizer::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: learning_rate,
                    beta1,
                    beta2,
                    eps: epsilon,
                    weight_decay: 0.0,
                },
            )?),
        })
    }
}

impl Default for OptParams {
    fn default() -> Self {
        OptParams::adam()
    }
}

/// A built optimizer. Only the variables it was built over are updated.
pub enum ModelOptimizer {
    Sgd(SGD),
    Adam(AdamW),
}

impl ModelOptimizer {
    /// Back-propagate `loss` and apply one update.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            ModelOptimizer::Sgd(opt) => opt.backward_step(loss)?,
            ModelOptimizer::Adam(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            ModelOptimizer::Sgd(opt) => opt.learning_rate(),
            ModelOptimizer::Adam(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        match self {
            ModelOptimizer::Sgd(opt) => opt.set_learning_rate(learning_rate),
            ModelOptimizer::Adam(opt) => opt.set_learning_rate(learning_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn minimise(params: OptParams, learning_rate: f64) -> f32 {
        let x = Var::new(&[3.0f32, -2.0], &Device::Cpu).unwrap();
        let mut opt = params.build(vec![x.clone()], learning_rate).unwrap();
        for _ in 0..200 {
            let loss = x.as_tensor().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        x.as_tensor().sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_both_methods_minimise_a_quadratic() {
        assert!(minimise(OptParams::sgd(), 0.1) < 1e-6);
        assert!(minimise(OptParams::adam(), 0.1) < 0.05);
    }

    #[test]
    fn test_only_owned_vars_move() {
        let own = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let other = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut opt = OptParams::sgd().build(vec![own.clone()], 0.5).unwrap();
        let loss = (own.as_tensor() * other.as_tensor()).unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        assert_eq!(own.to_vec1::<f32>().unwrap(), vec![0.5]);
        assert_eq!(other.to_vec1::<f32>().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_learning_rate_can_be_attenuated() {
        let x = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut opt = OptParams::adam().build(vec![x], 0.01).unwrap();
        assert_eq!(opt.learning_rate(), 0.01);
        opt.set_learning_rate(0.001);
        assert_eq!(opt.learning_rate(), 0.001);
    }
}
