// Dense output graph: flattened conv features -> one logit per sample.
//
// The posterior is the logistic of the logit. The head hands out logits so
// the value function can use candle's numerically stable logit losses.

use super::{gaussian_var, zeros_var};
use crate::error::{ComposerError, Result};
use candle_core::{Module, Tensor, Var};
use candle_nn::Linear;
use composer_prng::ComposerRng;

#[derive(Debug)]
pub struct CnnOutputGraph {
    pub hidden_dim: usize,
    linear: Linear,
    /// `[1, hidden_dim]`.
    weight: Var,
    bias: Var,
}

impl CnnOutputGraph {
    pub fn new(hidden_dim: usize, scale: f64, rng: &mut ComposerRng) -> Result<Self> {
        let weight = gaussian_var(&[1, hidden_dim], scale, rng)?;
        let bias = zeros_var(1)?;
        let linear = Linear::new(weight.as_tensor().clone(), Some(bias.as_tensor().clone()));
        Ok(CnnOutputGraph {
            hidden_dim,
            linear,
            weight,
            bias,
        })
    }

    pub fn vars(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    /// `[N, ...]` features -> `[N]` logits.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let flat = features.flatten_from(1)?;
        let (batch, width) = flat.dims2()?;
        if width != self.hidden_dim {
            return Err(ComposerError::ShapeMismatch {
                context: "CnnOutputGraph hidden_dim",
                expected: vec![batch, self.hidden_dim],
                actual: vec![batch, width],
            });
        }
        Ok(self.linear.forward(&flat)?.squeeze(1)?)
    }
}
