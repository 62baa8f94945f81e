use crate::error::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Elementwise activation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Tanh,
    Logistic,
    Identity,
}

impl Activation {
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Activation::Tanh => x.tanh()?,
            Activation::Logistic => candle_nn::ops::sigmoid(x)?,
            Activation::Identity => x.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_activation_ranges() {
        let x = Tensor::new(&[-50.0f32, -0.5, 0.0, 0.5, 50.0], &Device::Cpu).unwrap();
        let logistic = Activation::Logistic.apply(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!((logistic[2] - 0.5).abs() < 1e-6);
        assert!(logistic.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(logistic.windows(2).all(|w| w[0] <= w[1]));

        let tanh = Activation::Tanh.apply(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!(tanh.iter().all(|v| v.abs() <= 1.0));
        assert_eq!(tanh[2], 0.0);

        let same = Activation::Identity.apply(&x).unwrap();
        assert_eq!(same.to_vec1::<f32>().unwrap(), x.to_vec1::<f32>().unwrap());
    }
}
