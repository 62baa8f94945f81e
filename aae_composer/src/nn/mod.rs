// Building blocks of the generator's autoencoder and the discriminator.
//
// - activation.rs: tanh / logistic / identity on candle tensors
// - conv.rs: candle conv2d layer with a tied-weight transposed pass and
//   optional batch normalisation
// - output.rs: dense head turning flattened conv features into logits
// - optimizer.rs: Adam / SGD over a model's variables
//
// Parameters are candle `Var`s drawn from a `ComposerRng`, so one seed fixes
// every initial weight. Gradients come from candle's autograd; each model
// owns the optimizer over its own variables.

pub mod activation;
pub mod conv;
pub mod optimizer;
pub mod output;

pub use activation::Activation;
pub use conv::{CnnGraph, ConvolutionLayer};
pub use optimizer::{ModelOptimizer, OptMethod, OptParams};
pub use output::CnnOutputGraph;

use crate::error::Result;
use candle_core::{DType, Device, Var};
use composer_prng::ComposerRng;

/// A variable of `shape` with N(0, scale^2) entries.
pub fn gaussian_var(shape: &[usize], scale: f64, rng: &mut ComposerRng) -> Result<Var> {
    let len = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.gaussian(0.0, scale) as f32).collect();
    Ok(Var::from_vec(data, shape, &Device::Cpu)?)
}

pub fn zeros_var(len: usize) -> Result<Var> {
    Ok(Var::zeros(len, DType::F32, &Device::Cpu)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_var_is_seeded() {
        let a = gaussian_var(&[2, 3], 0.5, &mut ComposerRng::new(4)).unwrap();
        let b = gaussian_var(&[2, 3], 0.5, &mut ComposerRng::new(4)).unwrap();
        assert_eq!(a.dims(), &[2, 3]);
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        let zero = zeros_var(4).unwrap();
        assert_eq!(zero.to_vec1::<f32>().unwrap(), vec![0.0; 4]);
    }
}
