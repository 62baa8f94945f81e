// Generator and discriminator: the two players of the adversarial game.
//
// The traits are the seams the composer and the trainer program against;
// the concrete models are the default convolutional architectures. Any of
// them can be replaced through `AaeComposerBuilder`.
//
// Losses are candle scalars. A generator's `draw` stays attached to its
// graph, so a loss computed by running the draw through the discriminator
// back-propagates into the generator; each model's `learn` then steps only
// its own parameters.

use crate::cae::{CaeHistory, ConvolutionalAutoEncoder};
use crate::error::{ComposerError, Result};
use crate::nn::{CnnOutputGraph, ConvolutionLayer, ModelOptimizer, OptParams};
use crate::sampler::NoiseSampler;
use candle_core::{Tensor, Var};

/// Draws fake samples and learns from losses computed on them.
pub trait GenerativeModel {
    /// Sample a batch of generated bars.
    fn draw(&mut self) -> Result<Tensor>;

    /// Back-propagate `loss` and update the generator's parameters.
    fn learn(&mut self, loss: &Tensor) -> Result<()>;

    /// Replace the source of the generator's input feature points.
    fn set_noise_sampler(&mut self, noise_sampler: Box<dyn NoiseSampler>);
}

/// A generator that is also an autoencoder and learns reconstruction.
pub trait AutoEncoderModel: GenerativeModel {
    /// One reconstruction update on observed data. Returns the error.
    fn update_reconstruction(&mut self, observed: &Tensor) -> Result<f64>;

    /// Epoch-based reconstruction pretraining.
    fn pretrain(&mut self, dataset: &Tensor) -> Result<CaeHistory>;
}

/// Judges whether samples come from the true distribution.
pub trait DiscriminativeModel {
    /// Logit of "true" for every sample in the batch, shape `[N]`. `train`
    /// selects batch statistics and dropout; evaluation passes use the
    /// running statistics, so a sample's score does not depend on its batch.
    fn inference(&mut self, observed: &Tensor, train: bool) -> Result<Tensor>;

    /// Back-propagate `loss` and update the discriminator's parameters.
    fn learn(&mut self, loss: &Tensor) -> Result<()>;

    /// Evaluation-mode posterior probability of "true" per sample.
    fn posterior(&mut self, observed: &Tensor) -> Result<Vec<f64>> {
        let logits = self.inference(observed, false)?;
        let p = candle_nn::ops::sigmoid(&logits.detach())?;
        Ok(p.to_vec1::<f32>()?.into_iter().map(f64::from).collect())
    }
}

/// The default generator: noise sampler -> convolutional autoencoder.
pub struct ConvolutionalAutoEncoderGenerator {
    cae: ConvolutionalAutoEncoder,
    noise_sampler: Box<dyn NoiseSampler>,
}

impl ConvolutionalAutoEncoderGenerator {
    pub fn new(cae: ConvolutionalAutoEncoder, noise_sampler: Box<dyn NoiseSampler>) -> Self {
        ConvolutionalAutoEncoderGenerator { cae, noise_sampler }
    }

    pub fn autoencoder(&self) -> &ConvolutionalAutoEncoder {
        &self.cae
    }
}

impl GenerativeModel for ConvolutionalAutoEncoderGenerator {
    fn draw(&mut self) -> Result<Tensor> {
        let noise = self.noise_sampler.generate()?;
        self.cae.forward(&noise, false)
    }

    fn learn(&mut self, loss: &Tensor) -> Result<()> {
        self.cae.backward_step(loss)
    }

    fn set_noise_sampler(&mut self, noise_sampler: Box<dyn NoiseSampler>) {
        self.noise_sampler = noise_sampler;
    }
}

impl AutoEncoderModel for ConvolutionalAutoEncoderGenerator {
    fn update_reconstruction(&mut self, observed: &Tensor) -> Result<f64> {
        self.cae.learn_step(observed)
    }

    fn pretrain(&mut self, dataset: &Tensor) -> Result<CaeHistory> {
        self.cae.learn(dataset)
    }
}

/// The default discriminator: conv stack -> dense logit head.
pub struct SeqCnnDiscriminator {
    layers: Vec<ConvolutionLayer>,
    output: CnnOutputGraph,
    optimizer: ModelOptimizer,
}

impl SeqCnnDiscriminator {
    /// Checks that the conv stack accepts `input_shape` and that its
    /// flattened output matches the output graph's `hidden_dim`.
    pub fn new(
        mut layers: Vec<ConvolutionLayer>,
        output: CnnOutputGraph,
        input_shape: [usize; 4],
        opt_params: OptParams,
        learning_rate: f64,
    ) -> Result<Self> {
        let flattened = Self::hidden_dim_for(&layers, input_shape)?;
        if flattened != output.hidden_dim {
            return Err(ComposerError::ShapeMismatch {
                context: "discriminator hidden_dim",
                expected: vec![flattened],
                actual: vec![output.hidden_dim],
            });
        }
        for layer in &mut layers {
            layer.set_dropout_rate(opt_params.dropout_rate);
        }
        let mut vars: Vec<Var> = layers.iter().flat_map(|l| l.vars()).collect();
        vars.extend(output.vars());
        let optimizer = opt_params.build(vars, learning_rate)?;
        Ok(SeqCnnDiscriminator {
            layers,
            output,
            optimizer,
        })
    }

    /// Flattened conv output size for `input_shape`, i.e. the `hidden_dim`
    /// the output graph must be built with.
    pub fn hidden_dim_for(layers: &[ConvolutionLayer], input_shape: [usize; 4]) -> Result<usize> {
        let mut shape = input_shape;
        for layer in layers {
            shape = layer.output_shape(shape)?;
        }
        Ok(shape[1] * shape[2] * shape[3])
    }

    pub fn vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self.layers.iter().flat_map(|l| l.vars()).collect();
        vars.extend(self.output.vars());
        vars
    }
}

impl DiscriminativeModel for SeqCnnDiscriminator {
    fn inference(&mut self, observed: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = observed.clone();
        for layer in &self.layers {
            h = layer.forward_t(&h, train)?;
        }
        self.output.forward(&h)
    }

    fn learn(&mut self, loss: &Tensor) -> Result<()> {
        self.optimizer.backward_step(loss)
    }
}
