// Adversarial training of an autoencoder generator against a discriminator.
//
// Every iteration has three phases:
//   1. reconstruction: the generator learns to reproduce a true batch;
//   2. discriminator turn: `k_step` updates telling true bars from drawn ones;
//   3. generator turn: the generator's loss runs back through the
//      discriminator into the generator, and only the generator steps.
//
// The value function decides the losses of both players; `MiniMax` is the
// classic GAN game on binary cross entropy.

use candle_core::{DType, Device, Tensor};
use candle_nn::loss::binary_cross_entropy_with_logit;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ComposerError, Result};
use crate::model::{AutoEncoderModel, DiscriminativeModel};
use crate::sampler::TrueSampler;

pub trait GansValueFunction {
    /// Discriminator loss given logits on true and generated samples.
    fn discriminator_loss(&self, true_logits: &Tensor, fake_logits: &Tensor) -> Result<Tensor>;

    /// Generator loss given logits on generated samples.
    fn generator_loss(&self, fake_logits: &Tensor) -> Result<Tensor>;
}

/// min_G max_D E[log D(x)] + E[log(1 - D(G(z)))].
#[derive(Debug, Clone, Copy, Default)]
pub struct MiniMax;

impl MiniMax {
    pub fn new() -> Self {
        MiniMax
    }
}

fn constant(value: f32, len: usize) -> Result<Tensor> {
    Ok(Tensor::full(value, len, &Device::Cpu)?)
}

impl GansValueFunction for MiniMax {
    fn discriminator_loss(&self, true_logits: &Tensor, fake_logits: &Tensor) -> Result<Tensor> {
        let logits = Tensor::cat(&[true_logits, fake_logits], 0)?;
        let targets = Tensor::cat(
            &[
                &constant(1.0, true_logits.elem_count())?,
                &constant(0.0, fake_logits.elem_count())?,
            ],
            0,
        )?;
        Ok(binary_cross_entropy_with_logit(&logits, &targets)?)
    }

    /// The saturating form, `mean log(1 - D(G(z)))`: the negated cross
    /// entropy of the fake logits against "generated".
    fn generator_loss(&self, fake_logits: &Tensor) -> Result<Tensor> {
        let zeros = Tensor::zeros(fake_logits.elem_count(), DType::F32, &Device::Cpu)?;
        Ok(binary_cross_entropy_with_logit(fake_logits, &zeros)?.neg()?)
    }
}

/// Per-iteration history of one or more `train` calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingLogs {
    /// Generator reconstruction error on the true batch.
    pub reconstruction_errors: Vec<f64>,
    /// Mean posterior on generated data, averaged over the discriminator turn.
    pub discriminator_posteriors: Vec<f64>,
    /// Mean posterior on generated data in the generator turn.
    pub generator_posteriors: Vec<f64>,
}

impl TrainingLogs {
    pub fn len(&self) -> usize {
        self.reconstruction_errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reconstruction_errors.is_empty()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(f64::from(t.to_scalar::<f32>()?))
}

/// Mean logistic of `logits`, outside the graph.
fn mean_posterior(logits: &Tensor) -> Result<f64> {
    scalar(&candle_nn::ops::sigmoid(&logits.detach())?.mean_all()?)
}

pub struct AdversarialAutoEncoders {
    value_function: Box<dyn GansValueFunction>,
    logs: TrainingLogs,
}

impl AdversarialAutoEncoders {
    pub fn new(value_function: Box<dyn GansValueFunction>) -> Self {
        AdversarialAutoEncoders {
            value_function,
            logs: TrainingLogs::default(),
        }
    }

    pub fn value_function(&self) -> &dyn GansValueFunction {
        self.value_function.as_ref()
    }

    /// Run `iter_n` iterations, appending to the logs.
    pub fn train(
        &mut self,
        true_sampler: &mut dyn TrueSampler,
        generator: &mut dyn AutoEncoderModel,
        discriminator: &mut dyn DiscriminativeModel,
        iter_n: usize,
        k_step: usize,
    ) -> Result<()> {
        info!(iter_n, k_step, "adversarial training");
        let report_every = (iter_n / 10).max(1);

        for iteration in 0..iter_n {
            let observed = true_sampler.draw()?;
            let reconstruction = generator.update_reconstruction(&observed)?;

            let mut turn_posteriors = Vec::with_capacity(k_step);
            let mut d_loss = 0.0;
            for _ in 0..k_step {
                let observed = true_sampler.draw()?;
                // The generator sits this turn out.
                let generated = generator.draw()?.detach();
                let true_len = observed.dim(0)?;
                let fake_len = generated.dim(0)?;
                let logits =
                    discriminator.inference(&Tensor::cat(&[&observed, &generated], 0)?, true)?;
                if logits.dims() != [true_len + fake_len] {
                    return Err(ComposerError::ShapeMismatch {
                        context: "discriminator logits",
                        expected: vec![true_len + fake_len],
                        actual: logits.dims().to_vec(),
                    });
                }
                let true_logits = logits.narrow(0, 0, true_len)?;
                let fake_logits = logits.narrow(0, true_len, fake_len)?;
                let loss = self
                    .value_function
                    .discriminator_loss(&true_logits, &fake_logits)?;
                d_loss = scalar(&loss)?;
                turn_posteriors.push(mean_posterior(&fake_logits)?);
                discriminator.learn(&loss)?;
            }
            let discriminator_posterior = mean(&turn_posteriors);

            let generated = generator.draw()?;
            let fake_logits = discriminator.inference(&generated, true)?;
            let loss = self.value_function.generator_loss(&fake_logits)?;
            let g_loss = scalar(&loss)?;
            let generator_posterior = mean_posterior(&fake_logits)?;
            generator.learn(&loss)?;

            debug!(
                iteration,
                reconstruction,
                d_loss,
                g_loss,
                discriminator_posterior,
                generator_posterior,
                "aae iteration"
            );
            if (iteration + 1) % report_every == 0 {
                info!(
                    iteration = iteration + 1,
                    reconstruction, discriminator_posterior, generator_posterior, "progress"
                );
            }

            self.logs.reconstruction_errors.push(reconstruction);
            self.logs.discriminator_posteriors.push(discriminator_posterior);
            self.logs.generator_posteriors.push(generator_posterior);
        }
        Ok(())
    }

    pub fn extract_logs(&self) -> &TrainingLogs {
        &self.logs
    }
}
