// Convolutional autoencoder.
//
// The encoder is the conv stack; the decoder runs the same layers in reverse
// as transposed convolutions with tied weights, so the reconstruction has the
// input's shape by construction. Reconstruction is scored with candle's mean
// squared error against the binary piano roll.
//
// Two training entry points:
// - `learn_step`: one mini-batch update, used inside the adversarial loop.
// - `learn`: epoch-based pretraining with a held-out split, learning-rate
//   attenuation and tolerance-based early stopping.

use crate::error::{ComposerError, Result};
use crate::nn::{ConvolutionLayer, ModelOptimizer, OptParams};
use candle_core::{Device, Tensor, Var};
use composer_prng::ComposerRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Consecutive epochs without a `tol` improvement before `learn` stops.
const PATIENCE: usize = 2;

/// Epoch-loop settings for `ConvolutionalAutoEncoder::learn`.
#[derive(Debug, Clone, PartialEq)]
pub struct CaeSchedule {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub learning_attenuate_rate: f64,
    pub attenuate_epoch: usize,
    pub test_size_rate: f64,
    pub tol: f64,
}

/// Loss history of one `learn` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaeHistory {
    /// Mean training loss per epoch.
    pub train: Vec<f64>,
    /// Validation loss per epoch (empty when validation is disabled).
    pub test: Vec<f64>,
    /// Learning rate each epoch ran at.
    pub learning_rates: Vec<f64>,
}

pub struct ConvolutionalAutoEncoder {
    layers: Vec<ConvolutionLayer>,
    optimizer: ModelOptimizer,
    schedule: CaeSchedule,
    rng: ComposerRng,
}

fn scalar(loss: &Tensor) -> Result<f64> {
    Ok(f64::from(loss.to_scalar::<f32>()?))
}

/// Samples `indices` of `dataset` along the batch axis.
fn select(dataset: &Tensor, indices: &[usize]) -> Result<Tensor> {
    let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    let ids = Tensor::new(ids.as_slice(), &Device::Cpu)?;
    Ok(dataset.index_select(&ids, 0)?)
}

impl ConvolutionalAutoEncoder {
    pub fn new(
        mut layers: Vec<ConvolutionLayer>,
        opt_params: OptParams,
        schedule: CaeSchedule,
        rng: ComposerRng,
    ) -> Result<Self> {
        if layers.is_empty() {
            return Err(ComposerError::InvalidConfig(
                "autoencoder needs at least one convolution layer".into(),
            ));
        }
        for pair in layers.windows(2) {
            if pair[0].graph.filter_num != pair[1].graph.channel {
                return Err(ComposerError::ShapeMismatch {
                    context: "ConvolutionalAutoEncoder layer stack",
                    expected: vec![pair[0].graph.filter_num],
                    actual: vec![pair[1].graph.channel],
                });
            }
        }
        for layer in &mut layers {
            layer.set_dropout_rate(opt_params.dropout_rate);
        }
        let vars = layers.iter().flat_map(|l| l.vars()).collect();
        let optimizer = opt_params.build(vars, schedule.learning_rate)?;
        Ok(ConvolutionalAutoEncoder {
            layers,
            optimizer,
            schedule,
            rng,
        })
    }

    pub fn layers(&self) -> &[ConvolutionLayer] {
        &self.layers
    }

    pub fn schedule(&self) -> &CaeSchedule {
        &self.schedule
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Channels the autoencoder reads and reconstructs.
    pub fn channel(&self) -> usize {
        self.layers[0].graph.channel
    }

    pub fn vars(&self) -> Vec<Var> {
        self.layers.iter().flat_map(|l| l.vars()).collect()
    }

    /// Encode `x` into the feature map of the last conv layer, with the
    /// spatial size of every layer's input for the decoder.
    fn encode_with_sizes(&self, x: &Tensor, train: bool) -> Result<(Tensor, Vec<(usize, usize)>)> {
        let mut sizes = Vec::with_capacity(self.layers.len());
        let mut h = x.clone();
        for layer in &self.layers {
            let (_, _, rows, cols) = h.dims4()?;
            sizes.push((rows, cols));
            h = layer.forward_t(&h, train)?;
        }
        Ok((h, sizes))
    }

    pub fn encode(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.encode_with_sizes(x, train)?.0)
    }

    /// Encode then decode through the transposed layers.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (mut h, sizes) = self.encode_with_sizes(x, train)?;
        for (layer, &size) in self.layers.iter().zip(&sizes).rev() {
            h = layer.deconvolve(&h, size)?;
        }
        Ok(h)
    }

    /// Reconstruction without dropout, on running batch statistics.
    pub fn inference(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x, false)
    }

    /// Reconstruction loss of `x` without updating anything.
    pub fn reconstruction_error(&self, x: &Tensor) -> Result<f64> {
        let reconstructed = self.inference(x)?;
        scalar(&candle_nn::loss::mse(&reconstructed, x)?)
    }

    /// Back-propagate `loss` and step this autoencoder's parameters only.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        self.optimizer.backward_step(loss)
    }

    /// One reconstruction update on `batch`. Returns the pre-update loss.
    pub fn learn_step(&mut self, batch: &Tensor) -> Result<f64> {
        let reconstructed = self.forward(batch, true)?;
        let loss = candle_nn::loss::mse(&reconstructed, batch)?;
        let value = scalar(&loss)?;
        self.optimizer.backward_step(&loss)?;
        Ok(value)
    }

    /// Epoch-based training on `dataset` (samples along the batch axis).
    /// The learning rate is attenuated for this run only; it is back at
    /// `schedule.learning_rate` afterwards.
    pub fn learn(&mut self, dataset: &Tensor) -> Result<CaeHistory> {
        let (total, channels, rows, cols) = dataset.dims4()?;
        if total == 0 {
            return Err(ComposerError::EmptyDataset("autoencoder training set"));
        }
        if channels != self.channel() {
            return Err(ComposerError::ShapeMismatch {
                context: "ConvolutionalAutoEncoder::learn",
                expected: vec![total, self.channel(), rows, cols],
                actual: vec![total, channels, rows, cols],
            });
        }

        let mut order = self.rng.choose_distinct(total, total);
        let test_len = ((total as f64) * self.schedule.test_size_rate).floor() as usize;
        let test_len = test_len.min(total - 1);
        let test_idx = order.split_off(total - test_len);
        let train_idx = order;
        let test_set = if test_idx.is_empty() {
            None
        } else {
            Some(select(dataset, &test_idx)?)
        };

        let mut history = CaeHistory::default();
        let mut learning_rate = self.schedule.learning_rate;
        let mut best = f64::INFINITY;
        let mut misses = 0;
        let batch_size = self.schedule.batch_size.max(1);

        for epoch in 0..self.schedule.epochs {
            if epoch > 0
                && self.schedule.attenuate_epoch > 0
                && epoch % self.schedule.attenuate_epoch == 0
            {
                learning_rate *= self.schedule.learning_attenuate_rate;
                self.optimizer.set_learning_rate(learning_rate);
                debug!(epoch, learning_rate, "attenuated learning rate");
            }
            history.learning_rates.push(learning_rate);

            let mut shuffled = train_idx.clone();
            for i in (1..shuffled.len()).rev() {
                let j = self.rng.range_usize(0, i + 1);
                shuffled.swap(i, j);
            }
            let mut epoch_loss = 0.0;
            let mut batches = 0;
            for chunk in shuffled.chunks(batch_size) {
                let batch = select(dataset, chunk)?;
                epoch_loss += self.learn_step(&batch)?;
                batches += 1;
            }
            let train_loss = epoch_loss / batches.max(1) as f64;
            history.train.push(train_loss);

            let monitored = match &test_set {
                Some(test) => {
                    let test_loss = self.reconstruction_error(test)?;
                    history.test.push(test_loss);
                    test_loss
                }
                None => train_loss,
            };
            debug!(epoch, train_loss, monitored, "autoencoder epoch");

            if best - monitored < self.schedule.tol {
                misses += 1;
                if misses >= PATIENCE {
                    info!(epoch, loss = monitored, "autoencoder converged");
                    break;
                }
            } else {
                misses = 0;
            }
            best = best.min(monitored);
        }
        self.optimizer.set_learning_rate(self.schedule.learning_rate);
        Ok(history)
    }
}
