// The composer: wires MIDI extraction, samplers, models and the adversarial
// trainer together, and turns the generator's output back into MIDI.
//
// `AaeComposer::new` assembles the default collaborators from a
// `ComposerConfig`; `AaeComposer::builder` lets callers swap in their own
// samplers, models or value function. Every random stream is forked from the
// config seed in a fixed order, so a given seed and input reproduce the same
// composition.

use crate::cae::{CaeHistory, CaeSchedule, ConvolutionalAutoEncoder};
use crate::config::ComposerConfig;
use crate::error::{ComposerError, Result};
use crate::gan::{AdversarialAutoEncoders, GansValueFunction, MiniMax, TrainingLogs};
use crate::midi::{self, NoteEvent, NoteTable};
use crate::model::{
    AutoEncoderModel, ConvolutionalAutoEncoderGenerator, DiscriminativeModel, SeqCnnDiscriminator,
};
use crate::nn::{Activation, CnnGraph, CnnOutputGraph, ConvolutionLayer, OptParams};
use crate::roll::RollLayout;
use crate::sampler::{
    BarCorpus, BarNoiseSampler, BarTrueSampler, NoiseSampler, TrueSampler, program_union,
};
use candle_core::Tensor;
use composer_prng::ComposerRng;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Generated cells at or above this activation become notes.
pub const NOTE_THRESHOLD: f64 = 0.5;

/// Velocity used when no input note carries one.
const FALLBACK_VELOCITY: f64 = 64.0;

/// Tolerance for treating two notes as back to back.
const CONTIGUITY_EPSILON: f64 = 1e-9;

pub struct AaeComposer {
    config: ComposerConfig,
    program_list: Vec<u8>,
    velocity_mean: f64,
    velocity_std: f64,
    true_sampler: Box<dyn TrueSampler>,
    generative_model: Box<dyn AutoEncoderModel>,
    discriminative_model: Box<dyn DiscriminativeModel>,
    trainer: AdversarialAutoEncoders,
    rng: ComposerRng,
}

/// Collects inputs and optional collaborators for an `AaeComposer`.
pub struct AaeComposerBuilder {
    config: ComposerConfig,
    paths: Vec<PathBuf>,
    tables: Vec<NoteTable>,
    true_sampler: Option<Box<dyn TrueSampler>>,
    noise_sampler: Option<Box<dyn NoiseSampler>>,
    generative_model: Option<Box<dyn AutoEncoderModel>>,
    discriminative_model: Option<Box<dyn DiscriminativeModel>>,
    value_function: Option<Box<dyn GansValueFunction>>,
}

impl AaeComposerBuilder {
    pub fn midi_paths<P: AsRef<Path>>(mut self, paths: &[P]) -> Self {
        self.paths
            .extend(paths.iter().map(|p| p.as_ref().to_path_buf()));
        self
    }

    /// Use already extracted note tables alongside (or instead of) files.
    pub fn note_tables(mut self, tables: Vec<NoteTable>) -> Self {
        self.tables.extend(tables);
        self
    }

    pub fn true_sampler(mut self, sampler: Box<dyn TrueSampler>) -> Self {
        self.true_sampler = Some(sampler);
        self
    }

    pub fn noise_sampler(mut self, sampler: Box<dyn NoiseSampler>) -> Self {
        self.noise_sampler = Some(sampler);
        self
    }

    pub fn generative_model(mut self, model: Box<dyn AutoEncoderModel>) -> Self {
        self.generative_model = Some(model);
        self
    }

    pub fn discriminative_model(mut self, model: Box<dyn DiscriminativeModel>) -> Self {
        self.discriminative_model = Some(model);
        self
    }

    pub fn value_function(mut self, value_function: Box<dyn GansValueFunction>) -> Self {
        self.value_function = Some(value_function);
        self
    }

    pub fn build(self) -> Result<AaeComposer> {
        let config = self.config;
        config.validate()?;

        let mut tables: Vec<NoteTable> = self
            .paths
            .par_iter()
            .map(|path| midi::extract(path))
            .collect::<Result<Vec<_>>>()?;
        tables.extend(self.tables);
        if tables.is_empty() {
            return Err(ComposerError::EmptyDataset("no MIDI input"));
        }
        info!(files = tables.len(), "extracted MIDI input");

        let program_list = program_union(&tables);
        if program_list.is_empty() {
            return Err(ComposerError::NoNotes {
                min_pitch: config.min_pitch,
                max_pitch: config.max_pitch,
            });
        }
        let channel = program_list.len();
        let (velocity_mean, velocity_std) = velocity_defaults(&tables);

        let mut root = ComposerRng::new(config.seed);
        let true_rng = root.fork();
        let noise_rng = root.fork();
        let mut generator_rng = root.fork();
        let mut discriminator_rng = root.fork();
        let compose_rng = root.fork();

        let layout = RollLayout {
            time_fraction: config.time_fraction,
            min_pitch: config.min_pitch,
            max_pitch: config.max_pitch,
            seq_len: config.seq_len,
        };
        let mut corpus_cache = None;

        let true_sampler: Box<dyn TrueSampler> = match self.true_sampler {
            Some(sampler) => sampler,
            None => Box::new(BarTrueSampler::new(
                corpus(&mut corpus_cache, &tables, &config, layout)?,
                true_rng,
            )),
        };
        let noise_sampler: Box<dyn NoiseSampler> = match self.noise_sampler {
            Some(sampler) => sampler,
            None => Box::new(BarNoiseSampler::new(
                corpus(&mut corpus_cache, &tables, &config, layout)?,
                noise_rng,
            )),
        };

        let generative_model: Box<dyn AutoEncoderModel> = match self.generative_model {
            Some(mut model) => {
                model.set_noise_sampler(noise_sampler);
                model
            }
            None => Box::new(default_generator(
                &config,
                channel,
                noise_sampler,
                &mut generator_rng,
            )?),
        };
        let discriminative_model: Box<dyn DiscriminativeModel> = match self.discriminative_model {
            Some(model) => model,
            None => Box::new(default_discriminator(
                &config,
                channel,
                &mut discriminator_rng,
            )?),
        };
        let value_function: Box<dyn GansValueFunction> = match self.value_function {
            Some(value_function) => value_function,
            None => Box::new(MiniMax::new()),
        };

        info!(
            programs = ?program_list,
            batch = config.batch_size,
            seq_len = config.seq_len,
            dim = config.dim(),
            "composer ready"
        );

        Ok(AaeComposer {
            config,
            program_list,
            velocity_mean,
            velocity_std,
            true_sampler,
            generative_model,
            discriminative_model,
            trainer: AdversarialAutoEncoders::new(value_function),
            rng: compose_rng,
        })
    }
}

fn corpus(
    cache: &mut Option<Arc<BarCorpus>>,
    tables: &[NoteTable],
    config: &ComposerConfig,
    layout: RollLayout,
) -> Result<Arc<BarCorpus>> {
    if let Some(corpus) = cache {
        return Ok(Arc::clone(corpus));
    }
    let corpus = Arc::new(BarCorpus::new(tables, config.batch_size, layout)?);
    *cache = Some(Arc::clone(&corpus));
    Ok(corpus)
}

/// Velocity defaults over files that have notes: the mean of the per-file
/// means, and the spread (population std) of the per-file sample stds.
fn velocity_defaults(tables: &[NoteTable]) -> (f64, f64) {
    let means: Vec<f64> = tables.iter().filter_map(|t| t.velocity_mean()).collect();
    if means.is_empty() {
        return (FALLBACK_VELOCITY, 0.0);
    }
    let stds: Vec<f64> = tables
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| t.velocity_std())
        .collect();
    (mean(&means), population_std(&stds))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Two tanh conv layers with `batch_size` filters each, decoded by their
/// transposes.
fn default_generator(
    config: &ComposerConfig,
    channel: usize,
    noise_sampler: Box<dyn NoiseSampler>,
    rng: &mut ComposerRng,
) -> Result<ConvolutionalAutoEncoderGenerator> {
    let ae = &config.autoencoder;
    let filters = config.batch_size;
    let layer = |input_channel: usize, rng: &mut ComposerRng| {
        let graph = CnnGraph::new(
            Activation::Tanh,
            filters,
            input_channel,
            ae.kernel_size,
            ae.scale,
            ae.stride,
            ae.pad,
        );
        ConvolutionLayer::new(graph, rng)
    };
    let layers = vec![layer(channel, rng)?, layer(filters, rng)?];
    let schedule = CaeSchedule {
        epochs: ae.epochs,
        batch_size: config.batch_size,
        learning_rate: config.learning_rate,
        learning_attenuate_rate: ae.learning_attenuate_rate,
        attenuate_epoch: ae.attenuate_epoch,
        test_size_rate: ae.test_size_rate,
        tol: ae.tol,
    };
    let opt_params = OptParams::adam().with_dropout(ae.dropout_rate);
    let cae = ConvolutionalAutoEncoder::new(layers, opt_params, schedule, rng.fork())?;
    Ok(ConvolutionalAutoEncoderGenerator::new(cae, noise_sampler))
}

/// One tanh conv layer (batch-normalised unless disabled) feeding a logistic
/// output graph.
fn default_discriminator(
    config: &ComposerConfig,
    channel: usize,
    rng: &mut ComposerRng,
) -> Result<SeqCnnDiscriminator> {
    let ae = &config.autoencoder;
    let d = &config.discriminator;
    let mut graph = CnnGraph::new(
        Activation::Tanh,
        config.batch_size,
        channel,
        ae.kernel_size,
        d.scale,
        ae.stride,
        ae.pad,
    );
    if d.batch_norm {
        graph = graph.with_batch_norm();
    }
    let layers = vec![ConvolutionLayer::new(graph, rng)?];
    let input_shape = [config.batch_size, channel, config.seq_len, config.dim()];
    let hidden_dim = match config.hidden_dim {
        Some(hidden_dim) => hidden_dim,
        None => SeqCnnDiscriminator::hidden_dim_for(&layers, input_shape)?,
    };
    let output = CnnOutputGraph::new(hidden_dim, d.output_scale, rng)?;
    SeqCnnDiscriminator::new(
        layers,
        output,
        input_shape,
        OptParams::adam().with_dropout(d.dropout_rate),
        config.learning_rate,
    )
}

/// Merge notes of the same program and pitch where one starts as the
/// previous one ends.
fn merge_contiguous(mut notes: Vec<NoteEvent>) -> Vec<NoteEvent> {
    notes.sort_by(|a, b| {
        a.program
            .cmp(&b.program)
            .then(a.pitch.cmp(&b.pitch))
            .then(a.start.total_cmp(&b.start))
    });
    let mut merged: Vec<NoteEvent> = Vec::with_capacity(notes.len());
    for note in notes {
        match merged.last_mut() {
            Some(last)
                if last.program == note.program
                    && last.pitch == note.pitch
                    && note.start <= last.end + CONTIGUITY_EPSILON =>
            {
                last.end = last.end.max(note.end);
            }
            _ => merged.push(note),
        }
    }
    merged
}

impl AaeComposer {
    /// Extract `paths` and assemble the default collaborators.
    pub fn new<P: AsRef<Path>>(paths: &[P], config: ComposerConfig) -> Result<Self> {
        Self::builder(config).midi_paths(paths).build()
    }

    pub fn builder(config: ComposerConfig) -> AaeComposerBuilder {
        AaeComposerBuilder {
            config,
            paths: Vec::new(),
            tables: Vec::new(),
            true_sampler: None,
            noise_sampler: None,
            generative_model: None,
            discriminative_model: None,
            value_function: None,
        }
    }

    /// Reconstruction pretraining of the generator on
    /// `autoencoder.pretrain_batches` sampled batches.
    pub fn pretrain(&mut self) -> Result<CaeHistory> {
        let batches = self.config.autoencoder.pretrain_batches.max(1);
        let parts = (0..batches)
            .map(|_| self.true_sampler.draw())
            .collect::<Result<Vec<Tensor>>>()?;
        let dataset = Tensor::cat(&parts, 0)?;
        info!(samples = dataset.dim(0)?, "pretraining autoencoder");
        let history = self.generative_model.pretrain(&dataset)?;
        if let Some(last) = history.train.last() {
            info!(epochs = history.train.len(), train_error = last, "pretraining done");
        }
        Ok(history)
    }

    /// Adversarial training. Logs accumulate across calls.
    pub fn learn(&mut self, iter_n: usize, k_step: usize) -> Result<()> {
        self.trainer.train(
            self.true_sampler.as_mut(),
            self.generative_model.as_mut(),
            self.discriminative_model.as_mut(),
            iter_n,
            k_step,
        )
    }

    pub fn extract_logs(&self) -> &TrainingLogs {
        self.trainer.extract_logs()
    }

    /// Draw one batch from the generator, binarise it and write it to `path`.
    /// Velocities default to the corpus statistics.
    pub fn compose(
        &mut self,
        path: &Path,
        velocity_mean: Option<f64>,
        velocity_std: Option<f64>,
    ) -> Result<NoteTable> {
        let generated = self.generative_model.draw()?.detach();
        let (batch, channels, steps, dim) = generated.dims4()?;
        if channels != self.program_list.len() || dim != self.config.dim() {
            return Err(ComposerError::ShapeMismatch {
                context: "generated composition",
                expected: vec![batch, self.program_list.len(), steps, self.config.dim()],
                actual: generated.dims().to_vec(),
            });
        }
        let posterior = self.discriminative_model.posterior(&generated)?;
        info!(
            posterior = posterior.iter().sum::<f64>() / posterior.len().max(1) as f64,
            "discriminator score of the composed bars"
        );
        let cells = generated.flatten_all()?.to_vec1::<f32>()?;
        let mean = velocity_mean.unwrap_or(self.velocity_mean);
        let std = velocity_std.unwrap_or(self.velocity_std).max(0.0);
        let tf = self.config.time_fraction;

        let mut notes = Vec::new();
        let mut active: Vec<(usize, f64)> = Vec::with_capacity(dim);
        for n in 0..batch {
            for (c, &program) in self.program_list.iter().enumerate() {
                for y in 0..steps {
                    let start = (n * steps + y) as f64 * tf;
                    active.clear();
                    let row = ((n * channels + c) * steps + y) * dim;
                    active.extend(
                        cells[row..row + dim]
                            .iter()
                            .map(|&v| f64::from(v))
                            .enumerate()
                            .filter(|&(_, v)| v >= NOTE_THRESHOLD),
                    );
                    active.sort_by(|a, b| b.1.total_cmp(&a.1));
                    for &(x, _) in &active {
                        let velocity = self.rng.gaussian(mean, std).round().clamp(1.0, 127.0);
                        notes.push(NoteEvent {
                            program,
                            start,
                            end: start + tf,
                            pitch: self.config.min_pitch + x as u8,
                            velocity: velocity as u8,
                            is_drum: false,
                        });
                    }
                }
            }
        }

        let onsets = notes.len();
        let mut table = NoteTable::new(merge_contiguous(notes));
        table.sort();
        if table.is_empty() {
            warn!(threshold = NOTE_THRESHOLD, "no generated cell reached the note threshold");
        }
        midi::save(path, &table)?;
        info!(
            path = %path.display(),
            cells = onsets,
            notes = table.len(),
            duration = table.duration(),
            "composition written"
        );
        Ok(table)
    }

    pub fn generative_model(&self) -> &dyn AutoEncoderModel {
        self.generative_model.as_ref()
    }

    pub fn discriminative_model(&self) -> &dyn DiscriminativeModel {
        self.discriminative_model.as_ref()
    }

    pub fn true_sampler(&self) -> &dyn TrueSampler {
        self.true_sampler.as_ref()
    }

    pub fn program_list(&self) -> &[u8] {
        &self.program_list
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }
}
