// Samplers: where the adversarial game gets its data.
//
// A `TrueSampler` draws observed bars from the MIDI corpus; a `NoiseSampler`
// feeds the generator. The bar samplers share one `BarCorpus` (the piano
// rolls of every input file plus the program list that fixes the channel
// order), so true and fake batches always agree on shape and channel meaning.

use crate::error::{ComposerError, Result};
use crate::midi::NoteTable;
use crate::roll::{PianoRoll, RollLayout};
use candle_core::{Device, Tensor};
use composer_prng::ComposerRng;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Draws samples from the true distribution of the corpus.
pub trait TrueSampler {
    fn draw(&mut self) -> Result<Tensor>;

    /// Shape of every tensor returned by `draw`.
    fn shape(&self) -> [usize; 4];
}

/// Draws the generator's input feature points.
pub trait NoiseSampler {
    fn generate(&mut self) -> Result<Tensor>;

    /// Shape of every tensor returned by `generate`.
    fn shape(&self) -> [usize; 4];
}

/// Sorted distinct non-drum programs across `tables`. Fixes the channel
/// order of every roll, sample and composition.
pub fn program_union(tables: &[NoteTable]) -> Vec<u8> {
    tables
        .iter()
        .flat_map(|t| t.programs())
        .collect::<BTreeSet<u8>>()
        .into_iter()
        .collect()
}

/// Piano rolls of the whole corpus, ready to be cut into bars.
#[derive(Debug)]
pub struct BarCorpus {
    rolls: Vec<PianoRoll>,
    program_list: Vec<u8>,
    layout: RollLayout,
    batch_size: usize,
}

impl BarCorpus {
    /// Build the rolls of every table. Fails when no note survives the pitch
    /// range and drum filtering.
    pub fn new(tables: &[NoteTable], batch_size: usize, layout: RollLayout) -> Result<Self> {
        let program_list = program_union(tables);

        let rolls: Vec<PianoRoll> = tables
            .par_iter()
            .map(|table| PianoRoll::from_notes(table, &program_list, &layout))
            .collect();

        let total = rolls.len();
        let rolls: Vec<PianoRoll> = rolls.into_iter().filter(|r| r.note_count() > 0).collect();
        if rolls.is_empty() {
            return Err(ComposerError::NoNotes {
                min_pitch: layout.min_pitch,
                max_pitch: layout.max_pitch,
            });
        }
        if rolls.len() < total {
            warn!(
                skipped = total - rolls.len(),
                "MIDI files without notes in range are ignored"
            );
        }
        info!(
            files = rolls.len(),
            programs = ?program_list,
            steps = rolls.iter().map(|r| r.steps()).sum::<usize>(),
            "built piano-roll corpus"
        );

        Ok(BarCorpus {
            rolls,
            program_list,
            layout,
            batch_size,
        })
    }

    pub fn program_list(&self) -> &[u8] {
        &self.program_list
    }

    pub fn channel(&self) -> usize {
        self.program_list.len()
    }

    pub fn layout(&self) -> &RollLayout {
        &self.layout
    }

    pub fn batch_shape(&self) -> [usize; 4] {
        [
            self.batch_size,
            self.channel(),
            self.layout.seq_len,
            self.layout.dim(),
        ]
    }

    /// Values in one bar: `channel * seq_len * dim`.
    pub fn sample_len(&self) -> usize {
        self.channel() * self.layout.seq_len * self.layout.dim()
    }

    /// A batch of bars, each from a uniformly chosen file and offset, as a
    /// row-major host buffer of `batch_shape`.
    pub fn sample_bars(&self, rng: &mut ComposerRng) -> Vec<f32> {
        let mut out = vec![0.0; self.batch_size * self.sample_len()];
        for sample in out.chunks_exact_mut(self.sample_len()) {
            let roll = &self.rolls[rng.range_usize(0, self.rolls.len())];
            let offset = rng.range_usize(0, roll.window_count(self.layout.seq_len));
            roll.write_window(offset, self.layout.seq_len, sample);
        }
        out
    }

    fn to_tensor(&self, bars: Vec<f32>) -> Result<Tensor> {
        Ok(Tensor::from_vec(bars, &self.batch_shape(), &Device::Cpu)?)
    }
}

/// Bars drawn straight from the corpus.
pub struct BarTrueSampler {
    corpus: Arc<BarCorpus>,
    rng: ComposerRng,
}

impl BarTrueSampler {
    pub fn new(corpus: Arc<BarCorpus>, rng: ComposerRng) -> Self {
        BarTrueSampler { corpus, rng }
    }
}

impl TrueSampler for BarTrueSampler {
    fn draw(&mut self) -> Result<Tensor> {
        let bars = self.corpus.sample_bars(&mut self.rng);
        self.corpus.to_tensor(bars)
    }

    fn shape(&self) -> [usize; 4] {
        self.corpus.batch_shape()
    }
}

/// Bar-shaped noise: a real bar's per-step note counts, with pitches
/// re-drawn uniformly at random.
pub struct BarNoiseSampler {
    corpus: Arc<BarCorpus>,
    rng: ComposerRng,
}

impl BarNoiseSampler {
    pub fn new(corpus: Arc<BarCorpus>, rng: ComposerRng) -> Self {
        BarNoiseSampler { corpus, rng }
    }

    pub fn program_list(&self) -> &[u8] {
        self.corpus.program_list()
    }

    pub fn channel(&self) -> usize {
        self.corpus.channel()
    }
}

impl NoiseSampler for BarNoiseSampler {
    fn generate(&mut self) -> Result<Tensor> {
        let mut bars = self.corpus.sample_bars(&mut self.rng);
        let dim = self.corpus.layout().dim();
        for row in bars.chunks_exact_mut(dim) {
            let count = row.iter().filter(|&&v| v > 0.0).count();
            row.fill(0.0);
            for pitch in self.rng.choose_distinct(dim, count) {
                row[pitch] = 1.0;
            }
        }
        self.corpus.to_tensor(bars)
    }

    fn shape(&self) -> [usize; 4] {
        self.corpus.batch_shape()
    }
}

/// Uniform noise in `[low, high)`.
pub struct UniformNoiseSampler {
    low: f64,
    high: f64,
    shape: [usize; 4],
    rng: ComposerRng,
}

impl UniformNoiseSampler {
    pub fn new(low: f64, high: f64, shape: [usize; 4], rng: ComposerRng) -> Result<Self> {
        if !(low < high) {
            return Err(ComposerError::InvalidConfig(format!(
                "uniform noise bounds must satisfy low < high, got [{low}, {high})"
            )));
        }
        Ok(UniformNoiseSampler {
            low,
            high,
            shape,
            rng,
        })
    }
}

impl NoiseSampler for UniformNoiseSampler {
    fn generate(&mut self) -> Result<Tensor> {
        let data: Vec<f32> = (0..self.shape.iter().product())
            .map(|_| self.rng.range_f64(self.low, self.high) as f32)
            .collect();
        Ok(Tensor::from_vec(data, &self.shape, &Device::Cpu)?)
    }

    fn shape(&self) -> [usize; 4] {
        self.shape
    }
}
