// AAE Composer
//
// Learns the bar-level style of a set of MIDI files with adversarial
// autoencoders and composes new MIDI from the trained generator. The
// generator is a convolutional autoencoder fed with bar-shaped noise; a
// convolutional discriminator tells its output from real bars, and the
// generator alternates between reconstruction and fooling the discriminator.
//
// Architecture:
// - midi.rs: Standard MIDI File <-> note table (seconds, programs, velocities)
// - roll.rs: Note tables -> per-program binary piano rolls cut into bars
// - sampler.rs: True and noise samplers over the shared bar corpus
// - nn/: candle layers: conv with a tied transposed pass, batch norm,
//   dense logit head, activations and Adam/SGD selection
// - cae.rs: Convolutional autoencoder with epoch-based reconstruction training
// - model.rs: Generator and discriminator traits plus the default conv models
// - gan.rs: MiniMax value function and the three-phase adversarial trainer
// - composer.rs: Assembly of all collaborators, training and composition
// - dissonance.rs: Interval-based harmonic scoring of compositions
// - config.rs: TOML configuration with defaults for every hyperparameter
// - error.rs: Library error type
//
// Every random stream is forked from one seed (composer_prng), so training
// and composition are reproducible.

pub mod cae;
pub mod composer;
pub mod config;
pub mod dissonance;
pub mod error;
pub mod gan;
pub mod midi;
pub mod model;
pub mod nn;
pub mod roll;
pub mod sampler;

pub use composer::{AaeComposer, AaeComposerBuilder};
pub use config::ComposerConfig;
pub use error::{ComposerError, Result};
