// Error type shared by every module of the composer library.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ComposerError>;

#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse MIDI file {path}: {source}")]
    Midi {
        path: PathBuf,
        #[source]
        source: midly::Error,
    },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no notes within pitch range {min_pitch}..{max_pitch} in the input MIDI files")]
    NoNotes { min_pitch: u8, max_pitch: u8 },

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("empty dataset: {0}")]
    EmptyDataset(&'static str),
}

impl ComposerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ComposerError::Io {
            path: path.into(),
            source,
        }
    }
}
