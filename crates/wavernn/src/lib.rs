//! WaveRNN vocoder inference in Rust.
//!
//! Mel-spectrogram frames go through the upsampling/conditioning network and
//! then the sample-by-sample recurrent decoder:
//! - [`upsample::UpsampleNetwork`] expands frames to per-sample conditioning
//! - [`decoder::DecoderWeights`] runs the autoregressive loop
//! - [`model::WaveRnn`] ties both to a validated parameter set

pub mod audio;
pub mod conditioning;
pub mod constants;
pub mod conv;
pub mod decoder;
pub mod error;
pub mod export;
pub mod gru;
pub mod math;
pub mod mel;
pub mod model;
pub mod ops;
pub mod params;
pub mod resnet;
pub mod sampler;
pub mod stats;
pub mod stretch;
pub mod upsample;
pub mod weights;

pub use conditioning::Conditioning;
pub use decoder::{CancelToken, GenerateOptions, LogProgress, NoProgress, ProgressReport, ProgressSink};
pub use error::{Result, VocoderError};
pub use mel::MelSpectrogram;
pub use model::{ModelBundle, WaveRnn};
pub use params::Hparams;
pub use weights::{TensorF32, WeightError, WeightMap, WeightProvider, WeightStore};
