//! Full vocoder: conditioning network plus sample decoder, and model
//! directory loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyResult};
use rand::Rng;
use tracing::info;

use crate::conditioning::Conditioning;
use crate::constants::RESNET_KERNEL;
use crate::decoder::{DecoderWeights, GenerateOptions, ProgressSink};
use crate::error::{Result, VocoderError, ensure_config};
use crate::export::TextParams;
use crate::mel::MelSpectrogram;
use crate::params::Hparams;
use crate::upsample::{RESNET_PREFIX, UpsampleNetwork};
use crate::weights::{TensorF32, WeightError, WeightProvider, WeightStore};

/// Canonical `(name, shape)` pairs of the decoder, in checkpoint order.
#[must_use]
pub fn decoder_parameters(hp: &Hparams) -> Vec<(String, Vec<usize>)> {
    let (rnn, fc, aux) = (hp.rnn_dims, hp.fc_dims, hp.aux_dims());
    let mut params = vec![
        ("I.weight".to_string(), vec![rnn, hp.input_dims()]),
        ("I.bias".to_string(), vec![rnn]),
    ];
    for (prefix, in_dims) in [("rnn1", rnn), ("rnn2", rnn + aux)] {
        params.push((format!("{prefix}.weight_ih_l0"), vec![3 * rnn, in_dims]));
        params.push((format!("{prefix}.weight_hh_l0"), vec![3 * rnn, rnn]));
        params.push((format!("{prefix}.bias_ih_l0"), vec![3 * rnn]));
        params.push((format!("{prefix}.bias_hh_l0"), vec![3 * rnn]));
    }
    for (prefix, out_dims, in_dims) in [
        ("fc1", fc, rnn + aux),
        ("fc2", fc, fc + aux),
        ("fc3", hp.n_classes(), fc),
    ] {
        params.push((format!("{prefix}.weight"), vec![out_dims, in_dims]));
        params.push((format!("{prefix}.bias"), vec![out_dims]));
    }
    params
}

/// Canonical `(name, shape)` pairs of the residual conditioning stack.
#[must_use]
pub fn resnet_parameters(hp: &Hparams) -> Vec<(String, Vec<usize>)> {
    let c = hp.compute_dims;
    let mut params = vec![(
        format!("{RESNET_PREFIX}.conv_in.weight"),
        vec![c, hp.feat_dims, RESNET_KERNEL],
    )];
    let norm = |params: &mut Vec<(String, Vec<usize>)>, prefix: String| {
        for stat in ["weight", "bias", "running_mean", "running_var"] {
            params.push((format!("{prefix}.{stat}"), vec![c]));
        }
    };
    norm(&mut params, format!("{RESNET_PREFIX}.batch_norm"));
    for i in 0..hp.res_blocks {
        let layer = format!("{RESNET_PREFIX}.layers.{i}");
        params.push((format!("{layer}.conv1.weight"), vec![c, c, 1]));
        params.push((format!("{layer}.conv2.weight"), vec![c, c, 1]));
        norm(&mut params, format!("{layer}.batch_norm1"));
        norm(&mut params, format!("{layer}.batch_norm2"));
    }
    params.push((
        format!("{RESNET_PREFIX}.conv_out.weight"),
        vec![hp.res_out_dims, c, 1],
    ));
    params.push((format!("{RESNET_PREFIX}.conv_out.bias"), vec![hp.res_out_dims]));
    params
}

/// Every parameter a full model needs.
#[must_use]
pub fn expected_parameters(hp: &Hparams) -> Vec<(String, Vec<usize>)> {
    let mut params = resnet_parameters(hp);
    params.extend(decoder_parameters(hp));
    params
}

/// Check presence and shape of every `expected` tensor before anything is built.
pub fn check_parameters(
    provider: &dyn WeightProvider,
    expected: &[(String, Vec<usize>)],
) -> Result<()> {
    for (name, shape) in expected {
        provider.tensor_shaped(name, shape)?;
    }
    Ok(())
}

/// Loaded vocoder. Immutable after load; safe to share across threads.
#[derive(Debug, Clone)]
pub struct WaveRnn {
    hparams: Hparams,
    upsample: UpsampleNetwork,
    decoder: DecoderWeights,
}

impl WaveRnn {
    pub fn load(hparams: Hparams, provider: &dyn WeightProvider) -> Result<Self> {
        hparams.validate()?;
        check_parameters(provider, &expected_parameters(&hparams))?;
        let upsample = UpsampleNetwork::load(&hparams, provider)?;
        let decoder = DecoderWeights::load(&hparams, provider)?;
        let model = Self::from_parts(hparams, upsample, decoder)?;
        info!(
            params = model.param_count(),
            bits = model.hparams.bits,
            total_scale = model.hparams.total_scale(),
            "model loaded"
        );
        Ok(model)
    }

    /// Assemble from already-built components, checking that they agree.
    pub fn from_parts(
        hparams: Hparams,
        upsample: UpsampleNetwork,
        decoder: DecoderWeights,
    ) -> Result<Self> {
        hparams.validate()?;
        ensure_config!(
            upsample.total_scale() == hparams.total_scale(),
            "upsample network scales by {}, hparams declare {}",
            upsample.total_scale(),
            hparams.total_scale()
        );
        ensure_config!(
            upsample.resnet().out_dims == hparams.res_out_dims,
            "residual stack emits {} channels, hparams declare {}",
            upsample.resnet().out_dims,
            hparams.res_out_dims
        );
        ensure_config!(
            decoder.feat_dims == hparams.feat_dims
                && decoder.aux_dims == hparams.aux_dims()
                && decoder.n_classes == hparams.n_classes(),
            "decoder dims (feat {}, aux {}, classes {}) disagree with hparams",
            decoder.feat_dims,
            decoder.aux_dims,
            decoder.n_classes
        );
        Ok(Self {
            hparams,
            upsample,
            decoder,
        })
    }

    #[must_use]
    pub fn hparams(&self) -> &Hparams {
        &self.hparams
    }

    #[must_use]
    pub fn upsample(&self) -> &UpsampleNetwork {
        &self.upsample
    }

    #[must_use]
    pub fn decoder(&self) -> &DecoderWeights {
        &self.decoder
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.upsample.resnet().param_count() + self.decoder.param_count()
    }

    /// Run the conditioning network over a `[n_frames, feat_dims]` mel matrix.
    pub fn condition(&self, mel: &MelSpectrogram) -> Result<Conditioning> {
        ensure_config!(
            mel.n_mels() == self.hparams.feat_dims,
            "mel frames have {} channels, model expects {}",
            mel.n_mels(),
            self.hparams.feat_dims
        );
        let Some(expected) = self.hparams.samples_for_frames(mel.n_frames()) else {
            return Err(VocoderError::config(format!(
                "need at least {} mel frames, got {}",
                self.hparams.min_frames(),
                mel.n_frames()
            )));
        };
        let cond = self.upsample.forward(mel.data(), mel.n_frames())?;
        ensure_config!(
            cond.len() == expected,
            "conditioning has {} samples, expected {expected}",
            cond.len()
        );
        Ok(cond)
    }

    /// Decode a waveform from precomputed conditioning.
    pub fn decode<R: Rng + ?Sized>(
        &self,
        cond: &Conditioning,
        rng: &mut R,
        opts: &GenerateOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<f32>> {
        self.decoder.generate(cond, rng, opts, progress)
    }

    /// Mel frames to waveform: conditioning runs to completion, then the
    /// decode loop produces `total_scale * (n_frames - 2 * pad)` samples.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        mel: &MelSpectrogram,
        rng: &mut R,
        opts: &GenerateOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<f32>> {
        let cond = self.condition(mel)?;
        self.decode(&cond, rng, opts, progress)
    }
}

pub const PARAMS_FILE: &str = "params.json";
pub const WEIGHTS_FILE: &str = "weights.safetensors";
pub const TEXT_PARAMS_DIR: &str = "params";

/// Where a model directory keeps its tensors.
#[derive(Debug)]
pub enum WeightSource {
    SafeTensors(WeightStore),
    /// Exported decoder literals; no conditioning network.
    Text(TextParams),
}

impl WeightProvider for WeightSource {
    fn tensor(&self, name: &str) -> Result<TensorF32, WeightError> {
        match self {
            Self::SafeTensors(store) => store.tensor(name),
            Self::Text(params) => params.tensor(name),
        }
    }

    fn contains(&self, name: &str) -> Result<bool, WeightError> {
        match self {
            Self::SafeTensors(store) => store.contains(name),
            Self::Text(params) => params.contains(name),
        }
    }
}

/// `params.json` plus weights, as found in a model directory.
#[derive(Debug)]
pub struct ModelBundle {
    pub dir: PathBuf,
    pub hparams: Hparams,
    pub weights: WeightSource,
}

impl ModelBundle {
    pub fn load_from_dir(dir: impl AsRef<Path>) -> AnyResult<Self> {
        let dir = dir.as_ref();
        let hparams = Hparams::from_path(dir.join(PARAMS_FILE)).context("load params.json")?;

        let safetensors = dir.join(WEIGHTS_FILE);
        let text_dir = dir.join(TEXT_PARAMS_DIR);
        let weights = if safetensors.is_file() {
            WeightSource::SafeTensors(
                WeightStore::open(&safetensors).context("load weights.safetensors")?,
            )
        } else if text_dir.is_dir() {
            WeightSource::Text(TextParams::load_dir(&text_dir).context("load params/")?)
        } else {
            anyhow::bail!(
                "{} has neither {WEIGHTS_FILE} nor a {TEXT_PARAMS_DIR}/ directory",
                dir.display()
            );
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            hparams,
            weights,
        })
    }

    pub fn model(&self) -> AnyResult<WaveRnn> {
        WaveRnn::load(self.hparams.clone(), &self.weights)
            .with_context(|| format!("build model from {}", self.dir.display()))
    }

    /// Decoder only; works for text-exported parameter directories too.
    pub fn decoder(&self) -> AnyResult<DecoderWeights> {
        let build = || -> Result<DecoderWeights> {
            check_parameters(&self.weights, &decoder_parameters(&self.hparams))?;
            let decoder = DecoderWeights::load(&self.hparams, &self.weights)?;
            info!(params = decoder.param_count(), "decoder loaded");
            Ok(decoder)
        };
        build().with_context(|| format!("build decoder from {}", self.dir.display()))
    }
}
