//! Model hyperparameter file (`params.json`) parsing.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    AUX_SLICES, BATCH_NORM_EPS, BITS, COMPUTE_DIMS, FC_DIMS, FEAT_DIMS, PAD, RES_BLOCKS,
    RES_OUT_DIMS, RESNET_CONTEXT, RNN_DIMS, SAMPLE_RATE_HZ, UPSAMPLE_FACTORS,
};
use crate::error::{VocoderError, ensure_config};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hparams {
    pub rnn_dims: usize,
    pub fc_dims: usize,
    pub bits: u32,
    pub pad: usize,
    pub upsample_factors: Vec<usize>,
    pub feat_dims: usize,
    pub compute_dims: usize,
    pub res_out_dims: usize,
    pub res_blocks: usize,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_batch_norm_eps")]
    pub batch_norm_eps: f32,
}

fn default_sample_rate() -> u32 {
    SAMPLE_RATE_HZ
}

fn default_batch_norm_eps() -> f32 {
    BATCH_NORM_EPS
}

impl Default for Hparams {
    fn default() -> Self {
        Self::reference()
    }
}

impl Hparams {
    /// Configuration of the published 22.05 kHz model.
    #[must_use]
    pub fn reference() -> Self {
        Self {
            rnn_dims: RNN_DIMS,
            fc_dims: FC_DIMS,
            bits: BITS,
            pad: PAD,
            upsample_factors: UPSAMPLE_FACTORS.to_vec(),
            feat_dims: FEAT_DIMS,
            compute_dims: COMPUTE_DIMS,
            res_out_dims: RES_OUT_DIMS,
            res_blocks: RES_BLOCKS,
            sample_rate: SAMPLE_RATE_HZ,
            batch_norm_eps: BATCH_NORM_EPS,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json).context("parse params.json")?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let json = std::fs::read_to_string(path_ref)
            .with_context(|| format!("read {}", path_ref.display()))?;
        Self::from_json_str(&json)
    }

    #[must_use]
    pub fn n_classes(&self) -> usize {
        1usize << self.bits
    }

    #[must_use]
    pub fn aux_dims(&self) -> usize {
        self.res_out_dims / AUX_SLICES
    }

    /// Samples generated per mel frame.
    #[must_use]
    pub fn total_scale(&self) -> usize {
        self.upsample_factors.iter().product()
    }

    /// Samples trimmed from each end of the upsampled mel sequence.
    #[must_use]
    pub fn indent(&self) -> usize {
        self.pad * self.total_scale()
    }

    /// Width of the input projection: previous sample, mel vector, first aux slice.
    #[must_use]
    pub fn input_dims(&self) -> usize {
        1 + self.feat_dims + self.aux_dims()
    }

    /// Smallest number of mel frames that yields at least one sample.
    #[must_use]
    pub fn min_frames(&self) -> usize {
        2 * self.pad + 1
    }

    /// Output length for `n_frames` input frames, or `None` below [`Self::min_frames`].
    #[must_use]
    pub fn samples_for_frames(&self, n_frames: usize) -> Option<usize> {
        (n_frames >= self.min_frames()).then(|| self.total_scale() * (n_frames - 2 * self.pad))
    }

    pub fn validate(&self) -> Result<(), VocoderError> {
        ensure_config!(self.rnn_dims > 0, "rnn_dims must be > 0");
        ensure_config!(self.fc_dims > 0, "fc_dims must be > 0");
        ensure_config!(self.feat_dims > 0, "feat_dims must be > 0");
        ensure_config!(self.compute_dims > 0, "compute_dims must be > 0");
        ensure_config!(
            (1..=16).contains(&self.bits),
            "bits must be in 1..=16, got {}",
            self.bits
        );
        ensure_config!(
            self.res_out_dims > 0 && self.res_out_dims % AUX_SLICES == 0,
            "res_out_dims must be a positive multiple of {AUX_SLICES}, got {}",
            self.res_out_dims
        );
        ensure_config!(
            !self.upsample_factors.is_empty(),
            "upsample_factors must not be empty"
        );
        ensure_config!(
            self.upsample_factors.iter().all(|&f| f > 0),
            "upsample_factors must be positive, got {:?}",
            self.upsample_factors
        );
        ensure_config!(
            self.pad >= RESNET_CONTEXT,
            "pad must be >= {RESNET_CONTEXT} to cover the residual stack context, got {}",
            self.pad
        );
        ensure_config!(
            self.batch_norm_eps >= 0.0 && self.batch_norm_eps.is_finite(),
            "batch_norm_eps must be finite and non-negative"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Hparams;

    #[test]
    fn parse_params_smoke() {
        let json = r#"
        {
          "rnn_dims": 512,
          "fc_dims": 512,
          "bits": 10,
          "pad": 2,
          "upsample_factors": [5, 5, 11],
          "feat_dims": 80,
          "compute_dims": 128,
          "res_out_dims": 128,
          "res_blocks": 10
        }
        "#;
        let p = Hparams::from_json_str(json).expect("params parse");
        assert_eq!(p.n_classes(), 1024);
        assert_eq!(p.aux_dims(), 32);
        assert_eq!(p.total_scale(), 275);
        assert_eq!(p.indent(), 550);
        assert_eq!(p.input_dims(), 113);
        assert_eq!(p.sample_rate, 22_050);
        assert!((p.batch_norm_eps - 1e-5).abs() < 1e-12);
    }

    #[test]
    fn sample_count_formula() {
        let p = Hparams::reference();
        assert_eq!(p.samples_for_frames(5), Some(275));
        assert_eq!(p.samples_for_frames(100), Some(275 * 96));
        assert_eq!(p.samples_for_frames(4), None);
    }

    #[test]
    fn rejects_inconsistent_hparams() {
        let mut p = Hparams::reference();
        p.res_out_dims = 130;
        assert!(p.validate().expect_err("not divisible").is_configuration());

        let mut p = Hparams::reference();
        p.upsample_factors = vec![5, 0];
        assert!(p.validate().is_err());

        let mut p = Hparams::reference();
        p.pad = 1;
        assert!(p.validate().is_err());

        let mut p = Hparams::reference();
        p.bits = 0;
        assert!(p.validate().is_err());

        assert!(Hparams::from_json_str(r#"{"rnn_dims": 4}"#).is_err());
    }
}
