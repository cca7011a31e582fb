//! Upsampling network: mel frames -> per-sample conditioning.
//!
//! Two branches run over the same mel input:
//! - the residual stack produces aux features at frame rate, which are then
//!   repeated `total_scale` times along time;
//! - the mels themselves go through one stretch + box-filter stage per
//!   upsample factor and are trimmed by `pad * total_scale` at both ends.
//!
//! Both branches end up exactly `total_scale * (n_frames - 2 * pad)` samples long.

use tracing::debug;

use crate::conditioning::Conditioning;
use crate::constants::RESNET_CONTEXT;
use crate::conv::box_filter_colmajor;
use crate::error::{Result, ensure_config};
use crate::ops::transpose;
use crate::params::Hparams;
use crate::resnet::MelResNet;
use crate::stats::TensorStats;
use crate::stretch::stretch2d;
use crate::weights::WeightProvider;

pub const RESNET_PREFIX: &str = "upsample.resnet";

#[derive(Debug, Clone)]
pub struct UpsampleNetwork {
    factors: Vec<usize>,
    pad: usize,
    feat_dims: usize,
    resnet: MelResNet,
}

impl UpsampleNetwork {
    pub fn new(factors: Vec<usize>, pad: usize, feat_dims: usize, resnet: MelResNet) -> Result<Self> {
        ensure_config!(
            !factors.is_empty() && factors.iter().all(|&f| f > 0),
            "upsample factors must be non-empty and positive, got {factors:?}"
        );
        ensure_config!(
            pad >= RESNET_CONTEXT,
            "pad {pad} is smaller than the residual stack context {RESNET_CONTEXT}"
        );
        ensure_config!(
            resnet.in_dims == feat_dims,
            "residual stack expects {} input channels, mels have {feat_dims}",
            resnet.in_dims
        );
        Ok(Self {
            factors,
            pad,
            feat_dims,
            resnet,
        })
    }

    pub fn load(hp: &Hparams, provider: &dyn WeightProvider) -> Result<Self> {
        let resnet = MelResNet::load(
            provider,
            RESNET_PREFIX,
            hp.res_blocks,
            hp.feat_dims,
            hp.compute_dims,
            hp.res_out_dims,
            hp.batch_norm_eps,
        )?;
        Self::new(hp.upsample_factors.clone(), hp.pad, hp.feat_dims, resnet)
    }

    #[must_use]
    pub fn total_scale(&self) -> usize {
        self.factors.iter().product()
    }

    #[must_use]
    pub fn resnet(&self) -> &MelResNet {
        &self.resnet
    }

    /// Output length for `n_frames`, or `None` if the input is too short.
    #[must_use]
    pub fn output_len(&self, n_frames: usize) -> Option<usize> {
        (n_frames > 2 * self.pad).then(|| self.total_scale() * (n_frames - 2 * self.pad))
    }

    /// `mel`: row-major `[n_frames, feat_dims]`.
    pub fn forward(&self, mel: &[f32], n_frames: usize) -> Result<Conditioning> {
        ensure_config!(
            mel.len() == n_frames * self.feat_dims,
            "mel buffer has {} values, expected {n_frames} x {}",
            mel.len(),
            self.feat_dims
        );
        let Some(n_samples) = self.output_len(n_frames) else {
            return Err(crate::error::VocoderError::config(format!(
                "need at least {} mel frames for pad {}, got {n_frames}",
                2 * self.pad + 1,
                self.pad
            )));
        };

        let aux = self.aux_branch(mel, n_frames)?;
        let mels = self.mel_branch(mel, n_frames);
        debug!(
            n_frames,
            n_samples,
            mels = %TensorStats::of(&mels),
            aux = %TensorStats::of(&aux),
            "conditioning ready"
        );
        Conditioning::new(mels, aux, n_samples, self.feat_dims, self.resnet.out_dims)
    }

    fn aux_branch(&self, mel: &[f32], n_frames: usize) -> Result<Vec<f32>> {
        let out_dims = self.resnet.out_dims;
        let raw = self.resnet.forward(mel, n_frames)?;
        let raw_len = MelResNet::output_len(n_frames);

        // raw frame j is centered on input frame j + RESNET_CONTEXT; keep the
        // frames centered on pad..n_frames - pad.
        let skip = self.pad - RESNET_CONTEXT;
        let keep = n_frames - 2 * self.pad;
        ensure_config!(
            skip + keep <= raw_len,
            "aux branch has {raw_len} frames, cannot align {keep} frames at offset {skip}"
        );
        let aligned = &raw[skip * out_dims..(skip + keep) * out_dims];
        Ok(stretch2d(aligned, keep, out_dims, 1, self.total_scale()))
    }

    fn mel_branch(&self, mel: &[f32], n_frames: usize) -> Vec<f32> {
        let channels = self.feat_dims;
        let mut m = transpose(mel, n_frames, channels);
        let mut len = n_frames;
        for &scale in &self.factors {
            m = stretch2d(&m, channels, len, scale, 1);
            len *= scale;
            m = box_filter_colmajor(&m, channels, len, scale);
        }

        let indent = self.pad * self.total_scale();
        let kept = len - 2 * indent;
        let mut out = vec![0.0f32; kept * channels];
        for c in 0..channels {
            let src = &m[c * len + indent..c * len + indent + kept];
            for (t, &v) in src.iter().enumerate() {
                out[t * channels + c] = v;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::UpsampleNetwork;
    use crate::resnet::{FoldedNorm, MelResNet};

    /// Residual stack whose aux output is the center mel frame (kernel tap 2),
    /// so alignment can be checked by value.
    fn center_tap_resnet(dims: usize) -> MelResNet {
        let mut conv_in = vec![0.0f32; dims * dims * 5];
        for c in 0..dims {
            conv_in[(c * dims + c) * 5 + 2] = 1.0;
        }
        let mut conv_out = vec![0.0f32; dims * dims];
        for c in 0..dims {
            conv_out[c * dims + c] = 1.0;
        }
        MelResNet {
            in_dims: dims,
            compute_dims: dims,
            out_dims: dims,
            conv_in,
            norm: FoldedNorm::identity(dims),
            blocks: Vec::new(),
            conv_out_weight: conv_out,
            conv_out_bias: vec![0.0; dims],
        }
    }

    fn ramp(n_frames: usize, dims: usize) -> Vec<f32> {
        // Non-negative so the relu after the input conv is a no-op.
        (0..n_frames * dims).map(|i| (i / dims) as f32 + 1.0).collect()
    }

    #[test]
    fn output_length_matches_formula() {
        for (factors, pad) in [(vec![5, 5, 11], 2usize), (vec![2, 3], 3), (vec![4], 2)] {
            let scale: usize = factors.iter().product();
            let net = UpsampleNetwork::new(factors, pad, 4, center_tap_resnet(4)).expect("net");
            for n_frames in [2 * pad + 1, 2 * pad + 4, 17] {
                let cond = net.forward(&ramp(n_frames, 4), n_frames).expect("forward");
                assert_eq!(cond.len(), scale * (n_frames - 2 * pad));
            }
        }
    }

    #[test]
    fn minimal_input_yields_one_frame_of_samples() {
        let net = UpsampleNetwork::new(vec![5, 5, 11], 2, 4, center_tap_resnet(4)).expect("net");
        let cond = net.forward(&ramp(5, 4), 5).expect("forward");
        assert_eq!(cond.len(), 275);
        // Center frame (index 2) has value 3 in every channel.
        for i in [0usize, 137, 274] {
            assert!(cond.aux().chunks_exact(4).nth(i).expect("row").iter().all(|&v| v == 3.0));
        }
        assert!(net.forward(&ramp(4, 4), 4).is_err());
    }

    #[test]
    fn aux_is_aligned_with_trimmed_mels() {
        // pad 3 trims one extra aux frame at each end.
        let net = UpsampleNetwork::new(vec![2], 3, 1, center_tap_resnet(1)).expect("net");
        let n_frames = 9usize;
        let cond = net.forward(&ramp(n_frames, 1), n_frames).expect("forward");
        assert_eq!(cond.len(), 2 * 3);
        // kept frames are 3, 4, 5 (values 4, 5, 6), each repeated twice
        assert_eq!(cond.aux(), &[4.0, 4.0, 5.0, 5.0, 6.0, 6.0]);
    }

    #[test]
    fn constant_mels_stay_constant_away_from_edges() {
        let dims = 3usize;
        let net = UpsampleNetwork::new(vec![5, 5, 11], 2, dims, center_tap_resnet(dims))
            .expect("net");
        let n_frames = 8usize;
        let mel = vec![0.75f32; n_frames * dims];
        let cond = net.forward(&mel, n_frames).expect("forward");
        for v in cond.mels() {
            assert!((v - 0.75).abs() < 1e-4, "got {v}");
        }
    }

    #[test]
    fn rejects_mismatched_feature_width() {
        assert!(UpsampleNetwork::new(vec![2], 2, 5, center_tap_resnet(4)).is_err());
        let net = UpsampleNetwork::new(vec![2], 2, 4, center_tap_resnet(4)).expect("net");
        assert!(net.forward(&[0.0; 10], 5).is_err());
    }
}
