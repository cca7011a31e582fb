//! Residual convolution stack that turns mel frames into auxiliary features.
//!
//! Layout: kernel-5 input conv (no bias, unpadded) -> norm -> relu ->
//! `res_blocks` x [`ResBlock`] -> 1x1 output conv with bias. All activations
//! are row-major `[frames, channels]`.

use rayon::prelude::*;

use crate::constants::RESNET_KERNEL;
use crate::conv::{conv1d_valid_rows, valid_len};
use crate::error::{Result, ensure_config};
use crate::math::relu_inplace;
use crate::ops::{add_inplace, linear};
use crate::weights::WeightProvider;

/// Inference-time batch norm folded into a per-channel affine map.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedNorm {
    pub scale: Vec<f32>,
    pub shift: Vec<f32>,
}

impl FoldedNorm {
    /// `scale = gamma / sqrt(var + eps)`, `shift = beta - mean * scale`.
    #[must_use]
    pub fn from_stats(gamma: &[f32], beta: &[f32], mean: &[f32], var: &[f32], eps: f32) -> Self {
        debug_assert!(gamma.len() == beta.len() && mean.len() == var.len());
        let scale: Vec<f32> = gamma
            .iter()
            .zip(var)
            .map(|(&g, &v)| g / (v + eps).sqrt())
            .collect();
        let shift = beta
            .iter()
            .zip(mean)
            .zip(&scale)
            .map(|((&b, &m), &s)| b - m * s)
            .collect();
        Self { scale, shift }
    }

    #[must_use]
    pub fn identity(channels: usize) -> Self {
        Self {
            scale: vec![1.0; channels],
            shift: vec![0.0; channels],
        }
    }

    pub fn load(
        provider: &dyn WeightProvider,
        prefix: &str,
        channels: usize,
        eps: f32,
    ) -> Result<Self> {
        let fetch = |p: &str| -> Result<Vec<f32>> {
            Ok(provider
                .tensor_shaped(&format!("{prefix}.{p}"), &[channels])?
                .data)
        };
        let gamma = fetch("weight")?;
        let beta = fetch("bias")?;
        let mean = fetch("running_mean")?;
        let var = fetch("running_var")?;
        Ok(Self::from_stats(&gamma, &beta, &mean, &var, eps))
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.scale.len()
    }

    /// Apply to row-major `[frames, channels]` data in place.
    pub fn apply_rows(&self, data: &mut [f32]) {
        let channels = self.channels();
        if channels == 0 {
            return;
        }
        data.par_chunks_mut(channels).for_each(|row| {
            for ((x, &s), &b) in row.iter_mut().zip(&self.scale).zip(&self.shift) {
                *x = *x * s + b;
            }
        });
    }
}

/// `x + norm2(conv2(relu(norm1(conv1(x)))))` with 1x1 convolutions.
#[derive(Debug, Clone)]
pub struct ResBlock {
    pub dims: usize,
    pub conv1: Vec<f32>, // [dims, dims]
    pub norm1: FoldedNorm,
    pub conv2: Vec<f32>, // [dims, dims]
    pub norm2: FoldedNorm,
}

impl ResBlock {
    /// Block whose convolutions are identity matrices and norms are no-ops.
    #[must_use]
    pub fn identity(dims: usize) -> Self {
        let mut eye = vec![0.0f32; dims * dims];
        for i in 0..dims {
            eye[i * dims + i] = 1.0;
        }
        Self {
            dims,
            conv1: eye.clone(),
            norm1: FoldedNorm::identity(dims),
            conv2: eye,
            norm2: FoldedNorm::identity(dims),
        }
    }

    pub fn load(provider: &dyn WeightProvider, prefix: &str, dims: usize, eps: f32) -> Result<Self> {
        let conv = |name: &str| -> Result<Vec<f32>> {
            Ok(provider
                .tensor_shaped(&format!("{prefix}.{name}.weight"), &[dims, dims, 1])?
                .data)
        };
        Ok(Self {
            dims,
            conv1: conv("conv1")?,
            norm1: FoldedNorm::load(provider, &format!("{prefix}.batch_norm1"), dims, eps)?,
            conv2: conv("conv2")?,
            norm2: FoldedNorm::load(provider, &format!("{prefix}.batch_norm2"), dims, eps)?,
        })
    }

    /// `x`: row-major `[n_frames, dims]`.
    #[must_use]
    pub fn forward(&self, x: &[f32], n_frames: usize) -> Vec<f32> {
        debug_assert_eq!(x.len(), n_frames * self.dims);
        let mut h = linear(x, n_frames, self.dims, &self.conv1, self.dims, None);
        self.norm1.apply_rows(&mut h);
        relu_inplace(&mut h);
        let mut out = linear(&h, n_frames, self.dims, &self.conv2, self.dims, None);
        self.norm2.apply_rows(&mut out);
        add_inplace(&mut out, x);
        out
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.conv1.len() + self.conv2.len() + 4 * self.dims
    }
}

#[derive(Debug, Clone)]
pub struct MelResNet {
    pub in_dims: usize,
    pub compute_dims: usize,
    pub out_dims: usize,
    pub conv_in: Vec<f32>, // [compute_dims, in_dims, 5]
    pub norm: FoldedNorm,
    pub blocks: Vec<ResBlock>,
    pub conv_out_weight: Vec<f32>, // [out_dims, compute_dims]
    pub conv_out_bias: Vec<f32>,   // [out_dims]
}

impl MelResNet {
    pub fn load(
        provider: &dyn WeightProvider,
        prefix: &str,
        res_blocks: usize,
        in_dims: usize,
        compute_dims: usize,
        out_dims: usize,
        eps: f32,
    ) -> Result<Self> {
        let conv_in = provider
            .tensor_shaped(
                &format!("{prefix}.conv_in.weight"),
                &[compute_dims, in_dims, RESNET_KERNEL],
            )?
            .data;
        let norm = FoldedNorm::load(provider, &format!("{prefix}.batch_norm"), compute_dims, eps)?;
        let blocks = (0..res_blocks)
            .map(|i| ResBlock::load(provider, &format!("{prefix}.layers.{i}"), compute_dims, eps))
            .collect::<Result<Vec<_>>>()?;
        let conv_out_weight = provider
            .tensor_shaped(&format!("{prefix}.conv_out.weight"), &[out_dims, compute_dims, 1])?
            .data;
        let conv_out_bias = provider
            .tensor_shaped(&format!("{prefix}.conv_out.bias"), &[out_dims])?
            .data;

        Ok(Self {
            in_dims,
            compute_dims,
            out_dims,
            conv_in,
            norm,
            blocks,
            conv_out_weight,
            conv_out_bias,
        })
    }

    /// Frames produced for `n_frames` input frames.
    #[must_use]
    pub fn output_len(n_frames: usize) -> usize {
        valid_len(n_frames, RESNET_KERNEL)
    }

    /// `mel`: row-major `[n_frames, in_dims]`. Returns row-major
    /// `[n_frames - 4, out_dims]`; output frame `j` is centered on input frame `j + 2`.
    pub fn forward(&self, mel: &[f32], n_frames: usize) -> Result<Vec<f32>> {
        ensure_config!(
            mel.len() == n_frames * self.in_dims,
            "mel buffer has {} values, expected {n_frames} x {}",
            mel.len(),
            self.in_dims
        );
        ensure_config!(
            n_frames >= RESNET_KERNEL,
            "residual stack needs at least {RESNET_KERNEL} frames, got {n_frames}"
        );

        let mut x = conv1d_valid_rows(
            mel,
            &self.conv_in,
            None,
            self.in_dims,
            self.compute_dims,
            n_frames,
            RESNET_KERNEL,
        );
        let len = Self::output_len(n_frames);
        self.norm.apply_rows(&mut x);
        relu_inplace(&mut x);
        for block in &self.blocks {
            x = block.forward(&x, len);
        }
        Ok(linear(
            &x,
            len,
            self.compute_dims,
            &self.conv_out_weight,
            self.out_dims,
            Some(&self.conv_out_bias),
        ))
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.conv_in.len()
            + 2 * self.compute_dims
            + self.blocks.iter().map(ResBlock::param_count).sum::<usize>()
            + self.conv_out_weight.len()
            + self.conv_out_bias.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{FoldedNorm, MelResNet, ResBlock};
    use crate::weights::{TensorF32, WeightMap};

    fn lcg(seed: &mut u32) -> f32 {
        *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        ((*seed >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0
    }

    #[test]
    fn block_with_silent_branch_is_identity() {
        let dims = 6usize;
        let frames = 4usize;
        let mut seed = 5u32;
        // The shortcut is pure addition, so a zero second conv leaves x untouched.
        let x: Vec<f32> = (0..dims * frames).map(|_| lcg(&mut seed)).collect();

        let mut block = ResBlock::identity(dims);
        block.conv2.fill(0.0);
        assert_eq!(block.forward(&x, frames), x);
    }

    #[test]
    fn identity_block_on_nonnegative_input_doubles() {
        let dims = 3usize;
        let x = [0.5f32, 1.0, 2.0, 0.0, 3.0, 0.25];
        let y = ResBlock::identity(dims).forward(&x, 2);
        for (a, b) in y.iter().zip(x.iter()) {
            assert!((a - 2.0 * b).abs() < 1e-6);
        }
    }

    #[test]
    fn folded_norm_matches_batch_norm_formula() {
        let norm = FoldedNorm::from_stats(&[2.0, 1.0], &[0.5, -1.0], &[1.0, 0.0], &[4.0, 1.0], 0.0);
        let mut rows = [3.0f32, 2.0];
        norm.apply_rows(&mut rows);
        // (3 - 1) / 2 * 2 + 0.5 = 2.5 ; (2 - 0) / 1 * 1 - 1 = 1
        assert!((rows[0] - 2.5).abs() < 1e-6);
        assert!((rows[1] - 1.0).abs() < 1e-6);
    }

    fn put_norm(map: &mut WeightMap, prefix: &str, dims: usize) {
        map.insert(format!("{prefix}.weight"), TensorF32::from_vec(vec![1.0; dims]));
        map.insert(format!("{prefix}.bias"), TensorF32::from_vec(vec![0.0; dims]));
        map.insert(format!("{prefix}.running_mean"), TensorF32::from_vec(vec![0.0; dims]));
        map.insert(format!("{prefix}.running_var"), TensorF32::from_vec(vec![1.0; dims]));
    }

    #[test]
    fn resnet_output_is_four_frames_shorter() {
        let (in_dims, compute, out, blocks) = (3usize, 4usize, 8usize, 2usize);
        let mut map = WeightMap::new();
        let mut seed = 11u32;
        let mut fill = |n: usize| (0..n).map(|_| lcg(&mut seed) * 0.1).collect::<Vec<_>>();
        map.insert(
            "r.conv_in.weight",
            TensorF32::new(vec![compute, in_dims, 5], fill(compute * in_dims * 5)),
        );
        put_norm(&mut map, "r.batch_norm", compute);
        for i in 0..blocks {
            for c in ["conv1", "conv2"] {
                map.insert(
                    format!("r.layers.{i}.{c}.weight"),
                    TensorF32::new(vec![compute, compute, 1], fill(compute * compute)),
                );
            }
            put_norm(&mut map, &format!("r.layers.{i}.batch_norm1"), compute);
            put_norm(&mut map, &format!("r.layers.{i}.batch_norm2"), compute);
        }
        map.insert(
            "r.conv_out.weight",
            TensorF32::new(vec![out, compute, 1], fill(out * compute)),
        );
        map.insert("r.conv_out.bias", TensorF32::from_vec(fill(out)));

        let net = MelResNet::load(&map, "r", blocks, in_dims, compute, out, 1e-5).expect("load");
        let frames = 9usize;
        let mel = fill(frames * in_dims);
        let aux = net.forward(&mel, frames).expect("forward");
        assert_eq!(aux.len(), (frames - 4) * out);
        assert!(aux.iter().all(|v| v.is_finite()));

        assert!(net.forward(&mel[..4 * in_dims], 4).is_err());
    }
}
