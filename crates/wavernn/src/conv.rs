//! Convolution kernels for the conditioning network.
//!
//! Two layouts are used:
//! - **row-major** `[length, channels]` (`input[t * channels + c]`) for the
//!   residual stack, where every output frame mixes all channels;
//! - **column-major** `[channels, length]` (`input[c * length + t]`) for the
//!   per-channel smoothing filters of the upsampling ladder.

use rayon::prelude::*;

/// Output length of an unpadded, stride-1 convolution.
#[inline]
pub fn valid_len(length: usize, kernel: usize) -> usize {
    (length + 1).saturating_sub(kernel)
}

/// Unpadded stride-1 1D convolution over row-major frames.
///
/// - `input`: `[length, channels_in]`
/// - `weight`: `[channels_out, channels_in, kernel]` contiguous
/// - output: `[length - kernel + 1, channels_out]`
///
/// Output frame `t` sees input frames `t..t + kernel`. Frames are computed in
/// parallel.
#[allow(clippy::too_many_arguments)]
pub fn conv1d_valid_rows(
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    channels_in: usize,
    channels_out: usize,
    length: usize,
    kernel: usize,
) -> Vec<f32> {
    debug_assert_eq!(input.len(), channels_in * length);
    debug_assert_eq!(weight.len(), channels_out * channels_in * kernel);
    if let Some(b) = bias {
        debug_assert_eq!(b.len(), channels_out);
    }

    let out_length = valid_len(length, kernel);
    let mut output = vec![0.0f32; out_length * channels_out];
    if out_length == 0 || channels_out == 0 {
        return output;
    }

    output
        .par_chunks_mut(channels_out)
        .enumerate()
        .for_each(|(t, out_row)| {
            let window = &input[t * channels_in..(t + kernel) * channels_in];
            for (oc, out_elem) in out_row.iter_mut().enumerate() {
                let mut sum = bias.map_or(0.0, |b| b[oc]);
                let w_oc = &weight[oc * channels_in * kernel..(oc + 1) * channels_in * kernel];
                for k in 0..kernel {
                    let frame = &window[k * channels_in..(k + 1) * channels_in];
                    for (ic, &x) in frame.iter().enumerate() {
                        sum += x * w_oc[ic * kernel + k];
                    }
                }
                *out_elem = sum;
            }
        });
    output
}

/// Moving-average filter of width `2 * radius + 1` applied independently to
/// every channel of column-major `[channels, length]` data.
///
/// Every tap weighs `1 / (2 * radius + 1)` and the sequence is zero-padded by
/// `radius` on both sides, so the length is preserved.
pub fn box_filter_colmajor(input: &[f32], channels: usize, length: usize, radius: usize) -> Vec<f32> {
    debug_assert_eq!(input.len(), channels * length);
    let width = 2 * radius + 1;
    let tap = 1.0f32 / (width as f32);
    let mut output = vec![0.0f32; channels * length];
    if length == 0 {
        return output;
    }

    output
        .par_chunks_mut(length)
        .zip(input.par_chunks(length))
        .for_each(|(out_row, in_row)| {
            for (t, out_elem) in out_row.iter_mut().enumerate() {
                let lo = t.saturating_sub(radius);
                let hi = (t + radius + 1).min(length);
                let mut sum = 0.0f32;
                for &x in &in_row[lo..hi] {
                    sum += x * tap;
                }
                *out_elem = sum;
            }
        });
    output
}
