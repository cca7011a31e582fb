//! Dense inference ops shared by the conditioning network and the decoder.

use rayon::prelude::*;

/// Linear layer over rows: `y = x * W^T + b`.
///
/// Shapes:
/// - `input`: `[n_rows, in_dim]`
/// - `weight`: `[out_dim, in_dim]`
/// - output: `[n_rows, out_dim]`
///
/// Rows are independent and computed in parallel.
pub fn linear(
    input: &[f32],
    n_rows: usize,
    in_dim: usize,
    weight: &[f32],
    out_dim: usize,
    bias: Option<&[f32]>,
) -> Vec<f32> {
    debug_assert_eq!(input.len(), n_rows * in_dim);
    let mut out = vec![0.0f32; n_rows * out_dim];
    if out_dim == 0 {
        return out;
    }
    out.par_chunks_mut(out_dim)
        .zip(input.par_chunks(in_dim.max(1)))
        .for_each(|(y, x)| linear_into(y, x, weight, bias));
    out
}

/// Single-row linear layer writing into a caller-owned buffer.
///
/// `out.len()` is the output width and `x.len()` the input width; `weight`
/// is row-major `[out.len(), x.len()]`. Performs no allocation.
#[inline]
pub fn linear_into(out: &mut [f32], x: &[f32], weight: &[f32], bias: Option<&[f32]>) {
    let in_dim = x.len();
    debug_assert_eq!(weight.len(), out.len() * in_dim);
    if let Some(b) = bias {
        debug_assert_eq!(b.len(), out.len());
    }

    for (o, (y, w)) in out.iter_mut().zip(weight.chunks_exact(in_dim)).enumerate() {
        let mut sum = bias.map_or(0.0, |b| b[o]);
        sum += dot(x, w);
        *y = sum;
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    // Four independent accumulators let the compiler vectorize the reduction.
    let mut acc = [0.0f32; 4];
    let mut ca = a.chunks_exact(4);
    let mut cb = b.chunks_exact(4);
    for (xa, xb) in (&mut ca).zip(&mut cb) {
        acc[0] += xa[0] * xb[0];
        acc[1] += xa[1] * xb[1];
        acc[2] += xa[2] * xb[2];
        acc[3] += xa[3] * xb[3];
    }
    let mut sum = (acc[0] + acc[1]) + (acc[2] + acc[3]);
    for (xa, xb) in ca.remainder().iter().zip(cb.remainder()) {
        sum += xa * xb;
    }
    sum
}

pub fn add_inplace(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter().copied()) {
        *d += s;
    }
}

/// Row-major `[rows, cols]` -> row-major `[cols, rows]`.
pub fn transpose(input: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(input.len(), rows * cols);
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = input[r * cols + c];
        }
    }
    out
}
