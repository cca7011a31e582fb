//! Gated recurrent cell with the trained parameter layout.
//!
//! Gate rows are stacked `[reset; update; new]` in both `w_ih` (`[3H, in]`)
//! and `w_hh` (`[3H, H]`), with separate input and hidden biases:
//!
//! ```text
//! r  = sigmoid(W_ir x + b_ir + W_hr h + b_hr)
//! z  = sigmoid(W_iz x + b_iz + W_hz h + b_hz)
//! n  = tanh(W_in x + b_in + r * (W_hn h + b_hn))
//! h' = (1 - z) * n + z * h
//! ```

use crate::error::Result;
use crate::math::sigmoid;
use crate::ops::linear_into;
use crate::weights::WeightProvider;

#[derive(Debug, Clone)]
pub struct GruCell {
    pub input_dims: usize,
    pub hidden: usize,
    pub w_ih: Vec<f32>, // [3 * hidden, input_dims]
    pub w_hh: Vec<f32>, // [3 * hidden, hidden]
    pub b_ih: Vec<f32>, // [3 * hidden]
    pub b_hh: Vec<f32>, // [3 * hidden]
}

/// Gate pre-activation buffers reused across steps.
#[derive(Debug, Clone)]
pub struct GruScratch {
    gi: Vec<f32>,
    gh: Vec<f32>,
}

impl GruScratch {
    #[must_use]
    pub fn new(hidden: usize) -> Self {
        Self {
            gi: vec![0.0; 3 * hidden],
            gh: vec![0.0; 3 * hidden],
        }
    }
}

impl GruCell {
    /// Load `{prefix}.weight_ih_l0`, `weight_hh_l0`, `bias_ih_l0`, `bias_hh_l0`.
    pub fn load(
        provider: &dyn WeightProvider,
        prefix: &str,
        input_dims: usize,
        hidden: usize,
    ) -> Result<Self> {
        let gates = 3 * hidden;
        let get = |name: &str, shape: &[usize]| -> Result<Vec<f32>> {
            Ok(provider
                .tensor_shaped(&format!("{prefix}.{name}"), shape)?
                .data)
        };
        Ok(Self {
            input_dims,
            hidden,
            w_ih: get("weight_ih_l0", &[gates, input_dims])?,
            w_hh: get("weight_hh_l0", &[gates, hidden])?,
            b_ih: get("bias_ih_l0", &[gates])?,
            b_hh: get("bias_hh_l0", &[gates])?,
        })
    }

    #[must_use]
    pub fn zeros(input_dims: usize, hidden: usize) -> Self {
        Self {
            input_dims,
            hidden,
            w_ih: vec![0.0; 3 * hidden * input_dims],
            w_hh: vec![0.0; 3 * hidden * hidden],
            b_ih: vec![0.0; 3 * hidden],
            b_hh: vec![0.0; 3 * hidden],
        }
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.w_ih.len() + self.w_hh.len() + self.b_ih.len() + self.b_hh.len()
    }

    /// Advance `h` by one step of input `x`. Allocation-free.
    #[inline]
    pub fn step(&self, x: &[f32], h: &mut [f32], scratch: &mut GruScratch) {
        let n = self.hidden;
        debug_assert_eq!(x.len(), self.input_dims);
        debug_assert_eq!(h.len(), n);

        linear_into(&mut scratch.gi, x, &self.w_ih, Some(&self.b_ih));
        linear_into(&mut scratch.gh, h, &self.w_hh, Some(&self.b_hh));

        let (gi_r, rest) = scratch.gi.split_at(n);
        let (gi_z, gi_n) = rest.split_at(n);
        let (gh_r, rest) = scratch.gh.split_at(n);
        let (gh_z, gh_n) = rest.split_at(n);

        for j in 0..n {
            let r = sigmoid(gi_r[j] + gh_r[j]);
            let z = sigmoid(gi_z[j] + gh_z[j]);
            let cand = (gi_n[j] + r * gh_n[j]).tanh();
            h[j] = (1.0 - z) * cand + z * h[j];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GruCell, GruScratch};
    use crate::math::sigmoid;

    #[test]
    fn zero_cell_halves_state() {
        // All pre-activations are 0: r = z = 0.5, n = 0 => h' = h / 2.
        let cell = GruCell::zeros(3, 2);
        let mut h = [1.0f32, -0.5];
        let mut scratch = GruScratch::new(2);
        cell.step(&[0.3, 0.1, -0.2], &mut h, &mut scratch);
        assert!((h[0] - 0.5).abs() < 1e-6);
        assert!((h[1] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn matches_scalar_reference() {
        let mut seed = 17u32;
        let mut rand = || {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            (((seed >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0) * 0.5
        };
        let (input_dims, hidden) = (3usize, 2usize);
        let mut cell = GruCell::zeros(input_dims, hidden);
        for v in cell
            .w_ih
            .iter_mut()
            .chain(cell.w_hh.iter_mut())
            .chain(cell.b_ih.iter_mut())
            .chain(cell.b_hh.iter_mut())
        {
            *v = rand();
        }
        let x = [0.2f32, -0.7, 0.4];
        let h0 = [0.1f32, -0.3];

        let row = |w: &[f32], i: usize, v: &[f32]| -> f32 {
            let d = v.len();
            w[i * d..(i + 1) * d].iter().zip(v).map(|(a, b)| a * b).sum()
        };
        let mut expected = [0.0f32; 2];
        for j in 0..hidden {
            let gi = |g: usize| row(&cell.w_ih, g * hidden + j, &x) + cell.b_ih[g * hidden + j];
            let gh = |g: usize| row(&cell.w_hh, g * hidden + j, &h0) + cell.b_hh[g * hidden + j];
            let r = sigmoid(gi(0) + gh(0));
            let z = sigmoid(gi(1) + gh(1));
            let n = (gi(2) + r * gh(2)).tanh();
            expected[j] = (1.0 - z) * n + z * h0[j];
        }

        let mut h = h0;
        cell.step(&x, &mut h, &mut GruScratch::new(hidden));
        for (a, b) in h.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }
}
