//! Categorical sampling and the amplitude quantization alphabet.

use rand::Rng;

/// Map class `c` of `n_classes` levels to `2c / (n - 1) - 1` in `[-1, 1]`.
#[inline]
#[must_use]
pub fn class_to_amplitude(class: usize, n_classes: usize) -> f32 {
    debug_assert!(n_classes >= 2);
    2.0 * class as f32 / (n_classes - 1) as f32 - 1.0
}

/// Nearest class for an amplitude, clamped to `[0, n_classes)`.
#[inline]
#[must_use]
pub fn amplitude_to_class(amplitude: f32, n_classes: usize) -> usize {
    debug_assert!(n_classes >= 2);
    let pos = (amplitude + 1.0) * (n_classes - 1) as f32 / 2.0;
    (pos.round().max(0.0) as usize).min(n_classes - 1)
}

/// Inverse-CDF draw: the first class whose cumulative mass exceeds `u`.
///
/// `u` is expected in `[0, 1)`. If rounding leaves `u` above the total mass,
/// the last class with non-zero probability is returned. `None` when no class
/// has positive probability.
#[must_use]
pub fn inverse_cdf(probs: &[f32], u: f32) -> Option<usize> {
    let mut threshold = u;
    let mut last_nonzero = None;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            if threshold < p {
                return Some(i);
            }
            last_nonzero = Some(i);
        }
        threshold -= p;
    }
    last_nonzero
}

/// Draw one class from `probs` using a single uniform from `rng`.
pub fn sample_categorical<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> Option<usize> {
    let u: f32 = rng.r#gen();
    inverse_cdf(probs, u)
}
