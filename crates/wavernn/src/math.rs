//! Core math kernels for inference.

#[inline]
pub fn relu_inplace(x: &mut [f32]) {
    for v in x {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable softmax. Returns the pre-normalization mass
/// `sum(exp(x - max))`, which is `>= 1` for finite input and NaN otherwise.
pub fn softmax_inplace(x: &mut [f32]) -> f32 {
    if x.is_empty() {
        return 0.0;
    }
    let mut max_v = x[0];
    for &v in &x[1..] {
        if v > max_v {
            max_v = v;
        }
    }

    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_v).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x {
            *v /= sum;
        }
    }
    sum
}

/// Index of the first non-finite element, if any.
pub fn first_non_finite(x: &[f32]) -> Option<usize> {
    x.iter().position(|v| !v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::{first_non_finite, relu_inplace, sigmoid, softmax_inplace};

    #[test]
    fn relu_and_sigmoid_smoke() {
        let mut v = [-1.0f32, 0.0, 2.5];
        relu_inplace(&mut v);
        assert_eq!(v, [0.0, 0.0, 2.5]);

        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid(20.0) > 0.999_999);
        assert!(sigmoid(-20.0) < 1e-6);
    }

    #[test]
    fn softmax_is_normalized_and_ordered() {
        let mut s = [1.0f32, 2.0, 3.0];
        let mass = softmax_inplace(&mut s);
        assert!(mass >= 1.0);
        let sum: f32 = s.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(s[2] > s[1] && s[1] > s[0]);

        // Large logits must not overflow.
        let mut big = [1000.0f32, 0.0];
        softmax_inplace(&mut big);
        assert!((big[0] - 1.0).abs() < 1e-6);
        assert!(big[1] < 1e-30);
    }

    #[test]
    fn softmax_reports_nan_mass() {
        let mut s = [0.0f32, f32::NAN, 1.0];
        let mass = softmax_inplace(&mut s);
        assert!(mass.is_nan());
        assert_eq!(first_non_finite(&[0.0, 1.0, f32::INFINITY]), Some(2));
        assert_eq!(first_non_finite(&[0.0, 1.0]), None);
    }
}
