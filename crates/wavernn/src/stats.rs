//! Summary statistics for debug logging of intermediate buffers.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorStats {
    pub len: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub var: f32,
}

impl TensorStats {
    #[must_use]
    pub fn of(x: &[f32]) -> Self {
        if x.is_empty() {
            return Self {
                len: 0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                var: 0.0,
            };
        }
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut sq = 0.0f64;
        for &v in x {
            min = min.min(v);
            max = max.max(v);
            sum += f64::from(v);
            sq += f64::from(v) * f64::from(v);
        }
        let n = x.len() as f64;
        let mean = sum / n;
        Self {
            len: x.len(),
            min,
            max,
            mean: mean as f32,
            var: (sq / n - mean * mean).max(0.0) as f32,
        }
    }
}

impl fmt::Display for TensorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} min={:.6} max={:.6} avg={:.6} var={:.6}",
            self.len, self.min, self.max, self.mean, self.var
        )
    }
}
