//! Nearest-neighbour 2D stretch.

/// Replicate every cell of a row-major `[height, width]` map into a
/// `y_scale x x_scale` block, giving `[height * y_scale, width * x_scale]`.
///
/// No interpolation: output cell `(r, c)` equals input cell
/// `(r / y_scale, c / x_scale)`.
pub fn stretch2d(
    input: &[f32],
    height: usize,
    width: usize,
    x_scale: usize,
    y_scale: usize,
) -> Vec<f32> {
    debug_assert_eq!(input.len(), height * width);
    let out_w = width * x_scale;
    let mut out = Vec::with_capacity(height * y_scale * out_w);

    for row in input.chunks_exact(width.max(1)).take(height) {
        let start = out.len();
        for &v in row {
            out.extend(std::iter::repeat_n(v, x_scale));
        }
        for _ in 1..y_scale {
            out.extend_from_within(start..start + out_w);
        }
    }
    out
}
