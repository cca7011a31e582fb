//! Mel-spectrogram input: a `[n_frames, n_mels]` matrix produced upstream.
//!
//! Loaders accept NumPy `.npy` (`<f4` / `<f8`, C order), safetensors (tensor
//! named `mel`) and whitespace-separated text.

use std::path::Path;

use anyhow::{Context, Result};

use crate::conditioning::parse_matrix;
use crate::ops::transpose;
use crate::weights::WeightStore;

pub const MEL_TENSOR_NAME: &str = "mel";

#[derive(Debug, Clone, PartialEq)]
pub struct MelSpectrogram {
    data: Vec<f32>,
    n_frames: usize,
    n_mels: usize,
}

impl MelSpectrogram {
    pub fn new(data: Vec<f32>, n_frames: usize, n_mels: usize) -> Result<Self> {
        anyhow::ensure!(
            data.len() == n_frames * n_mels,
            "mel data has {} values, expected {n_frames} x {n_mels}",
            data.len()
        );
        Ok(Self {
            data,
            n_frames,
            n_mels,
        })
    }

    #[must_use]
    pub fn zeros(n_frames: usize, n_mels: usize) -> Self {
        Self {
            data: vec![0.0; n_frames * n_mels],
            n_frames,
            n_mels,
        }
    }

    #[must_use]
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    #[must_use]
    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Row-major frames.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[must_use]
    pub fn frame(&self, t: usize) -> &[f32] {
        &self.data[t * self.n_mels..(t + 1) * self.n_mels]
    }

    /// Reorient so that rows are frames of width `feat_dims`, transposing a
    /// `[feat_dims, n_frames]` matrix if that is what was stored.
    pub fn with_feat_dims(self, feat_dims: usize) -> Result<Self> {
        if self.n_mels == feat_dims {
            return Ok(self);
        }
        anyhow::ensure!(
            self.n_frames == feat_dims,
            "mel matrix is {} x {}, neither axis matches feat_dims {feat_dims}",
            self.n_frames,
            self.n_mels
        );
        Ok(Self {
            data: transpose(&self.data, self.n_frames, self.n_mels),
            n_frames: self.n_mels,
            n_mels: self.n_frames,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "npy" => {
                let bytes =
                    std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
                Self::from_npy_bytes(&bytes).with_context(|| format!("parse {}", path.display()))
            }
            "safetensors" => {
                let store = WeightStore::open(path)
                    .with_context(|| format!("open {}", path.display()))?;
                let t = store
                    .tensor_f32(MEL_TENSOR_NAME)
                    .with_context(|| format!("read tensor {MEL_TENSOR_NAME:?}"))?;
                let dims = t.squeezed_shape();
                anyhow::ensure!(dims.len() == 2, "mel tensor must be 2D, got {:?}", t.shape);
                Self::new(t.data, dims[0], dims[1])
            }
            _ => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read {}", path.display()))?;
                let (data, rows, cols) = parse_matrix(&text, &path.display().to_string())?;
                Self::new(data, rows, cols)
            }
        }
    }

    pub fn from_npy_bytes(bytes: &[u8]) -> Result<Self> {
        anyhow::ensure!(
            bytes.len() >= 10 && &bytes[..6] == b"\x93NUMPY",
            "invalid NPY magic number"
        );
        let major = bytes[6];
        let (header_len, header_start) = if major == 1 {
            (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10)
        } else {
            anyhow::ensure!(bytes.len() >= 12, "truncated NPY header");
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        };
        let data_start = header_start + header_len;
        anyhow::ensure!(bytes.len() >= data_start, "truncated NPY header");
        let header = String::from_utf8_lossy(&bytes[header_start..data_start]);

        let descr = header_value(&header, "descr")?;
        let descr = descr.trim_matches(|c| c == '\'' || c == '"');
        anyhow::ensure!(
            header_value(&header, "fortran_order")?.starts_with("False"),
            "Fortran-ordered NPY arrays are not supported"
        );
        let shape = parse_shape(&header)?;
        anyhow::ensure!(shape.len() == 2, "mel array must be 2D, got shape {shape:?}");

        let n = shape[0] * shape[1];
        let raw = &bytes[data_start..];
        let data: Vec<f32> = match descr {
            "<f4" => {
                anyhow::ensure!(raw.len() >= n * 4, "NPY payload is truncated");
                raw.chunks_exact(4)
                    .take(n)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect()
            }
            "<f8" => {
                anyhow::ensure!(raw.len() >= n * 8, "NPY payload is truncated");
                raw.chunks_exact(8)
                    .take(n)
                    .map(|b| {
                        let mut a = [0u8; 8];
                        a.copy_from_slice(b);
                        f64::from_le_bytes(a) as f32
                    })
                    .collect()
            }
            other => anyhow::bail!("unsupported NPY dtype {other}"),
        };
        Self::new(data, shape[0], shape[1])
    }
}

/// Raw text of `'key': value` in an NPY header dict, up to the next comma
/// outside parentheses.
fn header_value<'h>(header: &'h str, key: &str) -> Result<&'h str> {
    let start = header
        .find(&format!("'{key}'"))
        .or_else(|| header.find(&format!("\"{key}\"")))
        .with_context(|| format!("no {key} in NPY header"))?;
    let rest = &header[start + key.len() + 2..];
    let colon = rest.find(':').context("malformed NPY header")?;
    let value = rest[colon + 1..].trim_start();

    let mut depth = 0i32;
    for (i, c) in value.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' | '}' if depth == 0 => return Ok(value[..i].trim()),
            _ => {}
        }
    }
    Ok(value.trim())
}

fn parse_shape(header: &str) -> Result<Vec<usize>> {
    let raw = header_value(header, "shape")?;
    let inner = raw.trim_start_matches('(').trim_end_matches(')');
    inner
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .with_context(|| format!("invalid shape element {s:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::MelSpectrogram;

    fn npy_bytes(descr: &str, shape: (usize, usize), payload: &[u8]) -> Vec<u8> {
        let mut header =
            format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': ({}, {}), }}", shape.0, shape.1);
        // Pad so that magic + version + len + header is a multiple of 64, ending in '\n'.
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');
        let mut out = b"\x93NUMPY\x01\x00".to_vec();
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parses_f4_and_f8_npy() {
        let vals = [0.5f32, -1.0, 2.0, 3.25, 0.0, 1.0];
        let f4: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mel = MelSpectrogram::from_npy_bytes(&npy_bytes("<f4", (3, 2), &f4)).expect("f4");
        assert_eq!(mel.n_frames(), 3);
        assert_eq!(mel.n_mels(), 2);
        assert_eq!(mel.frame(1), &[2.0, 3.25]);

        let f8: Vec<u8> = vals.iter().flat_map(|&v| f64::from(v).to_le_bytes()).collect();
        let mel8 = MelSpectrogram::from_npy_bytes(&npy_bytes("<f8", (2, 3), &f8)).expect("f8");
        assert_eq!(mel8.data(), &vals);

        assert!(MelSpectrogram::from_npy_bytes(&npy_bytes("<i4", (1, 1), &[0; 4])).is_err());
        assert!(MelSpectrogram::from_npy_bytes(b"not numpy").is_err());
    }

    #[test]
    fn transposes_channel_major_input() {
        // Stored as [feat=2, frames=3].
        let mel = MelSpectrogram::new(vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0], 2, 3).expect("mel");
        let mel = mel.with_feat_dims(2).expect("orient");
        assert_eq!(mel.n_frames(), 3);
        assert_eq!(mel.frame(2), &[3.0, 30.0]);

        let bad = MelSpectrogram::zeros(4, 5);
        assert!(bad.with_feat_dims(80).is_err());
    }
}
