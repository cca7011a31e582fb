//! Per-sample conditioning tensors consumed by the decoder.

use std::fmt::Write as _;
use std::path::Path;

use crate::constants::AUX_SLICES;
use crate::error::{Result, VocoderError, ensure_config};

/// Upsampled mels `[n_samples, feat_dims]` and aux features
/// `[n_samples, 4 * aux_dims]`, both row-major and of equal length.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditioning {
    mels: Vec<f32>,
    aux: Vec<f32>,
    n_samples: usize,
    feat_dims: usize,
    aux_dims: usize,
}

pub const MELS_FILE: &str = "mels.txt";

fn aux_file(k: usize) -> String {
    format!("aux_{k}.txt")
}

impl Conditioning {
    pub fn new(
        mels: Vec<f32>,
        aux: Vec<f32>,
        n_samples: usize,
        feat_dims: usize,
        res_out_dims: usize,
    ) -> Result<Self> {
        ensure_config!(
            res_out_dims % AUX_SLICES == 0,
            "aux width {res_out_dims} is not divisible into {AUX_SLICES} slices"
        );
        ensure_config!(
            mels.len() == n_samples * feat_dims,
            "upsampled mels hold {} values, expected {n_samples} x {feat_dims}",
            mels.len()
        );
        ensure_config!(
            aux.len() == n_samples * res_out_dims,
            "aux features hold {} values, expected {n_samples} x {res_out_dims}",
            aux.len()
        );
        Ok(Self {
            mels,
            aux,
            n_samples,
            feat_dims,
            aux_dims: res_out_dims / AUX_SLICES,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.n_samples
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n_samples == 0
    }

    #[must_use]
    pub fn feat_dims(&self) -> usize {
        self.feat_dims
    }

    #[must_use]
    pub fn aux_dims(&self) -> usize {
        self.aux_dims
    }

    #[must_use]
    pub fn mels(&self) -> &[f32] {
        &self.mels
    }

    #[must_use]
    pub fn aux(&self) -> &[f32] {
        &self.aux
    }

    #[inline]
    #[must_use]
    pub fn mel_at(&self, i: usize) -> &[f32] {
        &self.mels[i * self.feat_dims..(i + 1) * self.feat_dims]
    }

    /// Slice `k` (0..4) of the aux vector for sample `i`.
    #[inline]
    #[must_use]
    pub fn aux_at(&self, k: usize, i: usize) -> &[f32] {
        let row = i * AUX_SLICES * self.aux_dims;
        &self.aux[row + k * self.aux_dims..row + (k + 1) * self.aux_dims]
    }

    /// Write `mels.txt` and `aux_0.txt`..`aux_3.txt`, one row per sample.
    pub fn save_text_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mels: Vec<&[f32]> = (0..self.n_samples).map(|i| self.mel_at(i)).collect();
        write_matrix(&dir.join(MELS_FILE), &mels)?;
        for k in 0..AUX_SLICES {
            let rows: Vec<&[f32]> = (0..self.n_samples).map(|i| self.aux_at(k, i)).collect();
            write_matrix(&dir.join(aux_file(k)), &rows)?;
        }
        Ok(())
    }

    pub fn load_text_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let (mels, n_samples, feat_dims) = read_matrix(&dir.join(MELS_FILE))?;

        let mut slices = Vec::with_capacity(AUX_SLICES);
        let mut aux_dims = 0usize;
        for k in 0..AUX_SLICES {
            let (data, rows, cols) = read_matrix(&dir.join(aux_file(k)))?;
            ensure_config!(
                rows == n_samples,
                "{} has {rows} rows, {MELS_FILE} has {n_samples}",
                aux_file(k)
            );
            ensure_config!(
                k == 0 || cols == aux_dims,
                "{} has width {cols}, expected {aux_dims}",
                aux_file(k)
            );
            aux_dims = cols;
            slices.push(data);
        }

        let mut aux = Vec::with_capacity(n_samples * AUX_SLICES * aux_dims);
        for i in 0..n_samples {
            for slice in &slices {
                aux.extend_from_slice(&slice[i * aux_dims..(i + 1) * aux_dims]);
            }
        }
        Self::new(mels, aux, n_samples, feat_dims, AUX_SLICES * aux_dims)
    }
}

fn write_matrix(path: &Path, rows: &[&[f32]]) -> Result<()> {
    let mut text = String::new();
    for row in rows {
        for (j, v) in row.iter().enumerate() {
            if j > 0 {
                text.push(' ');
            }
            let _ = write!(text, "{v:.18e}");
        }
        text.push('\n');
    }
    std::fs::write(path, text)?;
    Ok(())
}

/// Parse a whitespace-separated matrix. Returns `(data, rows, cols)`.
pub(crate) fn parse_matrix(text: &str, origin: &str) -> Result<(Vec<f32>, usize, usize)> {
    let mut data = Vec::new();
    let mut rows = 0usize;
    let mut cols = None;
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let before = data.len();
        for tok in line.split_whitespace() {
            let v: f32 = tok.parse().map_err(|_| {
                VocoderError::config(format!("{origin}:{}: invalid number {tok:?}", lineno + 1))
            })?;
            data.push(v);
        }
        let width = data.len() - before;
        match cols {
            None => cols = Some(width),
            Some(c) => ensure_config!(
                c == width,
                "{origin}:{}: row has {width} values, expected {c}",
                lineno + 1
            ),
        }
        rows += 1;
    }
    Ok((data, rows, cols.unwrap_or(0)))
}

fn read_matrix(path: &Path) -> Result<(Vec<f32>, usize, usize)> {
    let text = std::fs::read_to_string(path)?;
    parse_matrix(&text, &path.display().to_string())
}
