//! Weight providers: a name -> tensor lookup with shape validation.
//!
//! The vocoder never reaches into a checkpoint directly. Every layer asks a
//! [`WeightProvider`] for a canonical parameter name (`rnn1.weight_ih_l0`,
//! `upsample.resnet.conv_in.weight`, ...) and checks the returned shape
//! against its declared dimensions before anything is computed.

use std::collections::HashMap;
use std::path::Path;

use memmap2::MmapOptions;
use safetensors::tensor::{Dtype, SafeTensorError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct TensorF32 {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorF32 {
    #[must_use]
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        let n = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; n],
        }
    }

    #[must_use]
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Shape with all size-1 axes removed.
    #[must_use]
    pub fn squeezed_shape(&self) -> Vec<usize> {
        squeeze(&self.shape)
    }

    /// Shape equality modulo size-1 axes, so `[out, in, 1]` matches `[out, in]`.
    #[must_use]
    pub fn matches_shape(&self, expected: &[usize]) -> bool {
        self.squeezed_shape() == squeeze(expected)
    }
}

fn squeeze(shape: &[usize]) -> Vec<usize> {
    shape.iter().copied().filter(|&d| d != 1).collect()
}

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("safetensors error: {0}")]
    SafeTensors(SafeTensorError),
    #[error("missing tensor: {name}")]
    Missing { name: String },
    #[error("tensor {name} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },
    #[error("invalid tensor byte length for {name}: got {bytes}, expected multiple of {elem_size}")]
    InvalidByteLen {
        name: String,
        bytes: usize,
        elem_size: usize,
    },
    #[error("malformed parameter text for {name}: {detail}")]
    Parse { name: String, detail: String },
}

impl From<SafeTensorError> for WeightError {
    fn from(err: SafeTensorError) -> Self {
        match err {
            SafeTensorError::TensorNotFound(name) => Self::Missing { name },
            other => Self::SafeTensors(other),
        }
    }
}

/// Source of named parameter tensors.
pub trait WeightProvider {
    fn tensor(&self, name: &str) -> Result<TensorF32, WeightError>;

    /// `Ok(false)` only when the tensor is absent; unreadable stores are errors.
    fn contains(&self, name: &str) -> Result<bool, WeightError> {
        match self.tensor(name) {
            Ok(_) => Ok(true),
            Err(WeightError::Missing { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fetch `name` and check it against `expected` (size-1 axes ignored).
    fn tensor_shaped(&self, name: &str, expected: &[usize]) -> Result<TensorF32, WeightError> {
        let t = self.tensor(name)?;
        if !t.matches_shape(expected) {
            return Err(WeightError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: t.shape,
            });
        }
        Ok(t)
    }
}

/// Memory-mapped safetensors checkpoint.
#[derive(Debug)]
pub struct WeightStore {
    mmap: memmap2::Mmap,
}

impl WeightStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WeightError> {
        let file = std::fs::File::open(path)?;
        // SAFETY: read-only file mapping for immutable tensor access.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self { mmap })
    }

    pub fn names(&self) -> Result<Vec<String>, WeightError> {
        let st = safetensors::SafeTensors::deserialize(&self.mmap)?;
        Ok(st.iter().map(|(name, _)| name.to_string()).collect())
    }

    pub fn tensor_f32(&self, name: &str) -> Result<TensorF32, WeightError> {
        let st = safetensors::SafeTensors::deserialize(&self.mmap)?;
        let tv = st.tensor(name)?;
        let shape = tv.shape().to_vec();
        let data = decode_f32(name, tv.dtype(), tv.data())?;
        Ok(TensorF32 { shape, data })
    }
}

impl WeightProvider for WeightStore {
    fn tensor(&self, name: &str) -> Result<TensorF32, WeightError> {
        self.tensor_f32(name)
    }

    fn contains(&self, name: &str) -> Result<bool, WeightError> {
        let st = safetensors::SafeTensors::deserialize(&self.mmap)?;
        Ok(st.tensor(name).is_ok())
    }
}

fn decode_f32(name: &str, dtype: Dtype, raw: &[u8]) -> Result<Vec<f32>, WeightError> {
    let elem_size = match dtype {
        Dtype::F32 => 4,
        Dtype::BF16 => 2,
        Dtype::F64 => 8,
        other => {
            return Err(WeightError::UnsupportedDtype {
                name: name.to_string(),
                dtype: other,
            });
        }
    };
    if raw.len() % elem_size != 0 {
        return Err(WeightError::InvalidByteLen {
            name: name.to_string(),
            bytes: raw.len(),
            elem_size,
        });
    }

    let data = match dtype {
        Dtype::F32 => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::BF16 => raw
            .chunks_exact(2)
            .map(|c| {
                let bits = u16::from_le_bytes([c[0], c[1]]) as u32;
                f32::from_bits(bits << 16)
            })
            .collect(),
        _ => raw
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b) as f32
            })
            .collect(),
    };
    Ok(data)
}

/// In-memory parameter table.
#[derive(Debug, Clone, Default)]
pub struct WeightMap {
    tensors: HashMap<String, TensorF32>,
}

impl WeightMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: TensorF32) -> Option<TensorF32> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<TensorF32> {
        self.tensors.remove(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TensorF32> {
        self.tensors.get_mut(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

impl WeightProvider for WeightMap {
    fn tensor(&self, name: &str) -> Result<TensorF32, WeightError> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| WeightError::Missing {
                name: name.to_string(),
            })
    }

    fn contains(&self, name: &str) -> Result<bool, WeightError> {
        Ok(self.tensors.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use safetensors::tensor::{Dtype, View, serialize_to_file};

    use super::{TensorF32, WeightError, WeightMap, WeightProvider, WeightStore};

    #[derive(Debug, Clone)]
    struct TestTensor {
        dtype: Dtype,
        shape: Vec<usize>,
        data: Vec<u8>,
    }

    impl View for TestTensor {
        fn dtype(&self) -> Dtype {
            self.dtype
        }

        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn data(&self) -> Cow<'_, [u8]> {
            Cow::Borrowed(&self.data)
        }

        fn data_len(&self) -> usize {
            self.data.len()
        }
    }

    fn tmp_file(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("wavernn-weights-test-{name}-{nanos}.safetensors"));
        p
    }

    #[test]
    fn loads_f32_bf16_and_f64_tensors() {
        let f32_data = vec![1.0f32, 2.5, -3.0, 4.25];
        let mut f32_bytes = Vec::with_capacity(f32_data.len() * 4);
        for v in &f32_data {
            f32_bytes.extend_from_slice(&v.to_le_bytes());
        }

        // BF16 for [1.0, -2.0] -> [0x3f80, 0xc000]
        let bf16_words = [0x3f80u16, 0xc000u16];
        let mut bf16_bytes = Vec::with_capacity(bf16_words.len() * 2);
        for &w in &bf16_words {
            bf16_bytes.extend_from_slice(&w.to_le_bytes());
        }

        let f64_bytes: Vec<u8> = [0.5f64, -0.25]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        let tensors = vec![
            (
                "a".to_string(),
                TestTensor {
                    dtype: Dtype::F32,
                    shape: vec![2, 2],
                    data: f32_bytes,
                },
            ),
            (
                "b".to_string(),
                TestTensor {
                    dtype: Dtype::BF16,
                    shape: vec![2],
                    data: bf16_bytes,
                },
            ),
            (
                "c".to_string(),
                TestTensor {
                    dtype: Dtype::F64,
                    shape: vec![2, 1],
                    data: f64_bytes,
                },
            ),
        ];

        let path = tmp_file("basic");
        serialize_to_file(tensors, &None, &path).expect("serialize safetensors");

        let ws = WeightStore::open(&path).expect("open");
        let names = ws.names().expect("names");
        assert!(names.iter().any(|n| n == "a"));
        assert!(names.iter().any(|n| n == "b"));
        assert!(ws.contains("c").expect("contains"));
        assert!(!ws.contains("d").expect("contains"));

        let a = ws.tensor_f32("a").expect("tensor a");
        assert_eq!(a.shape, vec![2, 2]);
        assert_eq!(a.data, f32_data);

        let b = ws.tensor_f32("b").expect("tensor b");
        assert_eq!(b.shape, vec![2]);
        assert!((b.data[0] - 1.0).abs() < 1e-6);
        assert!((b.data[1] + 2.0).abs() < 1e-6);

        let c = ws.tensor_shaped("c", &[2]).expect("tensor c squeezed");
        assert_eq!(c.data, vec![0.5, -0.25]);

        match ws.tensor("d") {
            Err(WeightError::Missing { name }) => assert_eq!(name, "d"),
            other => panic!("expected missing tensor, got {other:?}"),
        }

        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn unreadable_header_is_not_a_missing_tensor() {
        let header = b"{not json at all";
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header);
        let path = tmp_file("corrupt");
        std::fs::write(&path, bytes).expect("write");

        let ws = WeightStore::open(&path).expect("open");
        assert!(matches!(ws.contains("a"), Err(WeightError::SafeTensors(_))));
        assert!(matches!(ws.tensor("a"), Err(WeightError::SafeTensors(_))));

        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn shape_check_ignores_unit_axes_only() {
        let mut map = WeightMap::new();
        map.insert("conv", TensorF32::zeros(&[4, 3, 1]));

        assert!(map.tensor_shaped("conv", &[4, 3]).is_ok());
        assert!(map.tensor_shaped("conv", &[1, 4, 3, 1]).is_ok());
        match map.tensor_shaped("conv", &[3, 4]) {
            Err(WeightError::ShapeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, vec![3, 4]);
                assert_eq!(actual, vec![4, 3, 1]);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }
}
