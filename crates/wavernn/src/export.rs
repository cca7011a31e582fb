//! Portable text dump of decoder parameters as C array literals.
//!
//! Each parameter becomes `<ident>.txt` where `<ident>` is the canonical name
//! with `.` replaced by `_`:
//!
//! ```text
//! static const double fc3_bias[512] = {0.01, -0.2, ...};
//! static const double fc3_weight[512][512] = {{...}, {...}, ...};
//! ```
//!
//! Values are written with the shortest representation that round-trips to
//! the same `f32`. [`TextParams`] reads the same files back as a
//! [`WeightProvider`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::weights::{TensorF32, WeightError, WeightProvider};

/// C identifier for a canonical parameter name.
#[must_use]
pub fn c_ident(name: &str) -> String {
    name.replace('.', "_")
}

/// Render one tensor (size-1 axes dropped; at most 2D) as a C array literal.
pub fn render_c_array(name: &str, tensor: &TensorF32) -> Result<String, WeightError> {
    let ident = c_ident(name);
    let dims = tensor.squeezed_shape();
    let mut out = String::with_capacity(tensor.numel() * 12 + 64);
    match dims.as_slice() {
        [] | [_] => {
            let _ = write!(out, "static const double {ident}[{}] = ", tensor.numel());
            push_row(&mut out, &tensor.data);
        }
        [rows, cols] => {
            let _ = write!(out, "static const double {ident}[{rows}][{cols}] = {{");
            for (r, row) in tensor.data.chunks_exact(*cols).enumerate() {
                if r > 0 {
                    out.push_str(", ");
                }
                push_row(&mut out, row);
            }
            out.push('}');
        }
        _ => {
            return Err(WeightError::Parse {
                name: name.to_string(),
                detail: format!("cannot render {}D tensor {:?}", dims.len(), tensor.shape),
            });
        }
    }
    out.push(';');
    Ok(out)
}

fn push_row(out: &mut String, row: &[f32]) {
    out.push('{');
    for (i, v) in row.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{v}");
    }
    out.push('}');
}

/// Write `<ident>.txt` for every name in `names`.
pub fn export_dir(
    provider: &dyn WeightProvider,
    names: &[String],
    dir: impl AsRef<Path>,
) -> Result<usize, WeightError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    for name in names {
        let tensor = provider.tensor(name)?;
        let text = render_c_array(name, &tensor)?;
        std::fs::write(dir.join(format!("{}.txt", c_ident(name))), text)?;
    }
    Ok(names.len())
}

/// Parse one `static const double ident[..][..] = {...};` literal.
pub fn parse_c_array(text: &str) -> Result<(String, TensorF32), WeightError> {
    let parse_err = |detail: &str| WeightError::Parse {
        name: text.chars().take(48).collect(),
        detail: detail.to_string(),
    };

    let (decl, body) = text.split_once('=').ok_or_else(|| parse_err("missing '='"))?;
    let open = decl.find('[').ok_or_else(|| parse_err("missing dimensions"))?;
    let ident = decl[..open]
        .split_whitespace()
        .last()
        .ok_or_else(|| parse_err("missing identifier"))?
        .to_string();

    let shape = decl[open..]
        .split(|c| c == '[' || c == ']')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| parse_err("invalid dimension"))?;

    let data = body
        .split(|c: char| c == '{' || c == '}' || c == ',' || c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::parse::<f32>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| parse_err("invalid number"))?;

    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(WeightError::Parse {
            name: ident,
            detail: format!("{} values for shape {shape:?}", data.len()),
        });
    }
    Ok((ident, TensorF32::new(shape, data)))
}

/// Parameters loaded from a directory of `<ident>.txt` literals.
#[derive(Debug, Clone, Default)]
pub struct TextParams {
    by_ident: HashMap<String, TensorF32>,
}

impl TextParams {
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, WeightError> {
        let mut by_ident = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            let (ident, tensor) = parse_c_array(&text)?;
            by_ident.insert(ident, tensor);
        }
        Ok(Self { by_ident })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ident.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ident.is_empty()
    }
}

impl WeightProvider for TextParams {
    fn tensor(&self, name: &str) -> Result<TensorF32, WeightError> {
        self.by_ident
            .get(&c_ident(name))
            .cloned()
            .ok_or_else(|| WeightError::Missing {
                name: name.to_string(),
            })
    }

    fn contains(&self, name: &str) -> Result<bool, WeightError> {
        Ok(self.by_ident.contains_key(&c_ident(name)))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{TextParams, export_dir, parse_c_array, render_c_array};
    use crate::weights::{TensorF32, WeightMap, WeightProvider};

    #[test]
    fn renders_vectors_and_matrices() {
        let v = TensorF32::from_vec(vec![0.5, -1.0, 3.0]);
        assert_eq!(
            render_c_array("fc3.bias", &v).expect("render"),
            "static const double fc3_bias[3] = {0.5, -1, 3};"
        );

        let m = TensorF32::new(vec![2, 2, 1], vec![1.0, 0.25, -2.0, 0.0]);
        assert_eq!(
            render_c_array("rnn1.weight_hh_l0", &m).expect("render"),
            "static const double rnn1_weight_hh_l0[2][2] = {{1, 0.25}, {-2, 0}};"
        );

        assert!(render_c_array("x", &TensorF32::zeros(&[2, 2, 2])).is_err());
    }

    #[test]
    fn parses_python_style_literals() {
        let (ident, t) =
            parse_c_array("static const double I_b[2] = {0.10000000149011612, -3e-05};")
                .expect("parse");
        assert_eq!(ident, "I_b");
        assert_eq!(t.shape, vec![2]);
        assert_eq!(t.data, vec![0.1f32, -3e-5]);

        assert!(parse_c_array("static const double w[2][2] = {{1, 2}, {3}};").is_err());
    }

    #[test]
    fn exported_dir_serves_canonical_names() {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        dir.push(format!("wavernn-export-test-{nanos}"));

        let mut map = WeightMap::new();
        let w = TensorF32::new(vec![2, 3], vec![0.1, 0.2, 0.3, -0.4, 1e-7, 6.0]);
        map.insert("fc1.weight", w.clone());
        map.insert("fc1.bias", TensorF32::from_vec(vec![7.0, -8.5]));

        let names = vec!["fc1.weight".to_string(), "fc1.bias".to_string()];
        assert_eq!(export_dir(&map, &names, &dir).expect("export"), 2);

        let params = TextParams::load_dir(&dir).expect("load");
        assert_eq!(params.len(), 2);
        assert_eq!(params.tensor("fc1.weight").expect("weight"), w);
        assert!(params.contains("fc1.bias").expect("contains"));
        assert!(!params.contains("fc2.bias").expect("contains"));

        let dir: PathBuf = dir;
        std::fs::remove_dir_all(dir).expect("cleanup");
    }
}
