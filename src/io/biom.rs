//! BIOM-style JSON tables of predicted pathway abundances.
//!
//! Only the parts needed for feature generation are read: the row and column
//! ids and the data block, either sparse `[row, col, value]` triples or, with
//! `"matrix_type": "dense"`, one value row per pathway.

use ndarray::Array2;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BiomError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid BIOM JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid BIOM table: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct BiomEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BiomFile {
    rows: Vec<BiomEntry>,
    columns: Vec<BiomEntry>,
    #[serde(default)]
    matrix_type: Option<String>,
    data: Vec<Vec<f64>>,
}

/// Pathway x sample abundance table.
#[derive(Debug, Clone, PartialEq)]
pub struct PathwayTable {
    pub pathways: Vec<String>,
    pub samples: Vec<String>,
    pub values: Array2<f64>,
}

fn as_index(value: f64, bound: usize, what: &str) -> Result<usize, BiomError> {
    if value < 0.0 || value.fract() != 0.0 || value >= bound as f64 {
        return Err(BiomError::Invalid(format!(
            "{} index {} outside 0..{}",
            what, value, bound
        )));
    }
    Ok(value as usize)
}

impl PathwayTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BiomError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| BiomError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, BiomError> {
        Self::from_biom(serde_json::from_str(text)?)
    }

    fn from_biom(biom: BiomFile) -> Result<Self, BiomError> {
        let pathways: Vec<String> = biom.rows.into_iter().map(|r| r.id).collect();
        let samples: Vec<String> = biom.columns.into_iter().map(|c| c.id).collect();
        let mut values = Array2::zeros((pathways.len(), samples.len()));

        let dense = biom
            .matrix_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("dense"));
        if dense {
            if biom.data.len() != pathways.len() {
                return Err(BiomError::Invalid(format!(
                    "{} data rows for {} pathways",
                    biom.data.len(),
                    pathways.len()
                )));
            }
            for (i, row) in biom.data.iter().enumerate() {
                if row.len() != samples.len() {
                    return Err(BiomError::Invalid(format!(
                        "row {} has {} values for {} samples",
                        i,
                        row.len(),
                        samples.len()
                    )));
                }
                for (j, &v) in row.iter().enumerate() {
                    values[[i, j]] = v;
                }
            }
        } else {
            for entry in &biom.data {
                let [row, col, value] = entry[..] else {
                    return Err(BiomError::Invalid(format!(
                        "sparse entry {:?} is not a [row, col, value] triple",
                        entry
                    )));
                };
                let row = as_index(row, pathways.len(), "row")?;
                let col = as_index(col, samples.len(), "column")?;
                values[[row, col]] = value;
            }
        }

        Ok(PathwayTable {
            pathways,
            samples,
            values,
        })
    }

    #[cfg(test)]
    pub fn get(&self, pathway: &str, sample: &str) -> Option<f64> {
        let row = self.pathways.iter().position(|p| p == pathway)?;
        let col = self.samples.iter().position(|s| s == sample)?;
        Some(self.values[[row, col]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sparse_table() {
        let table = PathwayTable::from_json_str(
            r#"{
                "id": "predictions",
                "format": "Biological Observation Matrix 1.0.0",
                "matrix_type": "sparse",
                "shape": [2, 2],
                "rows": [{"id": "K00001", "metadata": {"KEGG_Description": "x"}}, {"id": "K00002", "metadata": null}],
                "columns": [{"id": "S1", "metadata": null}, {"id": "S2"}],
                "data": [[0, 1, 5.5], [1, 0, 2]]
            }"#,
        )
        .unwrap();
        assert_eq!(table.pathways, vec!["K00001", "K00002"]);
        assert_relative_eq!(table.get("K00001", "S2").unwrap(), 5.5);
        assert_relative_eq!(table.get("K00002", "S1").unwrap(), 2.0);
        assert_relative_eq!(table.get("K00001", "S1").unwrap(), 0.0);
    }

    #[test]
    fn test_dense_table() {
        let table = PathwayTable::from_json_str(
            r#"{"matrix_type": "dense", "rows": [{"id": "P1"}], "columns": [{"id": "S1"}, {"id": "S2"}], "data": [[1, 3]]}"#,
        )
        .unwrap();
        assert_relative_eq!(table.get("P1", "S2").unwrap(), 3.0);
    }

    #[test]
    fn test_rejects_bad_indices() {
        let out_of_range = r#"{"rows": [{"id": "P1"}], "columns": [{"id": "S1"}], "data": [[0, 1, 1.0]]}"#;
        assert!(matches!(
            PathwayTable::from_json_str(out_of_range),
            Err(BiomError::Invalid(_))
        ));
        let fractional = r#"{"rows": [{"id": "P1"}], "columns": [{"id": "S1"}], "data": [[0.5, 0, 1.0]]}"#;
        assert!(PathwayTable::from_json_str(fractional).is_err());
        let short = r#"{"rows": [{"id": "P1"}], "columns": [{"id": "S1"}], "data": [[0, 0]]}"#;
        assert!(PathwayTable::from_json_str(short).is_err());
    }
}
