//! Pipeline configuration.
//!
//! Every tunable of the pipeline lives here with the defaults of the
//! reference 16S workflow. A JSON file may override any subset of fields;
//! missing fields keep their defaults.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub quality: QualityTrimConfig,
    pub length: LengthTrimConfig,
    pub demux: DemuxConfig,
    pub otu: OtuConfig,
    pub tools: ToolConfig,
    /// Worker threads per stage; `None` uses every available CPU.
    pub threads: Option<usize>,
}

/// Chunk size heuristic: small inputs get smaller chunks for parallelism.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub size_threshold_bytes: u64,
    pub small_chunk_lines: usize,
    pub large_chunk_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            size_threshold_bytes: 200_000_000,
            small_chunk_lines: 100_000,
            large_chunk_lines: 1_000_000,
        }
    }
}

/// How the quality cutoff scan picks among passing candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffScan {
    /// Evaluate every candidate; the highest passing cutoff wins.
    LastAccepted,
    /// Stop at the first passing cutoff.
    FirstAccepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityTrimConfig {
    pub min_cutoff: u8,
    pub max_cutoff: u8,
    pub fallback_cutoff: u8,
    /// Leading records sampled for length statistics.
    pub sample_size: usize,
    /// Percentile of read length compared against the longest read.
    pub percentile: f64,
    /// A cutoff passes when `percentile length >= min_length_fraction * max length`.
    pub min_length_fraction: f64,
    pub scan: CutoffScan,
}

impl Default for QualityTrimConfig {
    fn default() -> Self {
        QualityTrimConfig {
            min_cutoff: 5,
            max_cutoff: 10,
            fallback_cutoff: 5,
            sample_size: 100_000,
            percentile: 5.0,
            min_length_fraction: 0.8,
            scan: CutoffScan::LastAccepted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LengthTrimConfig {
    pub target_length: usize,
    pub max_expected_errors: f64,
}

impl Default for LengthTrimConfig {
    fn default() -> Self {
        LengthTrimConfig {
            target_length: 101,
            max_expected_errors: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    pub barcode_mismatches: usize,
    pub primer_mismatches: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        DemuxConfig {
            barcode_mismatches: 1,
            primer_mismatches: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtuConfig {
    /// Joins the running record number and the sample label unless the
    /// summary sets `BARCODES_SEPARATOR`.
    pub id_separator: char,
    /// Minimum identity for a reference match.
    pub reference_identity: f64,
    /// Reference database searched for closed-reference ids; no alignment
    /// (and no closed-reference table) when unset.
    pub reference_database: Option<PathBuf>,
}

impl Default for OtuConfig {
    fn default() -> Self {
        OtuConfig {
            id_separator: '_',
            reference_identity: 0.97,
            reference_database: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    /// Shell out to usearch for trimming.
    Usearch,
    /// Trim in-process.
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub usearch_binary: PathBuf,
    pub kernel: KernelKind,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            usearch_binary: PathBuf::from("usearch8"),
            kernel: KernelKind::Usearch,
        }
    }
}

impl PipelineConfig {
    /// Loads a JSON config file; absent fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for lines in [self.chunking.small_chunk_lines, self.chunking.large_chunk_lines] {
            if lines == 0 || lines % 4 != 0 {
                return invalid(format!(
                    "chunk line counts must be positive multiples of 4, got {}",
                    lines
                ));
            }
        }
        let q = &self.quality;
        if q.min_cutoff > q.max_cutoff {
            return invalid(format!(
                "quality cutoff range {}..={} is empty",
                q.min_cutoff, q.max_cutoff
            ));
        }
        if q.sample_size == 0 {
            return invalid("quality sample_size must be positive".to_string());
        }
        if !(0.0..=100.0).contains(&q.percentile) {
            return invalid(format!("percentile {} outside 0..=100", q.percentile));
        }
        if !(q.min_length_fraction > 0.0 && q.min_length_fraction <= 1.0) {
            return invalid(format!(
                "min_length_fraction {} outside (0, 1]",
                q.min_length_fraction
            ));
        }
        if self.length.target_length == 0 {
            return invalid("target_length must be positive".to_string());
        }
        if self.length.max_expected_errors < 0.0 {
            return invalid("max_expected_errors must not be negative".to_string());
        }
        validate_separator(self.otu.id_separator)?;
        if !(0.0..=1.0).contains(&self.otu.reference_identity) {
            return invalid(format!(
                "reference_identity {} outside 0..=1",
                self.otu.reference_identity
            ));
        }
        if self.threads == Some(0) {
            return invalid("threads must be positive".to_string());
        }
        Ok(())
    }
}

/// The id separator must not be confused with the record number or a
/// header word boundary.
pub fn validate_separator(separator: char) -> Result<(), ConfigError> {
    if separator.is_ascii_digit() || separator.is_whitespace() || separator == ';' {
        return Err(ConfigError::Invalid(format!(
            "'{}' cannot be used as an id separator",
            separator
        )));
    }
    Ok(())
}
