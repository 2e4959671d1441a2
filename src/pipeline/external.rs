//! External tools: read trimming, OTU clustering and reference alignment.
//!
//! Each collaborator sits behind a trait so the pipeline can run against
//! `usearch` in production and against in-process implementations in tests.
//! Every invocation reports failure through `Result`; a tool that exits
//! non-zero or does not produce its output file is an error.

use crate::io::fastq::{filter_map_file, FastxError, SeqFormat};
use crate::pipeline::derep::strip_size_annotation;
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("Expected output {0} was not produced")]
    MissingOutput(PathBuf),

    #[error("No reference database configured for alignment")]
    NoReferenceDatabase,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Sequence error: {0}")]
    Fastx(#[from] FastxError),
}

/// Read trimming used by the quality and length stages.
pub trait SequenceKernel: Send + Sync {
    /// Truncates each read at the first base with quality `<= cutoff`.
    fn truncate_quality(
        &self,
        input: &Path,
        output: &Path,
        cutoff: u8,
        ascii_offset: u8,
    ) -> Result<(), ToolError>;

    /// Truncates reads to `length`, dropping shorter reads and reads whose
    /// expected error count exceeds `max_expected_errors`.
    fn truncate_length(
        &self,
        input: &Path,
        output: &Path,
        length: usize,
        max_expected_errors: f64,
        ascii_offset: u8,
    ) -> Result<(), ToolError>;
}

/// Chimera removal plus OTU clustering of size-annotated uniques.
pub trait OtuClusterer: Send + Sync {
    fn cluster(&self, uniques: &Path, otus: &Path, report: &Path) -> Result<(), ToolError>;
}

/// Search of OTU representatives against a reference database.
pub trait ReferenceAligner: Send + Sync {
    fn align(&self, otus: &Path, report: &Path) -> Result<(), ToolError>;
}

/// The `usearch` command line tool.
#[derive(Debug, Clone)]
pub struct Usearch {
    pub binary: PathBuf,
    pub reference_db: Option<PathBuf>,
    pub identity: f64,
}

impl Usearch {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Usearch {
            binary: binary.into(),
            reference_db: None,
            identity: 0.97,
        }
    }

    pub fn with_reference(mut self, database: impl Into<PathBuf>, identity: f64) -> Self {
        self.reference_db = Some(database.into());
        self.identity = identity;
        self
    }

    fn run(&self, args: &[&OsStr], expected_output: &Path) -> Result<(), ToolError> {
        remove_stale_output(expected_output)?;
        debug!("Running {} {:?}", self.binary.display(), args);
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|source| ToolError::Spawn {
                program: self.binary.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                program: self.binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !expected_output.exists() {
            return Err(ToolError::MissingOutput(expected_output.to_path_buf()));
        }
        Ok(())
    }
}

/// Removes a leftover output so that only a file written by this run counts
/// as produced.
pub fn remove_stale_output(path: &Path) -> Result<(), ToolError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ToolError::Io(e)),
    }
}

impl SequenceKernel for Usearch {
    fn truncate_quality(
        &self,
        input: &Path,
        output: &Path,
        cutoff: u8,
        ascii_offset: u8,
    ) -> Result<(), ToolError> {
        self.run(
            &[
                OsStr::new("-fastq_filter"),
                input.as_os_str(),
                OsStr::new("-fastq_truncqual"),
                OsStr::new(&cutoff.to_string()),
                OsStr::new("-fastq_ascii"),
                OsStr::new(&ascii_offset.to_string()),
                OsStr::new("-fastqout"),
                output.as_os_str(),
            ],
            output,
        )
    }

    fn truncate_length(
        &self,
        input: &Path,
        output: &Path,
        length: usize,
        max_expected_errors: f64,
        ascii_offset: u8,
    ) -> Result<(), ToolError> {
        self.run(
            &[
                OsStr::new("-fastq_filter"),
                input.as_os_str(),
                OsStr::new("-fastq_trunclen"),
                OsStr::new(&length.to_string()),
                OsStr::new("-fastq_maxee"),
                OsStr::new(&max_expected_errors.to_string()),
                OsStr::new("-fastq_ascii"),
                OsStr::new(&ascii_offset.to_string()),
                OsStr::new("-fastqout"),
                output.as_os_str(),
            ],
            output,
        )
    }
}

impl OtuClusterer for Usearch {
    fn cluster(&self, uniques: &Path, otus: &Path, report: &Path) -> Result<(), ToolError> {
        info!("Clustering {} into OTUs", uniques.display());
        self.run(
            &[
                OsStr::new("-cluster_otus"),
                uniques.as_os_str(),
                OsStr::new("-otus"),
                otus.as_os_str(),
                OsStr::new("-sizein"),
                OsStr::new("-uparseout"),
                report.as_os_str(),
            ],
            otus,
        )
    }
}

impl ReferenceAligner for Usearch {
    fn align(&self, otus: &Path, report: &Path) -> Result<(), ToolError> {
        let database = self
            .reference_db
            .as_deref()
            .ok_or(ToolError::NoReferenceDatabase)?;
        info!("Aligning {} against {}", otus.display(), database.display());
        self.run(
            &[
                OsStr::new("-usearch_local"),
                otus.as_os_str(),
                OsStr::new("-db"),
                database.as_os_str(),
                OsStr::new("-strand"),
                OsStr::new("both"),
                OsStr::new("-id"),
                OsStr::new(&self.identity.to_string()),
                OsStr::new("-alnout"),
                report.as_os_str(),
            ],
            report,
        )
    }
}

/// In-process trimming with the same semantics as the `usearch` filters.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeKernel;

fn phred(q: u8, ascii_offset: u8) -> u8 {
    q.saturating_sub(ascii_offset)
}

/// Sum of per-base error probabilities.
pub fn expected_errors(qual: &[u8], ascii_offset: u8) -> f64 {
    qual.iter()
        .map(|&q| 10f64.powf(-(phred(q, ascii_offset) as f64) / 10.0))
        .sum()
}

impl SequenceKernel for NativeKernel {
    fn truncate_quality(
        &self,
        input: &Path,
        output: &Path,
        cutoff: u8,
        ascii_offset: u8,
    ) -> Result<(), ToolError> {
        let (read, written) = filter_map_file(input, output, SeqFormat::Fastq, |mut record| {
            let qual = record.qual.as_deref()?;
            let keep = qual
                .iter()
                .position(|&q| phred(q, ascii_offset) <= cutoff)
                .unwrap_or(qual.len());
            record.slice(0, keep);
            (!record.is_empty()).then_some(record)
        })?;
        debug!("Quality trim Q{}: kept {}/{} reads", cutoff, written, read);
        Ok(())
    }

    fn truncate_length(
        &self,
        input: &Path,
        output: &Path,
        length: usize,
        max_expected_errors: f64,
        ascii_offset: u8,
    ) -> Result<(), ToolError> {
        let (read, written) = filter_map_file(input, output, SeqFormat::Fastq, |mut record| {
            if record.len() < length {
                return None;
            }
            record.slice(0, length);
            let ee = expected_errors(record.qual.as_deref()?, ascii_offset);
            (ee <= max_expected_errors).then_some(record)
        })?;
        debug!("Length trim to {}: kept {}/{} reads", length, written, read);
        Ok(())
    }
}

/// OTU id to the reference id it aligned to.
pub type AlignmentMap = IndexMap<String, String>;

/// Reads a `usearch -alnout` report.
///
/// Each hit starts with a ` Query <len> >id` line followed by a
/// `Target <len> >id` line. Only the first hit of every query is kept;
/// abundance annotations are removed from both ids.
pub fn parse_alignment(path: &Path) -> Result<AlignmentMap, ToolError> {
    let text = fs::read_to_string(path)?;
    let lines: Vec<&str> = text.lines().collect();
    let mut alignment = AlignmentMap::new();

    for (i, &line) in lines.iter().enumerate() {
        if !line.starts_with(" Query") {
            continue;
        }
        let Some(&target_line) = lines.get(i + 1) else {
            warn!("Alignment report {} ends after a query line", path.display());
            break;
        };
        let field = |line: &str| {
            line.split_whitespace()
                .nth(2)
                .map(|f| strip_size_annotation(f.strip_prefix('>').unwrap_or(f)).to_string())
        };
        match (field(line), field(target_line)) {
            (Some(query), Some(target)) => {
                alignment.entry(query).or_insert(target);
            }
            _ => warn!("Skipping malformed alignment at line {} of {}", i + 1, path.display()),
        }
    }
    info!("{} OTUs aligned to the reference database", alignment.len());
    Ok(alignment)
}
