//! Per-chunk transformations run by [`crate::utils::StageRunner`].
//!
//! Every stage reads one chunk file and writes one output file; none of them
//! touches its input.

use crate::bio::{is_iupac_code, prefix_mismatches};
use crate::config::{LengthTrimConfig, QualityTrimConfig};
use crate::io::fastq::{filter_map_file, SeqFormat, SequenceRecord};
use crate::pipeline::external::SequenceKernel;
use crate::pipeline::processor::ProcessingError;
use crate::pipeline::qc::{length_trim, select_quality_cutoff, LengthTrimReport, QualityTrimOutcome};
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// A transformation applied independently to every chunk.
pub trait ChunkStage: Send + Sync {
    fn name(&self) -> &str;

    /// Appended to the input file name to form the output file name.
    fn suffix(&self) -> &str;

    fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessingError>;
}

/// Where the barcode of a read is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarcodeMode {
    /// Leading bases of the read; removed after matching.
    Inline,
    /// Last `:`-separated field of the header.
    Header,
}

impl FromStr for BarcodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "inline" => Ok(BarcodeMode::Inline),
            "2" | "header" => Ok(BarcodeMode::Header),
            other => Err(format!("unknown barcode mode '{}' (expected 1/inline or 2/header)", other)),
        }
    }
}

fn invalid(path: &Path, reason: String) -> ProcessingError {
    ProcessingError::InvalidInput {
        path: path.to_path_buf(),
        reason,
    }
}

fn parse_sequence(path: &Path, line_no: usize, text: &str) -> Result<Vec<u8>, ProcessingError> {
    let seq = text.trim().to_ascii_uppercase().into_bytes();
    if seq.is_empty() || !seq.iter().all(|&b| is_iupac_code(b)) {
        return Err(invalid(
            path,
            format!("line {}: '{}' is not a nucleotide sequence", line_no, text.trim()),
        ));
    }
    Ok(seq)
}

/// Non-blank, non-comment lines with their 1-based line numbers.
fn content_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end()))
        .filter(|(_, l)| !l.trim().is_empty() && !l.starts_with('#'))
}

/// Barcode sequence to sample label.
#[derive(Debug, Clone, Default)]
pub struct BarcodeMap {
    entries: Vec<(Vec<u8>, String)>,
}

impl BarcodeMap {
    /// Reads `BARCODE\tSAMPLE` lines.
    pub fn load(path: &Path) -> Result<Self, ProcessingError> {
        let text = fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for (line_no, line) in content_lines(&text) {
            let mut fields = line.split('\t');
            let (Some(barcode), Some(sample)) = (fields.next(), fields.next()) else {
                return Err(invalid(path, format!("line {}: expected BARCODE<TAB>SAMPLE", line_no)));
            };
            let sample = sample.trim();
            if sample.is_empty() {
                return Err(invalid(path, format!("line {}: empty sample label", line_no)));
            }
            if sample.contains(char::is_whitespace) {
                return Err(invalid(
                    path,
                    format!("line {}: sample label '{}' contains whitespace", line_no, sample),
                ));
            }
            entries.push((parse_sequence(path, line_no, barcode)?, sample.to_string()));
        }
        let map = Self::from_entries(entries);
        if map.is_empty() {
            return Err(invalid(path, "no barcodes defined".to_string()));
        }
        debug!("Loaded {} barcodes from {}", map.len(), path.display());
        Ok(map)
    }

    pub fn from_entries(entries: Vec<(Vec<u8>, String)>) -> Self {
        BarcodeMap { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The barcode with the fewest mismatches against the start of `read`,
    /// the longer one among equally good matches. Ties and reads without any
    /// barcode within `max_mismatches` yield `None`.
    pub fn best_match(&self, read: &[u8], max_mismatches: usize) -> Option<(&[u8], &str)> {
        best_unique(
            self.entries
                .iter()
                .map(|(barcode, sample)| (barcode.as_slice(), sample.as_str())),
            read,
            max_mismatches,
        )
    }
}

fn best_unique<'a, T>(
    candidates: impl Iterator<Item = (&'a [u8], T)>,
    read: &[u8],
    max_mismatches: usize,
) -> Option<(&'a [u8], T)> {
    let mut best: Option<(usize, &'a [u8], T)> = None;
    let mut tied = false;
    for (pattern, value) in candidates {
        let Some(mismatches) = prefix_mismatches(pattern, read, max_mismatches) else {
            continue;
        };
        // Fewer mismatches first, then the longer pattern.
        let rank = (mismatches, std::cmp::Reverse(pattern.len()));
        let current = best.as_ref().map(|(m, p, _)| (*m, std::cmp::Reverse(p.len())));
        match current {
            Some(c) if rank > c => {}
            Some(c) if rank == c => tied = true,
            _ => {
                best = Some((mismatches, pattern, value));
                tied = false;
            }
        }
    }
    if tied {
        return None;
    }
    best.map(|(_, pattern, value)| (pattern, value))
}

/// Assigns reads to samples by barcode (`.sb`).
#[derive(Debug)]
pub struct BarcodeSplitStage {
    pub barcodes: BarcodeMap,
    pub mode: BarcodeMode,
    pub max_mismatches: usize,
    pub format: SeqFormat,
}

impl BarcodeSplitStage {
    fn demultiplex(&self, mut record: SequenceRecord) -> Option<SequenceRecord> {
        let sample = match self.mode {
            BarcodeMode::Inline => {
                let (barcode, sample) = self.barcodes.best_match(&record.seq, self.max_mismatches)?;
                let (barcode_len, sample) = (barcode.len(), sample.to_string());
                let end = record.len();
                record.slice(barcode_len, end);
                sample
            }
            BarcodeMode::Header => {
                let first = record.id.split_whitespace().next().unwrap_or("");
                let tag = first.rsplit(':').next().unwrap_or("").as_bytes();
                let (barcode, sample) = self.barcodes.best_match(tag, self.max_mismatches)?;
                if barcode.len() != tag.len() {
                    return None;
                }
                sample.to_string()
            }
        };
        record.id = format!("{} {}", sample, record.id);
        Some(record)
    }
}

impl ChunkStage for BarcodeSplitStage {
    fn name(&self) -> &str {
        "barcode demultiplexing"
    }

    fn suffix(&self) -> &str {
        "sb"
    }

    fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessingError> {
        let (read, written) = filter_map_file(input, output, self.format, |r| self.demultiplex(r))?;
        debug!("{}: {}/{} reads assigned to a sample", input.display(), written, read);
        Ok(())
    }
}

/// A named amplification primer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Primer {
    pub name: String,
    pub sequence: Vec<u8>,
}

/// Reads a primers file: `NAME\tSEQUENCE` or a bare sequence per line.
pub fn load_primers(path: &Path) -> Result<Vec<Primer>, ProcessingError> {
    let text = fs::read_to_string(path)?;
    let mut primers = Vec::new();
    for (line_no, line) in content_lines(&text) {
        let (name, seq) = match line.split_once('\t') {
            Some((name, seq)) => (name.trim().to_string(), seq),
            None => (format!("primer{}", primers.len() + 1), line),
        };
        primers.push(Primer {
            name,
            sequence: parse_sequence(path, line_no, seq)?,
        });
    }
    if primers.is_empty() {
        return Err(invalid(path, "no primers defined".to_string()));
    }
    Ok(primers)
}

/// Removes the leading primer of each read (`.pt`).
#[derive(Debug)]
pub struct PrimerTrimStage {
    pub primers: Vec<Primer>,
    pub max_mismatches: usize,
    pub format: SeqFormat,
}

impl ChunkStage for PrimerTrimStage {
    fn name(&self) -> &str {
        "primer removal"
    }

    fn suffix(&self) -> &str {
        "pt"
    }

    fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessingError> {
        let (read, written) = filter_map_file(input, output, self.format, |mut record| {
            let candidates = self.primers.iter().map(|p| (p.sequence.as_slice(), ()));
            let (primer, _) = best_unique(candidates, &record.seq, self.max_mismatches)?;
            let (start, end) = (primer.len(), record.len());
            record.slice(start, end);
            (!record.is_empty()).then_some(record)
        })?;
        debug!("{}: primer found in {}/{} reads", input.display(), written, read);
        Ok(())
    }
}

/// Adaptive quality trimming of FASTQ chunks (`.qt`).
pub struct QualityTrimStage {
    kernel: Arc<dyn SequenceKernel>,
    ascii_offset: u8,
    config: QualityTrimConfig,
    outcomes: Mutex<BTreeMap<PathBuf, QualityTrimOutcome>>,
}

impl QualityTrimStage {
    pub fn new(kernel: Arc<dyn SequenceKernel>, ascii_offset: u8, config: QualityTrimConfig) -> Self {
        QualityTrimStage {
            kernel,
            ascii_offset,
            config,
            outcomes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Cutoff decisions per input chunk, in chunk order.
    pub fn outcomes(&self) -> Result<Vec<QualityTrimOutcome>, ProcessingError> {
        Ok(self.outcomes.lock()?.values().copied().collect())
    }
}

impl ChunkStage for QualityTrimStage {
    fn name(&self) -> &str {
        "quality trimming"
    }

    fn suffix(&self) -> &str {
        "qt"
    }

    fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessingError> {
        let outcome = select_quality_cutoff(self.kernel.as_ref(), input, output, self.ascii_offset, &self.config)?;
        info!("{}: quality trimmed at Q{}", input.display(), outcome.cutoff);
        self.outcomes.lock()?.insert(input.to_path_buf(), outcome);
        Ok(())
    }
}

/// Fixed-length truncation (`.lt`).
pub struct LengthTrimStage {
    kernel: Arc<dyn SequenceKernel>,
    format: SeqFormat,
    ascii_offset: u8,
    config: LengthTrimConfig,
    reports: Mutex<BTreeMap<PathBuf, LengthTrimReport>>,
}

impl LengthTrimStage {
    pub fn new(
        kernel: Arc<dyn SequenceKernel>,
        format: SeqFormat,
        ascii_offset: u8,
        config: LengthTrimConfig,
    ) -> Self {
        LengthTrimStage {
            kernel,
            format,
            ascii_offset,
            config,
            reports: Mutex::new(BTreeMap::new()),
        }
    }

    /// Size accounting per input chunk, in chunk order.
    pub fn reports(&self) -> Result<Vec<LengthTrimReport>, ProcessingError> {
        Ok(self.reports.lock()?.values().copied().collect())
    }
}

impl ChunkStage for LengthTrimStage {
    fn name(&self) -> &str {
        "length trimming"
    }

    fn suffix(&self) -> &str {
        "lt"
    }

    fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessingError> {
        let report = length_trim(
            self.kernel.as_ref(),
            input,
            output,
            self.format,
            &self.config,
            self.ascii_offset,
        )?;
        self.reports.lock()?.insert(input.to_path_buf(), report);
        Ok(())
    }
}

/// FASTQ to single-line FASTA (`.fasta`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FastaConversionStage;

impl ChunkStage for FastaConversionStage {
    fn name(&self) -> &str {
        "FASTA conversion"
    }

    fn suffix(&self) -> &str {
        "fasta"
    }

    fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessingError> {
        filter_map_file(input, output, SeqFormat::Fasta, Some)?;
        Ok(())
    }
}
