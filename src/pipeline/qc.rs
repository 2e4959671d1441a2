//! Adaptive quality trimming and fixed-length trimming of read chunks.
//!
//! The quality cutoff is chosen per chunk: every candidate cutoff is tried
//! and the read length distribution of the trimmed result decides whether
//! the cutoff keeps reads long enough. A chunk for which no candidate passes
//! is still trimmed, at the fallback cutoff.

use crate::config::{CutoffScan, LengthTrimConfig, QualityTrimConfig};
use crate::io::fastq::{filter_map_file, SeqFormat, SequenceRecordIterator};
use crate::io::file_size;
use crate::pipeline::external::{remove_stale_output, SequenceKernel};
use crate::pipeline::processor::ProcessingError;
use log::{debug, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Read length distribution of a trimmed sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LengthStats {
    pub sampled: usize,
    pub max_length: usize,
    pub percentile_length: f64,
}

impl LengthStats {
    /// True when the low percentile is at least `fraction` of the longest read.
    pub fn passes(&self, fraction: f64) -> bool {
        self.percentile_length >= fraction * self.max_length as f64
    }
}

/// Percentile of sorted values with linear interpolation between the two
/// closest ranks. `sorted` must not be empty.
pub fn percentile(sorted: &[usize], p: f64) -> f64 {
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let (a, b) = (sorted[lo] as f64, sorted[hi] as f64);
    a + (b - a) * (rank - lo as f64)
}

/// Length statistics over the first `sample_size` records of `path`.
pub fn sample_length_stats(
    path: &Path,
    sample_size: usize,
    p: f64,
) -> Result<LengthStats, ProcessingError> {
    let mut lengths = SequenceRecordIterator::open(path)?
        .take(sample_size)
        .map(|r| r.map(|record| record.len()))
        .collect::<Result<Vec<_>, _>>()?;
    if lengths.is_empty() {
        return Err(ProcessingError::EmptyOutput(path.to_path_buf()));
    }
    lengths.sort_unstable();
    Ok(LengthStats {
        sampled: lengths.len(),
        max_length: lengths[lengths.len() - 1],
        percentile_length: percentile(&lengths, p),
    })
}

/// Terminal state of the cutoff scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CutoffDecision {
    Accepted(u8),
    Fallback,
}

/// Tries the candidate cutoffs in ascending order.
///
/// A candidate whose evaluation fails counts as rejected. With
/// [`CutoffScan::LastAccepted`] every candidate is evaluated and the highest
/// passing one wins; with [`CutoffScan::FirstAccepted`] the scan stops at the
/// first pass.
pub fn scan_cutoffs<F>(config: &QualityTrimConfig, mut evaluate: F) -> CutoffDecision
where
    F: FnMut(u8) -> Result<LengthStats, ProcessingError>,
{
    let mut accepted = None;
    for cutoff in config.min_cutoff..=config.max_cutoff {
        match evaluate(cutoff) {
            Ok(stats) if stats.passes(config.min_length_fraction) => {
                debug!(
                    "Q{} accepted: p{}={:.1}, max={}",
                    cutoff, config.percentile, stats.percentile_length, stats.max_length
                );
                accepted = Some(cutoff);
                if config.scan == CutoffScan::FirstAccepted {
                    break;
                }
            }
            Ok(stats) => debug!(
                "Q{} rejected: p{}={:.1}, max={}",
                cutoff, config.percentile, stats.percentile_length, stats.max_length
            ),
            Err(e) => debug!("Q{} rejected: {}", cutoff, e),
        }
    }
    accepted.map_or(CutoffDecision::Fallback, CutoffDecision::Accepted)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityTrimOutcome {
    pub decision: CutoffDecision,
    /// Cutoff the emitted chunk was trimmed at.
    pub cutoff: u8,
}

fn trial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".trial");
    PathBuf::from(name)
}

/// Chooses a quality cutoff for one chunk and writes the chunk trimmed at it.
///
/// Never fails because no cutoff passed; only a failure of the final trim
/// is an error.
pub fn select_quality_cutoff(
    kernel: &dyn SequenceKernel,
    input: &Path,
    output: &Path,
    ascii_offset: u8,
    config: &QualityTrimConfig,
) -> Result<QualityTrimOutcome, ProcessingError> {
    let trial = trial_path(output);
    let decision = scan_cutoffs(config, |cutoff| {
        remove_stale_output(&trial)?;
        kernel.truncate_quality(input, &trial, cutoff, ascii_offset)?;
        sample_length_stats(&trial, config.sample_size, config.percentile)
    });
    remove_stale_output(&trial)?;

    let cutoff = match decision {
        CutoffDecision::Accepted(q) => q,
        CutoffDecision::Fallback => {
            warn!(
                "No quality cutoff in {}..={} passed for {}; trimming at Q{}",
                config.min_cutoff,
                config.max_cutoff,
                input.display(),
                config.fallback_cutoff
            );
            config.fallback_cutoff
        }
    };
    kernel.truncate_quality(input, output, cutoff, ascii_offset)?;
    Ok(QualityTrimOutcome { decision, cutoff })
}

/// Size accounting of a length-trimmed chunk. The retained fraction is a
/// byte ratio, not a read ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LengthTrimReport {
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub retained_fraction: f64,
}

impl LengthTrimReport {
    pub fn new(input_bytes: u64, output_bytes: u64) -> Self {
        let retained_fraction = if input_bytes == 0 {
            1.0
        } else {
            output_bytes as f64 / input_bytes as f64
        };
        LengthTrimReport {
            input_bytes,
            output_bytes,
            retained_fraction,
        }
    }
}

/// Truncates reads of a chunk to the target length.
///
/// FASTQ goes through the kernel, which also applies the expected-error
/// filter. FASTA has no qualities: reads are cut to length and shorter reads
/// are dropped.
pub fn length_trim(
    kernel: &dyn SequenceKernel,
    input: &Path,
    output: &Path,
    format: SeqFormat,
    config: &LengthTrimConfig,
    ascii_offset: u8,
) -> Result<LengthTrimReport, ProcessingError> {
    match format {
        SeqFormat::Fastq => kernel.truncate_length(
            input,
            output,
            config.target_length,
            config.max_expected_errors,
            ascii_offset,
        )?,
        SeqFormat::Fasta => {
            let length = config.target_length;
            filter_map_file(input, output, SeqFormat::Fasta, |mut record| {
                if record.len() < length {
                    return None;
                }
                record.slice(0, length);
                Some(record)
            })?;
        }
    }

    let report = LengthTrimReport::new(file_size(input), file_size(output));
    debug!(
        "Length trim of {} kept {:.1}% of bytes",
        input.display(),
        report.retained_fraction * 100.0
    );
    Ok(report)
}
