//! Concatenation of chunk outputs with globally unique read ids.
//!
//! Reads leave the merge step named `<n><sep><sample>` with `n` counting from
//! 1 over all chunks, so the sample of any read can be recovered from its id
//! alone for the rest of the pipeline.

use crate::io::fastq::{FastxError, SequenceRecordIterator};
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Sequence error: {0}")]
    Fastx(#[from] FastxError),

    #[error("Record {record} of {path} has an empty header")]
    EmptyHeader { path: PathBuf, record: usize },
}

/// Where the sample label of an incoming read comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLabels {
    /// Header is `<sample> <original id>`, as written by barcode splitting.
    Demultiplexed,
    /// Reads were split upstream and named `<sample><sep><n>`.
    PreSplit,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub records: usize,
    /// Reads per sample.
    pub samples: BTreeMap<String, usize>,
}

/// Sample part of a renumbered id: everything after the first separator.
pub fn sample_of(id: &str, separator: char) -> &str {
    id.split_once(separator).map_or(id, |(_, sample)| sample)
}

fn sample_label(header: &str, labels: SampleLabels, separator: char) -> &str {
    let token = header.split_whitespace().next().unwrap_or_default();
    match labels {
        SampleLabels::Demultiplexed => token,
        SampleLabels::PreSplit => match token.rsplit_once(separator) {
            Some((sample, n)) if !sample.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => sample,
            _ => token,
        },
    }
}

/// Merges FASTA chunks in order into `output`, renaming every read to
/// `<n><separator><sample>`.
pub fn merge_and_renumber(
    chunks: &[PathBuf],
    output: &Path,
    separator: char,
    labels: SampleLabels,
) -> Result<MergeReport, MergeError> {
    let mut writer = BufWriter::new(File::create(output)?);
    let mut report = MergeReport::default();

    for chunk in chunks {
        let mut in_chunk = 0;
        for record in SequenceRecordIterator::open(chunk)? {
            let record = record?;
            in_chunk += 1;
            let sample = sample_label(&record.id, labels, separator);
            if sample.is_empty() {
                return Err(MergeError::EmptyHeader {
                    path: chunk.clone(),
                    record: in_chunk,
                });
            }
            report.records += 1;
            *report.samples.entry(sample.to_string()).or_insert(0) += 1;

            writeln!(writer, ">{}{}{}", report.records, separator, sample)?;
            writer.write_all(&record.seq)?;
            writer.write_all(b"\n")?;
        }
        debug!("Merged {} reads from {}", in_chunk, chunk.display());
    }
    writer.flush()?;

    info!(
        "Merged {} reads from {} chunks, {} samples",
        report.records,
        chunks.len(),
        report.samples.len()
    );
    Ok(report)
}
