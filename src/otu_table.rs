//! OTU x sample count tables.
//!
//! Rows are OTU (or reference) ids, columns are sample ids, cells are read
//! counts. Tables are dense: an OTU with zero reads in every sample keeps its
//! row.

use crate::io::fastq::{FastxError, SequenceRecordIterator};
use crate::pipeline::derep::{strip_size_annotation, DereplicationMap};
use crate::pipeline::external::AlignmentMap;
use crate::pipeline::merge::sample_of;
use indexmap::IndexMap;
use log::{debug, info};
use ndarray::{Array2, Axis};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Sequence error: {0}")]
    Fastx(#[from] FastxError),

    #[error("Duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    #[error("OTU '{0}' is not a representative of the dereplication map")]
    UnknownRepresentative(String),

    #[error("Count matrix is {found:?} but ids describe {expected:?}")]
    Shape {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Invalid table {path} at row {row}: {reason}")]
    Parse {
        path: PathBuf,
        row: usize,
        reason: String,
    },
}

/// Header cell of the id column in the classic text format.
pub const OTU_ID_HEADER: &str = "OTU_ID";

/// A dense OTU x sample count table.
#[derive(Debug, Clone, PartialEq)]
pub struct OtuTable {
    counts: Array2<u64>,
    otu_ids: Vec<String>,
    sample_ids: Vec<String>,
}

fn check_unique(kind: &'static str, ids: &[String]) -> Result<(), TableError> {
    let mut seen = HashSet::with_capacity(ids.len());
    match ids.iter().find(|id| !seen.insert(id.as_str())) {
        Some(id) => Err(TableError::DuplicateId {
            kind,
            id: id.clone(),
        }),
        None => Ok(()),
    }
}

impl OtuTable {
    pub fn new(
        otu_ids: Vec<String>,
        sample_ids: Vec<String>,
        counts: Array2<u64>,
    ) -> Result<Self, TableError> {
        let expected = (otu_ids.len(), sample_ids.len());
        if counts.dim() != expected {
            return Err(TableError::Shape {
                expected,
                found: counts.dim(),
            });
        }
        check_unique("OTU", &otu_ids)?;
        check_unique("sample", &sample_ids)?;
        Ok(OtuTable {
            counts,
            otu_ids,
            sample_ids,
        })
    }

    /// Returns the dimensions of the table (OTUs, samples).
    pub fn dimensions(&self) -> (usize, usize) {
        self.counts.dim()
    }

    pub fn is_empty(&self) -> bool {
        self.otu_ids.is_empty()
    }

    pub fn counts(&self) -> &Array2<u64> {
        &self.counts
    }

    pub fn otu_ids(&self) -> &[String] {
        &self.otu_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    #[cfg(test)]
    pub fn get(&self, otu: &str, sample: &str) -> Option<u64> {
        let row = self.otu_ids.iter().position(|id| id == otu)?;
        let col = self.sample_ids.iter().position(|id| id == sample)?;
        Some(self.counts[[row, col]])
    }

    /// Per-sample totals, in column order.
    pub fn column_sums(&self) -> Vec<u64> {
        self.counts.sum_axis(Axis(0)).to_vec()
    }

    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    /// Per-sample relative abundances: each column divided by its sum.
    ///
    /// A column summing to zero stays all-zero.
    pub fn proportions(&self) -> Array2<f64> {
        let mut props = self.counts.mapv(|c| c as f64);
        for mut column in props.axis_iter_mut(Axis(1)) {
            let sum = column.sum();
            if sum > 0.0 {
                column.mapv_inplace(|v| v / sum);
            }
        }
        props
    }

    /// Writes the classic tab-delimited format: `OTU_ID\t<s1>\t<s2>...`
    /// followed by one row per OTU.
    pub fn write_classic(&self, path: impl AsRef<Path>) -> Result<(), TableError> {
        let file = File::create(path.as_ref())?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(BufWriter::new(file));

        let mut header = Vec::with_capacity(self.sample_ids.len() + 1);
        header.push(OTU_ID_HEADER.to_string());
        header.extend(self.sample_ids.iter().cloned());
        writer.write_record(&header)?;

        for (id, row) in self.otu_ids.iter().zip(self.counts.rows()) {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(id.clone());
            record.extend(row.iter().map(|c| c.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a classic tab-delimited table. The first header cell names the
    /// id column and is otherwise ignored.
    pub fn read_classic(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)?;

        let sample_ids: Vec<String> = reader.headers()?.iter().skip(1).map(String::from).collect();
        let mut otu_ids = Vec::new();
        let mut values = Vec::new();

        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let parse_error = |reason: String| TableError::Parse {
                path: path.to_path_buf(),
                row: row + 1,
                reason,
            };
            let mut fields = record.iter();
            let id = fields
                .next()
                .ok_or_else(|| parse_error("empty row".to_string()))?;
            otu_ids.push(id.to_string());
            for field in fields {
                values.push(parse_count(field).ok_or_else(|| {
                    parse_error(format!("'{}' is not a non-negative integer count", field))
                })?);
            }
        }

        let counts = Array2::from_shape_vec((otu_ids.len(), sample_ids.len()), values).map_err(|e| {
            TableError::Parse {
                path: path.to_path_buf(),
                row: 0,
                reason: e.to_string(),
            }
        })?;
        debug!(
            "Read {} OTUs x {} samples from {}",
            otu_ids.len(),
            sample_ids.len(),
            path.display()
        );
        OtuTable::new(otu_ids, sample_ids, counts)
    }
}

/// Accepts `12` as well as integral floats like `12.0`.
fn parse_count(field: &str) -> Option<u64> {
    let field = field.trim();
    if let Ok(v) = field.parse::<u64>() {
        return Some(v);
    }
    let v = field.parse::<f64>().ok()?;
    (v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64).then_some(v as u64)
}

/// Full table plus the reference-matched table when an alignment was run.
#[derive(Debug, Clone)]
pub struct OtuTables {
    pub full: OtuTable,
    pub reference: Option<OtuTable>,
}

/// Builds the OTU tables from clustering output.
///
/// Rows follow the order of `otu_fasta`; columns are every sample present in
/// the dereplication map, sorted. A cell is the number of member reads of the
/// OTU's representative that came from the sample.
pub fn build_otu_tables(
    otu_fasta: &Path,
    derep: &DereplicationMap,
    alignment: Option<&AlignmentMap>,
    separator: char,
) -> Result<OtuTables, TableError> {
    let sample_ids = derep.samples(separator);
    let sample_index: HashMap<&str, usize> = sample_ids
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();

    let mut otu_ids = Vec::new();
    let mut rows: Vec<Vec<u64>> = Vec::new();
    for record in SequenceRecordIterator::open(otu_fasta)? {
        let record = record?;
        let otu = strip_size_annotation(&record.id).to_string();
        let members = derep
            .members(&otu)
            .ok_or_else(|| TableError::UnknownRepresentative(otu.clone()))?;

        let mut row = vec![0u64; sample_ids.len()];
        for member in members {
            if let Some(&col) = sample_index.get(sample_of(member, separator)) {
                row[col] += 1;
            }
        }
        otu_ids.push(otu);
        rows.push(row);
    }

    let full = table_from_rows(otu_ids.clone(), sample_ids.clone(), &rows)?;
    info!(
        "OTU table: {} OTUs x {} samples, {} reads",
        full.dimensions().0,
        full.dimensions().1,
        full.total()
    );

    let reference = match alignment {
        Some(alignment) => {
            let mut by_reference: IndexMap<&str, Vec<u64>> = IndexMap::new();
            for (otu, row) in otu_ids.iter().zip(&rows) {
                let Some(reference) = alignment.get(otu) else {
                    continue;
                };
                let summed = by_reference
                    .entry(reference.as_str())
                    .or_insert_with(|| vec![0; sample_ids.len()]);
                for (acc, count) in summed.iter_mut().zip(row) {
                    *acc += count;
                }
            }
            let ids = by_reference.keys().map(|k| k.to_string()).collect();
            let rows: Vec<Vec<u64>> = by_reference.into_values().collect();
            let table = table_from_rows(ids, sample_ids, &rows)?;
            info!("Reference OTU table: {} reference ids", table.dimensions().0);
            Some(table)
        }
        None => None,
    };

    Ok(OtuTables { full, reference })
}

fn table_from_rows(
    otu_ids: Vec<String>,
    sample_ids: Vec<String>,
    rows: &[Vec<u64>],
) -> Result<OtuTable, TableError> {
    let mut counts = Array2::zeros((otu_ids.len(), sample_ids.len()));
    for (mut target, row) in counts.rows_mut().into_iter().zip(rows) {
        for (cell, &value) in target.iter_mut().zip(row) {
            *cell = value;
        }
    }
    OtuTable::new(otu_ids, sample_ids, counts)
}

/// Writes the `OTU_ID\tSequence` table of representative sequences.
///
/// Returns the number of rows written.
pub fn write_sequence_table(otu_fasta: &Path, output: &Path) -> Result<usize, TableError> {
    let file = File::create(output)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(BufWriter::new(file));
    writer.write_record([OTU_ID_HEADER, "Sequence"])?;

    let mut rows = 0;
    for record in SequenceRecordIterator::open(otu_fasta)? {
        let record = record?;
        let sequence = String::from_utf8_lossy(&record.seq);
        writer.write_record([strip_size_annotation(&record.id), &*sequence])?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}
