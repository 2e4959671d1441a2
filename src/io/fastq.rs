//! Functions for reading and writing FASTQ/FASTA records.
//!
//! Decoding leverages the `needletail` crate, which handles FASTA and FASTQ
//! (and gzip-compressed input) transparently. Every pipeline stage that scans
//! reads goes through [`SequenceRecordIterator`] so records are decoded lazily,
//! one at a time, instead of materializing whole chunks in memory.

use log::debug;
use needletail::{parse_fastx_file, FastxReader};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FastxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Needletail parsing error: {0}")]
    Parse(#[from] needletail::errors::ParseError),

    #[error("Malformed record in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Layout of a sequence file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqFormat {
    Fastq,
    Fasta,
}

impl SeqFormat {
    /// Number of lines a single record occupies in the files this pipeline
    /// writes (single-line FASTA).
    pub fn lines_per_record(&self) -> usize {
        match self {
            SeqFormat::Fastq => 4,
            SeqFormat::Fasta => 2,
        }
    }

    /// First byte of every record header.
    pub fn header_marker(&self) -> u8 {
        match self {
            SeqFormat::Fastq => b'@',
            SeqFormat::Fasta => b'>',
        }
    }
}

/// An owned sequence record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    /// Full header line without the leading `@`/`>`.
    pub id: String,
    pub seq: Vec<u8>,
    /// Per-base qualities, same length as `seq` when present.
    pub qual: Option<Vec<u8>>,
}

impl SequenceRecord {
    pub fn new(id: impl Into<String>, seq: Vec<u8>, qual: Option<Vec<u8>>) -> Self {
        SequenceRecord {
            id: id.into(),
            seq,
            qual,
        }
    }

    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Keeps `start..end` of the sequence and its qualities.
    pub fn slice(&mut self, start: usize, end: usize) {
        let end = end.min(self.seq.len());
        let start = start.min(end);
        self.seq = self.seq[start..end].to_vec();
        if let Some(qual) = self.qual.as_mut() {
            *qual = qual[start..end].to_vec();
        }
    }

    /// Writes the record as FASTQ.
    pub fn write_fastq<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let qual = self.qual.as_deref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record {} has no qualities to write as FASTQ", self.id),
            )
        })?;
        writer.write_all(b"@")?;
        writer.write_all(self.id.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.write_all(&self.seq)?;
        writer.write_all(b"\n+\n")?;
        writer.write_all(qual)?;
        writer.write_all(b"\n")
    }

    /// Writes the record as single-line FASTA, dropping qualities.
    pub fn write_fasta<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b">")?;
        writer.write_all(self.id.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.write_all(&self.seq)?;
        writer.write_all(b"\n")
    }

    /// Writes FASTQ when qualities are present, FASTA otherwise.
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        if self.qual.is_some() {
            self.write_fastq(writer)
        } else {
            self.write_fasta(writer)
        }
    }
}

/// Lazy decoder over a FASTA/FASTQ file.
///
/// An empty file yields no records (needletail refuses empty input, but an
/// empty chunk is a legitimate outcome of filtering stages). Decoding stops
/// after the first error.
pub struct SequenceRecordIterator {
    reader: Option<Box<dyn FastxReader>>,
    path: PathBuf,
}

impl SequenceRecordIterator {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FastxError> {
        let path = path.as_ref().to_path_buf();
        let reader = if fs::metadata(&path)?.len() == 0 {
            debug!("{} is empty, nothing to decode", path.display());
            None
        } else {
            Some(parse_fastx_file(&path)?)
        };
        Ok(SequenceRecordIterator { reader, path })
    }
}

impl Iterator for SequenceRecordIterator {
    type Item = Result<SequenceRecord, FastxError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let result = match reader.next()? {
            Ok(record) => {
                let id = String::from_utf8_lossy(record.id()).into_owned();
                let seq = record.seq().into_owned();
                let qual = record.qual().map(|q| q.to_vec());
                match &qual {
                    Some(q) if q.len() != seq.len() => Err(FastxError::Malformed {
                        path: self.path.clone(),
                        reason: format!(
                            "record {} has {} bases but {} qualities",
                            id,
                            seq.len(),
                            q.len()
                        ),
                    }),
                    _ => Ok(SequenceRecord { id, seq, qual }),
                }
            }
            Err(e) => Err(FastxError::from(e)),
        };
        if result.is_err() {
            self.reader = None;
        }
        Some(result)
    }
}

/// Reads every record of a file into memory.
#[cfg(test)]
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<SequenceRecord>, FastxError> {
    SequenceRecordIterator::open(path)?.collect()
}

/// Streams `records` into `path`, FASTQ or FASTA depending on `format`.
///
/// Returns the number of records written.
pub fn write_records<I>(path: impl AsRef<Path>, records: I, format: SeqFormat) -> Result<usize, FastxError>
where
    I: IntoIterator<Item = SequenceRecord>,
{
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    let mut written = 0;
    for record in records {
        match format {
            SeqFormat::Fastq => record.write_fastq(&mut writer)?,
            SeqFormat::Fasta => record.write_fasta(&mut writer)?,
        }
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Streams `input` through `transform` into `output`.
///
/// `transform` returns `None` to drop a record. Returns `(read, written)`.
pub fn filter_map_file<F>(
    input: &Path,
    output: &Path,
    format: SeqFormat,
    mut transform: F,
) -> Result<(usize, usize), FastxError>
where
    F: FnMut(SequenceRecord) -> Option<SequenceRecord>,
{
    let mut writer = BufWriter::new(File::create(output)?);
    let mut read = 0;
    let mut written = 0;
    for record in SequenceRecordIterator::open(input)? {
        read += 1;
        if let Some(record) = transform(record?) {
            match format {
                SeqFormat::Fastq => record.write_fastq(&mut writer)?,
                SeqFormat::Fasta => record.write_fasta(&mut writer)?,
            }
            written += 1;
        }
    }
    writer.flush()?;
    Ok((read, written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    fn create_dummy_file(path: &Path, content: &str) {
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_read_single_fastq() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.fq");
        create_dummy_file(&file_path, "@seq1\nACGT\n+\n!!!!\n@seq2 extra\nTGCA\n+\n####\n");

        let records = read_records(&file_path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "seq1");
        assert_eq!(records[0].seq, b"ACGT");
        assert_eq!(records[0].qual.as_deref(), Some(&b"!!!!"[..]));
        assert_eq!(records[1].id, "seq2 extra");
    }

    #[test]
    fn test_read_fasta_has_no_quality() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.fa");
        create_dummy_file(&file_path, ">seqA\nAAAA\n>seqB\nCC\nCC\n");

        let records = read_records(&file_path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].qual.is_none());
        assert_eq!(records[1].seq, b"CCCC");
    }

    #[test]
    fn test_read_gzipped_fastq() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.fq.gz");
        let mut encoder = GzEncoder::new(File::create(&file_path).unwrap(), Compression::default());
        encoder.write_all(b"@seq1\nACGT\n+\nIIII\n").unwrap();
        encoder.finish().unwrap();

        let records = read_records(&file_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, b"ACGT");
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("empty.fq");
        create_dummy_file(&file_path, "");
        assert!(read_records(&file_path).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_fastq_is_an_error() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.fq");
        create_dummy_file(&file_path, "@seq1\nACGT\n+\n!!!");
        assert!(read_records(&file_path).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(SequenceRecordIterator::open("does_not_exist.fq").is_err());
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempdir().unwrap();
        let fq = dir.path().join("out.fq");
        let records = vec![
            SequenceRecord::new("r1", b"ACGTT".to_vec(), Some(b"IIIII".to_vec())),
            SequenceRecord::new("r2 S1", b"GG".to_vec(), Some(b"##".to_vec())),
        ];
        assert_eq!(write_records(&fq, records.clone(), SeqFormat::Fastq).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(&fq).unwrap(),
            "@r1\nACGTT\n+\nIIIII\n@r2 S1\nGG\n+\n##\n"
        );
        assert_eq!(read_records(&fq).unwrap(), records);
    }

    #[test]
    fn test_slice_keeps_quality_in_step() {
        let mut record = SequenceRecord::new("r", b"AACCGGTT".to_vec(), Some(b"ABCDEFGH".to_vec()));
        record.slice(2, 6);
        assert_eq!(record.seq, b"CCGG");
        assert_eq!(record.qual.as_deref(), Some(&b"CDEF"[..]));
        record.slice(1, 100);
        assert_eq!(record.seq, b"CGG");
    }

    #[test]
    fn test_filter_map_file_counts() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.fq");
        let output = dir.path().join("out.fa");
        create_dummy_file(&input, "@a\nACGT\n+\nIIII\n@b\nAC\n+\nII\n");

        let (read, written) = filter_map_file(&input, &output, SeqFormat::Fasta, |r| {
            (r.len() >= 4).then_some(r)
        })
        .unwrap();
        assert_eq!((read, written), (2, 1));
        assert_eq!(fs::read_to_string(&output).unwrap(), ">a\nACGT\n");
    }
}
