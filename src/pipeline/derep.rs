//! Dereplication: collapse identical reads into unique sequences.
//!
//! Every merged read belongs to exactly one unique sequence. The uniques are
//! written with `;size=N;` abundance annotations for the clustering tool, and
//! the representative to member mapping is kept so OTU counts can later be
//! traced back to samples.

use crate::io::fastq::{write_records, FastxError, SeqFormat, SequenceRecord, SequenceRecordIterator};
use crate::pipeline::merge::sample_of;
use indexmap::IndexMap;
use log::info;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DerepError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Sequence error: {0}")]
    Fastx(#[from] FastxError),

    #[error("Malformed dereplication map {path} line {line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Sort order for dereplicated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerepSort {
    /// Sort by abundance (descending), then by sequence.
    Abundance,
    /// Sort by sequence (lexicographic).
    Sequence,
}

/// A unique sequence and the reads that carry it.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueSequence {
    /// `Uniq<k>`, the 1-based rank in output order.
    pub id: String,
    /// The unique sequence (uppercase).
    pub sequence: Vec<u8>,
    /// Ids of the member reads, in input order.
    pub members: Vec<String>,
}

impl UniqueSequence {
    pub fn abundance(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerepStats {
    pub input_sequences: usize,
    pub unique_sequences: usize,
    pub max_abundance: usize,
    pub singletons: usize,
}

/// Representative id to the ids of the reads it stands for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DereplicationMap {
    groups: IndexMap<String, Vec<String>>,
}

impl DereplicationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, representative: impl Into<String>, members: Vec<String>) {
        self.groups.insert(representative.into(), members);
    }

    pub fn members(&self, representative: &str) -> Option<&[String]> {
        self.groups.get(representative).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total number of member reads.
    pub fn total_members(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Every sample label found among the member ids, sorted.
    pub fn samples(&self, separator: char) -> Vec<String> {
        let samples: BTreeSet<&str> = self
            .groups
            .values()
            .flatten()
            .map(|member| sample_of(member, separator))
            .collect();
        samples.into_iter().map(String::from).collect()
    }

    /// Writes one `<rep>\t<member> <member> ...` line per representative.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), DerepError> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        for (representative, members) in &self.groups {
            writeln!(writer, "{}\t{}", representative, members.join(" "))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, DerepError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut map = DereplicationMap::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (representative, members) = line.split_once('\t').ok_or_else(|| DerepError::Malformed {
                path: path.to_path_buf(),
                line: i + 1,
                reason: "missing tab after representative id".to_string(),
            })?;
            let members: Vec<String> = members.split_whitespace().map(String::from).collect();
            if members.is_empty() {
                return Err(DerepError::Malformed {
                    path: path.to_path_buf(),
                    line: i + 1,
                    reason: format!("representative {} has no members", representative),
                });
            }
            map.insert(representative, members);
        }
        Ok(map)
    }
}

/// Outcome of [`dereplicate`].
#[derive(Debug, Clone)]
pub struct Dereplication {
    pub uniques: Vec<UniqueSequence>,
    pub map: DereplicationMap,
    pub stats: DerepStats,
}

/// Dereplicates a FASTA/FASTQ file.
///
/// Sequences are compared case-insensitively. Member ids are the first
/// whitespace token of each header.
pub fn dereplicate(path: &Path, sort: DerepSort) -> Result<Dereplication, DerepError> {
    let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<u8>, Vec<String>)> = Vec::new();
    let mut input_sequences = 0;

    for record in SequenceRecordIterator::open(path)? {
        let record = record?;
        input_sequences += 1;
        let key: Vec<u8> = record.seq.iter().map(u8::to_ascii_uppercase).collect();
        let member = record.id.split_whitespace().next().unwrap_or_default().to_string();
        match index.get(&key) {
            Some(&slot) => groups[slot].1.push(member),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![member]));
            }
        }
    }

    match sort {
        DerepSort::Abundance => {
            groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
        }
        DerepSort::Sequence => {
            groups.sort_by(|a, b| a.0.cmp(&b.0));
        }
    }

    let mut map = DereplicationMap::new();
    let uniques: Vec<UniqueSequence> = groups
        .into_iter()
        .enumerate()
        .map(|(k, (sequence, members))| {
            let id = format!("Uniq{}", k + 1);
            map.insert(id.clone(), members.clone());
            UniqueSequence {
                id,
                sequence,
                members,
            }
        })
        .collect();

    let stats = DerepStats {
        input_sequences,
        unique_sequences: uniques.len(),
        max_abundance: uniques.iter().map(UniqueSequence::abundance).max().unwrap_or(0),
        singletons: uniques.iter().filter(|u| u.abundance() == 1).count(),
    };
    info!(
        "Dereplicated {} reads into {} uniques ({} singletons)",
        stats.input_sequences, stats.unique_sequences, stats.singletons
    );

    Ok(Dereplication { uniques, map, stats })
}

/// Writes the uniques as FASTA with `Uniq<k>;size=<abundance>;` headers.
pub fn write_uniques(path: &Path, uniques: &[UniqueSequence]) -> Result<usize, FastxError> {
    let records = uniques.iter().map(|u| {
        SequenceRecord::new(
            format!("{};size={};", u.id, u.abundance()),
            u.sequence.clone(),
            None,
        )
    });
    write_records(path, records, SeqFormat::Fasta)
}

/// Drops a `;size=N;` abundance annotation (and any description) from an id.
pub fn strip_size_annotation(id: &str) -> &str {
    let id = id.split_whitespace().next().unwrap_or_default();
    match id.find(";size=") {
        Some(pos) => &id[..pos],
        None => id.trim_end_matches(';'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dereplicate_by_abundance() {
        let dir = tempdir().unwrap();
        let merged = dir.path().join("merged.fasta");
        fs::write(
            &merged,
            ">1_S1\nACGT\n>2_S1\nGGGG\n>3_S2\nacgt\n>4_S2\nCCCC\n>5_S3\nGGGG\n>6_S3\nACGT\n",
        )
        .unwrap();

        let derep = dereplicate(&merged, DerepSort::Abundance).unwrap();
        let ids: Vec<&str> = derep.uniques.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["Uniq1", "Uniq2", "Uniq3"]);
        assert_eq!(derep.uniques[0].sequence, b"ACGT");
        assert_eq!(derep.uniques[0].members, vec!["1_S1", "3_S2", "6_S3"]);
        assert_eq!(derep.uniques[1].sequence, b"GGGG");
        assert_eq!(derep.uniques[2].sequence, b"CCCC");

        assert_eq!(derep.stats.input_sequences, 6);
        assert_eq!(derep.stats.singletons, 1);
        assert_eq!(derep.map.total_members(), 6);
        assert_eq!(derep.map.members("Uniq2").map(<[String]>::len), Some(2));
        assert_eq!(derep.map.samples('_'), vec!["S1", "S2", "S3"]);
    }

    #[test]
    fn test_sort_by_sequence() {
        let dir = tempdir().unwrap();
        let merged = dir.path().join("merged.fasta");
        fs::write(&merged, ">1_S1\nTT\n>2_S1\nAA\n>3_S1\nTT\n").unwrap();

        let derep = dereplicate(&merged, DerepSort::Sequence).unwrap();
        assert_eq!(derep.uniques[0].sequence, b"AA");
        assert_eq!(derep.uniques[0].id, "Uniq1");
    }

    #[test]
    fn test_empty_input() {
        let dir = tempdir().unwrap();
        let merged = dir.path().join("merged.fasta");
        fs::write(&merged, "").unwrap();
        let derep = dereplicate(&merged, DerepSort::Abundance).unwrap();
        assert!(derep.uniques.is_empty());
        assert!(derep.map.is_empty());
    }

    #[test]
    fn test_write_uniques_and_map() {
        let dir = tempdir().unwrap();
        let merged = dir.path().join("merged.fasta");
        let uniques_path = dir.path().join("uniques.fasta");
        let map_path = dir.path().join("otu_database");
        fs::write(&merged, ">1_S1\nACGT\n>2_S2\nACGT\n>3_S2\nGG\n").unwrap();

        let derep = dereplicate(&merged, DerepSort::Abundance).unwrap();
        write_uniques(&uniques_path, &derep.uniques).unwrap();
        assert_eq!(
            fs::read_to_string(&uniques_path).unwrap(),
            ">Uniq1;size=2;\nACGT\n>Uniq2;size=1;\nGG\n"
        );

        derep.map.write(&map_path).unwrap();
        assert_eq!(
            fs::read_to_string(&map_path).unwrap(),
            "Uniq1\t1_S1 2_S2\nUniq2\t3_S2\n"
        );
        assert_eq!(DereplicationMap::read(&map_path).unwrap(), derep.map);
    }

    #[test]
    fn test_read_malformed_map() {
        let dir = tempdir().unwrap();
        let map_path = dir.path().join("otu_database");
        fs::write(&map_path, "Uniq1 1_S1\n").unwrap();
        assert!(matches!(
            DereplicationMap::read(&map_path),
            Err(DerepError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_strip_size_annotation() {
        assert_eq!(strip_size_annotation("Uniq1;size=12;"), "Uniq1");
        assert_eq!(strip_size_annotation("Uniq1;size=12"), "Uniq1");
        assert_eq!(strip_size_annotation("OTU_3;"), "OTU_3");
        assert_eq!(strip_size_annotation("Uniq4 extra"), "Uniq4");
    }
}
