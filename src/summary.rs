//! Dataset summary file handling.
//!
//! A summary file is the per-dataset metadata record every pipeline run is
//! parameterized by. It is tab-delimited and sectioned:
//!
//! ```text
//! DATASET_ID	obio_testdata
//!
//! #16S_start
//! RAW_FASTQ_FILE	obio.raw.fastq
//! PRIMERS_FILE	obio.primers.lst
//! BARCODES_MAP	obio.barcodes.lst
//! BARCODES_MODE	1
//! #16S_end
//! ```
//!
//! Attributes unknown to this crate are kept verbatim so older and newer
//! tools can share one file.

use indexmap::IndexMap;
use log::debug;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Section holding the amplicon pipeline attributes.
pub const SECTION_16S: &str = "16S";

const DATASET_ID_KEY: &str = "DATASET_ID";

/// Well-known attribute names of the 16S section.
pub mod keys {
    pub const RAW_FASTQ_FILE: &str = "RAW_FASTQ_FILE";
    pub const RAW_FASTA_FILE: &str = "RAW_FASTA_FILE";
    pub const PRIMERS_FILE: &str = "PRIMERS_FILE";
    pub const BARCODES_MAP: &str = "BARCODES_MAP";
    pub const BARCODES_MODE: &str = "BARCODES_MODE";
    pub const BARCODES_SEPARATOR: &str = "BARCODES_SEPARATOR";
    pub const ASCII_ENCODING: &str = "ASCII_ENCODING";
    pub const METADATA_FILE: &str = "METADATA_FILE";
    pub const OTU_TABLE_CLOSED_REF: &str = "OTU_TABLE_CLOSED_REF";
    pub const OTU_TABLE_OPEN_REF: &str = "OTU_TABLE_OPEN_REF";
    pub const OTU_SEQUENCES_TABLE: &str = "OTU_SEQUENCES_TABLE";
    pub const OTU_SEQUENCES_FASTA: &str = "OTU_SEQUENCES_FASTA";
    pub const METAGENOME_PREDICTIONS: &str = "METAGENOME_PREDICTIONS";
    pub const PHYLOGENETIC_TREE_OPEN_REF: &str = "PHYLOGENETIC_TREE_OPEN_REF";
    pub const PROCESSED: &str = "PROCESSED";
}

#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("IO error on summary file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing attribute '{key}' in section '{section}'")]
    MissingAttribute { section: String, key: String },
}

/// In-memory form of a summary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRecord {
    dataset_id: String,
    sections: IndexMap<String, IndexMap<String, String>>,
}

impl SummaryRecord {
    /// Creates a record with an empty 16S section.
    pub fn new(dataset_id: impl Into<String>) -> Self {
        let mut sections = IndexMap::new();
        sections.insert(SECTION_16S.to_string(), IndexMap::new());
        SummaryRecord {
            dataset_id: dataset_id.into(),
            sections,
        }
    }

    /// Loads a summary file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SummaryError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SummaryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let record = Self::parse(&text)?;
        debug!(
            "Loaded summary for dataset {} from {}",
            record.dataset_id,
            path.display()
        );
        Ok(record)
    }

    /// Parses the sectioned text format.
    pub fn parse(text: &str) -> Result<Self, SummaryError> {
        let mut lines = text.lines();

        let first = lines
            .next()
            .ok_or_else(|| SummaryError::Config("summary file is empty".to_string()))?;
        let dataset_id = match split_attribute(first.trim_end_matches('\r')) {
            Some((DATASET_ID_KEY, id)) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                return Err(SummaryError::Config(format!(
                    "first line must be '{}<TAB><id>', found '{}'",
                    DATASET_ID_KEY, first
                )))
            }
        };

        let mut sections: IndexMap<String, IndexMap<String, String>> = IndexMap::new();
        let mut open: Option<String> = None;

        for raw in lines {
            let line = raw.trim_end_matches('\r');
            let marker = line.trim();

            if let Some(name) = section_marker(marker, "_start") {
                if let Some(current) = &open {
                    return Err(SummaryError::Config(format!(
                        "section '{}' starts inside unclosed section '{}'",
                        name, current
                    )));
                }
                sections.entry(name.to_string()).or_default();
                open = Some(name.to_string());
                continue;
            }
            if let Some(name) = section_marker(marker, "_end") {
                match open.take() {
                    Some(current) if current == name => continue,
                    Some(current) => {
                        return Err(SummaryError::Config(format!(
                            "section '{}' closed by '#{}_end'",
                            current, name
                        )))
                    }
                    None => {
                        return Err(SummaryError::Config(format!(
                            "'#{}_end' without a matching start marker",
                            name
                        )))
                    }
                }
            }

            let Some(section) = &open else { continue };
            if marker.is_empty() {
                continue;
            }
            let (key, value) = split_attribute(line).unwrap_or((marker, ""));
            if let Some(attributes) = sections.get_mut(section) {
                attributes.insert(key.to_string(), value.to_string());
            }
        }

        if let Some(current) = open {
            return Err(SummaryError::Config(format!(
                "section '{}' is never closed",
                current
            )));
        }
        if !sections.contains_key(SECTION_16S) {
            return Err(SummaryError::Config(format!(
                "missing '#{0}_start'/'#{0}_end' section delimiters",
                SECTION_16S
            )));
        }

        Ok(SummaryRecord {
            dataset_id,
            sections,
        })
    }

    /// Renders the record in the sectioned text format.
    pub fn to_text(&self) -> String {
        let mut out = format!("{}\t{}\n", DATASET_ID_KEY, self.dataset_id);
        for (name, attributes) in &self.sections {
            out.push('\n');
            out.push_str(&format!("#{}_start\n", name));
            for (key, value) in attributes {
                out.push_str(&format!("{}\t{}\n", key, value));
            }
            out.push_str(&format!("#{}_end\n", name));
        }
        out
    }

    /// Rewrites `path` with the full record.
    ///
    /// The text is written to a temporary file next to `path` and renamed
    /// over it, so readers never observe a partially written summary.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SummaryError> {
        let path = path.as_ref();
        let io_err = |source: io::Error| SummaryError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(self.to_text().as_bytes()).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        debug!("Wrote summary for dataset {} to {}", self.dataset_id, path.display());
        Ok(())
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn section(&self, section: &str) -> Option<&IndexMap<String, String>> {
        self.sections.get(section)
    }

    /// Looks up an attribute, failing if it is absent.
    pub fn get(&self, section: &str, key: &str) -> Result<&str, SummaryError> {
        self.get_opt(section, key)
            .ok_or_else(|| SummaryError::MissingAttribute {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    pub fn get_opt(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)
            .and_then(|attributes| attributes.get(key))
            .map(String::as_str)
    }

    /// Like [`get`](Self::get) but a missing attribute is a fatal
    /// configuration error.
    pub fn require(&self, section: &str, key: &str) -> Result<&str, SummaryError> {
        self.get_opt(section, key).ok_or_else(|| {
            SummaryError::Config(format!(
                "required attribute '{}' missing from section '{}'",
                key, section
            ))
        })
    }

    /// Inserts or overwrites an attribute. Existing keys keep their position.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }
}

/// Returns the section name of a `#<NAME><suffix>` marker line.
fn section_marker<'a>(line: &'a str, suffix: &str) -> Option<&'a str> {
    line.strip_prefix('#')?
        .strip_suffix(suffix)
        .filter(|name| !name.is_empty() && !name.contains(char::is_whitespace))
}

/// Splits `KEY<TAB>VALUE`, falling back to the first run of whitespace.
fn split_attribute(line: &str) -> Option<(&str, &str)> {
    if let Some((key, value)) = line.split_once('\t') {
        return Some((key.trim(), value));
    }
    let trimmed = line.trim_start();
    let split_at = trimmed.find(char::is_whitespace)?;
    let (key, rest) = trimmed.split_at(split_at);
    Some((key, rest.trim_start()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const EXAMPLE: &str = "DATASET_ID\tobio_testdata\n\
\n\
#16S_start\n\
DATASET_ID\tobio_testdata\n\
RAW_FASTQ_FILE\tobio.raw.fastq\n\
PRIMERS_FILE\tobio.primers.lst\n\
BARCODES_MAP\tobio.barcodes.lst\n\
BARCODES_MODE   1\n\
AMPLICON\tV1-V2\n\
#16S_end\n\
\n\
#CYTOKINES\n\
#TCR_start\n\
CLONES\ttcr.tsv\n\
#TCR_end\n";

    #[test]
    fn test_parse_example() {
        let record = SummaryRecord::parse(EXAMPLE).unwrap();
        assert_eq!(record.dataset_id(), "obio_testdata");
        assert_eq!(
            record.get(SECTION_16S, keys::RAW_FASTQ_FILE).unwrap(),
            "obio.raw.fastq"
        );
        // Space-separated attribute lines are accepted.
        assert_eq!(record.get(SECTION_16S, keys::BARCODES_MODE).unwrap(), "1");
        // Unknown attributes and sections are preserved.
        assert_eq!(record.get(SECTION_16S, "AMPLICON").unwrap(), "V1-V2");
        assert_eq!(record.get("TCR", "CLONES").unwrap(), "tcr.tsv");
        assert_eq!(record.sections.keys().collect::<Vec<_>>(), vec!["16S", "TCR"]);
    }

    #[test]
    fn test_missing_attribute_vs_required() {
        let record = SummaryRecord::parse(EXAMPLE).unwrap();
        assert!(matches!(
            record.get(SECTION_16S, keys::METADATA_FILE),
            Err(SummaryError::MissingAttribute { .. })
        ));
        assert!(matches!(
            record.require(SECTION_16S, keys::METADATA_FILE),
            Err(SummaryError::Config(_))
        ));
        assert!(record.get_opt(SECTION_16S, keys::METADATA_FILE).is_none());
    }

    #[test]
    fn test_missing_dataset_id_line() {
        let err = SummaryRecord::parse("#16S_start\nA\tB\n#16S_end\n").unwrap_err();
        assert!(matches!(err, SummaryError::Config(_)));
        assert!(matches!(
            SummaryRecord::parse("DATASET_ID\t\n#16S_start\n#16S_end\n"),
            Err(SummaryError::Config(_))
        ));
    }

    #[test]
    fn test_missing_delimiters() {
        let no_section = "DATASET_ID\tx\nRAW_FASTQ_FILE\tr.fq\n";
        assert!(matches!(
            SummaryRecord::parse(no_section),
            Err(SummaryError::Config(_))
        ));
        let unclosed = "DATASET_ID\tx\n#16S_start\nRAW_FASTQ_FILE\tr.fq\n";
        assert!(matches!(
            SummaryRecord::parse(unclosed),
            Err(SummaryError::Config(_))
        ));
        let mismatched = "DATASET_ID\tx\n#16S_start\n#TCR_end\n";
        assert!(matches!(
            SummaryRecord::parse(mismatched),
            Err(SummaryError::Config(_))
        ));
    }

    #[test]
    fn test_load_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary_file.txt");
        fs::write(&path, EXAMPLE).unwrap();

        let first = SummaryRecord::load(&path).unwrap();
        first.save(&path).unwrap();
        let second = SummaryRecord::load(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_set_preserves_order_and_overwrites() {
        let mut record = SummaryRecord::parse(EXAMPLE).unwrap();
        record.set(SECTION_16S, keys::RAW_FASTQ_FILE, "renamed.fastq");
        record.set(SECTION_16S, keys::PROCESSED, "True");

        let attributes = record.section(SECTION_16S).unwrap();
        assert_eq!(attributes.get_index(1).unwrap().0, keys::RAW_FASTQ_FILE);
        assert_eq!(attributes.get(keys::RAW_FASTQ_FILE).unwrap(), "renamed.fastq");
        assert_eq!(attributes.last().unwrap().0, keys::PROCESSED);

        let text = record.to_text();
        assert!(text.starts_with("DATASET_ID\tobio_testdata\n\n#16S_start\n"));
        assert!(text.contains("PROCESSED\tTrue\n#16S_end\n"));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            SummaryRecord::load("no/such/summary_file.txt"),
            Err(SummaryError::Io { .. })
        ));
    }
}
