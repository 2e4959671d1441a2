//! Taxonomic ranks, lineage lookup and rank-level collapsing of OTU tables.
//!
//! Lineages use the Greengenes style `k__Bacteria;p__Firmicutes;...;s__` with
//! exactly one label per rank. A rank nobody could resolve is left as the bare
//! prefix (`g__`), which is treated as an empty level.

use crate::otu_table::OtuTable;
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Suffix of a lineage level that carries no name.
pub const EMPTY_LEVEL_MARKER: &str = "__";

/// Length of the rank prefix (`k__`, `p__`, ...) in front of every label.
const RANK_PREFIX_LEN: usize = 3;

#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("OTU '{0}' has no lineage")]
    MissingLineage(String),

    #[error("Rank {0} has no parent rank")]
    NoParentRank(TaxonomicRank),
}

/// Taxonomic classification ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaxonomicRank {
    Kingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
}

impl TaxonomicRank {
    /// Returns a string representation of the rank.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomicRank::Kingdom => "kingdom",
            TaxonomicRank::Phylum => "phylum",
            TaxonomicRank::Class => "class",
            TaxonomicRank::Order => "order",
            TaxonomicRank::Family => "family",
            TaxonomicRank::Genus => "genus",
            TaxonomicRank::Species => "species",
        }
    }

    /// Returns the number of lineage levels down to and including this rank.
    pub fn depth(&self) -> usize {
        match self {
            TaxonomicRank::Kingdom => 1,
            TaxonomicRank::Phylum => 2,
            TaxonomicRank::Class => 3,
            TaxonomicRank::Order => 4,
            TaxonomicRank::Family => 5,
            TaxonomicRank::Genus => 6,
            TaxonomicRank::Species => 7,
        }
    }

    /// Returns all ranks in hierarchical order.
    pub fn all_ranks() -> [TaxonomicRank; 7] {
        [
            TaxonomicRank::Kingdom,
            TaxonomicRank::Phylum,
            TaxonomicRank::Class,
            TaxonomicRank::Order,
            TaxonomicRank::Family,
            TaxonomicRank::Genus,
            TaxonomicRank::Species,
        ]
    }
}

impl fmt::Display for TaxonomicRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaxonomicRank {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        TaxonomicRank::all_ranks()
            .into_iter()
            .find(|rank| rank.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown rank '{}', expected one of kingdom, phylum, class, order, family, genus, species",
                    s
                )
            })
    }
}

/// OTU (or reference) id to lineage string.
#[derive(Debug, Clone, Default)]
pub struct LineageMap {
    lineages: HashMap<String, String>,
}

impl LineageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `<id>\t<lineage words...>` lines. The lineage words are joined
    /// without separators, so `k__Bacteria; p__X` becomes `k__Bacteria;p__X`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut map = LineageMap::new();
        for line in text.lines() {
            let mut words = line.split_whitespace();
            let Some(id) = words.next() else {
                continue;
            };
            let lineage: String = words.collect();
            if lineage.is_empty() {
                debug!("No lineage for {} in {}", id, path.display());
                continue;
            }
            map.insert(id, lineage);
        }
        if map.is_empty() {
            warn!("No lineages found in {}", path.display());
        } else {
            info!("Loaded {} lineages from {}", map.len(), path.display());
        }
        Ok(map)
    }

    pub fn insert(&mut self, id: impl Into<String>, lineage: impl Into<String>) {
        self.lineages.insert(id.into(), lineage.into());
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.lineages.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lineages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lineages.is_empty()
    }
}

/// Relative abundance per truncated lineage per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct CollapsedTable {
    pub rank: TaxonomicRank,
    pub sample_ids: Vec<String>,
    /// Truncated lineage to one proportion per sample, in first-seen order.
    pub taxa: IndexMap<String, Vec<f64>>,
}

impl CollapsedTable {
    pub fn get(&self, taxon: &str, sample: &str) -> Option<f64> {
        let col = self.sample_ids.iter().position(|s| s == sample)?;
        self.taxa.get(taxon).map(|values| values[col])
    }

    /// Writes a `TAXON\t<s1>\t<s2>...` table.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), TaxonomyError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| TaxonomyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(BufWriter::new(file));

        let mut header = vec!["TAXON".to_string()];
        header.extend(self.sample_ids.iter().cloned());
        writer.write_record(&header)?;
        for (taxon, values) in &self.taxa {
            let mut record = Vec::with_capacity(values.len() + 1);
            record.push(taxon.clone());
            record.extend(values.iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush().map_err(|source| TaxonomyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

/// Label of a lineage level without its rank prefix.
fn strip_rank_prefix(label: &str) -> &str {
    label.get(RANK_PREFIX_LEN..).unwrap_or("")
}

/// Collapses an OTU table to `rank`.
///
/// Counts are first turned into per-sample proportions. Each OTU lineage is
/// truncated to the rank; OTUs whose lineage is too short or whose label at
/// the rank is empty are left out, as are those whose parent-rank name
/// differs from `parent` when one is given. Proportions are summed per
/// truncated lineage.
pub fn collapse(
    table: &OtuTable,
    lineages: &LineageMap,
    rank: TaxonomicRank,
    parent: Option<&str>,
) -> Result<CollapsedTable, TaxonomyError> {
    if parent.is_some() && rank == TaxonomicRank::Kingdom {
        return Err(TaxonomyError::NoParentRank(rank));
    }
    let depth = rank.depth();

    for (sample, sum) in table.sample_ids().iter().zip(table.column_sums()) {
        if sum == 0 {
            warn!("Sample {} has no reads; its proportions are all zero", sample);
        }
    }
    let proportions = table.proportions();

    let mut taxa: IndexMap<String, Vec<f64>> = IndexMap::new();
    let mut skipped = 0;
    for (otu, row) in table.otu_ids().iter().zip(proportions.rows()) {
        let lineage = lineages
            .get(otu)
            .ok_or_else(|| TaxonomyError::MissingLineage(otu.clone()))?;
        let levels: Vec<&str> = lineage.split(';').map(str::trim).collect();
        if levels.len() < depth {
            skipped += 1;
            continue;
        }
        if levels[depth - 1].ends_with(EMPTY_LEVEL_MARKER) {
            skipped += 1;
            continue;
        }
        if let Some(parent) = parent {
            if strip_rank_prefix(levels[depth - 2]) != parent {
                continue;
            }
        }

        let key = levels[..depth].join(";");
        let sums = taxa
            .entry(key)
            .or_insert_with(|| vec![0.0; table.sample_ids().len()]);
        for (acc, value) in sums.iter_mut().zip(row.iter()) {
            *acc += value;
        }
    }
    debug!(
        "Collapsed {} OTUs to {} {} taxa ({} without a {} label)",
        table.otu_ids().len(),
        taxa.len(),
        rank,
        skipped,
        rank
    );

    Ok(CollapsedTable {
        rank,
        sample_ids: table.sample_ids().to_vec(),
        taxa,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;
    use tempfile::tempdir;

    fn table() -> OtuTable {
        OtuTable::new(
            vec!["o1".into(), "o2".into(), "o3".into(), "o4".into()],
            vec!["S1".into(), "S2".into()],
            arr2(&[[2, 0], [1, 0], [1, 0], [0, 0]]),
        )
        .unwrap()
    }

    fn lineages() -> LineageMap {
        let mut map = LineageMap::new();
        map.insert("o1", "k__Bacteria;p__Firmicutes;c__Bacilli");
        map.insert("o2", "k__Bacteria;p__Firmicutes;c__Clostridia");
        map.insert("o3", "k__Bacteria;p__Proteobacteria;c__");
        map.insert("o4", "k__Bacteria");
        map
    }

    #[test]
    fn test_rank_parsing_and_depth() {
        assert_eq!("Genus".parse::<TaxonomicRank>().unwrap(), TaxonomicRank::Genus);
        assert_eq!(TaxonomicRank::Kingdom.depth(), 1);
        assert_eq!(TaxonomicRank::Species.depth(), 7);
        assert!("strain".parse::<TaxonomicRank>().is_err());
    }

    #[test]
    fn test_collapse_to_phylum() {
        let collapsed = collapse(&table(), &lineages(), TaxonomicRank::Phylum, None).unwrap();
        let taxa: Vec<&String> = collapsed.taxa.keys().collect();
        assert_eq!(taxa, vec!["k__Bacteria;p__Firmicutes", "k__Bacteria;p__Proteobacteria"]);
        assert_relative_eq!(collapsed.get("k__Bacteria;p__Firmicutes", "S1").unwrap(), 0.75);
        assert_relative_eq!(collapsed.get("k__Bacteria;p__Proteobacteria", "S1").unwrap(), 0.25);
        assert_relative_eq!(collapsed.get("k__Bacteria;p__Firmicutes", "S2").unwrap(), 0.0);
    }

    #[test]
    fn test_collapse_skips_empty_levels_and_filters_parent() {
        let collapsed = collapse(&table(), &lineages(), TaxonomicRank::Class, Some("Firmicutes")).unwrap();
        assert_eq!(collapsed.taxa.len(), 2);
        assert_relative_eq!(
            collapsed.get("k__Bacteria;p__Firmicutes;c__Bacilli", "S1").unwrap(),
            0.5
        );

        let unfiltered = collapse(&table(), &lineages(), TaxonomicRank::Class, None).unwrap();
        assert!(!unfiltered.taxa.contains_key("k__Bacteria;p__Proteobacteria;c__"));
    }

    #[test]
    fn test_collapsed_proportions_never_exceed_one() {
        for rank in [TaxonomicRank::Kingdom, TaxonomicRank::Phylum, TaxonomicRank::Class] {
            let collapsed = collapse(&table(), &lineages(), rank, None).unwrap();
            for col in 0..collapsed.sample_ids.len() {
                let total: f64 = collapsed.taxa.values().map(|v| v[col]).sum();
                assert!(total <= 1.0 + 1e-12);
            }
        }
    }

    #[test]
    fn test_collapse_errors() {
        let mut partial = lineages();
        partial.lineages.remove("o2");
        assert!(matches!(
            collapse(&table(), &partial, TaxonomicRank::Phylum, None),
            Err(TaxonomyError::MissingLineage(id)) if id == "o2"
        ));
        assert!(matches!(
            collapse(&table(), &lineages(), TaxonomicRank::Kingdom, Some("Bacteria")),
            Err(TaxonomyError::NoParentRank(TaxonomicRank::Kingdom))
        ));
    }

    #[test]
    fn test_load_lineages_joins_words() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("taxonomy.txt");
        fs::write(&path, "4479944\tk__Bacteria; p__Firmicutes; c__Bacilli\n\n1234\n").unwrap();

        let map = LineageMap::load(&path).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("4479944"), Some("k__Bacteria;p__Firmicutes;c__Bacilli"));
    }

    #[test]
    fn test_write_collapsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("phylum.tsv");
        let collapsed = collapse(&table(), &lineages(), TaxonomicRank::Kingdom, None).unwrap();
        collapsed.write(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "TAXON\tS1\tS2\nk__Bacteria\t1\t0\n"
        );
    }
}
