//! Input/Output operations module.
//!
//! Sequence file decoding, BIOM predictions, and the small file helpers the
//! orchestrator and feature assembly share.

pub mod biom;
pub mod fastq;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Resolves a path stored in a summary file. Relative paths are taken
/// relative to the directory holding the summary.
pub fn resolve_path(base_dir: &Path, value: &str) -> PathBuf {
    let path = Path::new(value.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Copies `file` into `dir` under the same file name and returns the new path.
pub fn copy_into_dir(file: &Path, dir: &Path) -> io::Result<PathBuf> {
    let name = file.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", file.display()),
        )
    })?;
    let target = dir.join(name);
    fs::copy(file, &target)?;
    Ok(target)
}

/// Size of a file in bytes, zero when it does not exist.
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/data/run1");
        assert_eq!(resolve_path(base, "reads.fq"), PathBuf::from("/data/run1/reads.fq"));
        assert_eq!(resolve_path(base, "/abs/reads.fq"), PathBuf::from("/abs/reads.fq"));
    }

    #[test]
    fn test_copy_into_dir() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("table.classic");
        fs::write(&source, "OTU_ID\n").unwrap();
        let target_dir = dir.path().join("results");
        fs::create_dir(&target_dir).unwrap();

        let copied = copy_into_dir(&source, &target_dir).unwrap();
        assert_eq!(copied, target_dir.join("table.classic"));
        assert_eq!(fs::read_to_string(copied).unwrap(), "OTU_ID\n");
        assert_eq!(file_size(&source), 7);
        assert_eq!(file_size(&dir.path().join("missing")), 0);
    }
}
