//! Bioinformatics utilities module.
//!
//! Nucleotide helpers shared by the demultiplexing and primer stages, plus the
//! taxonomy and phylogeny sub-modules used for feature generation.

pub mod phylogeny;
pub mod taxonomy;

pub use phylogeny::{lminusr_balances, parse_newick, PhyloTree};
pub use taxonomy::{collapse, LineageMap, TaxonomicRank};

/// Returns the set of canonical bases an IUPAC code stands for, as a bitmask
/// over `A=1, C=2, G=4, T=8`. Unknown bytes map to 0.
fn iupac_mask(code: u8) -> u8 {
    match code.to_ascii_uppercase() {
        b'A' => 0b0001,
        b'C' => 0b0010,
        b'G' => 0b0100,
        b'T' | b'U' => 0b1000,
        b'R' => 0b0101,
        b'Y' => 0b1010,
        b'S' => 0b0110,
        b'W' => 0b1001,
        b'K' => 0b1100,
        b'M' => 0b0011,
        b'B' => 0b1110,
        b'D' => 0b1101,
        b'H' => 0b1011,
        b'V' => 0b0111,
        b'N' => 0b1111,
        _ => 0,
    }
}

/// Checks if a byte is a valid IUPAC nucleotide code. Case-insensitive.
pub fn is_iupac_code(base: u8) -> bool {
    iupac_mask(base) != 0
}

/// True when the two codes can denote the same base.
///
/// A read `N` never matches: an unknown base is counted as a mismatch.
pub fn iupac_compatible(pattern: u8, base: u8) -> bool {
    if base.eq_ignore_ascii_case(&b'N') {
        return false;
    }
    iupac_mask(pattern) & iupac_mask(base) != 0
}

/// Counts mismatches of `pattern` against the start of `read`.
///
/// Returns `None` when the read is shorter than the pattern or the count
/// exceeds `max_mismatches`.
pub fn prefix_mismatches(pattern: &[u8], read: &[u8], max_mismatches: usize) -> Option<usize> {
    if read.len() < pattern.len() {
        return None;
    }
    let mut mismatches = 0;
    for (&p, &b) in pattern.iter().zip(read) {
        if !iupac_compatible(p, b) {
            mismatches += 1;
            if mismatches > max_mismatches {
                return None;
            }
        }
    }
    Some(mismatches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_iupac_code() {
        for &b in b"ACGT" {
            assert!(is_iupac_code(b));
        }
        assert!(is_iupac_code(b'r'));
        assert!(is_iupac_code(b'N'));
        assert!(!is_iupac_code(b'X'));
        assert!(!is_iupac_code(b' '));
    }

    #[test]
    fn test_iupac_compatible() {
        assert!(iupac_compatible(b'A', b'a'));
        assert!(iupac_compatible(b'R', b'G'));
        assert!(!iupac_compatible(b'R', b'C'));
        assert!(iupac_compatible(b'N', b'T'));
        assert!(!iupac_compatible(b'A', b'N'));
    }

    #[test]
    fn test_prefix_mismatches() {
        assert_eq!(prefix_mismatches(b"ACGT", b"ACGTTTT", 0), Some(0));
        assert_eq!(prefix_mismatches(b"ACGT", b"ACCTTTT", 1), Some(1));
        assert_eq!(prefix_mismatches(b"ACGT", b"TCCTTTT", 1), None);
        assert_eq!(prefix_mismatches(b"ACGY", b"ACGC", 0), Some(0));
        assert_eq!(prefix_mismatches(b"ACGT", b"ACG", 3), None);
    }
}
