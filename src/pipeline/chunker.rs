//! Splitting of raw read files into line-aligned chunks.

use crate::config::ChunkingConfig;
use crate::io::fastq::SeqFormat;
use flate2::read::MultiGzDecoder;
use log::{debug, info};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Chunks of {path} would not align on records: {reason}")]
    Misaligned { path: PathBuf, reason: String },
}

/// Lines per chunk for a file of `file_size` bytes: big files get big
/// chunks, small files get more of them.
pub fn lines_per_chunk(file_size: u64, config: &ChunkingConfig) -> usize {
    if file_size < config.size_threshold_bytes {
        config.small_chunk_lines
    } else {
        config.large_chunk_lines
    }
}

/// Returns a plain-text path for `path`, decompressing `.gz` input into
/// `work_dir` first.
pub fn prepare_input(path: &Path, work_dir: &Path) -> Result<PathBuf, ChunkError> {
    if path.extension().and_then(|e| e.to_str()) != Some("gz") {
        return Ok(path.to_path_buf());
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let target = work_dir.join(stem);
    info!("Decompressing {} to {}", path.display(), target.display());

    let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(path)?));
    let mut writer = BufWriter::new(File::create(&target)?);
    io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    Ok(target)
}

/// Number of lines, counting a final line without a newline.
pub fn count_lines(path: &Path) -> io::Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = [0u8; 64 * 1024];
    let mut lines = 0;
    let mut last = b'\n';
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count();
        last = buf[n - 1];
    }
    if last != b'\n' {
        lines += 1;
    }
    Ok(lines)
}

fn misaligned(path: &Path, reason: String) -> ChunkError {
    ChunkError::Misaligned {
        path: path.to_path_buf(),
        reason,
    }
}

/// Splits `path` into `out_dir/chunk_NNNN` files of `lines_per_chunk` lines.
///
/// A file that fits in one chunk is returned as is. Chunks are byte-for-byte
/// slices of the input, so concatenating them reproduces it.
pub fn split(
    path: &Path,
    out_dir: &Path,
    lines_per_chunk: usize,
    format: SeqFormat,
) -> Result<Vec<PathBuf>, ChunkError> {
    let record_lines = format.lines_per_record();
    if lines_per_chunk == 0 || lines_per_chunk % record_lines != 0 {
        return Err(misaligned(
            path,
            format!(
                "{} lines per chunk is not a positive multiple of {}",
                lines_per_chunk, record_lines
            ),
        ));
    }

    let total = count_lines(path)?;
    if format == SeqFormat::Fastq && total % record_lines != 0 {
        return Err(misaligned(
            path,
            format!("{} lines is not a whole number of FASTQ records", total),
        ));
    }
    if total <= lines_per_chunk {
        debug!("{} fits in one chunk ({} lines)", path.display(), total);
        return Ok(vec![path.to_path_buf()]);
    }

    let mut reader = BufReader::new(File::open(path)?);
    let mut chunks = Vec::with_capacity(total.div_ceil(lines_per_chunk));
    let mut line = Vec::new();
    let mut writer: Option<BufWriter<File>> = None;
    let mut line_no = 0;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line_no % lines_per_chunk == 0 {
            if line.first() != Some(&format.header_marker()) {
                return Err(misaligned(
                    path,
                    format!(
                        "chunk {} would start at line {} which is not a record header",
                        chunks.len(),
                        line_no + 1
                    ),
                ));
            }
            if let Some(mut done) = writer.take() {
                done.flush()?;
            }
            let chunk = out_dir.join(format!("chunk_{:04}", chunks.len()));
            writer = Some(BufWriter::new(File::create(&chunk)?));
            chunks.push(chunk);
        }
        if let Some(w) = writer.as_mut() {
            w.write_all(&line)?;
        }
        line_no += 1;
    }
    if let Some(mut done) = writer.take() {
        done.flush()?;
    }

    info!(
        "Split {} ({} lines) into {} chunks of {} lines",
        path.display(),
        total,
        chunks.len(),
        lines_per_chunk
    );
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use tempfile::tempdir;

    fn fastq(n: usize) -> String {
        (0..n)
            .map(|i| format!("@r{}\nACGT\n+\nIIII\n", i))
            .collect()
    }

    #[test]
    fn test_lines_per_chunk() {
        let config = ChunkingConfig::default();
        assert_eq!(lines_per_chunk(1_000, &config), 100_000);
        assert_eq!(lines_per_chunk(200_000_000, &config), 1_000_000);
    }

    #[test]
    fn test_small_file_is_not_copied() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("reads.fq");
        fs::write(&input, fastq(3)).unwrap();
        let chunks = split(&input, dir.path(), 100_000, SeqFormat::Fastq).unwrap();
        assert_eq!(chunks, vec![input]);
    }

    #[test]
    fn test_split_then_concatenate_reproduces_input() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("reads.fq");
        let content = fastq(10);
        fs::write(&input, &content).unwrap();

        let chunks = split(&input, dir.path(), 8, SeqFormat::Fastq).unwrap();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0], dir.path().join("chunk_0000"));

        let joined: String = chunks.iter().map(|c| fs::read_to_string(c).unwrap()).collect();
        assert_eq!(joined, content);
        assert!(fs::read_to_string(&chunks[4]).unwrap().starts_with("@r8\n"));
    }

    #[test]
    fn test_misaligned_inputs() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("reads.fq");
        fs::write(&input, fastq(4)).unwrap();
        assert!(matches!(
            split(&input, dir.path(), 6, SeqFormat::Fastq),
            Err(ChunkError::Misaligned { .. })
        ));

        fs::write(&input, "@r1\nACGT\n+\nIIII\n@r2\nACGT\n+\n").unwrap();
        assert!(matches!(
            split(&input, dir.path(), 4, SeqFormat::Fastq),
            Err(ChunkError::Misaligned { .. })
        ));

        let fasta = dir.path().join("reads.fa");
        fs::write(&fasta, ">a\nAC\nGT\n>b\nAC\n>c\nGG\n").unwrap();
        assert!(matches!(
            split(&fasta, dir.path(), 2, SeqFormat::Fasta),
            Err(ChunkError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_count_lines_without_trailing_newline() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("x");
        fs::write(&input, "a\nb").unwrap();
        assert_eq!(count_lines(&input).unwrap(), 2);
        fs::write(&input, "").unwrap();
        assert_eq!(count_lines(&input).unwrap(), 0);
    }

    #[test]
    fn test_prepare_gzipped_input() {
        let dir = tempdir().unwrap();
        let gz = dir.path().join("reads.fastq.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(fastq(2).as_bytes()).unwrap();
        encoder.finish().unwrap();

        let plain = prepare_input(&gz, dir.path()).unwrap();
        assert_eq!(plain, dir.path().join("reads.fastq"));
        assert_eq!(fs::read_to_string(&plain).unwrap(), fastq(2));

        let untouched = dir.path().join("reads.fq");
        assert_eq!(prepare_input(&untouched, dir.path()).unwrap(), untouched);
    }
}
