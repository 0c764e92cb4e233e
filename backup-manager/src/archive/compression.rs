//! Streaming compression and checksums for backup artifacts.

use crate::utils::errors::{IoResultExt, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Codec applied to the database dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
    None,
}

impl Compression {
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Compression::Gzip => Some("gz"),
            Compression::Zstd => Some("zst"),
            Compression::None => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != Compression::None
    }

    /// Infer the codec from an artifact's file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Compression::Gzip,
            Some("zst") => Compression::Zstd,
            _ => Compression::None,
        }
    }

    /// Sibling path carrying this codec's extension.
    pub fn compressed_path(self, source: &Path) -> PathBuf {
        match self.extension() {
            Some(ext) => {
                let mut name = source.as_os_str().to_os_string();
                name.push(".");
                name.push(ext);
                PathBuf::from(name)
            }
            None => source.to_path_buf(),
        }
    }

    /// Wrap a reader with the matching decoder.
    pub fn decoder<'a, R: Read + 'a>(self, reader: R) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::Gzip => Box::new(GzDecoder::new(reader)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
            Compression::None => Box::new(reader),
        })
    }
}

/// Statistics about a compression operation.
#[derive(Debug, Clone)]
pub struct CompressionStats {
    /// Original uncompressed size in bytes
    pub original_size: u64,

    /// Compressed size in bytes
    pub compressed_size: u64,
}

impl CompressionStats {
    /// Fraction of space saved: `1 - compressed/original`.
    pub fn ratio(&self) -> f64 {
        space_saving(self.compressed_size, self.original_size)
    }
}

/// `1 - packed/original`, rounded to four decimals; zero when nothing was packed.
pub fn space_saving(packed: u64, original: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    let ratio = 1.0 - packed as f64 / original as f64;
    (ratio * 10_000.0).round() / 10_000.0
}

/// Compress `source` into `dest`, reading `chunk_size` bytes at a time.
pub fn compress_file(
    source: &Path,
    dest: &Path,
    codec: Compression,
    level: i32,
    chunk_size: usize,
) -> Result<CompressionStats> {
    let mut input = File::open(source).at(source)?;
    let original_size = input.metadata().at(source)?.len();
    let output = BufWriter::new(File::create(dest).at(dest)?);

    match codec {
        Compression::Gzip => {
            let level = level.clamp(1, 9) as u32;
            let mut encoder = GzEncoder::new(output, flate2::Compression::new(level));
            pump(&mut input, &mut encoder, chunk_size).at(source)?;
            encoder.finish().at(dest)?.flush().at(dest)?;
        }
        Compression::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(output, level).at(dest)?;
            pump(&mut input, &mut encoder, chunk_size).at(source)?;
            encoder.finish().at(dest)?.flush().at(dest)?;
        }
        Compression::None => {
            let mut output = output;
            pump(&mut input, &mut output, chunk_size).at(source)?;
            output.flush().at(dest)?;
        }
    }

    let compressed_size = std::fs::metadata(dest).at(dest)?.len();
    Ok(CompressionStats {
        original_size,
        compressed_size,
    })
}

/// Decompress `source` into `dest`, returning the number of bytes written.
pub fn decompress_file(source: &Path, dest: &Path, codec: Compression) -> Result<u64> {
    let input = BufReader::new(File::open(source).at(source)?);
    let mut decoder = codec.decoder(input).at(source)?;
    let mut output = BufWriter::new(File::create(dest).at(dest)?);

    let written = io::copy(&mut decoder, &mut output).at(source)?;
    output.flush().at(dest)?;
    Ok(written)
}

/// Read up to `limit` leading bytes of the decoded stream.
pub fn read_head(path: &Path, codec: Compression, limit: usize) -> Result<Vec<u8>> {
    let input = BufReader::new(File::open(path).at(path)?);
    let decoder = codec.decoder(input).at(path)?;
    let mut head = Vec::with_capacity(limit.min(64 * 1024));
    decoder.take(limit as u64).read_to_end(&mut head).at(path)?;
    Ok(head)
}

/// Calculates the SHA-256 checksum of a file as lowercase hex.
pub fn calculate_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).at(path)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn pump<R: Read, W: Write>(reader: &mut R, writer: &mut W, chunk_size: usize) -> io::Result<u64> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}
