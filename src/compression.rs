//! Compressed Manifest support.
//!
//! The format of a Manifest file is inferred from its name: `Manifest.gz`,
//! `Manifest.bz2`, `Manifest.lzma` and `Manifest.xz` are all valid names for
//! the same logical Manifest.

use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use xz2::stream::{LzmaOptions, Stream};

pub const MANIFEST_FILENAME: &str = "Manifest";

const LZMA_PRESET: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    Gz,
    Bz2,
    Lzma,
    Xz,
}

impl CompressionFormat {
    pub const ALL: [CompressionFormat; 4] = [
        CompressionFormat::Gz,
        CompressionFormat::Bz2,
        CompressionFormat::Lzma,
        CompressionFormat::Xz,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            CompressionFormat::Gz => "gz",
            CompressionFormat::Bz2 => "bz2",
            CompressionFormat::Lzma => "lzma",
            CompressionFormat::Xz => "xz",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.suffix() == name)
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Returns the compression format implied by a file name's suffix.
pub fn compression_for_filename(path: &str) -> Option<CompressionFormat> {
    let (_, suffix) = path.rsplit_once('.')?;
    CompressionFormat::from_name(suffix)
}

/// Strips a recognized compression suffix, if any.
pub fn strip_compression_suffix(path: &str) -> &str {
    match compression_for_filename(path) {
        Some(format) => &path[..path.len() - format.suffix().len() - 1],
        None => path,
    }
}

/// All file names under which a Manifest may be stored, uncompressed first.
pub fn manifest_filenames() -> impl Iterator<Item = String> {
    std::iter::once(MANIFEST_FILENAME.to_string()).chain(
        CompressionFormat::ALL
            .into_iter()
            .map(|f| format!("{MANIFEST_FILENAME}.{}", f.suffix())),
    )
}

pub fn is_manifest_filename(name: &str) -> bool {
    strip_compression_suffix(name) == MANIFEST_FILENAME
}

/// Opens `path` for reading, transparently decompressing by suffix.
pub fn open_decompressed(path: &Path) -> io::Result<Box<dyn Read>> {
    let file = BufReader::new(File::open(path)?);
    let format = path.to_str().and_then(compression_for_filename);
    Ok(match format {
        None => Box::new(file),
        Some(CompressionFormat::Gz) => Box::new(flate2::read::MultiGzDecoder::new(file)),
        Some(CompressionFormat::Bz2) => Box::new(bzip2::read::MultiBzDecoder::new(file)),
        Some(CompressionFormat::Xz) => Box::new(xz2::read::XzDecoder::new_multi_decoder(file)),
        Some(CompressionFormat::Lzma) => {
            let stream = Stream::new_lzma_decoder(u64::MAX).map_err(io::Error::other)?;
            Box::new(xz2::read::XzDecoder::new_stream(file, stream))
        }
    })
}

/// Compresses `data` into a new buffer.
pub fn compress(format: CompressionFormat, data: &[u8]) -> io::Result<Vec<u8>> {
    match format {
        CompressionFormat::Gz => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        CompressionFormat::Bz2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        CompressionFormat::Xz => {
            let mut encoder = xz2::write::XzEncoder::new(Vec::new(), LZMA_PRESET);
            encoder.write_all(data)?;
            encoder.finish()
        }
        CompressionFormat::Lzma => {
            let options = LzmaOptions::new_preset(LZMA_PRESET).map_err(io::Error::other)?;
            let stream = Stream::new_lzma_encoder(&options).map_err(io::Error::other)?;
            let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}
