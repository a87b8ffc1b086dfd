//! Transparent manifest compression.
//!
//! Manifests may be stored gzip-, bzip2-, or xz-compressed; the format
//! is chosen purely by filename suffix.  Writing always goes through a
//! temporary file in the destination directory that is flushed, synced,
//! and renamed into place, so that an interrupted write never replaces
//! a valid manifest with a truncated one.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::{Error, Result};

/// On-disk compression of a manifest file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Plain text.
    #[default]
    None,
    /// gzip (`.gz`).
    Gzip,
    /// bzip2 (`.bz2`).
    Bzip2,
    /// xz (`.xz`).
    Xz,
}

impl Format {
    /// Detects the format from a filename suffix.
    pub fn from_path(path: &Path) -> Format {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Format::Gzip,
            Some("bz2") => Format::Bzip2,
            Some("xz") => Format::Xz,
            _ => Format::None,
        }
    }

    /// The filename suffix for this format, including the dot, or `""`.
    pub fn suffix(self) -> &'static str {
        match self {
            Format::None => "",
            Format::Gzip => ".gz",
            Format::Bzip2 => ".bz2",
            Format::Xz => ".xz",
        }
    }

    /// Parses a user-facing format name (`none`, `gz`, `bz2`, `xz`).
    pub fn from_name(name: &str) -> Result<Format> {
        match name {
            "none" => Ok(Format::None),
            "gz" | "gzip" => Ok(Format::Gzip),
            "bz2" | "bzip2" => Ok(Format::Bzip2),
            "xz" => Ok(Format::Xz),
            other => Err(Error::InvalidArgument(
                format!("unknown compression format: {}", other)).into()),
        }
    }

    /// Wraps a raw reader in the matching decompressor.
    pub fn decode<'a, R: Read + 'a>(self, inner: R) -> Box<dyn Read + 'a> {
        match self {
            Format::None => Box::new(inner),
            Format::Gzip => Box::new(flate2::read::GzDecoder::new(inner)),
            Format::Bzip2 => Box::new(bzip2::read::BzDecoder::new(inner)),
            Format::Xz => Box::new(xz2::read::XzDecoder::new(inner)),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::None => f.write_str("none"),
            Format::Gzip => f.write_str("gz"),
            Format::Bzip2 => f.write_str("bz2"),
            Format::Xz => f.write_str("xz"),
        }
    }
}

/// Opens a file for reading, transparently decompressing by suffix.
pub fn open(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    Ok(Format::from_path(path).decode(file))
}

/// Strips a recognized compression suffix from a manifest filename.
pub fn strip_suffix(name: &str) -> &str {
    for fmt in [Format::Gzip, Format::Bzip2, Format::Xz] {
        if let Some(base) = name.strip_suffix(fmt.suffix()) {
            return base;
        }
    }
    name
}

enum Encoder {
    Plain(NamedTempFile),
    Gzip(flate2::write::GzEncoder<NamedTempFile>),
    Bzip2(bzip2::write::BzEncoder<NamedTempFile>),
    Xz(xz2::write::XzEncoder<NamedTempFile>),
}

/// An atomic, optionally compressing file writer.
///
/// Data is staged in a temporary file next to the destination.  Nothing
/// is visible at the destination path until [`Writer::finish`] runs the
/// compressor to completion, syncs, and renames.  Dropping the writer
/// without finishing unlinks the temporary.
pub struct Writer {
    dest: PathBuf,
    encoder: Encoder,
}

impl Writer {
    /// Starts writing to `path` in the given format.
    pub fn create(path: &Path, format: Format) -> Result<Writer> {
        let dir = path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)
            .map_err(|e| Error::io(path, e))?;
        let encoder = match format {
            Format::None => Encoder::Plain(tmp),
            Format::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                tmp, flate2::Compression::default())),
            Format::Bzip2 => Encoder::Bzip2(bzip2::write::BzEncoder::new(
                tmp, bzip2::Compression::best())),
            Format::Xz => Encoder::Xz(xz2::write::XzEncoder::new(tmp, 6)),
        };
        Ok(Writer { dest: path.to_path_buf(), encoder })
    }

    /// Finalizes the compressor, syncs, and renames into place.
    pub fn finish(self) -> Result<()> {
        let map = |e: io::Error| Error::io(&self.dest, e);
        let tmp = match self.encoder {
            Encoder::Plain(tmp) => tmp,
            Encoder::Gzip(enc) => enc.finish().map_err(map)?,
            Encoder::Bzip2(enc) => enc.finish().map_err(map)?,
            Encoder::Xz(enc) => enc.finish().map_err(map)?,
        };
        tmp.as_file().sync_all().map_err(|e| Error::io(&self.dest, e))?;
        tmp.persist(&self.dest)
            .map_err(|e| Error::io(&self.dest, e.error))?;
        Ok(())
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.encoder {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Gzip(w) => w.write(buf),
            Encoder::Bzip2(w) => w.write(buf),
            Encoder::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.encoder {
            Encoder::Plain(w) => w.flush(),
            Encoder::Gzip(w) => w.flush(),
            Encoder::Bzip2(w) => w.flush(),
            Encoder::Xz(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn suffix_detection() {
        assert_eq!(Format::from_path(Path::new("Manifest")), Format::None);
        assert_eq!(Format::from_path(Path::new("Manifest.gz")), Format::Gzip);
        assert_eq!(Format::from_path(Path::new("Manifest.bz2")), Format::Bzip2);
        assert_eq!(Format::from_path(Path::new("Manifest.xz")), Format::Xz);
        assert_eq!(strip_suffix("Manifest.gz"), "Manifest");
        assert_eq!(strip_suffix("Manifest"), "Manifest");
    }

    #[test]
    fn round_trip_all_formats() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"DATA a 0\n".repeat(1000);
        for format in [Format::None, Format::Gzip, Format::Bzip2, Format::Xz] {
            let path = dir.path()
                .join(format!("Manifest{}", format.suffix()));
            let mut w = Writer::create(&path, format).unwrap();
            w.write_all(&payload).unwrap();
            w.finish().unwrap();

            let mut back = Vec::new();
            open(&path).unwrap().read_to_end(&mut back).unwrap();
            assert_eq!(back, payload, "format {:?}", format);
        }
    }

    #[test]
    fn unfinished_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Manifest");
        {
            let mut w = Writer::create(&path, Format::None).unwrap();
            w.write_all(b"partial").unwrap();
            // Dropped without finish().
        }
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn finished_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Manifest");
        std::fs::write(&path, b"old").unwrap();
        let mut w = Writer::create(&path, Format::None).unwrap();
        w.write_all(b"new").unwrap();
        w.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }
}
