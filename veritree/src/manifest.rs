//! Reading and writing whole manifest files.
//!
//! A [`ManifestFile`] is an ordered list of entries plus provenance:
//! where the file lives, how it is compressed, and whether it carried
//! an OpenPGP signature.  Parsing is strict; anything outside the
//! grammar fails with [`Error::ManifestSyntax`] carrying the line.

use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::compression::{self, Format};
use crate::entry::{Entry, Tag};
use crate::openpgp;
use crate::{Error, Result};

/// Signature provenance of a loaded manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    /// The file carried no clearsign envelope.
    Unsigned,
    /// An envelope was present and stripped without verification.
    SignedUnverified,
    /// The envelope was verified by the OpenPGP tool.
    SignedVerified(openpgp::Signature),
}

impl SignatureStatus {
    /// Whether the file carried an envelope at all.
    pub fn is_signed(&self) -> bool {
        !matches!(self, SignatureStatus::Unsigned)
    }
}

/// One manifest file.
pub struct ManifestFile {
    path: PathBuf,
    compression: Format,
    signature: SignatureStatus,
    entries: Vec<Entry>,
    dirty: bool,
}

impl ManifestFile {
    /// Creates an empty, unsaved manifest at `path`.
    pub fn new(path: PathBuf, compression: Format) -> ManifestFile {
        ManifestFile {
            path,
            compression,
            signature: SignatureStatus::Unsigned,
            entries: Vec::new(),
            dirty: true,
        }
    }

    /// Loads a manifest from disk, transparently decompressing.
    ///
    /// A clearsign envelope is verified through `openpgp` when one is
    /// given and usable; otherwise it is stripped unverified and
    /// recorded as such.
    pub fn load(path: &Path, openpgp_ctx: Option<&openpgp::Context>)
        -> Result<ManifestFile>
    {
        let mut raw = Vec::new();
        compression::open(path)?
            .read_to_end(&mut raw)
            .map_err(|e| Error::io(path, e))?;

        let (text, signature) = if openpgp::is_clearsigned(&raw) {
            match openpgp_ctx {
                Some(ctx) if ctx.is_available() => {
                    let (text, sig) = ctx.verify(&raw)?;
                    debug!("{:?}: good signature from {}",
                           path, sig.fingerprint);
                    (text, SignatureStatus::SignedVerified(sig))
                }
                _ => (openpgp::strip_clearsign(&raw)?,
                      SignatureStatus::SignedUnverified),
            }
        } else {
            (raw, SignatureStatus::Unsigned)
        };

        let entries = parse_entries(path, &text)?;
        Ok(ManifestFile {
            path: path.to_path_buf(),
            compression: Format::from_path(path),
            signature,
            entries,
            dirty: false,
        })
    }

    /// The on-disk location of this manifest.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Moves the manifest to a new on-disk location and compression.
    ///
    /// Only affects the next [`ManifestFile::save`]; the old file is
    /// not removed here.
    pub fn relocate(&mut self, path: PathBuf, compression: Format) {
        if self.path != path || self.compression != compression {
            self.path = path;
            self.compression = compression;
            self.dirty = true;
        }
    }

    /// On-disk compression format.
    pub fn compression(&self) -> Format {
        self.compression
    }

    /// Signature provenance observed at load time.
    pub fn signature(&self) -> &SignatureStatus {
        &self.signature
    }

    /// The entries, in the order they were read or inserted.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Mutable access to the entries.  Marks the manifest dirty.
    pub fn entries_mut(&mut self) -> &mut Vec<Entry> {
        self.dirty = true;
        &mut self.entries
    }

    /// Whether in-memory state differs from disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The manifest creation time, if recorded.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().find_map(|e| match e {
            Entry::Timestamp(ts) => Some(*ts),
            _ => None,
        })
    }

    /// Sets or replaces the creation time.
    pub fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        self.dirty = true;
        self.entries.retain(|e| !matches!(e, Entry::Timestamp(_)));
        self.entries.insert(0, Entry::Timestamp(ts));
    }

    /// Serializes to canonical text: the timestamp first, then entries
    /// grouped by tag in fixed order and sorted by path within each
    /// group.
    pub fn serialize(&self) -> Vec<u8> {
        let mut sorted: Vec<&Entry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let mut out = Vec::new();
        for entry in sorted {
            // Entry's Display emits no newline; lines are LF-terminated.
            writeln!(out, "{}", entry).expect("writing to a Vec");
        }
        out
    }

    /// Writes the manifest to its path, atomically.
    ///
    /// With `signer`, the canonical text is clearsigned before being
    /// written (and compressed, if the format says so).
    pub fn save(&mut self,
                signer: Option<(&openpgp::Context, Option<&str>)>)
        -> Result<()>
    {
        let mut text = self.serialize();
        if let Some((ctx, key_id)) = signer {
            text = ctx.clear_sign(&text, key_id)?;
            self.signature = SignatureStatus::SignedUnverified;
        }
        let mut writer = compression::Writer::create(
            &self.path, self.compression)?;
        writer.write_all(&text)
            .map_err(|e| Error::io(&self.path, e))?;
        writer.finish()?;
        self.dirty = false;
        Ok(())
    }
}

impl fmt::Debug for ManifestFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestFile")
            .field("path", &self.path)
            .field("compression", &self.compression)
            .field("signature", &self.signature)
            .field("entries", &self.entries.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

fn parse_entries(path: &Path, text: &[u8]) -> Result<Vec<Entry>> {
    let text = std::str::from_utf8(text).map_err(|_| Error::ManifestSyntax {
        path: path.to_path_buf(),
        line: 0,
        raw: "<not valid UTF-8>".into(),
    })?;

    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let syntax = || Error::ManifestSyntax {
            path: path.to_path_buf(),
            line: idx + 1,
            raw: line.to_string(),
        };
        let entry = match Entry::parse_line(line) {
            Ok(entry) => entry,
            Err(reason) => {
                debug!("{:?}:{}: {}", path, idx + 1, reason);
                return Err(syntax().into());
            }
        };
        // The timestamp must be the first entry and appear only once.
        if entry.tag() == Tag::Timestamp && !entries.is_empty() {
            return Err(syntax().into());
        }
        entries.push(entry);
    }
    Ok(entries)
}
