//! Manifest entries.
//!
//! Every non-blank line of a manifest is one tagged entry.  Entries are
//! a closed sum; consumers match exhaustively so that adding a tag is a
//! compile-visible event.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamps are written as ISO-8601 UTC with second precision.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Entry tags, in canonical write order.
///
/// The derived `Ord` is the order groups are emitted in when a manifest
/// is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    /// Manifest creation time; at most one, always the first entry.
    Timestamp,
    /// Reference to a sub-manifest file.
    Manifest,
    /// Path excluded from coverage and verification.
    Ignore,
    /// Distfile checked against a separate distfile directory.
    Dist,
    /// Regular file that must exist with the recorded content.
    Data,
    /// Package build file; semantics of [`Tag::Data`].
    Ebuild,
    /// Auxiliary file under `files/`; semantics of [`Tag::Data`].
    Aux,
    /// As [`Tag::Data`], but absence is not an error.
    Misc,
    /// File that may be absent; present content is not checked.
    Optional,
}

impl Tag {
    fn token(self) -> &'static str {
        match self {
            Tag::Timestamp => "TIMESTAMP",
            Tag::Manifest => "MANIFEST",
            Tag::Ignore => "IGNORE",
            Tag::Dist => "DIST",
            Tag::Data => "DATA",
            Tag::Ebuild => "EBUILD",
            Tag::Aux => "AUX",
            Tag::Misc => "MISC",
            Tag::Optional => "OPTIONAL",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Tag {
    type Err = ();

    fn from_str(s: &str) -> Result<Tag, ()> {
        use Tag::*;
        for tag in [Timestamp, Manifest, Ignore, Dist, Data, Ebuild, Aux,
                    Misc, Optional] {
            if tag.token() == s {
                return Ok(tag);
            }
        }
        Err(())
    }
}

/// Size and digests recorded for one file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Digests {
    /// File size in bytes.
    pub size: u64,
    /// `{algorithm token → lowercase hex digest}`.
    pub hashes: BTreeMap<String, String>,
}

impl Digests {
    /// Builds a record from a size and `{token → hex}` map.
    pub fn new(size: u64, hashes: BTreeMap<String, String>) -> Digests {
        Digests { size, hashes }
    }

    fn parse(fields: &[&str]) -> Result<Digests, String> {
        let size = fields[0].parse::<u64>()
            .map_err(|_| format!("malformed size: {:?}", fields[0]))?;
        let rest = &fields[1..];
        if rest.len() % 2 != 0 {
            return Err("odd number of digest fields".into());
        }
        let mut hashes = BTreeMap::new();
        for pair in rest.chunks(2) {
            let (algo, hex_digest) = (pair[0], pair[1]);
            if algo.is_empty()
                || !algo.bytes().all(
                    |b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
                || !algo.as_bytes()[0].is_ascii_uppercase()
            {
                return Err(format!("malformed algorithm token: {:?}", algo));
            }
            if hex::decode(hex_digest).is_err() {
                return Err(format!("malformed {} digest: {:?}",
                                   algo, hex_digest));
            }
            if hashes.insert(algo.to_string(),
                             hex_digest.to_ascii_lowercase()).is_some() {
                return Err(format!("duplicate {} digest", algo));
            }
        }
        Ok(Digests { size, hashes })
    }
}

impl fmt::Display for Digests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.size)?;
        for (algo, digest) in &self.hashes {
            write!(f, " {} {}", algo, digest)?;
        }
        Ok(())
    }
}

/// One manifest entry.
///
/// Paths are relative to the directory holding the manifest, except for
/// [`Entry::Aux`], whose stored path is relative to the `files/`
/// subdirectory, and [`Entry::Dist`], which names a file in a separate
/// distfile directory rather than in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Manifest creation time.
    Timestamp(DateTime<Utc>),
    /// Reference to a sub-manifest.
    Manifest {
        /// Path of the sub-manifest file.
        path: String,
        /// Size and digests the sub-manifest file must match.
        digests: Digests,
    },
    /// Excluded path; masks everything beneath it.
    Ignore {
        /// The excluded file or directory.
        path: String,
    },
    /// Distfile record.
    Dist {
        /// Bare filename looked up in the distfile directory.
        filename: String,
        /// Size and digests the distfile must match.
        digests: Digests,
    },
    /// Regular file.
    Data {
        /// Covered path.
        path: String,
        /// Size and digests the file must match.
        digests: Digests,
    },
    /// Package build file.
    Ebuild {
        /// Covered path.
        path: String,
        /// Size and digests the file must match.
        digests: Digests,
    },
    /// Auxiliary file under `files/`.
    Aux {
        /// Path relative to the `files/` subdirectory.
        path: String,
        /// Size and digests the file must match.
        digests: Digests,
    },
    /// Non-obligatory file; checked when present.
    Misc {
        /// Covered path.
        path: String,
        /// Size and digests the file must match when present.
        digests: Digests,
    },
    /// Potentially absent file; never content-checked.
    Optional {
        /// Covered path.
        path: String,
    },
}

impl Entry {
    /// Returns the entry's tag.
    pub fn tag(&self) -> Tag {
        match self {
            Entry::Timestamp(_) => Tag::Timestamp,
            Entry::Manifest { .. } => Tag::Manifest,
            Entry::Ignore { .. } => Tag::Ignore,
            Entry::Dist { .. } => Tag::Dist,
            Entry::Data { .. } => Tag::Data,
            Entry::Ebuild { .. } => Tag::Ebuild,
            Entry::Aux { .. } => Tag::Aux,
            Entry::Misc { .. } => Tag::Misc,
            Entry::Optional { .. } => Tag::Optional,
        }
    }

    /// The tree path this entry covers, relative to the manifest's
    /// directory.
    ///
    /// `None` for entries that do not cover a tree path
    /// ([`Entry::Timestamp`] and [`Entry::Dist`]).
    pub fn covered_path(&self) -> Option<String> {
        match self {
            Entry::Timestamp(_) | Entry::Dist { .. } => None,
            Entry::Aux { path, .. } => Some(format!("files/{}", path)),
            Entry::Manifest { path, .. }
            | Entry::Ignore { path }
            | Entry::Data { path, .. }
            | Entry::Ebuild { path, .. }
            | Entry::Misc { path, .. }
            | Entry::Optional { path } => Some(path.clone()),
        }
    }

    /// The size/digest record, for entries that carry one.
    pub fn digests(&self) -> Option<&Digests> {
        match self {
            Entry::Manifest { digests, .. }
            | Entry::Dist { digests, .. }
            | Entry::Data { digests, .. }
            | Entry::Ebuild { digests, .. }
            | Entry::Aux { digests, .. }
            | Entry::Misc { digests, .. } => Some(digests),
            Entry::Timestamp(_) | Entry::Ignore { .. }
            | Entry::Optional { .. } => None,
        }
    }

    /// Mutable access to the size/digest record.
    pub fn digests_mut(&mut self) -> Option<&mut Digests> {
        match self {
            Entry::Manifest { digests, .. }
            | Entry::Dist { digests, .. }
            | Entry::Data { digests, .. }
            | Entry::Ebuild { digests, .. }
            | Entry::Aux { digests, .. }
            | Entry::Misc { digests, .. } => Some(digests),
            Entry::Timestamp(_) | Entry::Ignore { .. }
            | Entry::Optional { .. } => None,
        }
    }

    /// Whether absence of the covered file is a verification failure.
    pub fn requires_file(&self) -> bool {
        matches!(self,
                 Entry::Manifest { .. } | Entry::Data { .. }
                 | Entry::Ebuild { .. } | Entry::Aux { .. })
    }

    /// Builds a file-describing entry for the given tag.
    ///
    /// `path` is relative to the manifest's directory; for
    /// [`Tag::Aux`] the `files/` prefix is stripped into the stored
    /// field.  Returns `None` for tags that do not describe tree files.
    pub fn for_file(tag: Tag, path: String, digests: Digests)
        -> Option<Entry>
    {
        match tag {
            Tag::Manifest => Some(Entry::Manifest { path, digests }),
            Tag::Data => Some(Entry::Data { path, digests }),
            Tag::Ebuild => Some(Entry::Ebuild { path, digests }),
            Tag::Aux => {
                let path = path.strip_prefix("files/")?.to_string();
                Some(Entry::Aux { path, digests })
            }
            Tag::Misc => Some(Entry::Misc { path, digests }),
            Tag::Timestamp | Tag::Ignore | Tag::Dist | Tag::Optional =>
                None,
        }
    }

    /// Key for the canonical write order: tag group first, then path.
    pub fn sort_key(&self) -> (Tag, String) {
        let path = match self {
            Entry::Timestamp(_) => String::new(),
            Entry::Dist { filename, .. } => filename.clone(),
            _ => self.covered_path().unwrap_or_default(),
        };
        (self.tag(), path)
    }

    /// Parses one manifest line.
    ///
    /// On failure returns a human-readable reason; the caller owns
    /// attaching file and line context.
    pub fn parse_line(line: &str) -> Result<Entry, String> {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        if fields.is_empty() {
            return Err("blank line".into());
        }
        let tag: Tag = fields[0].parse()
            .map_err(|_| format!("unknown tag: {:?}", fields[0]))?;
        let arity_err = |want: &str| {
            format!("{} entry takes {}", tag, want)
        };

        match tag {
            Tag::Timestamp => {
                if fields.len() != 2 {
                    return Err(arity_err("exactly one field"));
                }
                let ts = NaiveDateTime::parse_from_str(
                        fields[1], TIMESTAMP_FORMAT)
                    .map_err(|_| format!("malformed timestamp: {:?}",
                                         fields[1]))?;
                Ok(Entry::Timestamp(ts.and_utc()))
            }
            Tag::Ignore | Tag::Optional => {
                if fields.len() != 2 {
                    return Err(arity_err("exactly one field"));
                }
                let path = unescape(fields[1])?;
                match tag {
                    Tag::Ignore => Ok(Entry::Ignore { path }),
                    _ => Ok(Entry::Optional { path }),
                }
            }
            _ => {
                if fields.len() < 3 {
                    return Err(arity_err("a path, a size, and digests"));
                }
                let path = unescape(fields[1])?;
                let digests = Digests::parse(&fields[2..])?;
                match tag {
                    Tag::Manifest => Ok(Entry::Manifest { path, digests }),
                    Tag::Dist => {
                        if path.contains('/') {
                            return Err(format!(
                                "distfile name contains a slash: {:?}", path));
                        }
                        Ok(Entry::Dist { filename: path, digests })
                    }
                    Tag::Data => Ok(Entry::Data { path, digests }),
                    Tag::Ebuild => Ok(Entry::Ebuild { path, digests }),
                    Tag::Aux => Ok(Entry::Aux { path, digests }),
                    Tag::Misc => Ok(Entry::Misc { path, digests }),
                    Tag::Timestamp | Tag::Ignore | Tag::Optional =>
                        unreachable!(),
                }
            }
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Timestamp(ts) =>
                write!(f, "TIMESTAMP {}", ts.format(TIMESTAMP_FORMAT)),
            Entry::Ignore { path } =>
                write!(f, "IGNORE {}", escape(path)),
            Entry::Optional { path } =>
                write!(f, "OPTIONAL {}", escape(path)),
            Entry::Dist { filename, digests } =>
                write!(f, "DIST {} {}", escape(filename), digests),
            Entry::Manifest { path, digests }
            | Entry::Data { path, digests }
            | Entry::Ebuild { path, digests }
            | Entry::Aux { path, digests }
            | Entry::Misc { path, digests } =>
                write!(f, "{} {} {}", self.tag(), escape(path), digests),
        }
    }
}

/// Escapes whitespace, control characters, and the backslash in a path
/// field as `\xNN`.
pub fn escape(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for ch in path.chars() {
        match ch {
            '\\' => out.push_str("\\x5C"),
            c if (c as u32) <= 0x20 || c as u32 == 0x7F => {
                out.push_str(&format!("\\x{:02X}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`].  Rejects malformed escapes and escapes of
/// non-ASCII bytes.
pub fn unescape(field: &str) -> Result<String, String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let (x, hi, lo) = (chars.next(), chars.next(), chars.next());
        match (x, hi, lo) {
            (Some('x'), Some(hi), Some(lo))
                if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() =>
            {
                let byte = (hi.to_digit(16).unwrap() * 16
                            + lo.to_digit(16).unwrap()) as u8;
                if byte > 0x7F {
                    return Err(format!(
                        "escape of non-ASCII byte in {:?}", field));
                }
                out.push(byte as char);
            }
            _ => return Err(format!("malformed escape in {:?}", field)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sha256_line(path: &str) -> String {
        format!("DATA {} 6 SHA256 \
                 5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03",
                path)
    }

    #[test]
    fn parse_data() {
        let e = Entry::parse_line(&sha256_line("a/b.txt")).unwrap();
        assert_eq!(e.tag(), Tag::Data);
        assert_eq!(e.covered_path().unwrap(), "a/b.txt");
        let digests = e.digests().unwrap();
        assert_eq!(digests.size, 6);
        assert_eq!(digests.hashes["SHA256"],
                   "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03");
    }

    #[test]
    fn parse_timestamp() {
        let e = Entry::parse_line("TIMESTAMP 2024-01-01T00:00:00Z").unwrap();
        assert_eq!(e.to_string(), "TIMESTAMP 2024-01-01T00:00:00Z");
        assert!(Entry::parse_line("TIMESTAMP yesterday").is_err());
        assert!(Entry::parse_line("TIMESTAMP").is_err());
    }

    #[test]
    fn parse_aux_offsets_path() {
        let e = Entry::parse_line("AUX fix.patch 3 MD5 \
                                   900150983cd24fb0d6963f7d28e17f72").unwrap();
        assert_eq!(e.covered_path().unwrap(), "files/fix.patch");
        assert_eq!(e.to_string(),
                   "AUX fix.patch 3 MD5 900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn parse_rejections() {
        for line in [
            "FROB a 0",                    // unknown tag
            "DATA a -1 SHA256 aa",         // negative size
            "DATA a x SHA256 aa",          // non-numeric size
            "DATA a 0 SHA256",             // dangling algo
            "DATA a 0 SHA256 abc",         // odd-length hex
            "DATA a 0 SHA256 zz",          // non-hex
            "DATA a 0 SHA256 aa SHA256 bb", // duplicate algo
            "DATA a 0 sha256 aa",          // lowercase algo token
            "DIST a/b 0 SHA256 aa",        // slash in distfile
            "IGNORE",                      // missing path
            "DATA a\\xZZ 0 SHA256 aa",     // bad escape
        ] {
            assert!(Entry::parse_line(line).is_err(), "accepted {:?}", line);
        }
    }

    #[test]
    fn digest_hex_is_normalized() {
        let e = Entry::parse_line("DATA a 1 SHA256 AB").unwrap();
        assert_eq!(e.digests().unwrap().hashes["SHA256"], "ab");
    }

    #[test]
    fn escape_round_trip() {
        for name in ["plain.txt", "with space.txt", "tab\there",
                     "back\\slash", "new\nline"] {
            let escaped = escape(name);
            assert!(!escaped.contains(' ') || !name.contains(' ')
                    || escaped.contains("\\x20"));
            assert_eq!(unescape(&escaped).unwrap(), name);
        }
        assert_eq!(escape("with space.txt"), "with\\x20space.txt");
    }

    #[test]
    fn escaped_line_round_trips() {
        let e = Entry::Data {
            path: "dir/with space.txt".into(),
            digests: Digests::new(0, BTreeMap::new()),
        };
        let line = e.to_string();
        assert_eq!(line, "DATA dir/with\\x20space.txt 0");
        assert_eq!(Entry::parse_line(&line).unwrap(), e);
    }

    #[test]
    fn sort_order_groups_tags() {
        let manifest = Entry::parse_line(
            "MANIFEST sub/Manifest 1 MD5 900150983cd24fb0d6963f7d28e17f72")
            .unwrap();
        let data = Entry::parse_line(&sha256_line("a")).unwrap();
        let ignore = Entry::parse_line("IGNORE z").unwrap();
        let mut entries = vec![data.clone(), ignore.clone(), manifest.clone()];
        entries.sort_by_key(Entry::sort_key);
        assert_eq!(entries, vec![manifest, ignore, data]);
    }

    quickcheck::quickcheck! {
        fn unescape_escape_identity(parts: Vec<u8>) -> bool {
            // Arbitrary printable-ish path from arbitrary bytes.
            let name: String = parts.iter()
                .map(|&b| (b % 0x5F + 0x20) as u8 as char)
                .collect();
            unescape(&escape(&name)).unwrap() == name
        }
    }
}
