//! Named bundles of manifest-generation defaults.
//!
//! A profile decides which digests new entries carry, how manifests
//! are compressed, where sub-manifests are split off, and which tag a
//! file gets from its path.  The set of profiles is closed; callers
//! select one by name.

use crate::compression::Format;
use crate::entry::Tag;
use crate::hash::HashAlgorithm;
use crate::relpath;
use crate::{Error, Result};

/// A named bundle of manifest-generation defaults.
#[derive(Debug)]
pub struct Profile {
    name: &'static str,
    hashes: &'static [HashAlgorithm],
    compression: Format,
    compress_watermark: Option<u64>,
    /// Directories at this depth get their own sub-manifest.
    split_depth: Option<usize>,
    /// Whether the ebuild-repository tag layout applies.
    ebuild_layout: bool,
}

/// Plain trees: two modern digests, no compression, one manifest.
static DEFAULT: Profile = Profile {
    name: "default",
    hashes: &[HashAlgorithm::SHA256, HashAlgorithm::SHA512],
    compression: Format::None,
    compress_watermark: None,
    split_depth: None,
    ebuild_layout: false,
};

/// Ebuild repositories.
static EBUILD: Profile = Profile {
    name: "ebuild",
    hashes: &[HashAlgorithm::BLAKE2B, HashAlgorithm::SHA512],
    compression: Format::None,
    compress_watermark: None,
    split_depth: Some(2),
    ebuild_layout: true,
};

/// Ebuild repositories predating the modern digest set.
static OLD_EBUILD: Profile = Profile {
    name: "old-ebuild",
    hashes: &[HashAlgorithm::MD5, HashAlgorithm::RMD160,
              HashAlgorithm::SHA1, HashAlgorithm::SHA256,
              HashAlgorithm::SHA512, HashAlgorithm::WHIRLPOOL],
    compression: Format::None,
    compress_watermark: None,
    split_depth: Some(2),
    ebuild_layout: true,
};

/// Ebuild repositories with generated metadata caches: like `ebuild`,
/// but large manifests are stored gzip-compressed.
static EGENCACHE: Profile = Profile {
    name: "egencache",
    hashes: &[HashAlgorithm::BLAKE2B, HashAlgorithm::SHA512],
    compression: Format::Gzip,
    compress_watermark: Some(32 * 1024),
    split_depth: Some(2),
    ebuild_layout: true,
};

static ALL: [&Profile; 4] = [&DEFAULT, &EBUILD, &OLD_EBUILD, &EGENCACHE];

impl Profile {
    /// Looks a profile up by name.
    pub fn find(name: &str) -> Result<&'static Profile> {
        ALL.iter().copied()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::InvalidArgument(
                format!("unknown profile: {:?}", name)).into())
    }

    /// The default profile.
    pub fn default() -> &'static Profile {
        &DEFAULT
    }

    /// All profile names, for diagnostics.
    pub fn names() -> Vec<&'static str> {
        ALL.iter().map(|p| p.name).collect()
    }

    /// This profile's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Digest algorithms new and rewritten entries carry.
    pub fn hashes(&self) -> &'static [HashAlgorithm] {
        self.hashes
    }

    /// Compression for manifests written under this profile.
    pub fn compression(&self) -> Format {
        self.compression
    }

    /// Manifests whose serialized size reaches this many bytes gain
    /// the compressed suffix; smaller ones stay plain.
    pub fn compress_watermark(&self) -> Option<u64> {
        self.compress_watermark
    }

    /// Whether a directory (tree-relative) should receive its own
    /// sub-manifest when creating manifests from scratch.  The
    /// ebuild-family profiles split at package directories.
    pub fn wants_submanifest(&self, dir: &str) -> bool {
        match self.split_depth {
            Some(depth) => !dir.is_empty() && relpath::depth(dir) == depth,
            None => false,
        }
    }

    /// Classifies a file path (relative to its covering manifest's
    /// directory) into the tag a fresh entry gets.
    pub fn classify(&self, rel_path: &str) -> Tag {
        if !self.ebuild_layout {
            return Tag::Data;
        }
        let name = relpath::file_name(rel_path);
        if name.ends_with(".ebuild") {
            Tag::Ebuild
        } else if rel_path.starts_with("files/") {
            Tag::Aux
        } else if name == "metadata.xml" || name.starts_with("ChangeLog") {
            Tag::Misc
        } else {
            Tag::Data
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup() {
        assert_eq!(Profile::find("default").unwrap().name(), "default");
        assert_eq!(Profile::find("egencache").unwrap().compression(),
                   Format::Gzip);
        assert!(Profile::find("nonesuch").is_err());
        assert_eq!(Profile::names().len(), 4);
    }

    #[test]
    fn classification() {
        let p = Profile::find("ebuild").unwrap();
        assert_eq!(p.classify("foo-1.0.ebuild"), Tag::Ebuild);
        assert_eq!(p.classify("files/fix.patch"), Tag::Aux);
        assert_eq!(p.classify("metadata.xml"), Tag::Misc);
        assert_eq!(p.classify("ChangeLog-2023"), Tag::Misc);
        assert_eq!(p.classify("README"), Tag::Data);

        let d = Profile::default();
        assert_eq!(d.classify("foo-1.0.ebuild"), Tag::Data);
        assert_eq!(d.classify("files/fix.patch"), Tag::Data);
    }

    #[test]
    fn splitting() {
        let p = Profile::find("ebuild").unwrap();
        assert!(p.wants_submanifest("app-misc/tool"));
        assert!(!p.wants_submanifest(""));
        assert!(!p.wants_submanifest("app-misc"));
        assert!(!p.wants_submanifest("app-misc/tool/files"));
        assert!(!Profile::default().wants_submanifest("app-misc/tool"));
    }
}
