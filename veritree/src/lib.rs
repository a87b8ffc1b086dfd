//! Recursive integrity and authenticity verification for manifest-described
//! file trees.
//!
//! A manifest is a line-oriented text file listing the contents of its
//! directory: regular files with sizes and cryptographic digests, ignored
//! paths, optional files, and references to sub-manifests covering
//! subdirectories.  Manifests chain by reference; verifying the top-level
//! manifest (optionally against an OpenPGP signature) transitively
//! authenticates the whole tree.
//!
//! This crate provides the machinery for working with such trees:
//!
//! - [`tree::ManifestTree`] loads manifest chains, resolves which manifest
//!   authoritatively covers each path, verifies filesystem state against
//!   the aggregated entries, and updates or creates manifests so that the
//!   tree re-verifies.
//! - [`manifest::ManifestFile`] and [`entry::Entry`] implement the strict
//!   line-oriented codec, including transparently compressed manifests.
//! - [`hash`] feeds a byte stream once through any number of digest
//!   algorithms while counting bytes.
//! - [`openpgp`] wraps an external OpenPGP tool for clearsign
//!   verification and signing.  No OpenPGP cryptography is implemented
//!   in-process.
//!
//! A non-goal of this crate is any sort of archive format: manifests
//! describe trees that already exist on a filesystem.  Extended
//! attributes, ownership, and timestamps of the described files are
//! neither recorded nor checked.
//!
//! # Examples
//!
//! ```no_run
//! # fn main() -> veritree::Result<()> {
//! use veritree::tree::{ManifestTree, TreeOptions, VerifyOptions};
//!
//! let mut tree = ManifestTree::open("/srv/tree", None, TreeOptions::default())?;
//! let report = tree.assert_directory_verifies("", &VerifyOptions::default())?;
//! report.into_result()
//! # }
//! ```

#![warn(missing_docs)]

use std::io;
use std::path::PathBuf;

pub mod compression;
pub mod entry;
pub mod hash;
pub mod manifest;
pub mod openpgp;
pub mod profile;
pub mod relpath;
pub mod scan;
pub mod tree;

pub use entry::Entry;
pub use hash::HashAlgorithm;
pub use manifest::ManifestFile;
pub use tree::ManifestTree;

/// Crate result specialization.
pub type Result<T> = ::std::result::Result<T, anyhow::Error>;

/// Errors returned by this crate.
///
/// Note: This enum cannot be exhaustively matched to allow future
/// extensions.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A manifest line that does not conform to the grammar.
    #[error("{path}:{line}: malformed manifest line: {raw:?}")]
    ManifestSyntax {
        /// Manifest file the line was read from.
        path: PathBuf,
        /// 1-based line number within the (decompressed, unsigned) text.
        line: usize,
        /// The offending line, verbatim.
        raw: String,
    },

    /// A path that resolves above the tree root.
    #[error("Path escapes the tree root: {0:?}")]
    PathTraversal(String),

    /// Two manifests at the same depth both claim a path.
    #[error("{path:?} is covered by entries in both {first:?} and {second:?}")]
    DuplicateCoverage {
        /// The doubly-covered tree-relative path.
        path: String,
        /// Manifest containing the first entry.
        first: String,
        /// Manifest containing the conflicting entry.
        second: String,
    },

    /// A file required by a manifest entry does not exist.
    #[error("Required file missing: {0:?}")]
    MissingFile(String),

    /// A file present on disk is not covered by any manifest.
    #[error("Stray file not covered by any manifest: {0:?}")]
    UnexpectedFile(String),

    /// A file's digest does not match the manifest entry.
    #[error("{path:?}: {algo} digest mismatch: expected {expected}, got {got}")]
    HashMismatch {
        /// Tree-relative path of the mismatching file.
        path: String,
        /// Digest algorithm token.
        algo: String,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest computed from the file.
        got: String,
    },

    /// A file's size does not match the manifest entry.
    #[error("{path:?}: size mismatch: expected {expected}, got {got}")]
    SizeMismatch {
        /// Tree-relative path of the mismatching file.
        path: String,
        /// Size recorded in the manifest.
        expected: u64,
        /// Size observed on disk.
        got: u64,
    },

    /// A digest algorithm token this build cannot compute.
    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedHash(String),

    /// A directory resides on a different filesystem than the tree root.
    #[error("Directory {0:?} is on a different filesystem")]
    ManifestCrossDevice(PathBuf),

    /// Sub-manifest references form a cycle.
    #[error("Manifest reference cycle involving {0:?}")]
    ManifestCycle(String),

    /// A sub-manifest file does not match the digests its parent records.
    ///
    /// The parent's digests are the sole trust root for the child; on
    /// mismatch the child is unusable.
    #[error("Sub-manifest {child:?} does not match the digests recorded in {parent:?}")]
    InvalidSubManifestHash {
        /// Manifest holding the reference.
        parent: String,
        /// The referenced sub-manifest path.
        child: String,
    },

    /// The top-level manifest timestamp exceeds the permitted age.
    #[error("Manifest timestamp {0} is older than permitted")]
    ManifestExpired(chrono::DateTime<chrono::Utc>),

    /// Data that was expected to carry an OpenPGP signature does not.
    #[error("No OpenPGP signature found")]
    OpenPgpNoSignature,

    /// The OpenPGP signature does not verify.
    #[error("Bad OpenPGP signature: {0}")]
    OpenPgpBadSignature(String),

    /// The signature is good but was made by an expired key.
    #[error("OpenPGP signature made with an expired key: {0}")]
    OpenPgpExpiredKey(String),

    /// The signature itself has expired.
    #[error("Expired OpenPGP signature: {0}")]
    OpenPgpExpiredSignature(String),

    /// The signature is good but was made by a revoked key.
    #[error("OpenPGP signature made with a revoked key: {0}")]
    OpenPgpRevokedKey(String),

    /// The signing key is marked as explicitly distrusted.
    #[error("OpenPGP signature made with a distrusted key: {0}")]
    OpenPgpUntrustedKey(String),

    /// The signing key is not present in the keyring.
    #[error("OpenPGP signature made with an unknown key: {0}")]
    OpenPgpUnknownKey(String),

    /// OpenPGP support is not usable in this environment.
    #[error("OpenPGP support unavailable: {0}")]
    OpenPgpUnavailable(String),

    /// The external tool failed to produce a signature.
    #[error("OpenPGP signing failed: {0}")]
    OpenPgpSigningFailure(String),

    /// Importing key material into the keyring failed.
    #[error("OpenPGP key import failed: {0}")]
    OpenPgpKeyImport(String),

    /// Refreshing keys from a keyserver or WKD failed.
    #[error("OpenPGP key refresh failed: {0}")]
    OpenPgpKeyRefresh(String),

    /// Another mutating operation is already in progress on this tree.
    #[error("Another update is already in progress")]
    Busy,

    /// An I/O error attributed to a specific path.
    #[error("{path:?}: {source}")]
    Io {
        /// The path the operation failed on.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },
}

impl Error {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Error {
        Error::Io { path: path.into(), source }
    }
}
