//! The loaded-manifest graph and tree-level operations.
//!
//! A [`ManifestTree`] owns every manifest loaded so far, keyed by
//! tree-relative path, plus a derived coverage index mapping each
//! covered path to the single entry that governs it.  Manifests are
//! loaded on demand: verifying one path only opens the chain of
//! manifests needed to cover it.
//!
//! Trust flows strictly downward.  The top-level manifest is
//! authenticated by its OpenPGP signature (when requested); every
//! sub-manifest is authenticated solely by the size and digests its
//! parent records for it.

use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, info};

use crate::compression::{self, Format};
use crate::entry::{Digests, Entry, Tag};
use crate::hash::{self, HashAlgorithm};
use crate::manifest::{ManifestFile, SignatureStatus};
use crate::openpgp;
use crate::profile::Profile;
use crate::relpath;
use crate::scan::{self, HashJob, Hashed};
use crate::{Error, Result};

/// Filenames tried, in order, when locating the top-level manifest.
const TOP_CANDIDATES: [&str; 4] =
    ["Manifest", "Manifest.gz", "Manifest.bz2", "Manifest.xz"];

/// How a tree is opened.
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Verify an OpenPGP envelope on the top-level manifest when an
    /// OpenPGP context is supplied and usable.
    pub verify_signature: bool,
    /// Fail unless the top-level manifest carries a verified
    /// signature.
    pub require_signed: bool,
    /// Load sub-manifests on demand instead of up front.
    pub lazy: bool,
}

impl Default for TreeOptions {
    fn default() -> TreeOptions {
        TreeOptions {
            verify_signature: true,
            require_signed: false,
            lazy: false,
        }
    }
}

/// Options for [`ManifestTree::assert_directory_verifies`].
#[derive(Debug, Default)]
pub struct VerifyOptions {
    /// Stop at the first problem instead of collecting all of them.
    pub fail_fast: bool,
    /// Worker threads for hashing; `0` means one per CPU.
    pub jobs: usize,
    /// Maximum acceptable age of the top-level manifest timestamp.
    pub max_age: Option<chrono::Duration>,
    /// Refuse to cross onto another filesystem.
    pub one_file_system: bool,
    /// Check DIST entries against this directory.  Without it they are
    /// not checked at all.
    pub distdir: Option<PathBuf>,
}

/// Options for [`ManifestTree::update`] and [`ManifestTree::create`].
#[derive(Debug)]
pub struct UpdateOptions {
    /// Profile supplying defaults.
    pub profile: &'static Profile,
    /// Digest set overriding the profile's.
    pub hashes: Option<Vec<HashAlgorithm>>,
    /// Sign the top-level manifest; `None` re-signs previously signed
    /// trees when a usable OpenPGP context is present.
    pub sign: Option<bool>,
    /// Key to sign with; the tool's default key otherwise.
    pub openpgp_id: Option<String>,
    /// Record a fresh timestamp even if the tree had none.
    pub timestamp: bool,
    /// Compression overriding the profile's.
    pub compress_format: Option<Format>,
    /// Serialized size from which sub-manifests are compressed,
    /// overriding the profile's.
    pub compress_watermark: Option<u64>,
    /// Rewrite every manifest, not just those whose subtree changed.
    ///
    /// The default is incremental: untouched manifests keep their
    /// on-disk bytes.  A forced rewrite renormalizes all of them.
    pub force_rewrite: bool,
    /// Worker threads for hashing; `0` means one per CPU.
    pub jobs: usize,
    /// Refuse to cross onto another filesystem.
    pub one_file_system: bool,
}

impl Default for UpdateOptions {
    fn default() -> UpdateOptions {
        UpdateOptions {
            profile: Profile::default(),
            hashes: None,
            sign: None,
            openpgp_id: None,
            timestamp: false,
            compress_format: None,
            compress_watermark: None,
            force_rewrite: false,
            jobs: 0,
            one_file_system: false,
        }
    }
}

/// What governs a tree path.
#[derive(Debug)]
pub enum PathCoverage<'a> {
    /// The path is masked by an IGNORE entry (possibly of an ancestor
    /// directory) and exempt from verification.
    Ignored,
    /// A single authoritative entry covers the path.
    Covered {
        /// Key of the manifest holding the entry.
        manifest: &'a str,
        /// The governing entry.
        entry: &'a Entry,
    },
    /// No loaded manifest covers the path.
    Uncovered,
}

/// Accumulated verification problems, in sorted path order.
#[derive(Debug, Default)]
pub struct VerifyReport {
    issues: Vec<Error>,
}

impl VerifyReport {
    /// Whether verification passed.
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    /// The collected problems.
    pub fn issues(&self) -> &[Error] {
        &self.issues
    }

    /// Converts into a `Result`, aggregating all problems into the
    /// error message.
    pub fn into_result(self) -> Result<()> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("{}", self))
        }
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} verification failure(s):", self.issues.len())?;
        for issue in &self.issues {
            writeln!(f, "  {}", issue)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CoverageRef {
    key: String,
    index: usize,
}

/// A tree of manifests rooted at one top-level manifest.
#[derive(Debug)]
pub struct ManifestTree {
    root: PathBuf,
    top_key: String,
    manifests: BTreeMap<String, ManifestFile>,
    /// Covered path → authoritative entry.  Derived; rebuilt after
    /// every mutation of `manifests`.
    files: BTreeMap<String, CoverageRef>,
    /// Tree paths masked by IGNORE entries.
    ignores: BTreeSet<String>,
    openpgp: Option<openpgp::Context>,
    busy: AtomicBool,
}

impl ManifestTree {
    /// Opens the tree rooted at `root`, locating and loading the
    /// top-level manifest.
    ///
    /// With `TreeOptions::lazy`, sub-manifests are only loaded once an
    /// operation needs them; otherwise the whole graph is loaded and
    /// checked here.
    pub fn open(root: impl AsRef<Path>, openpgp_ctx: Option<openpgp::Context>,
                options: TreeOptions)
        -> Result<ManifestTree>
    {
        let root = root.as_ref().to_path_buf();
        let top_key = TOP_CANDIDATES.iter()
            .find(|name| root.join(name).is_file())
            .map(|name| name.to_string())
            .ok_or_else(|| Error::InvalidArgument(
                format!("no top-level manifest in {:?}", root)))?;

        let verifier = if options.verify_signature {
            openpgp_ctx.as_ref()
        } else {
            None
        };
        let top = ManifestFile::load(&root.join(&top_key), verifier)?;
        if options.require_signed {
            match top.signature() {
                SignatureStatus::SignedVerified(_) => (),
                SignatureStatus::Unsigned =>
                    return Err(Error::OpenPgpNoSignature.into()),
                SignatureStatus::SignedUnverified =>
                    return Err(Error::OpenPgpUnavailable(
                        "a verified signature is required but no usable \
                         OpenPGP tool is present".into()).into()),
            }
        }
        debug!("loaded top-level manifest {:?} ({} entries)",
               top_key, top.entries().len());

        let mut tree = ManifestTree {
            root,
            top_key: top_key.clone(),
            manifests: BTreeMap::new(),
            files: BTreeMap::new(),
            ignores: BTreeSet::new(),
            openpgp: openpgp_ctx,
            busy: AtomicBool::new(false),
        };
        tree.insert_manifest(top_key, top)?;
        if options.lazy {
            tree.rebuild_coverage()?;
        } else {
            tree.ensure_loaded_for("", true, false)?;
        }
        Ok(tree)
    }

    /// The filesystem directory the tree lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The top-level manifest.
    pub fn top(&self) -> &ManifestFile {
        &self.manifests[&self.top_key]
    }

    /// Keys of all manifests loaded so far, in sorted order.
    pub fn loaded_manifests(&self) -> impl Iterator<Item = &str> {
        self.manifests.keys().map(String::as_str)
    }

    /// Resolves the entry governing `path` among the *loaded*
    /// manifests.  Use [`ManifestTree::load_manifests_for_path`] first
    /// when the tree was opened lazily.
    pub fn lookup(&self, path: &str) -> PathCoverage<'_> {
        if ignored_in(&self.ignores, path) {
            return PathCoverage::Ignored;
        }
        match self.files.get(path) {
            Some(cov) => PathCoverage::Covered {
                manifest: &cov.key,
                entry: &self.manifests[&cov.key].entries()[cov.index],
            },
            None => PathCoverage::Uncovered,
        }
    }

    /// Loads exactly the manifest chain needed to cover `path`.
    pub fn load_manifests_for_path(&mut self, path: &str) -> Result<()> {
        let path = relpath::normalize(path)?;
        self.ensure_loaded_for(&path, false, false)
    }

    /// Verifies every path under `subtree` against the manifests.
    ///
    /// Problems are collected into the report (in sorted path order)
    /// rather than failing at the first; `fail_fast` restores the
    /// latter behavior.  Syntax errors, trust-chain breaks, and I/O
    /// failures on manifests themselves abort with `Err`.
    pub fn assert_directory_verifies(&mut self, subtree: &str,
                                     opts: &VerifyOptions)
        -> Result<VerifyReport>
    {
        let sub = relpath::normalize(subtree)?;
        self.ensure_loaded_for(&sub, true, false)?;

        let mut issues: BTreeMap<String, Vec<Error>> = BTreeMap::new();
        let mut record = |issues: &mut BTreeMap<String, Vec<Error>>,
                          key: String, err: Error| {
            issues.entry(key).or_default().push(err);
        };

        if let Some(max_age) = opts.max_age {
            if let Some(ts) = self.top().timestamp() {
                if Utc::now() - ts > max_age {
                    record(&mut issues, String::new(),
                           Error::ManifestExpired(ts));
                }
            }
        }

        let ignores = self.ignores.clone();
        let walk = scan::walk(&self.root, &sub,
                              &|rel| ignored_in(&ignores, rel),
                              opts.one_file_system)?;
        for issue in walk.issues {
            let key = issue_path(&issue);
            record(&mut issues, key, issue);
        }

        let walked: BTreeSet<&str> =
            walk.files.iter().map(|f| f.path.as_str()).collect();
        let mut jobs: Vec<HashJob> = Vec::new();
        let mut expected: BTreeMap<String, BTreeMap<String, String>> =
            BTreeMap::new();

        for file in &walk.files {
            match self.lookup(&file.path) {
                PathCoverage::Ignored => (),
                PathCoverage::Uncovered => {
                    // Loaded manifests are roots of trust, not strays.
                    if !self.manifests.contains_key(&file.path) {
                        record(&mut issues, file.path.clone(),
                               Error::UnexpectedFile(file.path.clone()));
                    }
                }
                PathCoverage::Covered { entry, .. } => {
                    let digests = match entry.digests() {
                        Some(digests) => digests,
                        // OPTIONAL: presence is permitted, content is
                        // not checked.
                        None => continue,
                    };
                    if digests.size != file.size {
                        record(&mut issues, file.path.clone(),
                               Error::SizeMismatch {
                                   path: file.path.clone(),
                                   expected: digests.size,
                                   got: file.size,
                               });
                        continue;
                    }
                    match algo_set(digests, &mut issues, &file.path) {
                        Some(algos) if !algos.is_empty() => {
                            expected.insert(file.path.clone(),
                                            digests.hashes.clone());
                            jobs.push(HashJob {
                                path: file.path.clone(),
                                fs_path: file.fs_path.clone(),
                                algos,
                                expected_size: Some(digests.size),
                            });
                        }
                        _ => (),
                    }
                }
            }
        }

        for (tree_path, cov) in &self.files {
            if !relpath::is_within(&sub, tree_path)
                || walked.contains(tree_path.as_str())
                || ignored_in(&self.ignores, tree_path)
                || hidden(tree_path)
            {
                continue;
            }
            let entry = &self.manifests[&cov.key].entries()[cov.index];
            if entry.requires_file() {
                record(&mut issues, tree_path.clone(),
                       Error::MissingFile(tree_path.clone()));
            }
        }

        if let Some(distdir) = &opts.distdir {
            self.distfile_jobs(&sub, distdir, &mut jobs, &mut expected,
                               &mut issues, &mut record);
        }

        if opts.fail_fast && !issues.is_empty() {
            return Ok(flatten(issues, true));
        }

        let cancel = AtomicBool::new(false);
        let fail_fast = opts.fail_fast;
        let total =
            |m: &BTreeMap<String, Vec<Error>>| -> usize {
                m.values().map(Vec::len).sum()
            };
        scan::run_jobs(jobs, opts.jobs, &cancel, |path, outcome| {
            let before = total(&issues);
            match outcome {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
                Err(e) => record(&mut issues, path.clone(),
                                 Error::io(path.clone(), e)),
                Ok(Hashed::WrongSize { expected, got }) => {
                    record(&mut issues, path.clone(), Error::SizeMismatch {
                        path: path.clone(), expected, got,
                    });
                }
                Ok(Hashed::Digests { hashes, .. }) => {
                    for (algo, want) in &expected[&path] {
                        match hashes.get(algo) {
                            Some(got) if got != want => {
                                record(&mut issues, path.clone(),
                                       Error::HashMismatch {
                                           path: path.clone(),
                                           algo: algo.clone(),
                                           expected: want.clone(),
                                           got: got.clone(),
                                       });
                            }
                            _ => (),
                        }
                    }
                }
            }
            !(fail_fast && total(&issues) > before)
        });

        Ok(flatten(issues, opts.fail_fast))
    }

    /// Verifies a single path, loading only the manifest chain that
    /// covers it.
    pub fn assert_path_verifies(&mut self, path: &str) -> Result<()> {
        let path = relpath::normalize(path)?;
        self.ensure_loaded_for(&path, false, false)?;

        let fs_path = relpath::fs_path(&self.root, &path);
        match self.lookup(&path) {
            PathCoverage::Ignored => Ok(()),
            PathCoverage::Uncovered => {
                if fs_path.exists() {
                    Err(Error::UnexpectedFile(path).into())
                } else {
                    Ok(())
                }
            }
            PathCoverage::Covered { entry, .. } => {
                let digests = match entry.digests() {
                    Some(digests) => digests.clone(),
                    None => return Ok(()),
                };
                let meta = match fs::metadata(&fs_path) {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return if entry.requires_file() {
                            Err(Error::MissingFile(path).into())
                        } else {
                            Ok(())
                        };
                    }
                    Err(e) => return Err(Error::io(fs_path, e).into()),
                };
                if meta.len() != digests.size {
                    return Err(Error::SizeMismatch {
                        path,
                        expected: digests.size,
                        got: meta.len(),
                    }.into());
                }
                let algos = digests.hashes.keys()
                    .map(|t| t.parse::<HashAlgorithm>())
                    .collect::<::std::result::Result<BTreeSet<_>, _>>()?;
                let (computed, size) = hash::hash_path(&fs_path, algos)?;
                if size != digests.size {
                    return Err(Error::SizeMismatch {
                        path,
                        expected: digests.size,
                        got: size,
                    }.into());
                }
                for (algo, want) in &digests.hashes {
                    let got = &computed[algo];
                    if got != want {
                        return Err(Error::HashMismatch {
                            path,
                            algo: algo.clone(),
                            expected: want.clone(),
                            got: got.clone(),
                        }.into());
                    }
                }
                Ok(())
            }
        }
    }

    /// Creates manifests for a tree that has none.
    ///
    /// The profile's split policy decides where sub-manifests are
    /// emitted; the top-level manifest is always `Manifest` at `root`.
    pub fn create(root: impl AsRef<Path>,
                  openpgp_ctx: Option<openpgp::Context>,
                  opts: &UpdateOptions)
        -> Result<ManifestTree>
    {
        let root = root.as_ref().to_path_buf();
        let top_key = "Manifest".to_string();
        let mut tree = ManifestTree {
            top_key: top_key.clone(),
            manifests: BTreeMap::new(),
            files: BTreeMap::new(),
            ignores: BTreeSet::new(),
            openpgp: openpgp_ctx,
            busy: AtomicBool::new(false),
            root: root.clone(),
        };
        tree.manifests.insert(
            top_key.clone(),
            ManifestFile::new(root.join(&top_key), Format::None));
        tree.update("", opts)?;
        Ok(tree)
    }

    /// Re-synchronizes manifests under `subtree` with the filesystem.
    ///
    /// Changed files get fresh digests, new files get entries tagged
    /// by the profile, entries for removed files are dropped (IGNORE
    /// and OPTIONAL entries are preserved verbatim), and every touched
    /// manifest is rewritten bottom-up so parent digests cover the
    /// freshly written children.  Refuses to run concurrently with
    /// another update on this tree.
    pub fn update(&mut self, subtree: &str, opts: &UpdateOptions)
        -> Result<()>
    {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy.into());
        }
        let result = self.update_inner(subtree, opts);
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    fn update_inner(&mut self, subtree: &str, opts: &UpdateOptions)
        -> Result<()>
    {
        let sub = relpath::normalize(subtree)?;
        // Sub-manifests deleted from disk are pruned rather than
        // treated as trust failures; we are about to rewrite anyway.
        self.ensure_loaded_for(&sub, true, true)?;

        let hashes: BTreeSet<HashAlgorithm> = match &opts.hashes {
            Some(set) => set.iter().copied().collect(),
            None => opts.profile.hashes().iter().copied().collect(),
        };

        let ignores = self.ignores.clone();
        let walk = scan::walk(&self.root, &sub,
                              &|rel| ignored_in(&ignores, rel),
                              opts.one_file_system)?;
        if let Some(issue) = walk.issues.into_iter().next() {
            return Err(issue.into());
        }

        let mut jobs = Vec::new();
        for file in &walk.files {
            if self.manifests.contains_key(&file.path) {
                continue;
            }
            jobs.push(HashJob {
                path: file.path.clone(),
                fs_path: file.fs_path.clone(),
                algos: hashes.clone(),
                expected_size: None,
            });
        }

        let cancel = AtomicBool::new(false);
        let mut hashed: BTreeMap<String, Digests> = BTreeMap::new();
        let mut failure: Option<Error> = None;
        scan::run_jobs(jobs, opts.jobs, &cancel, |path, outcome| {
            match outcome {
                Ok(Hashed::Digests { size, hashes }) => {
                    hashed.insert(path, Digests::new(size, hashes));
                    true
                }
                Ok(Hashed::WrongSize { .. }) => unreachable!(),
                Err(e) => {
                    failure = Some(Error::io(path, e));
                    false
                }
            }
        });
        if let Some(err) = failure {
            return Err(err.into());
        }

        // Refresh or add entries.
        let target_tokens: BTreeSet<&str> =
            hashes.iter().map(|a| a.token()).collect();
        for (path, digests) in &hashed {
            match self.files.get(path).cloned() {
                Some(cov) => {
                    let mf = self.manifests.get_mut(&cov.key)
                        .expect("coverage references a loaded manifest");
                    let entry = &mf.entries()[cov.index];
                    let current = entry.digests()
                        .expect("covered file entries carry digests");
                    let tokens: BTreeSet<&str> = current.hashes.keys()
                        .map(String::as_str).collect();
                    if current != digests || tokens != target_tokens {
                        *mf.entries_mut()[cov.index].digests_mut()
                            .expect("checked above") = digests.clone();
                    }
                }
                None => self.add_entry(path, digests.clone(), opts)?,
            }
        }

        // Drop entries whose files are gone.
        let mut removals: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (tree_path, cov) in &self.files {
            if !relpath::is_within(&sub, tree_path)
                || hashed.contains_key(tree_path)
                || self.manifests.contains_key(tree_path)
                || ignored_in(&self.ignores, tree_path)
                || hidden(tree_path)
            {
                continue;
            }
            let entry = &self.manifests[&cov.key].entries()[cov.index];
            match entry.tag() {
                Tag::Data | Tag::Ebuild | Tag::Aux | Tag::Misc => {
                    removals.entry(cov.key.clone()).or_default()
                        .push(cov.index);
                }
                _ => (),
            }
        }
        for (key, indices) in removals {
            let indices: BTreeSet<usize> = indices.into_iter().collect();
            let mf = self.manifests.get_mut(&key).expect("key from coverage");
            let mut idx = 0;
            mf.entries_mut().retain(|_| {
                let keep = !indices.contains(&idx);
                idx += 1;
                keep
            });
        }

        let top = self.manifests.get_mut(&self.top_key)
            .expect("the top-level manifest is always loaded");
        if opts.timestamp || top.timestamp().is_some() {
            top.set_timestamp(Utc::now());
        }

        self.write_manifests(opts)?;
        self.rebuild_coverage()
    }

    /// Creates an entry for a previously uncovered file, splitting off
    /// a new sub-manifest when the profile's policy calls for one.
    fn add_entry(&mut self, path: &str, digests: Digests,
                 opts: &UpdateOptions)
        -> Result<()>
    {
        let key = self.manifest_key_for(path, opts)?;
        let dir = relpath::parent(&key).to_string();
        let rel = relpath::relative_to(&dir, path)
            .expect("the covering manifest's directory contains the path")
            .to_string();
        let tag = opts.profile.classify(&rel);
        let entry = Entry::for_file(tag, rel.clone(), digests.clone())
            .unwrap_or(Entry::Data { path: rel, digests });
        self.manifests.get_mut(&key)
            .expect("manifest_key_for returns loaded keys")
            .entries_mut().push(entry);
        Ok(())
    }

    /// The manifest a new entry for `path` belongs in, creating a
    /// sub-manifest first if the profile splits at one of the path's
    /// ancestors.
    fn manifest_key_for(&mut self, path: &str, opts: &UpdateOptions)
        -> Result<String>
    {
        let mut prefix = String::new();
        for part in relpath::parent(path).split('/') {
            if part.is_empty() {
                break;
            }
            prefix = relpath::join(&prefix, part);
            if opts.profile.wants_submanifest(&prefix) {
                let key = relpath::join(&prefix, "Manifest");
                if !self.manifests.contains_key(&key) {
                    info!("splitting {:?} into its own manifest", prefix);
                    let parent_key = self.nearest_manifest(&prefix);
                    let parent_dir = relpath::parent(&parent_key).to_string();
                    let rel = relpath::relative_to(&parent_dir, &key)
                        .expect("parent manifest covers the new manifest")
                        .to_string();
                    self.manifests.insert(
                        key.clone(),
                        ManifestFile::new(relpath::fs_path(&self.root, &key),
                                          Format::None));
                    self.manifests.get_mut(&parent_key)
                        .expect("nearest_manifest returns loaded keys")
                        .entries_mut()
                        .push(Entry::Manifest {
                            path: rel,
                            digests: Digests::default(),
                        });
                }
                return Ok(key);
            }
        }
        Ok(self.nearest_manifest(path))
    }

    /// The deepest loaded manifest whose directory contains `path`.
    fn nearest_manifest(&self, path: &str) -> String {
        let mut best = self.top_key.clone();
        let mut best_depth = 0;
        for key in self.manifests.keys() {
            let dir = relpath::parent(key);
            if relpath::is_within(dir, path)
                && relpath::depth(dir) >= best_depth
                && *key != *path
            {
                best = key.clone();
                best_depth = relpath::depth(dir);
            }
        }
        best
    }

    /// Writes every dirty manifest, deepest first, recomputing parent
    /// references over the freshly written files.  Optionally signs
    /// the top-level manifest last.
    fn write_manifests(&mut self, opts: &UpdateOptions) -> Result<()> {
        let hashes: BTreeSet<HashAlgorithm> = match &opts.hashes {
            Some(set) => set.iter().copied().collect(),
            None => opts.profile.hashes().iter().copied().collect(),
        };
        let format = opts.compress_format
            .unwrap_or_else(|| opts.profile.compression());
        let watermark = opts.compress_watermark
            .or_else(|| opts.profile.compress_watermark());

        let sign = match opts.sign {
            Some(sign) => sign,
            None => self.top().signature().is_signed(),
        };
        if sign {
            match &self.openpgp {
                Some(ctx) if ctx.is_available() => (),
                _ => return Err(Error::OpenPgpUnavailable(
                    "signing was requested but no usable OpenPGP tool \
                     is present".into()).into()),
            }
        }

        let mut keys: Vec<String> = self.manifests.keys().cloned().collect();
        keys.sort_by_key(|k| std::cmp::Reverse(relpath::depth(k)));

        for mut key in keys {
            let is_top = key == self.top_key;
            // Compression policy may rename a clean manifest, which
            // marks it dirty; apply it before the dirty check.
            if !is_top {
                key = self.apply_compression(key, format, watermark)?;
            }
            if !opts.force_rewrite && !self.manifests[&key].is_dirty() {
                continue;
            }

            let signer = if is_top && sign {
                Some((self.openpgp.as_ref().expect("checked above"),
                      opts.openpgp_id.as_deref()))
            } else {
                None
            };
            self.manifests.get_mut(&key)
                .expect("key enumerated from the manifest map")
                .save(signer)?;
            debug!("wrote manifest {:?}", key);

            if !is_top {
                let fs_path = relpath::fs_path(&self.root, &key);
                let (hmap, size) =
                    hash::hash_path(&fs_path, hashes.iter().copied())?;
                self.set_child_reference(&key, Digests::new(size, hmap));
            }
        }
        Ok(())
    }

    /// Applies the compression watermark to a sub-manifest, renaming
    /// its file when the suffix changes.  Returns the (possibly new)
    /// key.
    fn apply_compression(&mut self, key: String, format: Format,
                         watermark: Option<u64>)
        -> Result<String>
    {
        let serialized = self.manifests[&key].serialize().len() as u64;
        let desired = match (format, watermark) {
            (Format::None, _) => Format::None,
            (_, Some(mark)) if serialized < mark => Format::None,
            (format, _) => format,
        };
        let dir = relpath::parent(&key).to_string();
        let base = compression::strip_suffix(relpath::file_name(&key))
            .to_string();
        let new_key = relpath::join(&dir,
                                    &format!("{}{}", base, desired.suffix()));
        if new_key == key {
            return Ok(key);
        }

        let mut mf = self.manifests.remove(&key)
            .expect("key enumerated from the manifest map");
        let old_fs = mf.path().to_path_buf();
        match fs::remove_file(&old_fs) {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(Error::io(old_fs, e).into()),
        }
        mf.relocate(relpath::fs_path(&self.root, &new_key), desired);
        self.manifests.insert(new_key.clone(), mf);
        self.rename_child_reference(&key, &new_key);
        Ok(new_key)
    }

    /// Points the parent's MANIFEST entry for `old` at `new`.
    fn rename_child_reference(&mut self, old: &str, new: &str) {
        for (key, mf) in self.manifests.iter_mut() {
            let dir = relpath::parent(key).to_string();
            let matches_old = mf.entries().iter().any(|e| matches!(
                e, Entry::Manifest { path, .. }
                    if relpath::join(&dir, path) == old));
            if !matches_old {
                continue;
            }
            for entry in mf.entries_mut() {
                if let Entry::Manifest { path, .. } = entry {
                    if relpath::join(&dir, path) == old {
                        *path = relpath::relative_to(&dir, new)
                            .expect("renames stay within the directory")
                            .to_string();
                    }
                }
            }
        }
    }

    /// Records fresh digests for `child` in its parent manifest.
    fn set_child_reference(&mut self, child: &str, digests: Digests) {
        for (key, mf) in self.manifests.iter_mut() {
            if key == child {
                continue;
            }
            let dir = relpath::parent(key).to_string();
            let matches_child = mf.entries().iter().any(|e| matches!(
                e, Entry::Manifest { path, .. }
                    if relpath::join(&dir, path) == child));
            if !matches_child {
                continue;
            }
            for entry in mf.entries_mut() {
                if let Entry::Manifest { path, digests: d } = entry {
                    if relpath::join(&dir, path) == child {
                        *d = digests.clone();
                    }
                }
            }
        }
    }

    /// Builds DIST verification jobs for manifests relevant to `sub`.
    #[allow(clippy::too_many_arguments)]
    fn distfile_jobs(&self, sub: &str, distdir: &Path,
                     jobs: &mut Vec<HashJob>,
                     expected: &mut BTreeMap<String, BTreeMap<String, String>>,
                     issues: &mut BTreeMap<String, Vec<Error>>,
                     record: &mut dyn FnMut(&mut BTreeMap<String, Vec<Error>>,
                                            String, Error))
    {
        for (key, mf) in &self.manifests {
            let dir = relpath::parent(key);
            if !relpath::is_within(dir, sub) && !relpath::is_within(sub, dir) {
                continue;
            }
            for entry in mf.entries() {
                let (filename, digests) = match entry {
                    Entry::Dist { filename, digests } => (filename, digests),
                    _ => continue,
                };
                let fs_path = distdir.join(filename);
                let meta = match fs::metadata(&fs_path) {
                    // Distfiles are fetched on demand; absence is fine.
                    Err(_) => continue,
                    Ok(meta) => meta,
                };
                if meta.len() != digests.size {
                    record(issues, filename.clone(), Error::SizeMismatch {
                        path: filename.clone(),
                        expected: digests.size,
                        got: meta.len(),
                    });
                    continue;
                }
                if let Some(algos) = algo_set(digests, issues, filename) {
                    if !algos.is_empty() {
                        expected.insert(filename.clone(),
                                        digests.hashes.clone());
                        jobs.push(HashJob {
                            path: filename.clone(),
                            fs_path,
                            algos,
                            expected_size: Some(digests.size),
                        });
                    }
                }
            }
        }
    }

    /// Loads every not-yet-loaded manifest relevant to `target`: the
    /// chain of manifests covering it and, with `descend`, everything
    /// beneath it.  Child files are verified against their parents'
    /// digests before being parsed.
    fn ensure_loaded_for(&mut self, target: &str, descend: bool,
                         prune_missing: bool)
        -> Result<()>
    {
        loop {
            let mut pending: Vec<(String, String, Digests)> = Vec::new();
            for (key, mf) in &self.manifests {
                let dir = relpath::parent(key).to_string();
                for entry in mf.entries() {
                    let (path, digests) = match entry {
                        Entry::Manifest { path, digests } => (path, digests),
                        _ => continue,
                    };
                    let rel = relpath::normalize(path)?;
                    let child_key = relpath::join(&dir, &rel);
                    if child_key == *key || child_key == self.top_key {
                        return Err(Error::ManifestCycle(child_key).into());
                    }
                    if self.manifests.contains_key(&child_key)
                        || ignored_in(&self.ignores, &child_key)
                    {
                        continue;
                    }
                    let child_dir = relpath::parent(&child_key);
                    let relevant = relpath::is_within(child_dir, target)
                        || (descend
                            && relpath::is_within(target, child_dir));
                    if relevant {
                        pending.push((key.clone(), child_key,
                                      digests.clone()));
                    }
                }
            }
            if pending.is_empty() {
                break;
            }
            for (parent, child, digests) in pending {
                if self.manifests.contains_key(&child) {
                    continue;
                }
                let fs_path = relpath::fs_path(&self.root, &child);
                if prune_missing && !fs_path.exists() {
                    debug!("dropping reference to removed manifest {:?}",
                           child);
                    self.remove_child_reference(&parent, &child);
                    continue;
                }
                self.verify_submanifest_file(&parent, &child, &digests)?;
                let mf = ManifestFile::load(&fs_path, None)?;
                debug!("loaded sub-manifest {:?} ({} entries)",
                       child, mf.entries().len());
                self.insert_manifest(child, mf)?;
            }
        }
        self.rebuild_coverage()
    }

    /// Checks a sub-manifest file against the digests its parent
    /// records, before the file is parsed or trusted.
    fn verify_submanifest_file(&self, parent: &str, child: &str,
                               digests: &Digests)
        -> Result<()>
    {
        let fs_path = relpath::fs_path(&self.root, child);
        let algos = digests.hashes.keys()
            .map(|t| t.parse::<HashAlgorithm>())
            .collect::<::std::result::Result<BTreeSet<_>, _>>()?;
        let (computed, size) = hash::hash_path(&fs_path, algos)?;
        let good = size == digests.size
            && digests.hashes.iter().all(
                |(algo, want)| computed.get(algo) == Some(want));
        if !good {
            return Err(Error::InvalidSubManifestHash {
                parent: parent.into(),
                child: child.into(),
            }.into());
        }
        Ok(())
    }

    fn remove_child_reference(&mut self, parent: &str, child: &str) {
        let dir = relpath::parent(parent).to_string();
        if let Some(mf) = self.manifests.get_mut(parent) {
            mf.entries_mut().retain(|e| !matches!(
                e, Entry::Manifest { path, .. }
                    if relpath::join(&dir, path) == child));
        }
    }

    /// Registers a loaded manifest, validating entry paths and
    /// recording its IGNORE masks.
    fn insert_manifest(&mut self, key: String, mf: ManifestFile)
        -> Result<()>
    {
        let dir = relpath::parent(&key).to_string();
        for entry in mf.entries() {
            if let Some(covered) = entry.covered_path() {
                let rel = relpath::normalize(&covered)?;
                if matches!(entry, Entry::Ignore { .. }) {
                    self.ignores.insert(relpath::join(&dir, &rel));
                }
            }
        }
        self.manifests.insert(key, mf);
        Ok(())
    }

    /// Rebuilds the coverage index from the loaded manifests.
    ///
    /// Longest-prefix wins across depths; two entries for one path at
    /// the same depth are a hard error.
    fn rebuild_coverage(&mut self) -> Result<()> {
        let mut files: BTreeMap<String, CoverageRef> = BTreeMap::new();
        let mut ignores: BTreeSet<String> = BTreeSet::new();

        for (key, mf) in &self.manifests {
            let dir = relpath::parent(key);
            for (index, entry) in mf.entries().iter().enumerate() {
                let covered = match entry.covered_path() {
                    Some(covered) => covered,
                    None => continue,
                };
                let rel = relpath::normalize(&covered)?;
                let tree_path = relpath::join(dir, &rel);
                if matches!(entry, Entry::Ignore { .. }) {
                    ignores.insert(tree_path);
                    continue;
                }
                match files.entry(tree_path) {
                    MapEntry::Vacant(slot) => {
                        slot.insert(CoverageRef { key: key.clone(), index });
                    }
                    MapEntry::Occupied(mut slot) => {
                        let held = slot.get();
                        let held_depth =
                            relpath::depth(relpath::parent(&held.key));
                        let new_depth = relpath::depth(dir);
                        if held_depth == new_depth {
                            return Err(Error::DuplicateCoverage {
                                path: slot.key().clone(),
                                first: held.key.clone(),
                                second: key.clone(),
                            }.into());
                        }
                        if new_depth > held_depth {
                            slot.insert(CoverageRef {
                                key: key.clone(),
                                index,
                            });
                        }
                    }
                }
            }
        }

        self.files = files;
        self.ignores = ignores;
        Ok(())
    }
}

/// Dotfiles (and anything beneath a dot-directory) sit outside
/// manifest coverage.
fn hidden(path: &str) -> bool {
    path.split('/').any(|component| component.starts_with('.'))
}

/// Whether `path` or any of its ancestors is in the ignore set.
fn ignored_in(ignores: &BTreeSet<String>, path: &str) -> bool {
    if ignores.contains(path) {
        return true;
    }
    for (idx, byte) in path.bytes().enumerate() {
        if byte == b'/' && ignores.contains(&path[..idx]) {
            return true;
        }
    }
    false
}

/// Parses an entry's digest tokens, recording unknown ones as per-path
/// issues rather than failing the whole operation.
fn algo_set(digests: &Digests,
            issues: &mut BTreeMap<String, Vec<Error>>,
            path: &str)
    -> Option<BTreeSet<HashAlgorithm>>
{
    let mut algos = BTreeSet::new();
    for token in digests.hashes.keys() {
        match token.parse::<HashAlgorithm>() {
            Ok(algo) => {
                algos.insert(algo);
            }
            Err(err) => {
                issues.entry(path.to_string()).or_default().push(err);
                return None;
            }
        }
    }
    Some(algos)
}

/// Best-effort sort key for an error, used to order the report.
fn issue_path(err: &Error) -> String {
    match err {
        Error::PathTraversal(path)
        | Error::MissingFile(path)
        | Error::UnexpectedFile(path)
        | Error::ManifestCycle(path) => path.clone(),
        Error::HashMismatch { path, .. }
        | Error::SizeMismatch { path, .. }
        | Error::DuplicateCoverage { path, .. } => path.clone(),
        Error::Io { path, .. }
        | Error::ManifestCrossDevice(path) =>
            path.to_string_lossy().into_owned(),
        Error::InvalidSubManifestHash { child, .. } => child.clone(),
        _ => String::new(),
    }
}

fn flatten(issues: BTreeMap<String, Vec<Error>>, fail_fast: bool)
    -> VerifyReport
{
    let mut all: Vec<Error> = issues.into_values().flatten().collect();
    if fail_fast {
        all.truncate(1);
    }
    VerifyReport { issues: all }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hidden_components() {
        assert!(hidden(".git"));
        assert!(hidden("a/.cache/x"));
        assert!(!hidden("a/b.txt"));
        assert!(!hidden("dotted.name/file"));
    }

    #[test]
    fn ignore_prefix_matching() {
        let ignores: BTreeSet<String> =
            ["tmp".to_string(), "a/b".to_string()].into();
        assert!(ignored_in(&ignores, "tmp"));
        assert!(ignored_in(&ignores, "tmp/x/y"));
        assert!(ignored_in(&ignores, "a/b/c"));
        assert!(!ignored_in(&ignores, "a"));
        assert!(!ignored_in(&ignores, "tmpfile"));
        assert!(!ignored_in(&ignores, "x/tmp"));
    }

    #[test]
    fn busy_tree_refuses_a_second_update() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Manifest"), b"").unwrap();
        let mut tree = ManifestTree::open(
            dir.path(), None, TreeOptions::default()).unwrap();

        tree.busy.store(true, Ordering::SeqCst);
        let err = tree.update("", &UpdateOptions::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Busy)));

        // Once the first operation ends, updates run again.
        tree.busy.store(false, Ordering::SeqCst);
        tree.update("", &UpdateOptions::default()).unwrap();
    }

    #[test]
    fn nearest_manifest_prefers_depth() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/x"), b"hello\n").unwrap();
        let sub = "DATA x 6 SHA256 \
                   5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03\n";
        fs::write(root.join("sub/Manifest"), sub).unwrap();
        let (digests, size) = hash::hash_reader(
            [HashAlgorithm::SHA256], sub.as_bytes()).unwrap();
        fs::write(root.join("Manifest"), format!(
            "MANIFEST sub/Manifest {} SHA256 {}\n",
            size, digests["SHA256"])).unwrap();

        let tree = ManifestTree::open(
            root, None, TreeOptions::default()).unwrap();
        assert_eq!(tree.nearest_manifest("sub/new.txt"), "sub/Manifest");
        assert_eq!(tree.nearest_manifest("other.txt"), "Manifest");
    }
}
