//! Filesystem scanning and parallel hashing.
//!
//! Directory traversal runs on the calling thread; per-file hashing is
//! dispatched over a bounded channel to a pool of workers, each owning
//! its file handle and multiplexer.  Results flow back over a typed
//! channel; callers see them in whatever order hashing finishes and
//! are expected to aggregate into sorted containers.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use tracing::debug;
use walkdir::WalkDir;

use crate::hash::{HashAlgorithm, Multiplexer, CHUNK_SIZE};
use crate::relpath;
use crate::{Error, Result};

/// A regular file found by [`walk`].
#[derive(Debug, Clone)]
pub struct WalkedFile {
    /// Tree-relative path.
    pub path: String,
    /// Location on the filesystem.
    pub fs_path: PathBuf,
    /// Size at scan time.
    pub size: u64,
}

/// Outcome of walking a subtree.
#[derive(Debug, Default)]
pub struct Walk {
    /// Regular files, sorted by tree-relative path.
    pub files: Vec<WalkedFile>,
    /// Per-path problems that did not halt the walk: unreadable
    /// directories, symlinks escaping the tree, broken links.
    pub issues: Vec<Error>,
}

/// Walks the filesystem under `root`/`subtree`.
///
/// Dotfiles are excluded from coverage and therefore skipped, as is
/// everything `skip` claims (the caller supplies ignore-entry
/// matching).  Symlinks are not followed into; a link resolving to a
/// regular file inside the tree is reported as that file, one escaping
/// the tree is reported as an issue.  With `one_file_system`, crossing
/// onto another device is a hard error.
pub fn walk(root: &Path, subtree: &str, skip: &dyn Fn(&str) -> bool,
            one_file_system: bool)
    -> Result<Walk>
{
    let base = relpath::fs_path(root, subtree);
    let mut walk = Walk::default();
    if !base.exists() {
        return Ok(walk);
    }
    let canonical_root = fs::canonicalize(root)
        .map_err(|e| Error::io(root, e))?;
    let root_dev = fs::metadata(&base)
        .map_err(|e| Error::io(&base, e))?
        .dev();

    let iter = WalkDir::new(&base)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                return false;
            }
            match entry.path().strip_prefix(root).ok()
                .and_then(|rel| rel.to_str())
            {
                Some(rel) => !skip(rel),
                None => true,
            }
        });

    for entry in iter {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| base.clone());
                let err = e.into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk error"));
                walk.issues.push(Error::io(path, err));
                continue;
            }
        };
        let rel = match entry.path().strip_prefix(root).ok()
            .and_then(|r| r.to_str())
        {
            Some(rel) => rel.to_string(),
            None => {
                walk.issues.push(Error::InvalidArgument(
                    format!("non-UTF-8 path: {:?}", entry.path())));
                continue;
            }
        };
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if one_file_system {
                let meta = entry.metadata()
                    .map_err(|e| Error::io(
                        entry.path(),
                        e.into_io_error().unwrap_or_else(
                            || io::Error::new(io::ErrorKind::Other, "stat error"))))?;
                if meta.dev() != root_dev {
                    return Err(Error::ManifestCrossDevice(
                        entry.path().to_path_buf()).into());
                }
            }
            continue;
        }

        if file_type.is_symlink() {
            match fs::canonicalize(entry.path()) {
                Err(e) => {
                    walk.issues.push(Error::io(entry.path(), e));
                }
                Ok(target) if !target.starts_with(&canonical_root) => {
                    debug!("{:?} resolves outside the tree to {:?}",
                           rel, target);
                    walk.issues.push(Error::PathTraversal(rel));
                }
                Ok(_) => match fs::metadata(entry.path()) {
                    Ok(meta) if meta.is_file() => {
                        walk.files.push(WalkedFile {
                            path: rel,
                            fs_path: entry.path().to_path_buf(),
                            size: meta.len(),
                        });
                    }
                    // In-tree directory links are not descended into;
                    // their targets are covered at the real location.
                    Ok(_) => (),
                    Err(e) => walk.issues.push(Error::io(entry.path(), e)),
                },
            }
            continue;
        }

        match entry.metadata() {
            Ok(meta) => walk.files.push(WalkedFile {
                path: rel,
                fs_path: entry.path().to_path_buf(),
                size: meta.len(),
            }),
            Err(e) => walk.issues.push(Error::io(
                entry.path(),
                e.into_io_error().unwrap_or_else(
                    || io::Error::new(io::ErrorKind::Other, "stat error")))),
        }
    }

    walk.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(walk)
}

/// One file to hash.
#[derive(Debug, Clone)]
pub struct HashJob {
    /// Tree-relative path, used to key the result.
    pub path: String,
    /// File to open.
    pub fs_path: PathBuf,
    /// Algorithms to compute.
    pub algos: BTreeSet<HashAlgorithm>,
    /// Size the stream must have; a different count short-circuits to
    /// [`Hashed::WrongSize`] (the file changed under us).
    pub expected_size: Option<u64>,
}

/// Result of hashing one file.
#[derive(Debug)]
pub enum Hashed {
    /// The stream was consumed; digests and byte count.
    Digests {
        /// Total bytes read.
        size: u64,
        /// `{token → lowercase hex}`.
        hashes: BTreeMap<String, String>,
    },
    /// The stream's length did not match the expectation.
    WrongSize {
        /// Expected byte count.
        expected: u64,
        /// Observed byte count.
        got: u64,
    },
}

/// Number of workers used when the caller passes `0`.
pub fn default_jobs() -> usize {
    num_cpus::get()
}

/// Runs hashing jobs on a worker pool.
///
/// `on_result` is invoked on the calling thread as results arrive, in
/// completion order; returning `false` cancels outstanding work.
/// Workers check the cancellation flag between chunks, so a cancel
/// takes effect without waiting for large files to finish.
pub fn run_jobs<F>(jobs: Vec<HashJob>, workers: usize,
                   cancel: &AtomicBool, mut on_result: F)
    where F: FnMut(String, io::Result<Hashed>) -> bool
{
    let workers = if workers == 0 { default_jobs() } else { workers };
    let total = jobs.len();
    let (job_tx, job_rx) = bounded::<HashJob>(workers * 2);
    let (res_tx, res_rx) = unbounded();

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            scope.spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    if cancel.load(Ordering::Relaxed) {
                        continue;
                    }
                    let outcome = hash_one(&job, cancel);
                    if res_tx.send((job.path, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(res_tx);

        scope.spawn(move || {
            for job in jobs {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                if job_tx.send(job).is_err() {
                    break;
                }
            }
            // Dropping job_tx lets the workers drain and exit.
        });

        let mut seen = 0;
        while seen < total {
            let (path, outcome) = match res_rx.recv() {
                Ok(r) => r,
                Err(_) => break,
            };
            seen += 1;
            if !on_result(path, outcome) {
                cancel.store(true, Ordering::Relaxed);
            }
        }
    });
}

fn hash_one(job: &HashJob, cancel: &AtomicBool) -> io::Result<Hashed> {
    let mut file = File::open(&job.fs_path)?;
    let mut mux = Multiplexer::new(job.algos.iter().copied());
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Interrupted,
                                      "scan cancelled"));
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        mux.update(&buf[..n]);
    }
    let (hashes, size) = mux.finish();
    if let Some(expected) = job.expected_size {
        if expected != size {
            return Ok(Hashed::WrongSize { expected, got: size });
        }
    }
    Ok(Hashed::Digests { size, hashes })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn touch(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn walk_sorts_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("b/z.txt"), b"z");
        touch(&root.join("a/y.txt"), b"yy");
        touch(&root.join("a/.hidden"), b"no");
        touch(&root.join(".git/config"), b"no");
        touch(&root.join("skipme/x"), b"no");

        let walk = walk(root, "", &|rel| rel == "skipme", false).unwrap();
        let paths: Vec<&str> =
            walk.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["a/y.txt", "b/z.txt"]);
        assert_eq!(walk.files[0].size, 2);
        assert!(walk.issues.is_empty());
    }

    #[test]
    fn walk_subtree_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("a/y.txt"), b"y");
        touch(&root.join("b/z.txt"), b"z");

        let walk = walk(root, "a", &|_| false, false).unwrap();
        let paths: Vec<&str> =
            walk.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["a/y.txt"]);
    }

    #[test]
    fn symlink_outside_tree_is_reported() {
        let outside = tempfile::tempdir().unwrap();
        touch(&outside.path().join("secret"), b"s");
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("ok.txt"), b"ok");
        std::os::unix::fs::symlink(
            outside.path().join("secret"), root.join("leak")).unwrap();

        let walk = walk(root, "", &|_| false, false).unwrap();
        assert_eq!(walk.files.len(), 1);
        assert!(walk.issues.iter().any(
            |e| matches!(e, Error::PathTraversal(p) if p == "leak")));
    }

    #[test]
    fn pool_hashes_files() {
        use HashAlgorithm::SHA256;
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("hello"), b"hello\n");
        touch(&root.join("empty"), b"");

        let jobs = vec![
            HashJob {
                path: "hello".into(),
                fs_path: root.join("hello"),
                algos: [SHA256].into_iter().collect(),
                expected_size: Some(6),
            },
            HashJob {
                path: "empty".into(),
                fs_path: root.join("empty"),
                algos: [SHA256].into_iter().collect(),
                expected_size: None,
            },
        ];
        let cancel = AtomicBool::new(false);
        let mut results = BTreeMap::new();
        run_jobs(jobs, 2, &cancel, |path, outcome| {
            results.insert(path, outcome);
            true
        });
        assert_eq!(results.len(), 2);
        match results["hello"].as_ref().unwrap() {
            Hashed::Digests { size, hashes } => {
                assert_eq!(*size, 6);
                assert_eq!(hashes["SHA256"],
                           "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn raced_file_reports_wrong_size() {
        use HashAlgorithm::SHA256;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"longer than expected").unwrap();

        let jobs = vec![HashJob {
            path: "f".into(),
            fs_path: path,
            algos: [SHA256].into_iter().collect(),
            expected_size: Some(3),
        }];
        let cancel = AtomicBool::new(false);
        let mut wrong = false;
        run_jobs(jobs, 1, &cancel, |_, outcome| {
            wrong = matches!(outcome,
                             Ok(Hashed::WrongSize { expected: 3, .. }));
            true
        });
        assert!(wrong);
    }

    #[test]
    fn missing_file_reports_io_error() {
        use HashAlgorithm::SHA256;
        let jobs = vec![HashJob {
            path: "gone".into(),
            fs_path: PathBuf::from("/nonexistent/gone"),
            algos: [SHA256].into_iter().collect(),
            expected_size: None,
        }];
        let cancel = AtomicBool::new(false);
        let mut got_err = false;
        run_jobs(jobs, 1, &cancel, |_, outcome| {
            got_err = outcome.is_err();
            true
        });
        assert!(got_err);
    }
}
