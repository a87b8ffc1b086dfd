//! Tests exercising the external OpenPGP tool.
//!
//! Every test degrades to a SKIP message when no usable GnuPG is
//! installed, mirroring how the library itself degrades.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};

use veritree::openpgp::Context;
use veritree::tree::{ManifestTree, TreeOptions, UpdateOptions, VerifyOptions};
use veritree::hash::HashAlgorithm;
use veritree::Error;

const UID: &str = "Veritree Test <tester@example.com>";

fn gpg() -> String {
    std::env::var("GNUPG").unwrap_or_else(|_| "gpg".into())
}

/// A scratch GnuPG home with one freshly generated signing key.
struct Keyring {
    home: tempfile::TempDir,
}

impl Keyring {
    fn generate() -> Option<Keyring> {
        let home = tempfile::tempdir().ok()?;
        fs::set_permissions(home.path(),
                            fs::Permissions::from_mode(0o700)).ok()?;
        let status = Command::new(gpg())
            .arg("--homedir").arg(home.path())
            .args(["--batch", "--pinentry-mode", "loopback",
                   "--passphrase", "", "--quick-generate-key", UID,
                   "default", "default", "never"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .ok()?;
        status.success().then_some(Keyring { home })
    }

    fn export(&self, secret: bool) -> Option<Vec<u8>> {
        let out = Command::new(gpg())
            .arg("--homedir").arg(self.home.path())
            .args(["--batch", "--pinentry-mode", "loopback",
                   "--passphrase", "", "--armor",
                   if secret { "--export-secret-keys" } else { "--export" }])
            .output()
            .ok()?;
        (out.status.success() && !out.stdout.is_empty())
            .then_some(out.stdout)
    }

    fn detach_sign(&self, data: &Path, sig: &Path) -> bool {
        Command::new(gpg())
            .arg("--homedir").arg(self.home.path())
            .args(["--batch", "--pinentry-mode", "loopback",
                   "--passphrase", "", "--yes"])
            .arg("--output").arg(sig)
            .arg("--detach-sign").arg(data)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Yields a keyring plus an ephemeral context that holds its secret
/// key, or returns from the test with a SKIP notice.
macro_rules! signing_context {
    () => {{
        let keyring = match Keyring::generate() {
            Some(k) => k,
            None => {
                eprintln!("SKIP: failed to generate a test key\n\
                           SKIP: is GnuPG installed?");
                return;
            }
        };
        let ctx = match Context::ephemeral() {
            Ok(ctx) if ctx.is_available() => ctx,
            _ => {
                eprintln!("SKIP: no usable OpenPGP tool");
                return;
            }
        };
        let secret = match keyring.export(true) {
            Some(secret) => secret,
            None => {
                eprintln!("SKIP: secret key export failed");
                return;
            }
        };
        if ctx.import_key(&secret).is_err() {
            eprintln!("SKIP: secret key import failed");
            return;
        }
        (keyring, ctx)
    }};
}

#[test]
fn clearsign_round_trip() {
    let (_keyring, ctx) = signing_context!();

    let payload = b"TIMESTAMP 2024-01-01T00:00:00Z\nDATA x 0\n";
    let signed = ctx.clear_sign(payload, None).unwrap();
    assert!(signed.starts_with(b"-----BEGIN PGP SIGNED MESSAGE-----"));

    let (plain, sig) = ctx.verify(&signed).unwrap();
    assert_eq!(plain, payload);
    assert!(sig.fingerprint.len() >= 16, "fingerprint: {}", sig.fingerprint);
    assert!(sig.timestamp.is_some());
}

#[test]
fn tampered_clearsign_is_rejected() {
    let (_keyring, ctx) = signing_context!();

    let signed = ctx.clear_sign(b"DATA x 0\n", None).unwrap();
    let tampered = String::from_utf8(signed).unwrap()
        .replace("DATA x 0", "DATA y 0");
    let err = ctx.verify(tampered.as_bytes()).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(),
                     Some(Error::OpenPgpBadSignature(_))),
            "unexpected error: {:#}", err);
}

#[test]
fn detached_signature_verifies() {
    let (keyring, ctx) = signing_context!();

    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let sig = dir.path().join("data.sig");
    fs::write(&data, b"payload bytes\n").unwrap();
    if !keyring.detach_sign(&data, &sig) {
        eprintln!("SKIP: detached signing failed");
        return;
    }

    let result = ctx.verify_detached(
        &fs::read(&data).unwrap(), &fs::read(&sig).unwrap()).unwrap();
    assert!(!result.fingerprint.is_empty());

    let err = ctx.verify_detached(b"different data\n",
                                  &fs::read(&sig).unwrap()).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(),
                     Some(Error::OpenPgpBadSignature(_))));
}

#[test]
fn signed_tree_creation_and_enforcement() {
    let (keyring, ctx) = signing_context!();

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("a")).unwrap();
    fs::write(root.join("a/b.txt"), b"hello\n").unwrap();

    ManifestTree::create(root, Some(ctx), &UpdateOptions {
        hashes: Some(vec![HashAlgorithm::SHA256]),
        sign: Some(true),
        timestamp: true,
        ..UpdateOptions::default()
    }).unwrap();
    let manifest = fs::read_to_string(root.join("Manifest")).unwrap();
    assert!(manifest.starts_with("-----BEGIN PGP SIGNED MESSAGE-----"),
            "manifest is not clearsigned:\n{}", manifest);

    // A verifier that only knows the public key accepts the tree.
    let public = match keyring.export(false) {
        Some(public) => public,
        None => {
            eprintln!("SKIP: public key export failed");
            return;
        }
    };
    let verifier = Context::ephemeral().unwrap();
    verifier.import_key(&public).unwrap();
    let mut tree = ManifestTree::open(root, Some(verifier), TreeOptions {
        require_signed: true,
        ..TreeOptions::default()
    }).unwrap();
    let report = tree.assert_directory_verifies("", &VerifyOptions {
        fail_fast: false,
        ..VerifyOptions::default()
    }).unwrap();
    assert!(report.is_ok(), "{}", report);

    // Tampering with the signed payload breaks the envelope.
    let tampered = manifest.replace("DATA a/b.txt", "MISC a/b.txt");
    fs::write(root.join("Manifest"), tampered).unwrap();
    let verifier = Context::ephemeral().unwrap();
    verifier.import_key(&public).unwrap();
    let err = ManifestTree::open(root, Some(verifier), TreeOptions {
        require_signed: true,
        ..TreeOptions::default()
    }).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(),
                     Some(Error::OpenPgpBadSignature(_))),
            "unexpected error: {:#}", err);
}

#[test]
fn unknown_key_is_distinguished() {
    let (_keyring, ctx) = signing_context!();

    let signed = ctx.clear_sign(b"DATA x 0\n", None).unwrap();
    // A verifier with an empty keyring has never seen the signer.
    let empty = Context::ephemeral().unwrap();
    if !empty.is_available() {
        eprintln!("SKIP: no usable OpenPGP tool");
        return;
    }
    let err = empty.verify(&signed).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(),
                     Some(Error::OpenPgpUnknownKey(_))),
            "unexpected error: {:#}", err);
}
