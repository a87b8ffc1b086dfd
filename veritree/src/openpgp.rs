//! OpenPGP signature handling via an external tool.
//!
//! No OpenPGP cryptography is implemented here.  The module shells out
//! to an OpenPGP command-line tool (GnuPG or a workalike) in batch mode
//! and interprets its machine-readable status output.  The tool is
//! taken from the `GNUPG` environment variable, falling back to `gpg`
//! on `PATH`.
//!
//! Availability is probed when a [`Context`] is constructed.  A missing
//! tool degrades every operation to [`Error::OpenPgpUnavailable`]
//! instead of failing at first use, so callers (and tests) can skip
//! signature work cleanly.

use std::env;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::thread;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Tool invoked when the `GNUPG` environment variable is unset.
pub const DEFAULT_TOOL: &str = "gpg";

const TOOL_ENV: &str = "GNUPG";

const CLEARSIGN_BEGIN: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";

/// Ownertrust the tool reported for a signing key.
///
/// Isolated keyrings carry no ownertrust database, so `Undefined` is
/// the normal report for explicitly imported keys; only `Never` fails
/// verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustLevel {
    /// The tool reported no trust level.
    #[default]
    Unknown,
    /// `TRUST_UNDEFINED`: no ownertrust recorded.
    Undefined,
    /// `TRUST_NEVER`: the key is explicitly distrusted.
    Never,
    /// `TRUST_MARGINAL`.
    Marginal,
    /// `TRUST_FULLY`.
    Full,
    /// `TRUST_ULTIMATE`.
    Ultimate,
}

/// A good signature, as reported by the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Fingerprint of the signing key.
    pub fingerprint: String,
    /// Signature creation time, when the tool reports one.
    pub timestamp: Option<DateTime<Utc>>,
    /// Ownertrust of the signing key.
    pub trust: TrustLevel,
}

/// An OpenPGP execution environment.
///
/// The system environment uses the ambient keyring; an ephemeral
/// environment owns a private home directory that only contains
/// explicitly imported keys and is removed on drop.
#[derive(Debug)]
pub struct Context {
    tool: PathBuf,
    home: Option<TempDir>,
    unavailable: Option<String>,
}

impl Context {
    /// Creates a context using the ambient keyring.
    pub fn system() -> Context {
        let tool = tool_path();
        let unavailable = probe(&tool);
        Context { tool, home: None, unavailable }
    }

    /// Creates a context with a private, ephemeral home directory.
    ///
    /// The directory is created mode 0700 and removed when the context
    /// is dropped, on every exit path.
    pub fn ephemeral() -> Result<Context> {
        let home = TempDir::new()
            .map_err(|e| Error::io("openpgp home", e))?;
        fs::set_permissions(home.path(), fs::Permissions::from_mode(0o700))
            .map_err(|e| Error::io(home.path(), e))?;
        let tool = tool_path();
        let unavailable = probe(&tool);
        if unavailable.is_some() {
            warn!("OpenPGP tool not usable: {:?}", tool);
        }
        Ok(Context { tool, home: Some(home), unavailable })
    }

    /// Whether the external tool is usable.
    pub fn is_available(&self) -> bool {
        self.unavailable.is_none()
    }

    fn ensure_available(&self) -> Result<()> {
        match &self.unavailable {
            None => Ok(()),
            Some(reason) =>
                Err(Error::OpenPgpUnavailable(reason.clone()).into()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.tool);
        cmd.arg("--batch").arg("--no-tty");
        if let Some(home) = &self.home {
            cmd.arg("--homedir").arg(home.path());
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Runs the tool with `args`, feeding `input` on stdin.
    ///
    /// Stdin is written from a separate thread; the tool closing its
    /// end early is not an error (the status output decides).
    fn run(&self, args: &[&str], input: &[u8]) -> Result<Output> {
        self.ensure_available()?;
        debug!("invoking {:?} {:?}", self.tool, args);
        let mut child = self.command().args(args).spawn()
            .map_err(|e| Error::io(&self.tool, e))?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let input = input.to_vec();
        let feeder = thread::spawn(move || {
            let _ = stdin.write_all(&input);
        });
        let output = child.wait_with_output()
            .map_err(|e| Error::io(&self.tool, e))?;
        let _ = feeder.join();
        Ok(output)
    }

    /// Verifies a clearsigned stream.
    ///
    /// Returns the embedded plaintext and the signature record.  Any
    /// outcome other than a good signature from a live, known key maps
    /// to a distinct error kind.
    pub fn verify(&self, data: &[u8]) -> Result<(Vec<u8>, Signature)> {
        let output = self.run(&["--status-fd", "2", "--decrypt"], data)?;
        let sig = parse_verification(&output)?;
        Ok((output.stdout, sig))
    }

    /// Verifies a detached signature over `data`.
    pub fn verify_detached(&self, data: &[u8], signature: &[u8])
        -> Result<Signature>
    {
        self.ensure_available()?;
        let mut sig_file = tempfile::NamedTempFile::new()
            .map_err(|e| Error::io("signature", e))?;
        sig_file.write_all(signature)
            .and_then(|()| sig_file.flush())
            .map_err(|e| Error::io("signature", e))?;
        let sig_path = sig_file.path().to_string_lossy().into_owned();
        let output = self.run(
            &["--status-fd", "2", "--verify", sig_path.as_str(), "-"],
            data)?;
        parse_verification(&output)
    }

    /// Clearsigns `data`, optionally with a specific key.
    pub fn clear_sign(&self, data: &[u8], key_id: Option<&str>)
        -> Result<Vec<u8>>
    {
        let mut args = vec!["--status-fd", "2", "--clearsign"];
        if let Some(key) = key_id {
            args.push("--local-user");
            args.push(key);
        }
        let output = self.run(&args, data)?;
        let created = status_lines(&output.stderr)
            .any(|l| l.starts_with("SIG_CREATED"));
        if !output.status.success() || !created {
            return Err(Error::OpenPgpSigningFailure(
                String::from_utf8_lossy(&output.stderr).trim().into()).into());
        }
        Ok(output.stdout)
    }

    /// Imports key material into this context's keyring.
    pub fn import_key(&self, key: &[u8]) -> Result<()> {
        let output = self.run(&["--status-fd", "2", "--import"], key)?;
        let imported = status_lines(&output.stderr)
            .any(|l| l.starts_with("IMPORT_OK"));
        if !output.status.success() || !imported {
            return Err(Error::OpenPgpKeyImport(
                String::from_utf8_lossy(&output.stderr).trim().into()).into());
        }
        Ok(())
    }

    /// Refreshes all keys in the keyring from a keyserver.
    pub fn refresh_keys(&self, keyserver: Option<&str>) -> Result<()> {
        let mut args = Vec::new();
        if let Some(url) = keyserver {
            args.push("--keyserver");
            args.push(url);
        }
        args.push("--refresh-keys");
        let output = self.run(&args, b"")?;
        if !output.status.success() {
            return Err(Error::OpenPgpKeyRefresh(
                String::from_utf8_lossy(&output.stderr).trim().into()).into());
        }
        Ok(())
    }

    /// Refreshes the key for `email` from its Web Key Directory.
    ///
    /// Tries the advanced method first, then the direct one, and
    /// imports whatever the directory serves.
    #[cfg(feature = "wkd")]
    pub fn refresh_keys_wkd(&self, email: &str) -> Result<()> {
        self.ensure_available()?;
        let mut last_err: Option<anyhow::Error> = None;
        for url in wkd_urls(email)? {
            match fetch(&url) {
                Ok(key) => return self.import_key(&key),
                Err(e) => {
                    debug!("WKD fetch {} failed: {}", url, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one URL was tried"))
    }

    /// Refreshing from a Web Key Directory needs the `wkd` feature.
    #[cfg(not(feature = "wkd"))]
    pub fn refresh_keys_wkd(&self, _email: &str) -> Result<()> {
        Err(Error::OpenPgpUnavailable(
            "built without Web Key Directory support".into()).into())
    }
}

fn tool_path() -> PathBuf {
    env::var_os(TOOL_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TOOL))
}

/// Probes the tool once; returns the reason it is unusable, if any.
fn probe(tool: &PathBuf) -> Option<String> {
    match Command::new(tool)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => None,
        Ok(status) => Some(format!("{:?} exited with {}", tool, status)),
        Err(e) => Some(format!("cannot execute {:?}: {}", tool, e)),
    }
}

/// Yields status-protocol lines, stripped of the `[GNUPG:] ` prefix.
fn status_lines(stderr: &[u8]) -> impl Iterator<Item = &str> {
    stderr.split(|&b| b == b'\n')
        .filter_map(|line| std::str::from_utf8(line).ok())
        .filter_map(|line| line.strip_prefix("[GNUPG:] "))
}

/// Interprets a verification run's status output.
fn parse_verification(output: &Output) -> Result<Signature> {
    let mut good = false;
    let mut signature: Option<Signature> = None;
    let mut failure: Option<Error> = None;
    let mut trust = TrustLevel::Unknown;
    let mut record = |err: Error, failure: &mut Option<Error>| {
        if failure.is_none() {
            *failure = Some(err);
        }
    };

    for line in status_lines(&output.stderr) {
        let mut fields = line.split_whitespace();
        let keyword = match fields.next() {
            Some(k) => k,
            None => continue,
        };
        let rest = || line[keyword.len()..].trim().to_string();
        match keyword {
            "GOODSIG" => good = true,
            "VALIDSIG" => {
                let fingerprint = fields.next().unwrap_or("").to_string();
                let timestamp = fields.nth(1)
                    .and_then(|t| t.parse::<i64>().ok())
                    .and_then(|t| DateTime::from_timestamp(t, 0));
                signature = Some(Signature {
                    fingerprint,
                    timestamp,
                    trust: TrustLevel::Unknown,
                });
            }
            "BADSIG" =>
                record(Error::OpenPgpBadSignature(rest()), &mut failure),
            "EXPSIG" =>
                record(Error::OpenPgpExpiredSignature(rest()), &mut failure),
            "EXPKEYSIG" =>
                record(Error::OpenPgpExpiredKey(rest()), &mut failure),
            "REVKEYSIG" =>
                record(Error::OpenPgpRevokedKey(rest()), &mut failure),
            "NO_PUBKEY" =>
                record(Error::OpenPgpUnknownKey(rest()), &mut failure),
            "ERRSIG" => {
                // ERRSIG <keyid> <pkalgo> <hashalgo> <class> <time> <rc> ...
                let f: Vec<&str> = fields.collect();
                let err = if f.get(5) == Some(&"9") {
                    Error::OpenPgpUnknownKey(f.first().unwrap_or(&"").to_string())
                } else {
                    Error::OpenPgpBadSignature(rest())
                };
                record(err, &mut failure);
            }
            // A key marked as explicitly distrusted fails; the other
            // trust states are surfaced on the signature.  Imported
            // keys in an isolated keyring have no ownertrust and
            // report TRUST_UNDEFINED.
            "TRUST_NEVER" => {
                trust = TrustLevel::Never;
                let signer = signature.as_ref()
                    .map(|sig| sig.fingerprint.clone())
                    .unwrap_or_else(rest);
                record(Error::OpenPgpUntrustedKey(signer), &mut failure);
            }
            "TRUST_UNDEFINED" => trust = TrustLevel::Undefined,
            "TRUST_MARGINAL" => trust = TrustLevel::Marginal,
            "TRUST_FULLY" => trust = TrustLevel::Full,
            "TRUST_ULTIMATE" => trust = TrustLevel::Ultimate,
            _ => (),
        }
    }

    if let Some(err) = failure {
        return Err(err.into());
    }
    match (good, signature) {
        (true, Some(mut sig)) => {
            sig.trust = trust;
            Ok(sig)
        }
        _ => Err(Error::OpenPgpNoSignature.into()),
    }
}

/// Whether `data` begins with a clearsign envelope.
pub fn is_clearsigned(data: &[u8]) -> bool {
    std::str::from_utf8(data)
        .map(|text| {
            text.lines()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim_end() == CLEARSIGN_BEGIN)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

/// Strips a clearsign envelope without verifying it.
///
/// Removes the header block, un-dash-escapes the payload, and discards
/// the trailing signature.  Used when a signed manifest is loaded with
/// signature verification disabled.
pub fn strip_clearsign(data: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::InvalidArgument(
            "clearsigned data is not valid UTF-8".into()))?;
    let malformed = || Error::InvalidArgument(
        "malformed clearsign envelope".into());

    let mut lines = text.lines();
    for line in &mut lines {
        if line.trim_end() == CLEARSIGN_BEGIN {
            break;
        }
        if !line.trim().is_empty() {
            return Err(malformed().into());
        }
    }
    // Armor headers run until the first empty line.
    let mut saw_blank = false;
    for line in &mut lines {
        if line.is_empty() {
            saw_blank = true;
            break;
        }
    }
    if !saw_blank {
        return Err(malformed().into());
    }

    let mut payload = Vec::new();
    let mut terminated = false;
    for line in &mut lines {
        if line.trim_end() == SIGNATURE_BEGIN {
            terminated = true;
            break;
        }
        let line = line.strip_prefix("- ").unwrap_or(line);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
    }
    if !terminated || !lines.any(|l| l.trim_end() == SIGNATURE_END) {
        return Err(malformed().into());
    }
    Ok(payload)
}

/// Candidate Web Key Directory URLs for an email address: advanced
/// method first, then direct.
pub fn wkd_urls(email: &str) -> Result<Vec<String>> {
    let (local, domain) = email.split_once('@')
        .filter(|(l, d)| !l.is_empty() && !d.is_empty())
        .ok_or_else(|| Error::InvalidArgument(
            format!("malformed email address: {:?}", email)))?;
    let local = local.to_lowercase();
    let domain = domain.to_lowercase();

    let mut ctx = crate::hash::HashAlgorithm::SHA1.context();
    ctx.update(local.as_bytes());
    let digest = ctx.finish();
    let hashed = zbase32(&hex::decode(digest).expect("own hex output"));

    Ok(vec![
        format!("https://openpgpkey.{domain}/.well-known/openpgpkey\
                 /{domain}/hu/{hashed}?l={local}"),
        format!("https://{domain}/.well-known/openpgpkey/hu/{hashed}\
                 ?l={local}"),
    ])
}

/// z-base-32 as used for WKD local-part hashes.
fn zbase32(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ybndrfg8ejkmcpqxot1uwisza345h769";
    let mut out = String::with_capacity(data.len() * 2);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[(acc >> bits) as usize & 0x1F] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[(acc << (5 - bits)) as usize & 0x1F] as char);
    }
    out
}

#[cfg(feature = "wkd")]
fn fetch(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::blocking::get(url)?.error_for_status()?;
    Ok(response.bytes()?.to_vec())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(status_lines: &str) -> Output {
        let stderr: String = status_lines.lines()
            .map(|l| format!("[GNUPG:] {}\n", l))
            .collect();
        Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: stderr.into_bytes(),
        }
    }

    const FPR: &str = "4D554A356E21F2D2AB3E1F7DFA3D85E2BD577985";

    #[test]
    fn good_signature() {
        let out = output(&format!(
            "GOODSIG FA3D85E2BD577985 Example <tester@example.com>\n\
             VALIDSIG {} 2024-01-01 1704067200 0 4 0 22 10 00 {}",
            FPR, FPR));
        let sig = parse_verification(&out).unwrap();
        assert_eq!(sig.fingerprint, FPR);
        assert_eq!(sig.timestamp.unwrap().timestamp(), 1704067200);
        assert_eq!(sig.trust, TrustLevel::Unknown);
    }

    #[test]
    fn trust_states_are_surfaced() {
        // No ownertrust (the isolated-keyring normal case) verifies.
        let out = output(&format!(
            "GOODSIG FA3D85E2BD577985 Example\n\
             VALIDSIG {} 2024-01-01 1704067200 0 4 0 22 10 00 {}\n\
             TRUST_UNDEFINED 0 pgp",
            FPR, FPR));
        let sig = parse_verification(&out).unwrap();
        assert_eq!(sig.trust, TrustLevel::Undefined);

        let out = output(&format!(
            "GOODSIG FA3D85E2BD577985 Example\n\
             VALIDSIG {} 2024-01-01 1704067200 0 4 0 22 10 00 {}\n\
             TRUST_ULTIMATE 0 pgp",
            FPR, FPR));
        assert_eq!(parse_verification(&out).unwrap().trust,
                   TrustLevel::Ultimate);
    }

    #[test]
    fn distrusted_key_fails() {
        // An explicitly distrusted key fails even with GOODSIG and
        // VALIDSIG present.
        let out = output(&format!(
            "GOODSIG FA3D85E2BD577985 Example\n\
             VALIDSIG {} 2024-01-01 1704067200 0 4 0 22 10 00 {}\n\
             TRUST_NEVER 0 pgp",
            FPR, FPR));
        let err = parse_verification(&out).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::OpenPgpUntrustedKey(signer)) =>
                assert_eq!(signer, FPR),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn verification_failures() {
        let cases: [(&str, fn(&Error) -> bool); 5] = [
            ("BADSIG FA3D85E2BD577985 Example",
             |e| matches!(e, Error::OpenPgpBadSignature(_))),
            ("EXPKEYSIG FA3D85E2BD577985 Example",
             |e| matches!(e, Error::OpenPgpExpiredKey(_))),
            ("REVKEYSIG FA3D85E2BD577985 Example",
             |e| matches!(e, Error::OpenPgpRevokedKey(_))),
            ("ERRSIG FA3D85E2BD577985 1 10 00 1704067200 9 -\n\
              NO_PUBKEY FA3D85E2BD577985",
             |e| matches!(e, Error::OpenPgpUnknownKey(_))),
            ("NODATA 1",
             |e| matches!(e, Error::OpenPgpNoSignature)),
        ];
        for (status, matcher) in cases {
            let err = parse_verification(&output(status)).unwrap_err();
            let err = err.downcast_ref::<Error>().unwrap();
            assert!(matcher(err), "wrong kind for {:?}: {}", status, err);
        }
    }

    #[test]
    fn goodsig_without_validsig_is_no_signature() {
        let err = parse_verification(&output("GOODSIG X Y")).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::OpenPgpNoSignature)));
    }

    const CLEARSIGNED: &str = "\
-----BEGIN PGP SIGNED MESSAGE-----
Hash: SHA512

TIMESTAMP 2024-01-01T00:00:00Z
- -- dash escaped line
DATA a 6 SHA256 5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03
-----BEGIN PGP SIGNATURE-----

iQEzBAEBCgAdFiEEexampleexampleexampleexampleexample=
=abcd
-----END PGP SIGNATURE-----
";

    #[test]
    fn strip_envelope() {
        assert!(is_clearsigned(CLEARSIGNED.as_bytes()));
        let plain = strip_clearsign(CLEARSIGNED.as_bytes()).unwrap();
        let plain = String::from_utf8(plain).unwrap();
        assert!(plain.starts_with("TIMESTAMP 2024-01-01T00:00:00Z\n"));
        assert!(plain.contains("\n-- dash escaped line\n"));
        assert!(!plain.contains("PGP SIGNATURE"));
    }

    #[test]
    fn strip_rejects_truncation() {
        let cut = &CLEARSIGNED[..CLEARSIGNED.find("-----BEGIN PGP SIGNATURE").unwrap()];
        assert!(strip_clearsign(cut.as_bytes()).is_err());
        assert!(strip_clearsign(b"DATA a 0\n").is_err());
    }

    #[test]
    fn wkd_hashing() {
        // The draft-koch example mapping.
        assert_eq!(zbase32(b"hello"), "pb1sa5dx");
        assert_eq!(zbase32(b"\x00"), "yy");
        let urls = wkd_urls("Joe.Doe@Example.ORG").unwrap();
        assert!(urls[0].contains("openpgpkey.example.org"));
        assert!(urls.iter().all(
            |u| u.contains("iy9q119eutrkn8s1mk4r39qejnbu3n5q")));
        assert!(wkd_urls("not-an-address").is_err());
    }

    #[test]
    fn unavailable_tool_degrades() {
        let ctx = Context {
            tool: PathBuf::from("/nonexistent/openpgp-tool"),
            home: None,
            unavailable: probe(&PathBuf::from("/nonexistent/openpgp-tool")),
        };
        assert!(!ctx.is_available());
        let err = ctx.verify(b"x").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::OpenPgpUnavailable(_))));
    }
}
