/// A command-line frontend for veritree.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::exit;

use anyhow::Context as _;
use clap::ArgMatches;

use veritree::compression::Format;
use veritree::hash::{self, HashAlgorithm};
use veritree::openpgp;
use veritree::profile::Profile;
use veritree::tree::{ManifestTree, TreeOptions, UpdateOptions, VerifyOptions};
use veritree::{Error, Result};

mod vt_cli;

/// Exit statuses: 0 success, 1 verification failure, 2 usage error,
/// 3 OpenPGP failure, 4 I/O failure.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<io::Error>().is_some() {
        return 4;
    }
    match err.downcast_ref::<Error>() {
        Some(Error::InvalidArgument(_)) => 2,
        Some(Error::OpenPgpNoSignature)
        | Some(Error::OpenPgpBadSignature(_))
        | Some(Error::OpenPgpExpiredKey(_))
        | Some(Error::OpenPgpExpiredSignature(_))
        | Some(Error::OpenPgpRevokedKey(_))
        | Some(Error::OpenPgpUntrustedKey(_))
        | Some(Error::OpenPgpUnknownKey(_))
        | Some(Error::OpenPgpUnavailable(_))
        | Some(Error::OpenPgpSigningFailure(_))
        | Some(Error::OpenPgpKeyImport(_))
        | Some(Error::OpenPgpKeyRefresh(_)) => 3,
        Some(Error::Io { .. }) => 4,
        _ => 1,
    }
}

fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let matches = vt_cli::build().get_matches();
    init_logging(matches.get_count("verbose"));
    match run(&matches) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("vt: {:#}", err);
            exit(exit_code_for(&err));
        }
    }
}

fn run(matches: &ArgMatches) -> Result<i32> {
    match matches.subcommand() {
        Some(("verify", m)) => verify(m),
        Some(("create", m)) => create_or_update(m, true),
        Some(("update", m)) => create_or_update(m, false),
        Some(("hash", m)) => hash_files(m),
        Some(("openpgp-verify", m)) => openpgp_verify(m),
        Some(("openpgp-verify-detached", m)) => openpgp_verify_detached(m),
        _ => unreachable!("subcommand is required"),
    }
}

/// Builds the OpenPGP context: the ambient keyring by default, or an
/// isolated keyring holding exactly the given key.
fn openpgp_context(key_file: Option<&String>) -> Result<openpgp::Context> {
    match key_file {
        None => Ok(openpgp::Context::system()),
        Some(file) => {
            let ctx = openpgp::Context::ephemeral()?;
            let key = fs::read(file)
                .with_context(|| format!("Failed to read key {:?}", file))?;
            ctx.import_key(&key)?;
            Ok(ctx)
        }
    }
}

fn parse_hashes(spec: &str) -> Result<Vec<HashAlgorithm>> {
    let algos = spec
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(str::parse)
        .collect::<::std::result::Result<Vec<HashAlgorithm>, Error>>()?;
    if algos.is_empty() {
        return Err(Error::InvalidArgument(
            "no hash algorithms given".into()).into());
    }
    Ok(algos)
}

fn verify(m: &ArgMatches) -> Result<i32> {
    let path = m.get_one::<String>("path").expect("required");
    let openpgp_ctx = openpgp_context(m.get_one("openpgp-key"))?;
    let mut tree = ManifestTree::open(
        path,
        Some(openpgp_ctx),
        TreeOptions {
            require_signed: m.get_flag("require-signed-manifest"),
            ..TreeOptions::default()
        })?;
    let report = tree.assert_directory_verifies("", &VerifyOptions {
        fail_fast: !m.get_flag("keep-going"),
        jobs: m.get_one::<usize>("jobs").copied().unwrap_or(0),
        max_age: m.get_one::<i64>("require-fresh")
            .map(|hours| chrono::Duration::hours(*hours)),
        one_file_system: m.get_flag("one-file-system"),
        distdir: m.get_one::<String>("distdir").map(PathBuf::from),
    })?;
    if report.is_ok() {
        Ok(0)
    } else {
        eprint!("{}", report);
        Ok(1)
    }
}

fn create_or_update(m: &ArgMatches, create: bool) -> Result<i32> {
    let path = m.get_one::<String>("path").expect("required");
    let profile = match m.get_one::<String>("profile") {
        Some(name) => Profile::find(name)?,
        None => Profile::default(),
    };
    let sign = if m.get_flag("sign") {
        Some(true)
    } else if m.get_flag("no-sign") {
        Some(false)
    } else {
        None
    };
    let opts = UpdateOptions {
        profile,
        hashes: m.get_one::<String>("hashes")
            .map(|spec| parse_hashes(spec))
            .transpose()?,
        sign,
        openpgp_id: m.get_one::<String>("openpgp-id").cloned(),
        timestamp: m.get_flag("timestamp"),
        compress_format: m.get_one::<String>("compress-format")
            .map(|name| Format::from_name(name))
            .transpose()?,
        compress_watermark: m.get_one::<u64>("compress-watermark").copied(),
        force_rewrite: m.get_flag("force-rewrite"),
        jobs: m.get_one::<usize>("jobs").copied().unwrap_or(0),
        one_file_system: m.get_flag("one-file-system"),
    };
    let openpgp_ctx = openpgp_context(m.get_one("openpgp-key"))?;

    if create {
        ManifestTree::create(path, Some(openpgp_ctx), &opts)?;
    } else {
        let mut tree = ManifestTree::open(
            path, Some(openpgp_ctx), TreeOptions::default())?;
        tree.update("", &opts)?;
    }
    Ok(0)
}

fn hash_files(m: &ArgMatches) -> Result<i32> {
    let algos = parse_hashes(m.get_one::<String>("hashes")
                             .expect("required"))?;
    for path in m.get_many::<String>("path").expect("required") {
        let (digests, size) = if path == "-" {
            hash::hash_reader(algos.iter().copied(), io::stdin().lock())?
        } else {
            hash::hash_path(std::path::Path::new(path),
                            algos.iter().copied())?
        };
        for (algo, digest) in &digests {
            println!("{} ({}) = {}", algo, path, digest);
        }
        println!("Size ({}) = {}", path, size);
    }
    Ok(0)
}

fn read_input(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut data = Vec::new();
        io::stdin().lock().read_to_end(&mut data)
            .context("Failed to read standard input")?;
        Ok(data)
    } else {
        fs::read(path).with_context(|| format!("Failed to read {:?}", path))
    }
}

fn openpgp_verify(m: &ArgMatches) -> Result<i32> {
    let ctx = openpgp_context(m.get_one("openpgp-key"))?;
    for path in m.get_many::<String>("path").expect("required") {
        let data = read_input(path)?;
        let (_, sig) = ctx.verify(&data)?;
        match sig.timestamp {
            Some(ts) => println!("{}: good signature from {} ({})",
                                 path, sig.fingerprint, ts),
            None => println!("{}: good signature from {}",
                             path, sig.fingerprint),
        }
    }
    Ok(0)
}

fn openpgp_verify_detached(m: &ArgMatches) -> Result<i32> {
    let ctx = openpgp_context(m.get_one("openpgp-key"))?;
    let signature = read_input(m.get_one::<String>("signature")
                               .expect("required"))?;
    let data = read_input(m.get_one::<String>("data").expect("required"))?;
    let sig = ctx.verify_detached(&data, &signature)?;
    match sig.timestamp {
        Some(ts) => println!("good signature from {} ({})",
                             sig.fingerprint, ts),
        None => println!("good signature from {}", sig.fingerprint),
    }
    Ok(0)
}
