/// Command-line parser for vt.

use clap::{value_parser, Arg, ArgAction, Command};

pub fn build() -> Command {
    Command::new("vt")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verifies and maintains manifest-described file trees.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(Arg::new("verbose")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .global(true)
             .help("Increases logging verbosity (repeatable)"))
        .subcommand(
            Command::new("verify")
                .display_order(10)
                .about("Verifies a tree against its manifests")
                .arg(Arg::new("path").value_name("PATH").required(true)
                     .help("Root of the tree to verify"))
                .arg(Arg::new("keep-going")
                     .long("keep-going")
                     .short('k')
                     .action(ArgAction::SetTrue)
                     .help("Collect all problems instead of stopping at \
                            the first"))
                .arg(Arg::new("require-signed-manifest")
                     .long("require-signed-manifest")
                     .short('s')
                     .action(ArgAction::SetTrue)
                     .help("Fail unless the top-level manifest carries a \
                            good OpenPGP signature"))
                .arg(openpgp_key_arg())
                .arg(Arg::new("require-fresh")
                     .long("require-fresh")
                     .value_name("HOURS")
                     .value_parser(value_parser!(i64))
                     .help("Fail if the manifest timestamp is older than \
                            this many hours"))
                .arg(Arg::new("distdir")
                     .long("distdir")
                     .value_name("DIR")
                     .help("Also check DIST entries against this \
                            directory"))
                .arg(jobs_arg())
                .arg(one_file_system_arg()))
        .subcommand(update_like(
            Command::new("create")
                .display_order(20)
                .about("Creates manifests for a tree from scratch")))
        .subcommand(update_like(
            Command::new("update")
                .display_order(30)
                .about("Updates manifests to match the tree")))
        .subcommand(
            Command::new("hash")
                .display_order(40)
                .about("Hashes files with a set of manifest algorithms")
                .arg(Arg::new("hashes")
                     .long("hashes")
                     .short('H')
                     .value_name("HASHES")
                     .required(true)
                     .help("Whitespace- or comma-separated algorithm \
                            tokens, e.g. \"SHA256 SHA512\""))
                .arg(Arg::new("path").value_name("PATH")
                     .num_args(1..)
                     .required(true)
                     .help("Files to hash; - reads standard input")))
        .subcommand(
            Command::new("openpgp-verify")
                .display_order(50)
                .about("Verifies clearsigned files")
                .arg(openpgp_key_arg())
                .arg(Arg::new("path").value_name("PATH")
                     .num_args(1..)
                     .required(true)
                     .help("Clearsigned files to verify")))
        .subcommand(
            Command::new("openpgp-verify-detached")
                .display_order(60)
                .about("Verifies a detached signature over a file")
                .arg(openpgp_key_arg())
                .arg(Arg::new("signature").value_name("SIG").required(true)
                     .help("Detached signature file"))
                .arg(Arg::new("data").value_name("DATA").required(true)
                     .help("The signed data")))
}

/// Arguments shared by `create` and `update`.
fn update_like(cmd: Command) -> Command {
    cmd.arg(Arg::new("path").value_name("PATH").required(true)
            .help("Root of the tree"))
        .arg(Arg::new("profile")
             .long("profile")
             .short('p')
             .value_name("PROFILE")
             .help("Profile supplying hash set, compression, and layout \
                    defaults"))
        .arg(Arg::new("hashes")
             .long("hashes")
             .short('H')
             .value_name("HASHES")
             .conflicts_with("profile")
             .help("Digest algorithms overriding the profile's"))
        .arg(Arg::new("sign")
             .long("sign")
             .action(ArgAction::SetTrue)
             .help("Sign the top-level manifest"))
        .arg(Arg::new("no-sign")
             .long("no-sign")
             .action(ArgAction::SetTrue)
             .conflicts_with("sign")
             .help("Never sign, even if the tree was signed before"))
        .arg(Arg::new("openpgp-id")
             .long("openpgp-id")
             .value_name("ID")
             .help("Key to sign with"))
        .arg(openpgp_key_arg())
        .arg(Arg::new("timestamp")
             .long("timestamp")
             .action(ArgAction::SetTrue)
             .help("Record the creation time in the top-level manifest"))
        .arg(Arg::new("compress-format")
             .long("compress-format")
             .value_name("FORMAT")
             .help("Compression for sub-manifests: none, gz, bz2, or xz"))
        .arg(Arg::new("compress-watermark")
             .long("compress-watermark")
             .value_name("BYTES")
             .value_parser(value_parser!(u64))
             .help("Only compress sub-manifests at least this large"))
        .arg(Arg::new("incremental")
             .long("incremental")
             .action(ArgAction::SetTrue)
             .conflicts_with("force-rewrite")
             .help("Only rewrite manifests whose subtree changed \
                    (the default)"))
        .arg(Arg::new("force-rewrite")
             .long("force-rewrite")
             .action(ArgAction::SetTrue)
             .help("Rewrite and renormalize every manifest, even \
                    untouched ones"))
        .arg(jobs_arg())
        .arg(one_file_system_arg())
}

fn openpgp_key_arg() -> Arg {
    Arg::new("openpgp-key")
        .long("openpgp-key")
        .short('K')
        .value_name("FILE")
        .help("Use an isolated keyring holding only this key")
}

fn jobs_arg() -> Arg {
    Arg::new("jobs")
        .long("jobs")
        .short('j')
        .value_name("N")
        .value_parser(value_parser!(usize))
        .help("Hashing threads; defaults to one per CPU")
}

fn one_file_system_arg() -> Arg {
    Arg::new("one-file-system")
        .long("one-file-system")
        .short('x')
        .action(ArgAction::SetTrue)
        .help("Refuse to cross filesystem boundaries")
}

#[cfg(test)]
mod test {
    #[test]
    fn cli_is_well_formed() {
        super::build().debug_assert();
    }
}
