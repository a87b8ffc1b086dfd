//! Digest computation over byte streams.
//!
//! Manifest entries may carry any number of digests per file.  The
//! multiplexer in this module feeds a stream once through every
//! requested algorithm while counting bytes, so that a file is read
//! exactly once no matter how many digests its entry records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use digest::DynDigest;

use crate::{Error, Result};

/// Size of the read buffer used when streaming a source.
///
/// Constant with respect to stream length; the multiplexer never
/// buffers more than one chunk.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// A digest algorithm a manifest entry may reference.
///
/// The variants carry the canonical manifest tokens; [`fmt::Display`]
/// emits them and [`FromStr`] accepts exactly them.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    /// MD5.  Legacy; retained for old manifest compatibility.
    MD5,
    /// RIPEMD-160.
    RMD160,
    /// SHA-1.  Legacy; retained for old manifest compatibility.
    SHA1,
    /// SHA-256.
    SHA256,
    /// SHA-512.
    SHA512,
    /// SHA3-256.
    SHA3_256,
    /// SHA3-512.
    SHA3_512,
    /// BLAKE2b with a 512-bit digest.
    BLAKE2B,
    /// BLAKE2s with a 256-bit digest.
    BLAKE2S,
    /// Whirlpool.
    WHIRLPOOL,
    /// GOST R 34.11-2012 with a 256-bit digest.
    STREEBOG256,
    /// GOST R 34.11-2012 with a 512-bit digest.
    STREEBOG512,
}

impl HashAlgorithm {
    /// All algorithms this build can compute.
    pub fn variants() -> &'static [HashAlgorithm] {
        use HashAlgorithm::*;
        &[MD5, RMD160, SHA1, SHA256, SHA512, SHA3_256, SHA3_512,
          BLAKE2B, BLAKE2S, WHIRLPOOL, STREEBOG256, STREEBOG512]
    }

    /// The canonical manifest token for this algorithm.
    pub fn token(self) -> &'static str {
        use HashAlgorithm::*;
        match self {
            MD5 => "MD5",
            RMD160 => "RMD160",
            SHA1 => "SHA1",
            SHA256 => "SHA256",
            SHA512 => "SHA512",
            SHA3_256 => "SHA3_256",
            SHA3_512 => "SHA3_512",
            BLAKE2B => "BLAKE2B",
            BLAKE2S => "BLAKE2S",
            WHIRLPOOL => "WHIRLPOOL",
            STREEBOG256 => "STREEBOG256",
            STREEBOG512 => "STREEBOG512",
        }
    }

    /// Creates a fresh hashing context for this algorithm.
    pub fn context(self) -> Context {
        use HashAlgorithm::*;
        let ctx: Box<dyn DynDigest + Send> = match self {
            MD5 => Box::new(md5::Md5::default()),
            RMD160 => Box::new(ripemd::Ripemd160::default()),
            SHA1 => Box::new(sha1::Sha1::default()),
            SHA256 => Box::new(sha2::Sha256::default()),
            SHA512 => Box::new(sha2::Sha512::default()),
            SHA3_256 => Box::new(sha3::Sha3_256::default()),
            SHA3_512 => Box::new(sha3::Sha3_512::default()),
            BLAKE2B => Box::new(blake2::Blake2b512::default()),
            BLAKE2S => Box::new(blake2::Blake2s256::default()),
            WHIRLPOOL => Box::new(whirlpool::Whirlpool::default()),
            STREEBOG256 => Box::new(streebog::Streebog256::default()),
            STREEBOG512 => Box::new(streebog::Streebog512::default()),
        };
        Context { algo: self, ctx }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    /// Parses a canonical manifest token.
    ///
    /// Unknown tokens fail with [`Error::UnsupportedHash`], before any
    /// I/O happens, so that callers can skip cleanly.
    fn from_str(s: &str) -> ::std::result::Result<Self, Error> {
        HashAlgorithm::variants().iter().copied()
            .find(|a| a.token() == s)
            .ok_or_else(|| Error::UnsupportedHash(s.into()))
    }
}

/// State of a hash function.
pub struct Context {
    algo: HashAlgorithm,
    ctx: Box<dyn DynDigest + Send>,
}

impl Context {
    /// Returns the algorithm.
    pub fn algo(&self) -> HashAlgorithm {
        self.algo
    }

    /// Writes data into the hash function.
    pub fn update<D: AsRef<[u8]>>(&mut self, data: D) {
        self.ctx.update(data.as_ref());
    }

    /// Finalizes the hash function, returning the digest as lowercase
    /// hex.
    pub fn finish(mut self) -> String {
        hex::encode(self.ctx.finalize_reset())
    }
}

impl io::Write for Context {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Feeds one byte stream through several hash algorithms at once.
///
/// Also counts the bytes written, since every manifest entry records a
/// size next to its digests.
pub struct Multiplexer {
    contexts: Vec<Context>,
    count: u64,
}

impl Multiplexer {
    /// Creates a multiplexer over the given algorithm set.
    pub fn new<I>(algos: I) -> Multiplexer
        where I: IntoIterator<Item = HashAlgorithm>
    {
        Multiplexer {
            contexts: algos.into_iter().map(|a| a.context()).collect(),
            count: 0,
        }
    }

    /// Parses algorithm tokens and creates a multiplexer over them.
    ///
    /// Fails with [`Error::UnsupportedHash`] on the first unknown token,
    /// before any data is consumed.
    pub fn from_tokens<'a, I>(tokens: I) -> Result<Multiplexer>
        where I: IntoIterator<Item = &'a str>
    {
        let algos = tokens.into_iter()
            .map(str::parse)
            .collect::<::std::result::Result<BTreeSet<HashAlgorithm>, _>>()?;
        Ok(Multiplexer::new(algos))
    }

    /// Writes a chunk into every context.
    pub fn update(&mut self, data: &[u8]) {
        for ctx in &mut self.contexts {
            ctx.update(data);
        }
        self.count += data.len() as u64;
    }

    /// Finalizes all contexts, returning `{token → lowercase hex}` and
    /// the total byte count.
    pub fn finish(self) -> (BTreeMap<String, String>, u64) {
        let digests = self.contexts.into_iter()
            .map(|ctx| (ctx.algo().token().to_string(), ctx.finish()))
            .collect();
        (digests, self.count)
    }

    /// Consumes a reader to the end in bounded-memory chunks.
    pub fn consume<R: Read>(&mut self, mut source: R) -> io::Result<()> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.update(&buf[..n]);
        }
        Ok(())
    }
}

impl io::Write for Multiplexer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hashes a reader with every algorithm in `algos`, reading it exactly
/// once.  Returns the digests keyed by canonical token, plus the byte
/// count.
pub fn hash_reader<R, I>(algos: I, source: R)
    -> Result<(BTreeMap<String, String>, u64)>
    where R: Read, I: IntoIterator<Item = HashAlgorithm>
{
    let mut mux = Multiplexer::new(algos);
    mux.consume(source)?;
    Ok(mux.finish())
}

/// Opens a file and hashes it with every algorithm in `algos`.
pub fn hash_path<I>(path: &Path, algos: I)
    -> Result<(BTreeMap<String, String>, u64)>
    where I: IntoIterator<Item = HashAlgorithm>
{
    let file = File::open(path)
        .map_err(|e| Error::io(path, e))?;
    hash_reader(algos, file)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        for &algo in HashAlgorithm::variants() {
            assert_eq!(algo.token().parse::<HashAlgorithm>().unwrap(), algo);
        }
    }

    #[test]
    fn unknown_token() {
        let err = "SHA42".parse::<HashAlgorithm>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedHash(ref t) if t == "SHA42"));
    }

    #[test]
    fn reference_digests() {
        use HashAlgorithm::*;
        // Pairs of (algorithm, digest of b"hello\n").
        for (algo, expected) in [
            (MD5, "b1946ac92492d2347c6235b4d2611184"),
            (SHA1, "f572d396fae9206628714fb2ce00f72e94f2258f"),
            (SHA256,
             "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"),
        ] {
            let (digests, size) =
                hash_reader([algo], &b"hello\n"[..]).unwrap();
            assert_eq!(size, 6);
            assert_eq!(digests[algo.token()], expected);
        }
    }

    #[test]
    fn multiplexed_single_pass() {
        use HashAlgorithm::*;
        let (digests, size) =
            hash_reader([SHA256, SHA512, BLAKE2B], &b"hello\n"[..]).unwrap();
        assert_eq!(size, 6);
        assert_eq!(digests.len(), 3);
        let (alone, _) = hash_reader([SHA512], &b"hello\n"[..]).unwrap();
        assert_eq!(digests["SHA512"], alone["SHA512"]);
    }

    #[test]
    fn empty_stream() {
        use HashAlgorithm::*;
        let (digests, size) = hash_reader([SHA256], &b""[..]).unwrap();
        assert_eq!(size, 0);
        assert_eq!(
            digests["SHA256"],
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }

    quickcheck::quickcheck! {
        fn mux_matches_single(data: Vec<u8>) -> bool {
            use HashAlgorithm::*;
            let (multi, n) =
                hash_reader([SHA256, WHIRLPOOL, STREEBOG256], &data[..])
                    .unwrap();
            let (single, _) = hash_reader([SHA256], &data[..]).unwrap();
            n == data.len() as u64 && multi["SHA256"] == single["SHA256"]
        }
    }
}
