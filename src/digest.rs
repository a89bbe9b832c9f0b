use std::{
    fmt,
    io::{self, Read, Write},
};

use sha2::Digest as _;

/// Algorithm to compute the hash value.
///
/// See [`Digest`] for an example.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DigestAlgorithm {
    SHA256,
    SHA512,
}

impl DigestAlgorithm {
    pub(crate) fn prefix(self) -> &'static str {
        match self {
            DigestAlgorithm::SHA256 => "sha256",
            DigestAlgorithm::SHA512 => "sha512",
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            DigestAlgorithm::SHA256 => Hasher::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::SHA512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }
}

#[derive(Clone)]
enum Hasher {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> String {
        fn hex<D: digest::Digest>(hasher: D) -> String {
            HexString(hasher.finalize()).to_string()
        }

        match self {
            Hasher::Sha256(h) => hex(h),
            Hasher::Sha512(h) => hex(h),
        }
    }
}

/// A content digest, like `sha256:a3ed95ca...`.
///
/// It contains the algorithm (like `SHA256`) and its expected value as
/// a hexadecimal string.
///
/// # Examples
///
/// ```
/// # use image_pull::*;
/// const DIGEST: &str = "123456789012345678901234567890123456789012345678901234567890abcd";
///
/// let digest = Digest::try_from(format!("sha256:{}", DIGEST)).unwrap();
/// assert_eq!(digest.algorithm(), DigestAlgorithm::SHA256);
/// assert_eq!(digest.hash_value(), DIGEST);
/// assert_eq!(digest.short_id(), "123456789012");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(try_from = "String")]
pub struct Digest {
    hash: String,
    algorithm: DigestAlgorithm,
}

/// Errors from the digest parser.
#[derive(thiserror::Error, Debug)]
pub enum DigestError {
    #[error("Invalid digest algorithm.")]
    InvalidAlgorithm,

    #[error("Invalid digest value.")]
    InvalidValue,
}

impl Digest {
    /// Compute the SHA256 digest of `data`.
    pub fn sha256(data: impl AsRef<[u8]>) -> Digest {
        Digest::from_bytes(DigestAlgorithm::SHA256, data)
    }

    /// Compute the digest of `data` with `algorithm`.
    pub fn from_bytes(algorithm: DigestAlgorithm, data: impl AsRef<[u8]>) -> Digest {
        let mut hasher = algorithm.hasher();
        hasher.update(data.as_ref());
        Digest::from_hasher(algorithm, hasher)
    }

    fn from_hasher(algorithm: DigestAlgorithm, hasher: Hasher) -> Self {
        let hash = format!("{}:{}", algorithm.prefix(), hasher.finalize());
        Digest { hash, algorithm }
    }

    /// Original string to build this instance (`algorithm:hash_value`).
    pub fn source(&self) -> &str {
        &self.hash
    }

    pub fn hash_value(&self) -> &str {
        self.hash
            .split_once(':')
            .map(|(_, h)| h)
            .unwrap_or_default()
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Short identifier used in progress messages.
    pub fn short_id(&self) -> &str {
        let value = self.hash_value();
        value.get(..12).unwrap_or(value)
    }

    /// Check if `data` hashes to this digest.
    pub fn verify(&self, data: impl AsRef<[u8]>) -> bool {
        let mut verifier = Verifier::new(self);
        verifier.update(data.as_ref());
        verifier.verified()
    }

    /// Return a `Read` instance to compute its digest.
    ///
    /// When all data from `reader` is consumed, it verifies that the
    /// computed digest is the expected one. If not, it returns an
    /// [`InvalidData`](::std::io::ErrorKind::InvalidData)
    /// error.
    pub fn wrap_reader<R: Read>(&self, reader: R) -> impl Read {
        DigestReader {
            verifier: Verifier::new(self),
            reader,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hash)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(hash: String) -> Result<Self, Self::Error> {
        let (algorithm, value, expected_size) = {
            if let Some(h) = hash.strip_prefix("sha256:") {
                (DigestAlgorithm::SHA256, h, 256 / 8 * 2)
            } else if let Some(h) = hash.strip_prefix("sha512:") {
                (DigestAlgorithm::SHA512, h, 512 / 8 * 2)
            } else {
                return Err(DigestError::InvalidAlgorithm);
            }
        };

        // Validate that the hash value is a string with the expected length,
        // and it only contains lowercase hexadecimal digits.
        if value.len() == expected_size && value.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            Ok(Digest { hash, algorithm })
        } else {
            Err(DigestError::InvalidValue)
        }
    }
}

impl std::str::FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::try_from(s.to_owned())
    }
}

/// Incremental hash of a stream, compared against an expected digest.
///
/// The state survives between calls to [`update`](Self::update), so a
/// download can be resumed without reading the previous bytes again.
pub struct Verifier {
    hasher: Hasher,
    expected: Digest,
    length: u64,
}

impl Verifier {
    pub fn new(expected: &Digest) -> Self {
        Verifier {
            hasher: expected.algorithm.hasher(),
            expected: expected.clone(),
            length: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.length += data.len() as u64;
    }

    /// Number of bytes received so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Digest of the bytes received so far.
    pub fn computed(&self) -> Digest {
        Digest::from_hasher(self.expected.algorithm, self.hasher.clone())
    }

    pub fn verified(&self) -> bool {
        self.computed().hash_value().eq_ignore_ascii_case(self.expected.hash_value())
    }
}

struct DigestReader<R> {
    verifier: Verifier,
    reader: R,
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let buf_len = buf.len();
        let n = self.reader.read(buf)?;

        if n == 0 && buf_len > 0 {
            // On EOF, compare the computed digest with the expected one.
            return self.check_hash();
        }

        self.verifier.update(&buf[..n]);

        Ok(n)
    }
}

impl<R> DigestReader<R> {
    fn check_hash(&mut self) -> io::Result<usize> {
        if self.verifier.verified() {
            return Ok(0);
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Invalid digest. Expected {}, got {}.",
                self.verifier.expected,
                self.verifier.computed()
            ),
        ))
    }
}

/// Compute the digest of the data written to `inner`.
pub struct DigestWriter<W> {
    algorithm: DigestAlgorithm,
    hasher: Hasher,
    inner: W,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(algorithm: DigestAlgorithm, inner: W) -> Self {
        DigestWriter {
            algorithm,
            hasher: algorithm.hasher(),
            inner,
        }
    }

    /// Return the inner writer, and the digest of the data.
    pub fn finish(self) -> (W, Digest) {
        (self.inner, Digest::from_hasher(self.algorithm, self.hasher))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Encode a byte buffer as hex string.
pub(crate) struct HexString<T>(pub T);

impl<T: AsRef<[u8]>> fmt::Display for HexString<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0
            .as_ref()
            .iter()
            .try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}

#[test]
fn encode_hex_bytes() {
    assert_eq!(HexString(b"\x01\x20\xf0").to_string(), "0120f0");
}

#[test]
fn reject_invalid_digest() {
    use std::io::Cursor;

    /// Digest for `abc`
    const DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    let digest = Digest::try_from(format!("sha256:{DIGEST}")).unwrap();
    let mut output = Vec::new();

    // Accept a valid digest.
    digest
        .wrap_reader(Cursor::new("abc"))
        .read_to_end(&mut output)
        .unwrap();

    assert_eq!(output, b"abc");

    // Reject an invalid digest.
    output.clear();
    let err = digest
        .wrap_reader(Cursor::new("abcx"))
        .read_to_end(&mut output)
        .unwrap_err();

    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    let msg = err.into_inner().unwrap().to_string().to_lowercase();
    assert!(msg.contains(DIGEST));
    assert!(msg.contains("7571ce1f8e21c6b13dd7ec2c5ec7c9e4dd9852e209869511853f2f1f74b17927"));
}

#[test]
fn reject_uppercase_digest() {
    let digest = Digest::sha256(b"abc");
    let upper = format!("sha256:{}", digest.hash_value().to_ascii_uppercase());

    assert!(matches!(
        Digest::try_from(upper),
        Err(DigestError::InvalidValue)
    ));

    assert_eq!(Digest::try_from(digest.to_string()).unwrap(), digest);
}

#[test]
fn verifier_is_incremental() {
    let digest = Digest::sha256(b"abcdef");
    assert_eq!(
        digest.source(),
        "sha256:bef57ec7f53a6d40beb640a780a639c83bc29ac8a9816f1fc6c5c6dcd93c4721"
    );

    let mut verifier = Verifier::new(&digest);
    verifier.update(b"abc");
    assert!(!verifier.verified());
    assert_eq!(verifier.computed(), Digest::sha256(b"abc"));

    // Checking the intermediate state must not disturb the hasher.
    verifier.update(b"def");
    assert!(verifier.verified());
    assert_eq!(verifier.len(), 6);
}

#[test]
fn verify_with_sha512() {
    let digest = Digest::from_bytes(DigestAlgorithm::SHA512, b"payload");
    assert_eq!(digest.hash_value().len(), 128);
    assert!(digest.verify(b"payload"));
    assert!(!digest.verify(b"payload!"));
}

#[test]
fn digest_of_written_data() {
    let mut writer = DigestWriter::new(DigestAlgorithm::SHA256, Vec::new());
    writer.write_all(b"abc").unwrap();
    writer.write_all(b"def").unwrap();

    let (data, digest) = writer.finish();
    assert_eq!(data, b"abcdef");
    assert_eq!(digest, Digest::sha256(b"abcdef"));
}
