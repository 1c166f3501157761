use base64::{Engine as _, engine::general_purpose};
use digest::Digest;
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use std::fmt;
use std::io::{self, Read};
use tokio::io::{self as async_io, AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashDigest {
    SHA512(String, HashEncoding),
    SHA384(String, HashEncoding),
    SHA256(String, HashEncoding),
    SHA1(String, HashEncoding),
    MD5(String, HashEncoding),
}

impl HashDigest {
    pub fn new(algorithm: HashAlgorithm, value: String, encoding: HashEncoding) -> Self {
        match algorithm {
            HashAlgorithm::SHA512 => HashDigest::SHA512(value, encoding),
            HashAlgorithm::SHA384 => HashDigest::SHA384(value, encoding),
            HashAlgorithm::SHA256 => HashDigest::SHA256(value, encoding),
            HashAlgorithm::SHA1 => HashDigest::SHA1(value, encoding),
            HashAlgorithm::MD5 => HashDigest::MD5(value, encoding),
        }
    }

    /// Builds a digest from a textual value, accepting hex (any case) or
    /// standard base64. Returns None when the value does not decode to the
    /// algorithm's digest length.
    pub fn parse(algorithm: HashAlgorithm, value: &str) -> Option<Self> {
        let value = value.trim();
        if let Some(bytes) = decode_hex(value) {
            if bytes.len() == algorithm.digest_len() {
                return Some(Self::new(
                    algorithm,
                    value.to_ascii_lowercase(),
                    HashEncoding::Hex,
                ));
            }
        }
        if let Ok(bytes) = general_purpose::STANDARD.decode(value) {
            if bytes.len() == algorithm.digest_len() {
                return Some(Self::new(algorithm, value.to_string(), HashEncoding::Base64));
            }
        }
        None
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::from(self)
    }

    pub fn encoding(&self) -> HashEncoding {
        HashEncoding::from(self)
    }

    pub fn value(&self) -> &str {
        match self {
            HashDigest::MD5(s, _)
            | HashDigest::SHA1(s, _)
            | HashDigest::SHA256(s, _)
            | HashDigest::SHA384(s, _)
            | HashDigest::SHA512(s, _) => s,
        }
    }

    /// Raw digest bytes, regardless of the textual encoding.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self.encoding() {
            HashEncoding::Hex => decode_hex(self.value()),
            HashEncoding::Base64 => general_purpose::STANDARD.decode(self.value()).ok(),
        }
    }

    /// Lowercase hex rendering, used for comparisons and reports.
    pub fn to_hex(&self) -> String {
        match self.encoding() {
            HashEncoding::Hex => self.value().to_ascii_lowercase(),
            HashEncoding::Base64 => self
                .to_bytes()
                .map(|b| encode_hex(&b))
                .unwrap_or_else(|| self.value().to_string()),
        }
    }

    /// Whether `actual` digest bytes equal this digest.
    pub fn matches(&self, actual: &[u8]) -> bool {
        self.to_bytes().is_some_and(|expected| expected == actual)
    }

    /// Whether two digests of the same algorithm describe the same bytes.
    pub fn same_value(&self, other: &HashDigest) -> bool {
        self.algorithm() == other.algorithm()
            && match (self.to_bytes(), other.to_bytes()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
    }

    fn encode(bytes: &[u8], algo: HashAlgorithm, encoding: HashEncoding) -> HashDigest {
        let s = match encoding {
            HashEncoding::Hex => encode_hex(bytes),
            HashEncoding::Base64 => general_purpose::STANDARD.encode(bytes),
        };
        HashDigest::new(algo, s, encoding)
    }

    /// Compute a hash from a reader using the specified algorithm and encoding (sync).
    pub fn from_reader_with_algorithm<R: Read>(
        mut reader: R,
        algo: HashAlgorithm,
        encoding: HashEncoding,
    ) -> io::Result<HashDigest> {
        let mut hasher = Hasher::new(algo);
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::encode(&hasher.finalize(), algo, encoding))
    }

    /// Compute a hash from an async reader using the specified algorithm and encoding (async).
    pub async fn from_async_reader_with_algorithm<R: AsyncRead + Unpin>(
        mut reader: R,
        algo: HashAlgorithm,
        encoding: HashEncoding,
    ) -> async_io::Result<HashDigest> {
        let mut hasher = Hasher::new(algo);
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::encode(&hasher.finalize(), algo, encoding))
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self.value())
    }
}

/// Incremental digest state for one algorithm.
#[derive(Clone)]
pub enum Hasher {
    SHA512(Sha512),
    SHA384(Sha384),
    SHA256(Sha256),
    SHA1(Sha1),
    MD5(Md5),
}

impl Hasher {
    pub fn new(algo: HashAlgorithm) -> Self {
        match algo {
            HashAlgorithm::SHA512 => Hasher::SHA512(Sha512::new()),
            HashAlgorithm::SHA384 => Hasher::SHA384(Sha384::new()),
            HashAlgorithm::SHA256 => Hasher::SHA256(Sha256::new()),
            HashAlgorithm::SHA1 => Hasher::SHA1(Sha1::new()),
            HashAlgorithm::MD5 => Hasher::MD5(Md5::new()),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Hasher::SHA512(_) => HashAlgorithm::SHA512,
            Hasher::SHA384(_) => HashAlgorithm::SHA384,
            Hasher::SHA256(_) => HashAlgorithm::SHA256,
            Hasher::SHA1(_) => HashAlgorithm::SHA1,
            Hasher::MD5(_) => HashAlgorithm::MD5,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::SHA512(h) => h.update(data),
            Hasher::SHA384(h) => h.update(data),
            Hasher::SHA256(h) => h.update(data),
            Hasher::SHA1(h) => h.update(data),
            Hasher::MD5(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::SHA512(h) => h.finalize().to_vec(),
            Hasher::SHA384(h) => h.finalize().to_vec(),
            Hasher::SHA256(h) => h.finalize().to_vec(),
            Hasher::SHA1(h) => h.finalize().to_vec(),
            Hasher::MD5(h) => h.finalize().to_vec(),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hasher").field(&self.algorithm()).finish()
    }
}

/// Supported hash algorithms for file/content checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    // Ordered from strongest to weakest.
    // We only check the strongest one from the ones available.
    SHA512,
    SHA384,
    SHA256,
    SHA1,
    MD5,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 5] = [
        HashAlgorithm::SHA512,
        HashAlgorithm::SHA384,
        HashAlgorithm::SHA256,
        HashAlgorithm::SHA1,
        HashAlgorithm::MD5,
    ];

    /// Accepts the IANA names used by metalink and digest headers, plus the
    /// common dashless spellings.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha-512" | "sha512" => Some(HashAlgorithm::SHA512),
            "sha-384" | "sha384" => Some(HashAlgorithm::SHA384),
            "sha-256" | "sha256" => Some(HashAlgorithm::SHA256),
            "sha-1" | "sha1" | "sha" => Some(HashAlgorithm::SHA1),
            "md5" | "md-5" => Some(HashAlgorithm::MD5),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::SHA512 => "sha-512",
            HashAlgorithm::SHA384 => "sha-384",
            HashAlgorithm::SHA256 => "sha-256",
            HashAlgorithm::SHA1 => "sha-1",
            HashAlgorithm::MD5 => "md5",
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::SHA512 => 64,
            HashAlgorithm::SHA384 => 48,
            HashAlgorithm::SHA256 => 32,
            HashAlgorithm::SHA1 => 20,
            HashAlgorithm::MD5 => 16,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&HashDigest> for HashAlgorithm {
    fn from(hash_type: &HashDigest) -> Self {
        match hash_type {
            HashDigest::MD5(_, _) => HashAlgorithm::MD5,
            HashDigest::SHA1(_, _) => HashAlgorithm::SHA1,
            HashDigest::SHA256(_, _) => HashAlgorithm::SHA256,
            HashDigest::SHA384(_, _) => HashAlgorithm::SHA384,
            HashDigest::SHA512(_, _) => HashAlgorithm::SHA512,
        }
    }
}

impl From<&HashDigest> for HashEncoding {
    fn from(hash_type: &HashDigest) -> Self {
        match hash_type {
            HashDigest::MD5(_, encoding)
            | HashDigest::SHA1(_, encoding)
            | HashDigest::SHA256(_, encoding)
            | HashDigest::SHA384(_, encoding)
            | HashDigest::SHA512(_, encoding) => *encoding,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashEncoding {
    Hex,
    Base64,
}

pub fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

pub fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
