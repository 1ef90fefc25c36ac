// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Content digests, compression, and stream helpers. */

use {
    crate::error::{MirrorError, Result},
    async_compression::futures::bufread::{BzDecoder, GzipDecoder, LzmaDecoder, XzDecoder},
    digest::DynDigest,
    futures::{AsyncBufRead, AsyncRead},
    serde::{Deserialize, Serialize},
    std::{fmt::Formatter, pin::Pin, str::FromStr},
};

/// Checksum flavors found in repository metadata.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChecksumType {
    /// MD5.
    Md5,

    /// SHA-1.
    Sha1,

    /// SHA-256.
    Sha256,
}

impl ChecksumType {
    /// Emit variants strongest first.
    pub fn preferred_order() -> impl Iterator<Item = ChecksumType> {
        [Self::Sha256, Self::Sha1, Self::Md5].into_iter()
    }

    /// Name of the control field in `Release` files holding this variant type.
    ///
    /// This is also the directory name used by `by-hash` paths.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    /// Name of the control field in `Packages` stanzas holding this variant type.
    pub fn packages_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    /// Short lowercase name, used in serialized digests and store paths.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Length of a digest of this type, in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Obtain a new hasher for this checksum flavor.
    pub fn new_hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            Self::Md5 => Box::new(md5::Md5::default()),
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
        }
    }
}

impl FromStr for ChecksumType {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(MirrorError::Parse {
                path: "<digest>".into(),
                message: format!("unknown checksum type: {}", s),
            }),
        }
    }
}

/// Represents a content digest.
///
/// The serialized form is `<type>:<hex>`, e.g. `sha256:e3b0...`.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContentDigest {
    /// An MD5 digest.
    Md5(Vec<u8>),
    /// A SHA-1 digest.
    Sha1(Vec<u8>),
    /// A SHA-256 digest.
    Sha256(Vec<u8>),
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Md5(data) => write!(f, "Md5({})", hex::encode(data)),
            Self::Sha1(data) => write!(f, "Sha1({})", hex::encode(data)),
            Self::Sha256(data) => write!(f, "Sha256({})", hex::encode(data)),
        }
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.checksum_type().name(), self.digest_hex())
    }
}

impl FromStr for ContentDigest {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        let (checksum, digest) = s.split_once(':').ok_or_else(|| MirrorError::Parse {
            path: "<digest>".into(),
            message: format!("digest lacks a type prefix: {}", s),
        })?;

        Self::from_hex_digest(ChecksumType::from_str(checksum)?, digest)
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = MirrorError;

    fn try_from(s: String) -> Result<Self> {
        Self::from_str(&s)
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.to_string()
    }
}

impl ContentDigest {
    /// Create a new SHA-256 instance by parsing a hex digest.
    pub fn sha256_hex(digest: &str) -> Result<Self> {
        Self::from_hex_digest(ChecksumType::Sha256, digest)
    }

    /// Obtain an instance by parsing a hex string as a [ChecksumType].
    ///
    /// The digest length is validated against the checksum type.
    pub fn from_hex_digest(checksum: ChecksumType, digest: &str) -> Result<Self> {
        let bytes = hex::decode(digest).map_err(|e| MirrorError::Parse {
            path: "<digest>".into(),
            message: format!("bad hex digest {}: {}", digest, e),
        })?;

        if bytes.len() != checksum.digest_len() {
            return Err(MirrorError::Parse {
                path: "<digest>".into(),
                message: format!(
                    "{} digest has wrong length: {}",
                    checksum.name(),
                    digest
                ),
            });
        }

        Ok(match checksum {
            ChecksumType::Md5 => Self::Md5(bytes),
            ChecksumType::Sha1 => Self::Sha1(bytes),
            ChecksumType::Sha256 => Self::Sha256(bytes),
        })
    }

    /// Compute the digest of a byte slice.
    pub fn compute(checksum: ChecksumType, data: &[u8]) -> Self {
        let mut hasher = checksum.new_hasher();
        hasher.update(data);

        Self::from_checksum_bytes(checksum, hasher.finalize().to_vec())
    }

    fn from_checksum_bytes(checksum: ChecksumType, bytes: Vec<u8>) -> Self {
        match checksum {
            ChecksumType::Md5 => Self::Md5(bytes),
            ChecksumType::Sha1 => Self::Sha1(bytes),
            ChecksumType::Sha256 => Self::Sha256(bytes),
        }
    }

    /// Obtain the digest bytes for this content digest.
    pub fn digest_bytes(&self) -> &[u8] {
        match self {
            Self::Md5(x) => x,
            Self::Sha1(x) => x,
            Self::Sha256(x) => x,
        }
    }

    /// Obtain the hex encoded content digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest_bytes())
    }

    /// Obtain the [ChecksumType] for this digest.
    pub fn checksum_type(&self) -> ChecksumType {
        match self {
            Self::Md5(_) => ChecksumType::Md5,
            Self::Sha1(_) => ChecksumType::Sha1,
            Self::Sha256(_) => ChecksumType::Sha256,
        }
    }
}

/// Holds multiple flavors of content digests.
#[derive(Clone, Debug)]
pub struct MultiContentDigest {
    pub md5: ContentDigest,
    pub sha1: ContentDigest,
    pub sha256: ContentDigest,
}

impl MultiContentDigest {
    /// Whether this digest matches another one.
    pub fn matches_digest(&self, other: &ContentDigest) -> bool {
        self.digest_from_checksum(other.checksum_type()) == other
    }

    /// Obtain the [ContentDigest] for a given [ChecksumType].
    pub fn digest_from_checksum(&self, checksum: ChecksumType) -> &ContentDigest {
        match checksum {
            ChecksumType::Md5 => &self.md5,
            ChecksumType::Sha1 => &self.sha1,
            ChecksumType::Sha256 => &self.sha256,
        }
    }
}

/// A content digester that simultaneously computes multiple digest types.
pub struct MultiDigester {
    md5: Box<dyn DynDigest + Send>,
    sha1: Box<dyn DynDigest + Send>,
    sha256: Box<dyn DynDigest + Send>,
}

impl Default for MultiDigester {
    fn default() -> Self {
        Self {
            md5: ChecksumType::Md5.new_hasher(),
            sha1: ChecksumType::Sha1.new_hasher(),
            sha256: ChecksumType::Sha256.new_hasher(),
        }
    }
}

impl MultiDigester {
    /// Write content into the digesters.
    pub fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha1.update(data);
        self.sha256.update(data);
    }

    /// Finish digesting content.
    ///
    /// Consumes the instance and returns a [MultiContentDigest] holding all the digests.
    pub fn finish(self) -> MultiContentDigest {
        MultiContentDigest {
            md5: ContentDigest::Md5(self.md5.finalize().to_vec()),
            sha1: ContentDigest::Sha1(self.sha1.finalize().to_vec()),
            sha256: ContentDigest::Sha256(self.sha256.finalize().to_vec()),
        }
    }
}

/// Compression format used by repository index files.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Compression {
    /// No compression (no extension).
    None,

    /// XZ compression (.xz extension).
    Xz,

    /// Gzip compression (.gz extension).
    Gzip,

    /// Bzip2 compression (.bz2 extension).
    Bzip2,

    /// LZMA compression (.lzma extension).
    Lzma,
}

impl Compression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Xz => ".xz",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Lzma => ".lzma",
        }
    }

    /// Split a filename into its stem and compression format.
    ///
    /// Filenames without a known compression extension are [Compression::None].
    pub fn from_filename(filename: &str) -> (&str, Compression) {
        for compression in [Self::Xz, Self::Gzip, Self::Bzip2, Self::Lzma] {
            if let Some(stem) = filename.strip_suffix(compression.extension()) {
                return (stem, compression);
            }
        }

        (filename, Self::None)
    }

    /// The default retrieval preference order.
    pub fn default_preferred_order() -> impl Iterator<Item = Compression> {
        [Self::Xz, Self::Lzma, Self::Gzip, Self::Bzip2, Self::None].into_iter()
    }

    /// Position in [Self::default_preferred_order()]. Lower is preferred.
    pub fn preference_rank(&self) -> usize {
        Self::default_preferred_order()
            .position(|c| c == *self)
            .unwrap_or(usize::MAX)
    }
}

/// Wrap a reader with transparent decompression.
pub fn read_decompressed<'a>(
    stream: impl AsyncBufRead + Send + 'a,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send + 'a>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipDecoder::new(stream)),
        Compression::Xz => Box::pin(XzDecoder::new(stream)),
        Compression::Bzip2 => Box::pin(BzDecoder::new(stream)),
        Compression::Lzma => Box::pin(LzmaDecoder::new(stream)),
    }
}
