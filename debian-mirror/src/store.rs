// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Checksum addressed blob storage.

Blobs live at `<dir>/<algorithm>/<xx>/<rest of hex digest>`. A blob is written
to a temporary file under `<dir>/.tmp/` and is linked into place only after its
size and digests are verified. Stored blobs are never modified.
*/

use {
    crate::{
        error::{MirrorError, Result},
        io::{ChecksumType, ContentDigest, MultiContentDigest, MultiDigester},
    },
    log::debug,
    std::{
        io::Write,
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
};

/// Check computed digests against the expected primary and legacy digests.
pub fn verify_digests(
    path: &str,
    digests: &MultiContentDigest,
    expected: &ContentDigest,
    legacy: Option<&ContentDigest>,
) -> Result<()> {
    for expected in std::iter::once(expected).chain(legacy) {
        if !digests.matches_digest(expected) {
            return Err(MirrorError::Integrity {
                path: path.to_string(),
                message: format!(
                    "digest mismatch: expected {}, got {}",
                    expected,
                    digests.digest_from_checksum(expected.checksum_type())
                ),
            });
        }
    }

    Ok(())
}

/// Outcome of committing a blob.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitOutcome {
    /// The blob was written by this commit.
    Stored,
    /// Another writer stored the same blob first.
    AlreadyPresent,
}

/// A content addressed store of blobs.
#[derive(Clone, Debug)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    /// Construct an instance rooted at a directory, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let tmp = dir.join(".tmp");
        std::fs::create_dir_all(&tmp).map_err(|e| MirrorError::io_path(&tmp, e))?;

        Ok(Self { dir })
    }

    /// The store's root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.digest_hex();

        self.dir
            .join(digest.checksum_type().name())
            .join(&hex[0..2])
            .join(&hex[2..])
    }

    /// Whether a blob is present.
    pub fn has(&self, digest: &ContentDigest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Resolve the location of a present blob.
    pub fn path_of(&self, digest: &ContentDigest) -> Result<PathBuf> {
        let path = self.blob_path(digest);

        if path.is_file() {
            Ok(path)
        } else {
            Err(MirrorError::NotFound {
                what: "blob",
                name: digest.to_string(),
            })
        }
    }

    /// Begin writing a blob expected to have the given digest and size.
    ///
    /// The returned writer deletes its temporary file when dropped uncommitted.
    pub fn open_for_write(
        &self,
        path: &str,
        digest: &ContentDigest,
        size: u64,
        legacy_digest: Option<&ContentDigest>,
    ) -> Result<BlobWriter> {
        let tmp = self.dir.join(".tmp");
        let file = NamedTempFile::new_in(&tmp).map_err(|e| MirrorError::io_path(&tmp, e))?;

        Ok(BlobWriter {
            destination: self.blob_path(digest),
            path: path.to_string(),
            expected_digest: digest.clone(),
            expected_size: size,
            legacy_digest: legacy_digest.cloned(),
            file,
            digester: MultiDigester::default(),
            written: 0,
        })
    }

    /// Make a blob appear at `destination`.
    ///
    /// A hard link is attempted first. Copying is the fallback for filesystems
    /// or devices where linking fails.
    pub fn alias(&self, digest: &ContentDigest, destination: &Path) -> Result<()> {
        let source = self.path_of(digest)?;

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MirrorError::io_path(parent, e))?;
        }

        if let Err(e) = std::fs::hard_link(&source, destination) {
            debug!(
                "hard link {} -> {} failed ({}); copying",
                source.display(),
                destination.display(),
                e
            );
            std::fs::copy(&source, destination).map_err(|e| MirrorError::io_path(destination, e))?;
        }

        Ok(())
    }

    /// Store in-memory data, returning its SHA-256 digest.
    pub fn insert_bytes(&self, path: &str, data: &[u8]) -> Result<ContentDigest> {
        let digest = ContentDigest::compute(ChecksumType::Sha256, data);

        if !self.has(&digest) {
            let mut writer = self.open_for_write(path, &digest, data.len() as u64, None)?;
            writer.write_chunk(data)?;
            writer.commit()?;
        }

        Ok(digest)
    }
}

/// A pending blob write.
pub struct BlobWriter {
    destination: PathBuf,
    path: String,
    expected_digest: ContentDigest,
    expected_size: u64,
    legacy_digest: Option<ContentDigest>,
    file: NamedTempFile,
    digester: MultiDigester,
    written: u64,
}

impl BlobWriter {
    fn integrity_error(&self, message: String) -> MirrorError {
        MirrorError::Integrity {
            path: self.path.clone(),
            message,
        }
    }

    /// Append data.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.written += data.len() as u64;
        if self.written > self.expected_size {
            return Err(self.integrity_error(format!(
                "received more than the expected {} bytes",
                self.expected_size
            )));
        }

        self.digester.update(data);
        self.file
            .write_all(data)
            .map_err(|e| MirrorError::io_path(self.file.path(), e))
    }

    /// Number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Verify and link the blob into place.
    ///
    /// On verification failure the temporary file is removed and nothing is stored.
    pub fn commit(mut self) -> Result<CommitOutcome> {
        if self.written != self.expected_size {
            return Err(self.integrity_error(format!(
                "size mismatch: expected {}, got {}",
                self.expected_size, self.written
            )));
        }

        let digests = std::mem::take(&mut self.digester).finish();
        verify_digests(
            &self.path,
            &digests,
            &self.expected_digest,
            self.legacy_digest.as_ref(),
        )?;

        self.file
            .flush()
            .map_err(|e| MirrorError::io_path(self.file.path(), e))?;
        self.file
            .as_file()
            .sync_all()
            .map_err(|e| MirrorError::io_path(self.file.path(), e))?;

        if let Some(parent) = self.destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MirrorError::io_path(parent, e))?;
        }

        match self.file.persist_noclobber(&self.destination) {
            Ok(_) => Ok(CommitOutcome::Stored),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok(CommitOutcome::AlreadyPresent)
            }
            Err(e) => Err(MirrorError::io_path(&self.destination, e.error)),
        }
    }
}
