// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package index parsing and file descriptors.

`Packages` indices hold one paragraph per binary package, each naming a pool file
via `Filename`. `Sources` indices hold one paragraph per source package whose
files live under `Directory`. Both are reduced to [FileDescriptor]s.
*/

use {
    crate::{
        control::{ControlParagraph, ControlParagraphAsyncReader},
        error::{MirrorError, Result},
        io::{ChecksumType, ContentDigest},
    },
    futures::AsyncBufRead,
    log::warn,
    serde::{Deserialize, Serialize},
    std::{collections::BTreeMap, io::Write, path::Path},
};

/// The role a file plays in a repository.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// `InRelease`, `Release` and `Release.gpg`.
    Manifest,
    /// Index files referenced by a manifest.
    Index,
    /// Binary package files.
    Package,
    /// Source package files.
    Source,
}

impl FileKind {
    /// Whether this is package content rather than repository skeleton.
    pub fn is_package_content(&self) -> bool {
        matches!(self, Self::Package | Self::Source)
    }
}

/// One file to materialize in a mirror.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct FileDescriptor {
    /// Repository relative path.
    pub path: String,

    /// Size in bytes.
    pub size: u64,

    /// Strongest known digest. Keys the content store.
    pub digest: ContentDigest,

    /// Additional MD5 digest verified on download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_digest: Option<ContentDigest>,

    /// Alternate `by-hash` path to fetch from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_hash_path: Option<String>,

    pub kind: FileKind,
}

/// The flavor of a package index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexFormat {
    Packages,
    Sources,
}

fn parse_error(index_path: &str, package: Option<&str>, message: impl std::fmt::Display) -> MirrorError {
    MirrorError::Parse {
        path: index_path.to_string(),
        message: match package {
            Some(package) => format!("package {}: {}", package, message),
            None => message.to_string(),
        },
    }
}

fn strongest_digest(
    paragraph: &ControlParagraph,
    index_path: &str,
    package: &str,
) -> Result<Option<ContentDigest>> {
    for checksum in ChecksumType::preferred_order() {
        if let Some(hex) = paragraph.field_str(checksum.packages_field_name()) {
            return ContentDigest::from_hex_digest(checksum, hex.trim())
                .map(Some)
                .map_err(|_| parse_error(index_path, Some(package), format!("bad {} value", checksum.packages_field_name())));
        }
    }

    Ok(None)
}

/// Obtain the descriptor of the file a `Packages` paragraph refers to.
pub fn descriptor_from_packages_paragraph(
    paragraph: &ControlParagraph,
    index_path: &str,
) -> Result<FileDescriptor> {
    let package = paragraph.field_str("Package").unwrap_or("<unknown>");

    let path = paragraph
        .field_str("Filename")
        .ok_or_else(|| parse_error(index_path, Some(package), "missing Filename"))?;
    let size = paragraph
        .field_u64("Size")
        .ok_or_else(|| parse_error(index_path, Some(package), "missing Size"))?
        .map_err(|e| parse_error(index_path, Some(package), format!("bad Size: {}", e)))?;

    let digest = strongest_digest(paragraph, index_path, package)?
        .ok_or_else(|| parse_error(index_path, Some(package), "no checksum fields"))?;

    let legacy_digest = match paragraph.field_str(ChecksumType::Md5.packages_field_name()) {
        Some(hex) if digest.checksum_type() != ChecksumType::Md5 => Some(
            ContentDigest::from_hex_digest(ChecksumType::Md5, hex.trim())
                .map_err(|_| parse_error(index_path, Some(package), "bad MD5sum value"))?,
        ),
        _ => None,
    };

    Ok(FileDescriptor {
        path: normalize_pool_path(path, index_path, package)?,
        size,
        digest,
        legacy_digest,
        by_hash_path: None,
        kind: FileKind::Package,
    })
}

struct SourceFileEntry<'a> {
    filename: &'a str,
    size: u64,
    digest: ContentDigest,
}

fn source_file_entries<'a>(
    paragraph: &'a ControlParagraph,
    field: &str,
    checksum: ChecksumType,
    index_path: &str,
    package: &str,
) -> Option<Result<Vec<SourceFileEntry<'a>>>> {
    paragraph.iter_field_lines(field).map(|lines| {
        lines
            .map(|line| {
                // Values are of form: <digest> <size> <filename>
                let bad = || parse_error(index_path, Some(package), format!("bad {} entry: {}", field, line));

                let mut parts = line.split_ascii_whitespace();
                let digest = parts.next().ok_or_else(bad)?;
                let size = parts.next().ok_or_else(bad)?;
                let filename = parts.next().ok_or_else(bad)?;
                if parts.next().is_some() {
                    return Err(bad());
                }

                Ok(SourceFileEntry {
                    filename,
                    size: size.parse::<u64>().map_err(|_| bad())?,
                    digest: ContentDigest::from_hex_digest(checksum, digest).map_err(|_| bad())?,
                })
            })
            .collect::<Result<Vec<_>>>()
    })
}

/// Obtain descriptors for the files a `Sources` paragraph refers to.
pub fn descriptors_from_sources_paragraph(
    paragraph: &ControlParagraph,
    index_path: &str,
) -> Result<Vec<FileDescriptor>> {
    let package = paragraph.field_str("Package").unwrap_or("<unknown>");

    let directory = paragraph
        .field_str("Directory")
        .ok_or_else(|| parse_error(index_path, Some(package), "missing Directory"))?
        .trim_end_matches('/');

    let md5_files = source_file_entries(paragraph, "Files", ChecksumType::Md5, index_path, package)
        .transpose()?;

    let entries = match source_file_entries(
        paragraph,
        "Checksums-Sha256",
        ChecksumType::Sha256,
        index_path,
        package,
    ) {
        Some(entries) => entries?,
        None => match source_file_entries(
            paragraph,
            "Checksums-Sha1",
            ChecksumType::Sha1,
            index_path,
            package,
        ) {
            Some(entries) => entries?,
            None => md5_files
                .as_ref()
                .ok_or_else(|| parse_error(index_path, Some(package), "missing file list"))?
                .iter()
                .map(|e| SourceFileEntry {
                    filename: e.filename,
                    size: e.size,
                    digest: e.digest.clone(),
                })
                .collect(),
        },
    };

    if entries.is_empty() {
        return Err(parse_error(index_path, Some(package), "empty file list"));
    }

    entries
        .into_iter()
        .map(|entry| {
            let legacy_digest = if entry.digest.checksum_type() == ChecksumType::Md5 {
                None
            } else {
                md5_files.as_ref().and_then(|files| {
                    files
                        .iter()
                        .find(|f| f.filename == entry.filename)
                        .map(|f| f.digest.clone())
                })
            };

            Ok(FileDescriptor {
                path: normalize_pool_path(
                    &format!("{}/{}", directory, entry.filename),
                    index_path,
                    package,
                )?,
                size: entry.size,
                digest: entry.digest,
                legacy_digest,
                by_hash_path: None,
                kind: FileKind::Source,
            })
        })
        .collect()
}

/// Reject paths that would escape the repository root.
fn normalize_pool_path(path: &str, index_path: &str, package: &str) -> Result<String> {
    let path = path.trim().trim_start_matches("./");

    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|part| part == ".." || part.is_empty())
    {
        return Err(parse_error(
            index_path,
            Some(package),
            format!("unsafe file path: {}", path),
        ));
    }

    Ok(path.to_string())
}

/// Read all file descriptors from a decompressed index stream.
pub async fn read_index_descriptors<R>(
    reader: R,
    format: IndexFormat,
    index_path: &str,
) -> Result<Vec<FileDescriptor>>
where
    R: AsyncBufRead + Unpin,
{
    let mut reader = ControlParagraphAsyncReader::new(reader, index_path);
    let mut descriptors = vec![];

    while let Some(paragraph) = reader.read_paragraph().await? {
        match format {
            IndexFormat::Packages => {
                descriptors.push(descriptor_from_packages_paragraph(&paragraph, index_path)?);
            }
            IndexFormat::Sources => {
                descriptors.extend(descriptors_from_sources_paragraph(&paragraph, index_path)?);
            }
        }
    }

    Ok(descriptors)
}

/// A set of file descriptors unique by path.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct FileSet {
    files: BTreeMap<String, FileDescriptor>,
}

impl FileSet {
    /// Add a descriptor.
    ///
    /// Returns whether it was added. A path already present keeps its first
    /// descriptor; conflicting content for the same path is logged.
    pub fn insert(&mut self, descriptor: FileDescriptor) -> bool {
        if let Some(existing) = self.files.get(&descriptor.path) {
            if existing.digest != descriptor.digest {
                warn!(
                    "conflicting digests for {}: {} vs {}; keeping the former",
                    descriptor.path, existing.digest, descriptor.digest
                );
            }

            false
        } else {
            self.files.insert(descriptor.path.clone(), descriptor);
            true
        }
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether there are no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterate descriptors in path order.
    pub fn iter(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.files.values()
    }

    /// Sum of file sizes.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|d| d.size).sum()
    }

    /// Load a file set written by [Self::write_atomic()].
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| MirrorError::io_path(path, e))?;

        Ok(serde_json::from_slice(&data)?)
    }

    /// Write the set as JSON, replacing any existing file atomically.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let dir = path.parent().ok_or_else(|| {
            MirrorError::io_path(path, std::io::Error::from(std::io::ErrorKind::InvalidInput))
        })?;
        std::fs::create_dir_all(dir).map_err(|e| MirrorError::io_path(dir, e))?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| MirrorError::io_path(dir, e))?;
        serde_json::to_writer_pretty(&mut temp, self)?;
        temp.flush().map_err(|e| MirrorError::io_path(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| MirrorError::io_path(temp.path(), e))?;
        temp.persist(path)
            .map_err(|e| MirrorError::io_path(path, e.error))?;

        Ok(())
    }
}

impl Extend<FileDescriptor> for FileSet {
    fn extend<T: IntoIterator<Item = FileDescriptor>>(&mut self, iter: T) {
        for descriptor in iter {
            self.insert(descriptor);
        }
    }
}
