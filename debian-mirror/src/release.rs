// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Release` file primitives.

`Release` files (or `InRelease` if it contains a PGP cleartext signature) are
the main definition of a Debian repository suite. They list the index files
(`Packages`, `Sources`, `Contents`, ...) published for the suite along with
their sizes and checksums.

See <https://wiki.debian.org/DebianRepository/Format#A.22Release.22_files>.
*/

use {
    crate::{
        control::{ControlParagraph, ControlParagraphReader},
        error::{MirrorError, Result},
        io::{ChecksumType, Compression, ContentDigest},
        mirror::MirrorDescriptor,
        packages::{FileDescriptor, FileKind},
    },
    chrono::{DateTime, TimeZone, Utc},
    std::collections::BTreeMap,
};

/// An index file listed by a `Release` file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseFileEntry {
    /// Path relative to the `Release` file's directory.
    pub path: String,

    /// Size in bytes.
    pub size: u64,

    /// Strongest listed digest.
    pub digest: ContentDigest,

    /// MD5 digest, when listed and weaker than [Self::digest].
    pub legacy_digest: Option<ContentDigest>,
}

impl ReleaseFileEntry {
    /// Obtain the `by-hash` path variant for this entry.
    pub fn by_hash_path(&self) -> String {
        let leaf = format!(
            "by-hash/{}/{}",
            self.digest.checksum_type().field_name(),
            self.digest.digest_hex()
        );

        if let Some((prefix, _)) = self.path.rsplit_once('/') {
            format!("{}/{}", prefix, leaf)
        } else {
            leaf
        }
    }
}

/// The role of an index file, derived from its path.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum IndexKind {
    /// `<component>/binary-<arch>/Packages*`.
    Packages {
        component: String,
        architecture: String,
    },

    /// `<component>/source/Sources*`.
    Sources { component: String },

    /// `<component>/i18n/Translation-*`.
    Translation { component: String },

    /// `[<component>/]Contents-<arch>*`.
    Contents {
        component: Option<String>,
        architecture: String,
    },

    /// `<component>/<binary-<arch>|source>/Release`.
    NestedRelease { component: String, directory: String },

    /// Anything else.
    Other,
}

impl IndexKind {
    /// Classify a path relative to the suite directory.
    pub fn classify(path: &str) -> Self {
        let (dir, filename) = match path.rsplit_once('/') {
            Some((dir, filename)) => (Some(dir), filename),
            None => (None, path),
        };
        let (stem, _) = Compression::from_filename(filename);

        if let Some(architecture) = stem.strip_prefix("Contents-") {
            // udeb contents are not mirrored.
            if architecture.starts_with("udeb-") {
                return Self::Other;
            }

            return Self::Contents {
                component: dir.map(|d| d.to_string()),
                architecture: architecture.to_string(),
            };
        }

        let dir = match dir {
            Some(dir) => dir,
            None => return Self::Other,
        };
        let (component, leaf_dir) = match dir.rsplit_once('/') {
            Some(v) => v,
            None => return Self::Other,
        };

        // Installer images and udebs live under `<component>/debian-installer/`.
        if component.ends_with("/debian-installer") {
            return Self::Other;
        }

        match (leaf_dir, stem) {
            (_, "Release") if filename == "Release" => {
                if leaf_dir == "source" || leaf_dir.starts_with("binary-") {
                    Self::NestedRelease {
                        component: component.to_string(),
                        directory: leaf_dir.to_string(),
                    }
                } else {
                    Self::Other
                }
            }
            ("source", "Sources") => Self::Sources {
                component: component.to_string(),
            },
            ("i18n", _) if stem.starts_with("Translation-") => Self::Translation {
                component: component.to_string(),
            },
            (leaf, "Packages") => match leaf.strip_prefix("binary-") {
                Some(architecture) => Self::Packages {
                    component: component.to_string(),
                    architecture: architecture.to_string(),
                },
                None => Self::Other,
            },
            _ => Self::Other,
        }
    }

    /// Whether this index lists files that must be mirrored.
    pub fn is_file_list(&self) -> bool {
        matches!(self, Self::Packages { .. } | Self::Sources { .. })
    }
}

/// An index file selected for mirroring.
#[derive(Clone, Debug)]
pub struct IndexSelection {
    /// The manifest entry.
    pub entry: ReleaseFileEntry,

    /// Classification of the entry.
    pub kind: IndexKind,

    /// Compression of the file.
    pub compression: Compression,
}

/// A parsed `Release` file for one suite.
#[derive(Clone, Debug)]
pub struct ReleaseManifest {
    suite: String,
    paragraph: ControlParagraph,
    entries: Vec<ReleaseFileEntry>,
}

impl ReleaseManifest {
    /// Parse the text of a `Release` file (signature framing already removed).
    pub fn parse(suite: &str, text: &str) -> Result<Self> {
        let path = format!("dists/{}/Release", suite);
        let mut paragraphs = ControlParagraphReader::new(std::io::Cursor::new(text), &path);

        let paragraph = paragraphs.next().ok_or_else(|| MirrorError::Parse {
            path: path.clone(),
            message: "no control paragraph".into(),
        })??;

        if paragraphs.next().is_some() {
            return Err(MirrorError::Parse {
                path,
                message: "more than one control paragraph".into(),
            });
        }

        // Merge the per-checksum listings into one entry per path.
        let mut by_path: BTreeMap<String, (u64, Vec<ContentDigest>)> = BTreeMap::new();

        for checksum in ChecksumType::preferred_order() {
            let lines = match paragraph.iter_field_lines(checksum.field_name()) {
                Some(lines) => lines,
                None => continue,
            };

            for line in lines {
                let parse_error = |message: &str| MirrorError::Parse {
                    path: path.clone(),
                    message: format!("{} in {} entry: {}", message, checksum.field_name(), line),
                };

                let mut parts = line.split_ascii_whitespace();
                let digest = parts.next().ok_or_else(|| parse_error("missing digest"))?;
                let size = parts.next().ok_or_else(|| parse_error("missing size"))?;
                let file = parts.next().ok_or_else(|| parse_error("missing path"))?;
                if parts.next().is_some() {
                    return Err(parse_error("unexpected extra value"));
                }

                let size = size
                    .parse::<u64>()
                    .map_err(|_| parse_error("invalid size"))?;
                let digest = ContentDigest::from_hex_digest(checksum, digest)
                    .map_err(|_| parse_error("invalid digest"))?;

                let (existing_size, digests) = by_path
                    .entry(file.to_string())
                    .or_insert_with(|| (size, vec![]));
                if *existing_size != size {
                    return Err(parse_error("size disagrees with another checksum listing"));
                }
                digests.push(digest);
            }
        }

        let entries = by_path
            .into_iter()
            .filter_map(|(path, (size, digests))| {
                // Digests were collected strongest first.
                let mut digests = digests.into_iter();
                let digest = digests.next()?;
                let legacy_digest = digests.find(|d| d.checksum_type() == ChecksumType::Md5);

                Some(ReleaseFileEntry {
                    path,
                    size,
                    digest,
                    legacy_digest,
                })
            })
            .collect::<Vec<_>>();

        Ok(Self {
            suite: suite.to_string(),
            paragraph,
            entries,
        })
    }

    /// The suite this manifest was fetched for.
    pub fn suite(&self) -> &str {
        &self.suite
    }

    /// The control paragraph holding all fields.
    pub fn paragraph(&self) -> &ControlParagraph {
        &self.paragraph
    }

    /// Listed index files, sorted by path.
    pub fn entries(&self) -> &[ReleaseFileEntry] {
        &self.entries
    }

    /// Value of the `Suite` field.
    pub fn suite_field(&self) -> Option<&str> {
        self.paragraph.field_str("Suite")
    }

    /// Value of the `Codename` field.
    pub fn codename(&self) -> Option<&str> {
        self.paragraph.field_str("Codename")
    }

    /// Words of the `Components` field.
    pub fn components(&self) -> Option<impl Iterator<Item = &str>> {
        self.paragraph.iter_field_words("Components")
    }

    /// Words of the `Architectures` field.
    pub fn architectures(&self) -> Option<impl Iterator<Item = &str>> {
        self.paragraph.iter_field_words("Architectures")
    }

    /// Whether clients should fetch indices via `by-hash` paths.
    pub fn acquire_by_hash(&self) -> bool {
        self.paragraph.field_bool("Acquire-By-Hash").unwrap_or(false)
    }

    /// Time the release file was created.
    pub fn date(&self) -> Option<Result<DateTime<Utc>>> {
        self.field_datetime("Date")
    }

    /// Time after which clients consider the release file stale.
    pub fn valid_until(&self) -> Option<Result<DateTime<Utc>>> {
        self.field_datetime("Valid-Until")
    }

    fn field_datetime(&self, name: &str) -> Option<Result<DateTime<Utc>>> {
        self.paragraph.field_str(name).map(|v| {
            let parse_error = || MirrorError::Parse {
                path: self.path(),
                message: format!("invalid {} value: {}", name, v),
            };

            let seconds = mailparse::dateparse(v).map_err(|_| parse_error())?;
            Utc.timestamp_opt(seconds, 0).single().ok_or_else(parse_error)
        })
    }

    /// Reject a manifest past its `Valid-Until` time.
    pub fn check_valid_until(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(valid_until) = self.valid_until() {
            let valid_until = valid_until?;

            if valid_until < now {
                return Err(MirrorError::Authentication {
                    path: self.path(),
                    message: format!("manifest expired at {}", valid_until.to_rfc2822()),
                });
            }
        }

        Ok(())
    }

    /// The repository relative path of a file in this suite.
    pub fn dist_path(&self, path: &str) -> String {
        format!("dists/{}/{}", self.suite, path)
    }

    fn path(&self) -> String {
        self.dist_path("Release")
    }

    /// Select the index files to mirror for a mirror's components and architectures.
    pub fn select_indices(&self, mirror: &MirrorDescriptor) -> Vec<IndexSelection> {
        let wants_component = |c: &str| mirror.components.iter().any(|x| x == c);
        let wants_arch = |a: &str| mirror.architectures.iter().any(|x| x == a);
        let wants_contents_arch = |a: &str| wants_arch(a) || (a == "source" && mirror.sources);

        self.entries
            .iter()
            .filter_map(|entry| {
                let kind = IndexKind::classify(&entry.path);

                let wanted = match &kind {
                    IndexKind::Packages {
                        component,
                        architecture,
                    } => wants_component(component) && wants_arch(architecture),
                    IndexKind::Sources { component } => mirror.sources && wants_component(component),
                    IndexKind::Translation { component } => wants_component(component),
                    IndexKind::Contents {
                        component,
                        architecture,
                    } => {
                        component.as_deref().map_or(true, wants_component)
                            && wants_contents_arch(architecture)
                    }
                    IndexKind::NestedRelease {
                        component,
                        directory,
                    } => {
                        wants_component(component)
                            && match directory.strip_prefix("binary-") {
                                Some(arch) => wants_arch(arch),
                                None => mirror.sources,
                            }
                    }
                    IndexKind::Other => false,
                };

                if wanted {
                    let (_, compression) = Compression::from_filename(&entry.path);

                    Some(IndexSelection {
                        entry: entry.clone(),
                        kind,
                        compression,
                    })
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
    }

    /// Convert an index selection into the descriptor of the file to mirror.
    pub fn index_descriptor(&self, selection: &IndexSelection) -> FileDescriptor {
        FileDescriptor {
            path: self.dist_path(&selection.entry.path),
            size: selection.entry.size,
            digest: selection.entry.digest.clone(),
            legacy_digest: selection.entry.legacy_digest.clone(),
            by_hash_path: if self.acquire_by_hash() {
                Some(self.dist_path(&selection.entry.by_hash_path()))
            } else {
                None
            },
            kind: FileKind::Index,
        }
    }
}
