// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mirror descriptors and policies.

A [MirrorDescriptor] defines one upstream repository to mirror: where it lives,
which suites, components and architectures to fetch, and the policies governing
its snapshots. [MirrorLayout] resolves where a mirror's state lives on disk.
*/

use {
    crate::error::{MirrorError, Result},
    chrono::{DateTime, Duration, Utc},
    once_cell::sync::Lazy,
    regex::Regex,
    serde::{Deserialize, Serialize},
    std::{
        fmt::Write,
        path::{Path, PathBuf},
    },
};

static DURATION_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)([smhdw])").expect("static regex should compile"));

/// Largest span [Duration] represents in whole seconds.
const MAX_DURATION_SECONDS: i64 = i64::MAX / 1000;

/// Names of the publish pointers. Snapshots cannot use these names.
pub const RESERVED_SNAPSHOT_NAMES: &[&str] = &["staging", "production"];

/// Validate a mirror ID.
///
/// IDs are non-empty and consist of lowercase ASCII letters, digits, and hyphens.
pub fn validate_mirror_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.starts_with('-')
        || !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        Err(MirrorError::InvalidMirrorId(id.to_string()))
    } else {
        Ok(())
    }
}

/// Validate a snapshot name.
///
/// Names become directory names, so path separators and leading dots are
/// rejected, as are the names of the publish pointers.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !RESERVED_SNAPSHOT_NAMES.contains(&name)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '+'));

    if valid {
        Ok(())
    } else {
        Err(MirrorError::InvalidSnapshotName(name.to_string()))
    }
}

/// A span of time written like `30d`, `12h`, `1w2d` or `90s`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct HumanDuration(Duration);

impl HumanDuration {
    /// Construct from a [Duration].
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// The [chrono::Duration] value.
    pub fn duration(&self) -> Duration {
        self.0
    }

    /// The value as a [std::time::Duration]. Negative spans clamp to zero.
    pub fn to_std(&self) -> std::time::Duration {
        self.0.to_std().unwrap_or_default()
    }
}

impl std::str::FromStr for HumanDuration {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || MirrorError::InvalidDuration(s.to_string());

        let mut total: i64 = 0;
        let mut consumed = 0;

        for caps in DURATION_PART.captures_iter(s) {
            let whole = caps.get(0).ok_or_else(invalid)?;
            if whole.start() != consumed {
                return Err(invalid());
            }
            consumed = whole.end();

            let count = caps[1].parse::<i64>().map_err(|_| invalid())?;
            let unit = match &caps[2] {
                "s" => 1,
                "m" => 60,
                "h" => 3600,
                "d" => 86400,
                _ => 7 * 86400,
            };

            total = count
                .checked_mul(unit)
                .and_then(|seconds| total.checked_add(seconds))
                .filter(|total| *total <= MAX_DURATION_SECONDS)
                .ok_or_else(invalid)?;
        }

        if consumed == 0 || consumed != s.len() {
            return Err(invalid());
        }

        Ok(Self(Duration::seconds(total)))
    }
}

impl TryFrom<String> for HumanDuration {
    type Error = MirrorError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<HumanDuration> for String {
    fn from(d: HumanDuration) -> Self {
        d.to_string()
    }
}

impl std::fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0.num_seconds();

        if secs % 86400 == 0 {
            write!(f, "{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

/// How to name snapshots created without an explicit name.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotNaming {
    /// UTC timestamp like `20240425T083000Z`.
    Timestamp,
    /// UTC date like `2024-04-25`.
    Date,
    /// A custom `strftime` format evaluated in UTC.
    Format(String),
}

impl Default for SnapshotNaming {
    fn default() -> Self {
        Self::Timestamp
    }
}

impl SnapshotNaming {
    /// Generate a snapshot name for the given time.
    pub fn generate(&self, now: DateTime<Utc>) -> Result<String> {
        let format = match self {
            Self::Timestamp => "%Y%m%dT%H%M%SZ",
            Self::Date => "%Y-%m-%d",
            Self::Format(format) => format.as_str(),
        };

        // Bad user supplied formats surface as fmt errors rather than panics.
        let mut name = String::new();
        write!(name, "{}", now.format(format))
            .map_err(|_| MirrorError::InvalidSnapshotName(format!("<format {}>", format)))?;

        validate_snapshot_name(&name)?;

        Ok(name)
    }
}

/// Which snapshots survive a prune.
///
/// A snapshot is retained if it satisfies either clause. An absent clause is never
/// satisfied, so an empty policy retains nothing but pinned snapshots.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    /// Retain the N newest snapshots.
    #[serde(default)]
    pub keep_last: Option<usize>,

    /// Retain snapshots younger than this.
    #[serde(default)]
    pub keep_within: Option<HumanDuration>,
}

impl RetentionPolicy {
    /// Whether neither clause is set.
    pub fn is_empty(&self) -> bool {
        self.keep_last.is_none() && self.keep_within.is_none()
    }

    /// Pick the effective policy: an invocation policy wins over a mirror's, which
    /// wins over the global default.
    pub fn resolve(
        invocation: Option<&RetentionPolicy>,
        mirror: Option<&RetentionPolicy>,
        global: Option<&RetentionPolicy>,
    ) -> Option<RetentionPolicy> {
        invocation
            .filter(|p| !p.is_empty())
            .or_else(|| mirror.filter(|p| !p.is_empty()))
            .or_else(|| global.filter(|p| !p.is_empty()))
            .cloned()
    }

    /// Whether a snapshot is retained.
    ///
    /// `rank` is the 0-based position of the snapshot among unpinned snapshots
    /// ordered newest first.
    pub fn retains(&self, rank: usize, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let by_count = self.keep_last.map_or(false, |n| rank < n);
        let by_age = self
            .keep_within
            .map_or(false, |within| now - created_at <= within.duration());

        by_count || by_age
    }
}

/// Identity and policy for one upstream repository.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorDescriptor {
    /// Unique ID. Lowercase alphanumerics and hyphens.
    pub id: String,

    /// Base URL of the repository. The directory holding `dists/`.
    pub url: String,

    /// Suites (distributions) to mirror, e.g. `noble`.
    pub suites: Vec<String>,

    /// Components to mirror, e.g. `main`.
    #[serde(alias = "sections")]
    pub components: Vec<String>,

    /// Binary architectures to mirror, e.g. `amd64`.
    pub architectures: Vec<String>,

    /// Whether to mirror source packages.
    #[serde(default)]
    pub sources: bool,

    /// Naming policy for unnamed snapshots.
    #[serde(default)]
    pub snapshot_naming: SnapshotNaming,

    /// Retention policy overriding the global one.
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,

    /// Keyring overriding the global trusted keyring.
    #[serde(default)]
    pub keyring: Option<PathBuf>,

    /// Connection cap for this mirror's host, overriding the global one.
    #[serde(default)]
    pub max_connections_per_host: Option<usize>,
}

impl MirrorDescriptor {
    /// Validate field values.
    pub fn validate(&self) -> Result<()> {
        validate_mirror_id(&self.id)?;

        let invalid = |message: &str| MirrorError::InvalidMirror {
            mirror: self.id.clone(),
            message: message.to_string(),
        };

        if self.url.trim().is_empty() {
            return Err(invalid("url is empty"));
        }
        if self.suites.is_empty() {
            return Err(invalid("no suites defined"));
        }
        if self.components.is_empty() {
            return Err(invalid("no components defined"));
        }
        if self.architectures.is_empty() && !self.sources {
            return Err(invalid("no architectures defined and sources disabled"));
        }
        if self
            .suites
            .iter()
            .chain(self.components.iter())
            .chain(self.architectures.iter())
            .any(|v| v.is_empty() || v.contains(char::is_whitespace) || v.contains(".."))
        {
            return Err(invalid("suite, component and architecture names must be plain words"));
        }
        if self.max_connections_per_host == Some(0) {
            return Err(invalid("max_connections_per_host must be positive"));
        }

        Ok(())
    }
}

/// Resolves the on-disk locations of one mirror's state.
///
/// ```text
/// <root>/<mirror>/store/          content store
/// <root>/<mirror>/state/          last sync results
/// <root>/<mirror>/snapshots/      snapshot trees and publish pointers
/// ```
#[derive(Clone, Debug)]
pub struct MirrorLayout {
    mirror: String,
    dir: PathBuf,
}

impl MirrorLayout {
    /// Construct an instance for a mirror under a root directory.
    pub fn new(root: impl AsRef<Path>, mirror: &str) -> Result<Self> {
        validate_mirror_id(mirror)?;

        Ok(Self {
            mirror: mirror.to_string(),
            dir: root.as_ref().join(mirror),
        })
    }

    /// The mirror ID.
    pub fn mirror(&self) -> &str {
        &self.mirror
    }

    /// The mirror's top-level directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store_dir(&self) -> PathBuf {
        self.dir.join("store")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.join("state")
    }

    /// File recording the resolved file set of the last completed sync.
    pub fn file_set_path(&self) -> PathBuf {
        self.state_dir().join("files.json")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir.join("snapshots")
    }

    pub fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.snapshots_dir().join(name)
    }
}
