// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Snapshot lifecycle.

A snapshot is a directory `<snapshots>/<name>/` laid out like the upstream
repository (`dists/`, `pool/`), where every file is a hard link to a content
store blob. Snapshot metadata lives in `.snapshot.json` at the tree root.

Snapshots are built in a hidden temporary directory and renamed into place,
so a snapshot directory holding metadata is always complete.
*/

use {
    crate::{
        error::{MirrorError, Result},
        mirror::{validate_snapshot_name, MirrorDescriptor, MirrorLayout, RetentionPolicy},
        packages::{FileKind, FileSet},
        publish::{clear_slot, read_slot, PublishState, Slot},
        store::ContentStore,
    },
    chrono::{DateTime, Utc},
    log::{info, warn},
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
    },
};

/// Name of the metadata file at the root of each snapshot tree.
pub const SNAPSHOT_METADATA_FILENAME: &str = ".snapshot.json";

/// Publish status of a snapshot. Derived from the slots when read.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Unreferenced,
    Staged,
    Published,
}

impl Default for SnapshotStatus {
    fn default() -> Self {
        Self::Unreferenced
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unreferenced => "unreferenced",
            Self::Staged => "staged",
            Self::Published => "published",
        })
    }
}

/// A named capture of a mirror.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Snapshot {
    pub mirror: String,
    pub name: String,
    pub created_at: DateTime<Utc>,

    /// Bytes across all files.
    pub total_size: u64,

    /// Number of package files.
    pub file_count: usize,

    /// Number of manifest and index files.
    pub index_count: usize,

    pub suites: Vec<String>,

    #[serde(skip)]
    pub status: SnapshotStatus,
}

impl Snapshot {
    fn with_status(mut self, state: &PublishState) -> Self {
        self.status = match state.slot_of(&self.name) {
            Some(Slot::Production) => SnapshotStatus::Published,
            Some(Slot::Staging) => SnapshotStatus::Staged,
            None => SnapshotStatus::Unreferenced,
        };

        self
    }
}

fn read_metadata(dir: &Path) -> Result<Snapshot> {
    let path = dir.join(SNAPSHOT_METADATA_FILENAME);
    let data = std::fs::read(&path).map_err(|e| MirrorError::io_path(&path, e))?;

    Ok(serde_json::from_slice(&data)?)
}

/// Move a directory aside and remove it.
///
/// The rename makes the snapshot disappear at once; removal of the contents
/// may then take a while.
fn remove_tree(layout: &MirrorLayout, name: &str) -> Result<()> {
    let dir = layout.snapshot_dir(name);
    let trash = layout
        .snapshots_dir()
        .join(format!(".trash-{}-{}", name, uuid::Uuid::new_v4()));

    std::fs::rename(&dir, &trash).map_err(|e| MirrorError::io_path(&dir, e))?;
    if let Err(e) = std::fs::remove_dir_all(&trash) {
        warn!("could not remove {}: {}", trash.display(), e);
    }

    Ok(())
}

/// Creates, lists, deletes, and prunes snapshots.
#[derive(Clone, Debug)]
pub struct SnapshotManager {
    root: PathBuf,
}

impl SnapshotManager {
    /// Construct an instance operating on mirrors under `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn layout(&self, mirror: &str) -> Result<MirrorLayout> {
        MirrorLayout::new(&self.root, mirror)
    }

    /// Create a snapshot from the file set of the last successful sync.
    ///
    /// Without a name, one is generated from the mirror's naming policy. An existing
    /// snapshot of the same name is an error unless `force` is set, in which case the
    /// new tree replaces it. A snapshot occupying a publish slot is never replaced.
    pub fn create(
        &self,
        mirror: &MirrorDescriptor,
        name: Option<&str>,
        force: bool,
    ) -> Result<Snapshot> {
        self.create_at(mirror, name, force, Utc::now())
    }

    /// [Self::create()] with an explicit creation time.
    pub fn create_at(
        &self,
        mirror: &MirrorDescriptor,
        name: Option<&str>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let layout = self.layout(&mirror.id)?;

        let name = match name {
            Some(name) if !name.is_empty() => {
                validate_snapshot_name(name)?;
                name.to_string()
            }
            _ => mirror.snapshot_naming.generate(now)?,
        };

        let final_dir = layout.snapshot_dir(&name);
        if final_dir.exists() {
            if !force {
                return Err(MirrorError::AlreadyExists {
                    mirror: mirror.id.clone(),
                    name,
                });
            }

            // Slot readers must never observe the tree missing mid-replace.
            if let Some(slot) = self.publish_state(&layout)?.slot_of(&name) {
                return Err(MirrorError::InUse {
                    mirror: mirror.id.clone(),
                    name,
                    slot: slot.name(),
                });
            }
        }

        let file_set = match FileSet::load(&layout.file_set_path()) {
            Ok(file_set) => file_set,
            Err(MirrorError::IoPath(_, e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MirrorError::IncompleteContent {
                    mirror: mirror.id.clone(),
                    missing: 0,
                    first: "no completed sync".into(),
                });
            }
            Err(e) => return Err(e),
        };

        let store = ContentStore::new(layout.store_dir())?;

        let missing = file_set
            .iter()
            .filter(|d| !store.has(&d.digest))
            .collect::<Vec<_>>();
        if let Some(first) = missing.first() {
            return Err(MirrorError::IncompleteContent {
                mirror: mirror.id.clone(),
                missing: missing.len(),
                first: first.path.clone(),
            });
        }

        let snapshots_dir = layout.snapshots_dir();
        std::fs::create_dir_all(&snapshots_dir)
            .map_err(|e| MirrorError::io_path(&snapshots_dir, e))?;

        let build_dir = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(&snapshots_dir)
            .map_err(|e| MirrorError::io_path(&snapshots_dir, e))?;

        let mut suites = BTreeSet::new();
        let mut snapshot = Snapshot {
            mirror: mirror.id.clone(),
            name: name.clone(),
            created_at: now,
            total_size: 0,
            file_count: 0,
            index_count: 0,
            suites: vec![],
            status: SnapshotStatus::Unreferenced,
        };

        for descriptor in file_set.iter() {
            store.alias(&descriptor.digest, &build_dir.path().join(&descriptor.path))?;

            if let Some(by_hash) = &descriptor.by_hash_path {
                store.alias(&descriptor.digest, &build_dir.path().join(by_hash))?;
            }

            snapshot.total_size += descriptor.size;
            if descriptor.kind.is_package_content() {
                snapshot.file_count += 1;
            } else {
                snapshot.index_count += 1;
            }

            if descriptor.kind == FileKind::Manifest {
                if let Some(suite) = descriptor
                    .path
                    .strip_prefix("dists/")
                    .and_then(|p| p.rsplit_once('/'))
                    .map(|(suite, _)| suite)
                {
                    suites.insert(suite.to_string());
                }
            }
        }
        snapshot.suites = suites.into_iter().collect();

        let metadata_path = build_dir.path().join(SNAPSHOT_METADATA_FILENAME);
        std::fs::write(&metadata_path, serde_json::to_vec_pretty(&snapshot)?)
            .map_err(|e| MirrorError::io_path(&metadata_path, e))?;

        if final_dir.exists() {
            // Replacing: the old tree moves aside, the new one takes its place.
            let trash = snapshots_dir.join(format!(".trash-{}-{}", name, uuid::Uuid::new_v4()));
            std::fs::rename(&final_dir, &trash).map_err(|e| MirrorError::io_path(&final_dir, e))?;

            if let Err(e) = std::fs::rename(build_dir.path(), &final_dir) {
                let _ = std::fs::rename(&trash, &final_dir);
                return Err(MirrorError::io_path(&final_dir, e));
            }

            if let Err(e) = std::fs::remove_dir_all(&trash) {
                warn!("could not remove {}: {}", trash.display(), e);
            }
        } else {
            std::fs::rename(build_dir.path(), &final_dir).map_err(|e| {
                if final_dir.exists() {
                    MirrorError::AlreadyExists {
                        mirror: mirror.id.clone(),
                        name: name.clone(),
                    }
                } else {
                    MirrorError::io_path(&final_dir, e)
                }
            })?;
        }

        info!(
            "{}: created snapshot {} ({} files, {} index files, {} bytes)",
            mirror.id, name, snapshot.file_count, snapshot.index_count, snapshot.total_size
        );

        Ok(snapshot.with_status(&self.publish_state(&layout)?))
    }

    fn publish_state(&self, layout: &MirrorLayout) -> Result<PublishState> {
        Ok(PublishState {
            staging: read_slot(layout, Slot::Staging)?,
            production: read_slot(layout, Slot::Production)?,
        })
    }

    /// List snapshots of a mirror, oldest first.
    pub fn list(&self, mirror: &str) -> Result<Vec<Snapshot>> {
        let layout = self.layout(mirror)?;
        let dir = layout.snapshots_dir();
        let state = self.publish_state(&layout)?;

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(MirrorError::io_path(&dir, e)),
        };

        let mut snapshots = vec![];

        for entry in entries {
            let entry = entry.map_err(|e| MirrorError::io_path(&dir, e))?;
            let file_type = entry.file_type().map_err(|e| MirrorError::io_path(entry.path(), e))?;
            let file_name = entry.file_name().to_string_lossy().to_string();

            // Skips publish pointers and in-progress or discarded trees.
            if !file_type.is_dir() || file_name.starts_with('.') {
                continue;
            }

            match read_metadata(&entry.path()) {
                Ok(snapshot) => snapshots.push(snapshot.with_status(&state)),
                Err(e) => warn!("ignoring {}: {}", entry.path().display(), e),
            }
        }

        snapshots.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));

        Ok(snapshots)
    }

    /// Obtain one snapshot.
    pub fn show(&self, mirror: &str, name: &str) -> Result<Snapshot> {
        let layout = self.layout(mirror)?;
        validate_snapshot_name(name)?;

        let dir = layout.snapshot_dir(name);
        if !dir.join(SNAPSHOT_METADATA_FILENAME).is_file() {
            return Err(MirrorError::NotFound {
                what: "snapshot",
                name: format!("{}/{}", mirror, name),
            });
        }

        Ok(read_metadata(&dir)?.with_status(&self.publish_state(&layout)?))
    }

    /// Delete a snapshot.
    ///
    /// A snapshot occupying a slot is only deleted with `force`, which also empties
    /// the slot.
    pub fn delete(&self, mirror: &str, name: &str, force: bool) -> Result<()> {
        let snapshot = self.show(mirror, name)?;
        let layout = self.layout(mirror)?;
        let state = self.publish_state(&layout)?;

        for slot in [Slot::Production, Slot::Staging] {
            let occupant = match slot {
                Slot::Production => &state.production,
                Slot::Staging => &state.staging,
            };

            if occupant.as_deref() == Some(name) {
                if !force {
                    return Err(MirrorError::InUse {
                        mirror: mirror.to_string(),
                        name: name.to_string(),
                        slot: slot.name(),
                    });
                }

                warn!("{}: clearing {} slot pointing to {}", mirror, slot, name);
                clear_slot(&layout, slot)?;
            }
        }

        remove_tree(&layout, &snapshot.name)?;
        info!("{}: deleted snapshot {}", mirror, name);

        Ok(())
    }

    /// Remove snapshots not retained by a policy. Returns the names removed, or
    /// with `dry_run`, the names that would be.
    pub fn prune(&self, mirror: &str, policy: &RetentionPolicy, dry_run: bool) -> Result<Vec<String>> {
        self.prune_at(mirror, policy, dry_run, Utc::now())
    }

    /// [Self::prune()] evaluated at a given time.
    pub fn prune_at(
        &self,
        mirror: &str,
        policy: &RetentionPolicy,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let layout = self.layout(mirror)?;

        let mut candidates = self
            .list(mirror)?
            .into_iter()
            .filter(|s| s.status == SnapshotStatus::Unreferenced)
            .collect::<Vec<_>>();
        candidates.reverse();

        let mut removed = vec![];

        for (rank, snapshot) in candidates.into_iter().enumerate() {
            if policy.retains(rank, snapshot.created_at, now) {
                continue;
            }

            if !dry_run {
                remove_tree(&layout, &snapshot.name)?;
                info!("{}: pruned snapshot {}", mirror, snapshot.name);
            }
            removed.push(snapshot.name);
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            mirror::HumanDuration,
            packages::FileDescriptor,
            publish::PublishController,
        },
        chrono::{Duration, TimeZone},
    };

    fn descriptor() -> MirrorDescriptor {
        serde_json::from_value(serde_json::json!({
            "id": "ubuntu",
            "url": "http://archive.ubuntu.com/ubuntu",
            "suites": ["noble"],
            "components": ["main"],
            "architectures": ["amd64"],
        }))
        .unwrap()
    }

    /// Populate a store and file set as a completed sync would.
    fn seed(root: &Path) -> Result<FileSet> {
        let layout = MirrorLayout::new(root, "ubuntu")?;
        let store = ContentStore::new(layout.store_dir())?;

        let mut file_set = FileSet::default();
        for (path, data, kind) in [
            ("dists/noble/InRelease", &b"signed manifest"[..], FileKind::Manifest),
            ("dists/noble/main/binary-amd64/Packages.gz", b"index", FileKind::Index),
            ("pool/main/h/hello/hello_1.0_amd64.deb", b"hello", FileKind::Package),
            ("pool/main/w/world/world_1.0_amd64.deb", b"world", FileKind::Package),
        ] {
            let digest = store.insert_bytes(path, data)?;
            file_set.insert(FileDescriptor {
                path: path.to_string(),
                size: data.len() as u64,
                digest,
                legacy_digest: None,
                by_hash_path: None,
                kind,
            });
        }
        file_set.write_atomic(&layout.file_set_path())?;

        Ok(file_set)
    }

    #[test]
    fn create_and_list() -> Result<()> {
        let td = tempfile::tempdir()?;
        seed(td.path())?;
        let manager = SnapshotManager::new(td.path());
        let now = Utc.ymd(2024, 4, 25).and_hms(8, 30, 0);

        let snapshot = manager.create_at(&descriptor(), None, false, now)?;
        assert_eq!(snapshot.name, "20240425T083000Z");
        assert_eq!(snapshot.file_count, 2);
        assert_eq!(snapshot.index_count, 2);
        assert_eq!(snapshot.total_size, 30);
        assert_eq!(snapshot.suites, vec!["noble".to_string()]);
        assert_eq!(snapshot.status, SnapshotStatus::Unreferenced);

        let tree = td.path().join("ubuntu/snapshots/20240425T083000Z");
        assert_eq!(
            std::fs::read(tree.join("pool/main/h/hello/hello_1.0_amd64.deb"))?,
            b"hello"
        );

        assert!(matches!(
            manager.create_at(&descriptor(), Some("20240425T083000Z"), false, now),
            Err(MirrorError::AlreadyExists { .. })
        ));

        manager.create_at(&descriptor(), Some("manual"), false, now + Duration::hours(1))?;

        let names = manager
            .list("ubuntu")?
            .into_iter()
            .map(|s| s.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["20240425T083000Z", "manual"]);

        assert!(matches!(
            manager.show("ubuntu", "nope"),
            Err(MirrorError::NotFound { .. })
        ));

        Ok(())
    }

    #[test]
    fn snapshots_share_inodes_with_store() -> Result<()> {
        let td = tempfile::tempdir()?;
        let file_set = seed(td.path())?;
        let manager = SnapshotManager::new(td.path());

        manager.create(&descriptor(), Some("a"), false)?;
        manager.create(&descriptor(), Some("b"), false)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let store = ContentStore::new(td.path().join("ubuntu/store"))?;
            for d in file_set.iter() {
                let blob = std::fs::metadata(store.path_of(&d.digest)?)?;
                for name in ["a", "b"] {
                    let linked = std::fs::metadata(
                        td.path().join("ubuntu/snapshots").join(name).join(&d.path),
                    )?;
                    assert_eq!(linked.ino(), blob.ino());
                }
                assert_eq!(blob.nlink(), 3);
            }
        }

        Ok(())
    }

    #[test]
    fn force_replaces_existing() -> Result<()> {
        let td = tempfile::tempdir()?;
        seed(td.path())?;
        let manager = SnapshotManager::new(td.path());
        let first = Utc.ymd(2024, 1, 1).and_hms(0, 0, 0);

        manager.create_at(&descriptor(), Some("nightly"), false, first)?;
        let replaced =
            manager.create_at(&descriptor(), Some("nightly"), true, first + Duration::days(1))?;
        assert_eq!(replaced.created_at, first + Duration::days(1));
        assert_eq!(manager.show("ubuntu", "nightly")?.created_at, replaced.created_at);
        assert_eq!(manager.list("ubuntu")?.len(), 1);

        Ok(())
    }

    #[test]
    fn force_refuses_published_snapshot() -> Result<()> {
        let td = tempfile::tempdir()?;
        seed(td.path())?;
        let manager = SnapshotManager::new(td.path());
        let controller = PublishController::new(td.path());
        let first = Utc.ymd(2024, 1, 1).and_hms(0, 0, 0);

        manager.create_at(&descriptor(), Some("nightly"), false, first)?;
        controller.stage("ubuntu", "nightly")?;
        controller.promote("ubuntu")?;

        assert!(matches!(
            manager.create_at(&descriptor(), Some("nightly"), true, first + Duration::days(1)),
            Err(MirrorError::InUse { slot: "production", .. })
        ));
        assert_eq!(manager.show("ubuntu", "nightly")?.created_at, first);

        let snapshots_dir = td.path().join("ubuntu/snapshots");
        let leftovers = std::fs::read_dir(&snapshots_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);

        Ok(())
    }

    #[test]
    fn incomplete_content_refused() -> Result<()> {
        let td = tempfile::tempdir()?;
        let manager = SnapshotManager::new(td.path());

        assert!(matches!(
            manager.create(&descriptor(), Some("a"), false),
            Err(MirrorError::IncompleteContent { .. })
        ));

        let file_set = seed(td.path())?;
        let store = ContentStore::new(td.path().join("ubuntu/store"))?;
        let victim = file_set.iter().last().unwrap();
        std::fs::remove_file(store.path_of(&victim.digest)?)?;

        assert!(matches!(
            manager.create(&descriptor(), Some("a"), false),
            Err(MirrorError::IncompleteContent { missing: 1, .. })
        ));
        assert!(manager.list("ubuntu")?.is_empty());

        Ok(())
    }

    #[test]
    fn delete_respects_slots() -> Result<()> {
        let td = tempfile::tempdir()?;
        seed(td.path())?;
        let manager = SnapshotManager::new(td.path());
        let controller = PublishController::new(td.path());

        manager.create(&descriptor(), Some("a"), false)?;
        controller.stage("ubuntu", "a")?;
        assert_eq!(manager.show("ubuntu", "a")?.status, SnapshotStatus::Staged);

        assert!(matches!(
            manager.delete("ubuntu", "a", false),
            Err(MirrorError::InUse { slot: "staging", .. })
        ));

        manager.delete("ubuntu", "a", true)?;
        assert_eq!(controller.status("ubuntu")?, PublishState::default());
        assert!(manager.list("ubuntu")?.is_empty());

        Ok(())
    }

    #[test]
    fn prune_keep_last() -> Result<()> {
        let td = tempfile::tempdir()?;
        seed(td.path())?;
        let manager = SnapshotManager::new(td.path());
        let start = Utc.ymd(2024, 1, 1).and_hms(0, 0, 0);

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            manager.create_at(&descriptor(), Some(name), false, start + Duration::days(i as i64))?;
        }

        let policy = RetentionPolicy {
            keep_last: Some(2),
            keep_within: None,
        };

        let now = start + Duration::days(30);
        assert_eq!(manager.prune_at("ubuntu", &policy, true, now)?, vec!["a"]);
        assert_eq!(manager.list("ubuntu")?.len(), 3);

        assert_eq!(manager.prune_at("ubuntu", &policy, false, now)?, vec!["a"]);
        let names = manager
            .list("ubuntu")?
            .into_iter()
            .map(|s| s.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "c"]);

        Ok(())
    }

    #[test]
    fn prune_keep_within_and_pins() -> Result<()> {
        let td = tempfile::tempdir()?;
        seed(td.path())?;
        let manager = SnapshotManager::new(td.path());
        let controller = PublishController::new(td.path());
        let start = Utc.ymd(2024, 1, 1).and_hms(0, 0, 0);

        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            manager.create_at(&descriptor(), Some(name), false, start + Duration::days(i as i64 * 10))?;
        }
        controller.publish("ubuntu", "a")?;

        let policy = RetentionPolicy {
            keep_last: Some(0),
            keep_within: Some("15d".parse::<HumanDuration>()?),
        };

        // d is 0 days old, c is 10 days old, b is 20 days old.
        let now = start + Duration::days(30);
        assert_eq!(manager.prune_at("ubuntu", &policy, false, now)?, vec!["b"]);

        let remaining = manager.list("ubuntu")?;
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].name, "a");
        assert_eq!(remaining[0].status, SnapshotStatus::Published);

        Ok(())
    }
}
