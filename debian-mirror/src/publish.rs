// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publish slots.

Each mirror has two slots, `staging` and `production`, each of which names a
snapshot or nothing. A slot is a pointer at `<snapshots>/<slot>`: a relative
symbolic link to the snapshot directory on Unix, a file holding the snapshot
name elsewhere. Pointers are replaced by renaming a fully written temporary
pointer over them, so readers resolving a slot see either the old or the new
snapshot and never a partial tree.
*/

use {
    crate::{
        error::{MirrorError, Result},
        mirror::{validate_snapshot_name, MirrorLayout},
        snapshot::SNAPSHOT_METADATA_FILENAME,
    },
    log::info,
    serde::Serialize,
    std::{
        path::{Path, PathBuf},
        str::FromStr,
    },
};

/// A publish slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    Staging,
    Production,
}

impl Slot {
    /// Name of the slot and of its pointer file.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Slot {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            _ => Err(MirrorError::NotFound {
                what: "slot",
                name: s.to_string(),
            }),
        }
    }
}

/// Which snapshots occupy a mirror's slots.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PublishState {
    pub staging: Option<String>,
    pub production: Option<String>,
}

impl PublishState {
    /// The slot a snapshot occupies, production first.
    pub fn slot_of(&self, name: &str) -> Option<Slot> {
        if self.production.as_deref() == Some(name) {
            Some(Slot::Production)
        } else if self.staging.as_deref() == Some(name) {
            Some(Slot::Staging)
        } else {
            None
        }
    }
}

fn pointer_path(layout: &MirrorLayout, slot: Slot) -> PathBuf {
    layout.snapshots_dir().join(slot.name())
}

/// Read the snapshot name a slot points to.
pub(crate) fn read_slot(layout: &MirrorLayout, slot: Slot) -> Result<Option<String>> {
    let path = pointer_path(layout, slot);

    let metadata = match std::fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MirrorError::io_path(&path, e)),
    };

    let name = if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(&path).map_err(|e| MirrorError::io_path(&path, e))?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    } else {
        std::fs::read_to_string(&path)
            .map_err(|e| MirrorError::io_path(&path, e))?
            .trim()
            .to_string()
    };

    Ok(if name.is_empty() { None } else { Some(name) })
}

fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)
            .and_then(|f| f.sync_all())
            .map_err(|e| MirrorError::io_path(dir, e))?;
    }
    #[cfg(not(unix))]
    let _ = dir;

    Ok(())
}

/// Atomically point a slot at a snapshot.
pub(crate) fn write_slot(layout: &MirrorLayout, slot: Slot, name: &str) -> Result<()> {
    let dir = layout.snapshots_dir();
    let pointer = pointer_path(layout, slot);
    let temp = dir.join(format!(".{}.tmp-{}", slot.name(), uuid::Uuid::new_v4()));

    #[cfg(unix)]
    std::os::unix::fs::symlink(name, &temp).map_err(|e| MirrorError::io_path(&temp, e))?;

    #[cfg(not(unix))]
    {
        use std::io::Write;
        let mut f = std::fs::File::create(&temp).map_err(|e| MirrorError::io_path(&temp, e))?;
        f.write_all(name.as_bytes())
            .and_then(|_| f.sync_all())
            .map_err(|e| MirrorError::io_path(&temp, e))?;
    }

    if let Err(e) = std::fs::rename(&temp, &pointer) {
        let _ = std::fs::remove_file(&temp);
        return Err(MirrorError::io_path(&pointer, e));
    }

    sync_dir(&dir)
}

/// Empty a slot.
pub(crate) fn clear_slot(layout: &MirrorLayout, slot: Slot) -> Result<()> {
    let pointer = pointer_path(layout, slot);

    match std::fs::remove_file(&pointer) {
        Ok(()) => sync_dir(&layout.snapshots_dir()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MirrorError::io_path(&pointer, e)),
    }
}

/// Switches publish slots between snapshots.
#[derive(Clone, Debug)]
pub struct PublishController {
    root: PathBuf,
}

impl PublishController {
    /// Construct an instance operating on mirrors under `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn existing_snapshot(&self, mirror: &str, name: &str) -> Result<MirrorLayout> {
        let layout = MirrorLayout::new(&self.root, mirror)?;
        validate_snapshot_name(name)?;

        if !layout
            .snapshot_dir(name)
            .join(SNAPSHOT_METADATA_FILENAME)
            .is_file()
        {
            return Err(MirrorError::NotFound {
                what: "snapshot",
                name: format!("{}/{}", mirror, name),
            });
        }

        Ok(layout)
    }

    fn assign(&self, mirror: &str, slot: Slot, name: &str) -> Result<()> {
        let layout = self.existing_snapshot(mirror, name)?;
        write_slot(&layout, slot, name)?;
        info!("{}: {} -> {}", mirror, slot, name);

        Ok(())
    }

    /// Point the production slot at a snapshot.
    pub fn publish(&self, mirror: &str, name: &str) -> Result<()> {
        self.assign(mirror, Slot::Production, name)
    }

    /// Point the staging slot at a snapshot.
    pub fn stage(&self, mirror: &str, name: &str) -> Result<()> {
        self.assign(mirror, Slot::Staging, name)
    }

    /// Point production at whatever staging points at.
    ///
    /// Staging keeps its value. Returns the promoted snapshot name.
    pub fn promote(&self, mirror: &str) -> Result<String> {
        let layout = MirrorLayout::new(&self.root, mirror)?;

        let name = read_slot(&layout, Slot::Staging)?
            .ok_or_else(|| MirrorError::NothingStaged(mirror.to_string()))?;

        self.publish(mirror, &name)?;

        Ok(name)
    }

    /// Empty a slot. Returns the snapshot it pointed to.
    pub fn unpublish(&self, mirror: &str, slot: Slot) -> Result<Option<String>> {
        let layout = MirrorLayout::new(&self.root, mirror)?;
        let previous = read_slot(&layout, slot)?;
        clear_slot(&layout, slot)?;

        Ok(previous)
    }

    /// Read the current slot assignments.
    pub fn status(&self, mirror: &str) -> Result<PublishState> {
        let layout = MirrorLayout::new(&self.root, mirror)?;

        Ok(PublishState {
            staging: read_slot(&layout, Slot::Staging)?,
            production: read_slot(&layout, Slot::Production)?,
        })
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        std::{
            sync::{
                atomic::{AtomicBool, Ordering},
                Arc,
            },
            thread,
        },
    };

    /// Create a minimal snapshot directory with a payload file.
    fn fake_snapshot(root: &Path, mirror: &str, name: &str) -> Result<()> {
        let layout = MirrorLayout::new(root, mirror)?;
        let dir = layout.snapshot_dir(name);
        std::fs::create_dir_all(dir.join("dists"))?;
        std::fs::write(dir.join("dists").join("payload"), name)?;
        std::fs::write(dir.join(SNAPSHOT_METADATA_FILENAME), "{}")?;

        Ok(())
    }

    #[test]
    fn slots_lifecycle() -> Result<()> {
        let td = tempfile::tempdir()?;
        let controller = PublishController::new(td.path());
        fake_snapshot(td.path(), "ubuntu", "a")?;
        fake_snapshot(td.path(), "ubuntu", "b")?;

        assert_eq!(controller.status("ubuntu")?, PublishState::default());
        assert!(matches!(
            controller.promote("ubuntu"),
            Err(MirrorError::NothingStaged(_))
        ));
        assert!(matches!(
            controller.publish("ubuntu", "missing"),
            Err(MirrorError::NotFound { .. })
        ));
        assert!(controller.publish("ubuntu", "../etc").is_err());

        controller.publish("ubuntu", "a")?;
        controller.stage("ubuntu", "b")?;
        assert_eq!(
            controller.status("ubuntu")?,
            PublishState {
                staging: Some("b".into()),
                production: Some("a".into()),
            }
        );

        // The pointer resolves to the snapshot tree.
        #[cfg(unix)]
        {
            let payload = td.path().join("ubuntu/snapshots/production/dists/payload");
            assert_eq!(std::fs::read_to_string(payload)?, "a");
        }

        assert_eq!(controller.promote("ubuntu")?, "b");
        assert_eq!(controller.status("ubuntu")?.production.as_deref(), Some("b"));
        assert_eq!(controller.status("ubuntu")?.staging.as_deref(), Some("b"));

        assert_eq!(
            controller.unpublish("ubuntu", Slot::Staging)?,
            Some("b".to_string())
        );
        assert_eq!(controller.status("ubuntu")?.staging, None);
        assert_eq!(controller.unpublish("ubuntu", Slot::Staging)?, None);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn concurrent_readers_see_complete_trees() -> Result<()> {
        let td = tempfile::tempdir()?;
        let controller = PublishController::new(td.path());
        fake_snapshot(td.path(), "ubuntu", "a")?;
        fake_snapshot(td.path(), "ubuntu", "b")?;
        controller.publish("ubuntu", "a")?;

        let stop = Arc::new(AtomicBool::new(false));
        let payload = td.path().join("ubuntu/snapshots/production/dists/payload");

        let readers = (0..4)
            .map(|_| {
                let stop = stop.clone();
                let payload = payload.clone();

                thread::spawn(move || {
                    let mut reads = 0;
                    loop {
                        let content = std::fs::read_to_string(&payload)
                            .expect("production tree should always be readable");
                        assert!(content == "a" || content == "b");
                        reads += 1;

                        if stop.load(Ordering::SeqCst) {
                            break reads;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for i in 0..200 {
            controller.publish("ubuntu", if i % 2 == 0 { "b" } else { "a" })?;
        }
        stop.store(true, Ordering::SeqCst);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }

        // No temporary pointers are left behind.
        let leftovers = std::fs::read_dir(td.path().join("ubuntu/snapshots"))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);

        Ok(())
    }

    #[test]
    fn slot_names() -> Result<()> {
        assert_eq!(Slot::from_str("staging")?, Slot::Staging);
        assert_eq!(Slot::Production.to_string(), "production");
        assert!(Slot::from_str("canary").is_err());

        Ok(())
    }
}
