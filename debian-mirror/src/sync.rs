// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mirror synchronization.

A [MirrorSyncer] drives one mirror through a sync:

1. The release manifest of every suite is fetched and authenticated.
2. Index files the manifest lists for the mirror's components and architectures
   are transferred into the content store and the file lists among them parsed.
   A dry run reads only the file lists, into memory, and stores nothing.
3. Every package file the indices name is transferred into the content store.
4. The resolved file set is recorded and, optionally, a snapshot created.

[sync_mirrors()] runs several mirrors concurrently under a shared deadline and
cancellation handle.
*/

use {
    crate::{
        error::{FileFailure, MirrorError, Result},
        fetcher::IndexFetcher,
        io::{read_decompressed, ChecksumType, Compression, ContentDigest},
        keyring::Keyring,
        mirror::{MirrorDescriptor, MirrorLayout},
        packages::{read_index_descriptors, FileDescriptor, FileKind, FileSet, IndexFormat},
        release::{IndexKind, IndexSelection, ReleaseManifest},
        snapshot::{Snapshot, SnapshotManager},
        source::RepositorySource,
        store::ContentStore,
        transfer::{TransferItem, TransferManager, TransferReport},
    },
    futures::{
        future::{AbortRegistration, Abortable},
        io::{AllowStdIo, BufReader, Cursor},
    },
    log::{debug, info, warn},
    std::{
        collections::{BTreeMap, HashSet},
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    },
};

/// Progress events emitted during a sync.
#[derive(Clone, Debug)]
pub enum MirrorEvent {
    /// Sync of a mirror started.
    SyncBegin(String),

    /// Processing of a mirror's suite started.
    SuiteBegin(String, String),

    /// A suite could not be processed.
    SuiteFailed(String, String, String),

    /// An index file was parsed and yielded this many file descriptors.
    IndexParsed(String, usize),

    /// A batch of transfers started with this many files and bytes to download.
    TransferBegin(usize, u64),

    /// Bytes were received.
    BytesTransferred(u64),

    /// A file was downloaded and stored.
    FileDownloaded(String, u64),

    /// A file's content was already stored.
    FilePresent(String),

    /// An optional file is not served by upstream.
    OptionalFileMissing(String),

    /// A file could not be transferred.
    FileFailed(String, String),

    /// A batch of transfers finished.
    TransferFinished,

    /// A snapshot was created for a mirror.
    SnapshotCreated(String, String),

    /// Sync of a mirror finished successfully.
    SyncFinished(String),
}

impl std::fmt::Display for MirrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SyncBegin(mirror) => write!(f, "syncing mirror {}", mirror),
            Self::SuiteBegin(mirror, suite) => write!(f, "{}: processing suite {}", mirror, suite),
            Self::SuiteFailed(mirror, suite, error) => {
                write!(f, "{}: suite {} failed: {}", mirror, suite, error)
            }
            Self::IndexParsed(path, count) => write!(f, "{} lists {} files", path, count),
            Self::TransferBegin(count, bytes) => {
                write!(f, "{} files ({} bytes) to download", count, bytes)
            }
            Self::BytesTransferred(count) => write!(f, "received {} bytes", count),
            Self::FileDownloaded(path, size) => write!(f, "downloaded {} bytes to {}", size, path),
            Self::FilePresent(path) => write!(f, "{} is present", path),
            Self::OptionalFileMissing(path) => write!(f, "{} is not served upstream", path),
            Self::FileFailed(path, error) => write!(f, "failed to mirror {}: {}", path, error),
            Self::TransferFinished => f.write_str("transfers finished"),
            Self::SnapshotCreated(mirror, name) => {
                write!(f, "{}: created snapshot {}", mirror, name)
            }
            Self::SyncFinished(mirror) => write!(f, "mirror {} is in sync", mirror),
        }
    }
}

/// Options for a sync invocation.
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Accept manifests without verifying their signatures.
    pub skip_signature_verification: bool,

    /// Resolve metadata in memory and report what would be downloaded. Nothing is written.
    pub dry_run: bool,

    /// Replace an existing snapshot of the same name.
    pub force: bool,

    /// Create a snapshot after a successful sync.
    pub create_snapshot: bool,

    /// Name of the snapshot to create. Generated when absent.
    pub snapshot_name: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            skip_signature_verification: false,
            dry_run: false,
            force: false,
            create_snapshot: true,
            snapshot_name: None,
        }
    }
}

/// Outcome of syncing one mirror.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub mirror: String,

    /// Suites that were resolved.
    pub suites: Vec<String>,

    /// Number of package files in the resolved file set.
    pub file_count: usize,

    /// Number of manifest and index files in the resolved file set.
    pub index_count: usize,

    /// Total size of the resolved file set.
    pub total_size: u64,

    /// Transfers of indices and packages.
    pub transfers: TransferReport,

    /// With a dry run, the package files and bytes that would be downloaded.
    pub pending: Option<(usize, u64)>,

    /// The snapshot created, if any.
    pub snapshot: Option<Snapshot>,
}

/// Files resolved for one suite.
#[derive(Default)]
struct SuiteResolution {
    skeleton: Vec<FileDescriptor>,
    packages: Vec<FileDescriptor>,
    failures: Vec<FileFailure>,
    transfers: TransferReport,
}

fn index_format(kind: &IndexKind) -> Option<IndexFormat> {
    match kind {
        IndexKind::Packages { .. } => Some(IndexFormat::Packages),
        IndexKind::Sources { .. } => Some(IndexFormat::Sources),
        _ => None,
    }
}

/// Synchronizes one mirror into its content store.
pub struct MirrorSyncer {
    root: PathBuf,
    descriptor: MirrorDescriptor,
    source: Arc<dyn RepositorySource>,
    keyring: Option<Keyring>,
    layout: MirrorLayout,
    store: ContentStore,
    transfer: TransferManager,
}

impl MirrorSyncer {
    /// Construct an instance for a mirror whose state lives under `root`.
    pub fn new(
        root: impl AsRef<Path>,
        descriptor: MirrorDescriptor,
        source: Arc<dyn RepositorySource>,
        keyring: Option<Keyring>,
        transfer: TransferManager,
    ) -> Result<Self> {
        descriptor.validate()?;

        let root = root.as_ref().to_path_buf();
        let layout = MirrorLayout::new(&root, &descriptor.id)?;
        let store = ContentStore::new(layout.store_dir())?;

        Ok(Self {
            root,
            descriptor,
            source,
            keyring,
            layout,
            store,
            transfer,
        })
    }

    /// The mirror ID.
    pub fn mirror(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &MirrorDescriptor {
        &self.descriptor
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Parse a stored index file.
    async fn parse_index(
        &self,
        manifest: &ReleaseManifest,
        selection: &IndexSelection,
        format: IndexFormat,
    ) -> Result<Vec<FileDescriptor>> {
        let path = manifest.dist_path(&selection.entry.path);
        let blob = self.store.path_of(&selection.entry.digest)?;
        let file = std::fs::File::open(&blob).map_err(|e| MirrorError::io_path(&blob, e))?;

        let reader = read_decompressed(BufReader::new(AllowStdIo::new(file)), selection.compression);

        read_index_descriptors(BufReader::new(reader), format, &path).await
    }

    /// Parse an index file held in memory.
    async fn parse_index_bytes(
        &self,
        data: Vec<u8>,
        compression: Compression,
        format: IndexFormat,
        path: &str,
    ) -> Result<Vec<FileDescriptor>> {
        let reader = read_decompressed(Cursor::new(data), compression);

        read_index_descriptors(BufReader::new(reader), format, path).await
    }

    /// Locate the most preferred readable variant of a file list without storing it.
    ///
    /// Stored variants are read in place. Others are downloaded into memory. Variants
    /// upstream does not serve are skipped; any other failure ends the search.
    async fn fetch_file_list<'a>(
        &self,
        manifest: &ReleaseManifest,
        variants: &[&'a IndexSelection],
        resolution: &mut SuiteResolution,
    ) -> Option<(&'a IndexSelection, Option<Vec<u8>>)> {
        for selection in variants.iter().copied() {
            if self.store.has(&selection.entry.digest) {
                return Some((selection, None));
            }

            let descriptor = manifest.index_descriptor(selection);
            match self
                .transfer
                .fetch_bytes(self.source.as_ref(), &descriptor)
                .await
            {
                Ok(data) => return Some((selection, Some(data))),
                Err(MirrorError::MissingUpstreamFile { .. }) => {
                    resolution.transfers.missing_optional.push(descriptor.path);
                }
                Err(error) => {
                    warn!("failed to read {}: {}", descriptor.path, error);
                    resolution.failures.push(FileFailure {
                        path: descriptor.path,
                        error,
                    });
                    return None;
                }
            }
        }

        None
    }

    async fn resolve_suite(
        &self,
        suite: &str,
        options: &SyncOptions,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> Result<SuiteResolution> {
        let mut resolution = SuiteResolution::default();

        let fetcher = IndexFetcher::new(
            self.source.as_ref(),
            self.keyring.as_ref(),
            *self.transfer.retry_policy(),
        );
        let fetched = fetcher
            .fetch(suite, !options.skip_signature_verification)
            .await?;
        let manifest = fetched.manifest;

        for (path, data) in fetched.raw {
            let digest = if options.dry_run {
                ContentDigest::compute(ChecksumType::Sha256, &data)
            } else {
                self.store.insert_bytes(&path, &data)?
            };

            resolution.skeleton.push(FileDescriptor {
                path,
                size: data.len() as u64,
                digest,
                legacy_digest: None,
                by_hash_path: None,
                kind: FileKind::Manifest,
            });
        }

        let selections = manifest.select_indices(&self.descriptor);
        if !selections.iter().any(|s| s.kind.is_file_list()) {
            warn!(
                "{}: manifest of {} lists no package indices for the configured components and architectures",
                self.descriptor.id, suite
            );
        }

        if options.dry_run {
            debug!(
                "{}: dry run; only file lists of {} are read",
                self.descriptor.id, suite
            );
        } else {
            // Every variant is optional: upstreams commonly list variants they do not
            // serve. Availability of each file list is checked after the transfer.
            let items = selections
                .iter()
                .map(|s| TransferItem::optional(manifest.index_descriptor(s)))
                .collect::<Vec<_>>();

            resolution.transfers = self
                .transfer
                .transfer(self.source.as_ref(), &self.store, items, progress_cb)
                .await;
            resolution
                .failures
                .append(&mut resolution.transfers.failures);

            for selection in &selections {
                if self.store.has(&selection.entry.digest) {
                    resolution.skeleton.push(manifest.index_descriptor(selection));
                }
            }
        }

        let mut file_lists: BTreeMap<&IndexKind, Vec<&IndexSelection>> = BTreeMap::new();
        for selection in selections.iter().filter(|s| s.kind.is_file_list()) {
            file_lists.entry(&selection.kind).or_default().push(selection);
        }

        for (kind, mut variants) in file_lists {
            let format = match index_format(kind) {
                Some(format) => format,
                None => continue,
            };

            variants.sort_by_key(|s| s.compression.preference_rank());

            let located = if options.dry_run {
                self.fetch_file_list(&manifest, &variants, &mut resolution)
                    .await
            } else {
                variants
                    .iter()
                    .find(|s| self.store.has(&s.entry.digest))
                    .map(|s| (*s, None))
            };

            let (selection, data) = match located {
                Some(located) => located,
                None => {
                    let failed_already = variants.iter().any(|s| {
                        let path = manifest.dist_path(&s.entry.path);
                        resolution.failures.iter().any(|f| f.path == path)
                    });

                    if !failed_already {
                        let path = manifest.dist_path(&variants[0].entry.path);
                        resolution.failures.push(FileFailure {
                            error: MirrorError::MissingUpstreamFile {
                                url: path.clone(),
                                reason: "no listed variant of the index is served".into(),
                            },
                            path,
                        });
                    }

                    continue;
                }
            };

            let path = manifest.dist_path(&selection.entry.path);

            let parsed = match data {
                Some(data) => {
                    resolution.skeleton.push(manifest.index_descriptor(selection));
                    self.parse_index_bytes(data, selection.compression, format, &path)
                        .await
                }
                None => {
                    if options.dry_run {
                        resolution.skeleton.push(manifest.index_descriptor(selection));
                    }
                    self.parse_index(&manifest, selection, format).await
                }
            };

            match parsed {
                Ok(descriptors) => {
                    if let Some(cb) = progress_cb {
                        cb(MirrorEvent::IndexParsed(path, descriptors.len()));
                    }
                    resolution.packages.extend(descriptors);
                }
                Err(error) => {
                    warn!("{}: failed to parse {}: {}", self.descriptor.id, path, error);
                    resolution.failures.push(FileFailure { path, error });
                }
            }
        }

        Ok(resolution)
    }

    /// Run a sync.
    ///
    /// Failures of individual suites, indices, or files do not stop the remaining
    /// work, but any of them fails the sync with [MirrorError::SyncFailed] and
    /// leaves the recorded file set of the previous sync in place.
    pub async fn sync(
        &self,
        options: &SyncOptions,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> Result<SyncReport> {
        let mirror = self.descriptor.id.clone();

        if let Some(cb) = progress_cb {
            cb(MirrorEvent::SyncBegin(mirror.clone()));
        }

        let mut report = SyncReport {
            mirror: mirror.clone(),
            ..Default::default()
        };
        let mut failures = vec![];
        let mut file_set = FileSet::default();
        let mut packages = vec![];

        for suite in &self.descriptor.suites {
            if let Some(cb) = progress_cb {
                cb(MirrorEvent::SuiteBegin(mirror.clone(), suite.clone()));
            }

            match self.resolve_suite(suite, options, progress_cb).await {
                Ok(mut resolution) => {
                    file_set.extend(resolution.skeleton);
                    packages.append(&mut resolution.packages);
                    failures.append(&mut resolution.failures);
                    report.transfers.merge(resolution.transfers);
                    report.suites.push(suite.clone());
                }
                Err(error) => {
                    warn!("{}: suite {} failed: {}", mirror, suite, error);

                    if let Some(cb) = progress_cb {
                        cb(MirrorEvent::SuiteFailed(
                            mirror.clone(),
                            suite.clone(),
                            error.to_string(),
                        ));
                    }
                    failures.push(FileFailure {
                        path: format!("dists/{}", suite),
                        error,
                    });
                }
            }
        }

        // Packages shared between suites are fetched once.
        let mut seen = HashSet::new();
        packages.retain(|d| seen.insert(d.path.clone()));
        file_set.extend(packages.iter().cloned());

        report.file_count = file_set.iter().filter(|d| d.kind.is_package_content()).count();
        report.index_count = file_set.len() - report.file_count;
        report.total_size = file_set.total_size();

        if options.dry_run {
            let pending = self.transfer.missing(&self.store, packages.iter());
            info!(
                "{}: {} files ({} bytes) would be downloaded",
                mirror, pending.0, pending.1
            );
            report.pending = Some(pending);
        } else {
            let items = packages.into_iter().map(TransferItem::required).collect();
            let mut transfers = self
                .transfer
                .transfer(self.source.as_ref(), &self.store, items, progress_cb)
                .await;
            failures.append(&mut transfers.failures);
            report.transfers.merge(transfers);
        }

        if !failures.is_empty() {
            return Err(MirrorError::SyncFailed { mirror, failures });
        }

        if options.dry_run {
            return Ok(report);
        }

        file_set.write_atomic(&self.layout.file_set_path())?;
        info!(
            "{}: {} package files and {} index files in sync ({} downloaded)",
            mirror, report.file_count, report.index_count, report.transfers.downloaded_files
        );

        if options.create_snapshot {
            let snapshot = SnapshotManager::new(&self.root).create(
                &self.descriptor,
                options.snapshot_name.as_deref(),
                options.force,
            )?;

            if let Some(cb) = progress_cb {
                cb(MirrorEvent::SnapshotCreated(mirror.clone(), snapshot.name.clone()));
            }
            report.snapshot = Some(snapshot);
        }

        if let Some(cb) = progress_cb {
            cb(MirrorEvent::SyncFinished(mirror));
        }

        Ok(report)
    }
}

/// Sync several mirrors concurrently.
///
/// Each mirror's outcome is reported separately; one mirror failing does not affect
/// the others. Exceeding `timeout` or aborting through `abort` stops all in-flight
/// work and yields [MirrorError::Cancelled]. Blobs committed before that remain
/// valid and no snapshot or publish state is left half written.
pub async fn sync_mirrors(
    syncers: &[MirrorSyncer],
    options: &SyncOptions,
    timeout: Option<Duration>,
    abort: Option<AbortRegistration>,
    progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
) -> Result<Vec<(String, Result<SyncReport>)>> {
    let work = futures::future::join_all(syncers.iter().map(|syncer| async move {
        let res = syncer
            .sync(options, progress_cb)
            .await
            .map_err(|e| e.in_mirror(syncer.mirror()));

        (syncer.mirror().to_string(), res)
    }));

    let work = async move {
        match abort {
            Some(registration) => Abortable::new(work, registration)
                .await
                .map_err(|_| MirrorError::Cancelled("sync aborted".into())),
            None => Ok(work.await),
        }
    };

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| MirrorError::Cancelled(format!("sync timed out after {:?}", timeout)))?,
        None => work.await,
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            error::ErrorKind,
            io::{ChecksumType, ContentDigest},
            mirror::{RetentionPolicy, SnapshotNaming},
            publish::{PublishController, PublishState},
            snapshot::SnapshotStatus,
            source::FilesystemRepositorySource,
            testutil::{Signing, TestPackage, TestRepository, TestSigner},
            transfer::{ConnectionLimiter, RetryPolicy},
        },
        async_trait::async_trait,
        futures::{future::AbortHandle, AsyncBufRead, AsyncRead, AsyncReadExt},
        std::{
            pin::Pin,
            task::{Context, Poll},
        },
        url::Url,
    };

    fn packages() -> Vec<TestPackage> {
        vec![
            TestPackage::new("hello", "amd64", b"hello package content"),
            TestPackage::new("world", "amd64", b"world package content, a little longer"),
            TestPackage::new("zlib", "amd64", b"compression library"),
        ]
    }

    fn descriptor(id: &str, repo: &TestRepository) -> MirrorDescriptor {
        MirrorDescriptor {
            id: id.to_string(),
            url: format!("{}", repo.root().display()),
            suites: vec!["noble".into()],
            components: vec!["main".into()],
            architectures: vec!["amd64".into()],
            sources: false,
            snapshot_naming: SnapshotNaming::default(),
            retention: None,
            keyring: None,
            max_connections_per_host: None,
        }
    }

    fn transfer_manager() -> TransferManager {
        TransferManager::new(
            Arc::new(ConnectionLimiter::new(None)),
            4,
            RetryPolicy {
                retries: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        )
    }

    fn syncer_with_source(
        root: &Path,
        id: &str,
        repo: &TestRepository,
        source: Arc<dyn RepositorySource>,
        keyring: Option<Keyring>,
    ) -> Result<MirrorSyncer> {
        MirrorSyncer::new(root, descriptor(id, repo), source, keyring, transfer_manager())
    }

    fn syncer(root: &Path, repo: &TestRepository, keyring: Option<Keyring>) -> Result<MirrorSyncer> {
        let source = Arc::new(FilesystemRepositorySource::new(repo.root())?);
        syncer_with_source(root, "ubuntu", repo, source, keyring)
    }

    fn no_snapshot() -> SyncOptions {
        SyncOptions {
            create_snapshot: false,
            ..Default::default()
        }
    }

    fn sha256(data: &[u8]) -> ContentDigest {
        ContentDigest::compute(ChecksumType::Sha256, data)
    }

    /// Files under the store directory, in-flight writes included.
    fn stored_files(store: &ContentStore) -> usize {
        fn walk(dir: &Path) -> usize {
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| {
                            let path = e.path();
                            if path.is_dir() {
                                walk(&path)
                            } else {
                                1
                            }
                        })
                        .sum()
                })
                .unwrap_or(0)
        }

        walk(store.dir())
    }

    #[tokio::test]
    async fn end_to_end() -> Result<()> {
        let signer = TestSigner::shared();
        let repo = TestRepository::build("noble", &packages(), Signing::InRelease(signer))?;
        let td = tempfile::tempdir()?;
        let syncer = syncer(td.path(), &repo, Some(signer.keyring()))?;

        let report = syncer.sync(&no_snapshot(), &None).await?;
        assert_eq!(report.suites, vec!["noble".to_string()]);
        assert_eq!(report.file_count, 3);
        // InRelease and Packages.gz. The uncompressed Packages is not served.
        assert_eq!(report.index_count, 2);
        assert_eq!(
            report.transfers.missing_optional,
            vec!["dists/noble/main/binary-amd64/Packages".to_string()]
        );

        for package in packages() {
            assert!(syncer.store().has(&sha256(&package.content)));
        }

        let manager = SnapshotManager::new(td.path());
        let snapshot = manager.create(syncer.descriptor(), None, false)?;
        assert!(snapshot.name.ends_with('Z'));
        assert_eq!(snapshot.file_count, report.file_count);
        assert_eq!(snapshot.status, SnapshotStatus::Unreferenced);
        assert_eq!(snapshot.suites, vec!["noble".to_string()]);

        let tree = td.path().join("ubuntu/snapshots").join(&snapshot.name);
        assert!(tree.join("dists/noble/InRelease").is_file());
        assert!(tree.join("dists/noble/main/binary-amd64/Packages.gz").is_file());
        assert_eq!(
            std::fs::read(tree.join(packages()[0].pool_path()))?,
            packages()[0].content
        );

        PublishController::new(td.path()).publish("ubuntu", &snapshot.name)?;
        assert_eq!(
            manager.show("ubuntu", &snapshot.name)?.status,
            SnapshotStatus::Published
        );

        let policy = RetentionPolicy {
            keep_last: Some(0),
            keep_within: None,
        };
        assert!(manager.prune("ubuntu", &policy, false)?.is_empty());
        assert_eq!(manager.list("ubuntu")?.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn second_sync_downloads_nothing() -> Result<()> {
        let signer = TestSigner::shared();
        let repo = TestRepository::build("noble", &packages(), Signing::InRelease(signer))?;
        let td = tempfile::tempdir()?;
        let syncer = syncer(td.path(), &repo, Some(signer.keyring()))?;

        let first = syncer.sync(&no_snapshot(), &None).await?;
        assert_eq!(first.transfers.downloaded_files, 4);

        let second = syncer.sync(&no_snapshot(), &None).await?;
        assert_eq!(second.transfers.downloaded_files, 0);
        assert_eq!(second.transfers.downloaded_bytes, 0);
        assert_eq!(second.transfers.already_present, 4);

        Ok(())
    }

    #[tokio::test]
    async fn snapshots_share_store_inodes() -> Result<()> {
        let signer = TestSigner::shared();
        let repo = TestRepository::build("noble", &packages(), Signing::InRelease(signer))?;
        let td = tempfile::tempdir()?;
        let syncer = syncer(td.path(), &repo, Some(signer.keyring()))?;

        let options = SyncOptions {
            snapshot_name: Some("first".into()),
            ..Default::default()
        };
        let report = syncer.sync(&options, &None).await?;
        assert_eq!(report.snapshot.map(|s| s.name), Some("first".to_string()));

        let options = SyncOptions {
            snapshot_name: Some("second".into()),
            ..Default::default()
        };
        syncer.sync(&options, &None).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let package = &packages()[1];
            let blob = syncer.store().path_of(&sha256(&package.content))?;
            let snapshots = td.path().join("ubuntu/snapshots");

            let first = std::fs::metadata(snapshots.join("first").join(package.pool_path()))?;
            let second = std::fs::metadata(snapshots.join("second").join(package.pool_path()))?;
            assert_eq!(first.ino(), std::fs::metadata(&blob)?.ino());
            assert_eq!(second.ino(), first.ino());
        }

        Ok(())
    }

    #[tokio::test]
    async fn corrupted_package_rejected() -> Result<()> {
        let signer = TestSigner::shared();
        let repo = TestRepository::build("noble", &packages(), Signing::InRelease(signer))?;
        let td = tempfile::tempdir()?;
        let syncer = syncer(td.path(), &repo, Some(signer.keyring()))?;

        let victim = &packages()[0];
        let mut corrupted = victim.content.clone();
        corrupted[3] ^= 0x20;
        std::fs::write(repo.path(&victim.pool_path()), &corrupted)?;

        match syncer.sync(&no_snapshot(), &None).await {
            Err(MirrorError::SyncFailed { mirror, failures }) => {
                assert_eq!(mirror, "ubuntu");
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].path, victim.pool_path());
                assert_eq!(failures[0].error.kind(), ErrorKind::Integrity);
            }
            other => panic!("expected sync failure, got {:?}", other.map(|r| r.mirror)),
        }

        assert!(!syncer.store().has(&sha256(&victim.content)));
        assert!(!syncer.store().has(&sha256(&corrupted)));
        assert!(syncer.store().has(&sha256(&packages()[1].content)));
        assert!(!td.path().join("ubuntu/state/files.json").exists());

        Ok(())
    }

    #[tokio::test]
    async fn authentication_failure_fails_suite() -> Result<()> {
        let repo = TestRepository::build(
            "noble",
            &packages(),
            Signing::InRelease(TestSigner::shared()),
        )?;
        let td = tempfile::tempdir()?;
        let syncer = syncer(td.path(), &repo, Some(TestSigner::other().keyring()))?;

        match syncer.sync(&no_snapshot(), &None).await {
            Err(MirrorError::SyncFailed { failures, .. }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].path, "dists/noble");
                assert_eq!(failures[0].error.kind(), ErrorKind::Authentication);
            }
            other => panic!("expected sync failure, got {:?}", other.map(|r| r.mirror)),
        }

        // Nothing beyond the store skeleton was written.
        assert!(!syncer.store().has(&sha256(&packages()[0].content)));

        let options = SyncOptions {
            skip_signature_verification: true,
            ..no_snapshot()
        };
        assert_eq!(syncer.sync(&options, &None).await?.file_count, 3);

        Ok(())
    }

    #[tokio::test]
    async fn tampered_index_fails_only_its_component() -> Result<()> {
        let signer = TestSigner::shared();
        let mut packages = packages();
        let universe = TestPackage::new("uu", "amd64", b"universe package").in_component("universe");
        packages.push(universe.clone());

        let repo = TestRepository::build("noble", &packages, Signing::InRelease(signer))?;
        let tampered = "dists/noble/universe/binary-amd64/Packages.gz";
        let mut data = std::fs::read(repo.path(tampered))?;
        data[12] ^= 0xff;
        std::fs::write(repo.path(tampered), data)?;

        let td = tempfile::tempdir()?;
        let mut descriptor = descriptor("ubuntu", &repo);
        descriptor.components.push("universe".into());
        let source = Arc::new(FilesystemRepositorySource::new(repo.root())?);
        let syncer = MirrorSyncer::new(
            td.path(),
            descriptor,
            source,
            Some(signer.keyring()),
            transfer_manager(),
        )?;

        match syncer.sync(&no_snapshot(), &None).await {
            Err(MirrorError::SyncFailed { failures, .. }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].path, tampered);
                assert_eq!(failures[0].error.kind(), ErrorKind::Integrity);
            }
            other => panic!("expected sync failure, got {:?}", other.map(|r| r.mirror)),
        }

        for package in &packages[0..3] {
            assert!(syncer.store().has(&sha256(&package.content)));
        }
        assert!(!syncer.store().has(&sha256(&universe.content)));
        assert!(!td.path().join("ubuntu/state/files.json").exists());

        Ok(())
    }

    #[tokio::test]
    async fn detached_signature_and_dry_run() -> Result<()> {
        let signer = TestSigner::shared();
        let repo = TestRepository::build("noble", &packages(), Signing::Detached(signer))?;
        let td = tempfile::tempdir()?;
        let syncer = syncer(td.path(), &repo, Some(signer.keyring()))?;

        let options = SyncOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = syncer.sync(&options, &None).await?;

        let expected_bytes = packages().iter().map(|p| p.content.len() as u64).sum::<u64>();
        assert_eq!(report.pending, Some((3, expected_bytes)));
        assert_eq!(report.index_count, 3);
        assert!(report.snapshot.is_none());
        assert_eq!(stored_files(syncer.store()), 0);
        assert!(!td.path().join("ubuntu/state/files.json").exists());

        let report = syncer.sync(&no_snapshot(), &None).await?;
        // Release and Release.gpg plus Packages.gz.
        assert_eq!(report.index_count, 3);

        Ok(())
    }

    #[tokio::test]
    async fn upstream_change_produces_new_snapshot_content() -> Result<()> {
        let signer = TestSigner::shared();
        let repo = TestRepository::build("noble", &packages(), Signing::InRelease(signer))?;
        let td = tempfile::tempdir()?;
        let syncer = syncer(td.path(), &repo, Some(signer.keyring()))?;

        let options = SyncOptions {
            snapshot_name: Some("before".into()),
            ..Default::default()
        };
        syncer.sync(&options, &None).await?;

        let mut updated = packages();
        updated.push(TestPackage::new("extra", "amd64", b"a new package"));
        repo.write_suite("noble", &updated, Signing::InRelease(signer))?;

        let options = SyncOptions {
            snapshot_name: Some("after".into()),
            ..Default::default()
        };
        let report = syncer.sync(&options, &None).await?;
        // Only the new package and the changed metadata are fetched.
        assert_eq!(report.transfers.downloaded_files, 2);

        let manager = SnapshotManager::new(td.path());
        assert_eq!(manager.show("ubuntu", "before")?.file_count, 3);
        assert_eq!(manager.show("ubuntu", "after")?.file_count, 4);

        Ok(())
    }

    /// Serves metadata normally but stalls package downloads partway through.
    struct StallingSource {
        inner: FilesystemRepositorySource,
    }

    struct Stall;

    impl AsyncRead for Stall {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }
    }

    #[async_trait]
    impl RepositorySource for StallingSource {
        fn url(&self) -> &Url {
            self.inner.url()
        }

        async fn get_path(&self, path: &str) -> Result<Pin<Box<dyn AsyncBufRead + Send>>> {
            if !path.starts_with("pool/") {
                return self.inner.get_path(path).await;
            }

            let data = self.inner.get_path_bytes(path).await?;
            let head = data[0..data.len() / 2].to_vec();

            Ok(Box::pin(futures::io::BufReader::new(
                futures::io::Cursor::new(head).chain(Stall),
            )))
        }
    }

    fn count_temp_files(root: &Path, mirror: &str) -> usize {
        std::fs::read_dir(root.join(mirror).join("store/.tmp"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn cancellation_and_timeout() -> Result<()> {
        let signer = TestSigner::shared();
        let repo = TestRepository::build("noble", &packages(), Signing::InRelease(signer))?;
        let td = tempfile::tempdir()?;

        let source = Arc::new(StallingSource {
            inner: FilesystemRepositorySource::new(repo.root())?,
        });
        let syncers = vec![syncer_with_source(
            td.path(),
            "ubuntu",
            &repo,
            source,
            Some(signer.keyring()),
        )?];

        let res = sync_mirrors(
            &syncers,
            &SyncOptions::default(),
            Some(Duration::from_millis(200)),
            None,
            &None,
        )
        .await;
        assert!(matches!(res, Err(MirrorError::Cancelled(_))));
        assert_eq!(count_temp_files(td.path(), "ubuntu"), 0);

        let (handle, registration) = AbortHandle::new_pair();
        let aborter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.abort();
        });

        let res = sync_mirrors(&syncers, &SyncOptions::default(), None, Some(registration), &None).await;
        aborter.await.unwrap();
        assert!(matches!(res, Err(MirrorError::Cancelled(_))));
        assert_eq!(count_temp_files(td.path(), "ubuntu"), 0);

        // Metadata committed before cancellation stays valid; no snapshot was made.
        assert!(SnapshotManager::new(td.path()).list("ubuntu")?.is_empty());
        assert_eq!(
            PublishController::new(td.path()).status("ubuntu")?,
            PublishState::default()
        );

        Ok(())
    }

    #[tokio::test]
    async fn mirrors_fail_independently() -> Result<()> {
        let signer = TestSigner::shared();
        let good = TestRepository::build("noble", &packages(), Signing::InRelease(signer))?;
        let bad = TestRepository::build(
            "noble",
            &packages(),
            Signing::InRelease(TestSigner::other()),
        )?;
        let td = tempfile::tempdir()?;

        let syncers = vec![
            syncer_with_source(
                td.path(),
                "good",
                &good,
                Arc::new(FilesystemRepositorySource::new(good.root())?),
                Some(signer.keyring()),
            )?,
            syncer_with_source(
                td.path(),
                "bad",
                &bad,
                Arc::new(FilesystemRepositorySource::new(bad.root())?),
                Some(signer.keyring()),
            )?,
        ];

        let events = Arc::new(std::sync::Mutex::new(vec![]));
        let cb_events = events.clone();
        let cb: Option<Box<dyn Fn(MirrorEvent) + Sync>> = Some(Box::new(move |event| {
            if let MirrorEvent::SyncFinished(mirror) = event {
                cb_events.lock().unwrap().push(mirror);
            }
        }));

        let results = sync_mirrors(&syncers, &SyncOptions::default(), None, None, &cb).await?;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "good");
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].0, "bad");
        assert!(matches!(results[1].1, Err(MirrorError::SyncFailed { .. })));

        assert_eq!(*events.lock().unwrap(), vec!["good".to_string()]);
        assert_eq!(SnapshotManager::new(td.path()).list("good")?.len(), 1);
        assert!(SnapshotManager::new(td.path()).list("bad")?.is_empty());

        Ok(())
    }
}
