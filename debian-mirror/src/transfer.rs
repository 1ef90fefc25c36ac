// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Bounded concurrency downloads into a content store.

The [TransferManager] makes sure the blob for every requested [FileDescriptor] is
in a [ContentStore]. Connections are bounded per upstream host and optionally
globally by a [ConnectionLimiter] shared by every mirror of an invocation.
Transient failures and digest mismatches are retried with exponential backoff.
*/

use {
    crate::{
        error::{FileFailure, MirrorError, Result},
        io::MultiDigester,
        packages::FileDescriptor,
        source::RepositorySource,
        store::{verify_digests, CommitOutcome, ContentStore},
        sync::MirrorEvent,
    },
    backoff::ExponentialBackoffBuilder,
    futures::{AsyncReadExt, StreamExt},
    log::{debug, warn},
    std::{
        collections::HashMap,
        future::Future,
        sync::{Arc, Mutex},
        time::Duration,
    },
    tokio::sync::{OwnedSemaphorePermit, Semaphore},
};

const CHUNK_SIZE: usize = 65536;

/// How failed operations are retried.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Attempts made after the first one.
    pub retries: usize,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Run an operation, retrying errors that are [MirrorError::is_retryable()].
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build();

        let retries = self.retries;
        let mut attempt = 0;

        backoff::future::retry(backoff, || {
            attempt += 1;
            let attempt = attempt;
            let fut = operation();

            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && attempt <= retries => {
                        warn!("{} (attempt {}/{}): {}; retrying", what, attempt, retries + 1, e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }
}

/// Connection slots held for one request.
pub struct ConnectionPermit {
    _host: OwnedSemaphorePermit,
    _global: Option<OwnedSemaphorePermit>,
}

/// Bounds concurrent connections per upstream host and overall.
#[derive(Debug)]
pub struct ConnectionLimiter {
    global: Option<Arc<Semaphore>>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConnectionLimiter {
    /// Construct an instance with an optional global cap.
    pub fn new(global: Option<usize>) -> Self {
        Self {
            global: global.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn host_semaphore(&self, host: &str, limit: usize) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());

        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1))))
            .clone()
    }

    /// Wait for a connection slot to `host`.
    ///
    /// The first caller for a host fixes that host's limit.
    pub async fn acquire(&self, host: &str, limit: usize) -> Result<ConnectionPermit> {
        let cancelled = |_| MirrorError::Cancelled("connection limiter closed".into());

        // Host first so a saturated host does not pin global slots.
        let host_permit = self
            .host_semaphore(host, limit)
            .acquire_owned()
            .await
            .map_err(cancelled)?;

        let global_permit = match &self.global {
            Some(global) => Some(global.clone().acquire_owned().await.map_err(cancelled)?),
            None => None,
        };

        Ok(ConnectionPermit {
            _host: host_permit,
            _global: global_permit,
        })
    }
}

/// A file to transfer.
#[derive(Clone, Debug)]
pub struct TransferItem {
    pub descriptor: FileDescriptor,

    /// Whether upstream may legitimately lack the file.
    pub optional: bool,
}

impl TransferItem {
    pub fn required(descriptor: FileDescriptor) -> Self {
        Self {
            descriptor,
            optional: false,
        }
    }

    pub fn optional(descriptor: FileDescriptor) -> Self {
        Self {
            descriptor,
            optional: true,
        }
    }
}

/// Summary of a batch of transfers.
#[derive(Debug, Default)]
pub struct TransferReport {
    /// Files fetched from upstream.
    pub downloaded_files: usize,
    /// Bytes fetched from upstream.
    pub downloaded_bytes: u64,
    /// Files whose blob was already stored.
    pub already_present: usize,
    /// Optional files upstream does not serve.
    pub missing_optional: Vec<String>,
    /// Files that could not be transferred.
    pub failures: Vec<FileFailure>,
}

impl TransferReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: TransferReport) {
        self.downloaded_files += other.downloaded_files;
        self.downloaded_bytes += other.downloaded_bytes;
        self.already_present += other.already_present;
        self.missing_optional.extend(other.missing_optional);
        self.failures.extend(other.failures);
    }
}

enum FetchOutcome {
    Downloaded(u64),
    AlreadyPresent,
}

/// Downloads files into a [ContentStore].
#[derive(Clone)]
pub struct TransferManager {
    limiter: Arc<ConnectionLimiter>,
    max_connections_per_host: usize,
    retry: RetryPolicy,
}

impl TransferManager {
    pub fn new(
        limiter: Arc<ConnectionLimiter>,
        max_connections_per_host: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            limiter,
            max_connections_per_host: max_connections_per_host.max(1),
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Count and size the descriptors whose blobs are absent. Performs no transfers.
    pub fn missing<'a>(
        &self,
        store: &ContentStore,
        descriptors: impl Iterator<Item = &'a FileDescriptor>,
    ) -> (usize, u64) {
        descriptors
            .filter(|d| !store.has(&d.digest))
            .fold((0, 0), |(count, bytes), d| (count + 1, bytes + d.size))
    }

    /// Download a file into memory, verified the same way as a stored transfer.
    ///
    /// Nothing is written to a content store.
    pub async fn fetch_bytes(
        &self,
        source: &dyn RepositorySource,
        descriptor: &FileDescriptor,
    ) -> Result<Vec<u8>> {
        self.retry
            .run(&descriptor.path, || async move {
                let _permit = self
                    .limiter
                    .acquire(&source.host_key(), self.max_connections_per_host)
                    .await?;

                let data = match &descriptor.by_hash_path {
                    Some(by_hash) => match source.get_path_bytes(by_hash).await {
                        Err(MirrorError::MissingUpstreamFile { .. }) => {
                            source.get_path_bytes(&descriptor.path).await?
                        }
                        res => res?,
                    },
                    None => source.get_path_bytes(&descriptor.path).await?,
                };

                if data.len() as u64 != descriptor.size {
                    return Err(MirrorError::Integrity {
                        path: descriptor.path.clone(),
                        message: format!(
                            "size mismatch: expected {}, got {}",
                            descriptor.size,
                            data.len()
                        ),
                    });
                }

                let mut digester = MultiDigester::default();
                digester.update(&data);
                verify_digests(
                    &descriptor.path,
                    &digester.finish(),
                    &descriptor.digest,
                    descriptor.legacy_digest.as_ref(),
                )?;

                Ok(data)
            })
            .await
    }

    async fn attempt(
        &self,
        source: &dyn RepositorySource,
        store: &ContentStore,
        descriptor: &FileDescriptor,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> Result<FetchOutcome> {
        let _permit = self
            .limiter
            .acquire(&source.host_key(), self.max_connections_per_host)
            .await?;

        // Another mirror sharing the store may have finished it meanwhile.
        if store.has(&descriptor.digest) {
            return Ok(FetchOutcome::AlreadyPresent);
        }

        let (fetch_path, mut reader) = match &descriptor.by_hash_path {
            Some(by_hash) => match source.get_path(by_hash).await {
                Ok(reader) => (by_hash.as_str(), reader),
                Err(MirrorError::MissingUpstreamFile { .. }) => {
                    debug!("{} not served; falling back to {}", by_hash, descriptor.path);
                    (descriptor.path.as_str(), source.get_path(&descriptor.path).await?)
                }
                Err(e) => return Err(e),
            },
            None => (descriptor.path.as_str(), source.get_path(&descriptor.path).await?),
        };

        let mut writer = store.open_for_write(
            &descriptor.path,
            &descriptor.digest,
            descriptor.size,
            descriptor.legacy_digest.as_ref(),
        )?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let count = reader.read(&mut buf).await.map_err(|e| MirrorError::Transport {
                url: source
                    .url()
                    .join(fetch_path)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| fetch_path.to_string()),
                message: format!("error reading body: {}", e),
            })?;

            if count == 0 {
                break;
            }

            writer.write_chunk(&buf[0..count])?;

            if let Some(cb) = progress_cb {
                cb(MirrorEvent::BytesTransferred(count as u64));
            }
        }

        Ok(match writer.commit()? {
            CommitOutcome::Stored => FetchOutcome::Downloaded(descriptor.size),
            CommitOutcome::AlreadyPresent => FetchOutcome::AlreadyPresent,
        })
    }

    async fn fetch_one(
        &self,
        source: &dyn RepositorySource,
        store: &ContentStore,
        descriptor: &FileDescriptor,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> Result<FetchOutcome> {
        if store.has(&descriptor.digest) {
            return Ok(FetchOutcome::AlreadyPresent);
        }

        self.retry
            .run(&descriptor.path, || {
                self.attempt(source, store, descriptor, progress_cb)
            })
            .await
    }

    /// Transfer a batch of files.
    ///
    /// Per-file failures are collected in the report and do not stop other transfers.
    pub async fn transfer(
        &self,
        source: &dyn RepositorySource,
        store: &ContentStore,
        items: Vec<TransferItem>,
        progress_cb: &Option<Box<dyn Fn(MirrorEvent) + Sync>>,
    ) -> TransferReport {
        let mut report = TransferReport::default();

        if let Some(cb) = progress_cb {
            let (count, bytes) = self.missing(store, items.iter().map(|i| &i.descriptor));
            cb(MirrorEvent::TransferBegin(count, bytes));
        }

        let fs = items.into_iter().map(|item| async move {
            let res = self
                .fetch_one(source, store, &item.descriptor, progress_cb)
                .await;
            (item, res)
        });

        let mut buffered =
            futures::stream::iter(fs).buffer_unordered(self.max_connections_per_host);

        while let Some((item, res)) = buffered.next().await {
            let path = item.descriptor.path;

            match res {
                Ok(FetchOutcome::Downloaded(size)) => {
                    report.downloaded_files += 1;
                    report.downloaded_bytes += size;

                    if let Some(cb) = progress_cb {
                        cb(MirrorEvent::FileDownloaded(path, size));
                    }
                }
                Ok(FetchOutcome::AlreadyPresent) => {
                    report.already_present += 1;

                    if let Some(cb) = progress_cb {
                        cb(MirrorEvent::FilePresent(path));
                    }
                }
                Err(MirrorError::MissingUpstreamFile { .. }) if item.optional => {
                    if let Some(cb) = progress_cb {
                        cb(MirrorEvent::OptionalFileMissing(path.clone()));
                    }
                    report.missing_optional.push(path);
                }
                Err(error) => {
                    warn!("failed to mirror {}: {}", path, error);

                    if let Some(cb) = progress_cb {
                        cb(MirrorEvent::FileFailed(path.clone(), error.to_string()));
                    }
                    report.failures.push(FileFailure { path, error });
                }
            }
        }

        if let Some(cb) = progress_cb {
            cb(MirrorEvent::TransferFinished);
        }

        report
    }
}
