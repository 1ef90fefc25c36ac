// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian repository mirroring with content-addressed snapshots.

This crate mirrors Debian-style APT repositories to local disk and manages
point-in-time snapshots of those mirrors that can be staged and published
atomically.

# A Tour of Functionality

A mirror is described by a [mirror::MirrorDescriptor]: an upstream URL plus the
suites, components and architectures to mirror. Its on-disk state is located
through [mirror::MirrorLayout].

Upstream repositories are accessed through the [source::RepositorySource] trait.
[http::HttpRepositorySource] speaks HTTP(S) with a TLS policy described by
[http::TlsPolicy]; [source::FilesystemRepositorySource] reads local directories.

Syncing is driven by [sync::MirrorSyncer]:

* [fetcher::IndexFetcher] retrieves the `InRelease` (or `Release` and
  `Release.gpg`) manifest of a suite and verifies it against a
  [keyring::Keyring]. [release::ReleaseManifest] parses it and selects the
  index files to mirror.
* [packages] turns `Packages` and `Sources` indices, read with the control file
  primitives in [control], into [packages::FileDescriptor]s.
* [transfer::TransferManager] downloads whatever the [store::ContentStore] lacks
  with bounded, retried, checksum verified transfers.

Snapshots are hard linked trees built from the content store by
[snapshot::SnapshotManager]. [publish::PublishController] points the `staging`
and `production` slots of a mirror at snapshots.

# On-disk Layout

```text
<root>/<mirror>/store/<algo>/<xx>/<rest>   content blobs
<root>/<mirror>/state/files.json           file set of the last sync
<root>/<mirror>/snapshots/<name>/          snapshot trees
<root>/<mirror>/snapshots/staging          publish pointer
<root>/<mirror>/snapshots/production       publish pointer
```
*/

pub mod control;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod io;
pub mod keyring;
pub mod mirror;
pub mod packages;
pub mod publish;
pub mod release;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod sync;
#[cfg(test)]
mod testutil;
pub mod transfer;
