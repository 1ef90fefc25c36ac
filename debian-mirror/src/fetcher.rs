// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Retrieval and authentication of release manifests. */

use {
    crate::{
        error::{MirrorError, Result},
        keyring::{parse_detached_signatures, CleartextDocument, Keyring},
        release::ReleaseManifest,
        source::RepositorySource,
        transfer::RetryPolicy,
    },
    chrono::Utc,
    log::{info, warn},
};

/// A release manifest and the raw files it was read from.
pub struct FetchedRelease {
    pub manifest: ReleaseManifest,

    /// `(repository path, content)` of the fetched manifest files.
    pub raw: Vec<(String, Vec<u8>)>,

    /// Whether a signature was verified.
    pub verified: bool,
}

/// Fetches and verifies the release manifest of suites.
pub struct IndexFetcher<'a> {
    source: &'a dyn RepositorySource,
    keyring: Option<&'a Keyring>,
    retry: RetryPolicy,
}

impl<'a> IndexFetcher<'a> {
    pub fn new(
        source: &'a dyn RepositorySource,
        keyring: Option<&'a Keyring>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            keyring,
            retry,
        }
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.retry
            .run(path, || self.source.get_path_bytes(path))
            .await
    }

    async fn get_optional(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.get(path).await {
            Ok(data) => Ok(Some(data)),
            Err(MirrorError::MissingUpstreamFile { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn keyring(&self, path: &str) -> Result<&'a Keyring> {
        self.keyring.ok_or_else(|| MirrorError::Authentication {
            path: path.to_string(),
            message: "no trusted keyring configured".into(),
        })
    }

    /// Fetch the manifest of a suite.
    ///
    /// `InRelease` is preferred. When upstream lacks it, `Release` and its detached
    /// `Release.gpg` signature are used instead. No files are written.
    pub async fn fetch(&self, suite: &str, verify: bool) -> Result<FetchedRelease> {
        let inrelease_path = format!("dists/{}/InRelease", suite);
        let release_path = format!("dists/{}/Release", suite);
        let signature_path = format!("dists/{}/Release.gpg", suite);

        let mut raw = vec![];

        let text = if let Some(data) = self.get_optional(&inrelease_path).await? {
            let document = CleartextDocument::parse(&data, &inrelease_path)?;

            if verify {
                let valid = document.verify(self.keyring(&inrelease_path)?, &inrelease_path)?;
                info!("{}: {} valid signature(s)", inrelease_path, valid);
            }

            let text = document.text().to_string();
            raw.push((inrelease_path, data));

            // Mirror the other variants too when present so clients of any
            // vintage find their preferred file.
            for path in [release_path, signature_path] {
                if let Some(data) = self.get_optional(&path).await? {
                    raw.push((path, data));
                }
            }

            text
        } else {
            let release = self.get(&release_path).await?;
            let signature = self.get_optional(&signature_path).await?;

            if verify {
                let signature = signature.as_ref().ok_or_else(|| MirrorError::Authentication {
                    path: release_path.clone(),
                    message: "neither InRelease nor Release.gpg is available".into(),
                })?;

                let signatures = parse_detached_signatures(signature, &signature_path)?;
                let valid = self
                    .keyring(&release_path)?
                    .verify(&signatures, &release, &release_path)?;
                info!("{}: {} valid signature(s)", signature_path, valid);
            }

            let text = String::from_utf8(release.clone()).map_err(|_| MirrorError::Parse {
                path: release_path.clone(),
                message: "manifest is not UTF-8".into(),
            })?;

            raw.push((release_path, release));
            if let Some(signature) = signature {
                raw.push((signature_path, signature));
            }

            text
        };

        let manifest = ReleaseManifest::parse(suite, &text)?;

        if verify {
            manifest.check_valid_until(Utc::now())?;
        }

        if manifest.suite_field() != Some(suite) && manifest.codename() != Some(suite) {
            warn!(
                "manifest for {} declares suite {:?} and codename {:?}",
                suite,
                manifest.suite_field(),
                manifest.codename()
            );
        }

        Ok(FetchedRelease {
            manifest,
            raw,
            verified: verify,
        })
    }
}
