// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Upstream repository access.

A [RepositorySource] resolves repository relative paths to byte streams. There are
implementations for HTTP(S) servers ([crate::http::HttpRepositorySource]) and
local directories ([FilesystemRepositorySource]).
*/

use {
    crate::{
        error::{MirrorError, Result},
        http::{HttpClientConfig, HttpRepositorySource},
    },
    async_trait::async_trait,
    futures::{io::BufReader, AsyncBufRead, AsyncReadExt},
    std::{
        path::{Path, PathBuf},
        pin::Pin,
        sync::Arc,
    },
    url::Url,
};

/// Read access to an upstream repository.
#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// The base URL of the repository.
    fn url(&self) -> &Url;

    /// Key identifying the upstream host for connection accounting.
    fn host_key(&self) -> String {
        match (self.url().host_str(), self.url().port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => self.url().scheme().to_string(),
        }
    }

    /// Obtain a reader of a repository relative path.
    ///
    /// A path the upstream does not serve yields [MirrorError::MissingUpstreamFile].
    async fn get_path(&self, path: &str) -> Result<Pin<Box<dyn AsyncBufRead + Send>>>;

    /// Read a repository relative path into memory.
    async fn get_path_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let mut reader = self.get_path(path).await?;
        let mut data = vec![];

        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| MirrorError::Transport {
                url: self.url().join(path).map(|u| u.to_string()).unwrap_or_else(|_| path.to_string()),
                message: format!("error reading response: {}", e),
            })?;

        Ok(data)
    }
}

/// A repository in a local directory.
#[derive(Clone, Debug)]
pub struct FilesystemRepositorySource {
    root_dir: PathBuf,
    url: Url,
}

impl FilesystemRepositorySource {
    /// Construct an instance bound to a directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();

        let absolute = if root_dir.is_absolute() {
            root_dir.clone()
        } else {
            std::env::current_dir()
                .map_err(|e| MirrorError::io_path(&root_dir, e))?
                .join(&root_dir)
        };

        let url = Url::from_directory_path(&absolute).map_err(|_| MirrorError::InvalidMirror {
            mirror: format!("{}", root_dir.display()),
            message: "could not convert path to a URL".into(),
        })?;

        Ok(Self { root_dir, url })
    }
}

#[async_trait]
impl RepositorySource for FilesystemRepositorySource {
    fn url(&self) -> &Url {
        &self.url
    }

    fn host_key(&self) -> String {
        "file".to_string()
    }

    async fn get_path(&self, path: &str) -> Result<Pin<Box<dyn AsyncBufRead + Send>>> {
        let full_path = self.root_dir.join(path.trim_start_matches('/'));

        let f = std::fs::File::open(&full_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MirrorError::MissingUpstreamFile {
                    url: format!("{}", full_path.display()),
                    reason: "no such file".into(),
                }
            } else {
                MirrorError::io_path(&full_path, e)
            }
        })?;

        Ok(Box::pin(BufReader::new(futures::io::AllowStdIo::new(f))))
    }
}

/// Construct a [RepositorySource] from a URL or filesystem path.
///
/// `http://` and `https://` URLs go through an HTTP client built from `http_config`.
/// `file://` URLs and strings without a scheme are local directories.
pub fn source_from_url(
    value: &str,
    http_config: &HttpClientConfig,
) -> Result<Arc<dyn RepositorySource>> {
    if value.contains("://") {
        let url = Url::parse(value)?;

        match url.scheme() {
            "file" => {
                let path = url.to_file_path().map_err(|_| MirrorError::InvalidMirror {
                    mirror: value.to_string(),
                    message: "file URL does not name a local path".into(),
                })?;

                Ok(Arc::new(FilesystemRepositorySource::new(path)?))
            }
            "http" | "https" => Ok(Arc::new(HttpRepositorySource::new(
                http_config.build_client()?,
                url,
            )?)),
            scheme => Err(MirrorError::InvalidMirror {
                mirror: value.to_string(),
                message: format!("unsupported URL scheme: {}", scheme),
            }),
        }
    } else {
        Ok(Arc::new(FilesystemRepositorySource::new(value)?))
    }
}
