// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! HTTP(S) upstream access.

The HTTP client is built from an [HttpClientConfig], which carries the TLS
client policy. The policy is turned into a [rustls::ClientConfig]: configured
cipher suites are offered in the configured order, and only protocol versions
at or above the minimum are enabled.
*/

use {
    crate::{
        error::{MirrorError, Result},
        mirror::HumanDuration,
        source::RepositorySource,
    },
    async_trait::async_trait,
    futures::{stream::TryStreamExt, AsyncBufRead},
    reqwest::{Client, StatusCode},
    rustls::{RootCertStore, SupportedCipherSuite, SupportedProtocolVersion},
    serde::{Deserialize, Serialize},
    std::{path::PathBuf, pin::Pin},
    url::Url,
};

/// Minimum TLS protocol version.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl Default for TlsVersion {
    fn default() -> Self {
        Self::Tls12
    }
}

static TLS12_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

impl TlsVersion {
    fn protocol_versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12 => TLS12_VERSIONS,
            Self::Tls13 => TLS13_VERSIONS,
        }
    }
}

/// TLS client policy.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TlsPolicy {
    /// Minimum protocol version.
    #[serde(default)]
    pub min_version: TlsVersion,

    /// Preferred cipher suites, by IANA/rustls name, most preferred first.
    ///
    /// Empty means the rustls defaults.
    #[serde(default)]
    pub cipher_suites: Vec<String>,

    /// PEM bundle of additional trusted CA certificates.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,

    /// Whole request timeout.
    #[serde(default)]
    pub timeout: Option<HumanDuration>,

    /// Connection establishment timeout.
    #[serde(default)]
    pub connect_timeout: Option<HumanDuration>,
}

fn tls_error(message: String) -> MirrorError {
    MirrorError::InvalidMirror {
        mirror: "<tls>".into(),
        message,
    }
}

fn cipher_suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

impl TlsPolicy {
    /// Resolve the configured cipher suite names, preserving their order.
    pub fn resolve_cipher_suites(&self) -> Result<Vec<SupportedCipherSuite>> {
        if self.cipher_suites.is_empty() {
            return Ok(rustls::DEFAULT_CIPHER_SUITES.to_vec());
        }

        self.cipher_suites
            .iter()
            .map(|name| {
                let suite = rustls::ALL_CIPHER_SUITES
                    .iter()
                    .find(|s| &cipher_suite_name(s) == name)
                    .copied()
                    .ok_or_else(|| tls_error(format!("unsupported cipher suite: {}", name)))?;

                if self.min_version == TlsVersion::Tls13
                    && !matches!(suite, SupportedCipherSuite::Tls13(_))
                {
                    return Err(tls_error(format!(
                        "cipher suite {} is unusable with TLS 1.3 only",
                        name
                    )));
                }

                Ok(suite)
            })
            .collect()
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        if let Some(path) = &self.ca_bundle {
            let pem = std::fs::read(path).map_err(|e| MirrorError::io_path(path, e))?;
            let certs = rustls_pemfile::certs(&mut pem.as_slice())
                .map_err(|e| MirrorError::io_path(path, e))?;

            if certs.is_empty() {
                return Err(tls_error(format!(
                    "no certificates found in {}",
                    path.display()
                )));
            }

            for cert in certs {
                roots.add(&rustls::Certificate(cert)).map_err(|e| {
                    tls_error(format!("bad certificate in {}: {:?}", path.display(), e))
                })?;
            }
        }

        Ok(roots)
    }

    /// Build the rustls client configuration for this policy.
    pub fn client_config(&self) -> Result<rustls::ClientConfig> {
        let suites = self.resolve_cipher_suites()?;

        Ok(rustls::ClientConfig::builder()
            .with_cipher_suites(&suites)
            .with_safe_default_kx_groups()
            .with_protocol_versions(self.min_version.protocol_versions())
            .map_err(|e| tls_error(format!("unusable TLS policy: {}", e)))?
            .with_root_certificates(self.root_store()?)
            .with_no_client_auth())
    }
}

/// Settings for building the HTTP client.
#[derive(Clone, Debug, Default)]
pub struct HttpClientConfig {
    pub tls: TlsPolicy,
    pub user_agent: Option<String>,
}

impl HttpClientConfig {
    /// Validate the policy without building a client.
    pub fn validate(&self) -> Result<()> {
        self.tls.resolve_cipher_suites()?;

        Ok(())
    }

    /// Build a [Client] honoring this configuration.
    pub fn build_client(&self) -> Result<Client> {
        let mut builder = Client::builder()
            .use_preconfigured_tls(self.tls.client_config()?)
            .user_agent(
                self.user_agent
                    .clone()
                    .unwrap_or_else(|| format!("debian-mirror/{}", env!("CARGO_PKG_VERSION"))),
            );

        if let Some(timeout) = self.tls.timeout {
            builder = builder.timeout(timeout.to_std());
        }
        if let Some(timeout) = self.tls.connect_timeout {
            builder = builder.connect_timeout(timeout.to_std());
        }

        Ok(builder.build()?)
    }
}

/// Map an unsuccessful response status to an error.
///
/// Timeouts, throttling and server errors are transient. Other client errors mean
/// the file is not available to us.
fn classify_status(url: &Url, status: StatusCode) -> MirrorError {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => MirrorError::Transport {
            url: url.to_string(),
            message: format!("HTTP {}", status),
        },
        s if s.is_client_error() => MirrorError::MissingUpstreamFile {
            url: url.to_string(),
            reason: format!("HTTP {}", status),
        },
        _ => MirrorError::Transport {
            url: url.to_string(),
            message: format!("HTTP {}", status),
        },
    }
}

async fn fetch_url(client: &Client, root_url: &Url, path: &str) -> Result<Pin<Box<dyn AsyncBufRead + Send>>> {
    let url = root_url.join(path)?;

    let res = client.get(url.clone()).send().await.map_err(|e| MirrorError::Transport {
        url: url.to_string(),
        message: if e.is_timeout() {
            "request timed out".to_string()
        } else if e.is_connect() {
            format!("connection failed: {}", e)
        } else {
            format!("error sending HTTP request: {}", e)
        },
    })?;

    if !res.status().is_success() {
        return Err(classify_status(&url, res.status()));
    }

    Ok(Box::pin(
        res.bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", e)))
            .into_async_read(),
    ))
}

/// A repository served over HTTP(S).
///
/// Instances are bound to the base URL, which holds `dists/` and `pool/`.
#[derive(Debug)]
pub struct HttpRepositorySource {
    client: Client,
    root_url: Url,
}

impl HttpRepositorySource {
    /// Construct an instance using the given [Client] and URL.
    pub fn new(client: Client, url: Url) -> Result<Self> {
        let mut root_url = url;

        // Trailing URLs are significant to the Url type when we .join(). So ensure
        // the URL has a trailing path.
        if !root_url.path().ends_with('/') {
            root_url.set_path(&format!("{}/", root_url.path()));
        }

        Ok(Self { client, root_url })
    }
}

#[async_trait]
impl RepositorySource for HttpRepositorySource {
    fn url(&self) -> &Url {
        &self.root_url
    }

    async fn get_path(&self, path: &str) -> Result<Pin<Box<dyn AsyncBufRead + Send>>> {
        fetch_url(&self.client, &self.root_url, path.trim_start_matches('/')).await
    }
}
