// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::cli::{DmtError, Result},
    debian_mirror::{
        error::MirrorError,
        http::{HttpClientConfig, TlsPolicy},
        mirror::{HumanDuration, MirrorDescriptor, RetentionPolicy},
        transfer::RetryPolicy,
    },
    serde::Deserialize,
    std::{
        collections::HashSet,
        path::{Path, PathBuf},
    },
};

/// Top-level YAML configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the state of all mirrors.
    pub root: PathBuf,

    /// Cap on concurrent connections across all mirrors of an invocation.
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Cap on concurrent connections to one upstream host.
    #[serde(default)]
    pub max_connections_per_host: Option<usize>,

    /// Retries after a failed transfer attempt.
    #[serde(default)]
    pub retries: Option<usize>,

    /// Deadline for a whole sync invocation.
    #[serde(default)]
    pub timeout: Option<HumanDuration>,

    /// Default retention policy for mirrors without their own.
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,

    /// Trusted keyring for mirrors without their own.
    #[serde(default)]
    pub keyring: Option<PathBuf>,

    #[serde(default)]
    pub tls: TlsPolicy,

    pub mirrors: Vec<MirrorDescriptor>,
}

fn resolve_relative(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl Config {
    /// Parse and validate configuration from YAML.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a file.
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn from_path(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&yaml)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        resolve_relative(base, &mut config.root);
        if let Some(keyring) = config.keyring.as_mut() {
            resolve_relative(base, keyring);
        }
        if let Some(ca_bundle) = config.tls.ca_bundle.as_mut() {
            resolve_relative(base, ca_bundle);
        }
        for mirror in config.mirrors.iter_mut() {
            if let Some(keyring) = mirror.keyring.as_mut() {
                resolve_relative(base, keyring);
            }
        }

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for mirror in &self.mirrors {
            mirror.validate()?;

            if !seen.insert(mirror.id.as_str()) {
                return Err(DmtError::Config(format!("mirror {} is defined twice", mirror.id)));
            }
        }

        if self.max_connections == Some(0) || self.max_connections_per_host == Some(0) {
            return Err(DmtError::Config("connection limits must be positive".into()));
        }

        self.http_config().validate()?;

        Ok(())
    }

    /// Obtain a mirror by ID.
    pub fn mirror(&self, id: &str) -> Result<&MirrorDescriptor> {
        self.mirrors
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| {
                MirrorError::NotFound {
                    what: "mirror",
                    name: id.to_string(),
                }
                .into()
            })
    }

    /// Resolve mirror IDs to descriptors. No IDs selects every mirror.
    pub fn select<'a>(&self, ids: impl Iterator<Item = &'a str>) -> Result<Vec<&MirrorDescriptor>> {
        let selected = ids.map(|id| self.mirror(id)).collect::<Result<Vec<_>>>()?;

        Ok(if selected.is_empty() {
            self.mirrors.iter().collect()
        } else {
            selected
        })
    }

    /// The keyring trusted for a mirror.
    pub fn keyring_for<'a>(&'a self, mirror: &'a MirrorDescriptor) -> Option<&'a Path> {
        mirror.keyring.as_deref().or_else(|| self.keyring.as_deref())
    }

    /// The connection cap for a mirror's upstream host.
    pub fn connections_per_host(&self, mirror: &MirrorDescriptor) -> usize {
        mirror
            .max_connections_per_host
            .or(self.max_connections_per_host)
            .unwrap_or_else(num_cpus::get)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Some(retries) = self.retries {
            policy.retries = retries;
        }

        policy
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            tls: self.tls.clone(),
            user_agent: None,
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    const CONFIG: &str = indoc! {"
        root: /srv/mirrors
        max_connections: 16
        retries: 5
        timeout: 2h
        retention:
          keep_last: 10
          keep_within: 30d
        keyring: keys/ubuntu-archive.gpg
        tls:
          min_version: '1.3'
          cipher_suites:
            - TLS13_AES_256_GCM_SHA384
          timeout: 5m
        mirrors:
          - id: ubuntu
            url: http://archive.ubuntu.com/ubuntu
            suites: [noble, noble-updates]
            sections: [main, universe]
            architectures: [amd64]
            snapshot_naming: date
            max_connections_per_host: 4
          - id: debian-security
            url: https://security.debian.org/debian-security
            suites: [bookworm-security]
            components: [main]
            architectures: [amd64, arm64]
            sources: true
            keyring: /etc/apt/trusted.gpg.d/debian.gpg
            retention:
              keep_last: 3
    "};

    #[test]
    fn parse_config() -> Result<()> {
        let config = Config::parse(CONFIG)?;

        assert_eq!(config.root, PathBuf::from("/srv/mirrors"));
        assert_eq!(config.max_connections, Some(16));
        assert_eq!(config.retry_policy().retries, 5);
        assert_eq!(config.timeout.map(|t| t.to_std().as_secs()), Some(7200));
        assert_eq!(config.mirrors.len(), 2);

        let ubuntu = config.mirror("ubuntu")?;
        assert_eq!(ubuntu.components, vec!["main", "universe"]);
        assert_eq!(config.connections_per_host(ubuntu), 4);
        assert_eq!(
            config.keyring_for(ubuntu),
            Some(Path::new("keys/ubuntu-archive.gpg"))
        );

        let security = config.mirror("debian-security")?;
        assert!(security.sources);
        assert_eq!(
            config.keyring_for(security),
            Some(Path::new("/etc/apt/trusted.gpg.d/debian.gpg"))
        );
        assert_eq!(
            RetentionPolicy::resolve(None, security.retention.as_ref(), config.retention.as_ref())
                .and_then(|p| p.keep_last),
            Some(3)
        );

        assert!(config.mirror("fedora").is_err());
        let ids = config
            .select(std::iter::empty())?
            .into_iter()
            .map(|m| m.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["ubuntu", "debian-security"]);

        Ok(())
    }

    #[test]
    fn relative_paths_resolved() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("dmt.yaml");
        std::fs::write(&path, CONFIG.replace("/srv/mirrors", "state"))?;

        let config = Config::from_path(&path)?;
        assert_eq!(config.root, td.path().join("state"));
        assert_eq!(
            config.keyring,
            Some(td.path().join("keys/ubuntu-archive.gpg"))
        );

        Ok(())
    }

    #[test]
    fn invalid_configs() {
        let duplicate = indoc! {"
            root: /srv/mirrors
            mirrors:
              - id: ubuntu
                url: http://archive.ubuntu.com/ubuntu
                suites: [noble]
                components: [main]
                architectures: [amd64]
              - id: ubuntu
                url: http://archive.ubuntu.com/ubuntu
                suites: [jammy]
                components: [main]
                architectures: [amd64]
        "};
        assert!(matches!(Config::parse(duplicate), Err(DmtError::Config(_))));

        let bad_id = indoc! {"
            root: /srv/mirrors
            mirrors:
              - id: Ubuntu_Main
                url: http://archive.ubuntu.com/ubuntu
                suites: [noble]
                components: [main]
                architectures: [amd64]
        "};
        assert!(matches!(
            Config::parse(bad_id),
            Err(DmtError::Mirror(MirrorError::InvalidMirrorId(_)))
        ));

        let unknown_field = indoc! {"
            root: /srv/mirrors
            mirrors: []
            colour: blue
        "};
        assert!(matches!(Config::parse(unknown_field), Err(DmtError::SerdeYaml(_))));

        let bad_duration = indoc! {"
            root: /srv/mirrors
            timeout: soon
            mirrors: []
        "};
        assert!(Config::parse(bad_duration).is_err());

        let bad_cipher = indoc! {"
            root: /srv/mirrors
            tls:
              cipher_suites: [TLS_RSA_WITH_RC4_128_MD5]
            mirrors: []
        "};
        assert!(matches!(
            Config::parse(bad_cipher),
            Err(DmtError::Mirror(MirrorError::InvalidMirror { .. }))
        ));
    }
}
