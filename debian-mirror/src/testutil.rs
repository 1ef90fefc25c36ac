// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures for tests: signing keys and generated repositories.

use {
    crate::{
        error::Result,
        io::{ChecksumType, ContentDigest},
        keyring::Keyring,
    },
    async_compression::futures::bufread::GzipEncoder,
    chrono::SubsecRound,
    futures::AsyncReadExt,
    once_cell::sync::Lazy,
    pgp::{
        crypto::{HashAlgorithm, SymmetricKeyAlgorithm},
        packet::{Packet, SignatureConfig, SignatureType, Subpacket},
        types::{CompressionAlgorithm, KeyTrait, KeyVersion, SecretKeyTrait},
        KeyType, SecretKeyParamsBuilder, SignedPublicKey, SignedSecretKey,
    },
    smallvec::{smallvec, SmallVec},
    std::{
        io::Cursor,
        path::{Path, PathBuf},
    },
    tempfile::TempDir,
};

static SHARED: Lazy<TestSigner> = Lazy::new(|| TestSigner::generate("Mirror Test <test@example.com>"));
static OTHER: Lazy<TestSigner> = Lazy::new(|| TestSigner::generate("Stranger <other@example.com>"));

/// A generated PGP key pair.
pub struct TestSigner {
    secret: SignedSecretKey,
    public: SignedPublicKey,
}

impl TestSigner {
    fn generate(user_id: &str) -> Self {
        let mut builder = SecretKeyParamsBuilder::default();
        builder
            .key_type(KeyType::Rsa(2048))
            .preferred_symmetric_algorithms(smallvec![SymmetricKeyAlgorithm::AES256])
            .preferred_hash_algorithms(smallvec![HashAlgorithm::SHA2_256])
            .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB])
            .can_create_certificates(false)
            .can_sign(true)
            .primary_user_id(user_id.to_string());

        let params = builder.build().unwrap();
        let secret = params.generate().unwrap().sign(String::new).unwrap();
        let public = secret.public_key().sign(&secret, String::new).unwrap();

        Self { secret, public }
    }

    /// The key most fixtures are signed with.
    pub fn shared() -> &'static Self {
        &SHARED
    }

    /// A key nothing is signed with.
    pub fn other() -> &'static Self {
        &OTHER
    }

    pub fn keyring(&self) -> Keyring {
        let mut keyring = Keyring::default();
        keyring.add_key(self.public.clone());
        keyring
    }

    pub fn armored_public_key(&self) -> String {
        self.public.to_armored_string(None).unwrap()
    }

    fn sign(&self, typ: SignatureType, data: &[u8]) -> String {
        let config = SignatureConfig::new_v4(
            Default::default(),
            typ,
            self.secret.algorithm(),
            HashAlgorithm::SHA2_256,
            vec![
                Subpacket::IssuerFingerprint(
                    KeyVersion::V4,
                    SmallVec::from_slice(&self.secret.fingerprint()),
                ),
                Subpacket::SignatureCreationTime(chrono::Utc::now().trunc_subsecs(0)),
            ],
            vec![Subpacket::Issuer(self.secret.key_id())],
        );

        let signature = config
            .sign(&self.secret, String::new, Cursor::new(data.to_vec()))
            .unwrap();

        let mut writer = Cursor::new(Vec::<u8>::new());
        pgp::armor::write(
            &Packet::Signature(signature),
            pgp::armor::BlockType::Signature,
            &mut writer,
            None,
        )
        .unwrap();

        String::from_utf8(writer.into_inner()).unwrap()
    }

    /// Produce a cleartext signed document of `text`.
    pub fn cleartext_sign(&self, text: &str) -> String {
        pgp_cleartext::cleartext_sign(
            &self.secret,
            String::new,
            HashAlgorithm::SHA2_256,
            Cursor::new(text.as_bytes()),
        )
        .unwrap()
    }

    /// Produce an armored detached signature over `data`.
    pub fn detached_sign(&self, data: &[u8]) -> String {
        self.sign(SignatureType::Binary, data)
    }
}

/// A binary package in a generated repository.
#[derive(Clone, Debug)]
pub struct TestPackage {
    pub name: String,
    pub component: String,
    pub architecture: String,
    pub content: Vec<u8>,
}

impl TestPackage {
    pub fn new(name: &str, architecture: &str, content: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            component: "main".to_string(),
            architecture: architecture.to_string(),
            content: content.to_vec(),
        }
    }

    /// Place the package in a component other than `main`.
    pub fn in_component(mut self, component: &str) -> Self {
        self.component = component.to_string();
        self
    }

    pub fn pool_path(&self) -> String {
        format!(
            "pool/{}/{}/{}/{}_1.0_{}.deb",
            self.component,
            &self.name[0..1],
            self.name,
            self.name,
            self.architecture
        )
    }
}

/// How a generated repository's manifest is signed.
#[derive(Clone, Copy)]
pub enum Signing {
    InRelease(&'static TestSigner),
    Detached(&'static TestSigner),
    Unsigned,
}

fn gzip(data: &[u8]) -> Vec<u8> {
    futures::executor::block_on(async {
        let mut encoder = GzipEncoder::new(futures::io::Cursor::new(data.to_vec()));
        let mut out = vec![];
        encoder.read_to_end(&mut out).await.unwrap();
        out
    })
}

/// A repository generated in a temporary directory.
///
/// Components are those of the suite's packages. `Packages` is published gzipped
/// only, though the manifest also lists the uncompressed variant as real archives do.
pub struct TestRepository {
    dir: TempDir,
}

impl TestRepository {
    pub fn build(suite: &str, packages: &[TestPackage], signing: Signing) -> Result<Self> {
        let repo = Self {
            dir: tempfile::tempdir()?,
        };
        repo.write_suite(suite, packages, signing)?;

        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, path: &str) -> PathBuf {
        self.dir.path().join(path)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = self.path(path);
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(path, data)?;

        Ok(())
    }

    /// (Re)write a suite and its packages.
    pub fn write_suite(&self, suite: &str, packages: &[TestPackage], signing: Signing) -> Result<()> {
        let mut components = packages
            .iter()
            .map(|p| p.component.clone())
            .collect::<Vec<_>>();
        components.sort();
        components.dedup();

        let mut architectures = packages
            .iter()
            .map(|p| p.architecture.clone())
            .collect::<Vec<_>>();
        architectures.sort();
        architectures.dedup();

        let mut index_files = vec![];

        for component in &components {
            for arch in &architectures {
                let members = packages
                    .iter()
                    .filter(|p| &p.component == component && &p.architecture == arch)
                    .collect::<Vec<_>>();
                if members.is_empty() {
                    continue;
                }

                let mut packages_text = String::new();

                for package in members {
                    self.write(&package.pool_path(), &package.content)?;

                    packages_text.push_str(&format!(
                        "Package: {}\nVersion: 1.0\nArchitecture: {}\nFilename: {}\nSize: {}\nMD5sum: {}\nSHA256: {}\n\n",
                        package.name,
                        arch,
                        package.pool_path(),
                        package.content.len(),
                        ContentDigest::compute(ChecksumType::Md5, &package.content).digest_hex(),
                        ContentDigest::compute(ChecksumType::Sha256, &package.content).digest_hex(),
                    ));
                }

                let plain = packages_text.into_bytes();
                let gzipped = gzip(&plain);

                let dir = format!("{}/binary-{}", component, arch);
                self.write(&format!("dists/{}/{}/Packages.gz", suite, dir), &gzipped)?;
                index_files.push((format!("{}/Packages", dir), plain));
                index_files.push((format!("{}/Packages.gz", dir), gzipped));
            }
        }

        let mut release = format!(
            "Origin: Test\nSuite: {}\nCodename: {}\nDate: {}\nArchitectures: {}\nComponents: {}\n",
            suite,
            suite,
            chrono::Utc::now().to_rfc2822(),
            architectures.join(" "),
            components.join(" "),
        );

        for checksum in [ChecksumType::Md5, ChecksumType::Sha256] {
            release.push_str(&format!("{}:\n", checksum.field_name()));
            for (path, data) in &index_files {
                release.push_str(&format!(
                    " {} {} {}\n",
                    ContentDigest::compute(checksum, data).digest_hex(),
                    data.len(),
                    path
                ));
            }
        }

        let dist = format!("dists/{}", suite);
        for name in ["InRelease", "Release", "Release.gpg"] {
            let path = self.path(&format!("{}/{}", dist, name));
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }

        match signing {
            Signing::InRelease(signer) => {
                self.write(
                    &format!("{}/InRelease", dist),
                    signer.cleartext_sign(&release).as_bytes(),
                )?;
            }
            Signing::Detached(signer) => {
                self.write(&format!("{}/Release", dist), release.as_bytes())?;
                self.write(
                    &format!("{}/Release.gpg", dist),
                    signer.detached_sign(release.as_bytes()).as_bytes(),
                )?;
            }
            Signing::Unsigned => {
                self.write(&format!("{}/Release", dist), release.as_bytes())?;
            }
        }

        Ok(())
    }
}
