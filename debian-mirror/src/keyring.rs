// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Trusted keyrings and PGP signature verification.

Release metadata is signed in one of two ways: inline, as a PGP cleartext
signature document (`InRelease`), or with a detached signature over the exact
bytes of `Release` (`Release.gpg`). [CleartextDocument] handles the former by way
of the `pgp-cleartext` crate and [parse_detached_signatures()] the latter. Either
way a [Keyring] decides whether the signatures are trusted.
*/

use {
    crate::error::{MirrorError, Result},
    pgp::{
        crypto::Hasher,
        packet::{Packet, PacketParser},
        types::PublicKeyTrait,
        Deserializable, Signature, SignedPublicKey,
    },
    pgp_cleartext::{CleartextSignatureReader, CleartextSignatures},
    std::{
        io::{Cursor, Read},
        path::Path,
    },
};

/// A set of public keys whose signatures are trusted.
#[derive(Clone, Debug, Default)]
pub struct Keyring {
    keys: Vec<SignedPublicKey>,
}

impl Keyring {
    /// Parse keys from armored or binary data.
    ///
    /// Armored data may contain multiple `PUBLIC KEY BLOCK` sections.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut keyring = Self::default();

        if is_armored(data) {
            let text = String::from_utf8_lossy(data);

            for block in split_armor_blocks(&text) {
                let (keys, _) = SignedPublicKey::from_armor_many(Cursor::new(block.as_bytes()))?;
                for key in keys {
                    keyring.add_key(key?);
                }
            }
        } else {
            for key in SignedPublicKey::from_bytes_many(Cursor::new(data)) {
                keyring.add_key(key?);
            }
        }

        if keyring.is_empty() {
            return Err(MirrorError::Authentication {
                path: "<keyring>".into(),
                message: "no public keys found in keyring data".into(),
            });
        }

        Ok(keyring)
    }

    /// Load keys from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| MirrorError::io_path(path, e))?;

        Self::from_bytes(&data).map_err(|e| match e {
            MirrorError::Authentication { message, .. } => MirrorError::Authentication {
                path: format!("{}", path.display()),
                message,
            },
            e => e,
        })
    }

    /// Add a key to this keyring.
    pub fn add_key(&mut self, key: SignedPublicKey) {
        self.keys.push(key);
    }

    /// Whether there are no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of primary keys in this keyring.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Verify signatures over `data`.
    ///
    /// Succeeds when at least one signature was made by a key (or subkey) in this
    /// keyring and is valid. Signatures by unknown keys are ignored, as apt does
    /// for repositories signed by several keys. Returns the number of valid signatures.
    pub fn verify(&self, signatures: &[Signature], data: &[u8], path: &str) -> Result<usize> {
        if signatures.is_empty() {
            return Err(authentication_error(path, "no PGP signatures present".into()));
        }

        let mut tally = Tally::default();

        for sig in signatures {
            for key in self.keys.iter() {
                tally.record(try_key(&key.primary_key, sig, data).map(|r| r.map(|_| 1)));
                for subkey in key.public_subkeys.iter() {
                    tally.record(try_key(subkey, sig, data).map(|r| r.map(|_| 1)));
                }
            }
        }

        tally.finish(path)
    }

    /// Verify the signatures of a cleartext document.
    ///
    /// The same acceptance rules as [Self::verify()] apply.
    pub fn verify_cleartext(&self, signatures: &CleartextSignatures, path: &str) -> Result<usize> {
        let mut tally = Tally::default();

        for key in self.keys.iter() {
            tally.record(try_cleartext_key(signatures, &key.primary_key));
            for subkey in key.public_subkeys.iter() {
                tally.record(try_cleartext_key(signatures, subkey));
            }
        }

        tally.finish(path)
    }
}

fn authentication_error(path: &str, message: String) -> MirrorError {
    MirrorError::Authentication {
        path: path.to_string(),
        message,
    }
}

/// Outcome of checking signatures against every key.
#[derive(Default)]
struct Tally {
    valid: usize,
    last_error: Option<pgp::errors::Error>,
}

impl Tally {
    fn record(&mut self, res: Option<pgp::errors::Result<usize>>) {
        match res {
            Some(Ok(count)) => self.valid += count,
            Some(Err(e)) => self.last_error = Some(e),
            None => {}
        }
    }

    fn finish(self, path: &str) -> Result<usize> {
        if self.valid > 0 {
            Ok(self.valid)
        } else if let Some(e) = self.last_error {
            Err(authentication_error(path, format!("invalid signature: {:?}", e)))
        } else {
            Err(authentication_error(
                path,
                "no signatures made by a key in the trusted keyring".into(),
            ))
        }
    }
}

fn try_cleartext_key(
    signatures: &CleartextSignatures,
    key: &impl PublicKeyTrait,
) -> Option<pgp::errors::Result<usize>> {
    signatures.iter_signatures_from_key(key).next()?;

    Some(signatures.verify(key))
}

/// Verify with a key if the signature's issuer (when present) names it.
fn try_key(
    key: &impl PublicKeyTrait,
    sig: &Signature,
    data: &[u8],
) -> Option<pgp::errors::Result<()>> {
    if let Some(issuer) = sig.issuer() {
        if &key.key_id() != issuer {
            return None;
        }
    }

    Some(verify_signature(key, sig, data))
}

fn verify_signature(
    key: &impl PublicKeyTrait,
    sig: &Signature,
    data: &[u8],
) -> pgp::errors::Result<()> {
    let mut hasher = sig.config.hash_alg.new_hasher()?;
    hasher.update(data);

    let len = sig.config.hash_signature_data(&mut *hasher)?;
    hasher.update(&sig.config.trailer(len));

    let digest = hasher.finish();

    if digest[0..2] != sig.signed_hash_value {
        return Err(pgp::errors::Error::Message(
            "invalid signed hash value".into(),
        ));
    }

    key.verify_signature(sig.config.hash_alg, &digest, &sig.signature)
}

fn is_armored(data: &[u8]) -> bool {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());

    data[start..].starts_with(b"-----BEGIN")
}

fn split_armor_blocks(text: &str) -> Vec<String> {
    let mut blocks = vec![];
    let mut current: Option<String> = None;

    for line in text.lines() {
        if line.starts_with("-----BEGIN ") {
            current = Some(String::new());
        }

        if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }

        if line.starts_with("-----END ") {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
        }
    }

    blocks
}

fn parse_signature_packets(reader: impl std::io::Read, path: &str) -> Result<Vec<Signature>> {
    let mut signatures = vec![];

    for packet in PacketParser::new(reader) {
        match packet {
            Ok(Packet::Signature(sig)) => signatures.push(sig),
            Ok(_) => {
                return Err(MirrorError::Parse {
                    path: path.to_string(),
                    message: "unexpected PGP packet; expected a signature".into(),
                })
            }
            Err(e) => {
                return Err(MirrorError::Parse {
                    path: path.to_string(),
                    message: format!("PGP packet parsing error: {:?}", e),
                })
            }
        }
    }

    Ok(signatures)
}

fn parse_armored_signatures(armor: &str, path: &str) -> Result<Vec<Signature>> {
    let mut dearmor = pgp::armor::Dearmor::new(Cursor::new(armor.as_bytes().to_vec()));
    dearmor.read_header().map_err(|e| MirrorError::Parse {
        path: path.to_string(),
        message: format!("bad signature armor: {:?}", e),
    })?;

    if !matches!(dearmor.typ, Some(pgp::armor::BlockType::Signature)) {
        return Err(MirrorError::Parse {
            path: path.to_string(),
            message: "armor block is not a PGP signature".into(),
        });
    }

    parse_signature_packets(dearmor, path)
}

/// Parse a detached signature file such as `Release.gpg`.
///
/// Both armored and binary encodings are accepted.
pub fn parse_detached_signatures(data: &[u8], path: &str) -> Result<Vec<Signature>> {
    if is_armored(data) {
        parse_armored_signatures(&String::from_utf8_lossy(data), path)
    } else {
        parse_signature_packets(Cursor::new(data), path)
    }
}

/// A parsed `InRelease` style document.
///
/// Framing and digesting of the signed text is performed by
/// [pgp_cleartext::CleartextSignatureReader].
pub struct CleartextDocument {
    text: String,
    signatures: CleartextSignatures,
}

impl CleartextDocument {
    /// Parse a cleartext signature document.
    ///
    /// Signatures are parsed but not verified.
    pub fn parse(data: &[u8], path: &str) -> Result<Self> {
        let mut reader = CleartextSignatureReader::new(Cursor::new(data));

        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| MirrorError::Parse {
                path: path.to_string(),
                message: format!("bad PGP cleartext document: {}", e),
            })?;

        let signatures = reader.finalize();

        if signatures.iter_signatures().next().is_none() {
            return Err(MirrorError::Parse {
                path: path.to_string(),
                message: "missing PGP signature block".into(),
            });
        }

        Ok(Self { text, signatures })
    }

    /// The signed text with dash escaping removed.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parsed signatures.
    pub fn signatures(&self) -> impl Iterator<Item = &Signature> {
        self.signatures.iter_signatures()
    }

    /// Verify the document against a keyring.
    pub fn verify(&self, keyring: &Keyring, path: &str) -> Result<usize> {
        keyring.verify_cleartext(&self.signatures, path)
    }
}
