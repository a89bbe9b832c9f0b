//! Legacy schema 1 manifests.

use std::collections::HashSet;

use base64::Engine as _;

use super::{verify_digest, Descriptor, Manifest, ManifestError};
use crate::{digest::Digest, reference::MediaType, store::RootFs};

/// Engine to decode the base64url fields of the JWS signature. Some
/// clients include the padding and some don't.
const BASE64URL: base64::engine::GeneralPurpose = base64::engine::GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    base64::engine::GeneralPurposeConfig::new()
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
);

/// Keys of the v1 image JSON that are not copied to the image config.
const LEGACY_KEYS: &[&str] = &["id", "parent", "Size", "parent_id", "layer_id", "throwaway"];

#[derive(serde::Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: Digest,
}

#[derive(serde::Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct V1History {
    pub v1_compatibility: String,
}

/// Schema 1 manifest, with the bytes covered by its signature.
#[derive(Debug)]
pub struct SignedManifest {
    pub schema_version: u32,
    pub name: String,
    pub tag: String,
    pub architecture: String,

    /// Layers, from top to bottom.
    pub fs_layers: Vec<FsLayer>,

    /// One entry for each item in `fs_layers`.
    pub history: Vec<V1History>,

    canonical: Vec<u8>,
    signed: bool,
}

/// Fields of the v1 image JSON used to check the parent chain.
#[derive(serde::Deserialize, Debug, Default)]
struct V1Image {
    #[serde(default)]
    id: String,

    #[serde(default)]
    parent: String,

    #[serde(default)]
    throwaway: bool,
}

/// Entry in the `history` field of an image config.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

impl SignedManifest {
    /// Decode a schema 1 manifest.
    ///
    /// For signed manifests, the canonical bytes are recovered from the
    /// `formatLength` and `formatTail` fields in the protected header of
    /// the first signature. The signature itself is not verified.
    pub fn decode(bytes: &[u8]) -> Result<Manifest, ManifestError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            schema_version: u32,

            #[serde(default)]
            name: String,

            #[serde(default)]
            tag: String,

            #[serde(default)]
            architecture: String,

            #[serde(default)]
            fs_layers: Vec<FsLayer>,

            #[serde(default)]
            history: Vec<V1History>,

            #[serde(default)]
            signatures: Vec<Signature>,
        }

        #[derive(serde::Deserialize)]
        struct Signature {
            protected: String,
        }

        let raw: Raw = serde_json::from_slice(bytes)?;

        let (canonical, signed) = match raw.signatures.first() {
            Some(signature) => (canonical_payload(bytes, &signature.protected)?, true),
            None => (bytes.to_vec(), false),
        };

        Ok(Manifest::SchemaV1(SignedManifest {
            schema_version: raw.schema_version,
            name: raw.name,
            tag: raw.tag,
            architecture: raw.architecture,
            fs_layers: raw.fs_layers,
            history: raw.history,
            canonical,
            signed,
        }))
    }

    pub fn canonical(&self) -> &[u8] {
        &self.canonical
    }

    pub fn media_type(&self) -> &'static str {
        if self.signed {
            MediaType::DockerManifestV1Signed.as_str()
        } else {
            MediaType::DockerManifestV1.as_str()
        }
    }

    /// Digest of the canonical bytes.
    pub fn digest(&self) -> Digest {
        Digest::sha256(&self.canonical)
    }

    pub(super) fn references(&self) -> Vec<Descriptor> {
        self.fs_layers
            .iter()
            .map(|l| Descriptor {
                media_type: MediaType::DockerFsTarGzip.to_string(),
                size: 0,
                digest: l.blob_sum.clone(),
                platform: None,
            })
            .collect()
    }

    /// Check the manifest before using it.
    ///
    /// If `expected` is set, the digest of the canonical bytes is verified
    /// before anything else.
    pub fn verify(&self, expected: Option<&Digest>, reference: &str) -> Result<(), ManifestError> {
        verify_digest(expected, &self.canonical)?;

        if self.schema_version != 1 {
            return Err(ManifestError::SchemaVersion {
                version: self.schema_version,
                reference: reference.to_owned(),
            });
        }

        if self.fs_layers.len() != self.history.len() {
            return Err(ManifestError::HistoryLength(reference.to_owned()));
        }

        if self.fs_layers.is_empty() {
            return Err(ManifestError::NoLayers(reference.to_owned()));
        }

        Ok(())
    }

    /// Remove repeated layers, and check the parent chain.
    ///
    /// Consecutive entries with the same ID are collapsed into one. Any
    /// other duplicate is an error. Every entry must point to the next
    /// one as its parent, and the last one (the base layer) must not
    /// have a parent.
    pub fn fix_layers(&mut self) -> Result<(), ManifestError> {
        let images = self
            .history
            .iter()
            .map(|h| {
                let image: V1Image = serde_json::from_str(&h.v1_compatibility)?;
                validate_id(&image.id)?;
                Ok(image)
            })
            .collect::<Result<Vec<_>, ManifestError>>()?;

        let Some(base) = images.last() else {
            return Ok(());
        };

        // Windows base layers can point to a parent outside the manifest.
        if !base.parent.is_empty() && !cfg!(windows) {
            return Err(ManifestError::BaseLayerParent);
        }

        let mut seen = HashSet::new();
        let mut last_id = "";
        for image in &images {
            if image.id != last_id && seen.contains(image.id.as_str()) {
                return Err(ManifestError::DuplicateId(image.id.clone()));
            }

            last_id = &image.id;
            seen.insert(last_id);
        }

        // Walk backwards, so removed items don't change the
        // indexes still to visit.
        for i in (0..images.len() - 1).rev() {
            if images[i].id == images[i + 1].id {
                self.fs_layers.remove(i);
                self.history.remove(i);
            } else if images[i].parent != images[i + 1].id {
                return Err(ManifestError::InvalidParent {
                    expected: images[i + 1].id.clone(),
                    actual: images[i].parent.clone(),
                });
            }
        }

        Ok(())
    }

    /// Layers to download, from bottom to top, with the history entry
    /// for every layer in the manifest.
    ///
    /// Layers marked as `throwaway` are not included in the first list.
    pub fn layers(&self) -> Result<(Vec<Digest>, Vec<History>), ManifestError> {
        let mut layers = Vec::with_capacity(self.fs_layers.len());
        let mut history = Vec::with_capacity(self.history.len());

        for (layer, entry) in self.fs_layers.iter().zip(&self.history).rev() {
            let image: V1Image = serde_json::from_str(&entry.v1_compatibility)?;
            history.push(history_from_v1(&entry.v1_compatibility, image.throwaway)?);

            if !image.throwaway {
                layers.push(layer.blob_sum.clone());
            }
        }

        Ok((layers, history))
    }

    /// Build an image config from the v1 JSON of the top layer.
    pub fn make_config(&self, rootfs: &RootFs, history: &[History]) -> Result<Vec<u8>, ManifestError> {
        let top = self
            .history
            .first()
            .ok_or_else(|| ManifestError::NoLayers(self.name.clone()))?;

        let mut config: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&top.v1_compatibility)?;

        for key in LEGACY_KEYS {
            config.remove(*key);
        }

        config.insert("rootfs".into(), serde_json::to_value(rootfs)?);
        config.insert("history".into(), serde_json::to_value(history)?);

        Ok(serde_json::to_vec(&config)?)
    }
}

/// Image IDs must be 64 lowercase hexadecimal digits.
fn validate_id(id: &str) -> Result<(), ManifestError> {
    let valid = id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));

    if valid {
        Ok(())
    } else {
        Err(ManifestError::InvalidId(id.to_owned()))
    }
}

/// Convert the v1 JSON of a layer to a history entry.
fn history_from_v1(v1: &str, empty_layer: bool) -> Result<History, ManifestError> {
    #[derive(serde::Deserialize, Default)]
    #[serde(default)]
    struct ContainerConfig {
        #[serde(rename = "Cmd")]
        cmd: Option<Vec<String>>,
    }

    #[derive(serde::Deserialize)]
    struct V1Config {
        created: Option<String>,

        #[serde(default)]
        author: String,

        #[serde(default)]
        comment: String,

        #[serde(default)]
        container_config: ContainerConfig,
    }

    let config: V1Config = serde_json::from_str(v1)?;

    Ok(History {
        created: config.created,
        author: config.author,
        created_by: config.container_config.cmd.unwrap_or_default().join(" "),
        comment: config.comment,
        empty_layer,
    })
}

/// Extract the bytes covered by a JWS signature.
///
/// The protected header contains the length of the payload before the
/// `signatures` key (`formatLength`), and the suffix to append to it
/// (`formatTail`).
fn canonical_payload(bytes: &[u8], protected: &str) -> Result<Vec<u8>, ManifestError> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Protected {
        format_length: usize,
        format_tail: String,
    }

    let header = BASE64URL
        .decode(protected)
        .map_err(|e| ManifestError::Signature(e.to_string()))?;

    let header: Protected = serde_json::from_slice(&header)?;

    let tail = BASE64URL
        .decode(&header.format_tail)
        .map_err(|e| ManifestError::Signature(e.to_string()))?;

    let Some(head) = bytes.get(..header.format_length) else {
        return Err(ManifestError::Signature(format!(
            "formatLength {} is out of range",
            header.format_length
        )));
    };

    let mut canonical = Vec::with_capacity(head.len() + tail.len());
    canonical.extend_from_slice(head);
    canonical.extend_from_slice(&tail);
    Ok(canonical)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn id(n: u8) -> String {
        format!("{:064x}", n)
    }

    /// Build a v1 compatibility entry.
    pub(crate) fn v1(id: &str, parent: &str, throwaway: bool) -> String {
        serde_json::json!({
            "id": id,
            "parent": parent,
            "throwaway": throwaway,
            "created": "2024-01-01T00:00:00Z",
            "container_config": { "Cmd": ["/bin/sh", "-c", format!("echo {id}")] },
            "Size": 10,
        })
        .to_string()
    }

    fn manifest(entries: &[(u8, String)]) -> SignedManifest {
        let json = serde_json::json!({
            "schemaVersion": 1,
            "name": "foo/bar",
            "tag": "1",
            "architecture": "amd64",
            "fsLayers": entries
                .iter()
                .map(|(n, _)| serde_json::json!({
                    "blobSum": Digest::sha256([*n]).to_string()
                }))
                .collect::<Vec<_>>(),
            "history": entries
                .iter()
                .map(|(_, v)| serde_json::json!({ "v1Compatibility": v }))
                .collect::<Vec<_>>(),
        });

        match SignedManifest::decode(json.to_string().as_bytes()).unwrap() {
            Manifest::SchemaV1(m) => m,
            m => panic!("Unexpected manifest: {m:?}"),
        }
    }

    #[test]
    fn collapse_adjacent_duplicates() {
        let mut m = manifest(&[
            (3, v1(&id(3), &id(2), false)),
            (2, v1(&id(2), &id(1), false)),
            (2, v1(&id(2), &id(1), false)),
            (1, v1(&id(1), "", false)),
        ]);

        m.fix_layers().unwrap();

        assert_eq!(m.fs_layers.len(), 3);
        assert_eq!(m.history.len(), 3);
        assert_eq!(m.fs_layers[1].blob_sum, Digest::sha256([2]));
    }

    #[test]
    fn reject_broken_chain() {
        let mut m = manifest(&[
            (3, v1(&id(3), &id(9), false)),
            (1, v1(&id(1), "", false)),
        ]);

        let err = m.fix_layers().unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Invalid parent ID. Expected {}, got {}.", id(1), id(9))
        );

        let mut m = manifest(&[
            (1, v1(&id(1), &id(2), false)),
            (2, v1(&id(2), &id(1), false)),
            (1, v1(&id(1), "", false)),
        ]);

        assert!(matches!(m.fix_layers(), Err(ManifestError::DuplicateId(_))));

        let mut m = manifest(&[(1, v1(&id(1), &id(2), false))]);
        assert!(matches!(m.fix_layers(), Err(ManifestError::BaseLayerParent)));

        let mut m = manifest(&[(1, v1("ABC", "", false))]);
        assert!(matches!(m.fix_layers(), Err(ManifestError::InvalidId(_))));
    }

    #[test]
    fn verify_structure() {
        let m = manifest(&[(1, v1(&id(1), "", false))]);
        m.verify(None, "foo/bar:1").unwrap();
        m.verify(Some(&m.digest()), "foo/bar:1").unwrap();

        let other = Digest::sha256(b"other");
        assert!(matches!(
            m.verify(Some(&other), "foo/bar:1"),
            Err(ManifestError::DigestMismatch { .. })
        ));

        let mut m = manifest(&[(1, v1(&id(1), "", false))]);
        m.history.clear();
        assert!(matches!(
            m.verify(None, "foo/bar:1"),
            Err(ManifestError::HistoryLength(_))
        ));

        let mut m = manifest(&[]);
        assert!(matches!(m.verify(None, "x"), Err(ManifestError::NoLayers(_))));

        m.schema_version = 2;
        assert!(matches!(
            m.verify(None, "x"),
            Err(ManifestError::SchemaVersion { version: 2, .. })
        ));
    }

    #[test]
    fn extract_signed_payload() {
        let canonical = r#"{"schemaVersion":1,"name":"foo/bar","tag":"1","architecture":"amd64","fsLayers":[],"history":[]}"#;

        let format_length = canonical.len() - 1;
        let protected = serde_json::json!({
            "formatLength": format_length,
            "formatTail": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("}"),
            "time": "2024-01-01T00:00:00Z",
        });
        let protected =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(protected.to_string());

        let signed = format!(
            r#"{},"signatures":[{{"header":{{"alg":"ES256"}},"signature":"AAAA","protected":"{}"}}]}}"#,
            &canonical[..format_length],
            protected,
        );

        let Manifest::SchemaV1(m) = SignedManifest::decode(signed.as_bytes()).unwrap() else {
            panic!("Expected schema1");
        };

        assert_eq!(m.canonical(), canonical.as_bytes());
        assert_eq!(m.digest(), Digest::sha256(canonical));
        assert_eq!(m.media_type(), MediaType::DockerManifestV1Signed.as_str());
    }

    #[test]
    fn synthesize_config() {
        let m = manifest(&[
            (2, v1(&id(2), &id(1), true)),
            (1, v1(&id(1), "", false)),
        ]);

        let (layers, history) = m.layers().unwrap();
        assert_eq!(layers, [Digest::sha256([1])]);
        assert_eq!(history.len(), 2);
        assert!(!history[0].empty_layer);
        assert!(history[1].empty_layer);
        assert_eq!(history[1].created_by, format!("/bin/sh -c echo {}", id(2)));

        let mut rootfs = RootFs::new();
        rootfs.append(Digest::sha256(b"diff"));

        let config: serde_json::Value =
            serde_json::from_slice(&m.make_config(&rootfs, &history).unwrap()).unwrap();

        for key in LEGACY_KEYS {
            assert!(config.get(key).is_none(), "{key} in {config}");
        }

        assert_eq!(config["rootfs"]["type"], "layers");
        assert_eq!(config["rootfs"]["diff_ids"][0], Digest::sha256(b"diff").to_string());
        assert_eq!(config["history"][1]["empty_layer"], true);
        assert_eq!(config["created"], "2024-01-01T00:00:00Z");
    }
}
