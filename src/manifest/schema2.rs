//! Schema 2 and OCI image manifests.

use super::{verify_digest, Descriptor, Manifest, ManifestError};
use crate::{digest::Digest, reference::MediaType};

/// Image manifest with a config blob and a list of layers.
#[derive(Debug)]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: Option<String>,
    pub config: Descriptor,

    /// Layers, from bottom to top.
    pub layers: Vec<Descriptor>,

    raw: Vec<u8>,
}

impl ImageManifest {
    pub fn decode(bytes: &[u8]) -> Result<Manifest, ManifestError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            schema_version: u32,
            media_type: Option<String>,
            config: Descriptor,

            #[serde(default)]
            layers: Vec<Descriptor>,
        }

        let raw: Raw = serde_json::from_slice(bytes)?;

        Ok(Manifest::SchemaV2(ImageManifest {
            schema_version: raw.schema_version,
            media_type: raw.media_type,
            config: raw.config,
            layers: raw.layers,
            raw: bytes.to_vec(),
        }))
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn media_type(&self) -> &str {
        self.media_type
            .as_deref()
            .unwrap_or(MediaType::DockerManifestV2.as_str())
    }

    /// Compute the digest of the manifest, and compare it with
    /// `expected`, if any.
    pub fn verify(&self, expected: Option<&Digest>) -> Result<Digest, ManifestError> {
        verify_digest(expected, &self.raw)?;
        Ok(match expected {
            Some(d) => d.clone(),
            None => Digest::sha256(&self.raw),
        })
    }

    /// Check if the media type of the config is in `allowed`.
    pub fn config_type_allowed<S: AsRef<str>>(&self, allowed: &[S]) -> bool {
        allowed.iter().any(|t| t.as_ref() == self.config.media_type)
    }
}

#[cfg(test)]
pub(crate) fn sample(config_type: &str) -> Vec<u8> {
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MediaType::DockerManifestV2.as_str(),
        "config": {
            "mediaType": config_type,
            "size": 7023,
            "digest": Digest::sha256(b"config").to_string(),
        },
        "layers": [
            {
                "mediaType": MediaType::DockerFsTarGzip.as_str(),
                "size": 32654,
                "digest": Digest::sha256(b"layer").to_string(),
            },
        ],
    })
    .to_string()
    .into_bytes()
}

#[test]
fn verify_manifest_digest() {
    let bytes = sample(MediaType::DockerImageV1.as_str());
    let Manifest::SchemaV2(m) = ImageManifest::decode(&bytes).unwrap() else {
        panic!("Expected schema2");
    };

    assert_eq!(m.verify(None).unwrap(), Digest::sha256(&bytes));
    assert!(m.verify(Some(&Digest::sha256(&bytes))).is_ok());
    assert!(matches!(
        m.verify(Some(&Digest::sha256(b"x"))),
        Err(ManifestError::DigestMismatch { .. })
    ));

    assert_eq!(m.layers.len(), 1);
    assert_eq!(m.layers[0].size, 32654);
}

#[test]
fn config_allow_list() {
    let bytes = sample(MediaType::DockerPluginV1.as_str());
    let Manifest::SchemaV2(m) = ImageManifest::decode(&bytes).unwrap() else {
        panic!("Expected schema2");
    };

    assert!(!m.config_type_allowed(&[MediaType::DockerImageV1.as_str()]));
    assert!(m.config_type_allowed(&[MediaType::DockerPluginV1.as_str()]));
    assert_eq!(MediaType::class_of(&m.config.media_type), "plugin");
}
