//! Manifest lists and OCI image indexes.

use super::{Descriptor, Manifest, ManifestError};
use crate::reference::MediaType;

#[derive(Debug)]
pub struct ManifestList {
    pub schema_version: u32,
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    raw: Vec<u8>,
}

impl ManifestList {
    pub fn decode(bytes: &[u8]) -> Result<Manifest, ManifestError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            schema_version: u32,
            media_type: Option<String>,
            manifests: Vec<Descriptor>,
        }

        let raw: Raw = serde_json::from_slice(bytes)?;

        Ok(Manifest::List(ManifestList {
            schema_version: raw.schema_version,
            media_type: raw.media_type,
            manifests: raw.manifests,
            raw: bytes.to_vec(),
        }))
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn media_type(&self) -> &str {
        self.media_type
            .as_deref()
            .unwrap_or(MediaType::DockerManifestList.as_str())
    }

    /// Find the first manifest for `os`/`architecture`.
    ///
    /// The `variant` and `features` fields of the platform are not
    /// considered.
    pub fn select(&self, os: &str, architecture: &str) -> Option<&Descriptor> {
        self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == architecture)
        })
    }
}

#[test]
fn select_platform() {
    use crate::digest::Digest;

    let entry = |arch: &str, variant: Option<&str>| {
        serde_json::json!({
            "mediaType": MediaType::DockerManifestV2.as_str(),
            "size": 100,
            "digest": Digest::sha256(format!("{arch}{variant:?}")).to_string(),
            "platform": { "architecture": arch, "os": "linux", "variant": variant },
        })
    };

    let json = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MediaType::DockerManifestList.as_str(),
        "manifests": [entry("arm", Some("v7")), entry("arm64", Some("v8")), entry("amd64", None)],
    });

    let Manifest::List(list) = ManifestList::decode(json.to_string().as_bytes()).unwrap() else {
        panic!("Expected manifest list");
    };

    let amd64 = list.select("linux", "amd64").unwrap();
    assert_eq!(amd64.digest, Digest::sha256("amd64None"));

    let arm64 = list.select("linux", "arm64").unwrap();
    assert_eq!(arm64.platform.as_ref().unwrap().variant.as_deref(), Some("v8"));

    assert!(list.select("windows", "amd64").is_none());
    assert!(list.select("linux", "s390x").is_none());
}
