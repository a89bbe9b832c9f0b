//! Manifest variants and their validation.
//!
//! A registry can return three kinds of manifests:
//!
//! * [Schema 1](https://distribution.github.io/distribution/spec/deprecated-schema-v1/),
//!   with a list of layers (top to bottom) and the legacy history.
//! * [Schema 2](https://distribution.github.io/distribution/spec/manifest-v2-2/)
//!   (or an OCI image manifest), with a config blob and the layers
//!   (bottom to top).
//! * A manifest list (or an OCI image index), pointing to other manifests
//!   for different platforms.
//!
//! Raw responses are decoded with a [`ManifestResolver`].

pub mod list;
pub mod resolver;
pub mod schema1;
pub mod schema2;

use crate::digest::Digest;

pub use list::ManifestList;
pub use resolver::ManifestResolver;
pub use schema1::SignedManifest;
pub use schema2::ImageManifest;

/// Content referenced from a manifest.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,

    #[serde(default)]
    pub size: u64,

    pub digest: Digest,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Target platform of an entry in a manifest list.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Platform {
    pub architecture: String,

    pub os: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

/// Decoded manifest.
#[derive(Debug)]
pub enum Manifest {
    SchemaV1(SignedManifest),
    SchemaV2(ImageManifest),
    List(ManifestList),
}

impl Manifest {
    /// Content referenced by this manifest.
    ///
    /// For schema 1 the layers are top to bottom. For schema 2 the
    /// config is the first item, followed by the layers.
    pub fn references(&self) -> Vec<Descriptor> {
        match self {
            Manifest::SchemaV1(m) => m.references(),
            Manifest::SchemaV2(m) => std::iter::once(&m.config)
                .chain(&m.layers)
                .cloned()
                .collect(),
            Manifest::List(m) => m.manifests.clone(),
        }
    }

    /// Media type and canonical bytes of the manifest. The digest of
    /// the manifest is computed from these bytes.
    pub fn payload(&self) -> (&str, &[u8]) {
        match self {
            Manifest::SchemaV1(m) => (m.media_type(), m.canonical()),
            Manifest::SchemaV2(m) => (m.media_type(), m.raw()),
            Manifest::List(m) => (m.media_type(), m.raw()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::SchemaV1(_) => "schema1",
            Manifest::SchemaV2(_) => "schema2",
            Manifest::List(_) => "manifest list",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("Unsupported manifest media type: {0:?}")]
    UnsupportedMediaType(String),

    #[error("Media type {0:?} is already registered.")]
    DuplicateMediaType(String),

    #[error("Invalid manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid manifest signature: {0}")]
    Signature(String),

    #[error("image verification failed for digest {expected} (got {actual})")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("unsupported schema version {version} for {reference:?}")]
    SchemaVersion { version: u32, reference: String },

    #[error("length of history not equal to number of layers for {0:?}")]
    HistoryLength(String),

    #[error("no FSLayers in manifest for {0:?}")]
    NoLayers(String),

    #[error("image ID {0:?} is invalid")]
    InvalidId(String),

    #[error("invalid parent ID in the base layer of the image")]
    BaseLayerParent,

    #[error("ID {0} appears multiple times in manifest")]
    DuplicateId(String),

    #[error("Invalid parent ID. Expected {expected}, got {actual}.")]
    InvalidParent { expected: String, actual: String },
}

/// Verify that `payload` matches the `expected` digest, if any.
pub(crate) fn verify_digest(expected: Option<&Digest>, payload: &[u8]) -> Result<(), ManifestError> {
    match expected {
        Some(expected) if !expected.verify(payload) => {
            let actual = Digest::from_bytes(expected.algorithm(), payload);
            tracing::error!(%expected, %actual, "manifest verification failed");
            Err(ManifestError::DigestMismatch {
                expected: expected.clone(),
                actual,
            })
        }

        _ => Ok(()),
    }
}
