//! Local storage for pulled content.
//!
//! The pull process only depends on the traits in this module. The
//! filesystem implementations ([`FsImageStore`], [`FsLayerStore`]) and
//! the [`MemoryReferenceStore`] are enough to pull images to a local
//! directory.

mod image;
mod layer;
mod reference;

use std::{
    io::{self, Read},
    path::PathBuf,
};

use crate::digest::Digest;

pub use image::FsImageStore;
pub use layer::FsLayerStore;
pub use reference::MemoryReferenceStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error in {1}: {0}")]
    Io(io::Error, PathBuf),

    #[error("Invalid image config: {0}")]
    InvalidConfig(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(&'static str),

    #[error("Content of {0} does not match its digest.")]
    Corrupted(Digest),

    #[error("Conflict: tag {reference} is already set to image {current}, but force was not set.")]
    ReferenceConflict { reference: String, current: Digest },
}

macro_rules! try_io {
    ($path:expr, $e:expr $(,)?) => {
        $e.map_err(|e| StoreError::Io(io::Error::from(e), $path.into()))?
    };
}

// Make visible to mods.
use try_io;

/// Ordered list of layer diff IDs, from bottom to top.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RootFs {
    pub fn new() -> Self {
        RootFs {
            kind: "layers".into(),
            diff_ids: Vec::new(),
        }
    }

    pub fn append(&mut self, diff_id: Digest) {
        self.diff_ids.push(diff_id);
    }

    /// Two values are consistent if they have the same diff IDs,
    /// in the same order.
    pub fn is_consistent_with(&self, other: &RootFs) -> bool {
        self.diff_ids == other.diff_ids
    }
}

/// Image config stored in an [`ImageStore`].
#[derive(Clone, Debug)]
pub struct Image {
    /// Digest of the config.
    pub id: Digest,

    pub rootfs: RootFs,

    /// Raw bytes of the config.
    pub config: Vec<u8>,
}

/// Content-addressed storage for image configs.
pub trait ImageStore: Sync {
    /// Find the image with `id`.
    fn get(&self, id: &Digest) -> Result<Option<Image>, StoreError>;

    /// Store an image config. Return its identifier, which is the
    /// digest of the config.
    ///
    /// Storing the same config multiple times is not an error.
    fn put(&self, config: &[u8]) -> Result<Digest, StoreError>;

    /// Extract the `rootfs` field from an image config.
    fn rootfs_from_config(&self, config: &[u8]) -> Result<RootFs, StoreError> {
        parse_rootfs(config)
    }
}

/// Storage for layers, addressed by their diff IDs.
pub trait LayerStore: Sync {
    fn contains(&self, diff_id: &Digest) -> bool;

    /// Store the blob of a layer. The blob may be compressed.
    ///
    /// Return the diff ID, which is the digest of the uncompressed
    /// blob.
    fn register(&self, blob: &mut dyn Read) -> Result<Digest, StoreError>;
}

/// Map from image references (like `example.com/foo:1`) to image IDs.
pub trait ReferenceStore: Sync {
    fn get(&self, reference: &str) -> Option<Digest>;

    /// Set a tag reference. If the tag already points to a different
    /// image, it is replaced only if `force` is `true`.
    fn add_tag(&self, reference: &str, id: &Digest, force: bool) -> Result<(), StoreError>;

    /// Set a digest reference (like `example.com/foo@sha256:...`).
    fn add_digest(&self, reference: &str, id: &Digest, force: bool) -> Result<(), StoreError>;
}

fn parse_rootfs(config: &[u8]) -> Result<RootFs, StoreError> {
    #[derive(serde::Deserialize)]
    struct Config {
        rootfs: Option<RootFs>,
    }

    let config: Config = serde_json::from_slice(config)?;
    let rootfs = config
        .rootfs
        .ok_or_else(|| StoreError::InvalidConfig("missing rootfs".into()))?;

    if rootfs.kind != "layers" {
        return Err(StoreError::InvalidConfig(format!(
            "unsupported rootfs type {:?}",
            rootfs.kind
        )));
    }

    Ok(rootfs)
}

#[test]
fn rootfs_consistency() {
    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": {
            "type": "layers",
            "diff_ids": [Digest::sha256(b"a").to_string(), Digest::sha256(b"b").to_string()],
        },
    });

    let declared = parse_rootfs(config.to_string().as_bytes()).unwrap();

    let mut downloaded = RootFs::new();
    downloaded.append(Digest::sha256(b"a"));
    assert!(!downloaded.is_consistent_with(&declared));

    downloaded.append(Digest::sha256(b"b"));
    assert!(downloaded.is_consistent_with(&declared));

    let mut reversed = RootFs::new();
    reversed.append(Digest::sha256(b"b"));
    reversed.append(Digest::sha256(b"a"));
    assert!(!reversed.is_consistent_with(&declared));

    assert!(matches!(
        parse_rootfs(br#"{"os":"linux"}"#),
        Err(StoreError::InvalidConfig(_))
    ));
}
