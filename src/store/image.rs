use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use super::{parse_rootfs, try_io, Image, ImageStore, StoreError};
use crate::digest::Digest;

/// Image configs stored as files in `<root>/content/<algorithm>/<hex>`.
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    /// Open the store in `root`. The directory is created if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let content = root.join("content");
        try_io!(&content, fs::create_dir_all(&content));
        Ok(FsImageStore { root })
    }

    fn path(&self, id: &Digest) -> PathBuf {
        self.root
            .join("content")
            .join(id.algorithm().prefix())
            .join(id.hash_value())
    }
}

impl ImageStore for FsImageStore {
    fn get(&self, id: &Digest) -> Result<Option<Image>, StoreError> {
        let path = self.path(id);

        let config = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e, path)),
        };

        if !id.verify(&config) {
            return Err(StoreError::Corrupted(id.clone()));
        }

        Ok(Some(Image {
            id: id.clone(),
            rootfs: parse_rootfs(&config)?,
            config,
        }))
    }

    fn put(&self, config: &[u8]) -> Result<Digest, StoreError> {
        parse_rootfs(config)?;

        let id = Digest::sha256(config);
        let path = self.path(&id);

        match fs::read(&path) {
            Ok(current) if id.verify(&current) => return Ok(id),
            Ok(_) => tracing::warn!(%id, "replacing corrupted image config"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(StoreError::Io(e, path)),
        }

        let dir = path.parent().unwrap_or(Path::new("."));
        try_io!(dir, fs::create_dir_all(dir));

        // Write to a temporary file, so readers never see a partial config.
        let mut file = try_io!(dir, tempfile::NamedTempFile::new_in(dir));
        try_io!(file.path(), file.write_all(config));
        try_io!(&path, file.persist(&path));

        tracing::debug!(%id, "image config stored");

        Ok(id)
    }
}

#[test]
fn store_and_load_configs() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsImageStore::new(dir.path()).unwrap();

    let config = br#"{"os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;
    let id = store.put(config).unwrap();
    assert_eq!(id, Digest::sha256(config));

    // Idempotent.
    assert_eq!(store.put(config).unwrap(), id);

    let image = store.get(&id).unwrap().unwrap();
    assert_eq!(image.config, config);
    assert!(image.rootfs.diff_ids.is_empty());

    assert!(store.get(&Digest::sha256(b"missing")).unwrap().is_none());

    // Detect modified files.
    fs::write(store.path(&id), b"{}").unwrap();
    assert!(matches!(store.get(&id), Err(StoreError::Corrupted(_))));

    // Storing the config again repairs the file.
    assert_eq!(store.put(config).unwrap(), id);
    assert_eq!(store.get(&id).unwrap().unwrap().config, config);

    // Configs without rootfs are rejected.
    assert!(store.put(b"{}").is_err());
}
