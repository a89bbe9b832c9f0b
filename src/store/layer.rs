use std::{
    fs,
    io::{self, BufRead, BufReader, Read},
    path::PathBuf,
};

use super::{try_io, LayerStore, StoreError};
use crate::digest::{Digest, DigestAlgorithm, DigestWriter};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Uncompressed layers stored as `<root>/<algorithm>/<hex>.tar`.
pub struct FsLayerStore {
    root: PathBuf,
}

impl FsLayerStore {
    /// Open the store in `root`. The directory is created if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        try_io!(&root, fs::create_dir_all(&root));
        Ok(FsLayerStore { root })
    }

    /// Path of the tarball for `diff_id`.
    pub fn path(&self, diff_id: &Digest) -> PathBuf {
        self.root
            .join(diff_id.algorithm().prefix())
            .join(format!("{}.tar", diff_id.hash_value()))
    }
}

impl LayerStore for FsLayerStore {
    fn contains(&self, diff_id: &Digest) -> bool {
        self.path(diff_id).exists()
    }

    fn register(&self, blob: &mut dyn Read) -> Result<Digest, StoreError> {
        let mut input = BufReader::new(blob);
        let magic = try_io!(&self.root, input.fill_buf());

        // Uncompress the layer, detecting the format from its first bytes.
        let mut reader: Box<dyn Read + '_> = if magic.starts_with(GZIP_MAGIC) {
            Box::new(flate2::bufread::GzDecoder::new(input))
        } else if magic.starts_with(ZSTD_MAGIC) {
            #[cfg(feature = "zstd")]
            {
                Box::new(try_io!(&self.root, zstd::stream::read::Decoder::with_buffer(input)))
            }

            #[cfg(not(feature = "zstd"))]
            {
                return Err(StoreError::UnsupportedCompression("zstd"));
            }
        } else {
            Box::new(input)
        };

        let tmp = try_io!(&self.root, tempfile::NamedTempFile::new_in(&self.root));
        let mut writer = DigestWriter::new(DigestAlgorithm::SHA256, tmp);
        try_io!(&self.root, io::copy(&mut reader, &mut writer));

        let (tmp, diff_id) = writer.finish();
        let path = self.path(&diff_id);

        if !path.exists() {
            if let Some(dir) = path.parent() {
                try_io!(dir, fs::create_dir_all(dir));
            }

            try_io!(&path, tmp.persist(&path));
        }

        tracing::debug!(%diff_id, "layer registered");

        Ok(diff_id)
    }
}
