use std::{num::NonZeroUsize, sync::Mutex};

use lru::LruCache;

use crate::digest::Digest;

const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(n) => n,
    None => panic!("capacity must not be zero"),
};

/// Map from blob digests to the diff IDs of their uncompressed content.
///
/// It is filled when a layer is registered, so later pulls of the same
/// blob can skip the download if the layer store already contains it.
pub struct BlobMetadata {
    cache: Mutex<LruCache<Digest, Digest>>,
}

impl Default for BlobMetadata {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BlobMetadata {
    pub fn new(capacity: NonZeroUsize) -> Self {
        BlobMetadata {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn diff_id(&self, blob: &Digest) -> Option<Digest> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(blob).cloned()
    }

    pub fn set(&self, blob: &Digest, diff_id: &Digest) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(blob.clone(), diff_id.clone());
    }
}

#[test]
fn evict_old_entries() {
    let metadata = BlobMetadata::new(NonZeroUsize::new(2).unwrap());
    let blob = |n: u8| Digest::sha256([n]);

    metadata.set(&blob(1), &blob(11));
    metadata.set(&blob(2), &blob(12));
    assert_eq!(metadata.diff_id(&blob(1)), Some(blob(11)));

    // `2` is the least recently used.
    metadata.set(&blob(3), &blob(13));
    assert_eq!(metadata.diff_id(&blob(2)), None);
    assert_eq!(metadata.diff_id(&blob(1)), Some(blob(11)));
}
