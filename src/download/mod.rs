//! Download of layer blobs.
//!
//! A [`LayerDownloadDescriptor`] fetches a single blob to a temporary file.
//! It keeps the partial data between attempts, so a failed transfer can
//! be resumed from the last byte received.
//!
//! A [`DownloadManager`] downloads all the layers of an image, and
//! registers them in a layer store.

mod manager;

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use tempfile::NamedTempFile;

use crate::{
    cancel::CancelToken,
    digest::{Digest, Verifier},
    manifest::Descriptor,
    metadata::BlobMetadata,
    registry::{BlobReader, Registry, RegistryError},
    store::{RootFs, StoreError},
    EventHandler,
};

pub use manager::LayerDownloadManager;

/// Prefix for the names of temporary files.
const TEMP_PREFIX: &str = "GetImageBlob";

/// Size of the buffer to copy data from the registry.
const BUFFER_SIZE: usize = 32 * 1024;

/// Reason of a failed transfer.
#[derive(thiserror::Error, Debug)]
pub enum TransferCause {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("filesystem layer verification failed for digest {expected} (got {actual})")]
    Verification { expected: Digest, actual: Digest },
}

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    /// The transfer may succeed if it is tried again.
    #[error("Download of {digest} failed: {cause}")]
    Retryable { digest: Digest, cause: TransferCause },

    #[error("Download of {digest} failed permanently: {cause}")]
    Permanent { digest: Digest, cause: TransferCause },

    #[error("Download of {digest} was cancelled.")]
    Cancelled { digest: Digest },
}

impl TransferError {
    pub fn digest(&self) -> &Digest {
        match self {
            TransferError::Retryable { digest, .. }
            | TransferError::Permanent { digest, .. }
            | TransferError::Cancelled { digest } => digest,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Retryable { .. })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Failed to register layer {digest}: {source}")]
    Register { digest: Digest, source: StoreError },
}

/// Download all layers of an image.
pub trait DownloadManager: Sync {
    /// Download `layers` (from bottom to top), and append their diff IDs
    /// to `rootfs`.
    ///
    /// The returned [`Release`] must be kept until the layers are no
    /// longer needed.
    fn download<'a>(
        &self,
        rootfs: RootFs,
        layers: Vec<LayerDownloadDescriptor<'a>>,
        cancel: &CancelToken,
        events: &dyn EventHandler,
    ) -> Result<(RootFs, Release), DownloadError>;
}

/// Cleanup action for the resources of a download.
///
/// The action runs once, either when [`release`](Self::release) is
/// called, or when the value is dropped.
pub struct Release(Option<Box<dyn FnOnce() + Send>>);

impl Release {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Release(Some(Box::new(action)))
    }

    /// A `Release` with no action.
    pub fn noop() -> Self {
        Release(None)
    }

    pub fn release(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(action) = self.0.take() {
            action();
        }
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Release").field(&self.0.is_some()).finish()
    }
}

/// A verified blob, stored in a temporary file.
///
/// The file is deleted when the value is dropped.
#[derive(Debug)]
pub struct DownloadedBlob {
    digest: Digest,
    file: NamedTempFile,
    size: u64,
}

impl DownloadedBlob {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Close and delete the temporary file.
    pub fn release(self) {
        let path = self.file.path().to_owned();
        if let Err(e) = self.file.close() {
            tracing::error!(path = %path.display(), "Failed to remove temp file: {e}");
        }
    }
}

impl Read for DownloadedBlob {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Data received in previous attempts.
struct Partial {
    file: NamedTempFile,
    verifier: Verifier,
}

enum State {
    /// No temporary file yet.
    Fresh,

    /// The temporary file contains the data hashed in the verifier.
    Partial(Partial),
}

/// A blob to download.
///
/// Each call to [`download`](Self::download) is a new attempt. If an
/// attempt fails with [`TransferError::Retryable`], the next one resumes
/// from the data already received.
pub struct LayerDownloadDescriptor<'a> {
    digest: Digest,
    source: Option<Descriptor>,
    registry: &'a dyn Registry,
    repository: &'a str,
    metadata: Option<&'a BlobMetadata>,
    temp_dir: Option<&'a Path>,
    state: State,
}

impl<'a> LayerDownloadDescriptor<'a> {
    pub fn new(digest: Digest, registry: &'a dyn Registry, repository: &'a str) -> Self {
        LayerDownloadDescriptor {
            digest,
            source: None,
            registry,
            repository,
            metadata: None,
            temp_dir: None,
            state: State::Fresh,
        }
    }

    /// Descriptor from the manifest, used for the size of the blob.
    pub fn source(mut self, source: Descriptor) -> Self {
        self.source = Some(source);
        self
    }

    /// Cache for diff IDs.
    pub fn metadata(mut self, metadata: Option<&'a BlobMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Directory for the temporary file. If not set, it uses the
    /// default temporary directory of the system.
    pub fn temp_dir(mut self, dir: Option<&'a Path>) -> Self {
        self.temp_dir = dir;
        self
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Identifier for progress events.
    pub fn id(&self) -> &str {
        self.digest.short_id()
    }

    /// Diff ID from a previous pull of the same blob, if known.
    pub fn diff_id(&self) -> Option<Digest> {
        self.metadata.and_then(|m| m.diff_id(&self.digest))
    }

    /// Notify that the blob was registered in the layer store.
    pub fn registered(&self, diff_id: &Digest) {
        if let Some(metadata) = self.metadata {
            metadata.set(&self.digest, diff_id);
        }
    }

    fn retryable(&self, cause: impl Into<TransferCause>) -> TransferError {
        TransferError::Retryable {
            digest: self.digest.clone(),
            cause: cause.into(),
        }
    }

    fn permanent(&self, cause: impl Into<TransferCause>) -> TransferError {
        TransferError::Permanent {
            digest: self.digest.clone(),
            cause: cause.into(),
        }
    }

    fn registry_error(&self, error: RegistryError) -> TransferError {
        if error.is_retryable() {
            self.retryable(error)
        } else {
            self.permanent(error)
        }
    }

    fn create_file(&self) -> Result<NamedTempFile, TransferError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PREFIX);

        let file = match self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };

        file.map_err(|e| self.permanent(e))
    }

    /// Download the blob, resuming a previous attempt if possible.
    pub fn download(
        &mut self,
        cancel: &CancelToken,
        events: &dyn EventHandler,
    ) -> Result<DownloadedBlob, TransferError> {
        tracing::debug!(digest = %self.digest, "pulling blob");

        let (mut partial, offset) = match std::mem::replace(&mut self.state, State::Fresh) {
            State::Fresh => {
                let partial = Partial {
                    file: self.create_file()?,
                    verifier: Verifier::new(&self.digest),
                };

                (partial, 0)
            }

            State::Partial(mut partial) => match partial.file.seek(SeekFrom::End(0)) {
                Ok(offset) if offset == partial.verifier.len() => {
                    if offset != 0 {
                        tracing::debug!(digest = %self.digest, offset, "resuming download");
                    }

                    (partial, offset)
                }

                Ok(_) => {
                    truncate(&mut partial, &self.digest).map_err(|e| self.permanent(e))?;
                    (partial, 0)
                }

                Err(e) => {
                    tracing::debug!(error = %e, "error seeking to end of download file");

                    let partial = Partial {
                        file: self.create_file()?,
                        verifier: Verifier::new(&self.digest),
                    };

                    (partial, 0)
                }
            },
        };

        let result = self.transfer(&mut partial, offset, cancel, events);

        match result {
            Ok(size) => Ok(DownloadedBlob {
                digest: self.digest.clone(),
                file: partial.file,
                size,
            }),

            Err(e) => {
                // Keep the data for the next attempt. If the error is not
                // retryable, the temporary file is removed.
                if e.is_retryable() {
                    self.state = State::Partial(partial);
                }

                Err(e)
            }
        }
    }

    /// Copy the blob from the registry to the temporary file.
    fn transfer(
        &self,
        partial: &mut Partial,
        mut offset: u64,
        cancel: &CancelToken,
        events: &dyn EventHandler,
    ) -> Result<u64, TransferError> {
        let id = self.id();

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled {
                digest: self.digest.clone(),
            });
        }

        events.status(id, "Downloading");

        let mut blob = match self.open(offset) {
            Err(RegistryError::RangeNotSatisfiable) if offset > 0 => {
                tracing::debug!(digest = %self.digest, "range not satisfiable; starting over");
                truncate(partial, &self.digest).map_err(|e| self.permanent(e))?;
                offset = 0;
                self.open(0)
            }

            b => b,
        }
        .map_err(|e| self.registry_error(e))?;

        // If the registry ignored the range, or the partial download is
        // larger than the full blob, start from zero.
        if blob.start != offset || blob.total.is_some_and(|t| t < offset) {
            tracing::debug!(digest = %self.digest, offset, "cannot resume download; starting over");
            truncate(partial, &self.digest).map_err(|e| self.permanent(e))?;
            offset = 0;

            if blob.start != 0 {
                blob = self.open(0).map_err(|e| self.registry_error(e))?;
            }
        }

        let total = blob
            .total
            .or_else(|| self.source.as_ref().map(|s| s.size).filter(|s| *s > 0));

        let resumed = offset != 0;
        let mut position = offset;
        let mut buffer = vec![0; BUFFER_SIZE];

        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled {
                    digest: self.digest.clone(),
                });
            }

            let n = match blob.body.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.retryable(e)),
            };

            if let Err(e) = partial.file.write_all(&buffer[..n]) {
                return Err(if e.kind() == io::ErrorKind::StorageFull {
                    self.permanent(e)
                } else {
                    self.retryable(e)
                });
            }

            partial.verifier.update(&buffer[..n]);
            position += n as u64;
            events.download_progress(id, position, total);
        }

        events.status(id, "Verifying Checksum");

        if !partial.verifier.verified() {
            let cause = TransferCause::Verification {
                expected: self.digest.clone(),
                actual: partial.verifier.computed(),
            };

            tracing::error!(digest = %self.digest, resumed, "{cause}");

            // A resumed download may have mixed data from different
            // sources. Try again from zero.
            if resumed {
                truncate(partial, &self.digest).map_err(|e| self.permanent(e))?;
                return Err(self.retryable(cause));
            }

            return Err(self.permanent(cause));
        }

        events.status(id, "Download complete");

        partial.file.rewind().map_err(|e| self.permanent(e))?;

        tracing::debug!(
            digest = %self.digest,
            path = %partial.file.path().display(),
            "blob downloaded"
        );

        Ok(position)
    }

    fn open(&self, offset: u64) -> Result<BlobReader, RegistryError> {
        self.registry.blob(self.repository, &self.digest, offset)
    }
}

/// Remove the data received in previous attempts.
fn truncate(partial: &mut Partial, digest: &Digest) -> io::Result<()> {
    partial.verifier = Verifier::new(digest);
    partial.file.rewind()?;
    partial.file.as_file().set_len(0)
}
