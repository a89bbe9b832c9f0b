use std::{
    cmp::min,
    collections::VecDeque,
    sync::{Condvar, Mutex},
    thread,
    time::Duration,
};

use crate::{
    cancel::CancelToken,
    digest::Digest,
    store::{LayerStore, RootFs},
    EventHandler,
};

use super::{
    DownloadError, DownloadManager, DownloadedBlob, LayerDownloadDescriptor, Release,
    TransferError,
};

/// Default number of blobs downloaded in parallel.
const MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Default number of attempts for each blob.
const MAX_DOWNLOAD_ATTEMPTS: u32 = 5;

/// Delay between attempts. It is multiplied by the number of attempts.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// [`DownloadManager`] that downloads blobs with a pool of threads,
/// and stores them in a [`LayerStore`].
pub struct LayerDownloadManager<'s> {
    layer_store: &'s dyn LayerStore,
    max_concurrent_downloads: usize,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<'s> LayerDownloadManager<'s> {
    pub fn new(layer_store: &'s dyn LayerStore) -> Self {
        LayerDownloadManager {
            layer_store,
            max_concurrent_downloads: MAX_CONCURRENT_DOWNLOADS,
            max_attempts: MAX_DOWNLOAD_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn max_concurrent_downloads(mut self, n: usize) -> Self {
        self.max_concurrent_downloads = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Download a blob, retrying on retryable errors.
    fn run_download(
        &self,
        descriptor: &mut LayerDownloadDescriptor,
        cancel: &CancelToken,
        events: &dyn EventHandler,
    ) -> Result<DownloadedBlob, TransferError> {
        let mut attempt = 1;
        loop {
            match descriptor.download(cancel, events) {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.retry_delay * attempt;

                    tracing::warn!(
                        digest = %descriptor.digest(),
                        attempt,
                        "download failed, retrying in {delay:?}: {e}"
                    );

                    events.status(descriptor.id(), "Retrying");
                    if !cancel.sleep(delay) {
                        return Err(TransferError::Cancelled {
                            digest: descriptor.digest().clone(),
                        });
                    }

                    attempt += 1;
                }

                result => return result,
            }
        }
    }
}

/// Layer in the result of a download.
enum Layer<'t, 'a> {
    /// Layer already in the store.
    Exists(Digest),

    Download(&'t Task<'a>),
}

struct Task<'a> {
    descriptor: Mutex<LayerDownloadDescriptor<'a>>,
    result: Mutex<Option<Result<DownloadedBlob, TransferError>>>,
    notifier: Condvar,
}

impl<'a> Task<'a> {
    fn new(descriptor: LayerDownloadDescriptor<'a>) -> Self {
        Task {
            descriptor: Mutex::new(descriptor),
            result: Default::default(),
            notifier: Condvar::new(),
        }
    }

    /// Store the result of a download operation, and notify
    /// any waiting thread.
    fn complete(&self, result: Result<DownloadedBlob, TransferError>) {
        let mut lock = self.result.lock().unwrap_or_else(|e| e.into_inner());
        *lock = Some(result);
        self.notifier.notify_one();
    }

    /// Wait until the result of a download is ready.
    fn get(&self) -> Result<DownloadedBlob, TransferError> {
        let mut lock = self.result.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            lock = match lock.take() {
                Some(r) => return r,
                None => self
                    .notifier
                    .wait(lock)
                    .unwrap_or_else(|e| e.into_inner()),
            }
        }
    }
}

impl DownloadManager for LayerDownloadManager<'_> {
    fn download<'a>(
        &self,
        mut rootfs: RootFs,
        layers: Vec<LayerDownloadDescriptor<'a>>,
        cancel: &CancelToken,
        events: &dyn EventHandler,
    ) -> Result<(RootFs, Release), DownloadError> {
        // Skip layers already in the store.
        let mut tasks = Vec::with_capacity(layers.len());
        let mut existing = Vec::with_capacity(layers.len());
        for descriptor in layers {
            match descriptor.diff_id() {
                Some(diff_id) if self.layer_store.contains(&diff_id) => {
                    tracing::debug!(digest = %descriptor.digest(), "layer already exists");
                    events.status(descriptor.id(), "Already exists");
                    existing.push(Some(diff_id));
                }

                _ => {
                    events.status(descriptor.id(), "Waiting");
                    tasks.push(Task::new(descriptor));
                    existing.push(None);
                }
            }
        }

        let mut pending_tasks = tasks.iter();
        let layers: Vec<Layer> = existing
            .into_iter()
            .filter_map(|e| match e {
                Some(diff_id) => Some(Layer::Exists(diff_id)),
                None => pending_tasks.next().map(Layer::Download),
            })
            .collect();

        // Download blobs in a thread pool.
        let pending: VecDeque<_> = tasks.iter().collect();
        let pending = Mutex::new(pending);

        let cancel = cancel.child();

        let blobs = thread::scope(|scope| {
            let _cancel_guard = cancel.drop_guard();

            for _ in 0..min(self.max_concurrent_downloads, tasks.len()) {
                scope.spawn(|| {
                    while let Ok(Some(task)) = pending.lock().map(|mut q| q.pop_front()) {
                        let mut descriptor =
                            task.descriptor.lock().unwrap_or_else(|e| e.into_inner());
                        let result = self.run_download(&mut descriptor, &cancel, events);
                        drop(descriptor);
                        task.complete(result);
                    }
                });
            }

            // Register the layers in order, from bottom to top.

            let mut blobs = Vec::with_capacity(tasks.len());
            for layer in &layers {
                let task = match layer {
                    Layer::Exists(diff_id) => {
                        rootfs.append(diff_id.clone());
                        continue;
                    }

                    Layer::Download(task) => task,
                };

                let mut blob = task.get()?;

                let diff_id = self.layer_store.register(&mut blob).map_err(|source| {
                    DownloadError::Register {
                        digest: blob.digest().clone(),
                        source,
                    }
                })?;

                let descriptor = task.descriptor.lock().unwrap_or_else(|e| e.into_inner());
                descriptor.registered(&diff_id);
                events.status(descriptor.id(), "Pull complete");

                rootfs.append(diff_id);
                blobs.push(blob);
            }

            Ok::<_, DownloadError>(blobs)
        })?;

        let release = Release::new(move || {
            for blob in blobs {
                blob.release();
            }
        });

        Ok((rootfs, release))
    }
}
