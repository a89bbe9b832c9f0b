//! Pull images from a registry.
//!
//! A [`Puller`] resolves a reference to a manifest, downloads the layers
//! and the image config, checks that they are consistent, and stores
//! the result in the local stores.
//!
//! # Examples
//!
//! ```no_run
//! # use image_pull::{download::LayerDownloadManager, http::Client, pull::Puller, store::*};
//! # use image_pull::{NoEventHandler, Reference};
//! let reference = Reference::try_from("debian:stable").unwrap();
//!
//! let client = Client::new(reference.registry, &NoEventHandler);
//! let images = FsImageStore::new("/var/lib/images").unwrap();
//! let layers = FsLayerStore::new("/var/lib/images/layers").unwrap();
//! let manager = LayerDownloadManager::new(&layers);
//!
//! let summary = Puller::new(&client, &images)
//!     .download_manager(&manager)
//!     .pull(&reference)
//!     .unwrap();
//!
//! println!("{:?}", summary.outcomes[0].image_id);
//! ```

mod config;
#[cfg(test)]
mod tests;

use std::{
    fmt,
    io::Read,
    panic,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use crate::{
    cancel::CancelToken,
    digest::Digest,
    download::{DownloadError, DownloadManager, LayerDownloadDescriptor},
    manifest::{
        self, Descriptor, ImageManifest, Manifest, ManifestError, ManifestList, ManifestResolver,
        SignedManifest,
    },
    metadata::BlobMetadata,
    reference::{MediaType, Reference},
    registry::{Registry, RegistryError},
    store::{ImageStore, ReferenceStore, RootFs, StoreError},
    EventHandler, NoEventHandler,
};

pub use config::PullConfig;

#[derive(thiserror::Error, Debug)]
pub enum PullError {
    #[error("Unsupported manifest media type: {0:?}")]
    UnsupportedMediaType(String),

    #[error("{0}")]
    Manifest(ManifestError),

    #[error("Encountered remote {media_type:?}({class}) when fetching")]
    ConfigMediaTypeRejected {
        media_type: String,
        class: &'static str,
    },

    #[error("Invalid manifest for {0}: not schema2")]
    NotSchema2(String),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("Layers of {reference} don't match image configuration {config}.")]
    RootFsMismatch { reference: String, config: Digest },

    #[error("Error pulling image configuration: {0}")]
    ImageConfig(Box<PullError>),

    #[error(transparent)]
    Fallback(FallbackError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No matching manifest for {os}/{architecture} in the manifest list entries of {reference}.")]
    NoMatchingManifest {
        reference: String,
        os: String,
        architecture: String,
    },

    #[error("Failed to pull {} tag(s): {}", .0.len(), format_tags(.0))]
    Tags(Vec<(String, PullError)>),

    #[error("Reference {0} has neither a tag nor a digest.")]
    MissingTarget(String),

    #[error("Schema 1 manifests require a download manager.")]
    MissingDownloadManager,

    #[error("Pull cancelled.")]
    Cancelled,
}

fn format_tags(failures: &[(String, PullError)]) -> String {
    let items: Vec<_> = failures
        .iter()
        .map(|(tag, e)| format!("{tag}: {e}"))
        .collect();

    items.join("; ")
}

impl From<ManifestError> for PullError {
    fn from(error: ManifestError) -> Self {
        match error {
            ManifestError::UnsupportedMediaType(media_type) => {
                PullError::UnsupportedMediaType(media_type)
            }

            e => PullError::Manifest(e),
        }
    }
}

impl PullError {
    /// `true` if the error suggests that the registry only speaks an
    /// older protocol.
    pub fn should_fallback(&self) -> bool {
        matches!(self, PullError::Registry(e) if e.should_fallback())
    }
}

/// Failure that may be solved by using a legacy protocol.
#[derive(Debug)]
pub struct FallbackError {
    pub cause: Box<PullError>,

    /// The registry was already confirmed to support the protocol.
    pub confirmed: bool,

    /// `false` if the failure happened in the transport layer.
    pub transport_ok: bool,
}

impl FallbackError {
    /// `true` if the caller can retry with a legacy protocol.
    pub fn allowed(&self) -> bool {
        !self.confirmed
    }
}

impl fmt::Display for FallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cause.fmt(f)
    }
}

impl std::error::Error for FallbackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.cause)
    }
}

/// Result of pulling a single tag or digest.
#[derive(Clone, Debug)]
pub struct PullOutcome {
    /// Reference that was pulled, like `example.com/foo:1`.
    pub reference: String,

    /// Image identifier, which is the digest of its config.
    pub image_id: Digest,

    pub manifest_digest: Digest,

    /// New content was transferred from the registry.
    pub transferred: bool,

    /// The reference store was updated.
    pub tag_updated: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PullSummary {
    pub outcomes: Vec<PullOutcome>,
}

impl PullSummary {
    /// `true` if any tag downloaded new content, or tagged an
    /// existing image.
    pub fn downloaded(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.transferred || o.tag_updated)
    }
}

/// Image stored by one of the `pull_*` functions.
struct Pulled {
    image_id: Digest,
    manifest_digest: Digest,
    transferred: bool,
}

/// Pull images from a single registry.
pub struct Puller<'a> {
    registry: &'a dyn Registry,
    image_store: &'a dyn ImageStore,
    download_manager: Option<&'a dyn DownloadManager>,
    reference_store: Option<&'a dyn ReferenceStore>,
    metadata: Option<&'a BlobMetadata>,
    events: &'a dyn EventHandler,
    resolver: ManifestResolver,
    config: PullConfig,
    cancel: CancelToken,
    confirmed: AtomicBool,
}

impl<'a> Puller<'a> {
    pub fn new(registry: &'a dyn Registry, image_store: &'a dyn ImageStore) -> Self {
        Puller {
            registry,
            image_store,
            download_manager: None,
            reference_store: None,
            metadata: None,
            events: &NoEventHandler,
            resolver: ManifestResolver::default(),
            config: PullConfig::default(),
            cancel: CancelToken::new(),
            confirmed: AtomicBool::new(false),
        }
    }

    /// Manager to download layers.
    ///
    /// Without it, schema 2 pulls only fetch the image config, and
    /// schema 1 pulls fail.
    pub fn download_manager(mut self, manager: &'a dyn DownloadManager) -> Self {
        self.download_manager = Some(manager);
        self
    }

    pub fn reference_store(mut self, store: &'a dyn ReferenceStore) -> Self {
        self.reference_store = Some(store);
        self
    }

    pub fn metadata(mut self, metadata: &'a BlobMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn event_handler(mut self, events: &'a dyn EventHandler) -> Self {
        self.events = events;
        self
    }

    pub fn resolver(mut self, resolver: ManifestResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(mut self, config: PullConfig) -> Self {
        self.config = config;
        self
    }

    /// Token to stop the pull from another thread.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Mark the registry as already known to support the protocol.
    pub fn confirmed(self, confirmed: bool) -> Self {
        self.confirmed.store(confirmed, Ordering::Relaxed);
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Relaxed)
    }

    fn confirm(&self) {
        self.confirmed.store(true, Ordering::Relaxed);
    }

    /// Pull the image of `reference`.
    ///
    /// If the reference has no tag and no digest, every tag of the
    /// repository is pulled.
    pub fn pull(&self, reference: &Reference) -> Result<PullSummary, PullError> {
        match self.registry.ping() {
            Ok(true) => self.confirm(),
            Ok(false) => (),
            Err(e) => {
                tracing::warn!(registry = reference.registry, "error getting registry: {e}");
                return Err(PullError::Fallback(FallbackError {
                    cause: Box::new(e.into()),
                    confirmed: self.is_confirmed(),
                    transport_ok: false,
                }));
            }
        }

        let summary = match self.pull_repository(reference) {
            Err(e) if e.should_fallback() && !self.is_confirmed() => {
                Err(PullError::Fallback(FallbackError {
                    cause: Box::new(e),
                    confirmed: false,
                    transport_ok: true,
                }))
            }

            r => r,
        }?;

        self.events
            .pull_finished(&reference.to_string(), summary.downloaded());

        Ok(summary)
    }

    fn pull_repository(&self, reference: &Reference) -> Result<PullSummary, PullError> {
        let mut summary = PullSummary::default();

        if !reference.is_name_only() {
            summary.outcomes.push(self.pull_tag(reference)?);
            return Ok(summary);
        }

        let repository = reference.repository.to_string();
        let tags = self
            .registry
            .tags(&repository)
            .map_err(|e| self.allow_fallback(e))?;

        tracing::debug!(%reference, tags = tags.len(), "pulling all tags");

        let mut failures = Vec::new();
        for tag in &tags {
            let tag_reference = reference.with_tag(tag);
            match self.pull_tag(&tag_reference) {
                Ok(outcome) => summary.outcomes.push(outcome),

                Err(PullError::Fallback(e)) if e.allowed() => {
                    return Err(PullError::Fallback(e));
                }

                // The protocol is confirmed, so the error is final.
                Err(PullError::Fallback(e)) => return Err(*e.cause),

                Err(e) => {
                    tracing::warn!(reference = %tag_reference, "pull failed: {e}");
                    failures.push((tag.clone(), e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(PullError::Tags(failures));
        }

        Ok(summary)
    }

    fn pull_tag(&self, reference: &Reference) -> Result<PullOutcome, PullError> {
        let Some(tag_or_digest) = reference.tag_or_digest() else {
            return Err(PullError::MissingTarget(reference.to_string()));
        };

        let repository = reference.repository.to_string();

        let (content_type, body) = self
            .registry
            .manifest(&repository, tag_or_digest)
            .map_err(|e| match reference.tag() {
                Some(_) => self.allow_fallback(e),
                None => e.into(),
            })?;

        let (manifest, descriptor) = self.resolver.resolve(&content_type, &body)?;

        if let Manifest::SchemaV2(m) = &manifest {
            self.check_config_type(m)?;
        }

        self.confirm();

        tracing::debug!(%reference, kind = manifest.kind(), "pulling reference");
        self.events.message(
            tag_or_digest,
            &format!("Pulling from {}", reference.repository),
        );

        let pulled = match manifest {
            Manifest::SchemaV1(m) => {
                if self.config.require_schema2 {
                    return Err(PullError::NotSchema2(reference.to_string()));
                }

                self.pull_schema1(reference, &repository, m)?
            }

            Manifest::SchemaV2(m) => self.pull_schema2(reference, &repository, &m)?,

            Manifest::List(list) => {
                self.pull_manifest_list(reference, &repository, &list, &descriptor)?
            }
        };

        self.events
            .message("", &format!("Digest: {}", pulled.manifest_digest));

        let tag_updated = self.update_references(reference, &pulled)?;

        Ok(PullOutcome {
            reference: reference.to_string(),
            image_id: pulled.image_id,
            manifest_digest: pulled.manifest_digest,
            transferred: pulled.transferred,
            tag_updated,
        })
    }

    /// Wrap errors that may be solved with a legacy protocol.
    fn allow_fallback(&self, error: RegistryError) -> PullError {
        if !error.should_fallback() {
            return error.into();
        }

        let transport_ok = !matches!(error, RegistryError::MissingCredentials);

        PullError::Fallback(FallbackError {
            cause: Box::new(error.into()),
            confirmed: self.is_confirmed(),
            transport_ok,
        })
    }

    fn check_config_type(&self, manifest: &ImageManifest) -> Result<(), PullError> {
        if manifest.config_type_allowed(&self.config.schema2_types) {
            return Ok(());
        }

        let media_type = manifest.config.media_type.clone();
        Err(PullError::ConfigMediaTypeRejected {
            class: MediaType::class_of(&media_type),
            media_type,
        })
    }

    fn layer_descriptor<'r>(&'r self, digest: Digest, repository: &'r str) -> LayerDownloadDescriptor<'r> {
        LayerDownloadDescriptor::new(digest, self.registry, repository)
            .metadata(self.metadata)
            .temp_dir(self.config.temp_dir.as_deref())
    }

    fn pull_schema1(
        &self,
        reference: &Reference,
        repository: &str,
        mut manifest: SignedManifest,
    ) -> Result<Pulled, PullError> {
        manifest.verify(reference.digest(), &reference.to_string())?;
        manifest.fix_layers()?;

        let manifest_digest = manifest.digest();
        let (layers, history) = manifest.layers()?;

        let manager = self
            .download_manager
            .ok_or(PullError::MissingDownloadManager)?;

        let descriptors = layers
            .into_iter()
            .map(|digest| self.layer_descriptor(digest, repository))
            .collect();

        let (rootfs, release) =
            manager.download(RootFs::new(), descriptors, &self.cancel, self.events)?;

        let config = manifest.make_config(&rootfs, &history)?;
        let image_id = self.image_store.put(&config)?;

        release.release();

        Ok(Pulled {
            image_id,
            manifest_digest,
            transferred: true,
        })
    }

    fn pull_schema2(
        &self,
        reference: &Reference,
        repository: &str,
        manifest: &ImageManifest,
    ) -> Result<Pulled, PullError> {
        let manifest_digest = manifest.verify(reference.digest())?;
        let config_digest = &manifest.config.digest;

        match self.image_store.get(config_digest) {
            Ok(Some(image)) => {
                tracing::debug!(%reference, id = %image.id, "image already exists");
                return Ok(Pulled {
                    image_id: image.id,
                    manifest_digest,
                    transferred: false,
                });
            }

            Ok(None) => (),

            Err(e) => tracing::warn!(id = %config_digest, "failed to read stored image: {e}"),
        }

        let descriptors: Vec<_> = manifest
            .layers
            .iter()
            .map(|layer| {
                self.layer_descriptor(layer.digest.clone(), repository)
                    .source(layer.clone())
            })
            .collect();

        // The config and the layers are downloaded in parallel. If the
        // config fails, the layers are cancelled and their result is
        // discarded.
        let cancel = self.cancel.child();

        let (config, downloaded) = thread::scope(|scope| {
            let _cancel_guard = cancel.drop_guard();

            let config = scope.spawn(|| {
                let result = self.pull_config(repository, config_digest, &cancel);
                if result.is_err() {
                    cancel.cancel();
                }

                result
            });

            let layers = self.download_manager.map(|manager| {
                let cancel = &cancel;
                let events = self.events;
                scope.spawn(move || manager.download(RootFs::new(), descriptors, cancel, events))
            });

            let config = match config.join().unwrap_or_else(|e| panic::resume_unwind(e)) {
                Ok(config) => config,
                Err(e) => return Err(PullError::ImageConfig(Box::new(e))),
            };

            let downloaded = layers
                .map(|h| h.join().unwrap_or_else(|e| panic::resume_unwind(e)))
                .transpose()?;

            Ok::<_, PullError>((config, downloaded))
        })?;

        let (config, config_rootfs) = config;

        let release = match downloaded {
            Some((rootfs, release)) => {
                if !rootfs.is_consistent_with(&config_rootfs) {
                    tracing::error!(
                        %reference,
                        downloaded = rootfs.diff_ids.len(),
                        declared = config_rootfs.diff_ids.len(),
                        "rootfs mismatch"
                    );

                    return Err(PullError::RootFsMismatch {
                        reference: reference.to_string(),
                        config: config_digest.clone(),
                    });
                }

                Some(release)
            }

            None => None,
        };

        let image_id = self.image_store.put(&config)?;

        if let Some(release) = release {
            release.release();
        }

        Ok(Pulled {
            image_id,
            manifest_digest,
            transferred: true,
        })
    }

    /// Download and verify an image config.
    fn pull_config(
        &self,
        repository: &str,
        digest: &Digest,
        cancel: &CancelToken,
    ) -> Result<(Vec<u8>, RootFs), PullError> {
        if cancel.is_cancelled() {
            return Err(PullError::Cancelled);
        }

        let mut body = self.registry.blob(repository, digest, 0)?.body;

        let mut config = Vec::new();
        body.read_to_end(&mut config).map_err(RegistryError::from)?;

        manifest::verify_digest(Some(digest), &config)?;

        let rootfs = self.image_store.rootfs_from_config(&config)?;
        Ok((config, rootfs))
    }

    fn pull_manifest_list(
        &self,
        reference: &Reference,
        repository: &str,
        list: &ManifestList,
        descriptor: &Descriptor,
    ) -> Result<Pulled, PullError> {
        manifest::verify_digest(reference.digest(), list.raw())?;

        let list_digest = reference
            .digest()
            .cloned()
            .unwrap_or_else(|| descriptor.digest.clone());

        let PullConfig {
            os, architecture, ..
        } = &self.config;

        let Some(entry) = list.select(os, architecture) else {
            return Err(PullError::NoMatchingManifest {
                reference: reference.to_string(),
                os: os.clone(),
                architecture: architecture.clone(),
            });
        };

        tracing::debug!(%os, %architecture, digest = %entry.digest, "manifest list entry selected");

        let target = reference.with_digest(entry.digest.clone());
        let (content_type, body) = self.registry.manifest(repository, entry.digest.source())?;
        let (manifest, _) = self.resolver.resolve(&content_type, &body)?;

        let pulled = match manifest {
            Manifest::SchemaV1(m) => self.pull_schema1(&target, repository, m)?,

            Manifest::SchemaV2(m) => {
                self.check_config_type(&m)?;
                self.pull_schema2(&target, repository, &m)?
            }

            Manifest::List(m) => {
                return Err(PullError::UnsupportedMediaType(m.media_type().to_owned()))
            }
        };

        Ok(Pulled {
            manifest_digest: list_digest,
            ..pulled
        })
    }

    /// Point the reference to the new image.
    ///
    /// Return `false` if the tag was already pointing to it.
    fn update_references(&self, reference: &Reference, pulled: &Pulled) -> Result<bool, StoreError> {
        let Some(store) = self.reference_store else {
            return Ok(true);
        };

        let name = reference.to_string();
        let digest_reference = reference
            .with_digest(pulled.manifest_digest.clone())
            .to_string();

        if store.get(&name).as_ref() == Some(&pulled.image_id) {
            add_digest_reference(store, &digest_reference, &pulled.image_id)?;
            return Ok(false);
        }

        if reference.digest().is_some() {
            store.add_digest(&name, &pulled.image_id, true)?;
        } else {
            add_digest_reference(store, &digest_reference, &pulled.image_id)?;
            store.add_tag(&name, &pulled.image_id, true)?;
        }

        Ok(true)
    }
}

fn add_digest_reference(
    store: &dyn ReferenceStore,
    reference: &str,
    id: &Digest,
) -> Result<(), StoreError> {
    match store.get(reference) {
        Some(current) if current == *id => return Ok(()),
        Some(current) => {
            tracing::info!(%reference, old = %current, new = %id, "image ID for digest changed");
        }
        None => (),
    }

    store.add_digest(reference, id, true)
}
