//! Pull container images from a registry.
//!
//! The entry point is [`pull::Puller`]. It resolves a [`Reference`] to a
//! manifest, downloads every layer with resumable and verified transfers,
//! checks that the layers match the image config, and stores the result.
//!
//! The registry and the local stores are traits, so they can be replaced:
//!
//! * [`registry::Registry`], implemented by [`http::Client`].
//! * [`store::ImageStore`], [`store::LayerStore`], and
//!   [`store::ReferenceStore`].
//! * [`download::DownloadManager`], implemented by
//!   [`download::LayerDownloadManager`].

pub mod cancel;
pub mod digest;
pub mod download;
mod event_handler;
pub mod http;
pub mod manifest;
pub mod metadata;
pub mod pull;
pub mod reference;
pub mod registry;
pub mod store;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use digest::{Digest, DigestAlgorithm};
pub use event_handler::{EventHandler, NoEventHandler};
pub use pull::{PullConfig, PullError, Puller};
pub use reference::{MediaType, Reference};
