/// Handler to receive notifications for events during the pull process.
///
/// All methods are optional. They are invoked from the download threads,
/// so implementations must be `Sync`.
#[expect(unused_variables)]
pub trait EventHandler: Sync {
    /// HTTP request to the registry.
    fn registry_request(&self, url: &str) {}

    /// Registry requires an [authentication token][token].
    ///
    /// [token]: https://distribution.github.io/distribution/spec/auth/token/
    fn registry_auth(&self, url: &str) {}

    /// A line of text associated with `id`, like `Pulling from library/debian`
    /// or `Digest: sha256:...`.
    ///
    /// `id` may be empty.
    fn message(&self, id: &str, message: &str) {}

    /// The blob identified by `id` moved to a new phase.
    ///
    /// `id` is the short form of the blob digest. `action` is one of
    /// `Waiting`, `Downloading`, `Retrying`, `Verifying Checksum`,
    /// `Download complete`, `Already exists`, or `Pull complete`.
    fn status(&self, id: &str, action: &str) {}

    /// Some data has been received for the blob identified by `id`.
    ///
    /// `current` is the number of bytes of the blob that are already
    /// downloaded, including the ones from a previous attempt.
    ///
    /// This method is invoked very frequently.
    fn download_progress(&self, id: &str, current: u64, total: Option<u64>) {}

    /// The pull for `reference` finished.
    ///
    /// `downloaded` is `true` if new content was transferred, or if an
    /// existing image was newly tagged.
    fn pull_finished(&self, reference: &str, downloaded: bool) {}
}

/// [`EventHandler`] instance to ignore all events.
pub struct NoEventHandler;

impl EventHandler for NoEventHandler {}
