use std::collections::HashMap;

use super::{Descriptor, ImageManifest, Manifest, ManifestError, ManifestList, SignedManifest};
use crate::{
    digest::Digest,
    reference::{mediatype::LEGACY_JSON, MediaType},
};

/// Function to decode the body of a manifest.
pub type DecodeFn = fn(&[u8]) -> Result<Manifest, ManifestError>;

/// Map from media types to manifest decoders.
///
/// [`ManifestResolver::default`] knows every manifest type that can be
/// pulled. A decoder registered for the empty string is used for any
/// media type without a specific decoder.
pub struct ManifestResolver {
    decoders: HashMap<String, DecodeFn>,
}

impl Default for ManifestResolver {
    fn default() -> Self {
        let defaults: [(&str, DecodeFn); 7] = [
            (LEGACY_JSON, SignedManifest::decode),
            (MediaType::DockerManifestV1.as_str(), SignedManifest::decode),
            (MediaType::DockerManifestV1Signed.as_str(), SignedManifest::decode),
            (MediaType::DockerManifestV2.as_str(), ImageManifest::decode),
            (MediaType::OciManifestV1.as_str(), ImageManifest::decode),
            (MediaType::DockerManifestList.as_str(), ManifestList::decode),
            (MediaType::OciImageIndex.as_str(), ManifestList::decode),
        ];

        let decoders = defaults
            .into_iter()
            .map(|(media_type, decode)| (media_type.to_owned(), decode))
            .collect();

        ManifestResolver { decoders }
    }
}

impl ManifestResolver {
    /// Create a resolver with no decoders.
    pub fn new() -> Self {
        ManifestResolver {
            decoders: HashMap::new(),
        }
    }

    /// Add a decoder for `media_type`.
    ///
    /// Fails if there is already a decoder for it.
    pub fn register(&mut self, media_type: &str, decode: DecodeFn) -> Result<(), ManifestError> {
        if self.decoders.contains_key(media_type) {
            return Err(ManifestError::DuplicateMediaType(media_type.to_owned()));
        }

        self.decoders.insert(media_type.to_owned(), decode);
        Ok(())
    }

    /// Decode a manifest.
    ///
    /// Parameters in `content_type` (like `; charset=utf-8`) are ignored.
    ///
    /// The returned [`Descriptor`] is computed from the canonical bytes of
    /// the manifest. It does not depend on any digest sent by the registry.
    pub fn resolve(
        &self,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<(Manifest, Descriptor), ManifestError> {
        let media_type = content_type
            .split_once(';')
            .map_or(content_type, |(m, _)| m)
            .trim();

        let decode = self
            .decoders
            .get(media_type)
            .or_else(|| self.decoders.get(""))
            .ok_or_else(|| ManifestError::UnsupportedMediaType(media_type.to_owned()))?;

        let manifest = decode(bytes)?;

        let (payload_type, payload) = manifest.payload();
        let descriptor = Descriptor {
            media_type: payload_type.to_owned(),
            size: payload.len() as u64,
            digest: Digest::sha256(payload),
            platform: None,
        };

        tracing::debug!(
            %media_type,
            kind = manifest.kind(),
            digest = %descriptor.digest,
            "manifest resolved"
        );

        Ok((manifest, descriptor))
    }
}

#[test]
fn reject_duplicated_types() {
    let mut resolver = ManifestResolver::new();
    resolver.register(LEGACY_JSON, SignedManifest::decode).unwrap();

    assert!(matches!(
        resolver.register(LEGACY_JSON, ImageManifest::decode),
        Err(ManifestError::DuplicateMediaType(_))
    ));

    let mut resolver = ManifestResolver::default();
    assert!(resolver
        .register(MediaType::DockerManifestV2.as_str(), ImageManifest::decode)
        .is_err());
}

#[test]
fn resolve_by_content_type() {
    let resolver = ManifestResolver::default();
    let bytes = super::schema2::sample(MediaType::DockerImageV1.as_str());

    let (manifest, descriptor) = resolver
        .resolve(
            "application/vnd.docker.distribution.manifest.v2+json; charset=utf-8",
            &bytes,
        )
        .unwrap();

    assert!(matches!(manifest, Manifest::SchemaV2(_)));
    assert_eq!(descriptor.digest, Digest::sha256(&bytes));
    assert_eq!(descriptor.size, bytes.len() as u64);

    assert!(matches!(
        resolver.resolve("text/plain", &bytes),
        Err(ManifestError::UnsupportedMediaType(t)) if t == "text/plain"
    ));
}

#[test]
fn use_default_decoder() {
    let mut resolver = ManifestResolver::new();
    resolver.register("", ImageManifest::decode).unwrap();

    let bytes = super::schema2::sample(MediaType::OciConfig.as_str());
    let (manifest, _) = resolver.resolve("text/plain", &bytes).unwrap();
    assert_eq!(manifest.references().len(), 2);
}
