use std::{fmt, str::FromStr};

/// Declare the known media types. Each entry has the variant name, the
/// media type string, and its class (`image`, `layer`, `manifest`, or
/// `plugin`).
macro_rules! media_types {
    ($($variant:ident = $mediatype:literal in $class:literal,)*) => {
        /// Known media types.
        #[non_exhaustive]
        #[derive(Copy, Clone, PartialEq, Eq, Debug)]
        pub enum MediaType {
            $(
                #[doc = concat!("`", $mediatype, "`")]
                $variant,
            )*
        }

        impl MediaType {
            const KNOWN: &[MediaType] = &[$(MediaType::$variant),*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(MediaType::$variant => $mediatype,)*
                }
            }

            /// Coarse class of the object described by this type.
            pub fn class(&self) -> &'static str {
                match self {
                    $(MediaType::$variant => $class,)*
                }
            }
        }

        impl FromStr for MediaType {
            type Err = InvalidMediaType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($mediatype => Ok(MediaType::$variant),)*
                    _ => Err(InvalidMediaType(s.to_owned())),
                }
            }
        }
    };
}

media_types!(
    DockerFsTarGzip = "application/vnd.docker.image.rootfs.diff.tar.gzip" in "layer",
    DockerForeignFsTarGzip = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip" in "layer",
    DockerImageV1 = "application/vnd.docker.container.image.v1+json" in "image",
    DockerManifestList = "application/vnd.docker.distribution.manifest.list.v2+json" in "manifest",
    DockerManifestV1 = "application/vnd.docker.distribution.manifest.v1+json" in "manifest",
    DockerManifestV1Signed = "application/vnd.docker.distribution.manifest.v1+prettyjws" in "manifest",
    DockerManifestV2 = "application/vnd.docker.distribution.manifest.v2+json" in "manifest",
    DockerPluginV1 = "application/vnd.docker.plugin.v1+json" in "plugin",
    OciConfig = "application/vnd.oci.image.config.v1+json" in "image",
    OciFsTar = "application/vnd.oci.image.layer.v1.tar" in "layer",
    OciFsTarGzip = "application/vnd.oci.image.layer.v1.tar+gzip" in "layer",
    OciFsTarZstd = "application/vnd.oci.image.layer.v1.tar+zstd" in "layer",
    OciImageIndex = "application/vnd.oci.image.index.v1+json" in "manifest",
    OciManifestV1 = "application/vnd.oci.image.manifest.v1+json" in "manifest",
);

/// Content type used by registries for unsigned schema 1 manifests.
pub const LEGACY_JSON: &str = "application/json";

impl MediaType {
    /// Class of any media type string. Unknown types are `"unknown"`.
    pub fn class_of(media_type: &str) -> &'static str {
        MediaType::from_str(media_type)
            .map(|m| m.class())
            .unwrap_or("unknown")
    }

    /// Media types that can be sent in the `Accept` header of a
    /// manifest request.
    pub fn manifests() -> impl Iterator<Item = &'static str> {
        MediaType::KNOWN
            .iter()
            .filter(|m| m.class() == "manifest")
            .map(|m| m.as_str())
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Unknown media type: {0:?}")]
pub struct InvalidMediaType(String);

impl<'de> serde::Deserialize<'de> for MediaType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let media_type = <String as serde::Deserialize>::deserialize(deserializer)?;
        MediaType::from_str(&media_type).map_err(serde::de::Error::custom)
    }
}

#[test]
fn media_type_in_json() {
    #[derive(serde::Deserialize, Debug)]
    struct Example {
        mt: MediaType,
    }

    assert!(matches!(
        serde_json::from_str(r#"{"mt": "application/vnd.oci.image.index.v1+json"}"#),
        Ok(Example {
            mt: MediaType::OciImageIndex
        })
    ));

    let err = serde_json::from_str::<Example>(r#"{"mt": "text/plain"}"#).unwrap_err();
    assert!(err.to_string().contains("text/plain"));
}

#[test]
fn media_type_classes() {
    assert_eq!(MediaType::DockerImageV1.class(), "image");
    assert_eq!(MediaType::class_of("application/vnd.docker.plugin.v1+json"), "plugin");
    assert_eq!(MediaType::class_of("text/plain"), "unknown");

    let accept: Vec<_> = MediaType::manifests().collect();
    assert!(accept.contains(&"application/vnd.docker.distribution.manifest.v2+json"));
    assert!(!accept.contains(&"application/vnd.oci.image.layer.v1.tar"));
}
