use std::{io::Write, path::Path};

use flate2::write::GzEncoder;
use image_pull::{Digest, MediaType};
use serde::Serialize as _;

/// Content of a blob in the test registry.
#[derive(Clone, Debug)]
pub struct Blob {
    pub media_type: MediaType,
    pub digest: Digest,
    pub data: Vec<u8>,

    /// Digest of the uncompressed data.
    pub diff_id: Digest,
}

impl serde::Serialize for Blob {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_json::json!({
            "mediaType": self.media_type.as_str(),
            "digest": self.digest,
            "size": self.data.len(),
        })
        .serialize(serializer)
    }
}

impl Blob {
    pub fn new(media_type: MediaType, data: impl Into<Vec<u8>>) -> Blob {
        let data = data.into();
        let digest = Digest::sha256(&data);

        Blob {
            media_type,
            diff_id: digest.clone(),
            digest,
            data,
        }
    }

    /// Return a builder to create a layer.
    pub fn archive(media_type: MediaType) -> BlobArchive {
        BlobArchive {
            media_type,
            archive: tar::Builder::new(Vec::with_capacity(4096)),
        }
    }
}

pub struct BlobArchive {
    media_type: MediaType,
    archive: tar::Builder<Vec<u8>>,
}

impl BlobArchive {
    /// Build the tarball, and compress it according to the media type.
    pub fn build(self) -> Blob {
        let tarball = self.archive.into_inner().unwrap();

        let data = match self.media_type {
            MediaType::DockerFsTarGzip | MediaType::OciFsTarGzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Default::default());
                encoder.write_all(&tarball).unwrap();
                encoder.finish().unwrap()
            }

            #[cfg(feature = "zstd")]
            MediaType::OciFsTarZstd => zstd::stream::encode_all(&tarball[..], 0).unwrap(),

            _ => tarball.clone(),
        };

        Blob {
            media_type: self.media_type,
            digest: Digest::sha256(&data),
            diff_id: Digest::sha256(&tarball),
            data,
        }
    }

    pub fn directory(mut self, path: impl AsRef<Path>) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::dir());
        header.set_size(0);
        header.set_cksum();
        self.archive.append(&header, &b""[..]).unwrap();
        self
    }

    pub fn regular(mut self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::file());
        header.set_size(data.len() as u64);
        header.set_cksum();
        self.archive.append(&header, data).unwrap();
        self
    }
}

/// Image with a schema 2 manifest.
pub struct Image {
    pub config: Blob,
    pub layers: Vec<Blob>,
}

impl Image {
    /// Create an image with a config for `layers`.
    pub fn new(layers: Vec<Blob>) -> Image {
        let diff_ids: Vec<_> = layers.iter().map(|l| &l.diff_id).collect();

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Cmd": ["/bin/sh"] },
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        });

        let config = Blob::new(MediaType::DockerImageV1, config.to_string());

        Image { config, layers }
    }

    pub fn manifest(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MediaType::DockerManifestV2.as_str(),
            "config": self.config,
            "layers": self.layers,
        }))
        .unwrap()
    }

    pub fn manifest_digest(&self) -> Digest {
        Digest::sha256(self.manifest())
    }
}
