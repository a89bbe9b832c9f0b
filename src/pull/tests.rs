use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use crate::{
    digest::Digest,
    download::{DownloadError, LayerDownloadManager, TransferError},
    manifest::{schema1::tests::{id, v1}, ManifestError},
    metadata::BlobMetadata,
    reference::{MediaType, Reference},
    registry::RegistryError,
    store::{FsImageStore, FsLayerStore, ImageStore, LayerStore, MemoryReferenceStore, ReferenceStore},
    testing::{blob_data, Fault, MemoryRegistry, RecordEvents},
};

use super::{PullConfig, PullError, Puller};

struct Env {
    registry: MemoryRegistry,
    dir: TempDir,
    images: FsImageStore,
    layers: FsLayerStore,
    references: MemoryReferenceStore,
    metadata: BlobMetadata,
    events: RecordEvents,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tmp")).unwrap();

        Env {
            registry: MemoryRegistry::new(),
            images: FsImageStore::new(dir.path().join("images")).unwrap(),
            layers: FsLayerStore::new(dir.path().join("layers")).unwrap(),
            references: MemoryReferenceStore::new(),
            metadata: BlobMetadata::default(),
            events: RecordEvents::default(),
            dir,
        }
    }

    fn manager(&self) -> LayerDownloadManager<'_> {
        LayerDownloadManager::new(&self.layers).retry_delay(Duration::ZERO)
    }

    fn puller<'a>(&'a self, manager: &'a LayerDownloadManager<'a>) -> Puller<'a> {
        let config = PullConfig::default()
            .os("linux")
            .architecture("amd64")
            .temp_dir(self.dir.path().join("tmp"));

        Puller::new(&self.registry, &self.images)
            .download_manager(manager)
            .reference_store(&self.references)
            .metadata(&self.metadata)
            .event_handler(&self.events)
            .config(config)
    }
}

struct TestImage {
    manifest: Vec<u8>,
    manifest_digest: Digest,
    config: Digest,
    layers: Vec<Digest>,
}

fn config_json(diff_ids: &[Digest]) -> Vec<u8> {
    json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": { "type": "layers", "diff_ids": diff_ids },
    })
    .to_string()
    .into_bytes()
}

fn manifest_json(config: &Digest, config_type: &str, layers: &[Digest]) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|digest| {
            json!({
                "mediaType": MediaType::DockerFsTarGzip.as_str(),
                "size": 4000,
                "digest": digest,
            })
        })
        .collect();

    json!({
        "schemaVersion": 2,
        "mediaType": MediaType::DockerManifestV2.as_str(),
        "config": { "mediaType": config_type, "size": 100, "digest": config },
        "layers": layers,
    })
    .to_string()
    .into_bytes()
}

/// Add an image with two uncompressed layers. Its diff IDs are the
/// digests of the blobs.
fn add_image(registry: &MemoryRegistry, tag: &str, seed: u8) -> TestImage {
    let layers: Vec<_> = (0..2)
        .map(|n| registry.add_blob(blob_data(seed * 2 + n, 4000 + seed as usize)))
        .collect();

    let config = registry.add_blob(config_json(&layers));
    let manifest = manifest_json(&config, MediaType::DockerImageV1.as_str(), &layers);
    registry.add_manifest(tag, MediaType::DockerManifestV2.as_str(), manifest.clone());

    TestImage {
        manifest_digest: Digest::sha256(&manifest),
        manifest,
        config,
        layers,
    }
}

#[test]
fn pull_schema2_image() {
    let env = Env::new();
    let image = add_image(&env.registry, "v1", 1);

    let manager = env.manager();
    let puller = env.puller(&manager);
    let reference = Reference::try_from("example.com/foo/bar:v1").unwrap();

    let summary = puller.pull(&reference).unwrap();
    assert!(summary.downloaded());
    assert!(puller.is_confirmed());

    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.image_id, image.config);
    assert_eq!(outcome.manifest_digest, image.manifest_digest);
    assert!(outcome.transferred);
    assert!(outcome.tag_updated);

    for layer in &image.layers {
        assert!(env.layers.contains(layer));
    }

    let stored = env.images.get(&image.config).unwrap().unwrap();
    assert_eq!(stored.rootfs.diff_ids, image.layers);

    let digest_reference = format!("example.com/foo/bar@{}", image.manifest_digest);
    assert_eq!(env.references.get("example.com/foo/bar:v1"), Some(image.config.clone()));
    assert_eq!(env.references.get(&digest_reference), Some(image.config.clone()));

    let messages = env.events.messages.lock().unwrap().clone();
    assert_eq!(
        messages,
        [
            "Pulling from foo/bar".to_string(),
            format!("Digest: {}", image.manifest_digest),
        ]
    );

    // Temporary files are removed.
    assert_eq!(std::fs::read_dir(env.dir.path().join("tmp")).unwrap().count(), 0);

    // Pull again. The config is already in the store, so no blob
    // is requested.
    let requests = env.registry.blob_requests();

    let summary = puller.pull(&reference).unwrap();
    assert!(!summary.downloaded());
    assert!(!summary.outcomes[0].transferred);
    assert_eq!(summary.outcomes[0].image_id, image.config);
    assert_eq!(env.registry.blob_requests(), requests);

    assert_eq!(
        env.events.finished.lock().unwrap().as_slice(),
        [
            ("example.com/foo/bar:v1".to_string(), true),
            ("example.com/foo/bar:v1".to_string(), false),
        ]
    );
}

#[test]
fn repair_corrupted_config() {
    let env = Env::new();
    let image = add_image(&env.registry, "v1", 1);

    let manager = env.manager();
    let puller = env.puller(&manager);
    let reference = Reference::try_from("example.com/foo/bar:v1").unwrap();

    puller.pull(&reference).unwrap();

    let path = env
        .dir
        .path()
        .join("images/content/sha256")
        .join(image.config.hash_value());
    std::fs::write(&path, b"garbage").unwrap();

    // The config is downloaded again, and the stored file is replaced.
    let requests = env.registry.blob_requests();
    let summary = puller.pull(&reference).unwrap();
    assert!(summary.outcomes[0].transferred);
    assert_eq!(env.registry.blob_requests(), requests + 1);
    assert!(env.images.get(&image.config).unwrap().is_some());

    let requests = env.registry.blob_requests();
    let summary = puller.pull(&reference).unwrap();
    assert!(!summary.outcomes[0].transferred);
    assert_eq!(env.registry.blob_requests(), requests);
}

#[test]
fn corrupted_layer_stops_the_pull() {
    let env = Env::new();
    let image = add_image(&env.registry, "v1", 1);
    env.registry.fault(&image.layers[1], Fault::Corrupt);

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar:v1").unwrap();
    let err = env.puller(&manager).pull(&reference).unwrap_err();

    match err {
        PullError::Download(DownloadError::Transfer(TransferError::Permanent { digest, .. })) => {
            assert_eq!(digest, image.layers[1]);
        }

        e => panic!("Unexpected error: {e}"),
    }

    assert!(env.images.get(&image.config).unwrap().is_none());
    assert!(env.references.references().is_empty());
}

#[test]
fn config_error_cancels_layers() {
    let env = Env::new();
    let image = add_image(&env.registry, "v1", 1);
    env.registry.fault(&image.config, Fault::Status(404));
    for layer in &image.layers {
        env.registry.fault(layer, Fault::Stall(Duration::from_millis(5)));
    }

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar:v1").unwrap();
    let err = env.puller(&manager).pull(&reference).unwrap_err();

    match err {
        PullError::ImageConfig(e) => {
            assert!(matches!(*e, PullError::Registry(RegistryError::Status { status: 404, .. })));
        }

        e => panic!("Unexpected error: {e}"),
    }

    for layer in &image.layers {
        assert!(env.registry.requests(layer).len() <= 1);
        assert!(!env.layers.contains(layer));
    }
}

#[test]
fn reject_inconsistent_rootfs() {
    let env = Env::new();
    let layers: Vec<_> = (0..2)
        .map(|n| env.registry.add_blob(blob_data(n, 1000)))
        .collect();

    // The config declares only one layer.
    let config = env.registry.add_blob(config_json(&layers[..1]));
    let manifest = manifest_json(&config, MediaType::DockerImageV1.as_str(), &layers);
    env.registry
        .add_manifest("v1", MediaType::DockerManifestV2.as_str(), manifest);

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar:v1").unwrap();

    match env.puller(&manager).pull(&reference) {
        Err(e @ PullError::RootFsMismatch { .. }) => {
            let message = e.to_string();
            assert!(message.contains("example.com/foo/bar:v1"));
            assert!(message.contains(&config.to_string()));
        }

        r => panic!("Unexpected result: {r:?}"),
    }

    assert!(env.images.get(&config).unwrap().is_none());
}

#[test]
fn reject_config_media_type() {
    let env = Env::new();
    let layers = [env.registry.add_blob(blob_data(1, 100))];
    let config = env.registry.add_blob(config_json(&layers));
    let manifest = manifest_json(&config, MediaType::DockerPluginV1.as_str(), &layers);
    env.registry
        .add_manifest("v1", MediaType::DockerManifestV2.as_str(), manifest);

    let manager = env.manager();
    let puller = env.puller(&manager);
    let reference = Reference::try_from("example.com/foo/bar:v1").unwrap();

    match puller.pull(&reference) {
        Err(PullError::ConfigMediaTypeRejected { media_type, class }) => {
            assert_eq!(media_type, MediaType::DockerPluginV1.as_str());
            assert_eq!(class, "plugin");
        }

        r => panic!("Unexpected result: {r:?}"),
    }

    assert!(!puller.is_confirmed());
    assert_eq!(env.registry.blob_requests(), 0);
}

#[test]
fn pull_by_digest() {
    let env = Env::new();
    let image = add_image(&env.registry, "v1", 1);
    env.registry.add_manifest(
        image.manifest_digest.source(),
        MediaType::DockerManifestV2.as_str(),
        image.manifest.clone(),
    );

    let manager = env.manager();
    let name = format!("example.com/foo/bar@{}", image.manifest_digest);
    let reference = Reference::try_from(name.as_str()).unwrap();

    let summary = env.puller(&manager).pull(&reference).unwrap();
    assert_eq!(summary.outcomes[0].manifest_digest, image.manifest_digest);
    assert_eq!(env.references.get(&name), Some(image.config.clone()));
    assert_eq!(env.references.references().len(), 1);

    // Manifest that does not match the requested digest.
    let other = Digest::sha256(b"other");
    env.registry.add_manifest(
        other.source(),
        MediaType::DockerManifestV2.as_str(),
        image.manifest.clone(),
    );

    let name = format!("example.com/foo/bar@{other}");
    let reference = Reference::try_from(name.as_str()).unwrap();

    assert!(matches!(
        env.puller(&manager).pull(&reference),
        Err(PullError::Manifest(ManifestError::DigestMismatch { .. }))
    ));
}

#[test]
fn select_from_manifest_list() {
    let env = Env::new();

    let amd64 = add_image(&env.registry, "amd64", 1);
    let arm64 = add_image(&env.registry, "arm64", 2);

    let entry = |image: &TestImage, arch: &str| {
        env.registry.add_manifest(
            image.manifest_digest.source(),
            MediaType::DockerManifestV2.as_str(),
            image.manifest.clone(),
        );

        json!({
            "mediaType": MediaType::DockerManifestV2.as_str(),
            "size": image.manifest.len(),
            "digest": image.manifest_digest,
            "platform": { "architecture": arch, "os": "linux" },
        })
    };

    let list = json!({
        "schemaVersion": 2,
        "mediaType": MediaType::DockerManifestList.as_str(),
        "manifests": [entry(&amd64, "amd64"), entry(&arm64, "arm64")],
    })
    .to_string();

    env.registry
        .add_manifest("latest", MediaType::DockerManifestList.as_str(), list.clone());

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar:latest").unwrap();

    let config = PullConfig::default().os("linux").architecture("arm64");
    let summary = env
        .puller(&manager)
        .config(config)
        .pull(&reference)
        .unwrap();

    assert_eq!(summary.outcomes[0].image_id, arm64.config);
    assert_eq!(summary.outcomes[0].manifest_digest, Digest::sha256(&list));
    assert!(env.registry.requests(&amd64.layers[0]).is_empty());

    let config = PullConfig::default().os("linux").architecture("s390x");
    match env.puller(&manager).config(config).pull(&reference) {
        Err(PullError::NoMatchingManifest {
            reference,
            architecture,
            ..
        }) => {
            assert_eq!(reference, "example.com/foo/bar:latest");
            assert_eq!(architecture, "s390x");
        }

        r => panic!("Unexpected result: {r:?}"),
    }
}

#[test]
fn pull_schema1_image() {
    let env = Env::new();

    let base = env.registry.add_blob(blob_data(1, 3000));
    let top = env.registry.add_blob(blob_data(2, 3000));
    let empty = env.registry.add_blob(blob_data(3, 32));

    // Layers are listed from top to bottom.
    let history = [
        (&empty, v1(&id(3), &id(2), true)),
        (&top, v1(&id(2), &id(1), false)),
        (&base, v1(&id(1), "", false)),
    ];

    let manifest = json!({
        "schemaVersion": 1,
        "name": "foo/bar",
        "tag": "v1",
        "architecture": "amd64",
        "fsLayers": history.iter().map(|(d, _)| json!({ "blobSum": d })).collect::<Vec<_>>(),
        "history": history.iter().map(|(_, h)| json!({ "v1Compatibility": h })).collect::<Vec<_>>(),
    })
    .to_string();

    env.registry
        .add_manifest("v1", MediaType::DockerManifestV1.as_str(), manifest.clone());

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar:v1").unwrap();
    let summary = env.puller(&manager).pull(&reference).unwrap();

    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.manifest_digest, Digest::sha256(&manifest));

    let image = env.images.get(&outcome.image_id).unwrap().unwrap();
    assert_eq!(image.rootfs.diff_ids, [base.clone(), top.clone()]);

    let config: serde_json::Value = serde_json::from_slice(&image.config).unwrap();
    assert!(config.get("id").is_none());
    assert!(config.get("parent").is_none());
    assert_eq!(config["history"].as_array().unwrap().len(), 3);
    assert_eq!(config["history"][2]["empty_layer"], true);

    assert!(env.registry.requests(&empty).is_empty());

    // Rejected if schema 2 is required.
    let config = PullConfig::default().require_schema2(true);
    assert!(matches!(
        env.puller(&manager).config(config).pull(&reference),
        Err(PullError::NotSchema2(_))
    ));
}

#[test]
fn pull_all_tags() {
    let env = Env::new();
    let v1 = add_image(&env.registry, "v1", 1);
    let v2 = add_image(&env.registry, "v2", 2);

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar").unwrap();
    let summary = env.puller(&manager).pull(&reference).unwrap();

    let ids: Vec<_> = summary.outcomes.iter().map(|o| &o.image_id).collect();
    assert_eq!(ids, [&v1.config, &v2.config]);

    assert_eq!(env.references.get("example.com/foo/bar:v2"), Some(v2.config.clone()));
}

#[test]
fn pull_all_tags_continues_after_errors() {
    let env = Env::new();

    let layers = [env.registry.add_blob(blob_data(1, 100))];
    let config = env.registry.add_blob(config_json(&layers));
    let manifest = manifest_json(&config, "application/x-unknown", &layers);
    env.registry
        .add_manifest("v1", MediaType::DockerManifestV2.as_str(), manifest);

    let v2 = add_image(&env.registry, "v2", 2);

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar").unwrap();

    match env.puller(&manager).pull(&reference) {
        Err(PullError::Tags(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, "v1");
            assert!(matches!(
                failures[0].1,
                PullError::ConfigMediaTypeRejected { class: "unknown", .. }
            ));
        }

        r => panic!("Unexpected result: {r:?}"),
    }

    assert!(env.images.get(&v2.config).unwrap().is_some());
}

#[test]
fn fallback_before_confirmation() {
    let env = Env::new();
    env.registry.manifest_error("v1", 404, "MANIFEST_UNKNOWN");
    add_image(&env.registry, "v2", 2);

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar").unwrap();

    match env.puller(&manager).pull(&reference) {
        Err(PullError::Fallback(e)) => {
            assert!(e.allowed());
            assert!(e.transport_ok);
        }

        r => panic!("Unexpected result: {r:?}"),
    }

    // Nothing was pulled after the fallback.
    assert_eq!(env.registry.blob_requests(), 0);
}

#[test]
fn no_fallback_after_confirmation() {
    let env = Env::new();
    add_image(&env.registry, "v1", 1);
    env.registry.manifest_error("v2", 404, "MANIFEST_UNKNOWN");

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar").unwrap();

    let err = env.puller(&manager).pull(&reference).unwrap_err();
    assert!(matches!(err, PullError::Registry(RegistryError::Status { status: 404, .. })));

    // A tagged pull also reports that the protocol was confirmed.
    let reference = Reference::try_from("example.com/foo/bar:v2").unwrap();
    match env.puller(&manager).confirmed(true).pull(&reference) {
        Err(PullError::Fallback(e)) => assert!(!e.allowed()),
        r => panic!("Unexpected result: {r:?}"),
    }
}

#[test]
fn empty_repository() {
    let env = Env::new();
    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar").unwrap();

    let summary = env.puller(&manager).pull(&reference).unwrap();
    assert!(summary.outcomes.is_empty());
    assert!(!summary.downloaded());
}

#[test]
fn existing_tag_is_not_updated() {
    let env = Env::new();
    let image = add_image(&env.registry, "v1", 1);

    // Config stored by a previous pull, but without the digest reference.
    env.images.put(&config_json(&image.layers)).unwrap();
    env.references
        .add_tag("example.com/foo/bar:v1", &image.config, false)
        .unwrap();

    let manager = env.manager();
    let reference = Reference::try_from("example.com/foo/bar:v1").unwrap();
    let summary = env.puller(&manager).pull(&reference).unwrap();

    assert!(!summary.downloaded());
    assert_eq!(env.references.references().len(), 2);
}
