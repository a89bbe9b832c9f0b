use std::path::PathBuf;

use clap::Parser;
use image_pull::{
    download::LayerDownloadManager,
    http::Client,
    metadata::BlobMetadata,
    store::{FsImageStore, FsLayerStore, MemoryReferenceStore},
    EventHandler, PullConfig, Puller, Reference,
};

#[derive(Parser, Debug)]
struct Args {
    /// CPU architecture to download.
    #[arg(short, long)]
    arch: Option<String>,

    /// Operating system to download.
    #[arg(short, long)]
    os: Option<String>,

    /// Pull every tag of the repository.
    #[arg(short = 'A', long)]
    all_tags: bool,

    /// Maximum number of concurrent layer downloads.
    #[arg(long, default_value_t = 3)]
    max_concurrent_downloads: usize,

    /// Username for the registry. The password is read from
    /// `REGISTRY_PASSWORD`.
    #[arg(short, long)]
    username: Option<String>,

    /// Directory to store images and layers.
    #[arg(short, long)]
    root: PathBuf,

    /// Image reference.
    image: String,
}

struct Progress;

impl EventHandler for Progress {
    fn registry_auth(&self, url: &str) {
        tracing::debug!(%url, "requesting token");
    }

    fn message(&self, id: &str, message: &str) {
        if id.is_empty() {
            println!("{message}");
        } else {
            println!("{id}: {message}");
        }
    }

    fn status(&self, id: &str, action: &str) {
        println!("{id}: {action}");
    }

    fn pull_finished(&self, reference: &str, downloaded: bool) {
        if downloaded {
            println!("Status: Downloaded newer image for {reference}");
        } else {
            println!("Status: Image is up to date for {reference}");
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut reference = Reference::try_from(args.image.as_str())?;
    if !args.all_tags {
        reference = reference.with_default_tag();
    }

    let mut client = Client::new(reference.registry, &Progress);
    if let Some(username) = &args.username {
        let password = std::env::var("REGISTRY_PASSWORD").unwrap_or_default();
        client = client.with_credentials(username, &password);
    }

    let images = FsImageStore::new(args.root.join("images"))?;
    let layers = FsLayerStore::new(args.root.join("layers"))?;
    let references = MemoryReferenceStore::new();
    let metadata = BlobMetadata::default();

    let manager = LayerDownloadManager::new(&layers)
        .max_concurrent_downloads(args.max_concurrent_downloads);

    let mut config = PullConfig::default().temp_dir(args.root.join("tmp"));
    if let Some(os) = args.os {
        config = config.os(os);
    }

    if let Some(arch) = args.arch {
        config = config.architecture(arch);
    }

    std::fs::create_dir_all(args.root.join("tmp"))?;

    let summary = Puller::new(&client, &images)
        .download_manager(&manager)
        .reference_store(&references)
        .metadata(&metadata)
        .event_handler(&Progress)
        .config(config)
        .pull(&reference)?;

    for outcome in &summary.outcomes {
        tracing::info!(
            reference = %outcome.reference,
            image = %outcome.image_id,
            "pulled",
        );
    }

    Ok(())
}
