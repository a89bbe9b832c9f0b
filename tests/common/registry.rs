use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use image_pull::{Digest, MediaType};
use tiny_http::{Header, Request, Response, Server};

use super::blobs::{Blob, Image};

/// Registry server for a single repository.
pub struct TestRegistry {
    repository: &'static str,
    tags: Vec<String>,
    manifests: HashMap<String, (String, Vec<u8>)>,
    blobs: HashMap<String, Vec<u8>>,
}

/// Handle to a running [`TestRegistry`].
pub struct RunningRegistry {
    pub port: u16,
    requests: Arc<Mutex<Vec<String>>>,
}

impl RunningRegistry {
    /// Address of the repository, to be used in references.
    pub fn address(&self, repository: &str) -> String {
        format!("127.0.0.1:{}/{repository}", self.port)
    }

    /// Number of requests to the `blobs` endpoint.
    pub fn blob_requests(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.contains("/blobs/"))
            .count()
    }
}

impl TestRegistry {
    pub fn new(repository: &'static str) -> Self {
        TestRegistry {
            repository,
            tags: Vec::new(),
            manifests: HashMap::new(),
            blobs: HashMap::new(),
        }
    }

    /// Add an image, reachable by `tag` and by the digest of its manifest.
    pub fn image(mut self, tag: &str, image: &Image) -> Self {
        let manifest = image.manifest();
        let media_type = MediaType::DockerManifestV2.as_str();

        self.manifests.insert(
            image.manifest_digest().to_string(),
            (media_type.to_owned(), manifest.clone()),
        );

        self = self.manifest(tag, media_type, manifest);

        for blob in std::iter::once(&image.config).chain(&image.layers) {
            self = self.blob(blob);
        }

        self
    }

    /// Add a manifest. `reference` is a tag if it contains no `:`.
    pub fn manifest(mut self, reference: &str, media_type: &str, body: Vec<u8>) -> Self {
        if !reference.contains(':') {
            self.tags.push(reference.to_owned());
        }

        self.manifests
            .insert(reference.to_owned(), (media_type.to_owned(), body));
        self
    }

    pub fn blob(self, blob: &Blob) -> Self {
        self.raw_blob(&blob.digest, blob.data.clone())
    }

    /// Serve `data` for `digest`, even if they don't match.
    pub fn raw_blob(mut self, digest: &Digest, data: Vec<u8>) -> Self {
        self.blobs.insert(digest.to_string(), data);
        self
    }

    /// Start the server in a random port.
    pub fn start(self) -> RunningRegistry {
        let server = Server::http("127.1:0").expect("start registry server");
        let port = server.server_addr().to_ip().unwrap().port();

        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&requests);
        std::thread::spawn(move || self.run(server, log));

        RunningRegistry { port, requests }
    }

    fn run(self, server: Server, log: Arc<Mutex<Vec<String>>>) {
        let timeout = Duration::from_secs(30);

        while let Ok(Some(request)) = server.recv_timeout(timeout) {
            log.lock().unwrap().push(request.url().to_owned());
            self.handle(request);
        }
    }

    fn handle(&self, request: Request) {
        let url = request.url().to_owned();

        // Query parameters, like `?n=100` for tags, are ignored.
        let url = match url.split_once('?') {
            Some((path, _)) => path.to_owned(),
            None => url,
        };

        if url == "/v2/" {
            let response = Response::empty(200).with_header(header(
                "Docker-Distribution-API-Version",
                "registry/2.0",
            ));

            request.respond(response).expect("Send response");
            return;
        }

        let Some(path) = url
            .strip_prefix("/v2/")
            .and_then(|p| p.strip_prefix(self.repository))
        else {
            return error(request, 404, "NAME_UNKNOWN");
        };

        if path == "/tags/list" {
            let body = serde_json::json!({ "name": self.repository, "tags": self.tags });
            return send(request, 200, "application/json", body.to_string().into_bytes());
        }

        if let Some(reference) = path.strip_prefix("/manifests/") {
            return match self.manifests.get(reference) {
                Some((media_type, body)) => send(request, 200, media_type, body.clone()),
                None => error(request, 404, "MANIFEST_UNKNOWN"),
            };
        }

        if let Some(digest) = path.strip_prefix("/blobs/") {
            return match self.blobs.get(digest) {
                Some(data) => send_blob(request, data),
                None => error(request, 404, "BLOB_UNKNOWN"),
            };
        }

        error(request, 404, "UNSUPPORTED");
    }
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name, value).unwrap()
}

fn send(request: Request, status: u16, media_type: &str, body: Vec<u8>) {
    let response = Response::from_data(body)
        .with_status_code(status)
        .with_header(header("Content-Type", media_type));

    request.respond(response).expect("Send response");
}

fn error(request: Request, status: u16, code: &str) {
    let body = serde_json::json!({ "errors": [{ "code": code, "message": code }] });
    send(request, status, "application/json", body.to_string().into_bytes());
}

/// Send a blob, honoring the `Range: bytes=N-` header.
fn send_blob(request: Request, data: &[u8]) {
    let offset = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Range"))
        .and_then(|h| h.value.as_str().strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|o| o.parse::<usize>().ok());

    match offset {
        Some(offset) if offset > data.len() => {
            let response = Response::empty(416);
            request.respond(response).expect("Send response");
        }

        Some(offset) => {
            let range = format!("bytes {}-{}/{}", offset, data.len().saturating_sub(1), data.len());
            let response = Response::from_data(&data[offset..])
                .with_status_code(206)
                .with_header(header("Content-Range", &range));

            request.respond(response).expect("Send response");
        }

        None => send(request, 200, "application/octet-stream", data.to_vec()),
    }
}
