//! In-memory registry to test failures that are hard to reproduce with
//! a real HTTP server.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Cursor, Read},
    sync::Mutex,
    thread,
    time::Duration,
};

use crate::{
    digest::Digest,
    registry::{BlobReader, ErrorCode, ErrorDetail, Registry, RegistryError},
    EventHandler,
};

/// Failure for the next request of a blob.
#[derive(Clone, Debug)]
pub(crate) enum Fault {
    /// Send some bytes, then fail with a connection reset.
    Interrupt(usize),

    /// Send different content.
    Corrupt,

    /// Send the full blob, ignoring the requested offset.
    IgnoreRange,

    /// Respond with an HTTP status.
    Status(u16),

    /// Wait before sending every chunk of data.
    Stall(Duration),
}

#[derive(Default)]
pub(crate) struct MemoryRegistry {
    tags: Mutex<Vec<String>>,
    manifests: Mutex<HashMap<String, (String, Vec<u8>)>>,
    manifest_errors: Mutex<HashMap<String, (u16, ErrorCode)>>,
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    faults: Mutex<HashMap<Digest, VecDeque<Fault>>>,
    requests: Mutex<Vec<(Digest, u64)>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob. Return its digest.
    pub fn add_blob(&self, data: impl Into<Vec<u8>>) -> Digest {
        let data = data.into();
        let digest = Digest::sha256(&data);
        self.blobs.lock().unwrap().insert(digest.clone(), data);
        digest
    }

    /// Add a manifest, reachable by `reference` (a tag or a digest).
    pub fn add_manifest(&self, reference: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        if !reference.contains(':') {
            self.tags.lock().unwrap().push(reference.to_owned());
        }

        self.manifests
            .lock()
            .unwrap()
            .insert(reference.to_owned(), (content_type.to_owned(), body.into()));
    }

    /// Respond to the manifest request for `reference` with an error code.
    pub fn manifest_error(&self, reference: &str, status: u16, code: &str) {
        if !reference.contains(':') {
            self.tags.lock().unwrap().push(reference.to_owned());
        }

        self.manifest_errors
            .lock()
            .unwrap()
            .insert(reference.to_owned(), (status, ErrorCode::from(code)));
    }

    pub fn fault(&self, digest: &Digest, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .entry(digest.clone())
            .or_default()
            .push_back(fault);
    }

    /// Offsets requested for `digest`.
    pub fn requests(&self, digest: &Digest) -> Vec<u64> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == digest)
            .map(|(_, o)| *o)
            .collect()
    }

    pub fn blob_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

fn status(status: u16, url: String, code: Option<ErrorCode>) -> RegistryError {
    RegistryError::Status {
        status,
        url,
        errors: code
            .into_iter()
            .map(|code| ErrorDetail {
                code,
                message: String::new(),
            })
            .collect(),
    }
}

impl Registry for MemoryRegistry {
    fn tags(&self, _repository: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.tags.lock().unwrap().clone())
    }

    fn manifest(
        &self,
        repository: &str,
        tag_or_digest: &str,
    ) -> Result<(String, Vec<u8>), RegistryError> {
        let url = format!("memory://{repository}/manifests/{tag_or_digest}");

        if let Some((code, error)) = self.manifest_errors.lock().unwrap().get(tag_or_digest) {
            return Err(status(*code, url, Some(error.clone())));
        }

        self.manifests
            .lock()
            .unwrap()
            .get(tag_or_digest)
            .cloned()
            .ok_or_else(|| status(404, url, Some(ErrorCode::ManifestUnknown)))
    }

    fn blob(
        &self,
        repository: &str,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobReader, RegistryError> {
        self.requests.lock().unwrap().push((digest.clone(), offset));

        let url = format!("memory://{repository}/blobs/{digest}");

        let Some(mut data) = self.blobs.lock().unwrap().get(digest).cloned() else {
            return Err(status(404, url, Some(ErrorCode::BlobUnknown)));
        };

        let total = data.len() as u64;
        let fault = self
            .faults
            .lock()
            .unwrap()
            .get_mut(digest)
            .and_then(|f| f.pop_front());

        if let Some(Fault::IgnoreRange) = fault {
            return Ok(BlobReader {
                body: Box::new(Cursor::new(data)),
                start: 0,
                total: Some(total),
            });
        }

        if offset > total {
            return Err(RegistryError::RangeNotSatisfiable);
        }

        let mut data = data.split_off(offset as usize);

        let body: Box<dyn Read + Send> = match fault {
            None | Some(Fault::IgnoreRange) => Box::new(Cursor::new(data)),

            Some(Fault::Status(code)) => return Err(status(code, url, None)),

            Some(Fault::Corrupt) => {
                if let Some(last) = data.last_mut() {
                    *last ^= 0xff;
                }

                Box::new(Cursor::new(data))
            }

            Some(Fault::Interrupt(n)) => {
                data.truncate(n);
                Box::new(Cursor::new(data).chain(ConnectionReset))
            }

            Some(Fault::Stall(delay)) => Box::new(Stall {
                data: Cursor::new(data),
                delay,
            }),
        };

        Ok(BlobReader {
            body,
            start: offset,
            total: Some(total),
        })
    }
}

struct ConnectionReset;

impl Read for ConnectionReset {
    fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::ConnectionReset.into())
    }
}

struct Stall {
    data: Cursor<Vec<u8>>,
    delay: Duration,
}

impl Read for Stall {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(self.delay);
        let len = buf.len().min(16);
        self.data.read(&mut buf[..len])
    }
}

/// Deterministic content for blobs.
pub(crate) fn blob_data(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// [`EventHandler`] to record status changes.
#[derive(Default)]
pub(crate) struct RecordEvents {
    pub status: Mutex<Vec<(String, String)>>,
    pub messages: Mutex<Vec<String>>,
    pub finished: Mutex<Vec<(String, bool)>>,
}

impl RecordEvents {
    pub fn has_status(&self, id: &str, action: &str) -> bool {
        self.status
            .lock()
            .unwrap()
            .iter()
            .any(|(i, a)| i == id && a == action)
    }
}

impl EventHandler for RecordEvents {
    fn message(&self, _id: &str, message: &str) {
        self.messages.lock().unwrap().push(message.to_owned());
    }

    fn status(&self, id: &str, action: &str) {
        self.status
            .lock()
            .unwrap()
            .push((id.to_owned(), action.to_owned()));
    }

    fn pull_finished(&self, reference: &str, downloaded: bool) {
        self.finished
            .lock()
            .unwrap()
            .push((reference.to_owned(), downloaded));
    }
}
