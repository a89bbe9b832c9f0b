
use std::{net::SocketAddr, str::FromStr, sync::RwLock, time::Duration};

use crate::{
    digest::Digest,
    reference::MediaType,
    registry::{BlobReader, ErrorDetail, Registry, RegistryError},
    EventHandler,
};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Header sent by registries that implement the V2 API.
const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";

const API_VERSION: &str = "registry/2.0";

/// Maximum time without receiving data from the registry.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of tags requested on each page of `tags/list`.
const TAGS_PAGE_SIZE: usize = 100;

impl From<ureq::Error> for RegistryError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Status(416, _) => RegistryError::RangeNotSatisfiable,
            ureq::Error::Status(status, response) => status_error(status, response),
            ureq::Error::Transport(t) => RegistryError::Transport(t.to_string()),
        }
    }
}

/// Build a [`RegistryError`] from a failed response. The body may
/// contain a list of error codes.
fn status_error(status: u16, response: ureq::Response) -> RegistryError {
    #[derive(serde::Deserialize, Default)]
    struct Body {
        #[serde(default)]
        errors: Vec<ErrorDetail>,
    }

    let url = response.get_url().to_owned();
    let body: Body = response
        .into_string()
        .ok()
        .and_then(|b| serde_json::from_str(&b).ok())
        .unwrap_or_default();

    RegistryError::Status {
        status,
        url,
        errors: body.errors,
    }
}

/// HTTP client for the Docker Registry HTTP API V2.
pub struct Client<'a, E: ?Sized> {
    event_handler: &'a E,
    agent: ureq::Agent,
    auth_token: RwLock<Option<String>>,
    credentials: Option<String>,
    host: String,
}

impl<'a, E> Client<'a, E>
where
    E: EventHandler + ?Sized,
{
    /// Create a new HTTP client to the `registry` host.
    ///
    /// It tries to guess the URI scheme for the registry:
    ///
    /// * If it is a loopback IP (like `127.0.0.1`), or if the port
    ///   is `:80`, it uses `http://`.
    /// * In any other case, it uses `https://`.
    pub fn new(registry: &str, event_handler: &'a E) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .user_agent(USER_AGENT)
            .build();

        Client {
            event_handler,
            agent,
            auth_token: Default::default(),
            credentials: None,
            host: format!("{}{}/v2", guess_scheme(registry), registry),
        }
    }

    /// Use basic authentication when requesting a token.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        use base64::Engine as _;

        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        self.credentials = Some(format!("Basic {encoded}"));
        self
    }

    /// Send a `GET` request to the registry.
    ///
    /// The path must not include the `v2/` prefix.
    pub(crate) fn get(&self, path: &str, accept: Option<&str>) -> Result<ureq::Response, RegistryError> {
        let url = format!("{}/{}", self.host, path);
        let mut request = self.agent.get(&url);
        if let Some(accept) = accept {
            request = request.set("Accept", accept);
        }

        self.send(request)
    }

    /// Send a request to the registry.
    ///
    /// If it responds with a `401` error, get the token from the
    /// URL in the `WWW-Authenticate` header.
    fn send(&self, request: ureq::Request) -> Result<ureq::Response, RegistryError> {
        self.event_handler.registry_request(request.url());

        // Poisoned locks only mean that another thread panicked while
        // updating the token, so the stored value is still usable.
        let auth_token = self.auth_token.read().unwrap_or_else(|e| e.into_inner());
        if let Some(auth) = auth_token.as_deref() {
            return Ok(request.set("Authorization", auth).call()?);
        }

        drop(auth_token);
        let mut auth_token = self.auth_token.write().unwrap_or_else(|e| e.into_inner());

        // Try a request with no token.

        let response = match request.clone().call() {
            Ok(r) => return Ok(r),
            Err(ureq::Error::Status(401, r)) => r,
            Err(e) => return Err(e.into()),
        };

        // Request a token if the response from the 401 includes the
        // WWW-Authenticate header.
        //
        // The response from the `realm` URL must include either
        // `token` or `access_token`.

        let challenge = response.header("www-authenticate").unwrap_or_default();

        if let (Some(basic), true) = (&self.credentials, challenge.starts_with("Basic")) {
            *auth_token = Some(basic.clone());
            drop(auth_token);
            return self.send(request);
        }

        let Some(mut auth_request) = build_auth_request(&self.agent, challenge) else {
            return Err(RegistryError::MissingCredentials);
        };

        if let Some(basic) = &self.credentials {
            auth_request = auth_request.set("Authorization", basic);
        }

        self.event_handler.registry_auth(auth_request.url());

        #[derive(serde::Deserialize, Debug)]
        struct Tokens {
            token: Option<String>,
            access_token: Option<String>,
        }

        let mut token = match serde_json::from_reader(auth_request.call()?.into_reader())? {
            Tokens { token: Some(t), .. } => t,
            Tokens {
                access_token: Some(t),
                ..
            } => t,
            _ => return Err(RegistryError::MissingTokens),
        };

        token.insert_str(0, "Bearer ");
        *auth_token = Some(token);
        drop(auth_token);

        // Repeat the request, now that we have a token.
        self.send(request)
    }
}

impl<E> Registry for Client<'_, E>
where
    E: EventHandler + ?Sized,
{
    fn ping(&self) -> Result<bool, RegistryError> {
        let request = self.agent.get(&format!("{}/", self.host));
        self.event_handler.registry_request(request.url());

        // The endpoint may require authentication. A 401 is still a valid
        // answer for the version check.
        let response = match request.call() {
            Ok(r) => r,
            Err(ureq::Error::Status(401, r)) => r,
            Err(e) => return Err(e.into()),
        };

        Ok(response
            .all(API_VERSION_HEADER)
            .iter()
            .flat_map(|h| h.split(' '))
            .any(|v| v == API_VERSION))
    }

    fn tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        #[derive(serde::Deserialize)]
        struct TagList {
            tags: Option<Vec<String>>,
        }

        let mut tags = Vec::new();
        let mut path = format!("{repository}/tags/list?n={TAGS_PAGE_SIZE}");

        loop {
            let response = self.get(&path, None)?;
            let next = response.header("Link").and_then(next_page_path);

            let page: TagList = serde_json::from_reader(response.into_reader())?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(n) => path = n,
                None => return Ok(tags),
            }
        }
    }

    fn manifest(
        &self,
        repository: &str,
        tag_or_digest: &str,
    ) -> Result<(String, Vec<u8>), RegistryError> {
        let accept = MediaType::manifests()
            .chain([crate::reference::mediatype::LEGACY_JSON])
            .collect::<Vec<_>>()
            .join(", ");

        let response = self.get(
            &format!("{repository}/manifests/{tag_or_digest}"),
            Some(&accept),
        )?;

        let content_type = response
            .header("Content-Type")
            .map(str::to_owned)
            .ok_or_else(|| RegistryError::MissingContentType(response.get_url().to_owned()))?;

        let mut body = Vec::new();
        std::io::Read::read_to_end(&mut response.into_reader(), &mut body)?;

        Ok((content_type, body))
    }

    fn blob(
        &self,
        repository: &str,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobReader, RegistryError> {
        let url = format!("{}/{}/blobs/{}", self.host, repository, digest);
        let mut request = self.agent.get(&url);
        if offset > 0 {
            request = request.set("Range", &format!("bytes={offset}-"));
        }

        let response = self.send(request)?;

        let content_length = response
            .header("Content-Length")
            .and_then(|l| l.parse::<u64>().ok());

        // With a 206, the body starts at the requested offset, and the
        // full size is in `Content-Range`. With a 200, the registry
        // ignored the range and sent the whole blob.
        let (start, total) = if response.status() == 206 {
            let total = response
                .header("Content-Range")
                .and_then(|r| r.rsplit_once('/'))
                .and_then(|(_, t)| t.parse().ok())
                .or(content_length.map(|l| l + offset));

            (offset, total)
        } else {
            (0, content_length)
        };

        Ok(BlobReader {
            body: Box::new(response.into_reader()),
            start,
            total,
        })
    }
}

fn guess_scheme(registry: &str) -> &'static str {
    const HTTP: &str = "http://";
    const HTTPS: &str = "https://";

    if registry.ends_with(":80") {
        return HTTP;
    }

    if let Ok(address) = SocketAddr::from_str(registry) {
        let loopback = match address {
            SocketAddr::V4(v4) => v4.ip().is_loopback(),
            SocketAddr::V6(v6) => v6.ip().is_loopback(),
        };

        return if loopback { HTTP } else { HTTPS };
    }

    HTTPS
}

/// Parse a `WWW-Authenticate` header and build the request to
/// get the authentication token.
///
/// Return `None` if the header can't be parsed.
///
/// See <https://distribution.github.io/distribution/spec/auth/token/>
/// for more details.
fn build_auth_request(agent: &ureq::Agent, auth_spec: &str) -> Option<ureq::Request> {
    let mut request = None;
    let mut pending_params = vec![];
    let mut tail = auth_spec;

    // The first token must be `Bearer`
    tail = tail.strip_prefix("Bearer ")?;

    loop {
        let (key, value) = tail.split_once('=')?;
        let key = key.trim_ascii();
        let (value, after) = value.strip_prefix('"')?.split_once('"')?;

        if key == "realm" {
            request = Some(
                pending_params
                    .drain(..)
                    .fold(agent.get(value), |r, (k, v)| r.query(k, v)),
            );
        } else {
            match request.take() {
                Some(r) => request = Some(r.query(key, value)),
                None => pending_params.push((key, value)),
            }
        }

        tail = match after.trim_ascii_start() {
            "" => return request,
            t => t.strip_prefix(',')?,
        };
    }
}

/// Extract the path for the next page from a `Link` header, like
/// `</v2/foo/tags/list?n=100&last=b>; rel="next"`.
///
/// The returned path does not include the `/v2/` prefix.
fn next_page_path(link: &str) -> Option<String> {
    let (target, params) = link.split_once(';')?;

    if !params.contains(r#"rel="next""#) {
        return None;
    }

    let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;

    // The link can be absolute.
    let path = match target.find("/v2/") {
        Some(pos) => &target[pos + 4..],
        None => target.trim_start_matches('/'),
    };

    Some(path.to_owned())
}
