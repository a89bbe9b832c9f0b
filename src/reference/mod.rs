pub mod mediatype;
mod parser;

use std::fmt;

use crate::digest::Digest;

pub use mediatype::MediaType;

/// Errors from [`Reference::try_from`].
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("Missing repository.")]
    MissingRepository,

    #[error("Invalid tag: {0:?}")]
    InvalidTag(String),

    #[error("{0}")]
    InvalidDigest(#[from] crate::digest::DigestError),
}

/// Reference to an image in a registry.
///
/// The parser tries to be close to what `docker pull` does:
///
/// * If the reference does not include the hostname of the registry,
///   it uses Docker Hub, and the repository namespace defaults to
///   `library` if there is none. For example:
///
///   * `debian` is parsed as `registry-1.docker.io/library/debian`.
///   * `nixos/nix` is parsed as `registry-1.docker.io/nixos/nix`.
/// * It accepts any tag value after the last `:` character.
/// * It accepts a fixed digest (the last part after a `@` character), but
///   only SHA256 and SHA512. When both a tag and a digest are present, the
///   digest wins.
/// * A reference with no tag and no digest selects every tag of the
///   repository. Use [`with_default_tag`](Reference::with_default_tag)
///   to get `latest` instead.
///
/// # Examples
///
/// ```
/// # use image_pull::*;
/// const REFERENCE: &str = "registry.example.com/foo/bar:1.23.4";
///
/// let reference = Reference::try_from(REFERENCE).unwrap();
/// assert_eq!(reference.registry, "registry.example.com");
/// assert_eq!(reference.repository.namespace(), Some("foo"));
/// assert_eq!(reference.repository.name(), "bar");
/// assert_eq!(reference.tag(), Some("1.23.4"));
/// assert!(reference.digest().is_none());
/// ```
///
/// ```
/// # use image_pull::*;
/// let reference = Reference::try_from("debian").unwrap();
///
/// assert_eq!(reference.repository.to_string(), "library/debian");
/// assert!(reference.is_name_only());
/// assert_eq!(reference.with_default_tag().tag(), Some("latest"));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Reference<'a> {
    /// Address of the registry server.
    pub registry: &'a str,

    /// Repository name.
    pub repository: Repository<'a>,

    /// Tag or digest, if any.
    pub target: Option<Target<'a>>,
}

/// What a [`Reference`] points to inside its repository.
#[derive(Clone, Debug, PartialEq)]
pub enum Target<'a> {
    /// Mutable label.
    Tag(&'a str),

    /// Immutable content address of a manifest.
    Digest(Digest),
}

impl<'a> Reference<'a> {
    /// Image tag, if the reference is tagged.
    pub fn tag(&self) -> Option<&'a str> {
        match self.target {
            Some(Target::Tag(tag)) => Some(tag),
            _ => None,
        }
    }

    /// Manifest digest, if the reference is digest-qualified.
    pub fn digest(&self) -> Option<&Digest> {
        match &self.target {
            Some(Target::Digest(digest)) => Some(digest),
            _ => None,
        }
    }

    /// `true` if the reference has neither a tag nor a digest.
    pub fn is_name_only(&self) -> bool {
        self.target.is_none()
    }

    /// Value to use in the `manifests/{tag_or_digest}` endpoint.
    pub fn tag_or_digest(&self) -> Option<&str> {
        match &self.target {
            Some(Target::Tag(tag)) => Some(tag),
            Some(Target::Digest(digest)) => Some(digest.source()),
            None => None,
        }
    }

    /// Same repository, pointing to `tag`.
    pub fn with_tag<'b>(&self, tag: &'b str) -> Reference<'b>
    where
        'a: 'b,
    {
        Reference {
            registry: self.registry,
            repository: self.repository,
            target: Some(Target::Tag(tag)),
        }
    }

    /// Same repository, pointing to `digest`.
    pub fn with_digest(&self, digest: Digest) -> Reference<'a> {
        Reference {
            registry: self.registry,
            repository: self.repository,
            target: Some(Target::Digest(digest)),
        }
    }

    /// Use the `latest` tag if the reference has no tag or digest.
    pub fn with_default_tag(self) -> Reference<'a> {
        match self.target {
            Some(_) => self,
            None => self.with_tag(parser::DEFAULT_TAG),
        }
    }

    /// Repository with the registry host, like `example.com/foo/bar`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl fmt::Display for Reference<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.target {
            Some(Target::Tag(tag)) => write!(f, ":{tag}"),
            Some(Target::Digest(digest)) => write!(f, "@{digest}"),
            None => Ok(()),
        }
    }
}

/// Represents a repository name, like `library/debian`
/// or `nixos/nix`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Repository<'a>(RepositoryInner<'a>);

impl<'a> Repository<'a> {
    pub(crate) fn components(namespace: &'a str, name: &'a str) -> Self {
        Repository(RepositoryInner::Components(namespace, name))
    }

    pub(crate) fn full(name: &'a str) -> Self {
        Repository(RepositoryInner::Full(name))
    }

    /// Return the name of this repository.
    ///
    /// # Examples
    ///
    /// ```
    /// # use image_pull::*;
    /// let reference = Reference::try_from("foo/bar:stable").unwrap();
    /// assert_eq!(reference.repository.name(), "bar");
    /// ```
    pub fn name(&self) -> &str {
        match self.0 {
            RepositoryInner::Full(full) => full.split_once('/').map(|s| s.1).unwrap_or(full),
            RepositoryInner::Components(_, name) => name,
        }
    }

    /// Return the namespace of this repository, or `None` if
    /// the repository does not contain a `/` character.
    ///
    /// # Examples
    ///
    /// ```
    /// # use image_pull::*;
    /// let reference = Reference::try_from("foo/bar:stable").unwrap();
    /// assert_eq!(reference.repository.namespace(), Some("foo"));
    /// ```
    pub fn namespace(&self) -> Option<&str> {
        match self.0 {
            RepositoryInner::Full(full) => full.split_once('/').map(|s| s.0),
            RepositoryInner::Components(ns, _) => Some(ns),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum RepositoryInner<'a> {
    /// Full repository name. Namespace is optional.
    Full(&'a str),

    /// Namespace and name.
    Components(&'a str, &'a str),
}

impl fmt::Display for Repository<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            RepositoryInner::Full(full) => f.write_str(full),
            RepositoryInner::Components(a, b) => write!(f, "{a}/{b}"),
        }
    }
}

impl<'a> TryFrom<&'a str> for Reference<'a> {
    type Error = ParseError;

    fn try_from(reference: &'a str) -> Result<Self, Self::Error> {
        parser::parse(reference)
    }
}
