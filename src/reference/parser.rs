//! Parse a reference to an image in a registry.
//!
//! It tries to be close to what `docker pull` does, but it does not try
//! to be bug-for-bug compatible.

use super::*;

/// Hostname to use when the reference is just the repository,
/// like `debian` or `nixos/nix`.
const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

const DEFAULT_NAMESPACE: &str = "library";

pub(super) const DEFAULT_TAG: &str = "latest";

/// Maximum length of a tag.
const MAX_TAG_LEN: usize = 128;

type Result<T> = std::result::Result<T, ParseError>;

pub(super) fn parse(reference: &str) -> Result<Reference<'_>> {
    // Extract the digest after the last `@`.
    let (base, digest) = match reference.rsplit_once("@") {
        None => (reference, None),
        Some((base, d)) => (base, Some(Digest::try_from(d.to_owned())?)),
    };

    // Extract the tag after the last `:`.
    //
    // If the value contains a `/`, it assumes that the value after `:`
    // is a port number, and not a tag.
    let (base, tag) = match base.rsplit_once(":") {
        Some((base, tag)) if !tag.contains('/') => (base, Some(tag)),
        _ => (base, None),
    };

    if let Some(tag) = tag {
        check_tag(tag)?;
    }

    // Imitate the logic from `docker pull` to get the repository.
    let (registry, repository) = match base.split_once('/') {
        // There is no `/`. The reference is an image in the
        // `library` repository.
        None => (
            DEFAULT_REGISTRY,
            Repository::components(DEFAULT_NAMESPACE, base),
        ),

        // There is a `.` or a `:` before the `/`. Parse it as a hostname.
        Some((registry, repository))
            if registry.contains('.') || registry.contains(':') || registry == "localhost" =>
        {
            (registry, Repository::full(repository))
        }

        // Assume it is a repository in the default registry.
        Some(_) => (DEFAULT_REGISTRY, Repository::full(base)),
    };

    if repository.name().is_empty() {
        return Err(ParseError::MissingRepository);
    }

    // A digest pins the content, so the tag is only informative.
    let target = match (digest, tag) {
        (Some(digest), _) => Some(Target::Digest(digest)),
        (None, Some(tag)) => Some(Target::Tag(tag)),
        (None, None) => None,
    };

    Ok(Reference {
        registry,
        repository,
        target,
    })
}

/// Tags are up to 128 word characters, dots, and dashes. The first
/// character can't be a dot or a dash.
fn check_tag(tag: &str) -> Result<()> {
    let valid = tag.len() <= MAX_TAG_LEN
        && tag
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidTag(tag.to_owned()))
    }
}

#[test]
fn parse_valid_references() {
    use crate::digest::HexString;
    use sha2::{Digest as _, Sha256, Sha512};

    macro_rules! check {
        ($reference:expr, [ $registry:expr, $repository:expr, $target:expr ]) => {
            let reference = $reference;
            assert_eq!(
                Reference::try_from(<_ as AsRef<str>>::as_ref(&reference)).unwrap(),
                Reference {
                    registry: $registry,
                    repository: $repository,
                    target: $target,
                }
            )
        };
    }

    let sha256 = HexString(Sha256::digest(b"\x00\x01"));
    let sha512 = HexString(Sha512::digest(b"\x01\x02"));

    check!(
        "foo",
        [
            DEFAULT_REGISTRY,
            Repository::components("library", "foo"),
            None
        ]
    );

    check!(
        "foo/bar",
        [DEFAULT_REGISTRY, Repository::full("foo/bar"), None]
    );

    check!(
        "example.com:5678/foo/bar:1.2.3",
        [
            "example.com:5678",
            Repository::full("foo/bar"),
            Some(Target::Tag("1.2.3"))
        ]
    );

    check!(
        "localhost:5000/foo",
        ["localhost:5000", Repository::full("foo"), None]
    );

    check!(
        &format!("example.com/foo/bar:1.2.3@sha256:{sha256}"),
        [
            "example.com",
            Repository::full("foo/bar"),
            Digest::try_from(format!("sha256:{sha256}"))
                .ok()
                .map(Target::Digest)
        ]
    );

    check!(
        &format!("example.com:1234/foo/bar@sha512:{sha512}"),
        [
            "example.com:1234",
            Repository::full("foo/bar"),
            Digest::try_from(format!("sha512:{sha512}"))
                .ok()
                .map(Target::Digest)
        ]
    );
}

#[test]
fn reject_invalid_digests() {
    use crate::digest::DigestError;

    assert!(matches!(
        Reference::try_from("debian:stable@md5:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidAlgorithm)),
    ));

    assert!(matches!(
        Reference::try_from("debian:stable@sha256:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidValue)),
    ));
}

#[test]
fn reject_invalid_tags() {
    assert!(matches!(
        Reference::try_from("debian:-stable"),
        Err(ParseError::InvalidTag(_)),
    ));

    assert!(matches!(
        Reference::try_from("debian:"),
        Err(ParseError::InvalidTag(_)),
    ));

    assert!(matches!(
        Reference::try_from("/:stable"),
        Err(ParseError::MissingRepository),
    ));
}

#[test]
fn display_references() {
    let reference = Reference::try_from("example.com/foo/bar:1.0").unwrap();
    assert_eq!(reference.to_string(), "example.com/foo/bar:1.0");
    assert_eq!(reference.name(), "example.com/foo/bar");

    let digest = Digest::sha256(b"manifest");
    let pinned = reference.with_digest(digest.clone());
    assert_eq!(pinned.to_string(), format!("example.com/foo/bar@{digest}"));
    assert_eq!(pinned.tag_or_digest(), Some(digest.source()));
}
