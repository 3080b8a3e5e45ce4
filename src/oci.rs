use std::fmt::{Display, Formatter};
use thiserror::Error;

const DEFAULT_REGISTRY_HOST: &str = "docker.io";

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("digest {0:?} is not of the form <algorithm>:<hex>")]
    DigestFormat(String),

    #[error("unsupported digest algorithm {0:?}")]
    DigestAlgorithm(String),

    #[error("digest {0:?} has the wrong length for its algorithm")]
    DigestLength(String),
}

/// Identifier of an image inside the local build engine.
/// Only meaningful on the machine that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ImageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-addressed identity of a published image, e.g. `sha256:0123…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest(String);

impl Digest {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::DigestFormat(s.to_string()))?;

        let expected_len = match algorithm {
            "sha256" => 64,
            "sha512" => 128,
            _ => return Err(Error::DigestAlgorithm(algorithm.to_string())),
        };
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::DigestFormat(s.to_string()));
        }
        if hex.len() != expected_len {
            return Err(Error::DigestLength(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `repository@digest`, the only form of reference handed to attestation tools.
pub struct DigestRef<'a> {
    pub repository: &'a str,
    pub digest: &'a Digest,
}

impl Display for DigestRef<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repository, self.digest)
    }
}

pub fn digest_reference(repository: &str, digest: &Digest) -> String {
    DigestRef { repository, digest }.to_string()
}

/// Host part of a repository reference, following the docker convention
/// that a first segment without `.` or `:` is a Docker Hub namespace.
pub fn registry_host(repository: &str) -> &str {
    match repository.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first
        }
        _ => DEFAULT_REGISTRY_HOST,
    }
}

/// Final path segment of a reference.
pub fn last_segment(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}
