//! Credential leak scanning of built images.
//!
//! Every layer of the image is listed, not only the final filesystem, so a
//! credential file is found no matter which layer added it. Deleting a file
//! in a later layer does not remove it from the image: the earlier layer
//! still ships it.

use crate::docker::{self, BuildEngine};
use crate::oci::ImageId;
use log::{info, warn};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PatternError {
    #[error("pattern {0:?} must contain exactly one '*'")]
    Wildcard(String),

    #[error("pattern {0:?} must match a file name, not a path")]
    Separator(String),
}

/// File name pattern with a single `*` wildcard, e.g. `gha-creds-*.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePattern {
    prefix: String,
    suffix: String,
}

impl FilePattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.contains('/') {
            return Err(PatternError::Separator(pattern.to_string()));
        }
        match pattern.split_once('*') {
            Some((prefix, suffix)) if !suffix.contains('*') => Ok(Self {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            }),
            _ => Err(PatternError::Wildcard(pattern.to_string())),
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        file_name.len() >= self.prefix.len() + self.suffix.len()
            && file_name.starts_with(&self.prefix)
            && file_name.ends_with(&self.suffix)
    }
}

/// Number of paths whose file name matches `pattern`.
pub fn count_matches<'a>(paths: impl IntoIterator<Item = &'a PathBuf>, pattern: &FilePattern) -> usize {
    paths
        .into_iter()
        .filter_map(|path| path.file_name())
        .filter(|name| pattern.matches(&name.to_string_lossy()))
        .count()
}

/// Count forbidden credential files in a local image.
/// A positive count is a normal result, not an error.
pub fn scan(
    engine: &dyn BuildEngine,
    image_id: &ImageId,
    pattern: &FilePattern,
) -> Result<usize, docker::Error> {
    let paths = engine.list_files(image_id)?;
    let count = count_matches(&paths, pattern);
    info!(
        "Scanned {} files in image {image_id}, {count} credential file(s) found",
        paths.len()
    );
    Ok(count)
}

/// Proof that an image passed the credential scan.
/// Only [`gate`] creates one, and the push build requires one.
#[derive(Debug)]
pub struct Clearance {
    _private: (),
}

/// Turn a scan count into a clearance. Any match is a leak.
pub fn gate(count: usize) -> Result<Clearance, usize> {
    if count == 0 {
        Ok(Clearance { _private: () })
    } else {
        warn!("Image contains {count} credential file(s)");
        Err(count)
    }
}
