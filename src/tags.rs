use crate::oci;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("tag list is empty")]
    NoTags,
}

/// Fully qualified tags for one build. `primary` is always the first entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSet {
    entries: Vec<String>,
    short_name: String,
}

impl TagSet {
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn primary(&self) -> &str {
        // normalize() refuses to build an empty set
        &self.entries[0]
    }

    /// Final path segment of the registry reference, e.g. `app` for `ghcr.io/org/app`.
    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn csv(&self) -> String {
        self.entries.join(",")
    }
}

/// Split a comma separated tag input, dropping blank items.
pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(String::from)
        .collect()
}

/// Qualify every raw tag with `registry`.
///
/// A raw tag that already contains a colon is taken to be fully qualified and
/// is kept verbatim. Note that this includes strings such as `sha256:abcdef`.
/// Order is preserved and duplicates are kept.
pub fn normalize(raw_tags: &[String], registry: &str) -> Result<TagSet, Error> {
    if raw_tags.is_empty() {
        return Err(Error::NoTags);
    }

    let entries = raw_tags
        .iter()
        .map(|tag| {
            if tag.contains(':') {
                tag.clone()
            } else {
                format!("{registry}:{tag}")
            }
        })
        .collect();

    Ok(TagSet {
        entries,
        short_name: oci::last_segment(registry).to_string(),
    })
}
