use log::{debug, warn};
use std::io::Write;
use std::path::PathBuf;

pub const APP_NAME: &str = "app-name";
pub const FULL_IMAGE_NAME: &str = "full-image-name";
pub const TAGS: &str = "tags";
pub const IMAGE_ID: &str = "image-id";
pub const DIGEST: &str = "digest";
pub const SBOM_NAME: &str = "sbom-name";

/// Key/value results of a run, mirrored to `$GITHUB_OUTPUT` when set.
#[derive(Debug, Default)]
pub struct Outputs {
    path: Option<PathBuf>,
    values: Vec<(String, String)>,
}

impl Outputs {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            values: Vec::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var_os("GITHUB_OUTPUT").map(PathBuf::from))
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        debug!("output {key}={value}");
        if let Some(path) = &self.path {
            let written = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| file.write_all(output_line(key, &value).as_bytes()));
            if let Err(err) = written {
                warn!("could not write output {key} to {}: {err}", path.display());
            }
        }
        self.values.retain(|(k, _)| k != key);
        self.values.push((key.to_string(), value));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One `$GITHUB_OUTPUT` record. Values spanning lines use the heredoc form
/// so they cannot start a record of their own.
fn output_line(key: &str, value: &str) -> String {
    if value.contains(|c: char| c == '\n' || c == '\r') {
        let delimiter = format!("ghadelimiter_{}", sha256::digest(value));
        format!("{key}<<{delimiter}\n{value}\n{delimiter}\n")
    } else {
        format!("{key}={value}\n")
    }
}
