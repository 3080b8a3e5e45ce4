use crate::cache::CacheSpec;
use crate::oci::{self, Digest, ImageId};
use log::debug;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("docker build failed with exit code {0}")]
    Build(ExitStatus),

    #[error("docker save failed with exit code {0}")]
    Save(ExitStatus),

    #[error("saved image has no manifest.json")]
    MissingManifest,

    #[error("build did not report an image id")]
    MissingImageId,

    #[error("build did not report a digest")]
    MissingDigest,

    #[error("build metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("build reported an invalid digest: {0}")]
    Digest(#[from] oci::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// What happens to the image once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Output {
    /// Load into the local engine. Single platform only.
    Load,
    /// Push all platforms to the registry.
    Push,
}

/// Everything the build engine needs for one invocation.
#[derive(Debug, Clone)]
pub struct BuildSpec<'a> {
    pub context: &'a Path,
    pub dockerfile: &'a Path,
    pub platforms: &'a [String],
    pub build_args: &'a BTreeMap<String, String>,
    pub cache: &'a CacheSpec,
    pub tags: &'a [String],
    pub output: Output,
    /// Let the engine attach its own provenance attestation.
    pub provenance: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BuildResult {
    pub image_id: Option<ImageId>,
    pub digest: Option<Digest>,
}

/// The container build engine.
pub trait BuildEngine {
    fn build(&self, spec: &BuildSpec) -> Result<BuildResult, Error>;

    /// Paths of every file any layer of a local image contains, including
    /// files a later layer deletes.
    fn list_files(&self, image_id: &ImageId) -> Result<Vec<PathBuf>, Error>;
}

/// `docker buildx` on the local machine.
pub struct Buildx;

impl BuildEngine for Buildx {
    fn build(&self, spec: &BuildSpec) -> Result<BuildResult, Error> {
        let iidfile = tempfile::NamedTempFile::new()?;
        let metadata_file = tempfile::NamedTempFile::new()?;
        let args = buildx_args(spec, iidfile.path(), metadata_file.path());
        debug!("docker {:?}", args);

        let status = Command::new("docker")
            .args(&args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        if !status.success() {
            return Err(Error::Build(status));
        }

        let image_id = std::fs::read_to_string(iidfile.path())?;
        let metadata = std::fs::read(metadata_file.path())?;
        Ok(BuildResult {
            image_id: Some(image_id.trim())
                .filter(|id| !id.is_empty())
                .map(ImageId::new),
            digest: digest_from_metadata(&metadata)?,
        })
    }

    fn list_files(&self, image_id: &ImageId) -> Result<Vec<PathBuf>, Error> {
        let archive = tempfile::NamedTempFile::new()?;
        let status = Command::new("docker")
            .arg("save")
            .arg("--output")
            .arg(archive.path())
            .arg(image_id.as_str())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        if !status.success() {
            return Err(Error::Save(status));
        }
        debug!("Saved image {image_id} to {}", archive.path().display());
        list_saved_image(archive.path())
    }
}

#[derive(Deserialize)]
struct SavedManifest {
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Paths in every layer of a `docker save` archive.
///
/// Whiteout entries (`.wh.<name>`) are reported as the path they delete.
/// Layers must be uncompressed tar, which is what `docker save` writes.
pub fn list_saved_image(archive: &Path) -> Result<Vec<PathBuf>, Error> {
    let layers = saved_layers(archive)?;

    let mut paths = BTreeSet::new();
    let mut outer = tar::Archive::new(File::open(archive)?);
    for entry in outer.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if !layers.contains(&name) {
            continue;
        }
        let listed = list_archive(entry)?;
        debug!("Layer {name} has {} entries", listed.len());
        paths.extend(
            listed
                .into_iter()
                .map(|path| whiteout_target(&path).unwrap_or(path)),
        );
    }
    Ok(paths.into_iter().collect())
}

fn saved_layers(archive: &Path) -> Result<BTreeSet<String>, Error> {
    let mut outer = tar::Archive::new(File::open(archive)?);
    for entry in outer.entries()? {
        let entry = entry?;
        if entry.path()? == Path::new("manifest.json") {
            let manifests: Vec<SavedManifest> = serde_json::from_reader(entry)?;
            return Ok(manifests.into_iter().flat_map(|m| m.layers).collect());
        }
    }
    Err(Error::MissingManifest)
}

/// `dir/.wh.name` deletes `dir/name`. Opaque directory markers are not files.
fn whiteout_target(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let target = name.strip_prefix(".wh.")?;
    if target.starts_with(".wh.") {
        return None;
    }
    Some(match path.parent() {
        Some(parent) => parent.join(target),
        None => PathBuf::from(target),
    })
}

/// Entry paths of a tar stream.
pub fn list_archive<R: std::io::Read>(reader: R) -> Result<Vec<PathBuf>, Error> {
    let mut archive = tar::Archive::new(reader);
    let mut paths = Vec::new();
    for entry in archive.entries()? {
        paths.push(entry?.path()?.into_owned());
    }
    Ok(paths)
}

/// Command line arguments after `docker` for one build.
pub fn buildx_args(spec: &BuildSpec, iidfile: &Path, metadata_file: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["buildx".into(), "build".into()];

    args.push("--file".into());
    args.push(spec.dockerfile.into());
    args.push("--platform".into());
    args.push(spec.platforms.join(",").into());

    for (key, value) in spec.build_args {
        args.push("--build-arg".into());
        args.push(format!("{key}={value}").into());
    }

    args.push("--cache-from".into());
    args.push(spec.cache.cache_from().into());
    args.push("--cache-to".into());
    args.push(spec.cache.cache_to().into());

    for tag in spec.tags {
        args.push("--tag".into());
        args.push(tag.into());
    }

    args.push("--iidfile".into());
    args.push(iidfile.into());
    args.push("--metadata-file".into());
    args.push(metadata_file.into());

    if !spec.provenance {
        args.push("--provenance=false".into());
    }
    args.push(
        match spec.output {
            Output::Load => "--load",
            Output::Push => "--push",
        }
        .into(),
    );

    args.push(spec.context.into());
    args
}

/// Read `containerimage.digest` from a buildx metadata file.
/// An empty file means nothing was pushed.
pub fn digest_from_metadata(metadata: &[u8]) -> Result<Option<Digest>, Error> {
    if metadata.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_slice(metadata)?;
    match value.get("containerimage.digest").and_then(|d| d.as_str()) {
        Some(digest) => Ok(Some(Digest::parse(digest)?)),
        None => Ok(None),
    }
}
