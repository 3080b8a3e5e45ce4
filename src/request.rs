use crate::tags;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("registry reference is empty")]
    EmptyRegistry,

    #[error("registry reference {0:?} is invalid: {1}")]
    InvalidRegistry(String, &'static str),

    #[error("no {0} platform given")]
    NoPlatforms(&'static str),

    #[error("test platform must be a single platform, got {0:?}")]
    MultipleTestPlatforms(Vec<String>),

    #[error("build argument {0:?} is not of the form KEY=VALUE")]
    BuildArg(String),

    #[error("build context {0} does not exist")]
    ContextNotFound(PathBuf),

    #[error("Dockerfile {0} not found")]
    DockerfileNotFound(PathBuf),

    #[error(transparent)]
    Tags(#[from] tags::Error),
}

/// Raw pipeline inputs, exactly as they were supplied.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub test_platform: String,
    pub platforms: String,
    pub registry: String,
    pub tags: String,
    pub build_args: Option<String>,
    pub push: bool,
    pub summary: bool,
}

/// Validated inputs of a single pipeline run.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub test_platform: String,
    pub target_platforms: Vec<String>,
    pub registry: String,
    pub raw_tags: Vec<String>,
    pub build_args: BTreeMap<String, String>,
    pub push_enabled: bool,
    pub summary_enabled: bool,
}

impl BuildRequest {
    pub fn new(inputs: Inputs) -> Result<Self, Error> {
        let registry = parse_registry(&inputs.registry)?;

        let mut test_platforms = parse_platforms(&inputs.test_platform)
            .ok_or(Error::NoPlatforms("test"))?;
        if test_platforms.len() > 1 {
            return Err(Error::MultipleTestPlatforms(test_platforms));
        }
        let test_platform = test_platforms.remove(0);
        let target_platforms =
            parse_platforms(&inputs.platforms).ok_or(Error::NoPlatforms("target"))?;

        let raw_tags = tags::split_csv(&inputs.tags);
        if raw_tags.is_empty() {
            return Err(Error::Tags(tags::Error::NoTags));
        }

        let build_args = match &inputs.build_args {
            Some(raw) => parse_build_args(raw)?,
            None => BTreeMap::new(),
        };

        if !inputs.context.exists() {
            return Err(Error::ContextNotFound(inputs.context));
        }
        if !inputs.dockerfile.is_file() {
            return Err(Error::DockerfileNotFound(inputs.dockerfile));
        }

        Ok(Self {
            context: inputs.context,
            dockerfile: inputs.dockerfile,
            test_platform,
            target_platforms,
            registry,
            raw_tags,
            build_args,
            push_enabled: inputs.push,
            summary_enabled: inputs.summary,
        })
    }
}

/// Validate a registry reference such as `ghcr.io/org/app`.
pub fn parse_registry(raw: &str) -> Result<String, Error> {
    let registry = raw.trim();
    if registry.is_empty() {
        return Err(Error::EmptyRegistry);
    }
    if registry.chars().any(char::is_whitespace) {
        return Err(Error::InvalidRegistry(registry.into(), "contains whitespace"));
    }
    let repository = crate::oci::last_segment(registry);
    if repository.is_empty() {
        return Err(Error::InvalidRegistry(registry.into(), "ends with a separator"));
    }
    if repository.contains(':') || repository.contains('@') {
        return Err(Error::InvalidRegistry(
            registry.into(),
            "must not carry a tag or digest",
        ));
    }
    Ok(registry.to_string())
}

/// Comma separated platforms as an ordered set. `None` when nothing is left.
pub fn parse_platforms(raw: &str) -> Option<Vec<String>> {
    let mut platforms: Vec<String> = Vec::new();
    for platform in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if !platforms.iter().any(|p| p == platform) {
            platforms.push(platform.to_string());
        }
    }
    (!platforms.is_empty()).then_some(platforms)
}

/// Parse `KEY=VALUE,KEY2=VALUE2`. Values may contain `=`.
pub fn parse_build_args(raw: &str) -> Result<BTreeMap<String, String>, Error> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(Error::BuildArg(item.to_string())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(dir: &tempfile::TempDir) -> Inputs {
        let dockerfile = dir.path().join("Dockerfile");
        std::fs::write(&dockerfile, "FROM scratch\n").unwrap();
        Inputs {
            context: dir.path().to_path_buf(),
            dockerfile,
            test_platform: "linux/amd64".into(),
            platforms: "linux/amd64,linux/arm64".into(),
            registry: "ghcr.io/org/app".into(),
            tags: "latest".into(),
            build_args: Some("A=1,B=x=y".into()),
            push: true,
            summary: true,
        }
    }

    #[test]
    fn builds_request() {
        let dir = tempfile::tempdir().unwrap();
        let req = BuildRequest::new(inputs(&dir)).unwrap();
        assert_eq!(req.test_platform, "linux/amd64");
        assert_eq!(req.target_platforms, ["linux/amd64", "linux/arm64"]);
        assert_eq!(req.raw_tags, ["latest"]);
        assert_eq!(req.build_args.get("B").map(String::as_str), Some("x=y"));
    }

    #[test]
    fn rejects_missing_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = inputs(&dir);
        inputs.dockerfile = dir.path().join("Containerfile");
        assert!(matches!(
            BuildRequest::new(inputs),
            Err(Error::DockerfileNotFound(_))
        ));
    }

    #[test]
    fn rejects_empty_tags() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = inputs(&dir);
        inputs.tags = ",".into();
        assert_eq!(
            BuildRequest::new(inputs).unwrap_err(),
            Error::Tags(tags::Error::NoTags)
        );
    }

    #[test]
    fn rejects_multiple_test_platforms() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = inputs(&dir);
        inputs.test_platform = "linux/amd64,linux/arm64".into();
        assert!(matches!(
            BuildRequest::new(inputs),
            Err(Error::MultipleTestPlatforms(_))
        ));
    }

    #[test]
    fn validates_registry() {
        assert_eq!(parse_registry(" ghcr.io/org/app ").unwrap(), "ghcr.io/org/app");
        assert_eq!(parse_registry("localhost:5000/app").unwrap(), "localhost:5000/app");
        assert_eq!(parse_registry(""), Err(Error::EmptyRegistry));
        assert!(parse_registry("ghcr.io/org/app:latest").is_err());
        assert!(parse_registry("ghcr.io/org/app@sha256:abc").is_err());
        assert!(parse_registry("ghcr.io/org/").is_err());
        assert!(parse_registry("ghcr.io/org app").is_err());
    }

    #[test]
    fn platforms_are_an_ordered_set() {
        assert_eq!(
            parse_platforms("linux/arm64, linux/amd64,linux/arm64,"),
            Some(vec!["linux/arm64".to_string(), "linux/amd64".to_string()])
        );
        assert_eq!(parse_platforms(" , "), None);
    }

    #[test]
    fn parses_build_args() {
        let args = parse_build_args("VERSION=1.2, FLAGS=-a=b ,EMPTY=").unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args["VERSION"], "1.2");
        assert_eq!(args["FLAGS"], "-a=b");
        assert_eq!(args["EMPTY"], "");
        assert_eq!(
            parse_build_args("NOVALUE"),
            Err(Error::BuildArg("NOVALUE".into()))
        );
        assert!(parse_build_args("=x").is_err());
        assert!(parse_build_args("").unwrap().is_empty());
    }
}
