use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

/// Name of the configuration file picked up from the build context.
pub const DEFAULT_CONFIG_FILE: &str = "dbp.toml";

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: PathBuf },

    #[error("parse {path}: {err}")]
    Parse { err: toml::de::Error, path: PathBuf },
}

/// A dbp.toml file.
#[derive(Deserialize, Debug, Clone)]
pub struct File {
    pub description: Option<String>,
    pub cache: Cache,
    pub scan: Scan,
    pub sbom: Sbom,
    pub provenance: Provenance,
    #[serde(default)]
    pub attestation: Attestation,
}

impl Default for File {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl File {
    /// Read a user configuration file and merge it over the built-in defaults.
    /// Keys missing from the user file keep their default value.
    pub fn default_with_user_config_file(path: &Path) -> Result<Self, Error> {
        let user = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.to_path_buf(),
        })?;
        Self::default_with_user_config(&user).map_err(|err| Error::Parse {
            err,
            path: path.to_path_buf(),
        })
    }

    fn default_with_user_config(user: &str) -> Result<Self, toml::de::Error> {
        let mut merged: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
        let user: toml::Table = toml::from_str(user)?;
        merge(&mut merged, user);
        toml::Value::Table(merged).try_into()
    }
}

fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                merge(base_table, overlay_table)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Cache {
    /// Directory the verification build writes its layer cache to.
    pub local_dir: PathBuf,
    /// Tag under the registry reference that holds the registry layer cache.
    pub registry_tag: String,
    #[serde_inline_default(true)]
    pub probe_registry: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Scan {
    /// File name pattern of forbidden credential files. One `*` wildcard.
    pub pattern: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Sbom {
    pub output_dir: PathBuf,
    pub format: String,
    pub predicate_type: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Provenance {
    pub predicate_type: String,
    pub build_type: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Attestation {
    /// Signing key passed to cosign. Keyless signing when unset.
    pub key: Option<String>,
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    pub fn load_default_configuration() {
        let cfg = File::default();
        assert_eq!(cfg.description, Some("Default configuration file".into()));
        assert_eq!(cfg.cache.local_dir, PathBuf::from("/tmp/.buildx-cache"));
        assert_eq!(cfg.cache.registry_tag, "buildcache");
        assert!(cfg.cache.probe_registry);
        assert_eq!(cfg.scan.pattern, "gha-creds-*.json");
        assert_eq!(cfg.sbom.predicate_type, "https://cyclonedx.org/bom");
        assert_eq!(cfg.provenance.predicate_type, "https://slsa.dev/provenance/v1");
        assert_eq!(cfg.attestation.key, None);
    }

    #[test]
    pub fn user_configuration_overrides_defaults() {
        let cfg = File::default_with_user_config(
            r#"
            [cache]
            local_dir = "/var/cache/buildx"
            probe_registry = false

            [attestation]
            key = "cosign.key"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cache.local_dir, PathBuf::from("/var/cache/buildx"));
        assert!(!cfg.cache.probe_registry);
        assert_eq!(cfg.cache.registry_tag, "buildcache");
        assert_eq!(cfg.scan.pattern, "gha-creds-*.json");
        assert_eq!(cfg.attestation.key.as_deref(), Some("cosign.key"));
    }

    #[test]
    pub fn missing_user_configuration_file() {
        let err = File::default_with_user_config_file(Path::new("/nonexistent/dbp.toml"));
        assert!(matches!(err, Err(Error::ReadFile { .. })));
    }

    #[test]
    pub fn invalid_user_configuration() {
        assert!(File::default_with_user_config("[cache]\nlocal_dir = 3").is_err());
    }
}
