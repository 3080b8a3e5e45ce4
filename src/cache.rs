use crate::{config, oci};
use log::{debug, info};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("registry cache {locator} is unreachable: {reason}")]
    RegistryUnreachable { locator: String, reason: String },

    #[error("local cache directory {path} is not usable: {err}")]
    LocalDirectory { path: PathBuf, err: std::io::Error },
}

/// Where a build layer cache lives.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    /// An image reference in a registry, e.g. `ghcr.io/org/app:buildcache`.
    Registry(String),
    /// A directory on the build host.
    Local(PathBuf),
}

/// How much of the build is exported to a cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Layers of the final image only.
    Normal,
    /// Every intermediate layer.
    Max,
}

/// Cache policy for one build phase.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSpec {
    pub read_from: Location,
    pub write_to: Location,
    pub mode: Mode,
}

impl CacheSpec {
    /// Value for `docker buildx build --cache-from`.
    pub fn cache_from(&self) -> String {
        match &self.read_from {
            Location::Registry(reference) => format!("type=registry,ref={reference}"),
            Location::Local(path) => format!("type=local,src={}", path.display()),
        }
    }

    /// Value for `docker buildx build --cache-to`.
    pub fn cache_to(&self) -> String {
        let destination = match &self.write_to {
            Location::Registry(reference) => format!("type=registry,ref={reference}"),
            Location::Local(path) => format!("type=local,dest={}", path.display()),
        };
        match self.mode {
            Mode::Normal => destination,
            Mode::Max => format!("{destination},mode=max"),
        }
    }
}

/// Cache policies of both build phases.
///
/// The verification build reads the registry cache and seeds the local
/// directory. The push build reads that directory and writes every layer
/// back to the registry for the next run. Each phase only writes the
/// location the other phase only reads.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePlan {
    pub verification: CacheSpec,
    pub push: CacheSpec,
}

impl CachePlan {
    pub fn new(registry_cache: String, local_dir: PathBuf) -> Self {
        Self {
            verification: CacheSpec {
                read_from: Location::Registry(registry_cache.clone()),
                write_to: Location::Local(local_dir.clone()),
                mode: Mode::Normal,
            },
            push: CacheSpec {
                read_from: Location::Local(local_dir),
                write_to: Location::Registry(registry_cache),
                mode: Mode::Max,
            },
        }
    }

    pub fn from_config(registry: &str, cfg: &config::Cache) -> Self {
        Self::new(
            format!("{registry}:{}", cfg.registry_tag),
            cfg.local_dir.clone(),
        )
    }

    /// Check that every locator of both phases can be reached.
    /// Registry locators are only probed when `probe_registry` is set.
    pub async fn validate<P: RegistryProbe>(
        &self,
        probe: &P,
        probe_registry: bool,
    ) -> Result<(), Error> {
        let locations = [
            &self.verification.read_from,
            &self.verification.write_to,
            &self.push.read_from,
            &self.push.write_to,
        ];

        let mut checked: Vec<&Location> = Vec::new();
        for location in locations {
            if checked.contains(&location) {
                continue;
            }
            checked.push(location);

            match location {
                Location::Local(path) => ensure_writable_dir(path)?,
                Location::Registry(reference) if probe_registry => {
                    let host = oci::registry_host(reference);
                    debug!("Probing registry {host} for cache {reference}");
                    probe.probe(host).await.map_err(|reason| {
                        Error::RegistryUnreachable {
                            locator: reference.clone(),
                            reason,
                        }
                    })?;
                }
                Location::Registry(reference) => {
                    debug!("Skipping reachability check of {reference}");
                }
            }
        }
        info!("Build cache locations validated");
        Ok(())
    }
}

fn ensure_writable_dir(path: &Path) -> Result<(), Error> {
    let to_err = |err| Error::LocalDirectory {
        path: path.to_path_buf(),
        err,
    };
    std::fs::create_dir_all(path).map_err(to_err)?;
    tempfile::tempfile_in(path).map_err(to_err)?;
    Ok(())
}

/// Reachability check of a registry host.
#[allow(async_fn_in_trait)]
pub trait RegistryProbe {
    /// `Err` carries a human readable reason.
    async fn probe(&self, host: &str) -> Result<(), String>;
}

/// Probes the registry's `/v2/` endpoint. An authentication challenge
/// counts as reachable since credentials are set up outside this program.
///
/// Loopback registries are commonly served over plain HTTP, so for them a
/// failed HTTPS request is retried with `http://`.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: String) -> Result<(), String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::UNAUTHORIZED {
            Ok(())
        } else {
            Err(format!("registry answered {status}"))
        }
    }
}

impl RegistryProbe for HttpProbe {
    async fn probe(&self, host: &str) -> Result<(), String> {
        match self.get(format!("https://{host}/v2/")).await {
            Err(err) if is_loopback(host) => {
                debug!("HTTPS probe of {host} failed ({err}), retrying over plain HTTP");
                self.get(format!("http://{host}/v2/")).await
            }
            result => result,
        }
    }
}

/// `localhost` or a loopback address, with or without a port.
fn is_loopback(host: &str) -> bool {
    let name = match host.strip_prefix('[') {
        Some(bracketed) => bracketed.split(']').next().unwrap_or(bracketed),
        None => host.split(':').next().unwrap_or(host),
    };
    name.eq_ignore_ascii_case("localhost")
        || name.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
