use crate::oci::{self, Digest};
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;

/// Markdown with commands for verifying both attestations of a digest.
pub fn report(
    registry: &str,
    digest: &Digest,
    owner: &str,
    provenance_predicate_type: &str,
    sbom_predicate_type: &str,
) -> String {
    let locator = format!("oci://{}", oci::digest_reference(registry, digest));
    let verify = |predicate_type: &str| {
        format!(
            "gh attestation verify {locator} \\\n  --owner {owner} \\\n  --bundle-from-oci \\\n  --predicate-type {predicate_type}"
        )
    };

    format!(
        "### Published `{registry}@{digest}`\n\n\
         Verify the build provenance:\n\n\
         ```bash\n{}\n```\n\n\
         Verify the SBOM:\n\n\
         ```bash\n{}\n```\n",
        verify(provenance_predicate_type),
        verify(sbom_predicate_type),
    )
}

/// Owner used in verification commands: the repository owner when running
/// in GitHub Actions, otherwise the first path segment after the host.
pub fn owner(registry: &str) -> String {
    resolve_owner(std::env::var("GITHUB_REPOSITORY_OWNER").ok(), registry)
}

fn resolve_owner(repository_owner: Option<String>, registry: &str) -> String {
    if let Some(owner) = repository_owner.filter(|o| !o.is_empty()) {
        return owner;
    }
    let host = oci::registry_host(registry);
    registry
        .strip_prefix(host)
        .unwrap_or(registry)
        .trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(registry)
        .to_string()
}

/// Where human readable output goes: the job summary file, or stdout.
pub struct Summary {
    pub path: Option<PathBuf>,
}

impl Summary {
    pub fn from_env() -> Self {
        Self {
            path: std::env::var_os("GITHUB_STEP_SUMMARY").map(PathBuf::from),
        }
    }

    /// Best effort. Failures are logged and otherwise ignored.
    pub fn publish(&self, text: &str) {
        match &self.path {
            Some(path) => {
                let written = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut file| file.write_all(text.as_bytes()));
                match written {
                    Ok(()) => info!("Wrote verification instructions to {}", path.display()),
                    Err(err) => warn!("could not write summary to {}: {err}", path.display()),
                }
            }
            None => println!("{text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:9b2a3c1f0e5d4c3b2a19081726354453627180a9b8c7d6e5f4a3b2c1d0e9f8a7";

    #[test]
    fn report_references_digest_for_both_predicates() {
        let digest = Digest::parse(DIGEST).unwrap();
        let text = report(
            "ghcr.io/org/app",
            &digest,
            "org",
            "https://slsa.dev/provenance/v1",
            "https://cyclonedx.org/bom",
        );
        let locator = format!("gh attestation verify oci://ghcr.io/org/app@{DIGEST}");
        assert_eq!(text.matches(&locator).count(), 2);
        assert!(text.contains("--predicate-type https://slsa.dev/provenance/v1"));
        assert!(text.contains("--predicate-type https://cyclonedx.org/bom"));
        assert!(text.contains("--owner org"));
        assert!(!text.contains(":latest"));
    }

    #[test]
    fn owner_from_registry_path() {
        assert_eq!(resolve_owner(None, "ghcr.io/org/app"), "org");
        assert_eq!(
            resolve_owner(None, "europe-north1-docker.pkg.dev/proj/team/app"),
            "proj"
        );
        assert_eq!(resolve_owner(None, "library/alpine"), "library");
        assert_eq!(resolve_owner(Some(String::new()), "ghcr.io/org/app"), "org");
    }

    #[test]
    fn repository_owner_takes_precedence() {
        assert_eq!(resolve_owner(Some("acme".into()), "ghcr.io/org/app"), "acme");
    }

    #[test]
    fn summary_appends_to_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let summary = Summary {
            path: Some(file.path().to_path_buf()),
        };
        summary.publish("one\n");
        summary.publish("two\n");
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn summary_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let summary = Summary {
            path: Some(dir.path().to_path_buf()),
        };
        summary.publish("ignored");
    }
}
