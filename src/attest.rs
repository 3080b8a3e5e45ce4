use crate::config;
use crate::oci::{self, Digest};
use log::{debug, info};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("sbom generation failed with exit code {0}")]
    Sbom(ExitStatus),

    #[error("sbom document {path}: {err}")]
    SbomDocument {
        path: PathBuf,
        err: serde_json::Error,
    },

    #[error("publishing {predicate_type} attestation failed with exit code {status}")]
    Publish {
        predicate_type: String,
        status: ExitStatus,
    },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// A signed statement pushed to the registry next to the image.
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationRecord {
    pub subject_name: String,
    pub subject_digest: Digest,
    pub predicate_type: String,
    pub pushed: bool,
}

/// A generated software bill of materials.
#[derive(Debug, Clone)]
pub struct SbomDocument {
    pub path: PathBuf,
    pub document: Value,
}

/// Produces an SBOM for an image reference and writes it to `output`.
pub trait SbomGenerator {
    fn generate(&self, image_reference: &str, output: &Path) -> Result<Value, Error>;
}

/// Signs a predicate about `subject_name@subject_digest` and pushes the
/// resulting statement to the registry.
pub trait AttestationPublisher {
    fn publish(
        &self,
        subject_name: &str,
        subject_digest: &Digest,
        predicate_type: &str,
        predicate: &Value,
    ) -> Result<(), Error>;
}

/// Attestation stage of the pipeline. Every call takes the pushed digest,
/// never a tag.
pub struct Attestor<'a> {
    pub sbom: &'a dyn SbomGenerator,
    pub publisher: &'a dyn AttestationPublisher,
    pub sbom_config: &'a config::Sbom,
    pub provenance_predicate_type: &'a str,
}

impl Attestor<'_> {
    pub fn attest_provenance(
        &self,
        subject_name: &str,
        subject_digest: &Digest,
        predicate: &Value,
    ) -> Result<AttestationRecord, Error> {
        self.attest(subject_name, subject_digest, self.provenance_predicate_type, predicate)
    }

    pub fn generate_sbom(
        &self,
        subject_name: &str,
        subject_digest: &Digest,
        base_name: &str,
    ) -> Result<SbomDocument, Error> {
        let reference = oci::digest_reference(subject_name, subject_digest);
        std::fs::create_dir_all(&self.sbom_config.output_dir)?;
        let path = self
            .sbom_config
            .output_dir
            .join(format!("{base_name}.sbom.json"));
        info!("Generating SBOM for {reference} into {}", path.display());
        let document = self.sbom.generate(&reference, &path)?;
        Ok(SbomDocument { path, document })
    }

    pub fn attest_sbom(
        &self,
        subject_name: &str,
        subject_digest: &Digest,
        sbom: &SbomDocument,
    ) -> Result<AttestationRecord, Error> {
        self.attest(
            subject_name,
            subject_digest,
            &self.sbom_config.predicate_type,
            &sbom.document,
        )
    }

    fn attest(
        &self,
        subject_name: &str,
        subject_digest: &Digest,
        predicate_type: &str,
        predicate: &Value,
    ) -> Result<AttestationRecord, Error> {
        info!("Attesting {predicate_type} for {subject_name}@{subject_digest}");
        self.publisher
            .publish(subject_name, subject_digest, predicate_type, predicate)?;
        Ok(AttestationRecord {
            subject_name: subject_name.to_string(),
            subject_digest: subject_digest.clone(),
            predicate_type: predicate_type.to_string(),
            pushed: true,
        })
    }
}

/// Stable file name stem for the SBOM of a tag, e.g. `app-latest` for
/// `ghcr.io/org/app:latest`. Reruns for the same tag overwrite the artifact.
pub fn sbom_base_name(primary_tag: &str) -> String {
    oci::last_segment(primary_tag).replace([':', '@'], "-")
}

/// `trivy image`
pub struct Trivy {
    pub format: String,
}

impl SbomGenerator for Trivy {
    fn generate(&self, image_reference: &str, output: &Path) -> Result<Value, Error> {
        let mut command = Command::new("trivy");
        command
            .arg("image")
            .arg("--format")
            .arg(&self.format)
            .arg("--output")
            .arg(output)
            .arg(image_reference)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        debug!("{:?}", command);

        let status = command.status()?;
        if !status.success() {
            return Err(Error::Sbom(status));
        }

        let bytes = std::fs::read(output)?;
        serde_json::from_slice(&bytes).map_err(|err| Error::SbomDocument {
            path: output.to_path_buf(),
            err,
        })
    }
}

/// `cosign attest`, which signs the predicate and pushes the statement to
/// the registry.
pub struct Cosign {
    /// Key reference. Keyless signing when unset.
    pub key: Option<String>,
}

impl Cosign {
    fn args(&self, reference: &str, predicate_type: &str, predicate_file: &Path) -> Vec<String> {
        let mut args = vec![
            "attest".to_string(),
            "--yes".to_string(),
            "--type".to_string(),
            predicate_type.to_string(),
            "--predicate".to_string(),
            predicate_file.display().to_string(),
        ];
        if let Some(key) = &self.key {
            args.push("--key".to_string());
            args.push(key.clone());
        }
        args.push(reference.to_string());
        args
    }
}

impl AttestationPublisher for Cosign {
    fn publish(
        &self,
        subject_name: &str,
        subject_digest: &Digest,
        predicate_type: &str,
        predicate: &Value,
    ) -> Result<(), Error> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&serde_json::to_vec(predicate)?)?;
        file.flush()?;

        let reference = oci::digest_reference(subject_name, subject_digest);
        let args = self.args(&reference, predicate_type, file.path());
        debug!("cosign {:?}", args);

        let status = Command::new("cosign")
            .args(&args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Publish {
                predicate_type: predicate_type.to_string(),
                status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    const DIGEST: &str = "sha256:9b2a3c1f0e5d4c3b2a19081726354453627180a9b8c7d6e5f4a3b2c1d0e9f8a7";

    struct FakeSbom;

    impl SbomGenerator for FakeSbom {
        fn generate(&self, image_reference: &str, output: &Path) -> Result<Value, Error> {
            let document = json!({ "bomFormat": "CycloneDX", "subject": image_reference });
            std::fs::write(output, document.to_string())?;
            Ok(document)
        }
    }

    #[derive(Default)]
    struct FakePublisher {
        published: RefCell<Vec<(String, String, String)>>,
    }

    impl AttestationPublisher for FakePublisher {
        fn publish(
            &self,
            subject_name: &str,
            subject_digest: &Digest,
            predicate_type: &str,
            _predicate: &Value,
        ) -> Result<(), Error> {
            self.published.borrow_mut().push((
                subject_name.to_string(),
                subject_digest.to_string(),
                predicate_type.to_string(),
            ));
            Ok(())
        }
    }

    #[test]
    fn derives_sbom_base_name() {
        assert_eq!(sbom_base_name("ghcr.io/org/app:latest"), "app-latest");
        assert_eq!(sbom_base_name("myregistry.io/app:sha-abc123"), "app-sha-abc123");
        assert_eq!(sbom_base_name("localhost:5000/app:v1"), "app-v1");
    }

    #[test]
    fn attests_digest_with_both_predicates() {
        let dir = tempfile::tempdir().unwrap();
        let sbom_config = config::Sbom {
            output_dir: dir.path().join("sbom"),
            format: "cyclonedx".into(),
            predicate_type: "https://cyclonedx.org/bom".into(),
        };
        let publisher = FakePublisher::default();
        let attestor = Attestor {
            sbom: &FakeSbom,
            publisher: &publisher,
            sbom_config: &sbom_config,
            provenance_predicate_type: "https://slsa.dev/provenance/v1",
        };
        let digest = Digest::parse(DIGEST).unwrap();

        let provenance = attestor
            .attest_provenance("ghcr.io/org/app", &digest, &json!({}))
            .unwrap();
        let sbom = attestor
            .generate_sbom("ghcr.io/org/app", &digest, "app-latest")
            .unwrap();
        let sbom_record = attestor
            .attest_sbom("ghcr.io/org/app", &digest, &sbom)
            .unwrap();

        assert_eq!(sbom.path, dir.path().join("sbom/app-latest.sbom.json"));
        assert!(sbom.path.is_file());
        assert_eq!(sbom.document["subject"], format!("ghcr.io/org/app@{DIGEST}"));

        assert_eq!(provenance.subject_digest, digest);
        assert_eq!(sbom_record.subject_digest, digest);
        assert!(provenance.pushed && sbom_record.pushed);
        assert_eq!(
            *publisher.published.borrow(),
            [
                (
                    "ghcr.io/org/app".to_string(),
                    DIGEST.to_string(),
                    "https://slsa.dev/provenance/v1".to_string()
                ),
                (
                    "ghcr.io/org/app".to_string(),
                    DIGEST.to_string(),
                    "https://cyclonedx.org/bom".to_string()
                ),
            ]
        );
    }

    #[test]
    fn cosign_command_line() {
        let cosign = Cosign {
            key: Some("env://COSIGN_KEY".into()),
        };
        let reference = format!("ghcr.io/org/app@{DIGEST}");
        assert_eq!(
            cosign.args(&reference, "https://slsa.dev/provenance/v1", Path::new("/tmp/p.json")),
            [
                "attest",
                "--yes",
                "--type",
                "https://slsa.dev/provenance/v1",
                "--predicate",
                "/tmp/p.json",
                "--key",
                "env://COSIGN_KEY",
                reference.as_str(),
            ]
        );
        assert!(!Cosign { key: None }
            .args(&reference, "t", Path::new("p"))
            .contains(&"--key".to_string()));
    }
}
