//! Build, scan, push, attest and report, in that order.
//!
//! Every stage only starts after the previous one succeeded. Once the image
//! is pushed, an attestation failure leaves it published but unattested; the
//! digest travels with the error so that [`Pipeline::attest`] can be re-run
//! against it without building again.

use crate::attest::{self, AttestationPublisher, AttestationRecord, Attestor, SbomGenerator};
use crate::cache::{self, CachePlan, RegistryProbe};
use crate::config;
use crate::docker::BuildEngine;
use crate::oci::{Digest, ImageId};
use crate::orchestrator::{self, Orchestrator, State};
use crate::outputs::{self, Outputs};
use crate::provenance::{self, Provenance, RunEnvironment};
use crate::report::{self, Summary};
use crate::request::{self, BuildRequest};
use crate::scan::{FilePattern, PatternError};
use crate::tags::{self, TagSet};
use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed input: {0}")]
    MalformedInput(#[from] request::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::Error),

    #[error("scan pattern: {0}")]
    ScanPattern(#[from] PatternError),

    #[error("build cache: {0}")]
    CacheConfig(#[from] cache::Error),

    #[error("build error: {0}")]
    Build(orchestrator::Error),

    #[error("image {image_id} contains {count} credential file(s), refusing to push")]
    CredentialLeak { count: usize, image_id: ImageId },

    #[error("image published as {digest} but not attested: {source}")]
    Attestation {
        digest: Digest,
        source: attest::Error,
    },
}

impl From<tags::Error> for Error {
    fn from(err: tags::Error) -> Self {
        Error::MalformedInput(request::Error::Tags(err))
    }
}

impl From<orchestrator::Error> for Error {
    fn from(err: orchestrator::Error) -> Self {
        match err {
            orchestrator::Error::CredentialLeak { count, image_id } => {
                Error::CredentialLeak { count, image_id }
            }
            err => Error::Build(err),
        }
    }
}

/// Result of a pipeline run.
#[derive(Debug)]
pub struct Outcome {
    pub tags: TagSet,
    pub image_id: ImageId,
    pub digest: Option<Digest>,
    pub attestations: Vec<AttestationRecord>,
    /// Orchestrator states entered, in order.
    pub stages: Vec<State>,
}

/// External tools and sinks used by a run.
pub struct Pipeline<'a, P: RegistryProbe> {
    pub config: &'a config::File,
    pub engine: &'a dyn BuildEngine,
    pub sbom: &'a dyn SbomGenerator,
    pub publisher: &'a dyn AttestationPublisher,
    pub probe: &'a P,
    pub environment: RunEnvironment,
    pub summary: Summary,
    pub outputs: Outputs,
}

impl<P: RegistryProbe> Pipeline<'_, P> {
    pub async fn run(&mut self, request: &BuildRequest) -> Result<Outcome, Error> {
        let started_on = Utc::now();

        let tags = tags::normalize(&request.raw_tags, &request.registry)?;
        info!("Primary tag: {}", tags.primary());
        self.outputs.set(outputs::APP_NAME, tags.short_name());
        self.outputs.set(outputs::FULL_IMAGE_NAME, tags.primary());
        self.outputs.set(outputs::TAGS, tags.csv());

        let pattern = FilePattern::parse(&self.config.scan.pattern)?;
        let cache = CachePlan::from_config(&request.registry, &self.config.cache);
        cache
            .validate(self.probe, self.config.cache.probe_registry)
            .await?;

        let mut orchestrator = Orchestrator::new(self.engine, &pattern);
        let built = orchestrator.run(request, &tags, &cache);
        let stages = orchestrator.history().to_vec();
        let artifact = built?;
        self.outputs.set(outputs::IMAGE_ID, artifact.image_id.as_str());

        let mut attestations = Vec::new();
        if let Some(digest) = &artifact.digest {
            self.outputs.set(outputs::DIGEST, digest.as_str());
            attestations = self.attest_build(request, &tags, digest, started_on)?;

            if request.summary_enabled {
                self.report(&request.registry, digest);
            }
        }

        Ok(Outcome {
            tags,
            image_id: artifact.image_id,
            digest: artifact.digest,
            attestations,
            stages,
        })
    }

    /// Attest an image that is already published, without building it.
    pub fn attest(
        &mut self,
        request: &BuildRequest,
        digest: &Digest,
    ) -> Result<Vec<AttestationRecord>, Error> {
        let tags = tags::normalize(&request.raw_tags, &request.registry)?;
        self.outputs.set(outputs::APP_NAME, tags.short_name());
        self.outputs.set(outputs::FULL_IMAGE_NAME, tags.primary());
        self.outputs.set(outputs::DIGEST, digest.as_str());

        let attestations = self.attest_build(request, &tags, digest, Utc::now())?;
        if request.summary_enabled {
            self.report(&request.registry, digest);
        }
        Ok(attestations)
    }

    fn attest_build(
        &mut self,
        request: &BuildRequest,
        tags: &TagSet,
        digest: &Digest,
        started_on: DateTime<Utc>,
    ) -> Result<Vec<AttestationRecord>, Error> {
        let unattested = |source| Error::Attestation {
            digest: digest.clone(),
            source,
        };

        let attestor = Attestor {
            sbom: self.sbom,
            publisher: self.publisher,
            sbom_config: &self.config.sbom,
            provenance_predicate_type: &self.config.provenance.predicate_type,
        };

        let dockerfile_sha256 = match provenance::file_sha256(&request.dockerfile) {
            Ok(sha) => Some(sha),
            Err(err) => {
                warn!("could not hash {}: {err}", request.dockerfile.display());
                None
            }
        };
        let predicate = Provenance {
            build_type: &self.config.provenance.build_type,
            request,
            tags,
            environment: &self.environment,
            dockerfile_sha256,
            started_on,
            finished_on: Utc::now(),
        }
        .predicate();
        let provenance = attestor
            .attest_provenance(&request.registry, digest, &predicate)
            .map_err(unattested)?;

        let base_name = attest::sbom_base_name(tags.primary());
        let sbom = attestor
            .generate_sbom(&request.registry, digest, &base_name)
            .map_err(unattested)?;
        self.outputs.set(outputs::SBOM_NAME, base_name.as_str());
        let sbom = attestor
            .attest_sbom(&request.registry, digest, &sbom)
            .map_err(unattested)?;

        Ok(vec![provenance, sbom])
    }

    fn report(&self, registry: &str, digest: &Digest) {
        let text = report::report(
            registry,
            digest,
            &report::owner(registry),
            &self.config.provenance.predicate_type,
            &self.config.sbom.predicate_type,
        );
        self.summary.publish(&text);
    }
}
