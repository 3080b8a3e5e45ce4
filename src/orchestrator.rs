use crate::cache::CachePlan;
use crate::docker::{self, BuildEngine, BuildSpec, Output};
use crate::oci::{Digest, ImageId};
use crate::request::BuildRequest;
use crate::scan::{self, Clearance, FilePattern};
use crate::tags::TagSet;
use log::{debug, info};
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{phase} failed: {source}")]
    Build {
        phase: State,
        source: docker::Error,
    },

    #[error("credential scan failed: {0}")]
    Scan(docker::Error),

    #[error("image {image_id} contains {count} credential file(s)")]
    CredentialLeak { count: usize, image_id: ImageId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    VerificationBuild,
    CredentialScan,
    PushBuild,
    Complete,
    Failed,
}

impl State {
    fn can_advance_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Idle, VerificationBuild)
                | (VerificationBuild, CredentialScan)
                | (CredentialScan, PushBuild)
                | (CredentialScan, Complete)
                | (PushBuild, Complete)
                | (Idle | VerificationBuild | CredentialScan | PushBuild, Failed)
        )
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::VerificationBuild => "verification build",
            State::CredentialScan => "credential scan",
            State::PushBuild => "push build",
            State::Complete => "complete",
            State::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Identifiers produced by the two build phases. The image id is only
/// valid in the local engine; the digest is what gets published.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildArtifact {
    pub image_id: ImageId,
    pub digest: Option<Digest>,
}

/// Runs the verification build, the credential scan and the push build,
/// strictly in that order.
pub struct Orchestrator<'a> {
    engine: &'a dyn BuildEngine,
    pattern: &'a FilePattern,
    state: State,
    history: Vec<State>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(engine: &'a dyn BuildEngine, pattern: &'a FilePattern) -> Self {
        Self {
            engine,
            pattern,
            state: State::Idle,
            history: vec![State::Idle],
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[State] {
        &self.history
    }

    fn advance(&mut self, next: State) {
        // Transitions are fixed by the code paths below.
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        info!("Pipeline stage: {next}");
        self.state = next;
        self.history.push(next);
    }

    fn fail(&mut self, err: Error) -> Error {
        self.advance(State::Failed);
        err
    }

    pub fn run(
        &mut self,
        request: &BuildRequest,
        tags: &TagSet,
        cache: &CachePlan,
    ) -> Result<BuildArtifact, Error> {
        self.advance(State::VerificationBuild);
        let image_id = match self.verification_build(request, cache) {
            Ok(image_id) => image_id,
            Err(err) => return Err(self.fail(err)),
        };

        self.advance(State::CredentialScan);
        let clearance = match self.credential_scan(&image_id) {
            Ok(clearance) => clearance,
            Err(err) => return Err(self.fail(err)),
        };

        if !request.push_enabled {
            info!("Push disabled, skipping push build");
            self.advance(State::Complete);
            return Ok(BuildArtifact {
                image_id,
                digest: None,
            });
        }

        self.advance(State::PushBuild);
        let digest = match self.push_build(clearance, request, tags, cache) {
            Ok(digest) => digest,
            Err(err) => return Err(self.fail(err)),
        };

        self.advance(State::Complete);
        Ok(BuildArtifact {
            image_id,
            digest: Some(digest),
        })
    }

    fn verification_build(
        &self,
        request: &BuildRequest,
        cache: &CachePlan,
    ) -> Result<ImageId, Error> {
        let platforms = [request.test_platform.clone()];
        let spec = BuildSpec {
            context: &request.context,
            dockerfile: &request.dockerfile,
            platforms: &platforms,
            build_args: &request.build_args,
            cache: &cache.verification,
            tags: &[],
            output: Output::Load,
            provenance: true,
        };
        let build_err = |source| Error::Build {
            phase: State::VerificationBuild,
            source,
        };

        let result = self.engine.build(&spec).map_err(build_err)?;
        let image_id = result
            .image_id
            .ok_or(docker::Error::MissingImageId)
            .map_err(build_err)?;
        info!("Verification build produced image {image_id}");
        Ok(image_id)
    }

    fn credential_scan(&self, image_id: &ImageId) -> Result<Clearance, Error> {
        let count = scan::scan(self.engine, image_id, self.pattern).map_err(Error::Scan)?;
        scan::gate(count).map_err(|count| Error::CredentialLeak {
            count,
            image_id: image_id.clone(),
        })
    }

    fn push_build(
        &self,
        _clearance: Clearance,
        request: &BuildRequest,
        tags: &TagSet,
        cache: &CachePlan,
    ) -> Result<Digest, Error> {
        let spec = BuildSpec {
            context: &request.context,
            dockerfile: &request.dockerfile,
            platforms: &request.target_platforms,
            build_args: &request.build_args,
            cache: &cache.push,
            tags: tags.entries(),
            output: Output::Push,
            // Provenance is attested separately against the pushed digest.
            provenance: false,
        };
        let build_err = |source| Error::Build {
            phase: State::PushBuild,
            source,
        };

        debug!("Pushing {} tag(s) for {:?}", tags.entries().len(), request.target_platforms);
        let result = self.engine.build(&spec).map_err(build_err)?;
        let digest = result
            .digest
            .ok_or(docker::Error::MissingDigest)
            .map_err(build_err)?;
        info!("Pushed {} as {digest}", tags.primary());
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::BuildResult;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    const DIGEST: &str = "sha256:9b2a3c1f0e5d4c3b2a19081726354453627180a9b8c7d6e5f4a3b2c1d0e9f8a7";

    #[derive(Default)]
    struct FakeEngine {
        files: Vec<PathBuf>,
        fail_verification: bool,
        fail_push: bool,
        builds: RefCell<Vec<(Output, Vec<String>, bool)>>,
    }

    impl BuildEngine for FakeEngine {
        fn build(&self, spec: &BuildSpec) -> Result<BuildResult, docker::Error> {
            self.builds
                .borrow_mut()
                .push((spec.output, spec.platforms.to_vec(), spec.provenance));
            match spec.output {
                Output::Load if self.fail_verification => Err(docker::Error::MissingImageId),
                Output::Load => Ok(BuildResult {
                    image_id: Some(ImageId::new("sha256:local")),
                    digest: None,
                }),
                Output::Push if self.fail_push => Ok(BuildResult::default()),
                Output::Push => Ok(BuildResult {
                    image_id: None,
                    digest: Some(Digest::parse(DIGEST).unwrap()),
                }),
            }
        }

        fn list_files(&self, _image_id: &ImageId) -> Result<Vec<PathBuf>, docker::Error> {
            Ok(self.files.clone())
        }
    }

    fn request(push: bool) -> BuildRequest {
        BuildRequest {
            context: ".".into(),
            dockerfile: "Dockerfile".into(),
            test_platform: "linux/amd64".into(),
            target_platforms: vec!["linux/amd64".into(), "linux/arm64".into()],
            registry: "ghcr.io/org/app".into(),
            raw_tags: vec!["latest".into()],
            build_args: BTreeMap::new(),
            push_enabled: push,
            summary_enabled: false,
        }
    }

    fn run(engine: &FakeEngine, push: bool) -> (Result<BuildArtifact, Error>, Vec<State>) {
        let pattern = FilePattern::parse("gha-creds-*.json").unwrap();
        let request = request(push);
        let tags = crate::tags::normalize(&request.raw_tags, &request.registry).unwrap();
        let cache = CachePlan::new("ghcr.io/org/app:buildcache".into(), "/tmp/c".into());
        let mut orchestrator = Orchestrator::new(engine, &pattern);
        let result = orchestrator.run(&request, &tags, &cache);
        (result, orchestrator.history().to_vec())
    }

    #[test]
    fn clean_image_is_pushed() {
        let engine = FakeEngine {
            files: vec!["etc/hostname".into()],
            ..Default::default()
        };
        let (result, history) = run(&engine, true);
        let artifact = result.unwrap();
        assert_eq!(artifact.image_id, ImageId::new("sha256:local"));
        assert_eq!(artifact.digest, Some(Digest::parse(DIGEST).unwrap()));
        assert_eq!(
            history,
            [
                State::Idle,
                State::VerificationBuild,
                State::CredentialScan,
                State::PushBuild,
                State::Complete
            ]
        );

        let builds = engine.builds.borrow();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[0], (Output::Load, vec!["linux/amd64".to_string()], true));
        assert_eq!(
            builds[1],
            (
                Output::Push,
                vec!["linux/amd64".to_string(), "linux/arm64".to_string()],
                false
            )
        );
    }

    #[test]
    fn leaked_credentials_stop_before_push() {
        let engine = FakeEngine {
            files: vec!["home/runner/gha-creds-xyz.json".into()],
            ..Default::default()
        };
        let (result, history) = run(&engine, true);
        assert!(matches!(result, Err(Error::CredentialLeak { count: 1, .. })));
        assert!(!history.contains(&State::PushBuild));
        assert_eq!(history.last(), Some(&State::Failed));
        assert!(engine.builds.borrow().iter().all(|(output, _, _)| *output == Output::Load));
    }

    #[test]
    fn push_disabled_completes_after_scan() {
        let engine = FakeEngine::default();
        let (result, history) = run(&engine, false);
        assert_eq!(result.unwrap().digest, None);
        assert_eq!(
            history,
            [
                State::Idle,
                State::VerificationBuild,
                State::CredentialScan,
                State::Complete
            ]
        );
        assert_eq!(engine.builds.borrow().len(), 1);
    }

    #[test]
    fn verification_failure_is_fatal() {
        let engine = FakeEngine {
            fail_verification: true,
            ..Default::default()
        };
        let (result, history) = run(&engine, true);
        assert!(matches!(
            result,
            Err(Error::Build {
                phase: State::VerificationBuild,
                ..
            })
        ));
        assert_eq!(history, [State::Idle, State::VerificationBuild, State::Failed]);
    }

    #[test]
    fn push_without_digest_fails_push_build() {
        let engine = FakeEngine {
            fail_push: true,
            ..Default::default()
        };
        let (result, history) = run(&engine, true);
        assert!(matches!(
            result,
            Err(Error::Build {
                phase: State::PushBuild,
                source: docker::Error::MissingDigest,
            })
        ));
        assert_eq!(
            history,
            [
                State::Idle,
                State::VerificationBuild,
                State::CredentialScan,
                State::PushBuild,
                State::Failed
            ]
        );
    }

    #[test]
    fn transitions_are_one_way() {
        assert!(State::CredentialScan.can_advance_to(State::PushBuild));
        assert!(!State::VerificationBuild.can_advance_to(State::PushBuild));
        assert!(!State::Complete.can_advance_to(State::Failed));
        assert!(!State::Failed.can_advance_to(State::Idle));
        assert!(!State::PushBuild.can_advance_to(State::CredentialScan));
    }
}
