//! SLSA v1 provenance predicates for pushed images.
//!
//! Build argument values never end up in the predicate, only their names.

use crate::request::BuildRequest;
use crate::tags::TagSet;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// CI environment the build ran in, read from the GitHub Actions variables.
#[derive(Debug, Default, Clone)]
pub struct RunEnvironment {
    pub server_url: Option<String>,
    pub repository: Option<String>,
    pub sha: Option<String>,
    pub git_ref: Option<String>,
    pub workflow_ref: Option<String>,
    pub run_id: Option<String>,
    pub run_attempt: Option<String>,
}

impl RunEnvironment {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            server_url: var("GITHUB_SERVER_URL"),
            repository: var("GITHUB_REPOSITORY"),
            sha: var("GITHUB_SHA"),
            git_ref: var("GITHUB_REF"),
            workflow_ref: var("GITHUB_WORKFLOW_REF"),
            run_id: var("GITHUB_RUN_ID"),
            run_attempt: var("GITHUB_RUN_ATTEMPT"),
        }
    }

    fn server_url(&self) -> &str {
        self.server_url.as_deref().unwrap_or("https://github.com")
    }

    fn builder_id(&self) -> String {
        match &self.workflow_ref {
            Some(workflow_ref) => format!("{}/{workflow_ref}", self.server_url()),
            None => "https://github.com/actions/runner".to_string(),
        }
    }

    fn invocation_id(&self) -> Option<String> {
        let repository = self.repository.as_ref()?;
        let run_id = self.run_id.as_ref()?;
        let attempt = self.run_attempt.as_deref().unwrap_or("1");
        Some(format!(
            "{}/{repository}/actions/runs/{run_id}/attempts/{attempt}",
            self.server_url()
        ))
    }
}

/// Inputs of one provenance predicate.
pub struct Provenance<'a> {
    pub build_type: &'a str,
    pub request: &'a BuildRequest,
    pub tags: &'a TagSet,
    pub environment: &'a RunEnvironment,
    /// SHA-256 of the Dockerfile, hex encoded.
    pub dockerfile_sha256: Option<String>,
    pub started_on: DateTime<Utc>,
    pub finished_on: DateTime<Utc>,
}

impl Provenance<'_> {
    pub fn predicate(&self) -> Value {
        let request = self.request;
        let env = self.environment;

        let mut dependencies = Vec::new();
        if let (Some(repository), Some(sha)) = (&env.repository, &env.sha) {
            dependencies.push(json!({
                "uri": format!("git+{}/{repository}@{}", env.server_url(), env.git_ref.as_deref().unwrap_or_default()),
                "digest": { "gitCommit": sha },
            }));
        }
        if let Some(sha256) = &self.dockerfile_sha256 {
            dependencies.push(json!({
                "uri": request.dockerfile.display().to_string(),
                "digest": { "sha256": sha256 },
            }));
        }

        let internal: BTreeMap<&str, &str> = [
            ("repository", &env.repository),
            ("sha", &env.sha),
            ("ref", &env.git_ref),
            ("workflowRef", &env.workflow_ref),
            ("runId", &env.run_id),
            ("runAttempt", &env.run_attempt),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
        .collect();

        let mut metadata = json!({
            "startedOn": timestamp(self.started_on),
            "finishedOn": timestamp(self.finished_on),
        });
        if let Some(invocation_id) = env.invocation_id() {
            metadata["invocationId"] = json!(invocation_id);
        }

        json!({
            "buildDefinition": {
                "buildType": self.build_type,
                "externalParameters": {
                    "context": request.context.display().to_string(),
                    "dockerfile": request.dockerfile.display().to_string(),
                    "platforms": request.target_platforms,
                    "buildArgNames": request.build_args.keys().collect::<Vec<_>>(),
                    "tags": self.tags.entries(),
                },
                "internalParameters": internal,
                "resolvedDependencies": dependencies,
            },
            "runDetails": {
                "builder": { "id": env.builder_id() },
                "metadata": metadata,
            },
        })
    }
}

/// Hex encoded SHA-256 of a file.
pub fn file_sha256(path: &std::path::Path) -> std::io::Result<String> {
    Ok(sha256::digest(std::fs::read(path)?.as_slice()))
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
