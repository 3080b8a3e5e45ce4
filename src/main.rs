//! Docker build push
use clap::{ArgAction, Args, Parser, Subcommand};
use dbp::attest::{Cosign, Trivy};
use dbp::cache::HttpProbe;
use dbp::docker::Buildx;
use dbp::oci::Digest;
use dbp::outputs::Outputs;
use dbp::pipeline::{self, Pipeline};
use dbp::provenance::RunEnvironment;
use dbp::report::Summary;
use dbp::request::{BuildRequest, Inputs};
use dbp::{config, oci, tags};
use log::{debug, error, info};
use std::path::PathBuf;
use thiserror::Error;

/// Build, scan, push and attest a container image.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file. Defaults to dbp.toml in the build context, if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build and scan the image, then push and attest it.
    Build(BuildInputs),
    /// Attest an image that has already been pushed.
    Attest {
        #[command(flatten)]
        inputs: BuildInputs,

        /// Digest of the published image, e.g. sha256:0123...
        #[arg(long, env = "INPUT_DIGEST")]
        digest: String,
    },
    /// Print the normalized tag set.
    Tags {
        #[arg(long, env = "INPUT_REGISTRY")]
        registry: String,

        #[arg(long, env = "INPUT_TAGS", default_value = "latest")]
        tags: String,
    },
}

#[derive(Args, Debug)]
struct BuildInputs {
    /// Build context.
    #[arg(long, env = "INPUT_CONTEXT", default_value = ".")]
    context: PathBuf,

    /// Dockerfile path.
    #[arg(long, env = "INPUT_DOCKERFILE", default_value = "Dockerfile")]
    dockerfile: PathBuf,

    /// Platform of the local verification build.
    #[arg(long, env = "INPUT_TEST_PLATFORM", default_value = "linux/amd64")]
    test_platform: String,

    /// Comma separated platforms of the pushed image.
    #[arg(long, env = "INPUT_PLATFORMS", default_value = "linux/amd64")]
    platforms: String,

    /// Registry reference without tag, e.g. ghcr.io/org/app.
    #[arg(long, env = "INPUT_REGISTRY")]
    registry: String,

    /// Comma separated tags. Tags containing a colon are used as-is.
    #[arg(long, env = "INPUT_TAGS", default_value = "latest")]
    tags: String,

    /// Comma separated KEY=VALUE build arguments.
    #[arg(long, env = "INPUT_BUILD_ARGS")]
    build_args: Option<String>,

    #[arg(long, env = "INPUT_PUSH", default_value_t = true, action = ArgAction::Set)]
    push: bool,

    /// Write verification instructions to the job summary.
    #[arg(long, env = "INPUT_SUMMARY", default_value_t = true, action = ArgAction::Set)]
    summary: bool,

    /// Accepted for compatibility; not used.
    #[arg(long, env = "INPUT_PR_COMMENT", default_value_t = true, action = ArgAction::Set)]
    pr_comment: bool,
}

impl From<BuildInputs> for Inputs {
    fn from(inputs: BuildInputs) -> Self {
        Inputs {
            context: inputs.context,
            dockerfile: inputs.dockerfile,
            test_platform: inputs.test_platform,
            platforms: inputs.platforms,
            registry: inputs.registry,
            tags: inputs.tags,
            build_args: inputs.build_args,
            push: inputs.push,
            summary: inputs.summary,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Pipeline(#[from] pipeline::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::Error),

    #[error("invalid digest: {0}")]
    Digest(#[from] oci::Error),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Read the configuration file and merge it with the built-in defaults.
///
/// If a configuration file name is not set explicitly, a dbp.toml in the
/// build context is used when it exists.
fn read_config(explicit: Option<&PathBuf>, context: Option<&PathBuf>) -> Result<config::File, Error> {
    let implicit = context
        .map(|context| context.join(config::DEFAULT_CONFIG_FILE))
        .filter(|path| path.is_file());

    Ok(match explicit.cloned().or(implicit) {
        Some(path) => {
            debug!("Using configuration file {}", path.display());
            config::File::default_with_user_config_file(&path)?
        }
        None => config::File::default(),
    })
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {}", err.to_string());
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    env_logger::init();

    let args = Cli::parse();
    info!("docker build push {}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Commands::Tags {
            registry,
            tags: raw_tags,
        } => {
            let registry =
                dbp::request::parse_registry(&registry).map_err(pipeline::Error::from)?;
            let set = tags::normalize(&tags::split_csv(&raw_tags), &registry)
                .map_err(pipeline::Error::from)?;
            for entry in set.entries() {
                println!("{entry}");
            }
            Ok(())
        }
        Commands::Build(inputs) => {
            if !inputs.pr_comment {
                debug!("pr-comment is disabled");
            }
            let cfg = read_config(args.config.as_ref(), Some(&inputs.context))?;
            let request = BuildRequest::new(inputs.into()).map_err(pipeline::Error::from)?;
            let tools = Tools::new(&cfg)?;
            let mut pipeline = tools.pipeline(&cfg);

            let outcome = pipeline.run(&request).await?;
            match &outcome.digest {
                Some(digest) => info!(
                    "Published {} as {digest} with {} attestation(s)",
                    outcome.tags.primary(),
                    outcome.attestations.len()
                ),
                None => info!("Built image {} without pushing", outcome.image_id),
            }
            Ok(())
        }
        Commands::Attest { inputs, digest } => {
            let digest = Digest::parse(&digest)?;
            let cfg = read_config(args.config.as_ref(), Some(&inputs.context))?;
            let request = BuildRequest::new(inputs.into()).map_err(pipeline::Error::from)?;
            let tools = Tools::new(&cfg)?;
            let mut pipeline = tools.pipeline(&cfg);

            let records = pipeline.attest(&request, &digest)?;
            info!("Attested {}@{digest} with {} statement(s)", request.registry, records.len());
            Ok(())
        }
    }
}

/// The external tools a run talks to.
struct Tools {
    probe: HttpProbe,
    trivy: Trivy,
    cosign: Cosign,
}

impl Tools {
    fn new(cfg: &config::File) -> Result<Self, Error> {
        Ok(Self {
            probe: HttpProbe::new()?,
            trivy: Trivy {
                format: cfg.sbom.format.clone(),
            },
            cosign: Cosign {
                key: cfg.attestation.key.clone(),
            },
        })
    }

    fn pipeline<'a>(&'a self, cfg: &'a config::File) -> Pipeline<'a, HttpProbe> {
        Pipeline {
            config: cfg,
            engine: &Buildx,
            sbom: &self.trivy,
            publisher: &self.cosign,
            probe: &self.probe,
            environment: RunEnvironment::from_env(),
            summary: Summary::from_env(),
            outputs: Outputs::from_env(),
        }
    }
}
