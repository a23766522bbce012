// Command-line surface for `amcli`.
//
// Pipeline verbs (`upload`, `extract`, `draw`, `analyze`, `download`) run
// stages through the `Orchestrator`; noun commands (`image`, `movie`,
// `keypoint`, `drawing`, `analysis`) are read-only views of what the service
// already holds; `configure` stores credentials for a profile.
//
// `run` is the entrypoint used by `main` and by the integration tests.

use crate::api::{ApiClient, Transport};
use crate::credentials::{mask, CredentialResolver, Field, Layer, Source, DEFAULT_API_URL};
use crate::error::Error;
use crate::handle::{HandleKind, JobHandle, JobId};
use crate::pipeline::{ChainPlan, ChainSource, FollowUp, Orchestrator, Stage};
use crate::poller::{CancelToken, Poller};
use crate::settings::{Settings, DEFAULT_PROFILE};
use crate::ui::{self, ConsoleObserver};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

/// Command line interface for the AnyMotion API.
#[derive(Parser, Debug)]
#[command(name = "amcli", version, about = "Command line interface for the AnyMotion API")]
pub struct Cli {
    /// Named profile to read settings and credentials from
    #[arg(long, global = true, default_value = DEFAULT_PROFILE)]
    pub profile: String,

    /// Client ID for this invocation only (overrides environment and file)
    #[arg(long, global = true)]
    pub client_id: Option<String>,

    /// Client secret for this invocation only (overrides environment and file)
    #[arg(long, global = true)]
    pub client_secret: Option<String>,

    /// API URL for this invocation only
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Show debug logs on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configure your AnyMotion credentials
    Configure {
        #[command(subcommand)]
        action: Option<ConfigureAction>,
    },
    /// Upload a local image or movie
    Upload {
        /// Image (.jpg, .jpeg, .png) or movie (.mp4, .mov)
        path: PathBuf,
    },
    /// Extract keypoints from an image or movie
    Extract {
        #[command(flatten)]
        source: ExtractSource,
        /// Draw the keypoints once extracted
        #[arg(long)]
        with_drawing: bool,
        /// Where to save the drawing (file or directory); needs --with-drawing
        #[arg(long, requires = "with_drawing")]
        out: Option<PathBuf>,
    },
    /// Draw extracted keypoints onto the source media
    Draw {
        keypoint_id: JobId,
        #[command(flatten)]
        rule: RuleArgs,
        /// Where to save the drawing (file or directory)
        #[arg(long, default_value = ".")]
        out: PathBuf,
        /// Only draw, do not download the result
        #[arg(long)]
        no_download: bool,
    },
    /// Analyze extracted keypoints
    Analyze {
        keypoint_id: JobId,
        #[command(flatten)]
        rule: RuleArgs,
        /// Print the analysis result when finished
        #[arg(long)]
        show_result: bool,
    },
    /// Download the result of a finished drawing or analysis
    Download {
        id: JobId,
        #[arg(long, value_enum, default_value_t = ArtifactKind::Drawing)]
        kind: ArtifactKind,
        /// File or directory to write to
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Show uploaded images
    Image {
        #[command(subcommand)]
        action: NounAction,
    },
    /// Show uploaded movies
    Movie {
        #[command(subcommand)]
        action: NounAction,
    },
    /// Show extracted keypoints
    Keypoint {
        #[command(subcommand)]
        action: NounAction,
    },
    /// Show drawings
    Drawing {
        #[command(subcommand)]
        action: NounAction,
    },
    /// Show analyses
    Analysis {
        #[command(subcommand)]
        action: NounAction,
    },
}

impl Commands {
    /// Commands that start or wait on server-side jobs.
    pub fn submits_jobs(&self) -> bool {
        matches!(
            self,
            Commands::Upload { .. }
                | Commands::Extract { .. }
                | Commands::Draw { .. }
                | Commands::Analyze { .. }
                | Commands::Download { .. }
        )
    }
}

#[derive(Subcommand, Debug)]
pub enum ConfigureAction {
    /// Show the configuration in effect for the profile (secrets masked)
    List,
}

#[derive(Subcommand, Debug)]
pub enum NounAction {
    /// List all items, optionally filtered by status
    List {
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },
    /// Show one item
    Show { id: JobId },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct ExtractSource {
    /// Use an uploaded image
    #[arg(long)]
    pub image_id: Option<JobId>,
    /// Use an uploaded movie
    #[arg(long)]
    pub movie_id: Option<JobId>,
    /// Upload this file first
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RuleArgs {
    /// Rule in JSON format
    #[arg(long, conflicts_with = "rule_file")]
    pub rule: Option<String>,
    /// File containing the rule in JSON format
    #[arg(long)]
    pub rule_file: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ArtifactKind {
    Drawing,
    Analysis,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    Success,
    Failure,
    Processing,
    Unprocessed,
}

impl StatusFilter {
    fn exec_status(self) -> &'static str {
        match self {
            StatusFilter::Success => "SUCCESS",
            StatusFilter::Failure => "FAILURE",
            StatusFilter::Processing => "PROCESSING",
            StatusFilter::Unprocessed => "UNPROCESSED",
        }
    }
}

impl RuleArgs {
    /// The rule, if one was given. Must be a JSON array or object.
    pub fn load(&self) -> Result<Option<Value>, Error> {
        let raw = match (&self.rule, &self.rule_file) {
            (Some(rule), _) => rule.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?,
            (None, None) => return Ok(None),
        };
        parse_rule(&raw).map(Some)
    }
}

pub fn parse_rule(raw: &str) -> Result<Value, Error> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| Error::InvalidRule("must be in JSON format".into()))?;
    if !(value.is_array() || value.is_object()) {
        return Err(Error::InvalidRule("must be a JSON list or object".into()));
    }
    Ok(value)
}

/// Everything an authenticated command needs: the client and the polling
/// setup for the chosen profile.
struct Session {
    client: ApiClient,
    poller: Poller,
}

impl Session {
    fn open(cli: &Cli, settings: &Settings, cancel: &CancelToken) -> Result<Self> {
        let mut entered = Layer::new(Source::Cli);
        entered.set(Field::ClientId, cli.client_id.clone());
        entered.set(Field::ClientSecret, cli.client_secret.clone());
        entered.set(Field::ApiUrl, cli.api_url.clone());

        let resolver = CredentialResolver::new(vec![
            entered,
            Layer::from_env(),
            settings.file_layer()?,
        ]);
        let credentials = resolver.resolve()?;
        let client = ApiClient::new(credentials)?;
        let poller = Poller::blocking(settings.poll_policy()?, cancel.clone());
        info!(profile = settings.profile(), api_url = %client.api_url(), "session ready");
        Ok(Session { client, poller })
    }
}

/// Runs one parsed command line. `cancel` is flipped by the Ctrl-C
/// handler installed in `main`.
pub fn run(cli: Cli, cancel: CancelToken) -> Result<()> {
    let settings = Settings::locate(&cli.profile)?;

    if let Commands::Configure { action } = &cli.command {
        return configure(&settings, action.as_ref());
    }

    // Rule arguments are checked before any network traffic.
    let rule = match &cli.command {
        Commands::Draw { rule, .. } => rule.load()?,
        Commands::Analyze { rule, .. } => Some(rule.load()?.ok_or_else(|| {
            Error::InvalidRule("either --rule or --rule-file is required".into())
        })?),
        _ => None,
    };

    let session = Session::open(&cli, &settings, &cancel)?;
    let observer = ConsoleObserver::new();
    let mut orchestrator = Orchestrator::new(&session.client, session.poller, &observer);

    match cli.command {
        Commands::Configure { .. } => unreachable!("handled above"),
        Commands::Upload { path } => {
            let handle = orchestrator.upload(&path)?;
            ui::echo_success(&format!(
                "Uploaded {} to the cloud storage. ({})",
                path.display(),
                ui::colored_id(&handle)
            ));
        }
        Commands::Extract {
            source,
            with_drawing,
            out,
        } => {
            let source = match (source.image_id, source.movie_id, source.path) {
                (Some(id), _, _) => ChainSource::Existing(JobHandle::Image(id)),
                (_, Some(id), _) => ChainSource::Existing(JobHandle::Movie(id)),
                (_, _, Some(path)) => ChainSource::File(path),
                _ => unreachable!("clap requires one source"),
            };
            let plan = ChainPlan {
                source,
                follow_up: with_drawing.then(|| FollowUp::Draw {
                    rule: None,
                    destination: out,
                }),
            };
            let report = orchestrator.run_chain(&plan)?;
            if let Some(path) = report.artifact {
                ui::echo_success(&format!("Downloaded the file to {}.", path.display()));
            }
        }
        Commands::Draw {
            keypoint_id,
            out,
            no_download,
            ..
        } => {
            let drawing = orchestrator.draw(&JobHandle::Keypoint(keypoint_id), rule)?;
            drawing.ensure_success(Stage::Draw)?;
            if !no_download {
                let path = orchestrator.download(&drawing, &out)?;
                ui::echo_success(&format!("Downloaded the file to {}.", path.display()));
            }
        }
        Commands::Analyze {
            keypoint_id,
            show_result,
            ..
        } => {
            let rule = rule.unwrap_or(Value::Null);
            let analysis = orchestrator.analyze(&JobHandle::Keypoint(keypoint_id), rule)?;
            analysis.ensure_success(Stage::Analyze)?;
            if show_result {
                ui::echo_json(analysis.body.get("result").unwrap_or(&Value::Null));
            }
        }
        Commands::Download { id, kind, out } => {
            let handle = match kind {
                ArtifactKind::Drawing => JobHandle::Drawing(id),
                ArtifactKind::Analysis => JobHandle::Analysis(id),
            };
            let job = orchestrator.track(&handle)?;
            let path = orchestrator.download(&job, &out)?;
            ui::echo_success(&format!("Downloaded the file to {}.", path.display()));
        }
        Commands::Image { action } => browse(&session.client, HandleKind::Image, action)?,
        Commands::Movie { action } => browse(&session.client, HandleKind::Movie, action)?,
        Commands::Keypoint { action } => browse(&session.client, HandleKind::Keypoint, action)?,
        Commands::Drawing { action } => browse(&session.client, HandleKind::Drawing, action)?,
        Commands::Analysis { action } => browse(&session.client, HandleKind::Analysis, action)?,
    }
    Ok(())
}

/// Read-only listing and lookup for one collection.
fn browse<T: Transport + ?Sized>(transport: &T, kind: HandleKind, action: NounAction) -> Result<()> {
    match action {
        NounAction::List { status } => {
            let spinner = ui::spinner("Retrieving...");
            let items = transport.get_list(kind, status.map(|s| s.exec_status().to_string()));
            if let Some(spinner) = spinner {
                spinner.finish_and_clear();
            }
            let items = items.with_context(|| format!("cannot list {}", kind.endpoint()))?;
            ui::echo_json(&Value::Array(items));
        }
        NounAction::Show { id } => {
            let item = transport
                .get_one(kind, id)
                .with_context(|| format!("cannot show {kind} {id}"))?;
            ui::echo_json(&item);
        }
    }
    Ok(())
}

fn configure(settings: &Settings, action: Option<&ConfigureAction>) -> Result<()> {
    let stored = settings.file_layer()?;
    match action {
        Some(ConfigureAction::List) => {
            let effective = CredentialResolver::new(vec![Layer::from_env(), stored]);
            print_configuration(settings.profile(), &effective);
        }
        None => {
            let entered = ui::prompt_configuration(&stored)?;
            settings.persist(&entered)?;
            ui::echo_success(&format!(
                "Saved the settings for profile \"{}\" in {}.",
                settings.profile(),
                settings_dir(settings).display()
            ));
        }
    }
    Ok(())
}

/// The values a command would use for this profile, each with its origin.
/// Secrets are masked.
fn print_configuration(profile: &str, effective: &CredentialResolver) {
    println!("profile: {profile}");
    for field in Field::ALL {
        let shown = match (field, effective.lookup(field)) {
            (Field::ApiUrl, None) => format!("{DEFAULT_API_URL} ({})", Source::Default),
            (_, None) => "<not set>".to_string(),
            (Field::ApiUrl, Some((url, source))) => format!("{url} ({source})"),
            (_, Some((value, source))) => format!("{} ({source})", mask(value)),
        };
        println!("{}: {}", field.name(), shown);
    }
}

fn settings_dir(settings: &Settings) -> PathBuf {
    settings
        .credentials_path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}
