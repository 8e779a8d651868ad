//! fieldsync CLI - operator interface for a device record store.
//!
//! This tool opens (and upgrades) a record store, inspects pending work,
//! decodes stored answers, browses cascade datasets and runs sync cycles
//! against the configured bucket.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, FmtSubscriber};

use fieldsync_codec::{AnswerValue, ResponseType};
use fieldsync_common::{InstanceId, SecretKey, TransmissionId};
use fieldsync_storage::S3Client;
use fieldsync_store::{CascadeIndex, RecordStore, SurveyInstanceStatus, ROOT_PARENT};
use fieldsync_sync::{CancellationToken, QueueSummary, StaticForms, SyncCoordinator};

use crate::config::ClientConfig;

const SECRET_ENV: &str = "FIELDSYNC_S3_SECRET";

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "fieldsync - field data record store and sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the JSON client configuration.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Record store path (overrides the configuration).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the record store and upgrade its schema.
    Migrate,

    /// Show instance and upload counts.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Decode a stored answer, or every answer of an instance.
    Decode {
        /// Response type tag, e.g. OPTION or CASCADE.
        #[arg(short = 't', long = "type")]
        response_type: Option<String>,

        /// Encoded value.
        value: Option<String>,

        /// Decode the stored responses of this instance id instead.
        #[arg(short, long, conflicts_with = "value")]
        instance: Option<i64>,
    },

    /// List nodes of a cascade dataset.
    Cascade {
        /// Path to the dataset file.
        #[arg(short = 'f', long)]
        dataset: PathBuf,

        /// Parent node id (default: roots).
        #[arg(short, long, default_value_t = ROOT_PARENT)]
        parent: i64,
    },

    /// Delete data points of a survey group that hold no collected data.
    Clean {
        /// Survey group id.
        #[arg(short, long)]
        group: i64,
    },

    /// Put a failed transmission back in the upload queue.
    Reset {
        /// Transmission id.
        #[arg(short, long)]
        transmission: i64,
    },

    /// Run one sync cycle.
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(database) = cli.database {
        config.database = database;
    }

    match cli.command {
        Commands::Migrate => cmd_migrate(&config.database),
        Commands::Status { json } => cmd_status(&config.database, json),
        Commands::Decode {
            response_type,
            value,
            instance,
        } => cmd_decode(&config.database, response_type, value, instance),
        Commands::Cascade { dataset, parent } => cmd_cascade(&dataset, parent),
        Commands::Clean { group } => cmd_clean(&config.database, group),
        Commands::Reset { transmission } => cmd_reset(&config.database, transmission),
        Commands::Sync => cmd_sync(config).await,
    }
}

/// `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool) -> Result<()> {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(filter))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
        return Ok(());
    }

    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn open_store(path: &Path) -> Result<RecordStore> {
    RecordStore::open(path).with_context(|| format!("Failed to open record store {}", path.display()))
}

/// Open and upgrade the store.
fn cmd_migrate(path: &Path) -> Result<()> {
    let (store, report) = RecordStore::open_with_report(path)
        .with_context(|| format!("Failed to open record store {}", path.display()))?;

    match report {
        Some(report) => {
            println!("Upgraded {} from version {} to {}", path.display(), report.from, report.to);
            for step in &report.applied {
                println!("  applied {}", step);
            }
        }
        None => println!(
            "{} is at schema version {}",
            path.display(),
            store.schema_version()?
        ),
    }
    Ok(())
}

/// Print instance and transmission counts.
fn cmd_status(path: &Path, json: bool) -> Result<()> {
    let store = open_store(path)?;

    let statuses = [
        SurveyInstanceStatus::Saved,
        SurveyInstanceStatus::Submitted,
        SurveyInstanceStatus::Exported,
        SurveyInstanceStatus::Synced,
        SurveyInstanceStatus::Downloaded,
    ];
    let mut instances = Vec::with_capacity(statuses.len());
    for status in statuses {
        instances.push((status, store.survey_instances_by_status(status)?.len()));
    }
    let ready = store.instances_ready_for_sync()?.len();
    let queue = QueueSummary::from_transmissions(&store.unsynced_transmissions()?);

    if json {
        let counts: serde_json::Map<String, serde_json::Value> = instances
            .iter()
            .map(|(status, n)| (format!("{:?}", status).to_lowercase(), (*n).into()))
            .collect();
        let out = serde_json::json!({
            "instances": counts,
            "ready_for_sync": ready,
            "queue": queue,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Survey instances:");
    for (status, n) in &instances {
        println!("  {:<10} {}", format!("{:?}", status), n);
    }
    println!("Ready for sync: {}", ready);
    println!("Uploads:");
    println!("  pending     {}", queue.pending);
    println!("  in progress {}", queue.in_progress);
    println!("  failed      {} ({} blocked)", queue.failed, queue.blocked);
    for (file, error) in &queue.errors {
        println!("    {}: {}", file, error);
    }
    Ok(())
}

/// Decode one value or the responses of an instance.
fn cmd_decode(
    path: &Path,
    response_type: Option<String>,
    value: Option<String>,
    instance: Option<i64>,
) -> Result<()> {
    if let Some(id) = instance {
        let store = open_store(path)?;
        let responses = store.responses(InstanceId(id))?;
        if responses.is_empty() {
            println!("Instance {} has no responses.", id);
        }
        for r in responses {
            let question = match r.iteration {
                Some(i) => format!("{}[{}]", r.question_id, i),
                None => r.question_id.clone(),
            };
            println!("{:<20} {:<10} {}", question, r.response_type.as_tag(), r.answer().display_name());
        }
        return Ok(());
    }

    let value = value.context("Provide a value to decode, or --instance")?;
    let response_type = ResponseType::from_tag(response_type.as_deref().unwrap_or("VALUE"));
    let answer = AnswerValue::decode(&response_type, &value);
    println!("Type:    {}", response_type);
    println!("Decoded: {:?}", answer);
    println!("Display: {}", answer.display_name());
    println!("Encoded: {}", answer.encode());
    Ok(())
}

/// List the children of `parent` in a cascade dataset.
fn cmd_cascade(dataset: &Path, parent: i64) -> Result<()> {
    let mut index = CascadeIndex::new();
    if !index.open(dataset) {
        anyhow::bail!("Cascade dataset {} is not available", dataset.display());
    }

    let nodes = index.children_of(parent);
    if nodes.is_empty() {
        println!("No nodes under {}.", parent);
    }
    for node in nodes {
        match &node.code {
            Some(code) => println!("  {:>6}  {} ({})", node.id, node.name, code),
            None => println!("  {:>6}  {}", node.id, node.name),
        }
    }
    index.close();
    Ok(())
}

fn cmd_clean(path: &Path, group: i64) -> Result<()> {
    let store = open_store(path)?;
    let removed = store.clean_data_points(group)?;
    let empty = store.delete_empty_survey_instances()?;
    println!("Removed {} data points and {} empty instances.", removed, empty);
    Ok(())
}

fn cmd_reset(path: &Path, transmission: i64) -> Result<()> {
    let store = open_store(path)?;
    store
        .reset_transmission(TransmissionId(transmission))
        .with_context(|| format!("Failed to reset transmission {}", transmission))?;
    println!("Transmission {} queued for upload.", transmission);
    Ok(())
}

/// Run one sync cycle against the configured bucket.
async fn cmd_sync(config: ClientConfig) -> Result<()> {
    let mut s3 = config
        .s3
        .context("The configuration has no \"s3\" section")?;
    if s3.secret.is_empty() {
        s3 = s3.with_secret(read_secret()?);
    }

    let forms = match &config.forms {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read forms {}", path.display()))?;
            StaticForms::from_json(&json).context("Invalid form definitions")?
        }
        None => {
            warn!("No form definitions configured; bundles will carry no answers");
            StaticForms::new()
        }
    };

    let store = Arc::new(open_store(&config.database)?);
    let remote = Arc::new(S3Client::new(s3).context("Invalid S3 configuration")?);
    let coordinator = SyncCoordinator::new(store, remote, Arc::new(forms), config.sync);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, finishing uploads in flight");
            on_interrupt.cancel();
        }
    });

    let report = coordinator.sync_once(cancel).await.context("Sync failed")?;
    println!("{}", report.to_json()?);
    if let Some(error) = &report.error {
        anyhow::bail!("Sync aborted: {}", error);
    }
    Ok(())
}

/// Secret from the environment, or prompted for.
fn read_secret() -> Result<SecretKey> {
    if let Ok(secret) = std::env::var(SECRET_ENV) {
        return Ok(SecretKey::new(secret));
    }
    let secret = rpassword::prompt_password("S3 secret: ").context("Failed to read secret")?;
    if secret.is_empty() {
        anyhow::bail!("Secret cannot be empty");
    }
    Ok(SecretKey::new(secret))
}
