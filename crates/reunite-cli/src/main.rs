use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reunite_core::{MissingChildRecord, OnnxEmbedder, RecordId};
use reunite_registry::{
    spawn_engine, Config, EngineHandle, RegisterOutcome, RegistryService, SearchOutcome,
};
use reunite_store::{DescriptorCipher, SqliteDirectory, SqliteStore};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reunite", about = "ReUnite missing-child face registry")]
struct Cli {
    /// TOML configuration file; REUNITE_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a photo for a missing-child record
    Register {
        /// Record identifier
        #[arg(long)]
        id: String,
        /// Photo containing exactly one face
        #[arg(long)]
        image: PathBuf,
        /// Create or update the record with this full name
        #[arg(long)]
        name: Option<String>,
        /// Guardian contact stored with the record
        #[arg(long, requires = "name")]
        contact: Option<String>,
    },
    /// Search by photo, name, or both
    Search {
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a record and its registered descriptor
    Remove {
        #[arg(long)]
        id: String,
    },
    /// List registered entries
    List,
    /// Remove entries whose record no longer exists
    Prune,
    /// Show registry status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let directory = Arc::new(
        SqliteDirectory::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );
    let engine = start_engine(&config, directory.clone())?;

    let output = match cli.command {
        Commands::Register {
            id,
            image,
            name,
            contact,
        } => {
            let details = name.map(|full_name| (full_name, contact));
            let outcome = register_child(
                &engine,
                &directory,
                RecordId::new(id),
                read_image(&image)?,
                details,
            )
            .await?;
            register_json(outcome)
        }
        Commands::Search { image, name } => {
            let image = image.as_deref().map(read_image).transpose()?;
            let outcome = engine.search_combined(name, image).await?;
            search_json(outcome)
        }
        Commands::Remove { id } => {
            let record_id = RecordId::new(id);
            let removed = engine.remove(record_id.clone()).await?;
            let record_deleted = directory.delete(&record_id)?;
            json!({ "record_id": record_id, "removed": removed, "record_deleted": record_deleted })
        }
        Commands::List => serde_json::to_value(engine.list().await?)?,
        Commands::Prune => json!({ "pruned": engine.prune_orphans().await? }),
        Commands::Status => serde_json::to_value(engine.status().await?)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn start_engine(config: &Config, directory: Arc<SqliteDirectory>) -> Result<EngineHandle> {
    let mut store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    if let Some(key_file) = &config.encryption_key_file {
        store = store.with_cipher(
            DescriptorCipher::from_key_file(key_file)
                .with_context(|| format!("reading key file {}", key_file.display()))?,
        );
    }

    let embedder = OnnxEmbedder::load(&config.model_dir, config.detection_confidence)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    tracing::info!(model_dir = %config.model_dir.display(), "face models loaded");

    let service = RegistryService::new(config, embedder, Arc::new(store), directory)?;
    Ok(spawn_engine(service, config.request_timeout())?)
}

/// Register the photo, then write the record's name and contact.
///
/// The record is only touched once a new entry was stored, so a rejected
/// photo or an already-registered child leaves the directory unchanged.
async fn register_child(
    engine: &EngineHandle,
    directory: &SqliteDirectory,
    record_id: RecordId,
    image: Vec<u8>,
    details: Option<(String, Option<String>)>,
) -> Result<RegisterOutcome> {
    let outcome = engine.register(record_id.clone(), image).await?;
    if let (RegisterOutcome::Registered(_), Some((full_name, guardian_contact))) = (&outcome, details)
    {
        directory.upsert(&MissingChildRecord {
            id: record_id,
            full_name,
            guardian_contact,
        })?;
    }
    Ok(outcome)
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

fn register_json(outcome: RegisterOutcome) -> Value {
    match outcome {
        RegisterOutcome::Registered(entry) => json!({
            "status": "registered",
            "record_id": entry.record_id,
            "entry_id": entry.entry_id,
            "model_version": entry.descriptor.model_version(),
            "created_at": entry.created_at,
        }),
        RegisterOutcome::Rejected(rejection) => json!({
            "status": "rejected",
            "rejection": rejection,
            "message": rejection.message(),
        }),
        RegisterOutcome::DuplicateEntry(record_id) => json!({
            "status": "duplicate",
            "record_id": record_id,
        }),
    }
}

fn search_json(outcome: SearchOutcome) -> Value {
    match outcome {
        SearchOutcome::Matched(children) => json!({
            "status": "matched",
            "count": children.len(),
            "children": children,
        }),
        SearchOutcome::Rejected(rejection) => json!({
            "status": "rejected",
            "rejection": rejection,
            "message": rejection.message(),
        }),
    }
}
