//! Quarry CLI - administer the search index of a Quarry BI server

use clap::{Parser, Subcommand};
use quarry_core::Error;
use quarry_core::config::Config;
use quarry_core::domain::search::{
    ArchivedFilter, EntityChange, IngestOutcome, ModelKind, Principal, PrincipalPermissions,
    ReindexStatus, SearchContext, SearchPage, SearchService, SearchableEntity, SqliteEntitySource,
};
use quarry_core::storage::{Database, DatabaseConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(author, version, about = "Search index administration for Quarry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file (defaults to the configured path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Search indexed entities
    Search {
        /// Search terms
        query: String,
        /// Restrict to model kinds (repeatable)
        #[arg(short, long = "model")]
        models: Vec<ModelKind>,
        /// Archived filter: exclude, only or include
        #[arg(long, default_value = "exclude")]
        archived: ArchivedFilter,
        /// Restrict to a collection subtree
        #[arg(long)]
        collection: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Rebuild the index into a new generation and swap it in
    Reindex,

    /// Store entities from a JSON file and index them
    Put {
        /// File holding one entity or an array of entities
        file: PathBuf,
    },

    /// Delete an entity and its search document
    Remove {
        model: ModelKind,
        id: i64,
    },

    /// Show engine, generation and ingestion counters
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("quarry=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => cmd_config(action, cli.quiet),
        command => {
            let config = Config::load()?;
            let db = open_database(&config, cli.db.as_deref()).await?;
            let service = SearchService::from_config(
                &db,
                Arc::new(PrincipalPermissions),
                &config.search,
            )
            .await?;

            let result = run(&service, &db, command, cli.format, cli.quiet).await;
            service.shutdown().await?;
            db.close().await;
            result
        }
    }
}

async fn open_database(config: &Config, path: Option<&Path>) -> anyhow::Result<Database> {
    let mut db_config = DatabaseConfig::from_settings(&config.database);
    if let Some(path) = path {
        db_config.path = path.to_path_buf();
    }
    Database::new(db_config).await
}

async fn run(
    service: &SearchService,
    db: &Database,
    command: Commands,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::Search {
            query,
            models,
            archived,
            collection,
            limit,
            offset,
        } => {
            // The CLI is an administrative tool and sees everything
            let mut ctx = SearchContext::new(query, Principal::superuser(0))
                .with_models(models)
                .with_archived(archived)
                .with_pagination(limit, offset);
            if let Some(collection_id) = collection {
                ctx = ctx.with_collection(collection_id);
            }
            let page = service.search(&ctx).await?;
            print_page(&page, format);
        }
        Commands::Reindex => cmd_reindex(service, format, quiet).await?,
        Commands::Put { file } => cmd_put(service, db, &file, quiet).await?,
        Commands::Remove { model, id } => {
            let source = SqliteEntitySource::new(db.pool().clone());
            if !source.remove(model, id).await? {
                return Err(Error::EntityNotFound {
                    model: model.to_string(),
                    id,
                }
                .into());
            }
            let outcome = service
                .apply_change(EntityChange::deleted(model, id))
                .await?;
            if !quiet {
                println!("Removed {} {} ({:?})", model, id, outcome);
            }
        }
        Commands::Status => {
            let status = service.index_status().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                OutputFormat::Text => {
                    println!("Search index");
                    println!("  Engine: {}", status.engine);
                    if let Some(generation) = status.generation {
                        println!("  Generation: {}", generation);
                    }
                    if let Some(documents) = status.documents {
                        println!("  Documents: {}", documents);
                    }
                    if let Some(reindex) = &status.reindex {
                        println!("  Last reindex: {}", reindex.label());
                    }
                    if let Some(metrics) = status.ingestion {
                        println!(
                            "  Ingestion: {} applied, {} deleted, {} dropped, {} failed",
                            metrics.applied, metrics.deleted, metrics.dropped, metrics.failed
                        );
                    }
                }
            }
        }
        Commands::Config { action } => cmd_config(action, quiet)?,
    }
    Ok(())
}

fn print_page(page: &SearchPage, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(page) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to encode results: {}", e),
        },
        OutputFormat::Text => {
            if page.results.is_empty() {
                println!("No results.");
                return;
            }
            for result in &page.results {
                let doc = &result.document;
                let archived = if doc.archived { " [archived]" } else { "" };
                println!(
                    "  {:<14} {:>6}  {}{}  ({:.3})",
                    doc.model, doc.model_id, doc.name, archived, result.score
                );
            }
            println!(
                "\n{} of {} results ({} engine)",
                page.results.len(),
                page.total,
                page.engine
            );
        }
    }
}

/// Runs the rebuild to completion; the process cannot leave it behind
async fn cmd_reindex(service: &SearchService, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let handle = service.reindex().await?;
    info!(reindex_id = %handle.id(), "Reindex requested");

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    let status = loop {
        tokio::select! {
            status = handle.wait() => break status,
            _ = ticker.tick() => {
                if !quiet && format == OutputFormat::Text
                    && let ReindexStatus::Running { generation, documents } = handle.status()
                {
                    println!("  generation {}: {} documents written", generation, documents);
                }
            }
        }
    };

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    }

    match status {
        ReindexStatus::Completed {
            generation,
            documents,
        } => {
            if !quiet && format == OutputFormat::Text {
                println!(
                    "Reindex complete: generation {} now serves {} documents.",
                    generation, documents
                );
            }
            Ok(())
        }
        ReindexStatus::Failed { error, retryable, .. } => {
            let hint = if retryable { " (retry may succeed)" } else { "" };
            Err(anyhow::anyhow!("Reindex failed: {}{}", error, hint))
        }
        other => Err(anyhow::anyhow!("Reindex ended early: {}", other.label())),
    }
}

async fn cmd_put(
    service: &SearchService,
    db: &Database,
    file: &Path,
    quiet: bool,
) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;
    let value: serde_json::Value = serde_json::from_str(&contents)?;
    let entities: Vec<SearchableEntity> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        single => vec![serde_json::from_value(single)?],
    };

    let source = SqliteEntitySource::new(db.pool().clone());
    for entity in &entities {
        source.put(entity).await?;
        let outcome = service
            .apply_change(EntityChange::updated(entity.model(), entity.id()))
            .await?;
        if !quiet {
            let verb = match outcome {
                IngestOutcome::Skipped => "stored",
                _ => "indexed",
            };
            println!("  {} {} {} ({})", verb, entity.model(), entity.id(), entity.name());
        }
    }

    if !quiet {
        println!("{} entities stored.", entities.len());
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_search_arguments() {
        let cli = Cli::try_parse_from([
            "quarry", "search", "revenue", "--model", "card", "-m", "dashboard", "--archived",
            "only", "--limit", "5",
        ])
        .unwrap();

        match cli.command {
            Commands::Search {
                query,
                models,
                archived,
                limit,
                offset,
                ..
            } => {
                assert_eq!(query, "revenue");
                assert_eq!(models, vec![ModelKind::Card, ModelKind::Dashboard]);
                assert_eq!(archived, ArchivedFilter::Only);
                assert_eq!(limit, 5);
                assert_eq!(offset, 0);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn test_rejects_unknown_model() {
        assert!(Cli::try_parse_from(["quarry", "search", "x", "--model", "pulse"]).is_err());
        assert!(Cli::try_parse_from(["quarry", "remove", "pulse", "1"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["quarry", "status", "--db", "/tmp/q.db", "--format", "json"])
            .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/q.db")));
        assert!(cli.format == OutputFormat::Json);
    }
}
