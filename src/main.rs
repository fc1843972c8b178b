use anyhow::Context;
use clap::{Parser, Subcommand};
use docsearch::config::Config;
use docsearch::error::{AppError, Result};
use docsearch::search::{
    create_engine, render_query, DefaultTranslator, Document, DocumentTypeRegistry,
    FilteringTranslator, QueryTranslator, SearchEngine, SearchQuery,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "docsearch")]
#[command(about = "Index and query typed document collections", long_about = None, version)]
struct Cli {
    /// Config file overriding the built-in defaults
    #[arg(short, long, env = "DOCSEARCH_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace every document of a type with the contents of a JSON file
    Index {
        /// Document type
        #[arg(short = 't', long = "type")]
        doc_type: String,

        /// JSON array of documents
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Search indexed documents
    Query {
        #[arg(value_name = "TERM")]
        term: String,

        /// Restrict to a type (repeatable)
        #[arg(short = 't', long = "type")]
        types: Vec<String>,

        /// Exact field filter as FIELD=VALUE (repeatable)
        #[arg(short, long)]
        filter: Vec<String>,

        /// Index TYPE=FILE before querying (repeatable)
        #[arg(short, long)]
        load: Vec<String>,

        /// Print the translated query instead of running it
        #[arg(long)]
        explain: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config);

    if let Err(err) = run(cli.command, &config).await {
        tracing::error!(code = err.error_code(), error = %err, "Command failed");
        return Err(err.into());
    }
    Ok(())
}

async fn run(command: Commands, config: &Config) -> Result<()> {
    config.validate()?;

    tracing::info!(
        engine = %config.search.engine,
        "Starting docsearch v{}",
        env!("CARGO_PKG_VERSION")
    );
    let engine = create_engine(&config.search)?;

    match command {
        Commands::Index { doc_type, file } => {
            let documents = read_documents(&file)?;
            let report = engine.index(&doc_type, &documents).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Query {
            term,
            types,
            filter,
            load,
            explain,
        } => {
            for source in &load {
                let (doc_type, file) = source.split_once('=').ok_or_else(|| {
                    AppError::Validation(format!("--load expects TYPE=FILE, got '{}'", source))
                })?;
                let documents = read_documents(Path::new(file))?;
                engine.index(doc_type, &documents).await?;
            }

            let mut query = SearchQuery::new(term);
            if !types.is_empty() {
                query = query.with_types(types);
            }
            for item in &filter {
                let (field, value) = item.split_once('=').ok_or_else(|| {
                    AppError::Validation(format!("--filter expects FIELD=VALUE, got '{}'", item))
                })?;
                add_filter(&mut query, field, value);
            }

            let translator: Arc<dyn QueryTranslator> = if query.filters.is_empty() {
                Arc::new(DefaultTranslator)
            } else {
                Arc::new(FilteringTranslator)
            };

            if explain {
                // The registry is only populated by --load in this process
                let registry = DocumentTypeRegistry::new();
                let translated = translator.translate(&query, &registry)?;
                println!("{}", serde_json::to_string_pretty(&render_query(&translated.query))?);
                return Ok(());
            }

            engine.set_translator(translator);
            let results = engine.query(&query).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("docsearch={}", config.observability.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.observability.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn read_documents(path: &Path) -> Result<Vec<Document>> {
    tracing::debug!(path = %path.display(), "Reading documents");
    let raw = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)?;

    let Value::Array(items) = value else {
        return Err(AppError::Validation(format!(
            "{} must contain a JSON array of documents",
            path.display()
        )));
    };
    items
        .into_iter()
        .map(|item| Document::from_json(item).map_err(AppError::from))
        .collect()
}

/// Repeated fields accumulate into a set of accepted values
fn add_filter(query: &mut SearchQuery, field: &str, value: &str) {
    let value = Value::from(value);
    let merged = match query.filters.remove(field) {
        Some(existing) => {
            let mut values: Vec<Value> = existing.values().into_iter().cloned().collect();
            values.push(value);
            Value::Array(values)
        }
        None => value,
    };
    query.filters.insert(field.to_string(), merged.into());
}
