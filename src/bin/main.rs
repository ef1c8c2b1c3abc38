//! Tally CLI - validate and run report templates
//!
//! Usage:
//!   tally validate <template>
//!   tally order <template>
//!   tally run <template> --entities <entities.json> [--entity <id>] [--database <db.sqlite>] [--param k=v]
//!
//! Templates are TOML, or JSON when the file ends in `.json`.

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tally::config::{Settings, StoreBackend};
use tally::engine::ReportEngine;
use tally::model::{ExecutionStatus, ReportTemplate, Value};
use tally::provider::{MemoryEntityStore, MemoryQueryEngine, QueryEngine, SqliteQueryEngine};
use tally::render::{JsonRenderer, INLINE_LOCATION};
use tally::resolve::FieldResolver;
use tally::store::{MemoryStore, SqliteStore};
use tally::validation::validate_template;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Tally - report field resolution and trigger evaluation")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to TALLY_CONFIG, ./tally.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a template without running it
    Validate {
        /// Path to the template file
        template: PathBuf,
    },

    /// Print the evaluation order of a template's fields
    Order {
        /// Path to the template file
        template: PathBuf,
    },

    /// Run a template once and print the execution result
    Run {
        /// Path to the template file
        template: PathBuf,

        /// JSON object of entity documents keyed by entity id
        #[arg(long)]
        entities: PathBuf,

        /// Entity the source fields resolve against
        #[arg(long)]
        entity: Option<String>,

        /// SQLite database for sql and aggregate fields
        #[arg(long)]
        database: Option<PathBuf>,

        /// Parameter binding, repeatable (`--param region=emea`)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { template } => cmd_validate(&template),
        Commands::Order { template } => cmd_order(&template),
        Commands::Run {
            template,
            entities,
            entity,
            database,
            params,
        } => {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Error starting runtime: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            runtime.block_on(cmd_run(
                &settings, &template, &entities, entity, database, params,
            ))
        }
    }
}

/// Parse `key=value`. The value is read as JSON when it parses, else as text.
fn parse_param(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", s));
    }
    let value = serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from)
        .unwrap_or_else(|_| Value::Text(raw.to_string()));
    Ok((key.to_string(), value))
}

fn load_template(path: &Path) -> Result<ReportTemplate, String> {
    let source = fs::read_to_string(path)
        .map_err(|e| format!("Error reading file '{}': {}", path.display(), e))?;
    let parsed = if path.extension().is_some_and(|ext| ext == "json") {
        ReportTemplate::from_json(&source).map_err(|e| e.to_string())
    } else {
        ReportTemplate::from_toml(&source).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| format!("Error parsing template '{}': {}", path.display(), e))
}

fn cmd_validate(path: &Path) -> ExitCode {
    let template = match load_template(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = validate_template(&template);
    if result.is_valid() {
        println!(
            "✓ {} is valid ({} fields, {} triggers, {} outputs)",
            template.id,
            template.fields.len(),
            template.triggers.len(),
            template.outputs.len()
        );
        ExitCode::SUCCESS
    } else {
        eprintln!("✗ {} has {} error(s):", template.id, result.errors.len());
        for error in &result.errors {
            eprintln!("  - {}", error);
        }
        ExitCode::FAILURE
    }
}

fn cmd_order(path: &Path) -> ExitCode {
    let template = match load_template(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match validate_template(&template).into_result() {
        Ok(order) => {
            for (i, &idx) in order.steps().iter().enumerate() {
                let field = &template.fields[idx];
                let deps = field.dependencies();
                if deps.is_empty() {
                    println!("{:>3}. {} ({})", i + 1, field.name, field.kind.as_str());
                } else {
                    println!(
                        "{:>3}. {} ({}) <- {}",
                        i + 1,
                        field.name,
                        field.kind.as_str(),
                        deps.join(", ")
                    );
                }
            }
            ExitCode::SUCCESS
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("Error: {}", error);
            }
            ExitCode::FAILURE
        }
    }
}

async fn cmd_run(
    settings: &Settings,
    template_path: &Path,
    entities_path: &Path,
    entity: Option<String>,
    database: Option<PathBuf>,
    params: Vec<(String, Value)>,
) -> ExitCode {
    match run(settings, template_path, entities_path, entity, database, params).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(
    settings: &Settings,
    template_path: &Path,
    entities_path: &Path,
    entity: Option<String>,
    database: Option<PathBuf>,
    params: Vec<(String, Value)>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let template = load_template(template_path)?;
    let entities = MemoryEntityStore::from_json(&fs::read_to_string(entities_path)?)?;
    let queries: Arc<dyn QueryEngine> = match database {
        Some(path) => Arc::new(SqliteQueryEngine::open(path)?),
        None => Arc::new(MemoryQueryEngine::new()),
    };
    let resolver = FieldResolver::new(Arc::new(entities), queries);

    let engine = match settings.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            ReportEngine::new(resolver, store.clone(), store, settings.engine.clone())
        }
        StoreBackend::Sqlite => {
            let store = Arc::new(SqliteStore::open(settings.store.resolved_path()?)?);
            ReportEngine::new(resolver, store.clone(), store, settings.engine.clone())
        }
    };
    let renderer = Arc::new(JsonRenderer::new());
    let engine = engine.with_renderer(renderer.clone());

    engine.save_template(&template).await?;
    let parameters: BTreeMap<String, Value> = params.into_iter().collect();
    let record = engine.execute(&template.id, parameters, entity).await?;

    println!("{}", serde_json::to_string_pretty(&record.result)?);
    for reference in &record.result.output_references {
        if reference.location == INLINE_LOCATION {
            if let Some(body) = renderer.inline_output(&record.context.execution_id).await {
                println!("{}", body);
            }
        }
    }

    Ok(if record.result.status == ExecutionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
