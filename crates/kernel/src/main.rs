//! Datagrid CLI
//!
//! Inspects and runs grid requests against a schema catalog.
//!
//! Usage:
//!   datagrid explain --schema demos/shop.toml --entity Order --query 'iColumns=1&mDataProp_0=customer.name'
//!   datagrid resolve --schema demos/shop.toml --entity Order customer.location.city lines.product.name
//!   datagrid query --schema demos/shop.toml --entity Order --query '...' --database-url postgres://...

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use datagrid_kernel::engine::PgQueryEngine;
use datagrid_kernel::plan::joins::JoinRegistry;
use datagrid_kernel::plan::render;
use datagrid_kernel::request::parse_query_string;
use datagrid_kernel::schema::{SchemaCatalog, SchemaResolver};
use datagrid_kernel::{Datatable, DatatableManager, GridConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Grid defaults as TOML; the environment is used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the row query and both count queries for a request.
    Explain {
        #[command(flatten)]
        target: Target,

        /// DataTables request as a URL query string.
        #[arg(long)]
        query: String,

        /// Print the plan as JSON instead of SQL.
        #[arg(long)]
        json: bool,
    },

    /// Resolve column paths and print bindings and joins.
    Resolve {
        #[command(flatten)]
        target: Target,

        /// Dotted column paths.
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run a request against PostgreSQL and print the response envelope.
    Query {
        #[command(flatten)]
        target: Target,

        /// DataTables request as a URL query string.
        #[arg(long)]
        query: String,

        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Schema catalog (TOML).
    #[arg(long)]
    schema: PathBuf,

    /// Root entity name or `Namespace:Entity` alias.
    #[arg(long)]
    entity: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Explain {
            target,
            query,
            json,
        } => explain(&target, &query, json, config),
        Command::Resolve { target, paths } => resolve(&target, &paths, &config),
        Command::Query {
            target,
            query,
            database_url,
        } => run_query(&target, &query, &database_url, config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<GridConfig> {
    match path {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            GridConfig::from_toml_str(&source)
        }
        None => GridConfig::from_env().context("failed to load configuration"),
    }
}

fn load_schema(path: &Path) -> Result<SchemaCatalog> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schema {}", path.display()))?;
    let catalog = SchemaCatalog::from_toml_str(&source)
        .with_context(|| format!("invalid schema {}", path.display()))?;
    info!(entities = catalog.len(), "schema loaded");
    Ok(catalog)
}

/// Canonical entity name for `target.entity`.
fn entity_name(catalog: &SchemaCatalog, target: &Target) -> Result<String> {
    catalog
        .resolve_entity(&target.entity)
        .map(|e| e.name.clone())
        .with_context(|| format!("unknown entity '{}'", target.entity))
}

fn explain(target: &Target, query: &str, json: bool, config: GridConfig) -> Result<()> {
    let catalog = load_schema(&target.schema)?;
    let entity = entity_name(&catalog, target)?;

    let grid =
        Datatable::new(Arc::new(catalog), &entity, parse_query_string(query)).with_config(config);
    let prepared = grid.prepare()?;

    if json {
        let plan = serde_json::to_string_pretty(prepared.plan()).context("failed to encode plan")?;
        println!("{plan}");
        return Ok(());
    }

    println!("-- rows");
    println!("{};", render::row_query(&prepared.planned.plan)?);
    println!("-- total");
    println!("{};", render::count_query(&prepared.planned.total)?);
    println!("-- filtered");
    println!("{};", render::count_query(&prepared.planned.filtered)?);
    Ok(())
}

fn resolve(target: &Target, paths: &[String], config: &GridConfig) -> Result<()> {
    let catalog = load_schema(&target.schema)?;
    let entity = entity_name(&catalog, target)?;

    let resolver = SchemaResolver::new(&catalog, &entity)?;
    let mut joins = JoinRegistry::new(resolver.root_alias(), config.default_join_kind);
    for path in paths {
        let binding = resolver.resolve(path, &mut joins)?;
        println!(
            "{path} -> {} (column {}, alias {}{})",
            binding.fully_qualified_name,
            binding.column_name,
            binding.join_alias,
            if binding.contains_collection_hop {
                ", collection"
            } else {
                ""
            }
        );
    }

    for join in joins.iter() {
        println!(
            "{} join {} as {} via {} (first reached by '{}')",
            join.kind,
            join.table,
            join.alias,
            join.source_expression(),
            join.origin_column
        );
    }
    Ok(())
}

async fn run_query(
    target: &Target,
    query: &str,
    database_url: &str,
    config: GridConfig,
) -> Result<()> {
    let catalog = load_schema(&target.schema)?;
    let engine = PgQueryEngine::connect(database_url)
        .await?
        .with_statement_timeout(config.statement_timeout_secs);

    let manager = DatatableManager::new(Arc::new(catalog), Arc::new(engine), config);
    let grid = manager.datatable(&target.entity, parse_query_string(query))?;
    let envelope = grid.search_results().await?;

    let output = serde_json::to_string_pretty(&envelope).context("failed to encode response")?;
    println!("{output}");
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
