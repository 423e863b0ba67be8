use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use polyql::ast::{build_query, Command, FilterArray, QueryRequest, SortField};
use polyql::config::EngineConfig;
use polyql::engine::{CommandOptions, Engine, QueryOptions};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Query and mutate records across heterogeneous storage backends
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Engine config file (defaults to <config dir>/polyql/engine.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Print the plugins in boot order
    Plugins,
    /// Find records of an object
    Find {
        object: String,
        /// Filter array, e.g. '[["age", ">", 30], "or", ["role", "=", "admin"]]'
        #[arg(long)]
        filter: Option<String>,
        /// Sort key as `field` or `field:desc`; repeatable
        #[arg(long)]
        sort: Vec<String>,
        /// Comma-separated projection
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        skip: Option<usize>,
        /// Include timings and the filter shape
        #[arg(long)]
        profile: bool,
    },
    /// Count records of an object
    Count {
        object: String,
        #[arg(long)]
        filter: Option<String>,
    },
    /// Execute a command given as JSON, e.g. '{"type": "create", "object": "tasks", "data": {...}}'
    Exec { command: String },
    /// Show the advisory plan for a filter
    Explain {
        object: String,
        #[arg(long)]
        filter: Option<String>,
    },
    /// Describe the objects stored in a datasource
    Schema {
        #[arg(long)]
        datasource: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_default()?,
    };
    let mut kernel = config.kernel()?;

    if let Action::Plugins = cli.action {
        let order = kernel.resolve_dependencies()?;
        let plugins = kernel.plugins();
        let ordered: Vec<_> = order
            .iter()
            .filter_map(|name| plugins.iter().find(|p| &p.name == name))
            .collect();
        println!("{}", serde_json::to_string_pretty(&ordered)?);
        return Ok(());
    }

    let engine = kernel.boot().await?;
    let outcome = run(&engine, cli.action).await;
    kernel.shutdown().await;

    let (output, success) = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

/// Run one action, returning its JSON output and whether it succeeded.
async fn run(engine: &Engine, action: Action) -> Result<(Value, bool)> {
    let output = match action {
        Action::Plugins => Value::Null,
        Action::Find {
            object,
            filter,
            sort,
            fields,
            limit,
            skip,
            profile,
        } => {
            let request = QueryRequest {
                fields,
                filters: parse_filter(filter.as_deref())?,
                sort: sort.iter().map(String::as_str).map(parse_sort).collect(),
                limit,
                skip,
                ..Default::default()
            };
            let options = QueryOptions {
                profile,
                ..Default::default()
            };
            let result = engine.query(build_query(&object, request), &options).await?;
            serde_json::to_value(result)?
        }
        Action::Count { object, filter } => {
            let filter = parse_filter(filter.as_deref())?.and_then(|f| f.to_node());
            let count = engine
                .count(&object, filter, &QueryOptions::default())
                .await?;
            serde_json::json!({ "count": count })
        }
        Action::Exec { command } => {
            let command: Command =
                serde_json::from_str(&command).context("Invalid command JSON")?;
            let result = engine.dispatch(command, &CommandOptions::default()).await;
            let success = result.success;
            return Ok((serde_json::to_value(result)?, success));
        }
        Action::Explain { object, filter } => {
            let request = QueryRequest {
                filters: parse_filter(filter.as_deref())?,
                ..Default::default()
            };
            let plan = engine.explain(&build_query(&object, request))?;
            serde_json::to_value(plan)?
        }
        Action::Schema { datasource } => {
            let schemas = engine.introspect(datasource.as_deref()).await?;
            serde_json::to_value(schemas)?
        }
    };
    Ok((output, true))
}

fn parse_filter(raw: Option<&str>) -> Result<Option<FilterArray>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("Filter is not valid JSON")?;
    Ok(Some(FilterArray::from_value(&value)?))
}

fn parse_sort(raw: &str) -> SortField {
    match raw.rsplit_once(':') {
        Some((field, dir)) if dir.eq_ignore_ascii_case("desc") => SortField::desc(field),
        Some((field, dir)) if dir.eq_ignore_ascii_case("asc") => SortField::asc(field),
        _ => SortField::asc(raw),
    }
}
