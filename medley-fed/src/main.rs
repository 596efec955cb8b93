//! medley-fed - federated music search from the command line
//!
//! ```text
//! medley-fed [--config PATH] search <TEXT> [--source ID]... [--category C] [--page N] [--deadline-ms N]
//! medley-fed [--config PATH] engines
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medley_fed::engines::build_registry;
use medley_fed::{Dispatcher, FederationConfig, Query};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "medley-fed")]
#[command(about = "Federated music search across configured sources")]
#[command(version)]
struct Args {
    /// Config file (overrides MEDLEY_CONFIG and the default locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search the configured sources and print the response as JSON
    Search {
        text: String,

        /// Restrict to these sources (repeatable)
        #[arg(short, long = "source")]
        sources: Vec<String>,

        /// Default-source category when no --source is given
        #[arg(long)]
        category: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Overall deadline (default from [dispatcher] config)
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
    /// List registered engines
    Engines,
}

#[derive(Serialize)]
struct EngineListing<'a> {
    #[serde(flatten)]
    descriptor: &'a medley_fed::EngineDescriptor,
    enabled: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = FederationConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    medley_common::logging::init(&config.logging).context("Failed to initialize logging")?;
    info!("medley-fed {}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(build_registry(&config).context("Failed to build engine registry")?);

    match args.command {
        Command::Engines => {
            let listing: Vec<_> = registry
                .iter()
                .map(|e| EngineListing {
                    descriptor: &e.descriptor,
                    enabled: e.enabled,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Command::Search {
            text,
            sources,
            category,
            page,
            deadline_ms,
        } => {
            let store = config.store.open().await.context("Failed to open shared store")?;
            let dispatcher = Dispatcher::new(Arc::clone(&registry), store, &config);

            let mut query = Query::new(text).with_page(page);
            if !sources.is_empty() {
                query = query.with_sources(sources);
            }
            if let Some(category) = category {
                query = query.with_category(category);
            }

            let response = dispatcher
                .search(&query, deadline_ms.map(Duration::from_millis))
                .await
                .context("Search failed")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}
