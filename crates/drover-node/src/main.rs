//! # droverd
//!
//! Distribution node daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drover_cas::{ContentStore, FsFetch};
use drover_config::logging::{init_logging, LogLevel};
use drover_config::Config;
use drover_node::registry::JsonRegistry;
use drover_node::{DirectoryExecutor, ExecutorSet, LogAlertSink, Node, NodeSettings};

/// drover distribution node
#[derive(Parser)]
#[command(name = "droverd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to load instead of the standard locations
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cache root directory
    #[arg(long, global = true, value_name = "DIR")]
    cache_root: Option<PathBuf>,

    /// Name the registry assigns tasks to
    #[arg(long, global = true)]
    node_name: Option<String>,

    /// Directory holding registry.json
    #[arg(long, global = true, value_name = "DIR")]
    registry: Option<PathBuf>,

    /// error, warn, info, debug or trace (RUST_LOG wins)
    #[arg(long, global = true, default_value = "info", env = "DROVER_LOG")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until interrupted (default)
    Run,
    /// Rebuild the cache index and print its totals
    Status,
    /// Print the effective configuration
    Config,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::load().context("Failed to load config")?,
        };
        self.apply_flags(&mut config);
        Ok(config)
    }

    fn apply_flags(&self, config: &mut Config) {
        if let Some(root) = &self.cache_root {
            config.cache.root = root.clone();
        }
        if let Some(name) = &self.node_name {
            config.node.name = name.clone();
        }
        if let Some(registry) = &self.registry {
            config.registry.path = registry.clone();
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

async fn run(config: Config) -> Result<()> {
    let settings = NodeSettings::from_config(&config);
    let registry = Arc::new(JsonRegistry::new(&config.registry.path));
    let executors = ExecutorSet::new().with_wildcard(Arc::new(DirectoryExecutor));
    let node = Node::new(
        settings,
        registry,
        executors,
        Box::new(LogAlertSink),
        Arc::new(FsFetch),
    );

    node.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for ctrl-c, stopping");
        }
    })
    .await
    .context("Node failed")
}

fn status(config: &Config) -> Result<()> {
    let (store, writer) = ContentStore::open(&config.cache.root);
    let report = writer
        .initialize()
        .with_context(|| format!("Failed to open cache at {}", config.cache.root.display()))?;

    let limit = config.cache.size_limit;
    println!("Cache:    {}", store.root().display());
    println!("Node:     {}", config.node_name());
    println!("Entries:  {}", store.len());
    println!(
        "Size:     {} of {} ({:.1}%)",
        format_bytes(store.total_size()),
        format_bytes(limit),
        if limit == 0 {
            100.0
        } else {
            store.total_size() as f64 * 100.0 / limit as f64
        }
    );
    if report.removed_temp_files > 0 || report.skipped > 0 {
        println!(
            "Cleanup:  {} interrupted copies removed, {} stray files skipped",
            report.removed_temp_files, report.skipped
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);
    let config = cli.load_config()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Status => status(&config),
        Commands::Config => {
            print!("{}", config.to_toml());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(500 * 1024 * 1024 * 1024), "500.0 GiB");
    }

    #[test]
    fn test_cli_flags_override_config() {
        let cli = Cli::parse_from([
            "droverd",
            "--cache-root",
            "/srv/cache",
            "--node-name",
            "node-9",
            "status",
        ]);
        assert!(matches!(cli.command, Some(Commands::Status)));
        let mut config = Config::default();
        cli.apply_flags(&mut config);
        assert_eq!(config.cache.root, PathBuf::from("/srv/cache"));
        assert_eq!(config.node_name(), "node-9");
        assert_eq!(config.registry, Config::default().registry);
    }
}
