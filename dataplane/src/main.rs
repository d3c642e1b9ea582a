//! PoolSentry Dataplane - Main entry point
//!
//! Runs one ingestion step per invocation: fetch an hour from a subgraph,
//! build the clean table, engineer features, or archive duplicate raw files.

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use poolsentry_dataplane::{
    archive::archive_duplicates,
    config::DataplaneConfig,
    features::{build_feature_table, FeatureEngineer},
    fetcher::{default_interval_end, fetch_pool_data},
    loader::build_clean_table,
    utils::parse_interval_end,
    Protocol,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    init_logging(log_level);

    info!(version = poolsentry_dataplane::VERSION, "Starting PoolSentry Dataplane");

    let config = DataplaneConfig::load().context("failed to load dataplane configuration")?;
    config.validate().context("invalid dataplane configuration")?;

    match matches.subcommand() {
        Some(("fetch", args)) => run_fetch(&config, args).await,
        Some(("load", args)) => run_load(&config, args),
        Some(("features", args)) => run_features(&config, args),
        Some(("archive", args)) => run_archive(&config, args),
        _ => unreachable!("subcommand is required"),
    }
}

fn cli() -> Command {
    Command::new("dataplane")
        .version(poolsentry_dataplane::VERSION)
        .about("PoolSentry Dataplane - DEX pool ingestion and feature engineering")
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value("info")
                .global(true),
        )
        .subcommand(
            Command::new("fetch")
                .about("Fetch one hour of poolHourDatas and write raw JSONL")
                .arg(
                    Arg::new("protocol")
                        .short('p')
                        .long("protocol")
                        .value_name("PROTOCOL")
                        .help("uniswap or sushiswap")
                        .required(true),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Output JSONL (defaults to {raw_dir}/{protocol}/{interval}_pool.jsonl)"),
                )
                .arg(
                    Arg::new("interval-end")
                        .long("interval-end")
                        .value_name("RFC3339")
                        .help("End of the fetched hour (defaults to the current hour)"),
                ),
        )
        .subcommand(
            Command::new("load")
                .about("Build the clean table from raw JSONL")
                .arg(Arg::new("data-dir").long("data-dir").value_name("DIR"))
                .arg(Arg::new("output").short('o').long("output").value_name("FILE"))
                .arg(
                    Arg::new("protocols")
                        .long("protocols")
                        .value_name("LIST")
                        .help("Comma-separated protocols to load")
                        .default_value("uniswap,sushiswap"),
                ),
        )
        .subcommand(
            Command::new("features")
                .about("Engineer model features from the clean table")
                .arg(Arg::new("input").short('i').long("input").value_name("FILE"))
                .arg(Arg::new("output").short('o').long("output").value_name("FILE"))
                .arg(
                    Arg::new("import-format")
                        .long("import-format")
                        .help("Write the feature-store import shape")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("archive")
                .about("Move duplicated raw files of the same hour into archived/")
                .arg(
                    Arg::new("dir")
                        .short('d')
                        .long("dir")
                        .value_name("DIR")
                        .required(true),
                ),
        )
}

/// Initialize logging with the specified level
fn init_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            tracing::Level::INFO
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("poolsentry_dataplane={},dataplane={}", level, level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn path_arg(args: &ArgMatches, name: &str, fallback: &str) -> PathBuf {
    args.get_one::<String>(name)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(fallback))
}

async fn run_fetch(config: &DataplaneConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let protocol: Protocol = args
        .get_one::<String>("protocol")
        .context("--protocol is required")?
        .parse()?;
    let interval_end = match args.get_one::<String>("interval-end") {
        Some(value) => parse_interval_end(value)?,
        None => default_interval_end(),
    };
    let output = match args.get_one::<String>("output") {
        Some(path) => PathBuf::from(path),
        None => Path::new(&config.storage.raw_dir)
            .join(protocol.name())
            .join(format!("{}_pool.jsonl", interval_end.format("%Y%m%dT%H%M%S"))),
    };

    tokio::select! {
        result = fetch_pool_data(config, protocol, &output, interval_end) => {
            let report = result?;
            info!(
                protocol = %protocol,
                records = report.records,
                elapsed_ms = report.elapsed_ms,
                output = %report.output,
                "Fetch complete"
            );
        }
        _ = setup_shutdown_signal() => {
            warn!("Shutdown signal received, fetch aborted");
        }
    }
    Ok(())
}

fn run_load(config: &DataplaneConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let data_dir = path_arg(args, "data-dir", &config.storage.raw_dir);
    let output = path_arg(args, "output", &config.storage.clean_path);
    let protocols = args
        .get_one::<String>("protocols")
        .map(String::as_str)
        .unwrap_or("uniswap,sushiswap")
        .split(',')
        .map(|p| p.trim().parse::<Protocol>())
        .collect::<Result<Vec<_>, _>>()?;

    let table = build_clean_table(&data_dir, &protocols)?;
    table.write_jsonl(&output)?;
    info!(
        rows = table.rows.len(),
        pools = table.metadata.len(),
        skipped_lines = table.skipped_lines,
        duplicates_removed = table.duplicates_removed,
        "Load complete"
    );
    Ok(())
}

fn run_features(config: &DataplaneConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let input = path_arg(args, "input", &config.storage.clean_path);
    let output = path_arg(args, "output", &config.storage.features_path);
    let engineer = FeatureEngineer::new(&config.features);

    let count = build_feature_table(&input, &output, &engineer, args.get_flag("import-format"))?;
    info!(feature_rows = count, "Feature engineering complete");
    Ok(())
}

fn run_archive(config: &DataplaneConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let dir = path_arg(args, "dir", &config.storage.raw_dir);
    let archive_dir = dir.join(&config.storage.archive_dir_name);

    let report = archive_duplicates(&dir, &archive_dir)?;
    for group in &report.groups {
        info!(hour = %group.hour_key, kept = %group.kept, archived = ?group.archived, "Hour deduplicated");
    }
    info!(archived = report.archived_count(), ignored = report.ignored.len(), "Archive complete");
    Ok(())
}

/// Set up graceful shutdown signal handling
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
