//! PoolSentry Intelligence Layer - Main entry point
//!
//! Trains the Isolation Forest, scores pools from the online feature store
//! and serves the prediction gateway.

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use poolsentry_dataplane::utils::parse_interval_end;
use poolsentry_intelligence::{
    config::IntelligenceConfig,
    dashboard::inspect,
    feature_store::FeatureStoreClient,
    gateway::{self, ScoringService},
    model::{
        registry::ModelRegistry,
        score_feature_file, shared_model_cache, synthetic_training_set, train,
        training::{feature_matrix, load_training_rows, DEFAULT_TRAINING_DAYS},
        Contamination, IsolationForestParams, Predictor,
    },
    telemetry::{init_logging, install_metrics_exporter, LogFormat},
    FeatureStoreConfig, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let log_format: LogFormat = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or("text")
        .parse()?;
    init_logging(log_level, log_format);

    if let Some(output_path) = matches.get_one::<String>("generate-config") {
        IntelligenceConfig::default().save_to_file(output_path)?;
        info!("Generated example config at: {}", output_path);
        return Ok(());
    }

    info!(version = VERSION, "Starting PoolSentry Intelligence");

    let config = match matches.get_one::<String>("config") {
        Some(path) => {
            info!("Loading config from: {}", path);
            let mut config = IntelligenceConfig::from_file(path)?;
            config.apply_env_overrides(|name| std::env::var(name).ok());
            config
        }
        None => IntelligenceConfig::load().context("failed to load intelligence configuration")?,
    };
    config.validate().context("invalid intelligence configuration")?;

    match matches.subcommand() {
        Some(("train", args)) => run_train(&config, args),
        Some(("predict", args)) => run_predict(&config, args).await,
        Some(("batch-predict", args)) => run_batch_predict(&config, args),
        Some(("serve", args)) => run_serve(&config, args).await,
        Some(("inspect", args)) => run_inspect(&config, args),
        _ => anyhow::bail!("a subcommand is required (see --help)"),
    }
}

fn cli() -> Command {
    Command::new("intelligence")
        .version(VERSION)
        .about("PoolSentry Intelligence - pool anomaly training and scoring")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("OUTPUT")
                .help("Generate example config and exit"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value("info")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("text or json")
                .default_value("text")
                .global(true),
        )
        .subcommand(
            Command::new("train")
                .about("Fit the Isolation Forest and write an artifact directory")
                .arg(
                    Arg::new("features")
                        .short('f')
                        .long("features")
                        .value_name("FILE")
                        .help("Feature JSONL to train on")
                        .conflicts_with("synthetic"),
                )
                .arg(
                    Arg::new("synthetic")
                        .long("synthetic")
                        .value_name("N")
                        .help("Train on N generated rows instead")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("days")
                        .long("days")
                        .value_name("DAYS")
                        .help("History window in days")
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(Arg::new("out").short('o').long("out").value_name("DIR").required(true))
                .arg(
                    Arg::new("model-version")
                        .long("version")
                        .value_name("VERSION")
                        .help("Version recorded in the artifact metadata")
                        .required(true),
                )
                .arg(
                    Arg::new("contamination")
                        .long("contamination")
                        .value_name("auto|FRACTION"),
                )
                .arg(
                    Arg::new("n-estimators")
                        .long("n-estimators")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_name("SEED")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("registry")
                        .long("registry")
                        .value_name("DIR")
                        .help("Register the artifact and promote the configured alias"),
                ),
        )
        .subcommand(
            Command::new("predict")
                .about("Score pools from the online feature store")
                .arg(
                    Arg::new("pool-id")
                        .short('p')
                        .long("pool-id")
                        .value_name("ID")
                        .required(true)
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("threshold")
                        .long("threshold")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    Arg::new("default-value")
                        .long("default-value")
                        .value_parser(clap::value_parser!(f64)),
                ),
        )
        .subcommand(
            Command::new("batch-predict")
                .about("Score every row of a feature JSONL file")
                .arg(Arg::new("input").short('i').long("input").value_name("FILE").required(true))
                .arg(Arg::new("output").short('o').long("output").value_name("FILE").required(true))
                .arg(Arg::new("model").long("model").value_name("FILE"))
                .arg(
                    Arg::new("threshold")
                        .long("threshold")
                        .value_parser(clap::value_parser!(f64)),
                ),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the HTTP prediction gateway")
                .arg(Arg::new("bind").long("bind").value_name("ADDR")),
        )
        .subcommand(
            Command::new("inspect")
                .about("Show the verdict for the latest feature row at a point in time")
                .arg(Arg::new("features").short('f').long("features").value_name("FILE").required(true))
                .arg(Arg::new("at").long("at").value_name("RFC3339").required(true))
                .arg(Arg::new("model").long("model").value_name("FILE")),
        )
}

fn model_path(config: &IntelligenceConfig, args: &ArgMatches) -> PathBuf {
    args.get_one::<String>("model")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&config.model.model_path))
}

fn run_train(config: &IntelligenceConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let out = PathBuf::from(args.get_one::<String>("out").context("--out is required")?);
    let version = args.get_one::<String>("model-version").context("--version is required")?;
    let seed = args.get_one::<u64>("seed").copied().unwrap_or(42);

    let (x, default_contamination) = match (args.get_one::<String>("features"), args.get_one::<usize>("synthetic")) {
        (Some(path), _) => {
            let days = args.get_one::<i64>("days").copied().unwrap_or(DEFAULT_TRAINING_DAYS);
            let rows = load_training_rows(&PathBuf::from(path), days)?;
            (feature_matrix(&rows), Contamination::Auto)
        }
        (None, Some(n)) => (synthetic_training_set(*n, seed), Contamination::Fraction(0.1)),
        (None, None) => anyhow::bail!("either --features or --synthetic is required"),
    };

    let contamination = match args.get_one::<String>("contamination") {
        Some(value) => value.parse()?,
        None => default_contamination,
    };
    let params = IsolationForestParams {
        n_estimators: args.get_one::<usize>("n-estimators").copied().unwrap_or(200),
        max_samples: None,
        contamination,
        random_state: seed,
    };

    let trained = train(&x, version, &params)?;
    let model_file = trained.write_artifact(&out)?;
    info!(model = %model_file.display(), samples = x.len(), "Training complete");

    if let Some(root) = args.get_one::<String>("registry") {
        let registry = ModelRegistry::new(root);
        let entry = registry.register(&config.model.registered_name, &out)?;
        registry.set_alias(&config.model.registered_name, &config.model.alias, entry.version)?;
        info!(
            model = %config.model.registered_name,
            version = entry.version,
            alias = %config.model.alias,
            "Model registered"
        );
    }
    Ok(())
}

fn predictor(config: &IntelligenceConfig) -> anyhow::Result<Predictor> {
    let store = FeatureStoreConfig::from_env()?;
    let client = FeatureStoreClient::from_config(&store, config)?;
    Ok(Predictor::new(
        Arc::new(client),
        shared_model_cache(),
        &config.model.model_path,
    ))
}

async fn run_predict(config: &IntelligenceConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let pool_ids: Vec<String> = args
        .get_many::<String>("pool-id")
        .map(|ids| ids.cloned().collect())
        .unwrap_or_default();
    let threshold = args.get_one::<f64>("threshold").copied().unwrap_or(config.model.threshold);
    let default_value = args
        .get_one::<f64>("default-value")
        .copied()
        .unwrap_or(config.model.default_feature_value);

    let predictor = predictor(config)?;
    let results = match pool_ids.as_slice() {
        [single] => vec![predictor.predict_from_feature_store(single, threshold, default_value).await],
        many => predictor.predict_batch(many, threshold, default_value).await,
    };

    for result in &results {
        println!("{}", serde_json::to_string(result)?);
    }
    Ok(())
}

fn run_batch_predict(config: &IntelligenceConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let input = PathBuf::from(args.get_one::<String>("input").context("--input is required")?);
    let output = PathBuf::from(args.get_one::<String>("output").context("--output is required")?);
    let threshold = args.get_one::<f64>("threshold").copied().unwrap_or(config.model.threshold);

    let model = shared_model_cache().get(&model_path(config, args))?;
    let count = score_feature_file(&model, &input, &output, threshold)?;
    info!(rows = count, output = %output.display(), "Batch prediction complete");
    Ok(())
}

async fn run_serve(config: &IntelligenceConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let bind = args
        .get_one::<String>("bind")
        .unwrap_or(&config.gateway.bind_address);
    let addr: SocketAddr = bind.parse().with_context(|| format!("invalid bind address {}", bind))?;

    if let Some(metrics_addr) = &config.metrics.prometheus_bind_address {
        install_metrics_exporter(metrics_addr.parse()?)?;
    }

    let predictor = Arc::new(predictor(config)?);
    if let Err(e) = predictor.model() {
        warn!(error = %e, "Model not loadable yet, requests will fail until it is");
    }
    let scorer = Arc::new(ScoringService::new(
        predictor,
        config.model.threshold,
        config.model.default_feature_value,
    ));

    gateway::serve(addr, scorer, config.gateway.allowed_origins.clone(), setup_shutdown_signal()).await?;
    Ok(())
}

fn run_inspect(config: &IntelligenceConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let features = PathBuf::from(args.get_one::<String>("features").context("--features is required")?);
    let at = parse_interval_end(args.get_one::<String>("at").context("--at is required")?)?;

    let model = shared_model_cache().get(&model_path(config, args))?;
    let outcome = inspect(&features, at, &model)?;
    print!("{}", outcome.render());
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
    info!("Shutdown signal received");
}
