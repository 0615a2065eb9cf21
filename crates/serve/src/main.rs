use clap::Parser;

/// Serves the EnergyGuard measurement API over a set of replicated
/// in-process storage nodes.
#[derive(Debug, clap::Parser)]
#[clap(name = "energyguard")]
struct Args {
    /// Path to the JSON configuration file, created with defaults if absent.
    #[clap(long, env = "ENERGYGUARD_CONFIG", default_value = "config/config.json")]
    config: std::path::PathBuf,

    /// Directory holding the per-node storage files.
    #[clap(long, env = "ENERGYGUARD_DATA", default_value = "data")]
    data_dir: std::path::PathBuf,

    #[clap(flatten)]
    logging: serve::logging::LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    serve::logging::init_logging(&args.logging);
    tracing::debug!(?args, "successfully parsed arguments");

    let config = serve::config::load_or_create(&args.config)?;
    serve::run(config, &args.data_dir).await
}
