use clap::Parser;
use herd_core::cli::Cli;
use herd_core::telemetry::logging;
use tracing::debug;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    let _guard = match logging::init(&log_config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("herd: {err}");
            std::process::exit(1);
        }
    };
    debug!(log_level = %log_config.level, log_file = ?log_config.file, "logging configured");

    if let Err(err) = herd_core::app::run(cli).await {
        eprintln!("herd: {err}");
        std::process::exit(1);
    }
}
