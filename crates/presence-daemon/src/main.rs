use clap::Parser;
use presence_daemon::Cli;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG: &str = "presence_daemon=info,presence_client=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_LOG))?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.resolve()?;
    presence_daemon::run(config).await
}
