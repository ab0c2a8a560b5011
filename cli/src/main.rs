use clap::Parser;

mod cli;

use cli::{Cli, Commands};
use nutrik_core::config::load_config_with_source;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Config first: it carries the core log level
    let (mut config, config_source) = load_config_with_source(cli.config.clone())?;
    config.apply_env_overrides();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nutrik_server=info".parse()?)
                .add_directive(format!("nutrik_core={}", config.logging.level).parse()?)
                .add_directive("tower_http=debug".parse()?)
        )
        .init();

    match cli.command {
        Commands::Start { port } => {
            cli::commands::start::run(config, port).await?;
        }
        Commands::Status => {
            cli::commands::status::run(&config, config_source.as_deref()).await?;
        }
        Commands::Ask { message, image, stream } => {
            cli::commands::ask::run(config, message, image, stream).await?;
        }
    }

    Ok(())
}
