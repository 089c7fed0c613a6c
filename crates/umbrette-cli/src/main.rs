use anyhow::Result;
use clap::{Parser, Subcommand};
use umbrette_relay::config::RelayConfig;

#[derive(Parser)]
#[command(name = "umbrette", version, about = "Umbrette Nostr relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay service
    Relay,
    /// Print the effective configuration and exit
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Relay => {
            let config = RelayConfig::from_env()?;
            umbrette_relay::run(config).await
        }
        Commands::Config => {
            let config = RelayConfig::from_env()?;
            println!("{config:#?}");
            Ok(())
        }
    }
}
