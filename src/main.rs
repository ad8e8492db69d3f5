// UTXO node - CLI

use clap::Parser;
use utxo_node::{Cli, CliHandler, NodeConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => NodeConfig::load(path),
        None => NodeConfig::from_env(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = CliHandler::new(config).handle(cli.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
