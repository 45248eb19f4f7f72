/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

use agent::config::{Cli, Command};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    match cli.command {
        Command::GatewayInit(config) => {
            agent::gateway::init(&config)?;
            info!("gateway initialization complete");
        }
        Command::GatewayRun(config) => {
            agent::gateway::run(config).await?;
        }
        Command::ConsumerInit(config) => {
            agent::consumer::initialize(&config, true).await?;
            info!("consumer initialization complete");
        }
        Command::ConsumerRun(config) => {
            agent::consumer::run(config).await?;
        }
    }
    Ok(())
}
