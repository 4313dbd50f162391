// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Personal server entrypoint.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use personal_server_core::bootstrap;
use personal_server_core::presentation::api;
use personal_server_core::ServerConfig;

#[derive(Parser)]
#[command(name = "personal-server", version, about = "Personal data server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default).
    Serve {
        /// Bind address, overrides BIND_ADDR.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the derived personal-server identity for a user address.
    Identity {
        /// User address (0x…).
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; environment always wins.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::from_env().context("configuration error")?;

    match cli.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => serve(config, bind).await,
        Command::Identity { address } => identity(config, &address),
    }
}

async fn serve(mut config: ServerConfig, bind: Option<String>) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }

    let state = bootstrap::build_state(&config).context("service construction failed")?;
    let app = api::app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "personal server listening");

    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}

fn identity(config: ServerConfig, address: &str) -> anyhow::Result<()> {
    let service = personal_server_core::identity::IdentityService::new(
        config.wallet_mnemonic,
        &config.mnemonic_language,
    )?;
    let identity = service.derive_for(address)?;

    println!("user address:   {address}");
    println!("server address: {}", identity.address);
    println!("public key:     {}", identity.public_key_hex());
    Ok(())
}
