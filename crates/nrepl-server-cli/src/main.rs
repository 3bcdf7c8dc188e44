// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! nREPL server launcher
//!
//! Binds the server with the built-in engine and runs until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use nrepl_server::{BuiltinEvaluator, DEFAULT_HOST, DEFAULT_PORT, NReplServer, ServerConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nrepl-server", version)]
#[command(about = "nREPL server speaking bencode over TCP")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "NREPL_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, env = "NREPL_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let config = ServerConfig::new(args.host, args.port);
    let server = NReplServer::new(Arc::new(BuiltinEvaluator::new()));
    let handle = server
        .bind(&config)
        .await
        .with_context(|| format!("failed to bind {}", config.address()))?;

    // Editors scrape this line for the port
    let addr = handle.local_addr();
    println!(
        "nREPL server started on port {} on host {} - nrepl://{}",
        addr.port(),
        addr.ip(),
        addr
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    handle.stop();
    handle.join().await?;
    Ok(())
}
