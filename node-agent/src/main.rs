// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use node_agent::cache::SecretCache;
use node_agent::configuration::AgentOptions;
use node_agent::server::Server;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    println!("[node-agent] init");

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        // this needs to be set to remove duplicated information in the log.
        .with_current_span(false)
        // no ANSI color codes in collected logs.
        .with_ansi(false)
        // the log collector adds the ingestion time.
        .without_time()
        // remove the name of the function from every log entry
        .with_target(false)
        .init();

    // get configuration options from arguments and environment variables
    let options = AgentOptions::parse();
    options.validate()?;

    tracing::info!("[node-agent] {:?}", &options);

    let ca = ca_client::new_ca_client(&options.ca_config())?;
    tracing::info!(
        "[node-agent] using {} CA at {}",
        ca.provider(),
        options.ca_endpoint
    );

    let cache = Arc::new(SecretCache::new(ca, options.cache_options())?);
    let server = Server::build(&options, cache.clone()).await?;

    let shutdown = server.shutdown_token();
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("[node-agent] received SIGINT"),
            _ = terminate.recv() => tracing::info!("[node-agent] received SIGTERM"),
        }
        shutdown.cancel();
    });

    server.run_until_stopped().await?;
    cache.close().await;

    tracing::info!("[node-agent] stopped");

    Ok(())
}
