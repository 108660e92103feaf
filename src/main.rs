mod config;
mod conn;
mod error;
mod framer;
mod id;
mod lifecycle;
mod mailbox;
mod message;
mod protocol;
mod registry;
mod router;
mod server;
mod state;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = config::Args::parse();

    let state = state::ServerState::start(config::Config::from(&args));

    server::run(&args.listen, state, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(err) => {
                error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await
            }
        }
    })
    .await
}
