use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::CloseReason;
use crate::registry::Registry;
use crate::router::{Router, RouterHandle};

/// Everything a connection needs from the rest of the server.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Registry,
    pub router: RouterHandle,
    pub config: Arc<Config>,
    shutdown: CancellationToken,
}

impl ServerState {
    /// Spawn the registry and router tasks.
    pub fn start(config: Config) -> Self {
        let registry = Registry::spawn();
        let router = Router::new(registry.clone(), config.send_timeout).spawn(config.router_capacity);

        Self {
            registry,
            router,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await
    }

    /// Refuse new joins and force every member into `Closing`.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        self.registry.close_all(CloseReason::ServerShutdown).await
    }
}
