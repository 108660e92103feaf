use anyhow::Result;
use std::future::Future;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::state::ServerState;

pub async fn run(listen_addr: &str, state: ServerState, shutdown: impl Future<Output = ()>) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;

    info!(addr = %listener.local_addr()?, "listening");

    serve(listener, state, shutdown).await
}

/// Accept until `shutdown` resolves, then close every connection and wait
/// for their teardown.
pub async fn serve(listener: TcpListener, state: ServerState, shutdown: impl Future<Output = ()>) -> Result<()> {
    tokio::pin!(shutdown);
    let mut conns = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                if let Err(err) = socket.set_nodelay(true) {
                    debug!(%peer, error = %err, "set_nodelay failed");
                }

                let state = state.clone();

                conns.spawn(
                    async move {
                        info!("connected");
                        let reason = crate::conn::handle(state, socket).await;
                        info!(%reason, "disconnected");
                    }
                    .instrument(info_span!("conn", %peer)),
                );
            }

            Some(joined) = conns.join_next(), if !conns.is_empty() => {
                if let Err(err) = joined {
                    warn!(error = %err, "connection task failed");
                }
            }
        }
    }

    let closed = state.shutdown().await;
    info!(closed, "shutting down");

    while conns.join_next().await.is_some() {}

    Ok(())
}
