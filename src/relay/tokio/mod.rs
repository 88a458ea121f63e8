//! Task-per-connection runtime on tokio.
//!
//! Each accepted connection gets a reader task and a writer task. The hub
//! lives in a single actor task; readers post joins, broadcasts, and
//! leaves to it, and it pushes frames onto each peer's bounded outbound
//! queue. A slow peer therefore stalls only its own writer.

mod actor;
mod connection;

pub use actor::{spawn_hub, HubHandle};

use crate::config::{Config, RelaySettings};
use crate::error::{RelayError, RelayResult};
use crate::relay::listener::bind_listener;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Run the relay on a multi-threaded tokio runtime.
pub fn run(config: Config) -> RelayResult<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

/// Bind the listener and serve until accepting fails fatally.
pub async fn serve(config: Config) -> RelayResult<()> {
    let listener = bind(&config)?;

    info!(
        addr = %listener.local_addr()?,
        max_connections = config.max_connections,
        outbound_queue = config.relay.outbound_queue,
        "Starting tokio runtime"
    );

    let hub = spawn_hub(config.max_connections);
    accept_loop(listener, hub, config.relay).await
}

fn bind(config: &Config) -> RelayResult<TcpListener> {
    let addr = config.listen_addr()?;
    let listener = bind_listener(addr, config.backlog)
        .map_err(|source| RelayError::Bind { addr, source })?;
    Ok(TcpListener::from_std(listener)?)
}

async fn accept_loop(
    listener: TcpListener,
    hub: HubHandle,
    settings: RelaySettings,
) -> RelayResult<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(peer = %peer, "Remote address: {}", peer);
                tokio::spawn(connection::handle_connection(
                    stream,
                    peer,
                    hub.clone(),
                    settings,
                ));
            }
            Err(e) => {
                // Per-connection failures (aborted handshakes, fd exhaustion) are not fatal
                warn!(error = %e, "Accept error");
            }
        }
    }
}
