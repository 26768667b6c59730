//! Acceptor — binds the listen port and spawns one independent session
//! task per accepted connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::duplex;
use crate::error::SessionOutcome;
use crate::handshake::{self, HandshakeResult};
use crate::resolver::Resolver;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Bind `PROXY_BIND_ADDR` on all interfaces and accept connections forever.
/// Accept errors are logged and do not stop the loop.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.proxy_bind_addr);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, directory = %format!("{}:{}", config.server_host, config.server_bind_addr), "listening");

    let resolver = Arc::new(Resolver::new(
        config.server_host.clone(),
        config.server_bind_addr.clone(),
    ));

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };

        let resolver = Arc::clone(&resolver);
        let conn_id = CONN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;

        tokio::spawn(async move {
            info!(conn_id, peer = %peer, "accepted connection");
            run_session(socket, resolver, conn_id).await;
        });
    }
}

async fn run_session(socket: tokio::net::TcpStream, resolver: Arc<Resolver>, conn_id: u64) {
    let outcome = match handshake::run(socket, &resolver, conn_id).await {
        HandshakeResult::Ready { client, backend } => {
            info!(conn_id, "handshake complete, entering duplex");
            duplex::run(client, backend, conn_id).await
        }
        HandshakeResult::Done(outcome) => outcome,
    };

    log_outcome(conn_id, outcome);
}

fn log_outcome(conn_id: u64, outcome: SessionOutcome) {
    match outcome {
        SessionOutcome::Closed => info!(conn_id, "session closed"),
        SessionOutcome::TimedOut => info!(conn_id, "session idle deadline elapsed"),
        SessionOutcome::Failed(err) => warn!(conn_id, error = %err, "session failed"),
    }
}
