//! Duplex Pipe with Idle Deadline — the transparent byte-copy phase that
//! begins once the handshake has spliced authentication.
//!
//! client→backend rearms a 30 minute idle deadline on every successful
//! read; backend→client copies unboundedly, because backend activity
//! alone is not trusted as a liveness signal (a Postgres session is driven
//! by client requests, so client silence is what actually means "idle").
//!
//! Modeled as two independent tokio tasks raced with `select!`: the one
//! that finishes first determines why the session ended, and the other is
//! `abort()`ed, which drops its half of both sockets.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::error::{ProxyError, SessionOutcome};

/// Idle deadline for the client→backend direction.
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Copy chunk size once past the handshake window.
const PIPE_BUF: usize = 4096;

/// Run the transparent pipe until either side closes, the idle deadline
/// expires, or an I/O error occurs.
pub async fn run(client: TcpStream, backend: TcpStream, conn_id: u64) -> SessionOutcome {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let client_to_backend = tokio::spawn(copy_with_deadline(client_read, backend_write, conn_id));
    let backend_to_client = tokio::spawn(copy_unbounded(backend_read, client_write, conn_id));

    tokio::select! {
        result = client_to_backend => {
            backend_to_client.abort();
            outcome_of(result)
        }
        result = backend_to_client => {
            client_to_backend.abort();
            outcome_of(result)
        }
    }
}

/// Flatten a `JoinHandle`'s result (task panic vs. its own `Direction`
/// outcome) into a `SessionOutcome`. An aborted peer task surfaces here as
/// `Err` too, but we only ever inspect the *winning* task's result, so that
/// case never reaches this function for the loser.
fn outcome_of(result: Result<Direction, tokio::task::JoinError>) -> SessionOutcome {
    match result {
        Ok(Direction::Eof) => SessionOutcome::Closed,
        Ok(Direction::TimedOut) => SessionOutcome::TimedOut,
        Ok(Direction::Failed(err)) => SessionOutcome::Failed(err),
        Err(_) => SessionOutcome::Closed,
    }
}

/// Why a single pipe direction stopped.
enum Direction {
    Eof,
    TimedOut,
    Failed(ProxyError),
}

/// client→backend: rearm the idle deadline on every successful read.
async fn copy_with_deadline(
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    conn_id: u64,
) -> Direction {
    let mut buf = vec![0u8; PIPE_BUF];
    loop {
        let read = tokio::time::timeout(KEEP_ALIVE_TIMEOUT, read_half.read(&mut buf)).await;

        let n = match read {
            Err(_) => {
                debug!(conn_id, "client idle deadline elapsed");
                return Direction::TimedOut;
            }
            Ok(Err(e)) => return Direction::Failed(ProxyError::Stream(e)),
            Ok(Ok(0)) => return Direction::Eof,
            Ok(Ok(n)) => n,
        };

        if let Err(e) = write_half.write_all(&buf[..n]).await {
            return Direction::Failed(ProxyError::Stream(e));
        }
    }
}

/// backend→client: unbounded copy, no deadline.
async fn copy_unbounded(
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    _conn_id: u64,
) -> Direction {
    let mut buf = vec![0u8; PIPE_BUF];
    loop {
        let n = match read_half.read(&mut buf).await {
            Err(e) => return Direction::Failed(ProxyError::Stream(e)),
            Ok(0) => return Direction::Eof,
            Ok(n) => n,
        };

        if let Err(e) = write_half.write_all(&buf[..n]).await {
            return Direction::Failed(ProxyError::Stream(e));
        }
    }
}
