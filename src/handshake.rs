//! Handshake Orchestrator — the per-connection state machine that turns a
//! freshly accepted client socket into a pair of sockets ready for the
//! duplex pipe:
//!
//! `AwaitClientStartup → Resolving → OpenBackend → SendRewrittenStartup →
//!  AwaitAuthChallenge → SpliceAuth → Duplex`
//!
//! Any state but `Duplex` can fall to `Fatal`, which just means: log, close
//! both sockets, stop. One session's failure never touches another.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::compute_md5_password;
use crate::error::{ProxyError, SessionOutcome};
use crate::protocol::{self, StartupMessage};
use crate::resolver::Resolver;

/// Read buffer size during the handshake window. Neither a StartupMessage
/// nor a single AuthenticationRequest needs more than this; the duplex pipe
/// uses a larger buffer once the handshake is done.
const HANDSHAKE_BUF: usize = 1024;

/// Outcome of running the handshake to completion.
pub enum HandshakeResult {
    /// Authentication succeeded (or was waived per policy); both sockets
    /// are ready to be handed to the duplex pipe.
    Ready { client: TcpStream, backend: TcpStream },
    /// The session ended during the handshake, with no duplex phase to run.
    Done(SessionOutcome),
}

/// Drive one connection through the handshake state machine.
pub async fn run(mut client: TcpStream, resolver: &Resolver, conn_id: u64) -> HandshakeResult {
    match run_inner(&mut client, resolver, conn_id).await {
        Ok(Some(backend)) => HandshakeResult::Ready { client, backend },
        Ok(None) => HandshakeResult::Done(SessionOutcome::Closed),
        Err(err) => HandshakeResult::Done(SessionOutcome::Failed(err)),
    }
}

/// Returns `Ok(Some(backend))` once the backend is ready for the duplex
/// pipe, `Ok(None)` if the backend closed the connection before ever
/// issuing an auth challenge (a graceful, non-error termination), or
/// `Err` on any fatal condition.
async fn run_inner(
    client: &mut TcpStream,
    resolver: &Resolver,
    conn_id: u64,
) -> Result<Option<TcpStream>, ProxyError> {
    // ── AwaitClientStartup ──────────────────────────────────────────────
    let startup = read_startup(client).await?;
    debug!(conn_id, "received client startup message");

    // ── Resolving ────────────────────────────────────────────────────────
    let bearer = startup.params.get("user").unwrap_or("");
    let datasource_raw = startup.params.get("database").unwrap_or("");
    let datasource_id: u32 = datasource_raw
        .parse()
        .map_err(|_| ProxyError::Resolver(format!("invalid datasource id '{datasource_raw}'")))?;

    let coords = resolver.resolve(bearer, datasource_id).await?;
    debug!(conn_id, host = %coords.host, port = coords.port, "resolved backend coordinates");

    // ── OpenBackend ──────────────────────────────────────────────────────
    let mut backend = TcpStream::connect((coords.host.as_str(), coords.port))
        .await
        .map_err(ProxyError::BackendDial)?;
    debug!(conn_id, "connected to backend");

    // ── SendRewrittenStartup ─────────────────────────────────────────────
    let mut params = startup.params;
    params.set("user", coords.user.clone());
    params.set("database", coords.database.clone());
    let rewritten = protocol::build_startup_message(&params);
    backend
        .write_all(&rewritten)
        .await
        .map_err(|e| ProxyError::Handshake(format!("failed to send rewritten startup: {e}")))?;

    // ── AwaitAuthChallenge / SpliceAuth ──────────────────────────────────
    let spliced = await_auth_challenge(client, &mut backend, &coords, conn_id).await?;
    if !spliced {
        // Backend closed before ever challenging us: graceful, not a fault.
        return Ok(None);
    }

    Ok(Some(backend))
}

/// Accumulate reads from `client` until a complete StartupMessage is
/// available. Handles a StartupMessage arriving split across multiple TCP
/// segments by looping until the declared length is satisfied.
async fn read_startup(client: &mut TcpStream) -> Result<StartupMessage, ProxyError> {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_BUF);
    loop {
        if let Some(msg) = protocol::try_read_startup(&mut buf).map_err(ProxyError::Startup)? {
            return Ok(msg);
        }
        let n = client
            .read_buf(&mut buf)
            .await
            .map_err(|e| ProxyError::Startup(format!("read error: {e}")))?;
        if n == 0 {
            return Err(ProxyError::Startup(
                "client closed connection before completing startup message".into(),
            ));
        }
    }
}

/// Read frames from `backend` until one is recognized as either an
/// AuthenticationMD5Password challenge (spliced) or an AuthenticationOk
/// passthrough (per the resolved Open Question in DESIGN.md). Returns
/// `Ok(true)` once authentication is settled and the session is ready for
/// `Duplex`, `Ok(false)` if the backend closed first (graceful), or `Err`
/// on any other auth-type or I/O failure.
async fn await_auth_challenge(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    coords: &crate::resolver::BackendCoordinates,
    conn_id: u64,
) -> Result<bool, ProxyError> {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_BUF);

    loop {
        let Some(frame) = protocol::try_read_backend_message(&mut buf) else {
            let n = backend
                .read_buf(&mut buf)
                .await
                .map_err(|e| ProxyError::Handshake(format!("backend read error: {e}")))?;
            if n == 0 {
                return Ok(false);
            }
            continue;
        };

        if frame.is_error_response() {
            return Err(ProxyError::Handshake(format!(
                "backend rejected startup: {}",
                frame.error_message()
            )));
        }

        if let Some(salt) = protocol::is_md5_auth_request(&frame.raw) {
            debug!(conn_id, "backend requested MD5 auth, splicing");
            client
                .write_all(&frame.raw)
                .await
                .map_err(|e| ProxyError::Handshake(format!("failed to forward auth challenge: {e}")))?;

            discard_client_password(client).await?;

            let hashed = compute_md5_password(&coords.user, &coords.password, &salt);
            let password_msg = protocol::build_password_message(&hashed);
            backend
                .write_all(&password_msg)
                .await
                .map_err(|e| ProxyError::Handshake(format!("failed to send spliced password: {e}")))?;

            return Ok(true);
        }

        if protocol::is_auth_ok(&frame.raw) {
            debug!(conn_id, "backend sent AuthenticationOk with no prior challenge, passing through");
            client
                .write_all(&frame.raw)
                .await
                .map_err(|e| ProxyError::Handshake(format!("failed to forward auth ok: {e}")))?;
            return Ok(true);
        }

        return Err(ProxyError::Handshake(format!(
            "unsupported backend auth request (type byte {:#x})",
            frame.msg_type
        )));
    }
}

/// Read and discard the client's PasswordMessage reply to the forwarded
/// challenge. It was computed against the bearer token, not the real
/// backend password, so it is never usable and never forwarded.
async fn discard_client_password(client: &mut TcpStream) -> Result<(), ProxyError> {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_BUF);
    loop {
        if buf.len() >= 5 {
            let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            if buf.len() >= 1 + length {
                return Ok(());
            }
        }
        let n = client
            .read_buf(&mut buf)
            .await
            .map_err(|e| ProxyError::Handshake(format!("failed to read client password reply: {e}")))?;
        if n == 0 {
            return Err(ProxyError::Handshake(
                "client closed connection before replying to auth challenge".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    /// A directory service that answers every request with `body` once.
    async fn fake_directory(body: String) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    /// A backend that expects a startup message, challenges MD5 with
    /// `salt`, discards whatever password reply it gets, then answers
    /// AuthenticationOk. The salt is returned to the caller so concurrent
    /// sessions talking to distinct fake backends can be told apart.
    async fn fake_md5_backend(salt: [u8; 4]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else { return };

            let mut buf = BytesMut::with_capacity(1024);
            loop {
                if protocol::try_read_startup(&mut buf).unwrap().is_some() {
                    break;
                }
                socket.read_buf(&mut buf).await.unwrap();
            }

            let mut challenge = vec![b'R'];
            challenge.extend_from_slice(&12i32.to_be_bytes());
            challenge.extend_from_slice(&5i32.to_be_bytes());
            challenge.extend_from_slice(&salt);
            socket.write_all(&challenge).await.unwrap();

            let mut pw_buf = BytesMut::with_capacity(256);
            loop {
                if pw_buf.len() >= 5 {
                    let len = i32::from_be_bytes([pw_buf[1], pw_buf[2], pw_buf[3], pw_buf[4]]) as usize;
                    if pw_buf.len() >= 1 + len {
                        break;
                    }
                }
                socket.read_buf(&mut pw_buf).await.unwrap();
            }

            let mut ok = vec![b'R'];
            ok.extend_from_slice(&8i32.to_be_bytes());
            ok.extend_from_slice(&0i32.to_be_bytes());
            socket.write_all(&ok).await.unwrap();
        });
        addr
    }

    /// S1 — happy path: client startup resolves, backend's MD5 challenge is
    /// spliced with the resolved credentials, and the backend's subsequent
    /// AuthenticationOk reaches the client through the duplex pipe.
    #[tokio::test]
    async fn s1_happy_path_splices_md5_and_enters_duplex() {
        let backend_addr = fake_md5_backend([0xDE, 0xAD, 0xBE, 0xEF]).await;
        let body = format!(
            r#"{{"host":"{}","port":{},"user":"alice","password":"s3cret","name":"orders"}}"#,
            backend_addr.ip(),
            backend_addr.port()
        );
        let directory_addr = fake_directory(body).await;
        let resolver = Resolver::new(
            directory_addr.ip().to_string(),
            directory_addr.port().to_string(),
        );

        let (proxy_side, mut test_client) = loopback_pair().await;

        let mut params = protocol::StartupParams::new();
        params.set("user", "TOK123");
        params.set("database", "42");
        params.set("application_name", "psql");
        let startup_frame = protocol::build_startup_message(&params);

        let handshake = tokio::spawn(async move { run(proxy_side, &resolver, 1).await });

        test_client.write_all(&startup_frame).await.unwrap();

        let mut buf = [0u8; 32];
        let n = test_client.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], b'R');
        assert_eq!(
            protocol::is_md5_auth_request(&buf[..n]),
            Some([0xDE, 0xAD, 0xBE, 0xEF])
        );

        let dummy_reply = protocol::build_password_message("irrelevant");
        test_client.write_all(&dummy_reply).await.unwrap();

        let (client, backend) = match handshake.await.unwrap() {
            HandshakeResult::Ready { client, backend } => (client, backend),
            HandshakeResult::Done(_) => panic!("expected a ready session"),
        };

        tokio::spawn(duplex_pass_through(client, backend));

        let n = test_client.read(&mut buf).await.unwrap();
        assert!(protocol::is_auth_ok(&buf[..n]));
    }

    /// Minimal stand-in for `crate::duplex::run` sufficient to prove bytes
    /// flow from the backend to the client after the handshake hands off.
    async fn duplex_pass_through(mut client: TcpStream, mut backend: TcpStream) {
        let mut buf = [0u8; 4096];
        while let Ok(n) = backend.read(&mut buf).await {
            if n == 0 || client.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    }

    /// S2 — unsupported protocol version: session closes before any
    /// outbound connection is attempted.
    #[tokio::test]
    async fn s2_unsupported_protocol_is_fatal() {
        let resolver = Resolver::new("127.0.0.1".into(), "1".into());
        let (proxy_side, mut test_client) = loopback_pair().await;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&9i32.to_be_bytes());
        buf.extend_from_slice(&196609i32.to_be_bytes());
        buf.extend_from_slice(&[0]);

        let handshake = tokio::spawn(async move { run(proxy_side, &resolver, 2).await });
        test_client.write_all(&buf).await.unwrap();

        match handshake.await.unwrap() {
            HandshakeResult::Done(SessionOutcome::Failed(ProxyError::Startup(_))) => {}
            _ => panic!("expected a fatal startup error"),
        }
    }

    /// S3 — directory returns an invalid field (zero port): session closes,
    /// no backend dial is attempted.
    #[tokio::test]
    async fn s3_invalid_directory_response_is_fatal() {
        let body = r#"{"host":"db","port":0,"user":"a","password":"b","name":"c"}"#.to_string();
        let directory_addr = fake_directory(body).await;
        let resolver = Resolver::new(
            directory_addr.ip().to_string(),
            directory_addr.port().to_string(),
        );

        let (proxy_side, mut test_client) = loopback_pair().await;

        let mut params = protocol::StartupParams::new();
        params.set("user", "TOK123");
        params.set("database", "42");
        let startup_frame = protocol::build_startup_message(&params);

        let handshake = tokio::spawn(async move { run(proxy_side, &resolver, 3).await });
        test_client.write_all(&startup_frame).await.unwrap();

        match handshake.await.unwrap() {
            HandshakeResult::Done(SessionOutcome::Failed(ProxyError::Resolver(_))) => {}
            _ => panic!("expected a fatal resolver error"),
        }
    }
}
