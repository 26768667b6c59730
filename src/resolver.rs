//! Credential Resolver — maps a (bearer token, datasource id) pair to real
//! backend coordinates via the external directory service.
//!
//! One attempt, no retry: a failure here is fatal to the session, same as
//! every other `ResolverError` path in the handshake.

use serde::Deserialize;

use crate::error::ProxyError;

/// Real backend a client's bearer token + datasource id resolve to.
/// The password lives only as long as the MD5 splice needs it; the
/// handshake orchestrator drops this value explicitly once authentication
/// completes rather than holding it for the life of the session.
pub struct BackendCoordinates {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// JSON shape returned by the directory service: `{"host", "port", "user",
/// "password", "name"}`. `name` maps to `BackendCoordinates::database`.
#[derive(Deserialize)]
struct ConnectResponse {
    host: String,
    port: u16,
    user: String,
    password: String,
    name: String,
}

/// Resolves bearer tokens and datasource ids against the directory service
/// at `http://{host}:{port}/connect/{datasource_id}`.
///
/// Holds a single shared `reqwest::Client` constructed once at startup
/// (a single shared client, analogous to the `Arc`-per-connection state
/// pattern used elsewhere in this crate) rather than a new HTTP client per
/// lookup.
#[derive(Clone)]
pub struct Resolver {
    client: reqwest::Client,
    directory_host: String,
    directory_port: String,
}

impl Resolver {
    pub fn new(directory_host: String, directory_port: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            directory_host,
            directory_port,
        }
    }

    /// Look up the backend coordinates for `bearer`/`datasource_id`. One
    /// attempt; transport errors, non-2xx statuses, unparseable bodies, and
    /// invalid (empty/zero) fields are all reported as `ProxyError::Resolver`.
    pub async fn resolve(
        &self,
        bearer: &str,
        datasource_id: u32,
    ) -> Result<BackendCoordinates, ProxyError> {
        let url = format!(
            "http://{}:{}/connect/{datasource_id}",
            self.directory_host, self.directory_port
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| ProxyError::Resolver(format!("directory service unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(ProxyError::Resolver(format!(
                "directory service returned {}",
                response.status()
            )));
        }

        let body: ConnectResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::Resolver(format!("invalid directory service response: {e}")))?;

        validate(body)
    }
}

fn validate(body: ConnectResponse) -> Result<BackendCoordinates, ProxyError> {
    if body.host.is_empty() {
        return Err(ProxyError::Resolver("empty host in directory response".into()));
    }
    if body.port == 0 {
        return Err(ProxyError::Resolver("zero port in directory response".into()));
    }
    if body.user.is_empty() {
        return Err(ProxyError::Resolver("empty user in directory response".into()));
    }
    if body.password.is_empty() {
        return Err(ProxyError::Resolver("empty password in directory response".into()));
    }
    if body.name.is_empty() {
        return Err(ProxyError::Resolver("empty database name in directory response".into()));
    }

    Ok(BackendCoordinates {
        host: body.host,
        port: body.port,
        user: body.user,
        password: body.password,
        database: body.name,
    })
}
