//! Configuration — three required environment variables, no CLI flags and
//! no config file. Process bootstrap and env loading are otherwise outside
//! this crate's concerns, but the contract for what it reads is exact:
//! `PROXY_BIND_ADDR`, `SERVER_HOST`, `SERVER_BIND_ADDR`, all required.

use std::fmt;

/// Proxy configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the proxy listens on (bound on all interfaces).
    pub proxy_bind_addr: String,
    /// Directory service host.
    pub server_host: String,
    /// Directory service port.
    pub server_bind_addr: String,
}

/// All environment variables missing at startup, collected rather than
/// reported one at a time — a small usability improvement over failing on
/// the first missing variable.
#[derive(Debug)]
pub struct ConfigError {
    missing: Vec<&'static str>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "missing required environment variable(s): {}",
            self.missing.join(", ")
        )
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Read `PROXY_BIND_ADDR`, `SERVER_HOST`, and `SERVER_BIND_ADDR` from
    /// the environment. Returns a single error naming every variable that
    /// was missing, rather than stopping at the first.
    pub fn load() -> Result<Self, ConfigError> {
        let proxy_bind_addr = std::env::var("PROXY_BIND_ADDR").ok();
        let server_host = std::env::var("SERVER_HOST").ok();
        let server_bind_addr = std::env::var("SERVER_BIND_ADDR").ok();

        let mut missing = Vec::new();
        if proxy_bind_addr.is_none() {
            missing.push("PROXY_BIND_ADDR");
        }
        if server_host.is_none() {
            missing.push("SERVER_HOST");
        }
        if server_bind_addr.is_none() {
            missing.push("SERVER_BIND_ADDR");
        }

        if !missing.is_empty() {
            return Err(ConfigError { missing });
        }

        Ok(Config {
            proxy_bind_addr: proxy_bind_addr.unwrap(),
            server_host: server_host.unwrap(),
            server_bind_addr: server_bind_addr.unwrap(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in ["PROXY_BIND_ADDR", "SERVER_HOST", "SERVER_BIND_ADDR"] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn loads_when_all_present() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("PROXY_BIND_ADDR", "5433");
            std::env::set_var("SERVER_HOST", "directory.internal");
            std::env::set_var("SERVER_BIND_ADDR", "9000");
        }

        let config = Config::load().unwrap();
        assert_eq!(config.proxy_bind_addr, "5433");
        assert_eq!(config.server_host, "directory.internal");
        assert_eq!(config.server_bind_addr, "9000");

        clear_env();
    }

    #[test]
    fn reports_all_missing_variables_together() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let err = Config::load().unwrap_err();
        assert!(err.missing.contains(&"PROXY_BIND_ADDR"));
        assert!(err.missing.contains(&"SERVER_HOST"));
        assert!(err.missing.contains(&"SERVER_BIND_ADDR"));
    }

    #[test]
    fn reports_partial_missing() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("PROXY_BIND_ADDR", "5433");
        }

        let err = Config::load().unwrap_err();
        assert_eq!(err.missing, vec!["SERVER_HOST", "SERVER_BIND_ADDR"]);

        clear_env();
    }
}
