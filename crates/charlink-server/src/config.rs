//! Server configuration loaded from environment variables.
//!
//! Everything has a default so the server starts with zero configuration
//! for local development: in-memory store, no replies until a Gemini key is
//! set, no character creation until an ImgBB key is set.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use charlink_net::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use charlink_shared::constants::{DEFAULT_HISTORY_WINDOW, MAX_AVATAR_SIZE};

/// Where characters and messages live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Reported by `/info`.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Charlink Node"`
    pub instance_name: String,

    /// Bearer token for `/admin/*`.
    /// Env: `ADMIN_TOKEN`
    /// Default: unset (admin API disabled).
    pub admin_token: Option<String>,

    /// Env: `STORE_BACKEND` (`memory` or `sqlite`)
    /// Default: `memory`
    pub store_backend: StoreBackend,

    /// SQLite file when `store_backend` is `sqlite`.
    /// Env: `DATABASE_PATH`
    /// Default: unset (platform data directory).
    pub database_path: Option<PathBuf>,

    /// Env: `GEMINI_API_KEY`
    /// Default: unset (replies fail with a configuration error).
    pub gemini_api_key: Option<String>,

    /// Env: `GEMINI_MODEL`
    pub gemini_model: String,

    /// Env: `GEMINI_BASE_URL`
    pub gemini_base_url: String,

    /// Env: `IMGBB_API_KEY`
    /// Default: unset (character creation disabled).
    pub imgbb_api_key: Option<String>,

    /// Text file replacing the built-in system instruction at startup.
    /// Env: `SYSTEM_INSTRUCTION_PATH`
    pub system_instruction_path: Option<PathBuf>,

    /// Earlier messages included in each prompt.
    /// Env: `HISTORY_WINDOW`
    /// Default: `10`
    pub history_window: usize,

    /// Largest accepted avatar upload.
    /// Env: `MAX_UPLOAD_BYTES`
    /// Default: 10 MiB
    pub max_upload_bytes: usize,
}

// Keys stay out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("instance_name", &self.instance_name)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<set>"))
            .field("store_backend", &self.store_backend)
            .field("database_path", &self.database_path)
            .field("gemini_api_key", &self.gemini_api_key.as_ref().map(|_| "<set>"))
            .field("gemini_model", &self.gemini_model)
            .field("gemini_base_url", &self.gemini_base_url)
            .field("imgbb_api_key", &self.imgbb_api_key.as_ref().map(|_| "<set>"))
            .field("system_instruction_path", &self.system_instruction_path)
            .field("history_window", &self.history_window)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            instance_name: "Charlink Node".to_string(),
            admin_token: None,
            store_backend: StoreBackend::Memory,
            database_path: None,
            gemini_api_key: None,
            gemini_model: DEFAULT_MODEL.to_string(),
            gemini_base_url: DEFAULT_BASE_URL.to_string(),
            imgbb_api_key: None,
            system_instruction_path: None,
            history_window: DEFAULT_HISTORY_WINDOW,
            max_upload_bytes: MAX_AVATAR_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// As [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);
        parse_into(&lookup, "STORE_BACKEND", &mut config.store_backend);
        parse_into(&lookup, "HISTORY_WINDOW", &mut config.history_window);
        parse_into(&lookup, "MAX_UPLOAD_BYTES", &mut config.max_upload_bytes);

        if let Some(name) = non_empty(&lookup, "INSTANCE_NAME") {
            config.instance_name = name;
        }
        if let Some(model) = non_empty(&lookup, "GEMINI_MODEL") {
            config.gemini_model = model;
        }
        if let Some(url) = non_empty(&lookup, "GEMINI_BASE_URL") {
            config.gemini_base_url = url.trim_end_matches('/').to_string();
        }

        config.admin_token = non_empty(&lookup, "ADMIN_TOKEN");
        config.gemini_api_key = non_empty(&lookup, "GEMINI_API_KEY");
        config.imgbb_api_key = non_empty(&lookup, "IMGBB_API_KEY");
        config.database_path = non_empty(&lookup, "DATABASE_PATH").map(PathBuf::from);
        config.system_instruction_path =
            non_empty(&lookup, "SYSTEM_INSTRUCTION_PATH").map(PathBuf::from);

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Overwrite `slot` when `name` is set and parses; warn and keep the
/// default otherwise.
fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = non_empty(lookup, name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => {
            tracing::warn!(variable = name, value = %raw, error = %e, "Invalid value, using default");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.history_window, 10);
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_values_are_read() {
        let config = config_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("STORE_BACKEND", "SQLite"),
            ("HISTORY_WINDOW", "4"),
            ("ADMIN_TOKEN", "secret"),
            ("GEMINI_BASE_URL", "http://proxy.local/v1beta/"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.store_backend, StoreBackend::Sqlite);
        assert_eq!(config.history_window, 4);
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.gemini_base_url, "http://proxy.local/v1beta");
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("STORE_BACKEND", "postgres"),
            ("HISTORY_WINDOW", "-1"),
            ("ADMIN_TOKEN", "   "),
        ]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.history_window, 10);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_debug_hides_keys() {
        let config = config_from(&[("GEMINI_API_KEY", "AIza-secret")]);
        let debug = format!("{config:?}");
        assert!(!debug.contains("AIza-secret"));
        assert!(debug.contains("<set>"));
    }
}
