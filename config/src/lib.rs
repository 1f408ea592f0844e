//! Configuration file loading for unframe.
//!
//! The file is TOML, read from `~/.unframe/config.toml` unless a path is given.
//! A missing default file means "use defaults"; a missing explicit file is an
//! error.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;
use unframe_proxy::ProxyConfig;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct UnframeConfig {
    pub server: Option<ServerConfig>,
    /// Passed to the proxy pipeline as-is (after `${VAR}` expansion in headers).
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind. Default: `127.0.0.1:8787`.
    pub listen_addr: Option<String>,
    /// Path of the proxy endpoint. Default: `/web-proxy`.
    pub route: Option<String>,
    /// Maximum inbound request body. Default: 64 KiB.
    pub max_body_bytes: Option<usize>,
}

impl ServerConfig {
    pub const DEFAULT_LISTEN_ADDR: &'static str = "127.0.0.1:8787";
    pub const DEFAULT_ROUTE: &'static str = "/web-proxy";
    pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

    #[must_use]
    pub fn listen_addr(&self) -> &str {
        self.listen_addr
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(Self::DEFAULT_LISTEN_ADDR)
    }

    /// Route, always with a leading `/`.
    #[must_use]
    pub fn route(&self) -> String {
        let route = self
            .route
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(Self::DEFAULT_ROUTE);
        if route.starts_with('/') {
            route.to_string()
        } else {
            format!("/{route}")
        }
    }

    #[must_use]
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes.unwrap_or(Self::DEFAULT_MAX_BODY_BYTES)
    }
}

/// Replace `${VAR}` with the variable's value (empty if unset).
///
/// An unterminated `${` is kept literally.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

impl UnframeConfig {
    /// Load from the default location. `Ok(None)` when there is no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|err| {
            tracing::warn!("Failed to read config at {:?}: {}", path, err);
            ConfigError::Read {
                path: path.to_path_buf(),
                source: err,
            }
        })?;

        Self::parse(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.expand_header_values();
        Ok(config)
    }

    fn expand_header_values(&mut self) {
        let headers = self
            .proxy
            .as_mut()
            .and_then(|proxy| proxy.http.as_mut())
            .and_then(|http| http.headers.as_mut());
        if let Some(headers) = headers {
            for (_, value) in headers.iter_mut() {
                *value = expand_env_vars(value);
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn proxy_config(&self) -> ProxyConfig {
        self.proxy.clone().unwrap_or_default()
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".unframe").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use unframe_proxy::CookieMode;

    use super::{ConfigError, ServerConfig, UnframeConfig, expand_env_vars};

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            std::env::set_var("UNFRAME_TEST_CONFIG_VAR", "replaced");
        }
        let result = expand_env_vars("prefix ${UNFRAME_TEST_CONFIG_VAR} suffix");
        assert_eq!(result, "prefix replaced suffix");
        unsafe {
            std::env::remove_var("UNFRAME_TEST_CONFIG_VAR");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            std::env::remove_var("UNFRAME_MISSING_VAR_FOR_TEST");
        }
        let result = expand_env_vars("before ${UNFRAME_MISSING_VAR_FOR_TEST} after");
        assert_eq!(result, "before  after");
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_var_name_dropped() {
        assert_eq!(expand_env_vars("test ${} more"), "test  more");
    }

    #[test]
    fn expand_env_vars_unicode_content() {
        unsafe {
            std::env::set_var("UNFRAME_UNICODE_VAR", "\u{1f980}");
        }
        let result = expand_env_vars("caf\u{e9} ${UNFRAME_UNICODE_VAR} Rust");
        assert_eq!(result, "caf\u{e9} \u{1f980} Rust");
        unsafe {
            std::env::remove_var("UNFRAME_UNICODE_VAR");
        }
    }

    #[test]
    fn server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.listen_addr(), "127.0.0.1:8787");
        assert_eq!(server.route(), "/web-proxy");
        assert_eq!(server.max_body_bytes(), 64 * 1024);
    }

    #[test]
    fn route_gets_leading_slash() {
        let server = ServerConfig {
            route: Some("proxy".into()),
            ..Default::default()
        };
        assert_eq!(server.route(), "/proxy");
    }

    #[test]
    fn full_file_parses() {
        unsafe {
            std::env::set_var("UNFRAME_TEST_HEADER_VALUE", "secret");
        }
        let config = UnframeConfig::parse(
            r#"
[server]
listen_addr = "0.0.0.0:9000"
route = "/proxy"

[proxy]
timeout_seconds = 7
max_redirects = 2

[proxy.security]
blocked_cidrs = ["203.0.113.0/24"]

[proxy.http]
headers = [["X-Token", "${UNFRAME_TEST_HEADER_VALUE}"]]

[proxy.rewrite]
strip_frame_busters = false

[proxy.cookies]
mode = "per_origin"
"#,
        )
        .expect("valid config");
        unsafe {
            std::env::remove_var("UNFRAME_TEST_HEADER_VALUE");
        }

        let server = config.server_config();
        assert_eq!(server.listen_addr(), "0.0.0.0:9000");
        assert_eq!(server.route(), "/proxy");

        let proxy = config.proxy_config();
        assert_eq!(proxy.timeout_seconds(), 7);
        assert_eq!(proxy.max_redirects(), 2);
        let headers = proxy.http.and_then(|h| h.headers).expect("headers");
        assert_eq!(headers, vec![("X-Token".to_string(), "secret".to_string())]);
        let rewrite = proxy.rewrite.expect("rewrite");
        assert!(!rewrite.strip_frame_busters);
        assert!(rewrite.absolutize_attributes);
        assert_eq!(proxy.cookies.expect("cookies").mode, CookieMode::PerOrigin);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = UnframeConfig::parse("").expect("empty config");
        assert!(config.server.is_none());
        assert_eq!(config.proxy_config().max_download_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn load_from_reports_path_on_errors() {
        let dir = tempfile::tempdir().expect("tempdir");

        let missing = dir.path().join("missing.toml");
        let err = UnframeConfig::load_from(&missing).expect_err("missing file");
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.path(), &missing);

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[server\nroute = ").expect("write");
        let err = UnframeConfig::load_from(&broken).expect_err("broken toml");
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[proxy]\nmax_redirects = 9\n").expect("write");
        let config = UnframeConfig::load_from(&path).expect("load");
        assert_eq!(config.proxy_config().max_redirects(), 9);
    }

    #[test]
    fn default_path_is_under_home() {
        if let Some(path) = UnframeConfig::path() {
            assert!(path.ends_with(PathBuf::from(".unframe").join("config.toml")));
        }
    }
}
