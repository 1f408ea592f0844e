//! Domain types for the proxy pipeline.
//!
//! Requests, boundary configuration, and the structured error type shared by
//! every stage.

use serde::Deserialize;
use thiserror::Error;

/// A single proxy call as received from the caller.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    /// Target URL exactly as supplied (may be empty; the validator rejects it).
    target_url: String,

    /// Raw `Cookie` header from the caller, if any.
    forwarded_cookies: Option<String>,
}

impl ProxyRequest {
    #[must_use]
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            forwarded_cookies: None,
        }
    }

    /// Attach the caller's cookie header. Empty values are treated as absent.
    #[must_use]
    pub fn with_cookies(mut self, cookies: Option<String>) -> Self {
        self.forwarded_cookies = cookies.filter(|c| !c.trim().is_empty());
        self
    }

    #[must_use]
    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    #[must_use]
    pub fn forwarded_cookies(&self) -> Option<&str> {
        self.forwarded_cookies.as_deref()
    }
}

/// Proxy configuration.
///
/// Maps to the `[proxy]` table of the server config file. Every field is
/// optional; defaults are applied once in `resolved`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    /// User-Agent sent upstream. Default: a desktop Chrome string.
    pub user_agent: Option<String>,

    /// Deadline for the whole fetch (all redirect hops and the body). Default: 20.
    pub timeout_seconds: Option<u32>,

    /// Maximum redirect hops to follow. Default: 5.
    pub max_redirects: Option<u32>,

    /// Maximum upstream body size in bytes. Default: 10 MiB.
    pub max_download_bytes: Option<u64>,

    /// Maximum resolved addresses tried per hop. Default: 3.
    pub max_dns_attempts: Option<u32>,

    pub security: Option<SecurityConfig>,

    pub http: Option<HttpConfig>,

    pub rewrite: Option<RewriteConfig>,

    pub cookies: Option<CookieConfig>,
}

impl ProxyConfig {
    pub const DEFAULT_TIMEOUT_SECONDS: u32 = 20;

    pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

    /// Default max download bytes (10 MiB).
    pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 10 * 1024 * 1024;

    pub const DEFAULT_MAX_DNS_ATTEMPTS: u32 = 3;

    #[must_use]
    pub fn timeout_seconds(&self) -> u32 {
        self.timeout_seconds
            .unwrap_or(Self::DEFAULT_TIMEOUT_SECONDS)
            .max(1)
    }

    #[must_use]
    pub fn max_redirects(&self) -> u32 {
        self.max_redirects.unwrap_or(Self::DEFAULT_MAX_REDIRECTS)
    }

    #[must_use]
    pub fn max_download_bytes(&self) -> u64 {
        self.max_download_bytes
            .unwrap_or(Self::DEFAULT_MAX_DOWNLOAD_BYTES)
    }
}

/// Security-specific configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    /// Additional blocked CIDR ranges, on top of the built-in table.
    pub blocked_cidrs: Option<Vec<String>>,

    /// Allow loopback targets (for local testing only).
    ///
    /// Only honored when `UNFRAME_ALLOW_INSECURE_OVERRIDES=1` is also set in
    /// the environment. Private, link-local and metadata ranges stay blocked.
    #[serde(default)]
    pub allow_loopback: bool,
}

/// HTTP-specific configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HttpConfig {
    /// Additional request headers.
    pub headers: Option<Vec<(String, String)>>,

    /// Use system proxy settings (`HTTP_PROXY/HTTPS_PROXY`).
    #[serde(default)]
    pub use_system_proxy: bool,

    /// Connect timeout in seconds.
    pub connect_timeout_seconds: Option<u32>,
}

/// HTML rewriting switches.
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteConfig {
    /// Remove inline scripts that look like frame-busting checks.
    #[serde(default = "default_true")]
    pub strip_frame_busters: bool,

    /// Make `href`/`src`/`srcset`/`action` absolute in the served markup.
    #[serde(default = "default_true")]
    pub absolutize_attributes: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            strip_frame_busters: true,
            absolutize_attributes: true,
        }
    }
}

/// How cookies move between the caller and the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CookieMode {
    /// Forward the caller's `Cookie` header verbatim, mirror `Set-Cookie` verbatim.
    #[default]
    Passthrough,
    /// Tag cookie names with the target origin and only forward matching ones.
    PerOrigin,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CookieConfig {
    #[serde(default)]
    pub mode: CookieMode,
}

const fn default_true() -> bool {
    true
}

/// Proxy error with structured details.
///
/// `message` is what the caller sees; `details` are for the log only.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProxyError {
    /// Stable error code.
    pub code: ErrorCode,

    /// Caller-facing description.
    pub message: String,

    /// Error-specific context.
    pub details: ErrorDetails,
}

impl ProxyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: ErrorDetails::default(),
        }
    }

    /// Error carrying the canonical caller-facing message for `code`.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.public_message())
    }

    /// Add a detail field.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.0.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }
}

/// Error codes. Each maps to exactly one [`ErrorClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No target URL supplied.
    MissingUrl,
    /// Target URL failed to parse.
    InvalidUrl,
    /// Scheme other than http/https.
    InvalidProtocol,
    /// Request body was not a JSON object.
    InvalidBody,
    /// Host matched the block list or a blocked CIDR.
    Blocked,
    /// Upstream answered with a non-2xx status.
    UpstreamStatus,
    /// DNS resolution failed.
    DnsFailed,
    /// Connection or stream error.
    Network,
    /// Fetch deadline exceeded.
    Timeout,
    /// Body exceeded the download cap.
    ResponseTooLarge,
    /// Too many redirect hops.
    RedirectLimit,
    /// Anything unanticipated.
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self {
            ErrorCode::MissingUrl
            | ErrorCode::InvalidUrl
            | ErrorCode::InvalidProtocol
            | ErrorCode::InvalidBody => ErrorClass::Input,
            ErrorCode::Blocked => ErrorClass::SecurityBlock,
            ErrorCode::UpstreamStatus
            | ErrorCode::DnsFailed
            | ErrorCode::Network
            | ErrorCode::Timeout
            | ErrorCode::ResponseTooLarge
            | ErrorCode::RedirectLimit => ErrorClass::Upstream,
            ErrorCode::Internal => ErrorClass::Internal,
        }
    }

    /// The fixed caller-facing message for this code.
    #[must_use]
    pub const fn public_message(self) -> &'static str {
        match self {
            ErrorCode::MissingUrl => "URL is required",
            ErrorCode::InvalidUrl => "Invalid URL",
            ErrorCode::InvalidProtocol => "Invalid protocol",
            ErrorCode::InvalidBody => "Invalid request body",
            ErrorCode::Blocked => "Blocked: Cannot access internal resources",
            ErrorCode::UpstreamStatus => "Failed to load page",
            ErrorCode::DnsFailed | ErrorCode::Network => "Failed to load page: network error",
            ErrorCode::Timeout => "Failed to load page: request timed out",
            ErrorCode::ResponseTooLarge => "Failed to load page: response too large",
            ErrorCode::RedirectLimit => "Failed to load page: too many redirects",
            ErrorCode::Internal => "Internal error",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingUrl => "missing_url",
            ErrorCode::InvalidUrl => "invalid_url",
            ErrorCode::InvalidProtocol => "invalid_protocol",
            ErrorCode::InvalidBody => "invalid_body",
            ErrorCode::Blocked => "blocked",
            ErrorCode::UpstreamStatus => "upstream_status",
            ErrorCode::DnsFailed => "dns_failed",
            ErrorCode::Network => "network",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ResponseTooLarge => "response_too_large",
            ErrorCode::RedirectLimit => "redirect_limit",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Failure taxonomy, which decides the transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or malformed input. 400.
    Input,
    /// Disallowed host. 403, never retried.
    SecurityBlock,
    /// The target misbehaved or was unreachable. Logical failure at 200.
    Upstream,
    /// Bug or environment failure. 500.
    Internal,
}

/// Error details as key-value pairs.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetails(pub Vec<(String, String)>);

impl ErrorDetails {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
