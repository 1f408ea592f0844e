//! Invariant-safe configuration resolution.
//!
//! This module transforms optional boundary-level configuration ([`ProxyConfig`])
//! into a concrete [`ResolvedConfig`] with no `Option` fields. Optional
//! configuration is resolved once when the [`crate::Proxy`] is built, and the
//! pipeline operates on types where all defaults are already applied.
use std::env;
use std::time::Duration;

use crate::types::{CookieMode, ErrorCode, ProxyConfig, ProxyError};
use crate::validate::{Cidr, parse_cidr};

pub(crate) const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ENV_ALLOW_INSECURE_OVERRIDES: &str = "UNFRAME_ALLOW_INSECURE_OVERRIDES";

#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_redirects: u32,
    pub max_download_bytes: u64,
    pub max_dns_attempts: u32,
    pub security: ResolvedSecurityConfig,
    pub http: ResolvedHttpConfig,
    pub rewrite: ResolvedRewriteConfig,
    pub cookie_mode: CookieMode,
}

impl ResolvedConfig {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let user_agent = config
            .user_agent
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        let timeout = Duration::from_secs(u64::from(config.timeout_seconds()));
        let max_dns_attempts = config
            .max_dns_attempts
            .unwrap_or(ProxyConfig::DEFAULT_MAX_DNS_ATTEMPTS)
            .max(1);

        Ok(Self {
            user_agent,
            timeout,
            max_redirects: config.max_redirects(),
            max_download_bytes: config.max_download_bytes(),
            max_dns_attempts,
            security: ResolvedSecurityConfig::from_config(config)?,
            http: ResolvedHttpConfig::from_config(config),
            rewrite: ResolvedRewriteConfig::from_config(config),
            cookie_mode: config.cookies.as_ref().map(|c| c.mode).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedSecurityConfig {
    /// Operator-supplied CIDRs, checked after the built-in table.
    pub extra_blocked_cidrs: Vec<Cidr>,
    pub allow_loopback: bool,
}

impl ResolvedSecurityConfig {
    fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let security = config.security.as_ref();

        let mut extra_blocked_cidrs = Vec::new();
        for entry in security
            .and_then(|s| s.blocked_cidrs.as_deref())
            .unwrap_or_default()
        {
            let cidr = parse_cidr(entry).ok_or_else(|| {
                ProxyError::new(ErrorCode::Internal, format!("invalid blocked cidr: {entry}"))
                    .with_detail("cidr", entry)
            })?;
            extra_blocked_cidrs.push(cidr);
        }

        let requested_loopback = security.is_some_and(|s| s.allow_loopback);
        let opted_in = env_opt_in_enabled(ENV_ALLOW_INSECURE_OVERRIDES);
        if requested_loopback && !opted_in {
            tracing::warn!(
                "allow_loopback requested in config but disabled: set {}=1 to opt in",
                ENV_ALLOW_INSECURE_OVERRIDES
            );
        }

        Ok(Self {
            extra_blocked_cidrs,
            allow_loopback: requested_loopback && opted_in,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedHttpConfig {
    pub headers: Vec<(String, String)>,
    pub use_system_proxy: bool,
    pub connect_timeout: TimeoutSetting,
}

impl ResolvedHttpConfig {
    fn from_config(config: &ProxyConfig) -> Self {
        let http = config.http.as_ref();
        let headers = http.and_then(|h| h.headers.clone()).unwrap_or_default();
        let use_system_proxy = http.is_some_and(|h| h.use_system_proxy);
        let connect_timeout = http
            .and_then(|h| h.connect_timeout_seconds)
            .map_or(TimeoutSetting::Disabled, |s| {
                TimeoutSetting::Enabled(Duration::from_secs(u64::from(s)))
            });

        Self {
            headers,
            use_system_proxy,
            connect_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum TimeoutSetting {
    Disabled,
    Enabled(Duration),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedRewriteConfig {
    pub strip_frame_busters: bool,
    pub absolutize_attributes: bool,
}

impl ResolvedRewriteConfig {
    fn from_config(config: &ProxyConfig) -> Self {
        let rewrite = config.rewrite.clone().unwrap_or_default();
        Self {
            strip_frame_busters: rewrite.strip_frame_busters,
            absolutize_attributes: rewrite.absolutize_attributes,
        }
    }
}

fn env_opt_in_enabled(name: &str) -> bool {
    is_truthy_env(env::var(name).ok().as_deref())
}

fn is_truthy_env(value: Option<&str>) -> bool {
    value.is_some_and(|raw| {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
