//! unframe proxy pipeline.
//!
//! Fetches a page on behalf of a caller and returns it in a form that renders
//! inside a frame on the caller's own origin:
//!
//! 1. validate the target (scheme, internal-host block list, blocked CIDRs)
//! 2. fetch it with browser-like headers, following redirects by hand and
//!    re-validating every hop, with the socket pinned to validated addresses
//! 3. classify the body by content type
//! 4. rewrite HTML: base URL, anti-framing `meta` removal, frame-buster
//!    removal, attribute absolutization, runtime patch script
//! 5. package the result into a [`ProxyResponse`]
//!
//! ```no_run
//! # async fn demo() -> Result<(), unframe_proxy::ProxyError> {
//! use unframe_proxy::{Proxy, ProxyConfig, ProxyRequest};
//!
//! let proxy = Proxy::new(&ProxyConfig::default())?;
//! let response = proxy.handle(ProxyRequest::new("https://example.com/")).await;
//! println!("{} {}", response.status(), response.to_json());
//! # Ok(())
//! # }
//! ```

mod classify;
mod cookies;
mod envelope;
mod http;
mod resolved;
mod rewrite;
mod types;
mod validate;

use classify::ContentKind;
use resolved::ResolvedConfig;

pub use envelope::ProxyResponse;
pub use rewrite::to_absolute;
pub use types::{
    CookieConfig, CookieMode, ErrorClass, ErrorCode, ErrorDetails, HttpConfig, ProxyConfig,
    ProxyError, ProxyRequest, RewriteConfig, SecurityConfig,
};
pub use validate::{BLOCK_RULES, BlockRule, DEFAULT_BLOCKED_CIDRS};

/// A configured proxy. Cheap to share behind an `Arc`; holds no per-call state.
#[derive(Debug, Clone)]
pub struct Proxy {
    config: ResolvedConfig,
}

impl Proxy {
    /// Resolve `config` once. Fails only on malformed configuration.
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            config: ResolvedConfig::from_config(config)?,
        })
    }

    /// Run one request through the pipeline. Never fails: every error is
    /// folded into the matching envelope.
    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        match self.run(&request).await {
            Ok(response) => response,
            Err(err) => {
                log_failure(request.target_url(), &err);
                ProxyResponse::from_error(&err)
            }
        }
    }

    async fn run(&self, request: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let target = validate::validate_target(request.target_url(), &self.config.security)?;
        tracing::info!(url = %target, "Proxying request");

        let upstream = http::fetch(&target, request.forwarded_cookies(), &self.config).await?;
        tracing::debug!(
            url = %upstream.final_url,
            status = upstream.status,
            bytes = upstream.body.len(),
            "Upstream responded"
        );

        let kind = ContentKind::from_content_type(upstream.content_type.as_deref());
        let text = classify::decode_body(upstream.body, upstream.content_type.as_deref());
        let body = match kind {
            ContentKind::Html => {
                rewrite::rewrite_document(&text, &upstream.final_url, self.config.rewrite)?
            }
            ContentKind::Passthrough => text,
        };

        Ok(ProxyResponse::Success {
            body,
            content_was_html: kind == ContentKind::Html,
            set_cookies: cookies::incoming(
                self.config.cookie_mode,
                upstream.set_cookies,
                &upstream.final_url,
            ),
        })
    }
}

fn log_failure(target: &str, err: &ProxyError) {
    let code = err.code.as_str();
    let details = &err.details.0;
    match err.class() {
        ErrorClass::Input => {
            tracing::info!(url = target, code, ?details, "Rejected request");
        }
        ErrorClass::SecurityBlock => {
            tracing::warn!(url = target, code, ?details, "Blocked target");
        }
        ErrorClass::Upstream => {
            tracing::warn!(url = target, code, ?details, "{}", err.message);
        }
        ErrorClass::Internal => {
            tracing::error!(url = target, code, ?details, "Proxy error: {}", err.message);
        }
    }
}
