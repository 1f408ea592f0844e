//! Upstream fetcher.
//!
//! Issues a browser-like GET with redirects handled by hand: every hop is
//! re-validated, its host resolved and the socket pinned to the validated
//! addresses. One deadline covers resolution, all hops and the body.
use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderName, HeaderValue, LOCATION, SET_COOKIE};
use reqwest::redirect::Policy;
use tokio::net::lookup_host;
use tokio::time::timeout;
use url::{Host, Url};

use crate::cookies::{self, HopCookies};
use crate::resolved::{ResolvedConfig, TimeoutSetting};
use crate::types::{ErrorCode, ProxyError};
use crate::validate::{blocked_ip_error, check_ip_blocked, validate_url};

/// Request headers that make the fetch look like a top-level browser navigation.
/// `User-Agent` is set on the client.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/avif,image/jxl,image/apng,*/*;q=0.8",
    ),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Accept-Encoding", "gzip, deflate, br"),
    ("DNT", "1"),
    ("Connection", "keep-alive"),
    ("Upgrade-Insecure-Requests", "1"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Sec-Fetch-User", "?1"),
    ("Cache-Control", "max-age=0"),
];

/// A completed upstream exchange with a 2xx status.
#[derive(Debug)]
pub(crate) struct Upstream {
    /// URL of the response that was read, after redirects.
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Raw `Set-Cookie` values of every response, redirects included.
    pub set_cookies: Vec<HopCookies>,
}

/// Fetch `target`, which must already have passed validation.
///
/// `caller_cookies` is the caller's raw Cookie header. What each hop receives
/// from it is decided by the configured cookie mode.
pub(crate) async fn fetch(
    target: &Url,
    caller_cookies: Option<&str>,
    config: &ResolvedConfig,
) -> Result<Upstream, ProxyError> {
    let deadline = Instant::now() + config.timeout;

    let mut headers: Vec<(String, String)> = BROWSER_HEADERS
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    headers.extend(config.http.headers.iter().cloned());

    let mut current_url = target.clone();
    let mut redirect_count = 0u32;
    let mut set_cookies = Vec::new();

    loop {
        let ips = pinned_addresses(&current_url, config, deadline).await?;
        let cookie = cookies::outgoing(config.cookie_mode, caller_cookies, target, &current_url);
        let response = send_with_pinning(
            &current_url,
            &ips,
            &headers,
            cookie.as_deref(),
            config,
            deadline,
        )
        .await?;
        let status = response.status().as_u16();

        let values: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        if !values.is_empty() {
            set_cookies.push(HopCookies {
                url: current_url.clone(),
                values,
            });
        }

        if matches!(status, 301 | 302 | 303 | 307 | 308)
            && let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.trim().is_empty())
        {
            redirect_count += 1;
            if redirect_count > config.max_redirects {
                return Err(ProxyError::from_code(ErrorCode::RedirectLimit)
                    .with_detail("count", redirect_count.to_string())
                    .with_detail("max", config.max_redirects.to_string()));
            }

            let next_url = current_url.join(location).map_err(|e| {
                ProxyError::from_code(ErrorCode::Network)
                    .with_detail("location", location)
                    .with_detail("error", e.to_string())
            })?;
            validate_hop(&next_url, config)?;

            tracing::debug!(
                from = %current_url,
                to = %next_url,
                status,
                hop = redirect_count,
                "Following redirect"
            );
            current_url = next_url;
            continue;
        }

        if !(200..300).contains(&status) {
            return Err(ProxyError::new(
                ErrorCode::UpstreamStatus,
                format!("{}: {status}", ErrorCode::UpstreamStatus.public_message()),
            )
            .with_detail("status", status.to_string())
            .with_detail("url", current_url.as_str()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = read_body(response, config, deadline).await?;

        return Ok(Upstream {
            final_url: current_url,
            status,
            content_type,
            body,
            set_cookies,
        });
    }
}

/// Run the request validator on a redirect target.
///
/// A blocked hop stays a security block; any other rejection is the
/// upstream's fault and becomes a network failure.
fn validate_hop(next_url: &Url, config: &ResolvedConfig) -> Result<(), ProxyError> {
    validate_url(next_url, &config.security).map_err(|err| {
        if err.code == ErrorCode::Blocked {
            err
        } else {
            ProxyError::from_code(ErrorCode::Network)
                .with_detail("error", "invalid redirect target")
                .with_detail("location", next_url.as_str())
                .with_detail("reason", err.code.as_str())
        }
    })
}

async fn read_body(
    response: reqwest::Response,
    config: &ResolvedConfig,
    deadline: Instant,
) -> Result<Vec<u8>, ProxyError> {
    let max_bytes = config.max_download_bytes;
    if let Some(len) = response.content_length()
        && len > max_bytes
    {
        return Err(too_large_error(len, max_bytes));
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timeout_error("response", config));
        }
        let next = timeout(remaining, stream.next())
            .await
            .map_err(|_| timeout_error("response", config))?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(|e| {
            ProxyError::from_code(ErrorCode::Network).with_detail("error", e.to_string())
        })?;

        let total = (body.len() + chunk.len()) as u64;
        if total > max_bytes {
            return Err(too_large_error(total, max_bytes));
        }

        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

/// Addresses the connection for `url` may use.
async fn pinned_addresses(
    url: &Url,
    config: &ResolvedConfig,
    deadline: Instant,
) -> Result<Vec<IpAddr>, ProxyError> {
    match url.host() {
        // Literals were checked by the validator.
        Some(Host::Ipv4(ip)) => Ok(vec![IpAddr::V4(ip)]),
        Some(Host::Ipv6(ip)) => Ok(vec![IpAddr::V6(ip)]),
        Some(Host::Domain(name)) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            timeout(
                remaining,
                resolve_and_validate(name, port_for_url(url), config),
            )
            .await
            .map_err(|_| timeout_error("dns", config))?
        }
        None => Err(ProxyError::from_code(ErrorCode::InvalidUrl).with_detail("url", url.as_str())),
    }
}

async fn resolve_and_validate(
    host: &str,
    port: u16,
    config: &ResolvedConfig,
) -> Result<Vec<IpAddr>, ProxyError> {
    let addrs = lookup_host((host, port)).await.map_err(|e| {
        ProxyError::from_code(ErrorCode::DnsFailed)
            .with_detail("host", host)
            .with_detail("error", e.to_string())
    })?;

    let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
    if ips.is_empty() {
        return Err(ProxyError::from_code(ErrorCode::DnsFailed)
            .with_detail("host", host)
            .with_detail("error", "no addresses"));
    }

    sort_ips(&mut ips);

    let mut allowed = Vec::new();
    let mut blocked: Vec<(IpAddr, String)> = Vec::new();
    for ip in ips {
        match check_ip_blocked(ip, &config.security) {
            Some(cidr) => blocked.push((ip, cidr)),
            None => allowed.push(ip),
        }
    }

    if allowed.is_empty()
        && let Some((ip, cidr)) = blocked.first()
    {
        return Err(blocked_ip_error(*ip, cidr).with_detail("host", host));
    }

    Ok(allowed)
}

fn sort_ips(ips: &mut [IpAddr]) {
    ips.sort_by(|a, b| match (a, b) {
        (IpAddr::V6(a6), IpAddr::V6(b6)) => a6.octets().cmp(&b6.octets()),
        (IpAddr::V4(a4), IpAddr::V4(b4)) => a4.octets().cmp(&b4.octets()),
        (IpAddr::V6(_), IpAddr::V4(_)) => Ordering::Less,
        (IpAddr::V4(_), IpAddr::V6(_)) => Ordering::Greater,
    });
}

fn port_for_url(url: &Url) -> u16 {
    url.port_or_known_default().unwrap_or(80)
}

async fn send_with_pinning(
    url: &Url,
    ips: &[IpAddr],
    headers: &[(String, String)],
    cookie: Option<&str>,
    config: &ResolvedConfig,
    deadline: Instant,
) -> Result<reqwest::Response, ProxyError> {
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::from_code(ErrorCode::InvalidUrl))?;
    let port = port_for_url(url);
    let max_attempts = config.max_dns_attempts as usize;
    let is_literal = !matches!(url.host(), Some(Host::Domain(_)));

    let mut first_error: Option<String> = None;
    let mut attempted = Vec::new();

    for ip in ips.iter().take(max_attempts) {
        attempted.push(ip.to_string());
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timeout_error("request", config));
        }

        let client = build_client(config, host, *ip, port, !is_literal)?;
        let mut request = client.get(url.clone());

        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                request = request.header(name, value);
            }
        }
        if let Some(cookie) = cookie
            && let Ok(value) = HeaderValue::from_str(cookie)
        {
            request = request.header(COOKIE, value);
        }

        let response = match timeout(remaining, request.send()).await {
            Ok(res) => res,
            Err(_) => return Err(timeout_error("request", config)),
        };

        match response {
            Ok(resp) => return Ok(resp),
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err.to_string());
                }
                if err.is_timeout() {
                    return Err(timeout_error("request", config));
                }
            }
        }
    }

    Err(ProxyError::from_code(ErrorCode::Network)
        .with_detail("error", first_error.unwrap_or_else(|| "unknown".into()))
        .with_detail("attempted_ips", attempted.join(",")))
}

fn build_client(
    config: &ResolvedConfig,
    host: &str,
    ip: IpAddr,
    port: u16,
    pin_dns: bool,
) -> Result<reqwest::Client, ProxyError> {
    let mut builder = reqwest::Client::builder()
        .redirect(Policy::none())
        .user_agent(&config.user_agent);

    if !config.http.use_system_proxy {
        builder = builder.no_proxy();
    }

    if let TimeoutSetting::Enabled(timeout) = config.http.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }

    if pin_dns {
        builder = builder.resolve(host, SocketAddr::new(ip, port));
    }

    builder.build().map_err(|e| {
        ProxyError::new(ErrorCode::Internal, format!("failed to build HTTP client: {e}"))
    })
}

fn too_large_error(size: u64, max_bytes: u64) -> ProxyError {
    ProxyError::from_code(ErrorCode::ResponseTooLarge)
        .with_detail("size", size.to_string())
        .with_detail("max_bytes", max_bytes.to_string())
}

fn timeout_error(phase: &'static str, config: &ResolvedConfig) -> ProxyError {
    let timeout_ms = config.timeout.as_millis() as u64;
    ProxyError::from_code(ErrorCode::Timeout)
        .with_detail("timeout_ms", timeout_ms.to_string())
        .with_detail("phase", phase)
}
