//! Request validation and SSRF protection.
//!
//! A target is checked in a fixed order: presence, syntax, scheme, the static
//! hostname block list, and finally (for IP literals) the blocked CIDR table.
//! The same check runs on the initial target and on every redirect hop.
use std::net::IpAddr;

use url::{Host, Url};

use crate::resolved::ResolvedSecurityConfig;
use crate::types::{ErrorCode, ProxyError};

/// A hostname pattern from the static block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRule {
    /// Whole-host match.
    Exact(&'static str),
    /// Leading-text match on the host.
    Prefix(&'static str),
    /// IPv4 dotted host whose first octet is `first` and second octet is in `low..=high`.
    SecondOctet { first: u8, low: u8, high: u8 },
}

impl BlockRule {
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        match *self {
            BlockRule::Exact(name) => host == name,
            BlockRule::Prefix(prefix) => host.starts_with(prefix),
            BlockRule::SecondOctet { first, low, high } => {
                let mut octets = host.split('.');
                let (Some(a), Some(b)) = (octets.next(), octets.next()) else {
                    return false;
                };
                octets.next().is_some()
                    && a.parse::<u8>().is_ok_and(|a| a == first)
                    && b.parse::<u8>().is_ok_and(|b| (low..=high).contains(&b))
            }
        }
    }

    fn is_loopback(&self) -> bool {
        matches!(
            self,
            BlockRule::Exact("localhost" | "::1") | BlockRule::Prefix("127.")
        )
    }
}

/// Hostname block list, checked in order against the lower-cased host.
pub static BLOCK_RULES: &[BlockRule] = &[
    BlockRule::Exact("localhost"),
    BlockRule::Prefix("127."),
    BlockRule::Prefix("10."),
    BlockRule::SecondOctet {
        first: 172,
        low: 16,
        high: 31,
    },
    BlockRule::Prefix("192.168."),
    // Cloud metadata endpoints live here.
    BlockRule::Prefix("169.254."),
    BlockRule::Prefix("0."),
    BlockRule::Exact("::1"),
    BlockRule::Prefix("fe80:"),
    BlockRule::Prefix("fc00:"),
];

/// Default blocked CIDR ranges, applied to IP literals and resolved addresses.
pub const DEFAULT_BLOCKED_CIDRS: &[&str] = &[
    // IPv4
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "0.0.0.0/8",
    "100.64.0.0/10",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    // IPv6
    "::1/128",
    "::/128",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
    "2001:db8::/32",
];

#[derive(Debug, Clone)]
pub(crate) struct Cidr {
    network: IpAddr,
    prefix: u8,
    text: String,
}

/// Validate a raw target string and return the parsed URL.
pub(crate) fn validate_target(
    raw_url: &str,
    security: &ResolvedSecurityConfig,
) -> Result<Url, ProxyError> {
    let raw = raw_url.trim();
    if raw.is_empty() {
        return Err(ProxyError::from_code(ErrorCode::MissingUrl));
    }

    let url = Url::parse(raw).map_err(|e| {
        ProxyError::from_code(ErrorCode::InvalidUrl)
            .with_detail("url", raw)
            .with_detail("error", e.to_string())
    })?;

    validate_url(&url, security)?;
    Ok(url)
}

/// Scheme, block-list and CIDR checks on an already-parsed URL.
pub(crate) fn validate_url(url: &Url, security: &ResolvedSecurityConfig) -> Result<(), ProxyError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(
                ProxyError::from_code(ErrorCode::InvalidProtocol).with_detail("scheme", scheme)
            );
        }
    }

    let Some(host) = url.host() else {
        return Err(ProxyError::from_code(ErrorCode::InvalidUrl).with_detail("url", url.as_str()));
    };

    let host_text = normalized_host(&host);
    if let Some(rule) = matching_rule(&host_text, security) {
        return Err(ProxyError::from_code(ErrorCode::Blocked)
            .with_detail("host", host_text)
            .with_detail("rule", format!("{rule:?}")));
    }

    let literal = match host {
        Host::Ipv4(ip) => Some(IpAddr::V4(ip)),
        Host::Ipv6(ip) => Some(IpAddr::V6(ip)),
        Host::Domain(_) => None,
    };
    if let Some(ip) = literal
        && let Some(cidr) = check_ip_blocked(ip, security)
    {
        return Err(blocked_ip_error(ip, &cidr));
    }

    Ok(())
}

/// Lower-cased host without IPv6 brackets.
fn normalized_host(host: &Host<&str>) -> String {
    match host {
        Host::Domain(name) => name.to_ascii_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    }
}

fn matching_rule(host: &str, security: &ResolvedSecurityConfig) -> Option<BlockRule> {
    BLOCK_RULES
        .iter()
        .filter(|rule| !(security.allow_loopback && rule.is_loopback()))
        .find(|rule| rule.matches(host))
        .copied()
}

pub(crate) fn blocked_ip_error(ip: IpAddr, cidr: &str) -> ProxyError {
    ProxyError::from_code(ErrorCode::Blocked)
        .with_detail("blocked_ip", ip.to_string())
        .with_detail("cidr", cidr)
}

pub(crate) fn parse_cidr(text: &str) -> Option<Cidr> {
    let (addr, prefix) = text.split_once('/')?;
    let network = addr.parse::<IpAddr>().ok()?;
    let prefix = prefix.parse::<u8>().ok()?;
    match network {
        IpAddr::V4(_) if prefix > 32 => return None,
        IpAddr::V6(_) if prefix > 128 => return None,
        _ => {}
    }
    Some(Cidr {
        network,
        prefix,
        text: text.to_string(),
    })
}

fn ip_in_cidr(ip: IpAddr, cidr: &Cidr) -> bool {
    match (ip, cidr.network) {
        (IpAddr::V4(ipv4), IpAddr::V4(net)) => {
            prefix_match(&ipv4.octets(), &net.octets(), cidr.prefix)
        }
        (IpAddr::V6(ipv6), IpAddr::V6(net)) => {
            prefix_match(&ipv6.octets(), &net.octets(), cidr.prefix)
        }
        _ => false,
    }
}

fn prefix_match(ip: &[u8], net: &[u8], prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let full = (prefix / 8) as usize;
    let rem = prefix % 8;

    if ip.len() < full || net.len() < full {
        return false;
    }

    if ip[..full] != net[..full] {
        return false;
    }

    if rem == 0 {
        return true;
    }

    let mask = 0xFFu8 << (8 - rem);
    ip[full] & mask == net[full] & mask
}

fn is_loopback_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

/// Returns the text of the first blocked CIDR containing `ip`.
pub(crate) fn check_ip_blocked(ip: IpAddr, security: &ResolvedSecurityConfig) -> Option<String> {
    if security.allow_loopback && is_loopback_ip(ip) {
        return None;
    }

    let cidrs: Vec<Cidr> = DEFAULT_BLOCKED_CIDRS
        .iter()
        .filter_map(|entry| parse_cidr(entry))
        .chain(security.extra_blocked_cidrs.iter().cloned())
        .collect();

    // IPv4-mapped IPv6 (::ffff:a.b.c.d) is checked against the IPv4 table.
    if let IpAddr::V6(v6) = ip
        && let Some(v4) = v6.to_ipv4_mapped()
    {
        let mapped = IpAddr::V4(v4);
        if let Some(cidr) = cidrs.iter().find(|c| ip_in_cidr(mapped, c)) {
            return Some(cidr.text.clone());
        }
    }

    cidrs
        .iter()
        .find(|c| ip_in_cidr(ip, c))
        .map(|c| c.text.clone())
}
