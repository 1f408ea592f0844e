//! Cookie scoping between the caller and upstream targets.
//!
//! In `per_origin` mode every upstream cookie name carries a tag derived from
//! the origin that set it, so one browser cookie jar can hold cookies for many
//! targets without sending them to the wrong one. Tags are chosen per hop, so
//! a redirect to another origin gets that origin's cookies and nothing else.
//!
//! In `passthrough` mode the caller's header is only sent to hops on the
//! requested target's host, and only cookies set by hops on the final host are
//! mirrored back.

use sha2::{Digest, Sha256};
use url::Url;

use crate::types::CookieMode;

const TAG_PREFIX: &str = "__uf_";
const TAG_HEX_LEN: usize = 12;

/// Raw `Set-Cookie` values from one upstream response.
#[derive(Debug)]
pub(crate) struct HopCookies {
    pub url: Url,
    pub values: Vec<String>,
}

/// Cookie header to send to `hop` while fetching `target`.
pub(crate) fn outgoing(
    mode: CookieMode,
    header: Option<&str>,
    target: &Url,
    hop: &Url,
) -> Option<String> {
    let header = header?;
    match mode {
        CookieMode::Passthrough => same_host(target, hop).then(|| header.to_string()),
        CookieMode::PerOrigin => {
            let tag = origin_tag(hop);
            let pairs: Vec<&str> = header
                .split(';')
                .map(str::trim)
                .filter_map(|pair| pair.strip_prefix(tag.as_str()))
                .filter(|pair| !pair.is_empty())
                .collect();
            (!pairs.is_empty()).then(|| pairs.join("; "))
        }
    }
}

/// `Set-Cookie` values to mirror back to the caller once the fetch settled on
/// `final_url`. `hops` is in request order.
pub(crate) fn incoming(mode: CookieMode, hops: Vec<HopCookies>, final_url: &Url) -> Vec<String> {
    match mode {
        CookieMode::Passthrough => hops
            .into_iter()
            .filter(|hop| same_host(&hop.url, final_url))
            .flat_map(|hop| hop.values)
            .collect(),
        CookieMode::PerOrigin => hops
            .iter()
            .flat_map(|hop| {
                let tag = origin_tag(&hop.url);
                hop.values
                    .iter()
                    .filter_map(move |value| scope_set_cookie(value, &tag))
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

/// Scheme and port may differ; an `http` to `https` upgrade stays on the host.
fn same_host(a: &Url, b: &Url) -> bool {
    a.host_str()
        .zip(b.host_str())
        .is_some_and(|(a, b)| a.eq_ignore_ascii_case(b))
}

/// `__uf_<12 hex of sha256(origin)>_`.
pub(crate) fn origin_tag(url: &Url) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.origin().ascii_serialization().as_bytes());
    let digest = hex_encode(&hasher.finalize());
    format!("{TAG_PREFIX}{}_", &digest[..TAG_HEX_LEN])
}

/// Rename the cookie and replace `Domain`/`Path` with `Path=/`.
fn scope_set_cookie(value: &str, tag: &str) -> Option<String> {
    let mut parts = value.split(';');
    let pair = parts.next()?.trim();
    let (name, cookie_value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut scoped = format!("{tag}{name}={}", cookie_value.trim());
    for attribute in parts.map(str::trim).filter(|a| !a.is_empty()) {
        let key = attribute
            .split_once('=')
            .map_or(attribute, |(k, _)| k)
            .trim();
        if key.eq_ignore_ascii_case("domain") || key.eq_ignore_ascii_case("path") {
            continue;
        }
        scoped.push_str("; ");
        scoped.push_str(attribute);
    }
    scoped.push_str("; Path=/");
    Some(scoped)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::{HopCookies, incoming, origin_tag, outgoing};
    use crate::types::CookieMode;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("url")
    }

    fn hop(u: &str, values: &[&str]) -> HopCookies {
        HopCookies {
            url: url(u),
            values: values.iter().map(|v| (*v).to_string()).collect(),
        }
    }

    #[test]
    fn passthrough_is_verbatim() {
        let target = url("https://a.example/");
        assert_eq!(
            outgoing(
                CookieMode::Passthrough,
                Some("sid=1; theme=dark"),
                &target,
                &target
            )
            .as_deref(),
            Some("sid=1; theme=dark")
        );
        let set = "sid=2; Domain=a.example; Path=/app; HttpOnly";
        assert_eq!(
            incoming(
                CookieMode::Passthrough,
                vec![hop("https://a.example/", &[set])],
                &target
            ),
            vec![set.to_string()]
        );
    }

    #[test]
    fn passthrough_follows_scheme_upgrade_but_not_other_hosts() {
        let target = url("http://a.example/");
        let header = Some("sid=1");
        assert_eq!(
            outgoing(
                CookieMode::Passthrough,
                header,
                &target,
                &url("https://A.example:8443/home")
            )
            .as_deref(),
            Some("sid=1")
        );
        assert_eq!(
            outgoing(
                CookieMode::Passthrough,
                header,
                &target,
                &url("https://www.a.example/")
            ),
            None
        );
    }

    #[test]
    fn passthrough_mirrors_only_final_host_cookies() {
        let hops = vec![
            hop("http://a.example/", &["consent=yes"]),
            hop("https://tracker.example/bounce", &["track=1"]),
            hop("https://a.example/home", &["sid=2"]),
        ];
        assert_eq!(
            incoming(CookieMode::Passthrough, hops, &url("https://a.example/home")),
            vec!["consent=yes".to_string(), "sid=2".to_string()]
        );
    }

    #[test]
    fn tag_depends_only_on_origin() {
        let tag = origin_tag(&url("https://a.example/x?y=1"));
        assert_eq!(tag, origin_tag(&url("https://a.example/other")));
        assert_ne!(tag, origin_tag(&url("https://b.example/")));
        assert_ne!(tag, origin_tag(&url("http://a.example/")));
        assert!(tag.starts_with("__uf_"));
        assert_eq!(tag.len(), "__uf_".len() + 12 + 1);
    }

    #[test]
    fn per_origin_renames_and_rescopes() {
        let source = url("https://a.example/login");
        let tag = origin_tag(&source);
        let scoped = incoming(
            CookieMode::PerOrigin,
            vec![hop(
                "https://a.example/login",
                &["sid=abc; Domain=.a.example; path=/app; Secure; HttpOnly"],
            )],
            &source,
        );
        assert_eq!(scoped, vec![format!("{tag}sid=abc; Secure; HttpOnly; Path=/")]);
    }

    #[test]
    fn per_origin_tags_each_hop_with_its_own_origin() {
        let first = url("http://a.example/");
        let landing = url("https://www.a.example/home");
        let scoped = incoming(
            CookieMode::PerOrigin,
            vec![
                hop("http://a.example/", &["consent=yes"]),
                hop("https://www.a.example/home", &["sid=s1"]),
            ],
            &landing,
        );
        assert_eq!(
            scoped,
            vec![
                format!("{}consent=yes; Path=/", origin_tag(&first)),
                format!("{}sid=s1; Path=/", origin_tag(&landing)),
            ]
        );
    }

    #[test]
    fn per_origin_forwards_only_matching_cookies() {
        let a = url("https://a.example/");
        let b = url("https://b.example/");
        let header = format!(
            "{}sid=a1; {}sid=b1; unrelated=1",
            origin_tag(&a),
            origin_tag(&b)
        );
        assert_eq!(
            outgoing(CookieMode::PerOrigin, Some(&header), &a, &a).as_deref(),
            Some("sid=a1")
        );
        assert_eq!(
            outgoing(CookieMode::PerOrigin, Some(&header), &b, &b).as_deref(),
            Some("sid=b1")
        );
        assert_eq!(
            outgoing(CookieMode::PerOrigin, Some("unrelated=1"), &a, &a),
            None
        );
    }

    #[test]
    fn per_origin_picks_the_hop_tag_after_a_redirect() {
        let target = url("https://a.example/");
        let landing = url("https://b.example/land");
        let header = format!("{}sid=s1", origin_tag(&landing));
        assert_eq!(
            outgoing(CookieMode::PerOrigin, Some(&header), &target, &target),
            None
        );
        assert_eq!(
            outgoing(CookieMode::PerOrigin, Some(&header), &target, &landing).as_deref(),
            Some("sid=s1")
        );
    }

    #[test]
    fn malformed_set_cookie_is_dropped_in_per_origin_mode() {
        let source = url("https://a.example/");
        assert!(
            incoming(
                CookieMode::PerOrigin,
                vec![hop("https://a.example/", &["novalue"])],
                &source
            )
            .is_empty()
        );
    }
}
