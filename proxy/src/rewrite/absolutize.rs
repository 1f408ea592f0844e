//! Reference absolutization against the document URL.
//!
//! The injected patch script applies the same rule in the browser, so the
//! served markup and the live DOM agree.

use url::Url;

const OPAQUE_SCHEMES: &[&str] = &["data:", "blob:", "javascript:"];

pub(super) fn has_opaque_scheme(reference: &str) -> bool {
    let trimmed = reference.trim_start();
    OPAQUE_SCHEMES.iter().any(|scheme| {
        trimmed
            .get(..scheme.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
    })
}

/// Resolve `reference` against `base`.
///
/// Empty, `data:`, `blob:` and `javascript:` references come back unchanged,
/// as does anything that fails to join.
pub fn to_absolute(reference: &str, base: &Url) -> String {
    if reference.is_empty() || has_opaque_scheme(reference) {
        return reference.to_string();
    }
    match base.join(reference) {
        Ok(url) => url.into(),
        Err(_) => reference.to_string(),
    }
}

/// `href` on `a`/`link`. Fragment-only and `javascript:` values are kept.
pub(crate) fn rewrite_href(value: &str, base: &Url) -> Option<String> {
    if value.starts_with('#') {
        return None;
    }
    changed(value, to_absolute(value, base))
}

/// `action` on `form`.
pub(crate) fn rewrite_action(value: &str, base: &Url) -> Option<String> {
    changed(value, to_absolute(value, base))
}

/// `src` on any element.
pub(crate) fn rewrite_src(value: &str, base: &Url) -> Option<String> {
    changed(value, to_absolute(value, base))
}

/// Every candidate URL in a `srcset`, descriptors preserved.
pub(crate) fn rewrite_srcset(value: &str, base: &Url) -> Option<String> {
    let rewritten = value
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut parts = segment.split_whitespace();
            let url = parts.next().map(|u| to_absolute(u, base)).unwrap_or_default();
            std::iter::once(url)
                .chain(parts.map(str::to_string))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(", ");
    changed(value, rewritten)
}

fn changed(original: &str, rewritten: String) -> Option<String> {
    (rewritten != original).then_some(rewritten)
}
