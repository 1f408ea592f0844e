//! Content classification and body decoding.

/// How the packaged body is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentKind {
    /// Goes through the HTML rewriter.
    Html,
    /// Returned unmodified.
    Passthrough,
}

impl ContentKind {
    /// `text/html` anywhere in the header, ignoring case, selects the rewriter.
    pub(crate) fn from_content_type(header: Option<&str>) -> Self {
        let is_html =
            header.is_some_and(|value| value.to_ascii_lowercase().contains("text/html"));
        if is_html {
            ContentKind::Html
        } else {
            ContentKind::Passthrough
        }
    }
}

/// Extract the `charset` parameter of a content-type header.
pub(crate) fn charset_param(header: Option<&str>) -> Option<String> {
    let header = header?;
    header.split(';').skip(1).find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn is_utf8_label(charset: &str) -> bool {
    matches!(
        charset.trim().to_ascii_lowercase().as_str(),
        "utf-8" | "utf8" | "utf_8" | "unicode-1-1-utf-8"
    )
}

/// Decode the upstream body as text.
///
/// UTF-8 input round-trips exactly. Other declared charsets and invalid
/// sequences fall back to lossy UTF-8.
pub(crate) fn decode_body(body: Vec<u8>, content_type: Option<&str>) -> String {
    if let Some(charset) = charset_param(content_type)
        && !is_utf8_label(&charset)
    {
        tracing::warn!(
            "charset {} not fully supported, using UTF-8 fallback",
            charset
        );
    }

    match String::from_utf8(body) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!("invalid UTF-8 in response body, decoding lossily");
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
    }
}
