//! HTML rewriting for framed rendering.
//!
//! Two `lol_html` passes over the decoded document. The first only looks: it
//! records inline script bodies and whether `</head>` and `</body>` exist. The
//! second edits:
//!
//! - a `<base href="<origin>/">` as the first child of the first `head`
//! - `meta` anti-framing and content-policy directives removed
//! - inline scripts flagged by [`frame_bust`] removed (configurable)
//! - `href`/`src`/`srcset`/`action` made absolute (configurable)
//! - the patch script placed before `</head>`, else `</body>`, else at the
//!   very start of the document. A `</head>` with no opening tag still
//!   counts; the script goes in front of its literal text.

mod absolutize;
mod frame_bust;
mod patch;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use lol_html::html_content::{ContentType, Element, EndTag};
use lol_html::{HandlerResult, HtmlRewriter, Settings, element, text};
use url::Url;

use crate::resolved::ResolvedRewriteConfig;
use crate::types::{ErrorCode, ProxyError};

pub use absolutize::to_absolute;

/// What the read-only pass learned about the document.
#[derive(Debug, Default)]
struct DocumentScan {
    /// Positions (in document order among all `script` elements) to drop.
    frame_busters: HashSet<usize>,
    has_head_end: bool,
    /// A `</head>` end tag exists but no `head` element was opened.
    stray_head_end: bool,
    has_body_end: bool,
}

#[derive(Debug)]
struct ScriptScan {
    inline: bool,
    text: String,
}

/// Rewrite `html` so it renders inside a frame, using `document_url` as the
/// page's own address.
pub(crate) fn rewrite_document(
    html: &str,
    document_url: &Url,
    options: ResolvedRewriteConfig,
) -> Result<String, ProxyError> {
    let scan = scan_document(html).map_err(rewrite_error)?;
    let patch = patch::patch_script(document_url);

    let mut output = apply_edits(html, document_url, options, &scan, &patch)
        .map_err(rewrite_error)?;

    if !scan.has_head_end {
        let stray = if scan.stray_head_end {
            find_end_tag(&output, "head")
        } else {
            None
        };
        match stray {
            Some(at) => output.insert_str(at, &patch),
            None if scan.stray_head_end || !scan.has_body_end => output.insert_str(0, &patch),
            None => {}
        }
    }

    Ok(output)
}

fn scan_document(html: &str) -> Result<DocumentScan, lol_html::errors::RewritingError> {
    let scripts: RefCell<Vec<ScriptScan>> = RefCell::new(Vec::new());
    let head_end = Rc::new(Cell::new(false));
    let body_end = Rc::new(Cell::new(false));

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("script", |el| {
                    scripts.borrow_mut().push(ScriptScan {
                        inline: !el.has_attribute("src"),
                        text: String::new(),
                    });
                    Ok(())
                }),
                text!("script", |chunk| {
                    if let Some(last) = scripts.borrow_mut().last_mut() {
                        last.text.push_str(chunk.as_str());
                    }
                    Ok(())
                }),
                element!("head", |el| {
                    flag_end_tag(el, &head_end);
                    Ok(())
                }),
                element!("body", |el| {
                    flag_end_tag(el, &body_end);
                    Ok(())
                }),
            ],
            ..Settings::new()
        },
        |_: &[u8]| {},
    );
    rewriter.write(html.as_bytes())?;
    rewriter.end()?;

    let frame_busters = scripts
        .into_inner()
        .iter()
        .enumerate()
        .filter(|(_, script)| script.inline && frame_bust::looks_like_frame_buster(&script.text))
        .map(|(index, _)| index)
        .collect();

    Ok(DocumentScan {
        frame_busters,
        has_head_end: head_end.get(),
        stray_head_end: !head_end.get() && find_end_tag(html, "head").is_some(),
        has_body_end: body_end.get(),
    })
}

/// Byte offset of the first `</name` end tag, ignoring ASCII case. `</header>`
/// does not match `head`.
fn find_end_tag(html: &str, name: &str) -> Option<usize> {
    let bytes = html.as_bytes();
    let name = name.as_bytes();
    html.match_indices("</").map(|(at, _)| at).find(|&at| {
        let start = at + 2;
        let end = start + name.len();
        bytes
            .get(start..end)
            .is_some_and(|candidate| candidate.eq_ignore_ascii_case(name))
            && bytes
                .get(end)
                .is_some_and(|&next| next == b'>' || next == b'/' || next.is_ascii_whitespace())
    })
}

fn flag_end_tag(el: &mut Element<'_, '_>, flag: &Rc<Cell<bool>>) {
    if let Some(handlers) = el.end_tag_handlers() {
        let flag = Rc::clone(flag);
        handlers.push(Box::new(move |_: &mut EndTag<'_>| -> HandlerResult {
            flag.set(true);
            Ok(())
        }));
    }
}

fn apply_edits(
    html: &str,
    document_url: &Url,
    options: ResolvedRewriteConfig,
    scan: &DocumentScan,
    patch: &str,
) -> Result<String, lol_html::errors::RewritingError> {
    let base_tag = format!(
        "<base href=\"{}/\">",
        escape_attribute(&document_url.origin().ascii_serialization())
    );
    let base_inserted = Cell::new(false);
    let script_index = Cell::new(0usize);
    let injected = Rc::new(Cell::new(false));

    let mut handlers = vec![
        element!("head", |el| {
            if !base_inserted.replace(true) {
                el.prepend(&base_tag, ContentType::Html);
            }
            Ok(())
        }),
        element!("meta[http-equiv]", |el| {
            if el
                .get_attribute("http-equiv")
                .is_some_and(|value| is_blocking_directive(&value))
            {
                el.remove();
            }
            Ok(())
        }),
    ];

    if options.strip_frame_busters {
        handlers.push(element!("script", |el| {
            let index = script_index.replace(script_index.get() + 1);
            if scan.frame_busters.contains(&index) {
                tracing::info!(
                    script_index = index,
                    url = %document_url,
                    "Removed inline script that looks like a frame buster (heuristic, may over- or under-match)"
                );
                el.remove();
            }
            Ok(())
        }));
    }

    if options.absolutize_attributes {
        handlers.push(element!("a[href], link[href]", |el| {
            if let Some(value) = el.get_attribute("href")
                && let Some(rewritten) = absolutize::rewrite_href(&value, document_url)
            {
                el.set_attribute("href", &rewritten)?;
            }
            Ok(())
        }));
        handlers.push(element!("[src]", |el| {
            if let Some(value) = el.get_attribute("src")
                && let Some(rewritten) = absolutize::rewrite_src(&value, document_url)
            {
                el.set_attribute("src", &rewritten)?;
            }
            Ok(())
        }));
        handlers.push(element!("[srcset]", |el| {
            if let Some(value) = el.get_attribute("srcset")
                && let Some(rewritten) = absolutize::rewrite_srcset(&value, document_url)
            {
                el.set_attribute("srcset", &rewritten)?;
            }
            Ok(())
        }));
        handlers.push(element!("form[action]", |el| {
            if let Some(value) = el.get_attribute("action")
                && let Some(rewritten) = absolutize::rewrite_action(&value, document_url)
            {
                el.set_attribute("action", &rewritten)?;
            }
            Ok(())
        }));
    }

    let injection_point = if scan.has_head_end {
        Some("head")
    } else if scan.stray_head_end {
        None
    } else if scan.has_body_end {
        Some("body")
    } else {
        None
    };
    if let Some(selector) = injection_point {
        handlers.push(element!(selector, |el: &mut Element<'_, '_>| {
            if let Some(end_handlers) = el.end_tag_handlers() {
                let injected = Rc::clone(&injected);
                let patch = patch.to_string();
                end_handlers.push(Box::new(move |end: &mut EndTag<'_>| -> HandlerResult {
                    if !injected.replace(true) {
                        end.before(&patch, ContentType::Html);
                    }
                    Ok(())
                }));
            }
            Ok(())
        }));
    }

    let mut output = Vec::with_capacity(html.len() + patch.len() + base_tag.len());
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::new()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );
    rewriter.write(html.as_bytes())?;
    rewriter.end()?;

    Ok(String::from_utf8(output)
        .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned()))
}

/// `X-Frame-Options`, or anything starting with `Content-Security-Policy`.
fn is_blocking_directive(http_equiv: &str) -> bool {
    let value = http_equiv.trim().to_ascii_lowercase();
    value == "x-frame-options" || value.starts_with("content-security-policy")
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

fn rewrite_error(err: lol_html::errors::RewritingError) -> ProxyError {
    ProxyError::from_code(ErrorCode::Internal)
        .with_detail("stage", "rewrite")
        .with_detail("error", err.to_string())
}

#[cfg(test)]
mod tests {
    use scraper::{Html, Selector};
    use url::Url;

    use super::{find_end_tag, rewrite_document};
    use crate::resolved::ResolvedRewriteConfig;

    const ALL_ON: ResolvedRewriteConfig = ResolvedRewriteConfig {
        strip_frame_busters: true,
        absolutize_attributes: true,
    };

    fn page_url() -> Url {
        Url::parse("https://example.com/page").expect("url")
    }

    fn rewrite(html: &str) -> String {
        rewrite_document(html, &page_url(), ALL_ON).expect("rewrite")
    }

    fn select_attr(doc: &Html, selector: &str, attr: &str) -> Vec<String> {
        let selector = Selector::parse(selector).expect("selector");
        doc.select(&selector)
            .filter_map(|el| el.value().attr(attr).map(str::to_string))
            .collect()
    }

    #[test]
    fn anti_framing_meta_tags_are_removed() {
        let out = rewrite(
            r#"<html><head>
<meta http-equiv="X-Frame-Options" content="DENY">
<meta http-equiv="content-security-policy" content="frame-ancestors 'none'">
<meta http-equiv="Content-Security-Policy-Report-Only" content="default-src 'self'">
<meta http-equiv="refresh" content="30">
<meta charset="utf-8">
</head><body></body></html>"#,
        );
        let doc = Html::parse_document(&out);
        assert_eq!(
            select_attr(&doc, "meta[http-equiv]", "http-equiv"),
            vec!["refresh".to_string()]
        );
        assert_eq!(select_attr(&doc, "meta[charset]", "charset").len(), 1);
    }

    #[test]
    fn base_is_first_child_of_first_head_only() {
        let out = rewrite("<html><HEAD><title>t</title></HEAD><body><head></head></body></html>");
        assert!(out.contains("<HEAD><base href=\"https://example.com/\"><title>"));
        assert_eq!(out.matches("<base ").count(), 1);
    }

    #[test]
    fn no_head_means_no_base() {
        let out = rewrite("<body><p>hi</p></body>");
        assert!(!out.contains("<base"));
    }

    #[test]
    fn relative_image_becomes_absolute_and_fragments_stay() {
        let out = rewrite(
            "<html><head></head><body><img src=\"/a.png\"><a href=\"#top\">up</a>\
             <a href=\"next\">n</a><img srcset=\"/s.png 1x, /l.png 2x\">\
             <form action=\"/search\"></form><form action=\"javascript:void(0)\"></form></body></html>",
        );
        let doc = Html::parse_document(&out);
        assert_eq!(
            select_attr(&doc, "img[src]", "src"),
            vec!["https://example.com/a.png".to_string()]
        );
        assert_eq!(
            select_attr(&doc, "a", "href"),
            vec!["#top".to_string(), "https://example.com/next".to_string()]
        );
        assert_eq!(
            select_attr(&doc, "img[srcset]", "srcset"),
            vec!["https://example.com/s.png 1x, https://example.com/l.png 2x".to_string()]
        );
        assert_eq!(
            select_attr(&doc, "form", "action"),
            vec![
                "https://example.com/search".to_string(),
                "javascript:void(0)".to_string()
            ]
        );
    }

    #[test]
    fn absolutization_can_be_disabled() {
        let out = rewrite_document(
            "<html><head></head><body><img src=\"/a.png\"></body></html>",
            &page_url(),
            ResolvedRewriteConfig {
                absolutize_attributes: false,
                ..ALL_ON
            },
        )
        .expect("rewrite");
        assert!(out.contains("<img src=\"/a.png\">"));
    }

    #[test]
    fn frame_buster_scripts_are_removed_others_kept() {
        let html = "<html><head>\
            <script>if (top != self) { top.location = self.location; }</script>\
            <script src=\"/app.js\"></script>\
            <script>window.answer = 42;</script>\
            </head><body></body></html>";
        let out = rewrite(html);
        assert!(!out.contains("top.location"));
        assert!(out.contains("window.answer = 42;"));
        assert!(out.contains("https://example.com/app.js"));
    }

    #[test]
    fn frame_buster_stripping_can_be_disabled() {
        let html = "<html><head><script>if (top != self) top.location = self.location;</script></head></html>";
        let out = rewrite_document(
            html,
            &page_url(),
            ResolvedRewriteConfig {
                strip_frame_busters: false,
                ..ALL_ON
            },
        )
        .expect("rewrite");
        assert!(out.contains("top.location = self.location"));
    }

    #[test]
    fn patch_goes_before_closing_head() {
        let out = rewrite("<html><head><title>x</title></head><body>b</body></html>");
        let patch_at = out.find("<script>").expect("patch injected");
        assert!(patch_at > out.find("<title>").expect("title"));
        assert!(out[patch_at..].find("</script></head>").is_some());
        assert_eq!(out.matches("MutationObserver").count(), 1);
    }

    #[test]
    fn patch_falls_back_to_closing_body() {
        let out = rewrite("<body><p>text</p></body>");
        assert!(out.contains("</script></body>"));
        assert!(out.starts_with("<body><p>text</p>"));
    }

    #[test]
    fn patch_is_prepended_without_head_or_body() {
        let out = rewrite("<p>fragment</p>");
        assert!(out.starts_with("<script>"));
        assert!(out.ends_with("<p>fragment</p>"));
    }

    #[test]
    fn patch_embeds_document_url() {
        let out = rewrite("<html><head></head></html>");
        assert!(out.contains("var targetUrl = \"https://example.com/page\";"));
    }

    #[test]
    fn patch_goes_before_stray_closing_head() {
        let out = rewrite("<title>t</title></head><body><p>b</p></body>");
        let patch_at = out.find("<script>").expect("patch injected");
        assert!(patch_at > out.find("<title>").expect("title"));
        assert!(out.contains("</script></head><body>"));
        assert!(out.ends_with("<p>b</p></body>"));
        assert_eq!(out.matches("MutationObserver").count(), 1);
    }

    #[test]
    fn end_tag_search_matches_whole_names() {
        assert_eq!(find_end_tag("<header></header></HEAD >", "head"), Some(17));
        assert_eq!(find_end_tag("<p></header>", "head"), None);
        assert_eq!(find_end_tag("</head", "head"), None);
    }
}
