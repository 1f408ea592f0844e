//! Client-side patch script.

use url::Url;

const PATCH_SOURCE: &str = include_str!("patch.js");
const TARGET_PLACEHOLDER: &str = "__UNFRAME_TARGET_URL__";

/// The `<script>` element injected into rewritten documents.
///
/// The target URL is embedded as a JSON string with every `<` escaped, so it
/// cannot close the element early.
pub(crate) fn patch_script(target: &Url) -> String {
    let literal = js_string_literal(target.as_str());
    format!(
        "<script>{}</script>",
        PATCH_SOURCE.replace(TARGET_PLACEHOLDER, &literal)
    )
}

fn js_string_literal(value: &str) -> String {
    // serde_json only fails on non-string map keys.
    let json = serde_json::to_string(value).unwrap_or_else(|_| String::from("\"\""));
    json.replace('<', "\\u003c")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}
