//! Request handlers.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use unframe_proxy::{ProxyRequest, ProxyResponse};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Empty `200` for `OPTIONS`. The CORS layer normally answers these first.
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}

/// `POST <route>` with `{ "url": ... }`.
pub async fn web_proxy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    let body = body?;
    let payload: Value = serde_json::from_slice(&body).map_err(|_| AppError::InvalidBody)?;
    let Value::Object(fields) = payload else {
        return Err(AppError::InvalidBody);
    };

    let request = ProxyRequest::new(target_url(fields.get("url")))
        .with_cookies(cookie_header(&headers));
    let response = state.proxy.handle(request).await;
    tracing::debug!(
        status = response.status(),
        success = response.is_success(),
        cookies = response.set_cookies().len(),
        "Proxy request finished"
    );
    Ok(envelope_response(&response))
}

/// Falsy values mean "no URL"; other non-strings are stringified and fail
/// URL parsing downstream.
fn target_url(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null | Value::Bool(false)) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) if n.as_f64().is_some_and(|f| f.abs() < f64::EPSILON) => {
            String::new()
        }
        Some(other) => other.to_string(),
    }
}

fn cookie_header(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    (!values.is_empty()).then(|| values.join("; "))
}

fn envelope_response(envelope: &ProxyResponse) -> Response {
    let status =
        StatusCode::from_u16(envelope.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(envelope.to_json())).into_response();
    for value in envelope.set_cookies() {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(_) => tracing::warn!("Dropping upstream Set-Cookie with invalid header bytes"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use axum::http::header::{COOKIE, SET_COOKIE};
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use serde_json::{Value, json};
    use unframe_proxy::ProxyResponse;

    use super::{cookie_header, envelope_response, target_url};

    #[test]
    fn falsy_urls_are_missing() {
        assert_eq!(target_url(None), "");
        assert_eq!(target_url(Some(&Value::Null)), "");
        assert_eq!(target_url(Some(&json!(false))), "");
        assert_eq!(target_url(Some(&json!(0))), "");
        assert_eq!(target_url(Some(&json!(""))), "");
    }

    #[test]
    fn non_string_urls_are_stringified() {
        assert_eq!(target_url(Some(&json!(42))), "42");
        assert_eq!(target_url(Some(&json!(true))), "true");
        assert_eq!(
            target_url(Some(&json!("https://example.com"))),
            "https://example.com"
        );
    }

    #[test]
    fn repeated_cookie_headers_are_joined() {
        let mut headers = HeaderMap::new();
        assert_eq!(cookie_header(&headers), None);
        headers.append(COOKIE, HeaderValue::from_static("a=1"));
        headers.append(COOKIE, HeaderValue::from_static("b=2"));
        assert_eq!(cookie_header(&headers).as_deref(), Some("a=1; b=2"));
    }

    #[test]
    fn set_cookie_headers_are_appended() {
        let response = envelope_response(&ProxyResponse::Success {
            body: String::new(),
            content_was_html: false,
            set_cookies: vec!["a=1".into(), "b=2; Path=/".into()],
        });
        assert_eq!(response.status(), StatusCode::OK);
        let values: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(values.len(), 2);
    }
}
