//! Result envelopes returned to the caller.

use serde_json::{Value, json};

use crate::types::{ErrorClass, ErrorCode, ProxyError};

/// Outcome of one proxy call, ready to be serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyResponse {
    /// Upstream fetched; `body` is rewritten HTML or the raw payload.
    Success {
        body: String,
        content_was_html: bool,
        set_cookies: Vec<String>,
    },
    /// The target could not be loaded. Reported with a 200 transport status.
    UpstreamFailure { message: String },
    /// Bad input (400) or a blocked target (403).
    Rejected { status: u16, message: String },
    /// Something broke on our side.
    Internal { message: String },
}

impl ProxyResponse {
    /// Map a pipeline error to its envelope by error class.
    #[must_use]
    pub fn from_error(err: &ProxyError) -> Self {
        match err.class() {
            ErrorClass::Input => ProxyResponse::Rejected {
                status: 400,
                message: err.message.clone(),
            },
            ErrorClass::SecurityBlock => ProxyResponse::Rejected {
                status: 403,
                message: err.message.clone(),
            },
            ErrorClass::Upstream => ProxyResponse::UpstreamFailure {
                message: err.message.clone(),
            },
            ErrorClass::Internal => ProxyResponse::Internal {
                message: ErrorCode::Internal.public_message().to_string(),
            },
        }
    }

    /// Transport status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            ProxyResponse::Success { .. } | ProxyResponse::UpstreamFailure { .. } => 200,
            ProxyResponse::Rejected { status, .. } => *status,
            ProxyResponse::Internal { .. } => 500,
        }
    }

    /// True only for [`ProxyResponse::Success`]. A logical failure shares
    /// its 200 status but is not a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ProxyResponse::Success { .. })
    }

    /// `Set-Cookie` values to mirror on the transport response.
    #[must_use]
    pub fn set_cookies(&self) -> &[String] {
        match self {
            ProxyResponse::Success { set_cookies, .. } => set_cookies,
            _ => &[],
        }
    }

    /// JSON body.
    ///
    /// Success carries `html`, `success` and `cookies` (values joined with
    /// `", "`); a logical failure carries `error` and `success: false`;
    /// rejections and internal errors carry `error` only.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            ProxyResponse::Success {
                body, set_cookies, ..
            } => json!({
                "html": body,
                "success": true,
                "cookies": set_cookies.join(", "),
            }),
            ProxyResponse::UpstreamFailure { message } => json!({
                "error": message,
                "success": false,
            }),
            ProxyResponse::Rejected { message, .. } | ProxyResponse::Internal { message } => {
                json!({ "error": message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ProxyResponse;
    use crate::types::{ErrorCode, ProxyError};

    #[test]
    fn success_envelope_joins_cookies() {
        let response = ProxyResponse::Success {
            body: "<p>x</p>".into(),
            content_was_html: true,
            set_cookies: vec!["a=1; Path=/".into(), "b=2".into()],
        };
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.to_json(),
            json!({"html": "<p>x</p>", "success": true, "cookies": "a=1; Path=/, b=2"})
        );
        assert_eq!(response.set_cookies().len(), 2);
        assert!(response.is_success());
    }

    #[test]
    fn success_without_cookies_has_empty_string() {
        let response = ProxyResponse::Success {
            body: "{}".into(),
            content_was_html: false,
            set_cookies: Vec::new(),
        };
        assert_eq!(response.to_json()["cookies"], json!(""));
    }

    #[test]
    fn error_classes_pick_status_and_shape() {
        let blocked = ProxyResponse::from_error(&ProxyError::from_code(ErrorCode::Blocked));
        assert_eq!(blocked.status(), 403);
        assert_eq!(
            blocked.to_json(),
            json!({"error": "Blocked: Cannot access internal resources"})
        );

        let missing = ProxyResponse::from_error(&ProxyError::from_code(ErrorCode::MissingUrl));
        assert_eq!(missing.status(), 400);

        let timeout = ProxyResponse::from_error(&ProxyError::from_code(ErrorCode::Timeout));
        assert_eq!(timeout.status(), 200);
        assert_eq!(
            timeout.to_json(),
            json!({"error": "Failed to load page: request timed out", "success": false})
        );
        assert!(timeout.set_cookies().is_empty());
        assert!(!timeout.is_success());
        assert!(!blocked.is_success());
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = ProxyError::new(ErrorCode::Internal, "failed to build HTTP client: tls")
            .with_detail("error", "tls");
        let response = ProxyResponse::from_error(&err);
        assert_eq!(response.status(), 500);
        assert_eq!(response.to_json(), json!({"error": "Internal error"}));
    }
}
