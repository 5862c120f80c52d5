//! Media API Router
//!
//! Parses incoming requests into API routes.

use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use thiserror::Error;

/// Prefix shared by all JSON API routes
pub const API_PREFIX: &str = "/api/";

/// Router errors
#[derive(Error, Debug, PartialEq)]
pub enum RouterError {
    #[error("Route not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

/// API routes
#[derive(Debug, Clone, PartialEq)]
pub enum ApiRoute {
    /// POST /api/media/upload
    SingleShotUpload,
    /// DELETE /api/media/upload?key=K
    DeleteObject { key: String },
    /// POST /api/media/initMultipart
    InitMultipart,
    /// POST /api/media/uploadPart
    UploadPart,
    /// POST /api/media/acknowledgePart
    AcknowledgePart,
    /// POST /api/media/completeMultipart
    CompleteMultipart,
    /// POST /api/media/abortMultipart
    AbortMultipart,
    /// POST /api/media/status
    SessionStatus,
    /// POST /api/media/download
    Download,
    /// GET /health
    Health,
    /// GET /metrics
    Metrics,
}

/// API Request Parser
pub struct ApiRequestParser;

impl ApiRequestParser {
    /// Parse an HTTP request into an API route
    pub fn parse(method: &str, path: &str, query: Option<&str>) -> Result<ApiRoute, RouterError> {
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };

        let (route, allowed): (Option<ApiRoute>, &[&str]) = match path {
            "/health" => (Self::only(method, "GET", ApiRoute::Health), &["GET"]),
            "/metrics" => (Self::only(method, "GET", ApiRoute::Metrics), &["GET"]),
            "/api/media/upload" => match method {
                "POST" => (Some(ApiRoute::SingleShotUpload), &[]),
                "DELETE" => {
                    let params = Self::parse_query(query);
                    let key = params
                        .get("key")
                        .filter(|k| !k.is_empty())
                        .cloned()
                        .ok_or_else(|| RouterError::InvalidQuery("missing key".into()))?;
                    (Some(ApiRoute::DeleteObject { key }), &[])
                }
                _ => (None, &["POST", "DELETE"]),
            },
            // `/api/uploadMultipart` is the older name of the init route
            "/api/media/initMultipart" | "/api/uploadMultipart" => {
                (Self::only(method, "POST", ApiRoute::InitMultipart), &["POST"])
            }
            "/api/media/uploadPart" => {
                (Self::only(method, "POST", ApiRoute::UploadPart), &["POST"])
            }
            "/api/media/acknowledgePart" => {
                (Self::only(method, "POST", ApiRoute::AcknowledgePart), &["POST"])
            }
            "/api/media/completeMultipart" => (
                Self::only(method, "POST", ApiRoute::CompleteMultipart),
                &["POST"],
            ),
            "/api/media/abortMultipart" => {
                (Self::only(method, "POST", ApiRoute::AbortMultipart), &["POST"])
            }
            "/api/media/status" => {
                (Self::only(method, "POST", ApiRoute::SessionStatus), &["POST"])
            }
            "/api/media/download" => (Self::only(method, "POST", ApiRoute::Download), &["POST"]),
            _ => return Err(RouterError::NotFound(path.to_string())),
        };

        route.ok_or_else(|| {
            RouterError::MethodNotAllowed(format!(
                "{} {} (allowed: {})",
                method,
                path,
                allowed.join(", ")
            ))
        })
    }

    /// Whether a request must carry a JSON content type
    pub fn requires_json(method: &str, path: &str) -> bool {
        path.starts_with(API_PREFIX)
            && matches!(method, "POST" | "PUT" | "PATCH" | "DELETE" | "GET")
    }

    fn only(method: &str, expected: &str, route: ApiRoute) -> Option<ApiRoute> {
        (method == expected).then_some(route)
    }

    fn parse_query(query: Option<&str>) -> HashMap<String, String> {
        let mut params = HashMap::new();
        if let Some(q) = query {
            for pair in q.split('&') {
                let mut kv = pair.splitn(2, '=');
                if let Some(key) = kv.next() {
                    let value = kv.next().unwrap_or("");
                    params.insert(decode(key), decode(value));
                }
            }
        }
        params
    }
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8_lossy().into_owned()
}
