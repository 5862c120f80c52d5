//! API request handlers
//!
//! JSON in, JSON out. [`handle`] takes the already-collected request parts
//! so that handlers can be exercised without a socket.

use crate::error::{ErrorKind, MediaError};
use crate::metrics;
use crate::router::{ApiRequestParser, ApiRoute, RouterError};
use crate::s3::CompletedPart;
use crate::service::MediaService;
use crate::upload::UploadSession;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Body of the 415 response for non-JSON API requests
pub const UNSUPPORTED_MEDIA_TYPE: &str = "Unsupported media type, please check the media format.";

const JSON: &str = "application/json";
const TEXT: &str = "text/plain";
const PROMETHEUS: &str = "text/plain; version=0.0.4";

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleShotRequest {
    file_name: Option<String>,
    file_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SingleShotResponse {
    upload_url: String,
    key: String,
    derived_key: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitMultipartRequest {
    file_name: Option<String>,
    file_type: Option<String>,
    part_count: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitMultipartResponse {
    upload_id: Option<String>,
    key: String,
    derived_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadPartRequest {
    key: String,
    part_number: u32,
    upload_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadPartResponse {
    presigned_url: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgePartRequest {
    key: String,
    part_number: u32,
    e_tag: String,
}

/// Part as the browser client reports it, in S3's own casing
#[derive(Debug, Deserialize)]
struct ClientPart {
    #[serde(rename = "PartNumber", alias = "partNumber")]
    part_number: u32,
    #[serde(rename = "ETag", alias = "eTag")]
    etag: String,
}

#[derive(Debug, Deserialize)]
struct CompleteMultipartRequest {
    key: String,
    #[serde(default)]
    parts: Vec<ClientPart>,
}

#[derive(Debug, Deserialize)]
struct KeyRequest {
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    file_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    download_url: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ProcessingResponse {
    processing: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    #[serde(flatten)]
    session: UploadSession,
    missing_parts: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

// ============================================================================
// Response
// ============================================================================

/// Handler output, independent of the HTTP body type
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl ApiResponse {
    fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self {
                status,
                content_type: JSON,
                body,
            },
            Err(e) => Self::message(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to encode response: {}", e),
            ),
        }
    }

    fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: TEXT,
            body: body.into(),
        }
    }

    fn message(status: StatusCode, error: &str) -> Self {
        Self::json(
            status,
            &ErrorBody {
                error: error.to_string(),
                kind: None,
                retryable: None,
            },
        )
    }

    fn error(e: &MediaError) -> Self {
        Self::json(
            status_for(e),
            &ErrorBody {
                error: e.to_string(),
                kind: Some(e.kind()),
                retryable: Some(e.is_retryable()),
            },
        )
    }

    fn ok<T: Serialize>(value: &T) -> Self {
        Self::json(StatusCode::OK, value)
    }

    fn empty() -> Self {
        Self::json(StatusCode::OK, &serde_json::json!({}))
    }

    /// Convert into a hyper response
    pub fn into_response(self) -> Response<String> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        response
    }
}

/// HTTP status for an error kind
pub fn status_for(e: &MediaError) -> StatusCode {
    match e {
        MediaError::SessionClosed { .. } => StatusCode::CONFLICT,
        _ => match e.kind() {
            ErrorKind::Validation | ErrorKind::PartTooSmall => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::IncompleteUpload => StatusCode::CONFLICT,
            ErrorKind::UploadInit | ErrorKind::StorageRejected | ErrorKind::Transfer => {
                StatusCode::BAD_GATEWAY
            }
            ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        },
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Serve one hyper request
pub async fn handle_request(
    req: Request<Incoming>,
    service: Arc<MediaService>,
) -> Result<Response<String>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return Ok(ApiResponse::message(
                StatusCode::BAD_REQUEST,
                &format!("Failed to read body: {}", e),
            )
            .into_response());
        }
    };

    let response = handle(
        &service,
        &method,
        &path,
        query.as_deref(),
        content_type.as_deref(),
        &body,
    )
    .await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = response.status.as_u16(),
        "Handled request"
    );

    Ok(response.into_response())
}

/// Route and serve a collected request
pub async fn handle(
    service: &MediaService,
    method: &str,
    path: &str,
    query: Option<&str>,
    content_type: Option<&str>,
    body: &[u8],
) -> ApiResponse {
    if ApiRequestParser::requires_json(method, path)
        && !content_type
            .map(|t| t.to_ascii_lowercase().contains(JSON))
            .unwrap_or(false)
    {
        return ApiResponse::message(StatusCode::UNSUPPORTED_MEDIA_TYPE, UNSUPPORTED_MEDIA_TYPE);
    }

    match ApiRequestParser::parse(method, path, query) {
        Ok(route) => handle_route(service, route, body).await,
        Err(RouterError::NotFound(_)) => ApiResponse::message(StatusCode::NOT_FOUND, "Not Found"),
        Err(e @ RouterError::MethodNotAllowed(_)) => {
            ApiResponse::message(StatusCode::METHOD_NOT_ALLOWED, &e.to_string())
        }
        Err(RouterError::InvalidQuery(msg)) => {
            ApiResponse::error(&MediaError::Validation(msg))
        }
    }
}

/// Serve a parsed route
pub async fn handle_route(service: &MediaService, route: ApiRoute, body: &[u8]) -> ApiResponse {
    match dispatch(service, route, body).await {
        Ok(response) => response,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                warn!(error = %e, kind = %e.kind(), "Request failed");
            }
            ApiResponse::error(&e)
        }
    }
}

async fn dispatch(
    service: &MediaService,
    route: ApiRoute,
    body: &[u8],
) -> Result<ApiResponse, MediaError> {
    match route {
        ApiRoute::Health => Ok(ApiResponse::text(StatusCode::OK, "ok")),

        ApiRoute::Metrics => {
            if !service.config().metrics.enabled {
                return Ok(ApiResponse::message(StatusCode::NOT_FOUND, "Not Found"));
            }
            Ok(ApiResponse {
                status: StatusCode::OK,
                content_type: PROMETHEUS,
                body: metrics::render(),
            })
        }

        ApiRoute::SingleShotUpload => {
            let req: SingleShotRequest = parse_body(body)?;
            let ticket = service
                .issue_single_shot(req.file_name.as_deref(), req.file_type.as_deref())
                .await?;
            Ok(ApiResponse::ok(&SingleShotResponse {
                upload_url: ticket.link.url,
                key: ticket.object_key,
                derived_key: ticket.derived_key,
                expires_at: ticket.link.expires_at,
            }))
        }

        ApiRoute::DeleteObject { key } => {
            service.delete_object(&key).await?;
            Ok(ApiResponse::empty())
        }

        ApiRoute::InitMultipart => {
            let req: InitMultipartRequest = parse_body(body)?;
            let (file_name, file_type) = match (req.file_name, req.file_type) {
                (Some(name), Some(kind)) if !name.is_empty() && !kind.is_empty() => (name, kind),
                _ => {
                    return Err(MediaError::Validation(
                        "fileName and fileType are required".into(),
                    ))
                }
            };
            let session = service
                .init_upload(&file_name, &file_type, req.part_count)
                .await?;
            Ok(ApiResponse::ok(&InitMultipartResponse {
                upload_id: session.upload_id,
                key: session.object_key,
                derived_key: session.derived_key,
            }))
        }

        ApiRoute::UploadPart => {
            let req: UploadPartRequest = parse_body(body)?;
            let link = service
                .request_part_link(&req.key, req.part_number, req.upload_id.as_deref())
                .await?;
            Ok(ApiResponse::ok(&UploadPartResponse {
                presigned_url: link.url,
                expires_at: link.expires_at,
            }))
        }

        ApiRoute::AcknowledgePart => {
            let req: AcknowledgePartRequest = parse_body(body)?;
            service
                .acknowledge_part(&req.key, req.part_number, &req.e_tag)
                .await?;
            Ok(ApiResponse::empty())
        }

        ApiRoute::CompleteMultipart => {
            let req: CompleteMultipartRequest = parse_body(body)?;
            let parts: Vec<CompletedPart> = req
                .parts
                .into_iter()
                .map(|p| CompletedPart {
                    part_number: p.part_number,
                    etag: p.etag,
                })
                .collect();
            let completed = service.complete_upload(&req.key, &parts).await?;
            Ok(ApiResponse::ok(&completed))
        }

        ApiRoute::AbortMultipart => {
            let req: KeyRequest = parse_body(body)?;
            service.abort_upload(&req.key).await?;
            Ok(ApiResponse::empty())
        }

        ApiRoute::SessionStatus => {
            let req: KeyRequest = parse_body(body)?;
            let session = service.session(&req.key).await?;
            let missing_parts = if session.status.is_terminal() {
                Vec::new()
            } else {
                session.missing_parts()
            };
            Ok(ApiResponse::ok(&SessionView {
                session,
                missing_parts,
            }))
        }

        ApiRoute::Download => {
            let req: DownloadRequest = parse_body(body)?;
            match service.check_download(&req.file_key).await? {
                Some(link) => Ok(ApiResponse::ok(&DownloadResponse {
                    download_url: link.url,
                    expires_at: link.expires_at,
                })),
                None => Ok(ApiResponse::json(
                    StatusCode::ACCEPTED,
                    &ProcessingResponse { processing: true },
                )),
            }
        }
    }
}

/// Decode a JSON body; an empty body reads as `{}`
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, MediaError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| MediaError::Validation(format!("invalid body: {}", e)))
}
