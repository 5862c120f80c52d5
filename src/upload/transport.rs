//! Part transport
//!
//! Moves bytes to a presigned URL and returns the eTag storage assigned.

use crate::presign::PresignedLink;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Network failure, expired link, throttling or a server-side error
    #[error("transfer failed: {0}")]
    Retryable(String),

    #[error("part too small: {0}")]
    PartTooSmall(String),

    #[error("storage rejected transfer ({status} {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
}

/// Uploads one body to a presigned link
#[async_trait]
pub trait PartTransport: Send + Sync {
    /// PUT `body` to `link`, returning the eTag
    ///
    /// `content_type` must match the type the link was signed with, if any.
    async fn put(
        &self,
        link: &PresignedLink,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<String, TransportError>;
}

/// HTTP transport backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Rejected {
                status: 0,
                code: "ClientBuild".into(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PartTransport for HttpTransport {
    #[tracing::instrument(
        name = "transport.put",
        skip(self, link, body),
        fields(upload.bytes = body.len()),
        err
    )]
    async fn put(
        &self,
        link: &PresignedLink,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<String, TransportError> {
        let mut request = self.client.put(&link.url).body(body);
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| TransportError::Rejected {
                    status: status.as_u16(),
                    code: "MissingETag".into(),
                    message: "storage response carried no ETag header".into(),
                });
        }

        let body = response.text().await.unwrap_or_default();
        let document = parse_error(&body);
        let code = document.code.unwrap_or_default();
        let message = document.message.unwrap_or_else(|| status.to_string());

        // Expired links surface as 403 and are fixed by a fresh link
        if status.is_server_error()
            || status.as_u16() == 403
            || status.as_u16() == 408
            || status.as_u16() == 429
        {
            return Err(TransportError::Retryable(format!(
                "{} {}: {}",
                status.as_u16(),
                code,
                message
            )));
        }

        if code == "EntityTooSmall" {
            return Err(TransportError::PartTooSmall(message));
        }

        Err(TransportError::Rejected {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

/// S3 error document; unknown elements are ignored
#[derive(Debug, Default, Deserialize)]
struct ErrorDocument {
    #[serde(rename = "Code", default)]
    code: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

fn parse_error(body: &str) -> ErrorDocument {
    quick_xml::de::from_str(body).unwrap_or_default()
}
