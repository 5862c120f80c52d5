//! HTTP server module
//!
//! Serves the media API over HTTP/1.1 with hyper. Each accepted connection
//! runs on its own tokio task; connection errors are logged and do not stop
//! the accept loop.

pub mod handlers;

use crate::service::MediaService;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub use handlers::{handle, handle_route, ApiResponse};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    RuntimeError(String),
}

/// HTTP API server
pub struct ApiServer {
    service: Arc<MediaService>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ApiServer {
    /// Bind to the configured address
    ///
    /// Port 0 lets the OS pick a port; see [`ApiServer::local_addr`].
    pub async fn bind(service: Arc<MediaService>) -> Result<Self, ServerError> {
        let addr: SocketAddr = service
            .config()
            .server
            .address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!("Server bound to {}", local_addr);

        Ok(Self {
            service,
            listener,
            local_addr,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the process exits
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Connections already accepted finish on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!("Starting API server on {}", self.local_addr);
        tokio::pin!(shutdown);

        let sweeper = self.service.spawn_session_sweeper();

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down API server");
                    sweeper.abort();
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let service = Arc::clone(&self.service);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let svc = service_fn(move |req| {
                    let service = Arc::clone(&service);
                    async move { handlers::handle_request(req, service).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                    error!("Error serving connection from {}: {}", peer_addr, e);
                }
            });
        }
    }
}
