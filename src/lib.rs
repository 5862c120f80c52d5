//! Mizuchi Media Library
//!
//! Video uploads to S3 through presigned links, with multipart sessions for
//! large files and a completion watcher for the processed output.
//!
//! # Features
//!
//! - **Presigned links**: clients never see storage credentials
//! - **Multipart sessions**: out-of-order part acknowledgment, explicit
//!   completion and abort
//! - **Transfer driver**: bounded-concurrency part uploads with retries and
//!   progress reporting
//! - **Completion watch**: a cancellable stream of poll outcomes
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_media::{config::Config, s3::S3Client, server::ApiServer};
//! use mizuchi_media::service::MediaService;
//! use mizuchi_media::upload::QueuePrefixTrigger;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let store = S3Client::connect(&config.storage).await?;
//!     let service = MediaService::new(config, Arc::new(store), Arc::new(QueuePrefixTrigger));
//!     let server = ApiServer::bind(Arc::new(service)).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod presign;
pub mod retry;
pub mod router;
pub mod s3;
pub mod server;
pub mod service;
pub mod telemetry;
pub mod upload;
pub mod watch;

// Re-export commonly used types
pub use config::Config;
pub use error::{ErrorKind, MediaError, MediaResult};
pub use server::ApiServer;
pub use service::MediaService;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
