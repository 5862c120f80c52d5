//! Mizuchi Media - video uploads to S3 through presigned links
//!
//! Runs the HTTP API, or drives an upload / completion watch from the shell.

use clap::{Parser, Subcommand};
use futures::StreamExt;
use mizuchi_media::config::Config;
use mizuchi_media::retry::RetryPolicy;
use mizuchi_media::s3::S3Client;
use mizuchi_media::server::ApiServer;
use mizuchi_media::service::MediaService;
use mizuchi_media::telemetry;
use mizuchi_media::upload::{
    HttpTransport, QueuePrefixTrigger, TransferDriver, TransferProgress, UploadSource,
};
use mizuchi_media::watch::{WatchOutcome, WatchRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Per-request timeout for part transfers
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Mizuchi Media - multipart video uploads over S3 presigned links
#[derive(Parser, Debug)]
#[command(name = "mizuchi-media")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve,

    /// Upload a local video file
    Upload {
        /// File to upload
        file: PathBuf,

        /// Content type; guessed from the extension when omitted
        #[arg(long)]
        content_type: Option<String>,

        /// Wait for the processed object afterwards
        #[arg(long)]
        watch: bool,
    },

    /// Wait for a processed object and print its download link
    Watch {
        /// Key of the processed object
        derived_key: String,

        /// Key of the uploaded source, for logging
        #[arg(long)]
        source_key: Option<String>,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    telemetry::init_subscriber(&args.log_level, args.json_logs)?;

    info!("Starting Mizuchi Media v{}", mizuchi_media::VERSION);

    let config = Config::load(&args.config)?;
    info!("Loaded configuration from {:?}", args.config);

    let store = S3Client::connect(&config.storage).await?;
    let service = Arc::new(MediaService::new(
        config.clone(),
        Arc::new(store),
        Arc::new(QueuePrefixTrigger),
    ));

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let server = ApiServer::bind(service).await?;
            server
                .run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
        Command::Upload {
            file,
            content_type,
            watch,
        } => {
            let derived_key = upload(&service, &config, &file, content_type).await?;
            if watch {
                let request = service.watch_request("", &derived_key);
                run_watch(&service, request).await?;
            }
        }
        Command::Watch {
            derived_key,
            source_key,
            timeout_ms,
        } => {
            let mut request =
                service.watch_request(source_key.as_deref().unwrap_or(""), &derived_key);
            if let Some(ms) = timeout_ms {
                request = request.with_timeout(Duration::from_millis(ms));
            }
            run_watch(&service, request).await?;
        }
    }

    Ok(())
}

async fn upload(
    service: &Arc<MediaService>,
    config: &Config,
    file: &Path,
    content_type: Option<String>,
) -> anyhow::Result<String> {
    let source = UploadSource::File(file.to_path_buf());
    let file_name = source
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", file.display()))?;
    let content_type = content_type.unwrap_or_else(|| guess_content_type(&file_name).to_string());

    let driver = TransferDriver::new(
        Arc::clone(service.manager()),
        Arc::new(HttpTransport::new(TRANSFER_TIMEOUT)?),
        config.upload.clone(),
        RetryPolicy::from(&config.storage.retry),
    );

    let (tx, mut rx) = watch::channel(TransferProgress::default());
    let reporter = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let progress = *rx.borrow_and_update();
            info!(
                percent = progress.percent,
                bytes_sent = progress.bytes_sent,
                total_bytes = progress.total_bytes,
                "Upload progress"
            );
        }
    });

    let result = driver
        .upload(&source, &file_name, &content_type, Some(tx))
        .await;
    let _ = reporter.await;

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.derived_key)
}

async fn run_watch(service: &MediaService, request: WatchRequest) -> anyhow::Result<()> {
    let (_id, mut watch) = service.start_watch(request)?;

    loop {
        let outcome = tokio::select! {
            outcome = watch.next() => outcome,
            _ = tokio::signal::ctrl_c() => {
                watch.cancel();
                warn!("Watch cancelled");
                return Ok(());
            }
        };

        match outcome {
            Some(WatchOutcome::Pending { attempt }) => {
                info!(attempt = attempt, "Processed object not ready yet");
            }
            Some(WatchOutcome::Ready(link)) => {
                println!("{}", link.url);
                return Ok(());
            }
            Some(WatchOutcome::Timeout { elapsed }) => {
                anyhow::bail!("processed object did not appear within {:?}", elapsed);
            }
            Some(WatchOutcome::Error(e)) => return Err(e.into()),
            None => return Ok(()),
        }
    }
}

fn guess_content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "m4v" => "video/x-m4v",
        _ => "video/mp4",
    }
}
