//! Upload module
//!
//! Multipart session bookkeeping, key assignment, the processing hand-off
//! and the transfer driver that moves local bytes through presigned links.

pub mod driver;
pub mod keys;
pub mod partition;
pub mod progress;
pub mod session;
pub mod transport;
pub mod trigger;

pub use driver::{TransferDriver, UploadMethod, UploadReport, UploadSource};
pub use keys::{KeyMapping, ObjectKeys};
pub use partition::{plan_parts, PartRange};
pub use progress::{ProgressTracker, TransferProgress};
pub use session::{
    CompletedUpload, PartEntry, SessionManager, SessionStatus, SingleShotTicket, UploadSession,
};
pub use transport::{HttpTransport, PartTransport, TransportError};
pub use trigger::{ProcessingTrigger, QueuePrefixTrigger};
