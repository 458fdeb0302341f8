pub mod arbiter;
pub mod capture;
pub mod enrollment;
pub mod errors;
pub mod events;
pub mod identification;
pub mod index;
pub mod notify;
pub mod record;
pub mod sensor;
pub mod service;
pub mod store;
pub mod template;

pub use errors::{AppError, AppResult, ConflictReason};
pub use events::{ChannelEventSink, EventSink, IdentificationEvent};
pub use record::{ExportEnvelope, IdentityRecord, IdentityRef, Role};
pub use service::{FingerprintService, ServiceConfig, ServiceParts, ServiceStatus};
