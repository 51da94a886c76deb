//! Dealer Photo Service
//!
//! Background removal workflow for dealer registration photos. An operator
//! verifies a dealer by NIC number, uploads a photo, has its background removed
//! by an external provider or a local model, and explicitly saves the result.
//!
//! ## Features
//!
//! - **Dealer Verification**: NIC lookup against the dealer registry, cached
//!   for five minutes and served stale when a refresh fails
//! - **Advisory Duplicate Check**: earlier images for the same NIC are reported
//!   but never block a new upload
//! - **Bounded Job Polling**: provider jobs are polled up to 30 times, 10 seconds
//!   apart, and can be cancelled at any point
//! - **Image Records**: PostgreSQL-backed history with best-effort object
//!   deletion and a manual PNG upload path
//!
//! ## Architecture
//!
//! ```text
//!  Operator (HTTP API)
//!        │
//!        ▼
//! ┌──────────────┐     ┌──────────────┐
//! │ Workflow     │────▶│ Dealer       │◀── registry JSON (HTTP / file)
//! │ Registry     │     │ Directory    │
//! └──────────────┘     └──────────────┘
//!        │
//!        ├──────────────▶ S3 object store ◀──── Image Catalog
//!        │                                          │
//!        ├──────────────▶ Removal provider          │
//!        │                 (submit / poll)          │
//!        ▼                                          ▼
//! ┌──────────────┐                          ┌──────────────┐
//! │ Local model  │                          │ Record Store │
//! └──────────────┘                          └──────────────┘
//! ```

pub mod api;
pub mod catalog;
pub mod config;
pub mod dealers;
pub mod local_processor;
pub mod object_store;
pub mod record_store;
pub mod remover;
pub mod upload;
pub mod workflow;

pub use api::AppState;
pub use catalog::ImageCatalog;
pub use config::Config;
pub use dealers::{Dealer, DealerDirectory, DealerSource};
pub use object_store::{ObjectStore, S3ObjectStore, StoredObject};
pub use record_store::{MemoryRecordStore, PgRecordStore, ProcessedImageRecord, RecordStore};
pub use remover::{BackgroundRemover, HttpBackgroundRemover, UnconfiguredRemover};
pub use workflow::{Workflow, WorkflowRegistry, WorkflowSnapshot, WorkflowState};
