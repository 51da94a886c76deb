//! Upload, process and save workflow.
//!
//! One [`Workflow`] per operator session drives a photo through dealer
//! verification, the advisory duplicate check, upload, background removal and
//! the final, explicitly confirmed save:
//!
//! ```text
//! Idle ─▶ Verifying ─▶ DuplicateCheck ─▶ AwaitingUpload ─▶ Uploaded
//!                                                             │
//!          Saved ◀─ Saving ◀─ Ready ◀─ Polling ◀─ Submitting ◀┘
//! ```
//!
//! Every non-terminal state can fall into `Failed(reason)`. State lives in a
//! `watch` channel so observers can follow it; every write is tagged with the
//! generation it was started under and is dropped if the instance has been
//! reset or cancelled since.

pub mod poller;
pub mod registry;

use crate::dealers::{normalize_key, Dealer, DealerDirectory};
use crate::local_processor::LocalProcessor;
use crate::object_store::ObjectStore;
use crate::record_store::{DealerSnapshot, NewRecord, ProcessedImageRecord, Provenance, RecordStore};
use crate::remover::{BackgroundRemover, RemovalOptions};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use poller::{poll_job, PollHandle, PollOutcome, PollPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use registry::WorkflowRegistry;

/// Folder for originals handed to the removal provider
pub const ORIGINALS_FOLDER: &str = "lightx-temp";
/// Folder for locally processed results
pub const PREVIEW_FOLDER: &str = "background-removal-preview";

/// Errors returned to the caller of a workflow action. Collaborator failures
/// are not errors here; they land the workflow in `Failed`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("{0}")]
    Validation(String),

    #[error("cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: String },
}

/// Broad error classes surfaced to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    CollaboratorUnavailable,
    Timeout,
    Cancelled,
}

/// Why a workflow failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DealerNotAvailable,
    LookupUnavailable,
    UploadFailed,
    SubmissionRejected,
    StatusCheckFailed,
    ProcessingFailed,
    ProcessingTimeout,
    SaveFailed,
    Cancelled,
}

impl FailureKind {
    pub fn message(&self) -> &'static str {
        match self {
            FailureKind::DealerNotAvailable => "dealer not available",
            FailureKind::LookupUnavailable => "dealer lookup unavailable",
            FailureKind::UploadFailed => "upload failed",
            FailureKind::SubmissionRejected => "submission rejected",
            FailureKind::StatusCheckFailed => "status check failed",
            FailureKind::ProcessingFailed => "processing failed",
            FailureKind::ProcessingTimeout => "processing timeout",
            FailureKind::SaveFailed => "save failed",
            FailureKind::Cancelled => "cancelled",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FailureKind::DealerNotAvailable => ErrorCategory::NotFound,
            FailureKind::ProcessingTimeout => ErrorCategory::Timeout,
            FailureKind::Cancelled => ErrorCategory::Cancelled,
            _ => ErrorCategory::CollaboratorUnavailable,
        }
    }
}

/// A failure with its optional underlying cause
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: &'static str,
    pub category: ErrorCategory,
    pub cause: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, cause: Option<String>) -> Self {
        Self {
            kind,
            message: kind.message(),
            category: kind.category(),
            cause,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => f.write_str(self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "name", content = "failure", rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Verifying,
    DuplicateCheck,
    AwaitingUpload,
    Uploaded,
    Submitting,
    Polling,
    Ready,
    Saving,
    Saved,
    Failed(Failure),
}

impl WorkflowState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Verifying => "verifying",
            WorkflowState::DuplicateCheck => "duplicate_check",
            WorkflowState::AwaitingUpload => "awaiting_upload",
            WorkflowState::Uploaded => "uploaded",
            WorkflowState::Submitting => "submitting",
            WorkflowState::Polling => "polling",
            WorkflowState::Ready => "ready",
            WorkflowState::Saving => "saving",
            WorkflowState::Saved => "saved",
            WorkflowState::Failed(_) => "failed",
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            WorkflowState::Failed(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_failed_with(&self, kind: FailureKind) -> bool {
        self.failure().is_some_and(|f| f.kind == kind)
    }

    /// A job is being submitted or polled
    pub fn has_job_in_flight(&self) -> bool {
        matches!(self, WorkflowState::Submitting | WorkflowState::Polling)
    }

    /// Nothing more will happen without an operator action
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            WorkflowState::Idle
                | WorkflowState::AwaitingUpload
                | WorkflowState::Uploaded
                | WorkflowState::Ready
                | WorkflowState::Saved
                | WorkflowState::Failed(_)
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Failed(failure) => write!(f, "failed ({failure})"),
            other => f.write_str(other.name()),
        }
    }
}

/// How the background is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// External provider job, polled until done
    #[default]
    Provider,
    /// Local model run inline
    Local,
}

impl ProcessingMode {
    fn provenance(&self) -> Provenance {
        match self {
            ProcessingMode::Provider => Provenance::ExternalProvider,
            ProcessingMode::Local => Provenance::LocalModel,
        }
    }
}

/// Observable state of one workflow instance
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub id: Uuid,
    pub state: WorkflowState,
    pub status_message: Option<String>,
    /// An action is running against a collaborator
    pub busy: bool,
    pub business_key: Option<String>,
    pub dealer: Option<Dealer>,
    /// Most recent record already saved for this key (advisory only)
    pub existing_record: Option<ProcessedImageRecord>,
    pub original_image_url: Option<String>,
    pub mode: Option<ProcessingMode>,
    pub job_id: Option<String>,
    pub poll_attempts: u32,
    pub output_url: Option<String>,
    pub saved_record_id: Option<Uuid>,
    #[serde(skip)]
    generation: u64,
    #[serde(skip)]
    original_object_id: Option<String>,
    #[serde(skip)]
    output_object_id: Option<String>,
    #[serde(skip)]
    image: Option<Bytes>,
}

impl WorkflowSnapshot {
    fn new(id: Uuid, generation: u64) -> Self {
        Self {
            id,
            state: WorkflowState::Idle,
            status_message: None,
            busy: false,
            business_key: None,
            dealer: None,
            existing_record: None,
            original_image_url: None,
            mode: None,
            job_id: None,
            poll_attempts: 0,
            output_url: None,
            saved_record_id: None,
            generation,
            original_object_id: None,
            output_object_id: None,
            image: None,
        }
    }

    /// Commands other than reset/cancel are accepted
    fn accepts_commands(&self) -> bool {
        !self.busy && !self.state.has_job_in_flight()
    }

    fn clear_processing(&mut self) {
        self.mode = None;
        self.job_id = None;
        self.poll_attempts = 0;
        self.output_url = None;
        self.output_object_id = None;
        self.saved_record_id = None;
    }

    fn fail(&mut self, kind: FailureKind, cause: Option<String>) {
        let failure = Failure::new(kind, cause);
        self.status_message = Some(failure.to_string());
        self.state = WorkflowState::Failed(failure);
        self.busy = false;
    }
}

/// Everything a workflow talks to
pub struct Collaborators {
    pub dealers: Arc<DealerDirectory>,
    pub storage: Arc<dyn ObjectStore>,
    pub remover: Arc<dyn BackgroundRemover>,
    pub records: Arc<dyn RecordStore>,
    pub local: Arc<dyn LocalProcessor>,
    pub poll_policy: PollPolicy,
    pub removal_options: RemovalOptions,
}

/// Apply `f` only if no reset or cancel happened since `generation`.
fn apply_if_current(
    state: &watch::Sender<WorkflowSnapshot>,
    generation: u64,
    f: impl FnOnce(&mut WorkflowSnapshot),
) -> bool {
    state.send_if_modified(|s| {
        if s.generation != generation {
            return false;
        }
        f(s);
        true
    })
}

/// Fails its generation if dropped while the action is still busy, which
/// happens when the caller goes away mid-request.
struct BusyGuard<'a> {
    workflow: &'a Workflow,
    generation: u64,
    kind: FailureKind,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let (generation, kind) = (self.generation, self.kind);
        let interrupted = self.workflow.state.send_if_modified(|s| {
            if s.generation != generation || !s.busy {
                return false;
            }
            s.fail(kind, Some("interrupted".to_string()));
            true
        });

        if interrupted {
            warn!(workflow_id = %self.workflow.id, reason = kind.message(), "Workflow action interrupted");
            metrics::counter!("photo.workflows.failed", "reason" => kind.message()).increment(1);
        }
    }
}

fn millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One operator's upload-process-save session
pub struct Workflow {
    id: Uuid,
    collaborators: Arc<Collaborators>,
    state: Arc<watch::Sender<WorkflowSnapshot>>,
    poll: Mutex<Option<PollHandle>>,
}

impl Workflow {
    pub fn new(collaborators: Arc<Collaborators>) -> Self {
        let id = Uuid::new_v4();
        let (state, _) = watch::channel(WorkflowSnapshot::new(id, 0));

        Self {
            id,
            collaborators,
            state: Arc::new(state),
            poll: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.state.borrow().clone()
    }

    /// Follow state changes
    pub fn subscribe(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.state.subscribe()
    }

    /// Nothing is running and nobody is following state changes
    fn is_idle(&self) -> bool {
        let s = self.state.borrow();
        !s.busy && !s.state.has_job_in_flight() && self.state.receiver_count() == 0
    }

    /// Atomically check `allowed` and enter the action, returning the
    /// generation the action runs under.
    fn begin(
        &self,
        action: &'static str,
        allowed: impl FnOnce(&WorkflowSnapshot) -> bool,
        enter: impl FnOnce(&mut WorkflowSnapshot),
    ) -> Result<u64, WorkflowError> {
        let mut outcome = Err(WorkflowError::InvalidTransition {
            action,
            state: String::new(),
        });

        self.state.send_if_modified(|s| {
            if !allowed(s) {
                outcome = Err(WorkflowError::InvalidTransition {
                    action,
                    state: if s.busy {
                        format!("{} (busy)", s.state)
                    } else {
                        s.state.to_string()
                    },
                });
                return false;
            }
            enter(s);
            outcome = Ok(s.generation);
            true
        });

        outcome
    }

    fn guard(&self, generation: u64, kind: FailureKind) -> BusyGuard<'_> {
        BusyGuard {
            workflow: self,
            generation,
            kind,
        }
    }

    fn apply(&self, generation: u64, f: impl FnOnce(&mut WorkflowSnapshot)) -> bool {
        apply_if_current(&self.state, generation, f)
    }

    fn fail(&self, generation: u64, kind: FailureKind, cause: Option<String>) {
        warn!(workflow_id = %self.id, reason = kind.message(), cause = ?cause, "Workflow failed");
        metrics::counter!("photo.workflows.failed", "reason" => kind.message()).increment(1);
        self.apply(generation, |s| s.fail(kind, cause));
    }

    /// Check the business key against the dealer registry, then look for an
    /// earlier record. A previous record never blocks the workflow.
    pub async fn verify(&self, business_key: &str) -> Result<WorkflowSnapshot, WorkflowError> {
        let key = normalize_key(business_key);
        if key.is_empty() {
            return Err(WorkflowError::Validation("Please enter a NIC number".to_string()));
        }

        let generation = self.begin("verify", |s| s.accepts_commands(), |s| {
            let id = s.id;
            let generation = s.generation + 1;
            *s = WorkflowSnapshot::new(id, generation);
            s.business_key = Some(key.clone());
            s.state = WorkflowState::Verifying;
            s.status_message = Some("Verifying dealer".to_string());
            s.busy = true;
        })?;
        let _guard = self.guard(generation, FailureKind::LookupUnavailable);

        info!(workflow_id = %self.id, nic = %key, "Verifying dealer");

        let dealer = match self.collaborators.dealers.lookup(&key).await {
            Ok(Some(dealer)) => dealer,
            Ok(None) => {
                self.fail(generation, FailureKind::DealerNotAvailable, None);
                return Ok(self.snapshot());
            }
            Err(e) => {
                self.fail(generation, FailureKind::LookupUnavailable, Some(e.to_string()));
                return Ok(self.snapshot());
            }
        };

        let current = self.apply(generation, |s| {
            s.dealer = Some(dealer);
            s.state = WorkflowState::DuplicateCheck;
            s.status_message = Some("Checking for existing image".to_string());
        });
        if !current {
            return Ok(self.snapshot());
        }

        let existing = match self.collaborators.records.find_most_recent_by_key(&key).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(workflow_id = %self.id, error = %e, "Duplicate check failed, continuing");
                None
            }
        };

        if let Some(record) = &existing {
            info!(
                workflow_id = %self.id,
                nic = %key,
                record_id = %record.record_id,
                "Existing image found for dealer"
            );
        }

        self.apply(generation, |s| {
            s.status_message = Some(if existing.is_some() {
                "An image already exists for this NIC".to_string()
            } else {
                "Dealer verified".to_string()
            });
            s.existing_record = existing;
            s.state = WorkflowState::AwaitingUpload;
            s.busy = false;
        });

        Ok(self.snapshot())
    }

    /// Upload the operator's image. Replaces any earlier image and result.
    pub async fn attach_image(
        &self,
        image: Bytes,
        content_type: &str,
    ) -> Result<WorkflowSnapshot, WorkflowError> {
        if image.is_empty() {
            return Err(WorkflowError::Validation("Please upload an image".to_string()));
        }

        let generation = self.begin(
            "attach an image",
            |s| s.accepts_commands() && s.dealer.is_some(),
            |s| {
                s.clear_processing();
                s.original_image_url = None;
                s.original_object_id = None;
                s.image = Some(image.clone());
                s.state = WorkflowState::AwaitingUpload;
                s.status_message = Some("Uploading image".to_string());
                s.busy = true;
            },
        )?;
        let _guard = self.guard(generation, FailureKind::UploadFailed);

        let stored = self
            .collaborators
            .storage
            .store(
                image,
                ORIGINALS_FOLDER,
                &format!("temp-{}", millis()),
                content_type,
            )
            .await;

        match stored {
            Ok(object) => {
                debug!(workflow_id = %self.id, url = %object.url, "Original uploaded");
                self.apply(generation, |s| {
                    s.original_image_url = Some(object.url);
                    s.original_object_id = Some(object.object_id);
                    s.state = WorkflowState::Uploaded;
                    s.status_message = Some("Image uploaded".to_string());
                    s.busy = false;
                });
            }
            Err(e) => self.fail(generation, FailureKind::UploadFailed, Some(e.to_string())),
        }

        Ok(self.snapshot())
    }

    /// Remove the background. Calling this while a job is already in flight
    /// does nothing. `background` overrides the configured provider option.
    pub async fn start_processing(
        &self,
        mode: ProcessingMode,
        background: Option<String>,
    ) -> Result<WorkflowSnapshot, WorkflowError> {
        if self.state.borrow().state.has_job_in_flight() {
            debug!(workflow_id = %self.id, "Job already in flight, ignoring");
            return Ok(self.snapshot());
        }

        let token = CancellationToken::new();
        let generation = {
            // Held so a cancel cannot slip between entering and storing the token.
            let mut slot = self.poll.lock();
            let generation = self.enter_processing(mode)?;
            if let Some(previous) = slot.replace(PollHandle::pending(token.clone())) {
                previous.cancel();
            }
            generation
        };

        match mode {
            ProcessingMode::Provider => {
                let _guard = self.guard(generation, FailureKind::SubmissionRejected);
                let mut options = self.collaborators.removal_options.clone();
                if let Some(background) = background.filter(|b| !b.trim().is_empty()) {
                    options.background = background;
                }
                self.submit_to_provider(generation, token, &options).await
            }
            ProcessingMode::Local => {
                let _guard = self.guard(generation, FailureKind::ProcessingFailed);
                self.process_locally(generation, &token).await
            }
        }

        Ok(self.snapshot())
    }

    fn enter_processing(&self, mode: ProcessingMode) -> Result<u64, WorkflowError> {
        self.begin(
            "start processing",
            |s| {
                s.accepts_commands()
                    && s.original_image_url.is_some()
                    && matches!(
                        s.state,
                        WorkflowState::Uploaded | WorkflowState::Ready | WorkflowState::Failed(_)
                    )
            },
            |s| {
                s.clear_processing();
                s.mode = Some(mode);
                s.state = WorkflowState::Submitting;
                s.status_message = Some(match mode {
                    ProcessingMode::Provider => "Sending to removal provider".to_string(),
                    ProcessingMode::Local => "Processing with local model".to_string(),
                });
                s.busy = true;
            },
        )
    }

    async fn submit_to_provider(
        &self,
        generation: u64,
        token: CancellationToken,
        options: &RemovalOptions,
    ) {
        let Some(image_url) = self.state.borrow().original_image_url.clone() else {
            return;
        };

        let job_id = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = self
                .collaborators
                .remover
                .submit(&image_url, options) => match result {
                Ok(job_id) => job_id,
                Err(e) => {
                    self.fail(generation, FailureKind::SubmissionRejected, Some(e.to_string()));
                    return;
                }
            },
        };

        info!(workflow_id = %self.id, job_id = %job_id, "Removal job submitted");

        let polling = self.apply(generation, |s| {
            s.job_id = Some(job_id.clone());
            s.state = WorkflowState::Polling;
            s.status_message = Some("Processing with removal provider".to_string());
            s.busy = false;
        });
        if !polling {
            return;
        }

        let state = self.state.clone();
        let remover = self.collaborators.remover.clone();
        let policy = self.collaborators.poll_policy;
        let workflow_id = self.id;

        let mut slot = self.poll.lock();
        // Every path that replaces or takes our handle cancels its token.
        if token.is_cancelled() {
            return;
        }
        let Some(handle) = slot.as_mut() else {
            return;
        };

        handle.spawn(async move {
            let outcome = poll_job(remover.as_ref(), &job_id, policy, &token, |attempt, job| {
                let text = job
                    .status_text
                    .clone()
                    .unwrap_or_else(|| "Processing...".to_string());
                apply_if_current(&state, generation, |s| {
                    s.poll_attempts = attempt;
                    s.status_message = Some(text);
                });
            })
            .await;

            finish_polling(&state, generation, workflow_id, outcome);
        });
    }

    async fn process_locally(&self, generation: u64, token: &CancellationToken) {
        let image = self.state.borrow().image.clone();
        let Some(image) = image else {
            self.fail(
                generation,
                FailureKind::ProcessingFailed,
                Some("no image attached".to_string()),
            );
            return;
        };

        // Dropping the model future on cancel stops its subprocess.
        let processed = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = self.collaborators.local.process(image) => match result {
                Ok(processed) => processed,
                Err(e) => {
                    self.fail(generation, FailureKind::ProcessingFailed, Some(e.to_string()));
                    return;
                }
            },
        };

        let name = format!("preview-{}", millis());
        let stored = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            stored = self.collaborators.storage.store(processed, PREVIEW_FOLDER, &name, "image/png") => stored,
        };

        match stored {
            Ok(object) => {
                info!(workflow_id = %self.id, url = %object.url, "Local processing complete");
                self.apply(generation, |s| {
                    s.output_url = Some(object.url);
                    s.output_object_id = Some(object.object_id);
                    s.state = WorkflowState::Ready;
                    s.status_message = Some("Completed!".to_string());
                    s.busy = false;
                });
            }
            Err(e) => self.fail(generation, FailureKind::UploadFailed, Some(e.to_string())),
        }
    }

    /// Stop an in-flight job. No state changes afterwards come from it.
    pub fn cancel(&self) -> WorkflowSnapshot {
        if let Some(handle) = self.poll.lock().take() {
            handle.cancel();
        }

        let cancelled = self.state.send_if_modified(|s| {
            if !s.state.has_job_in_flight() {
                return false;
            }
            s.generation += 1;
            s.fail(FailureKind::Cancelled, None);
            true
        });

        if cancelled {
            info!(workflow_id = %self.id, "Processing cancelled");
        }

        self.snapshot()
    }

    /// Persist the processed image. Only ever triggered by the operator.
    pub async fn confirm_save(&self) -> Result<WorkflowSnapshot, WorkflowError> {
        let mut record = None;

        let generation = self.begin(
            "save",
            |s| {
                s.accepts_commands()
                    && s.output_url.is_some()
                    && (s.state == WorkflowState::Ready
                        || s.state.is_failed_with(FailureKind::SaveFailed))
            },
            |s| {
                let mode = s.mode.unwrap_or_default();
                record = Some(NewRecord {
                    business_key: s.business_key.clone().unwrap_or_default(),
                    image_url: s.output_url.clone().unwrap_or_default(),
                    original_image_url: s.original_image_url.clone(),
                    storage_object_id: match mode {
                        ProcessingMode::Local => s.output_object_id.clone(),
                        ProcessingMode::Provider => s.original_object_id.clone(),
                    },
                    provenance: mode.provenance(),
                    dealer: s
                        .dealer
                        .as_ref()
                        .map(DealerSnapshot::from)
                        .filter(|d| !d.is_empty()),
                });
                s.state = WorkflowState::Saving;
                s.status_message = Some("Saving result".to_string());
                s.busy = true;
            },
        )?;
        let _guard = self.guard(generation, FailureKind::SaveFailed);

        let Some(record) = record else {
            return Ok(self.snapshot());
        };

        match self.collaborators.records.insert(record).await {
            Ok(record_id) => {
                info!(workflow_id = %self.id, record_id = %record_id, "Result saved");
                metrics::counter!("photo.workflows.saved").increment(1);
                self.apply(generation, |s| {
                    s.saved_record_id = Some(record_id);
                    s.state = WorkflowState::Saved;
                    s.status_message = Some("Result saved successfully".to_string());
                    s.busy = false;
                });
            }
            Err(e) => self.fail(generation, FailureKind::SaveFailed, Some(e.to_string())),
        }

        Ok(self.snapshot())
    }

    /// Abandon everything and return to `Idle`.
    pub fn reset(&self) -> WorkflowSnapshot {
        if let Some(handle) = self.poll.lock().take() {
            handle.cancel();
        }

        self.state.send_modify(|s| {
            let generation = s.generation + 1;
            *s = WorkflowSnapshot::new(self.id, generation);
        });

        debug!(workflow_id = %self.id, "Workflow reset");
        self.snapshot()
    }
}

impl Drop for Workflow {
    fn drop(&mut self) {
        if let Some(handle) = self.poll.get_mut().take() {
            handle.cancel();
        }
    }
}

fn finish_polling(
    state: &watch::Sender<WorkflowSnapshot>,
    generation: u64,
    workflow_id: Uuid,
    outcome: PollOutcome,
) {
    let (kind, cause) = match outcome {
        PollOutcome::Ready {
            output_url,
            attempts,
        } => {
            info!(workflow_id = %workflow_id, attempts, "Background removal complete");
            apply_if_current(state, generation, |s| {
                s.output_url = Some(output_url);
                s.poll_attempts = attempts;
                s.state = WorkflowState::Ready;
                s.status_message = Some("Completed!".to_string());
            });
            return;
        }
        PollOutcome::Cancelled { .. } => return,
        PollOutcome::Failed { .. } => (FailureKind::ProcessingFailed, None),
        PollOutcome::TimedOut { .. } => (
            FailureKind::ProcessingTimeout,
            Some("please try again".to_string()),
        ),
        PollOutcome::StatusCheckFailed { cause, .. } => (FailureKind::StatusCheckFailed, Some(cause)),
    };

    warn!(workflow_id = %workflow_id, reason = kind.message(), "Background removal failed");
    metrics::counter!("photo.workflows.failed", "reason" => kind.message()).increment(1);
    apply_if_current(state, generation, |s| s.fail(kind, cause));
}

#[cfg(test)]
mod tests;
