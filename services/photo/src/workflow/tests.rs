use super::*;
use crate::dealers::{DealerError, DealerSource, MockDealerSource, SystemClock};
use crate::local_processor::{MockLocalProcessor, PassthroughProcessor, ProcessorError};
use crate::object_store::{MockObjectStore, StorageError, StoredObject};
use crate::record_store::{MemoryRecordStore, MockRecordStore, RecordStoreError};
use crate::remover::{JobState, JobStatus, RemoverError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Remover that replays canned responses, then keeps reporting "processing".
#[derive(Default)]
struct ScriptedRemover {
    submit_error: Mutex<Option<RemoverError>>,
    polls: Mutex<VecDeque<Result<JobState, RemoverError>>>,
    /// How long each status check takes to answer
    poll_delay: Option<Duration>,
    submits: AtomicU32,
    calls: AtomicU32,
}

impl ScriptedRemover {
    fn processing_then(polls: usize, last: Option<JobState>) -> Arc<Self> {
        let mut script: VecDeque<_> = (0..polls).map(|_| Ok(processing())).collect();
        if let Some(last) = last {
            script.push_back(Ok(last));
        }
        Arc::new(Self {
            polls: Mutex::new(script),
            ..Default::default()
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundRemover for ScriptedRemover {
    async fn submit(&self, _image_url: &str, _options: &RemovalOptions) -> Result<String, RemoverError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        match self.submit_error.lock().take() {
            Some(e) => Err(e),
            None => Ok("J1".to_string()),
        }
    }

    async fn poll(&self, _job_id: &str) -> Result<JobState, RemoverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.poll_delay {
            tokio::time::sleep(delay).await;
        }
        self.polls.lock().pop_front().unwrap_or_else(|| Ok(processing()))
    }
}

/// Dealer registry that never answers
struct StalledDealers;

#[async_trait]
impl DealerSource for StalledDealers {
    async fn fetch(&self) -> Result<Vec<Dealer>, DealerError> {
        std::future::pending().await
    }
}

/// Object store whose uploads never finish
struct StalledStorage;

#[async_trait]
impl ObjectStore for StalledStorage {
    async fn store(
        &self,
        _data: Bytes,
        _folder: &str,
        _name: &str,
        _content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        std::future::pending().await
    }

    async fn delete(&self, _object_id: &str) -> bool {
        false
    }
}

/// Flags when the future holding it is dropped
struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Local model that runs until its future is dropped
#[derive(Default)]
struct StalledModel {
    started: Notify,
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl LocalProcessor for StalledModel {
    async fn process(&self, _image: Bytes) -> Result<Bytes, ProcessorError> {
        let _running = SetOnDrop(self.dropped.clone());
        self.started.notify_one();
        std::future::pending().await
    }
}

fn processing() -> JobState {
    JobState {
        status: JobStatus::Processing,
        output_url: None,
        status_text: Some("processing".to_string()),
    }
}

fn with_output(url: &str) -> JobState {
    JobState {
        status: JobStatus::Processing,
        output_url: Some(url.to_string()),
        status_text: Some("processing".to_string()),
    }
}

fn dealer_x123() -> Dealer {
    Dealer {
        nic_number: "X123".to_string(),
        dealer_name: "Nimal Stores".to_string(),
        area: "Galle".to_string(),
        classification: "Gold".to_string(),
        ..Default::default()
    }
}

fn directory(dealers: Vec<Dealer>) -> Arc<DealerDirectory> {
    let mut source = MockDealerSource::new();
    source.expect_fetch().returning(move || Ok(dealers.clone()));
    Arc::new(DealerDirectory::new(
        Arc::new(source),
        Arc::new(SystemClock),
        Duration::from_secs(300),
    ))
}

fn storage_ok() -> MockObjectStore {
    let mut storage = MockObjectStore::new();
    storage.expect_store().returning(|_, folder, name, _| {
        Ok(StoredObject {
            url: format!("https://cdn.test/{folder}/{name}.png"),
            object_id: format!("{folder}/{name}.png"),
        })
    });
    storage
}

struct Setup {
    dealers: Arc<DealerDirectory>,
    storage: Arc<dyn ObjectStore>,
    remover: Arc<dyn BackgroundRemover>,
    records: Arc<dyn RecordStore>,
    local: Arc<dyn LocalProcessor>,
}

impl Setup {
    fn new(remover: Arc<dyn BackgroundRemover>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            dealers: directory(vec![dealer_x123()]),
            storage: Arc::new(storage_ok()),
            remover,
            records,
            local: Arc::new(PassthroughProcessor),
        }
    }

    fn build(self) -> Workflow {
        Workflow::new(Arc::new(Collaborators {
            dealers: self.dealers,
            storage: self.storage,
            remover: self.remover,
            records: self.records,
            local: self.local,
            poll_policy: PollPolicy::default(),
            removal_options: RemovalOptions::default(),
        }))
    }
}

async fn uploaded(workflow: &Workflow) {
    let snapshot = workflow.verify("X123").await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::AwaitingUpload);
    let snapshot = workflow
        .attach_image(Bytes::from_static(b"\x89PNG photo"), "image/png")
        .await
        .unwrap();
    assert_eq!(snapshot.state, WorkflowState::Uploaded);
}

async fn settled(workflow: &Workflow) -> WorkflowSnapshot {
    let mut rx = workflow.subscribe();
    let snapshot = rx.wait_for(|s| s.state.is_settled()).await.unwrap().clone();
    snapshot
}

#[tokio::test(start_paused = true)]
async fn test_sixth_poll_with_output_reaches_ready() {
    let remover = ScriptedRemover::processing_then(5, Some(with_output("https://provider/out.png")));
    let records = Arc::new(MemoryRecordStore::new());
    let workflow = Setup::new(remover.clone(), records.clone()).build();

    uploaded(&workflow).await;
    let snapshot = workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Polling);
    assert_eq!(snapshot.job_id.as_deref(), Some("J1"));

    let snapshot = settled(&workflow).await;
    assert_eq!(snapshot.state, WorkflowState::Ready);
    assert_eq!(snapshot.output_url.as_deref(), Some("https://provider/out.png"));
    assert_eq!(snapshot.poll_attempts, 6);
    assert_eq!(remover.calls(), 6);

    // Nothing is persisted until the operator confirms.
    assert!(records.is_empty());

    let snapshot = workflow.confirm_save().await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Saved);
    let record_id = snapshot.saved_record_id.unwrap();

    let record = records.get(record_id).await.unwrap().unwrap();
    assert_eq!(record.business_key, "X123");
    assert_eq!(record.image_url, "https://provider/out.png");
    assert_eq!(record.provenance, Provenance::ExternalProvider);
    assert!(record
        .storage_object_id
        .as_deref()
        .is_some_and(|id| id.starts_with(ORIGINALS_FOLDER)));
    assert_eq!(
        record.dealer.and_then(|d| d.dealer_name).as_deref(),
        Some("Nimal Stores")
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_polling_and_freezes_state() {
    let remover = ScriptedRemover::processing_then(0, None);
    let workflow = Setup::new(remover.clone(), Arc::new(MemoryRecordStore::new())).build();

    uploaded(&workflow).await;
    workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();

    let mut rx = workflow.subscribe();
    rx.wait_for(|s| s.poll_attempts >= 2).await.unwrap();

    let snapshot = workflow.cancel();
    assert!(snapshot.state.is_failed_with(FailureKind::Cancelled));
    let calls = remover.calls();

    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(remover.calls(), calls);
    let snapshot = workflow.snapshot();
    assert!(snapshot.state.is_failed_with(FailureKind::Cancelled));
    assert_eq!(snapshot.poll_attempts, calls);
}

#[tokio::test(start_paused = true)]
async fn test_late_poll_response_after_cancel_is_ignored() {
    let remover = Arc::new(ScriptedRemover {
        polls: Mutex::new(VecDeque::from([Ok(with_output("https://provider/out.png"))])),
        poll_delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let workflow = Setup::new(remover.clone(), Arc::new(MemoryRecordStore::new())).build();

    uploaded(&workflow).await;
    workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();

    // The first status check is still waiting on its answer.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(remover.calls(), 1);
    assert_eq!(workflow.snapshot().poll_attempts, 0);

    let snapshot = workflow.cancel();
    assert!(snapshot.state.is_failed_with(FailureKind::Cancelled));

    tokio::time::sleep(Duration::from_secs(60)).await;

    let snapshot = workflow.snapshot();
    assert!(snapshot.state.is_failed_with(FailureKind::Cancelled));
    assert!(snapshot.output_url.is_none());
    assert_eq!(snapshot.poll_attempts, 0);
    assert_eq!(remover.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_never_completing_job_times_out() {
    let remover = ScriptedRemover::processing_then(0, None);
    let workflow = Setup::new(remover.clone(), Arc::new(MemoryRecordStore::new())).build();

    uploaded(&workflow).await;
    let started = tokio::time::Instant::now();
    workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();

    let snapshot = settled(&workflow).await;
    let elapsed = started.elapsed();

    assert!(snapshot.state.is_failed_with(FailureKind::ProcessingTimeout));
    assert_eq!(remover.calls(), 30);
    assert!(elapsed >= Duration::from_secs(290), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(310), "elapsed {elapsed:?}");
    assert_eq!(
        snapshot.state.failure().map(|f| f.category),
        Some(ErrorCategory::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn test_provider_reported_failure() {
    let remover = ScriptedRemover::processing_then(
        2,
        Some(JobState {
            status: JobStatus::Failed,
            output_url: None,
            status_text: Some("failed".to_string()),
        }),
    );
    let workflow = Setup::new(remover.clone(), Arc::new(MemoryRecordStore::new())).build();

    uploaded(&workflow).await;
    workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();

    let snapshot = settled(&workflow).await;
    assert!(snapshot.state.is_failed_with(FailureKind::ProcessingFailed));
    assert_eq!(remover.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_status_check_error_fails_workflow() {
    let remover = ScriptedRemover::processing_then(1, None);
    remover
        .polls
        .lock()
        .push_back(Err(RemoverError::StatusCheckFailed("connection reset".to_string())));
    let workflow = Setup::new(remover.clone(), Arc::new(MemoryRecordStore::new())).build();

    uploaded(&workflow).await;
    workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();

    let snapshot = settled(&workflow).await;
    let failure = snapshot.state.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::StatusCheckFailed);
    assert!(failure.cause.as_deref().unwrap().contains("connection reset"));
    assert_eq!(remover.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_submission() {
    let remover = ScriptedRemover::processing_then(0, None);
    *remover.submit_error.lock() = Some(RemoverError::SubmissionRejected("bad key".to_string()));
    let workflow = Setup::new(remover.clone(), Arc::new(MemoryRecordStore::new())).build();

    uploaded(&workflow).await;
    let snapshot = workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();

    assert!(snapshot.state.is_failed_with(FailureKind::SubmissionRejected));
    assert!(!snapshot.busy);
    assert_eq!(remover.calls(), 0);

    // The uploaded original survives, so processing can be retried.
    let snapshot = workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Polling);
}

#[tokio::test(start_paused = true)]
async fn test_second_start_while_polling_is_ignored() {
    let remover = ScriptedRemover::processing_then(0, None);
    let workflow = Setup::new(remover.clone(), Arc::new(MemoryRecordStore::new())).build();

    uploaded(&workflow).await;
    workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();
    let snapshot = workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();

    assert_eq!(snapshot.state, WorkflowState::Polling);
    assert_eq!(remover.submits.load(Ordering::SeqCst), 1);
    workflow.cancel();
}

#[tokio::test]
async fn test_unknown_dealer_touches_nothing() {
    // Mocks without expectations panic on any call.
    let records = MockRecordStore::new();
    let mut setup = Setup::new(ScriptedRemover::processing_then(0, None), Arc::new(records));
    setup.storage = Arc::new(MockObjectStore::new());
    let workflow = setup.build();

    let snapshot = workflow.verify("Z999").await.unwrap();

    let failure = snapshot.state.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::DealerNotAvailable);
    assert_eq!(failure.category, ErrorCategory::NotFound);
    assert_eq!(snapshot.status_message.as_deref(), Some("dealer not available"));
    assert!(snapshot.dealer.is_none());
    assert!(!snapshot.busy);

    let err = workflow
        .attach_image(Bytes::from_static(b"img"), "image/png")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_registry_outage_is_lookup_unavailable() {
    let mut source = MockDealerSource::new();
    source
        .expect_fetch()
        .returning(|| Err(DealerError::LookupUnavailable("timeout".to_string())));
    let mut setup = Setup::new(
        ScriptedRemover::processing_then(0, None),
        Arc::new(MockRecordStore::new()),
    );
    setup.dealers = Arc::new(DealerDirectory::new(
        Arc::new(source),
        Arc::new(SystemClock),
        Duration::from_secs(300),
    ));
    let workflow = setup.build();

    let snapshot = workflow.verify("X123").await.unwrap();
    assert!(snapshot.state.is_failed_with(FailureKind::LookupUnavailable));
}

#[tokio::test]
async fn test_existing_record_is_advisory() {
    let records = Arc::new(MemoryRecordStore::new());
    let earlier = records
        .insert(NewRecord {
            business_key: "X123".to_string(),
            image_url: "https://cdn.test/earlier.png".to_string(),
            original_image_url: None,
            storage_object_id: None,
            provenance: Provenance::Manual,
            dealer: None,
        })
        .await
        .unwrap();
    let workflow = Setup::new(ScriptedRemover::processing_then(0, None), records).build();

    let snapshot = workflow.verify("  x123 ").await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::AwaitingUpload);
    assert_eq!(snapshot.business_key.as_deref(), Some("X123"));
    assert_eq!(
        snapshot.existing_record.as_ref().map(|r| r.record_id),
        Some(earlier)
    );

    let snapshot = workflow
        .attach_image(Bytes::from_static(b"\x89PNG photo"), "image/png")
        .await
        .unwrap();
    assert_eq!(snapshot.state, WorkflowState::Uploaded);
}

#[tokio::test]
async fn test_duplicate_check_outage_does_not_block() {
    let mut records = MockRecordStore::new();
    records
        .expect_find_most_recent_by_key()
        .returning(|_| Err(RecordStoreError::Unavailable("db down".to_string())));
    let workflow = Setup::new(ScriptedRemover::processing_then(0, None), Arc::new(records)).build();

    let snapshot = workflow.verify("X123").await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::AwaitingUpload);
    assert!(snapshot.existing_record.is_none());
}

#[tokio::test]
async fn test_failed_upload() {
    let mut storage = MockObjectStore::new();
    storage
        .expect_store()
        .returning(|_, _, _, _| Err(StorageError::Unavailable("503".to_string())));
    let mut setup = Setup::new(
        ScriptedRemover::processing_then(0, None),
        Arc::new(MemoryRecordStore::new()),
    );
    setup.storage = Arc::new(storage);
    let workflow = setup.build();

    workflow.verify("X123").await.unwrap();
    let snapshot = workflow
        .attach_image(Bytes::from_static(b"img"), "image/jpeg")
        .await
        .unwrap();

    assert!(snapshot.state.is_failed_with(FailureKind::UploadFailed));
    assert!(snapshot.original_image_url.is_none());
    assert_eq!(
        workflow
            .start_processing(ProcessingMode::Provider, None)
            .await
            .unwrap_err(),
        WorkflowError::InvalidTransition {
            action: "start processing",
            state: "failed (upload failed: Object storage unavailable: 503)".to_string(),
        }
    );
}

#[tokio::test]
async fn test_save_failure_keeps_result_for_retry() {
    let mut records = MockRecordStore::new();
    let mut seq = mockall::Sequence::new();
    records
        .expect_find_most_recent_by_key()
        .returning(|_| Ok(None));
    records
        .expect_insert()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(RecordStoreError::Unavailable("db down".to_string())));
    records
        .expect_insert()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|r| r.provenance == Provenance::LocalModel && r.business_key == "X123")
        .returning(|_| Ok(Uuid::nil()));
    let workflow = Setup::new(ScriptedRemover::processing_then(0, None), Arc::new(records)).build();

    uploaded(&workflow).await;
    let snapshot = workflow.start_processing(ProcessingMode::Local, None).await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Ready);
    let output = snapshot.output_url.clone();

    let snapshot = workflow.confirm_save().await.unwrap();
    assert!(snapshot.state.is_failed_with(FailureKind::SaveFailed));
    assert_eq!(snapshot.output_url, output);

    let snapshot = workflow.confirm_save().await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Saved);
    assert_eq!(snapshot.saved_record_id, Some(Uuid::nil()));
}

#[tokio::test]
async fn test_local_mode_stores_preview() {
    let records = Arc::new(MemoryRecordStore::new());
    let workflow = Setup::new(ScriptedRemover::processing_then(0, None), records.clone()).build();

    uploaded(&workflow).await;
    let snapshot = workflow.start_processing(ProcessingMode::Local, None).await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Ready);
    assert!(snapshot
        .output_url
        .as_deref()
        .is_some_and(|u| u.contains(PREVIEW_FOLDER)));

    let snapshot = workflow.confirm_save().await.unwrap();
    let record = records.get(snapshot.saved_record_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.provenance, Provenance::LocalModel);
    assert!(record
        .storage_object_id
        .as_deref()
        .is_some_and(|id| id.starts_with(PREVIEW_FOLDER)));
}

#[tokio::test]
async fn test_local_model_error() {
    let mut local = MockLocalProcessor::new();
    local
        .expect_process()
        .returning(|_| Err(ProcessorError::Failed("model crashed".to_string())));
    let mut setup = Setup::new(
        ScriptedRemover::processing_then(0, None),
        Arc::new(MemoryRecordStore::new()),
    );
    setup.local = Arc::new(local);
    let workflow = setup.build();

    uploaded(&workflow).await;
    let snapshot = workflow.start_processing(ProcessingMode::Local, None).await.unwrap();
    assert!(snapshot.state.is_failed_with(FailureKind::ProcessingFailed));
}

#[tokio::test(start_paused = true)]
async fn test_reset_discards_in_flight_job() {
    let remover = ScriptedRemover::processing_then(3, Some(with_output("https://provider/out.png")));
    let workflow = Setup::new(remover.clone(), Arc::new(MemoryRecordStore::new())).build();

    uploaded(&workflow).await;
    workflow.start_processing(ProcessingMode::Provider, None).await.unwrap();

    let snapshot = workflow.reset();
    assert_eq!(snapshot.state, WorkflowState::Idle);
    assert!(snapshot.business_key.is_none());

    tokio::time::sleep(Duration::from_secs(120)).await;
    let snapshot = workflow.snapshot();
    assert_eq!(snapshot.state, WorkflowState::Idle);
    assert!(snapshot.output_url.is_none());
    assert!(remover.calls() <= 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_verify_does_not_wedge_workflow() {
    let mut setup = Setup::new(
        ScriptedRemover::processing_then(0, None),
        Arc::new(MemoryRecordStore::new()),
    );
    setup.dealers = Arc::new(DealerDirectory::new(
        Arc::new(StalledDealers),
        Arc::new(SystemClock),
        Duration::from_secs(300),
    ));
    let workflow = setup.build();

    let verify = tokio::time::timeout(Duration::from_secs(1), workflow.verify("X123")).await;
    assert!(verify.is_err());

    let snapshot = workflow.snapshot();
    assert!(!snapshot.busy);
    let failure = snapshot.state.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::LookupUnavailable);
    assert_eq!(failure.cause.as_deref(), Some("interrupted"));

    // A fresh attempt is accepted and reaches the registry again.
    let retry = tokio::time::timeout(Duration::from_secs(1), workflow.verify("X123")).await;
    assert!(retry.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_upload_fails_and_allows_retry() {
    let mut setup = Setup::new(
        ScriptedRemover::processing_then(0, None),
        Arc::new(MemoryRecordStore::new()),
    );
    setup.storage = Arc::new(StalledStorage);
    let workflow = setup.build();

    workflow.verify("X123").await.unwrap();
    let upload = tokio::time::timeout(
        Duration::from_secs(1),
        workflow.attach_image(Bytes::from_static(b"img"), "image/png"),
    )
    .await;
    assert!(upload.is_err());

    let snapshot = workflow.snapshot();
    assert!(snapshot.state.is_failed_with(FailureKind::UploadFailed));
    assert!(!snapshot.busy);
    assert!(snapshot.dealer.is_some());

    // Not rejected as an invalid transition: the retry reaches storage again.
    let retry = tokio::time::timeout(
        Duration::from_secs(1),
        workflow.attach_image(Bytes::from_static(b"img"), "image/png"),
    )
    .await;
    assert!(retry.is_err());
}

#[tokio::test]
async fn test_cancel_stops_local_model() {
    let model = Arc::new(StalledModel::default());
    let mut setup = Setup::new(
        ScriptedRemover::processing_then(0, None),
        Arc::new(MemoryRecordStore::new()),
    );
    setup.local = model.clone();
    let workflow = Arc::new(setup.build());

    uploaded(&workflow).await;
    let processing = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.start_processing(ProcessingMode::Local, None).await }
    });

    model.started.notified().await;
    let snapshot = workflow.cancel();
    assert!(snapshot.state.is_failed_with(FailureKind::Cancelled));

    let snapshot = tokio::time::timeout(Duration::from_secs(5), processing)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(snapshot.state.is_failed_with(FailureKind::Cancelled));
    assert!(snapshot.output_url.is_none());
    assert!(model.dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_commands_out_of_order_are_rejected() {
    let workflow = Setup::new(
        ScriptedRemover::processing_then(0, None),
        Arc::new(MemoryRecordStore::new()),
    )
    .build();

    assert!(matches!(
        workflow.verify("   ").await,
        Err(WorkflowError::Validation(_))
    ));
    assert!(matches!(
        workflow.confirm_save().await,
        Err(WorkflowError::InvalidTransition { action: "save", .. })
    ));
    assert!(matches!(
        workflow.start_processing(ProcessingMode::Provider, None).await,
        Err(WorkflowError::InvalidTransition { .. })
    ));

    // Nothing in flight: cancel leaves the state alone.
    assert_eq!(workflow.cancel().state, WorkflowState::Idle);
}

#[test]
fn test_state_serializes_with_failure() {
    let state = WorkflowState::Failed(Failure::new(FailureKind::ProcessingTimeout, None));
    let json = serde_json::to_value(&state).unwrap();
    assert_eq!(json["name"], "failed");
    assert_eq!(json["failure"]["kind"], "processing_timeout");
    assert_eq!(json["failure"]["message"], "processing timeout");

    let json = serde_json::to_value(WorkflowState::Ready).unwrap();
    assert_eq!(json["name"], "ready");
}
