use crate::config::DatabaseConfig;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Upper bound for history queries
pub const MAX_LIST_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

impl From<sqlx::Error> for RecordStoreError {
    fn from(e: sqlx::Error) -> Self {
        RecordStoreError::Unavailable(e.to_string())
    }
}

/// How a record's image was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Supplied by the operator, no processing
    Manual,
    /// Produced by the local model (or its stub)
    LocalModel,
    /// Produced by the external removal provider
    ExternalProvider,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Manual => "manual",
            Provenance::LocalModel => "local_model",
            Provenance::ExternalProvider => "external_provider",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Provenance::Manual),
            "local_model" => Some(Provenance::LocalModel),
            "external_provider" => Some(Provenance::ExternalProvider),
            _ => None,
        }
    }
}

/// Dealer fields copied onto a record when it is saved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealerSnapshot {
    pub dealer_name: Option<String>,
    pub area: Option<String>,
    pub classification: Option<String>,
}

impl DealerSnapshot {
    pub fn is_empty(&self) -> bool {
        self.dealer_name.is_none() && self.area.is_none() && self.classification.is_none()
    }
}

impl From<&crate::dealers::Dealer> for DealerSnapshot {
    fn from(d: &crate::dealers::Dealer) -> Self {
        fn non_empty(s: &str) -> Option<String> {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }

        Self {
            dealer_name: non_empty(&d.dealer_name),
            area: non_empty(&d.area),
            classification: non_empty(&d.classification),
        }
    }
}

/// Insert payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub business_key: String,
    pub image_url: String,
    pub original_image_url: Option<String>,
    pub storage_object_id: Option<String>,
    pub provenance: Provenance,
    pub dealer: Option<DealerSnapshot>,
}

/// A stored processed image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedImageRecord {
    pub record_id: Uuid,
    pub business_key: String,
    pub image_url: String,
    pub original_image_url: Option<String>,
    pub storage_object_id: Option<String>,
    pub provenance: Provenance,
    pub dealer: Option<DealerSnapshot>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedImageRecord {
    fn from_new(record_id: Uuid, new: NewRecord, processed_at: DateTime<Utc>) -> Self {
        Self {
            record_id,
            business_key: new.business_key,
            image_url: new.image_url,
            original_image_url: new.original_image_url,
            storage_object_id: new.storage_object_id,
            provenance: new.provenance,
            dealer: new.dealer,
            processed_at,
        }
    }
}

/// Persistence for processed image records.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: NewRecord) -> Result<Uuid, RecordStoreError>;

    /// Newest record for a business key
    async fn find_most_recent_by_key(
        &self,
        business_key: &str,
    ) -> Result<Option<ProcessedImageRecord>, RecordStoreError>;

    /// Newest first, at most [`MAX_LIST_LIMIT`] records
    async fn find_all_by_key(
        &self,
        business_key: Option<String>,
        limit: i64,
    ) -> Result<Vec<ProcessedImageRecord>, RecordStoreError>;

    async fn get(&self, record_id: Uuid) -> Result<Option<ProcessedImageRecord>, RecordStoreError>;

    /// `false` when no record had that id
    async fn delete_by_id(&self, record_id: Uuid) -> Result<bool, RecordStoreError>;

    /// Connectivity check for readiness
    async fn ping(&self) -> Result<(), RecordStoreError>;
}

fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        MAX_LIST_LIMIT
    } else {
        limit.min(MAX_LIST_LIMIT)
    }
}

/// Row layout of `processed_images`
#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    nic: String,
    image_url: String,
    original_image_url: Option<String>,
    storage_object_id: Option<String>,
    provenance: String,
    dealer: Option<serde_json::Value>,
    processed_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for ProcessedImageRecord {
    type Error = RecordStoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let provenance = Provenance::parse(&row.provenance).ok_or_else(|| RecordStoreError::Corrupt {
            id: row.id,
            reason: format!("unknown provenance {:?}", row.provenance),
        })?;

        let dealer = row
            .dealer
            .map(serde_json::from_value::<DealerSnapshot>)
            .transpose()
            .map_err(|e| RecordStoreError::Corrupt {
                id: row.id,
                reason: e.to_string(),
            })?;

        Ok(Self {
            record_id: row.id,
            business_key: row.nic,
            image_url: row.image_url,
            original_image_url: row.original_image_url,
            storage_object_id: row.storage_object_id,
            provenance,
            dealer,
            processed_at: row.processed_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, nic, image_url, original_image_url, storage_object_id,
           provenance, dealer, processed_at
    FROM processed_images
"#;

/// PostgreSQL-backed record store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(nic = %record.business_key))]
    async fn insert(&self, record: NewRecord) -> Result<Uuid, RecordStoreError> {
        let id = Uuid::new_v4();
        let dealer = record
            .dealer
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| RecordStoreError::Unavailable(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO processed_images (
                id, nic, image_url, original_image_url, storage_object_id,
                provenance, dealer, processed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(id)
        .bind(&record.business_key)
        .bind(&record.image_url)
        .bind(&record.original_image_url)
        .bind(&record.storage_object_id)
        .bind(record.provenance.as_str())
        .bind(&dealer)
        .execute(&self.pool)
        .await?;

        debug!(record_id = %id, "Record inserted");
        Ok(id)
    }

    async fn find_most_recent_by_key(
        &self,
        business_key: &str,
    ) -> Result<Option<ProcessedImageRecord>, RecordStoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE nic = $1 ORDER BY processed_at DESC LIMIT 1");

        sqlx::query_as::<_, RecordRow>(&sql)
            .bind(business_key)
            .fetch_optional(&self.pool)
            .await?
            .map(ProcessedImageRecord::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn find_all_by_key(
        &self,
        business_key: Option<String>,
        limit: i64,
    ) -> Result<Vec<ProcessedImageRecord>, RecordStoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE ($1::text IS NULL OR nic = $1) ORDER BY processed_at DESC LIMIT $2"
        );

        sqlx::query_as::<_, RecordRow>(&sql)
            .bind(business_key)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ProcessedImageRecord::try_from)
            .collect()
    }

    async fn get(&self, record_id: Uuid) -> Result<Option<ProcessedImageRecord>, RecordStoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");

        sqlx::query_as::<_, RecordRow>(&sql)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?
            .map(ProcessedImageRecord::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn delete_by_id(&self, record_id: Uuid) -> Result<bool, RecordStoreError> {
        let result = sqlx::query("DELETE FROM processed_images WHERE id = $1")
            .bind(record_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), RecordStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Process-local record store for development and tests
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<ProcessedImageRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Records newest first; later inserts win timestamp ties
    fn newest_first(&self, business_key: Option<&str>) -> Vec<ProcessedImageRecord> {
        let mut matching: Vec<_> = self
            .records
            .read()
            .iter()
            .rev()
            .filter(|r| business_key.map_or(true, |k| r.business_key == k))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        matching
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: NewRecord) -> Result<Uuid, RecordStoreError> {
        let id = Uuid::new_v4();
        self.records
            .write()
            .push(ProcessedImageRecord::from_new(id, record, Utc::now()));
        Ok(id)
    }

    async fn find_most_recent_by_key(
        &self,
        business_key: &str,
    ) -> Result<Option<ProcessedImageRecord>, RecordStoreError> {
        Ok(self.newest_first(Some(business_key)).into_iter().next())
    }

    async fn find_all_by_key(
        &self,
        business_key: Option<String>,
        limit: i64,
    ) -> Result<Vec<ProcessedImageRecord>, RecordStoreError> {
        let mut records = self.newest_first(business_key.as_deref());
        records.truncate(clamp_limit(limit) as usize);
        Ok(records)
    }

    async fn get(&self, record_id: Uuid) -> Result<Option<ProcessedImageRecord>, RecordStoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .find(|r| r.record_id == record_id)
            .cloned())
    }

    async fn delete_by_id(&self, record_id: Uuid) -> Result<bool, RecordStoreError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.record_id != record_id);
        Ok(records.len() < before)
    }

    async fn ping(&self) -> Result<(), RecordStoreError> {
        Ok(())
    }
}
