//! Saved image records: history, deletion and manual uploads.

use crate::dealers::normalize_key;
use crate::object_store::{ObjectStore, StorageError};
use crate::record_store::{
    DealerSnapshot, NewRecord, ProcessedImageRecord, Provenance, RecordStore, RecordStoreError,
    MAX_LIST_LIMIT,
};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Folder for manual uploads
pub const MANUAL_FOLDER: &str = "background-removal-manual";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Please enter a NIC number")]
    MissingKey,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Records(#[from] RecordStoreError),
}

/// Outcome of a record deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub record: ProcessedImageRecord,
    /// Whether the stored binary went with it
    pub storage_deleted: bool,
}

/// Manual upload payload
#[derive(Debug, Clone)]
pub struct ManualUpload {
    pub business_key: String,
    pub image: Bytes,
    pub content_type: String,
    pub dealer: DealerSnapshot,
}

pub struct ImageCatalog {
    records: Arc<dyn RecordStore>,
    storage: Arc<dyn ObjectStore>,
}

impl ImageCatalog {
    pub fn new(records: Arc<dyn RecordStore>, storage: Arc<dyn ObjectStore>) -> Self {
        Self { records, storage }
    }

    pub async fn get(&self, record_id: Uuid) -> Result<Option<ProcessedImageRecord>, CatalogError> {
        Ok(self.records.get(record_id).await?)
    }

    /// Newest first, optionally for one key
    pub async fn history(
        &self,
        business_key: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<ProcessedImageRecord>, CatalogError> {
        let key = business_key.map(normalize_key).filter(|k| !k.is_empty());
        let limit = limit.unwrap_or(MAX_LIST_LIMIT);
        Ok(self.records.find_all_by_key(key, limit).await?)
    }

    pub async fn latest(&self, business_key: &str) -> Result<Option<ProcessedImageRecord>, CatalogError> {
        let key = normalize_key(business_key);
        if key.is_empty() {
            return Err(CatalogError::MissingKey);
        }
        Ok(self.records.find_most_recent_by_key(&key).await?)
    }

    /// Delete a record and, best effort, its stored binary. `None` when no
    /// record had that id.
    #[instrument(skip(self))]
    pub async fn delete(&self, record_id: Uuid) -> Result<Option<Deletion>, CatalogError> {
        let Some(record) = self.records.get(record_id).await? else {
            return Ok(None);
        };

        let storage_deleted = match &record.storage_object_id {
            Some(object_id) => {
                let deleted = self.storage.delete(object_id).await;
                if !deleted {
                    warn!(record_id = %record_id, object_id = %object_id, "Stored image not deleted, removing record anyway");
                }
                deleted
            }
            None => false,
        };

        if !self.records.delete_by_id(record_id).await? {
            return Ok(None);
        }

        info!(record_id = %record_id, storage_deleted, "Record deleted");
        metrics::counter!("photo.records.deleted").increment(1);

        Ok(Some(Deletion {
            record,
            storage_deleted,
        }))
    }

    /// Store an already processed PNG and record it without processing.
    #[instrument(skip(self, upload), fields(nic = %upload.business_key, size_bytes = upload.image.len()))]
    pub async fn manual_upload(&self, upload: ManualUpload) -> Result<ProcessedImageRecord, CatalogError> {
        let key = normalize_key(&upload.business_key);
        if key.is_empty() {
            return Err(CatalogError::MissingKey);
        }

        let name = format!("{}-manual-{}", key, Utc::now().timestamp_millis());
        let stored = self
            .storage
            .store(upload.image, MANUAL_FOLDER, &name, &upload.content_type)
            .await?;

        let record_id = self
            .records
            .insert(NewRecord {
                business_key: key.clone(),
                image_url: stored.url,
                original_image_url: None,
                storage_object_id: Some(stored.object_id),
                provenance: Provenance::Manual,
                dealer: Some(upload.dealer).filter(|d| !d.is_empty()),
            })
            .await?;

        info!(record_id = %record_id, "Manual upload saved");
        metrics::counter!("photo.records.manual").increment(1);

        self.records.get(record_id).await?.ok_or_else(|| {
            CatalogError::Records(RecordStoreError::Unavailable(format!(
                "record {record_id} missing after insert"
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{MockObjectStore, StoredObject};
    use crate::record_store::MemoryRecordStore;

    async fn seeded(records: &MemoryRecordStore, object_id: Option<&str>) -> Uuid {
        records
            .insert(NewRecord {
                business_key: "X123".to_string(),
                image_url: "https://x/y.png".to_string(),
                original_image_url: None,
                storage_object_id: object_id.map(str::to_string),
                provenance: Provenance::ExternalProvider,
                dealer: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_delete_survives_storage_failure() {
        let records = Arc::new(MemoryRecordStore::new());
        let id = seeded(&records, Some("lightx-temp/temp-1.png")).await;

        let mut storage = MockObjectStore::new();
        storage
            .expect_delete()
            .withf(|id| id == "lightx-temp/temp-1.png")
            .times(1)
            .returning(|_| false);

        let catalog = ImageCatalog::new(records.clone(), Arc::new(storage));
        let deletion = catalog.delete(id).await.unwrap().unwrap();

        assert!(!deletion.storage_deleted);
        assert_eq!(deletion.record.record_id, id);
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_object_skips_storage() {
        let records = Arc::new(MemoryRecordStore::new());
        let id = seeded(&records, None).await;

        let catalog = ImageCatalog::new(records.clone(), Arc::new(MockObjectStore::new()));
        let deletion = catalog.delete(id).await.unwrap().unwrap();
        assert!(!deletion.storage_deleted);

        assert!(catalog.delete(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_upload_records_provenance() {
        let mut storage = MockObjectStore::new();
        storage
            .expect_store()
            .withf(|_, folder, name, content_type| {
                folder == MANUAL_FOLDER && name.starts_with("X123-manual-") && content_type == "image/png"
            })
            .returning(|_, folder, name, _| {
                Ok(StoredObject {
                    url: format!("https://cdn.test/{folder}/{name}.png"),
                    object_id: format!("{folder}/{name}.png"),
                })
            });
        let records = Arc::new(MemoryRecordStore::new());
        let catalog = ImageCatalog::new(records.clone(), Arc::new(storage));

        let record = catalog
            .manual_upload(ManualUpload {
                business_key: " x123".to_string(),
                image: Bytes::from_static(b"\x89PNG\r\n\x1a\n..."),
                content_type: "image/png".to_string(),
                dealer: DealerSnapshot {
                    dealer_name: Some("Nimal Stores".to_string()),
                    area: None,
                    classification: None,
                },
            })
            .await
            .unwrap();

        assert_eq!(record.business_key, "X123");
        assert_eq!(record.provenance, Provenance::Manual);
        assert!(record.original_image_url.is_none());

        let latest = catalog.latest("X123").await.unwrap().unwrap();
        assert_eq!(latest.record_id, record.record_id);
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let records = Arc::new(MemoryRecordStore::new());
        let first = seeded(&records, None).await;
        let second = seeded(&records, None).await;
        let catalog = ImageCatalog::new(records, Arc::new(MockObjectStore::new()));

        let history = catalog.history(Some("x123"), None).await.unwrap();
        let ids: Vec<_> = history.iter().map(|r| r.record_id).collect();
        assert_eq!(ids, vec![second, first]);

        assert!(catalog.history(Some("Z999"), None).await.unwrap().is_empty());
        assert!(matches!(catalog.latest("  ").await, Err(CatalogError::MissingKey)));
    }
}
