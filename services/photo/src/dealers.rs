//! Dealer registry lookup.
//!
//! The registry is a static JSON document (`{"dealers": [...]}`) fetched from a
//! URL or read from disk. It is cached in memory and refreshed on the first
//! lookup after the freshness window elapses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Errors raised by the dealer registry.
#[derive(Debug, Error)]
pub enum DealerError {
    #[error("Dealer lookup unavailable: {0}")]
    LookupUnavailable(String),
}

/// One entry of the dealer registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Dealer {
    #[serde(rename = "AREA", default)]
    pub area: String,
    #[serde(rename = "BP CODE", default, deserialize_with = "lenient_string")]
    pub bp_code: String,
    #[serde(rename = "BP NAME", default)]
    pub bp_name: String,
    #[serde(rename = "OUTLET CODE", default, deserialize_with = "lenient_string")]
    pub outlet_code: String,
    #[serde(rename = "OUTLET NAME", default)]
    pub outlet_name: String,
    #[serde(rename = "CLASSIFICATION", default)]
    pub classification: String,
    #[serde(rename = "DEALER NAME", default)]
    pub dealer_name: String,
    #[serde(rename = "NICNUMBER", default, deserialize_with = "lenient_string")]
    pub nic_number: String,
    #[serde(rename = "CONTACTNO", default, deserialize_with = "lenient_string")]
    pub contact_no: String,
    #[serde(rename = "EVENT DATE", default)]
    pub event_date: String,
    #[serde(rename = "HOTEL", default)]
    pub hotel: String,
}

impl Dealer {
    /// Registry key used for matching.
    pub fn normalized_nic(&self) -> String {
        normalize_key(&self.nic_number)
    }
}

/// Registry document layout
#[derive(Debug, Deserialize)]
struct DealersDocument {
    dealers: Vec<Dealer>,
}

/// Trim and uppercase a business key.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_uppercase()
}

/// Accept strings, numbers or null where the registry is inconsistent.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Parse a registry document.
pub fn parse_dealers(raw: &[u8]) -> Result<Vec<Dealer>, DealerError> {
    serde_json::from_slice::<DealersDocument>(raw)
        .map(|doc| doc.dealers)
        .map_err(|e| DealerError::LookupUnavailable(format!("invalid dealers document: {e}")))
}

/// Time source for cache expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Where the registry is loaded from.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DealerSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Dealer>, DealerError>;
}

/// Registry served over HTTP(S)
pub struct HttpDealerSource {
    client: reqwest::Client,
    url: String,
}

impl HttpDealerSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DealerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DealerError::LookupUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DealerSource for HttpDealerSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<Dealer>, DealerError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| DealerError::LookupUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DealerError::LookupUnavailable(format!(
                "failed to fetch dealers data: {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DealerError::LookupUnavailable(e.to_string()))?;

        parse_dealers(&body)
    }
}

/// Registry stored on the local filesystem
pub struct FileDealerSource {
    path: PathBuf,
}

impl FileDealerSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DealerSource for FileDealerSource {
    async fn fetch(&self) -> Result<Vec<Dealer>, DealerError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            DealerError::LookupUnavailable(format!("{}: {e}", self.path.display()))
        })?;

        parse_dealers(&raw)
    }
}

/// Pick a source implementation from a configured location.
pub fn source_from_location(
    location: &str,
    timeout: Duration,
) -> Result<Arc<dyn DealerSource>, DealerError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Arc::new(HttpDealerSource::new(location, timeout)?))
    } else {
        Ok(Arc::new(FileDealerSource::new(location)))
    }
}

/// Cached registry contents, indexed by normalized NIC.
#[derive(Debug, Clone)]
pub struct DealerCache {
    pub data: Arc<HashMap<String, Dealer>>,
    pub expires_at: DateTime<Utc>,
}

impl DealerCache {
    fn build(dealers: Vec<Dealer>, expires_at: DateTime<Utc>) -> Self {
        let mut index = HashMap::with_capacity(dealers.len());
        for dealer in dealers {
            // First entry wins when the registry lists a NIC twice.
            index.entry(dealer.normalized_nic()).or_insert(dealer);
        }

        Self {
            data: Arc::new(index),
            expires_at,
        }
    }
}

/// Read-through cached dealer lookup.
pub struct DealerDirectory {
    source: Arc<dyn DealerSource>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    cache: RwLock<Option<DealerCache>>,
}

impl DealerDirectory {
    pub fn new(source: Arc<dyn DealerSource>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            source,
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5)),
            cache: RwLock::new(None),
        }
    }

    /// Find the dealer registered under `business_key`.
    #[instrument(skip(self))]
    pub async fn lookup(&self, business_key: &str) -> Result<Option<Dealer>, DealerError> {
        let key = normalize_key(business_key);
        let data = self.current().await?;
        Ok(data.get(&key).cloned())
    }

    /// Number of dealers currently cached.
    pub fn cached_len(&self) -> Option<usize> {
        self.cache.read().as_ref().map(|c| c.data.len())
    }

    async fn current(&self) -> Result<Arc<HashMap<String, Dealer>>, DealerError> {
        let now = self.clock.now();

        let cached = self.cache.read().clone();
        if let Some(cache) = &cached {
            if now < cache.expires_at {
                return Ok(cache.data.clone());
            }
        }

        debug!("Refreshing dealer registry");
        match self.source.fetch().await {
            Ok(dealers) => {
                let fresh = DealerCache::build(dealers, now + self.ttl);
                let data = fresh.data.clone();
                info!(dealers = data.len(), "Dealer registry loaded");
                *self.cache.write() = Some(fresh);
                Ok(data)
            }
            Err(e) => match cached {
                Some(stale) => {
                    warn!(error = %e, "Dealer registry refresh failed, serving stale data");
                    metrics::counter!("photo.dealers.stale_served").increment(1);
                    Ok(stale.data)
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        fn advance(&self, by: Duration) {
            *self.0.lock() += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    fn dealer(nic: &str, name: &str) -> Dealer {
        Dealer {
            nic_number: nic.to_string(),
            dealer_name: name.to_string(),
            area: "Colombo".to_string(),
            classification: "Gold".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_dealers_accepts_numeric_fields() {
        let raw = br#"{"dealers": [{
            "AREA": "Kandy",
            "BP CODE": 1001,
            "BP NAME": "Kandy Traders",
            "OUTLET CODE": "OUT-1",
            "OUTLET NAME": "Main",
            "CLASSIFICATION": "Platinum",
            "DEALER NAME": "A. Perera",
            "NICNUMBER": 199012345678,
            "CONTACTNO": 771234567,
            "EVENT DATE": "2024-03-01",
            "HOTEL": "Queens"
        }]}"#;

        let dealers = parse_dealers(raw).unwrap();
        assert_eq!(dealers.len(), 1);
        assert_eq!(dealers[0].nic_number, "199012345678");
        assert_eq!(dealers[0].bp_code, "1001");
        assert_eq!(dealers[0].dealer_name, "A. Perera");
    }

    #[test]
    fn test_parse_dealers_rejects_garbage() {
        assert!(matches!(
            parse_dealers(b"not json"),
            Err(DealerError::LookupUnavailable(_))
        ));
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  912345678v "), "912345678V");
    }

    #[tokio::test]
    async fn test_lookup_normalizes_both_sides() {
        let mut source = MockDealerSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|| Ok(vec![dealer(" 912345678v", "Silva")]));

        let directory =
            DealerDirectory::new(Arc::new(source), ManualClock::new(), Duration::from_secs(300));

        let found = directory.lookup("912345678V  ").await.unwrap();
        assert_eq!(found.unwrap().dealer_name, "Silva");
        assert!(directory.lookup("000000000V").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_refreshes_after_ttl() {
        let mut source = MockDealerSource::new();
        source
            .expect_fetch()
            .times(2)
            .returning(|| Ok(vec![dealer("X123", "Fernando")]));

        let clock = ManualClock::new();
        let directory =
            DealerDirectory::new(Arc::new(source), clock.clone(), Duration::from_secs(300));

        directory.lookup("X123").await.unwrap();
        clock.advance(Duration::from_secs(299));
        directory.lookup("X123").await.unwrap();
        clock.advance(Duration::from_secs(1));
        directory.lookup("X123").await.unwrap();
    }

    #[tokio::test]
    async fn test_first_fetch_failure_is_loud() {
        let mut source = MockDealerSource::new();
        source
            .expect_fetch()
            .returning(|| Err(DealerError::LookupUnavailable("down".to_string())));

        let directory =
            DealerDirectory::new(Arc::new(source), ManualClock::new(), Duration::from_secs(300));

        assert!(directory.lookup("X123").await.is_err());
        assert!(directory.cached_len().is_none());
    }

    #[tokio::test]
    async fn test_stale_cache_served_when_refresh_fails() {
        let mut source = MockDealerSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![dealer("X123", "Fernando")]));
        source
            .expect_fetch()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|| Err(DealerError::LookupUnavailable("down".to_string())));

        let clock = ManualClock::new();
        let directory =
            DealerDirectory::new(Arc::new(source), clock.clone(), Duration::from_secs(300));

        directory.lookup("X123").await.unwrap();
        clock.advance(Duration::from_secs(600));

        // Stale entries keep answering, and every call retries the refresh.
        assert!(directory.lookup("X123").await.unwrap().is_some());
        assert!(directory.lookup("X123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_source_reads_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dealers.json");
        tokio::fs::write(&path, br#"{"dealers": [{"NICNUMBER": "A1", "DEALER NAME": "Dias"}]}"#)
            .await
            .unwrap();

        let dealers = FileDealerSource::new(&path).fetch().await.unwrap();
        assert_eq!(dealers[0].dealer_name, "Dias");
    }
}
