//! Append-only detection history and per-species counters.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::model::{
    AggregateCounter, DetectionId, DetectionRecord, Locale, SpeciesId, StorageReference,
    UnixTimeMs,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS detections (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    species_id TEXT,
    raw_label TEXT NOT NULL,
    confidence REAL NOT NULL,
    probabilities TEXT NOT NULL,
    storage_tier TEXT,
    url_or_path TEXT,
    image_digest TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    locale_used TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_detections_created ON detections(created_at DESC);
CREATE TABLE IF NOT EXISTS species_counters (
    species_id TEXT PRIMARY KEY,
    detection_count INTEGER NOT NULL,
    last_detected_at INTEGER NOT NULL
);
";

const DETECTION_COLUMNS: &str = "id, species_id, raw_label, confidence, probabilities, \
     storage_tier, url_or_path, image_digest, created_at, locale_used";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupted row: {0}")]
    Corrupted(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store task aborted")]
    Aborted,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupted(e.to_string())
    }
}

#[async_trait]
pub trait DetectionStore: Send + Sync {
    async fn insert(&self, record: &DetectionRecord) -> Result<(), StoreError>;

    /// Atomic increment-on-key. Creates the counter on first use.
    async fn increment_counter(
        &self,
        species_id: &SpeciesId,
        at: UnixTimeMs,
    ) -> Result<AggregateCounter, StoreError>;

    async fn get(&self, id: &DetectionId) -> Result<Option<DetectionRecord>, StoreError>;

    /// Newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<DetectionRecord>, StoreError>;

    /// Highest count first, ties by species id.
    async fn counters(&self) -> Result<Vec<AggregateCounter>, StoreError>;

    async fn counter(&self, species_id: &SpeciesId) -> Result<Option<AggregateCounter>, StoreError>;
}

// ============================================================================
// SQLite
// ============================================================================

#[derive(Clone)]
pub struct SqliteDetectionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDetectionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupted(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        debug!("detection store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|_| StoreError::Aborted)?
    }
}

fn tier_columns(reference: &StorageReference) -> (Option<&'static str>, Option<String>) {
    match reference {
        StorageReference::Remote { url } => (Some("remote"), Some(url.clone())),
        StorageReference::Local { path } => (Some("local"), Some(path.clone())),
        StorageReference::None => (None, None),
    }
}

fn reference_from_columns(
    tier: Option<String>,
    url_or_path: Option<String>,
) -> Result<StorageReference, StoreError> {
    match (tier.as_deref(), url_or_path) {
        (Some("remote"), Some(url)) => Ok(StorageReference::Remote { url }),
        (Some("local"), Some(path)) => Ok(StorageReference::Local { path }),
        (None, _) => Ok(StorageReference::None),
        (Some(other), _) => Err(StoreError::Corrupted(format!("storage tier {other:?}"))),
    }
}

struct DetectionRow {
    id: String,
    species_id: Option<String>,
    raw_label: String,
    confidence: f64,
    probabilities: String,
    storage_tier: Option<String>,
    url_or_path: Option<String>,
    image_digest: String,
    created_at: i64,
    locale_used: String,
}

impl DetectionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            species_id: row.get(1)?,
            raw_label: row.get(2)?,
            confidence: row.get(3)?,
            probabilities: row.get(4)?,
            storage_tier: row.get(5)?,
            url_or_path: row.get(6)?,
            image_digest: row.get(7)?,
            created_at: row.get(8)?,
            locale_used: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<DetectionRecord, StoreError> {
        let locale_used = Locale::parse(&self.locale_used)
            .ok_or_else(|| StoreError::Corrupted(format!("locale {:?}", self.locale_used)))?;

        Ok(DetectionRecord {
            id: DetectionId(self.id),
            species_id: self.species_id.map(SpeciesId::new),
            raw_label: self.raw_label,
            confidence: self.confidence as f32,
            probabilities: serde_json::from_str(&self.probabilities)?,
            image_reference: reference_from_columns(self.storage_tier, self.url_or_path)?,
            image_digest: self.image_digest,
            created_at: UnixTimeMs(u64::try_from(self.created_at).unwrap_or_default()),
            locale_used,
        })
    }
}

fn read_counter(row: &Row<'_>) -> rusqlite::Result<AggregateCounter> {
    let species_id: String = row.get(0)?;
    let count: i64 = row.get(1)?;
    let last: i64 = row.get(2)?;
    Ok(AggregateCounter {
        species_id: SpeciesId::new(species_id),
        detection_count: u64::try_from(count).unwrap_or_default(),
        last_detected_at: UnixTimeMs(u64::try_from(last).unwrap_or_default()),
    })
}

fn to_sql_time(at: UnixTimeMs) -> i64 {
    i64::try_from(at.0).unwrap_or(i64::MAX)
}

#[async_trait]
impl DetectionStore for SqliteDetectionStore {
    #[instrument(skip(self, record), fields(detection_id = %record.id))]
    async fn insert(&self, record: &DetectionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        let probabilities = serde_json::to_string(&record.probabilities)?;

        self.with_conn(move |conn| {
            let (tier, url_or_path) = tier_columns(&record.image_reference);
            conn.execute(
                "INSERT INTO detections (id, species_id, raw_label, confidence, probabilities, \
                 storage_tier, url_or_path, image_digest, created_at, locale_used) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id.as_str(),
                    record.species_id.as_ref().map(SpeciesId::as_str),
                    record.raw_label,
                    f64::from(record.confidence),
                    probabilities,
                    tier,
                    url_or_path,
                    record.image_digest,
                    to_sql_time(record.created_at),
                    record.locale_used.as_str(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(species_id = %species_id))]
    async fn increment_counter(
        &self,
        species_id: &SpeciesId,
        at: UnixTimeMs,
    ) -> Result<AggregateCounter, StoreError> {
        let species_id = species_id.clone();
        self.with_conn(move |conn| {
            let counter = conn.query_row(
                "INSERT INTO species_counters (species_id, detection_count, last_detected_at) \
                 VALUES (?1, 1, ?2) \
                 ON CONFLICT(species_id) DO UPDATE SET \
                 detection_count = detection_count + 1, \
                 last_detected_at = MAX(last_detected_at, excluded.last_detected_at) \
                 RETURNING species_id, detection_count, last_detected_at",
                params![species_id.as_str(), to_sql_time(at)],
                read_counter,
            )?;
            Ok(counter)
        })
        .await
    }

    async fn get(&self, id: &DetectionId) -> Result<Option<DetectionRecord>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {DETECTION_COLUMNS} FROM detections WHERE id = ?1"),
                params![id.as_str()],
                DetectionRow::read,
            )
            .optional()?
            .map(DetectionRow::into_record)
            .transpose()
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DetectionRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DETECTION_COLUMNS} FROM detections \
                 ORDER BY created_at DESC, seq DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit], DetectionRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(DetectionRow::into_record).collect()
        })
        .await
    }

    async fn counters(&self) -> Result<Vec<AggregateCounter>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT species_id, detection_count, last_detected_at FROM species_counters \
                 ORDER BY detection_count DESC, species_id ASC",
            )?;
            let counters = stmt
                .query_map([], read_counter)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(counters)
        })
        .await
    }

    async fn counter(&self, species_id: &SpeciesId) -> Result<Option<AggregateCounter>, StoreError> {
        let species_id = species_id.clone();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT species_id, detection_count, last_detected_at FROM species_counters \
                     WHERE species_id = ?1",
                    params![species_id.as_str()],
                    read_counter,
                )
                .optional()?)
        })
        .await
    }
}
