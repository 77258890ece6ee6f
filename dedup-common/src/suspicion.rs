//! Suspected duplicate pairs and their storage.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while writing suspicions to PostgreSQL.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// Reasons a `SuspicionRecord` cannot be built.
#[derive(Error, Debug, PartialEq)]
pub enum InvalidSuspicion {
    #[error("a customer cannot be a duplicate of itself ({0})")]
    SelfMatch(Uuid),
    #[error("a suspicion needs at least one field comparison")]
    NoComparisons,
}

/// Evidence for one field that matched between the two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    #[serde(rename = "Campo")]
    pub field: String,
    #[serde(rename = "ValorOriginal")]
    pub original_value: String,
    #[serde(rename = "ValorEncontrado")]
    pub found_value: String,
    #[serde(rename = "ScoreCampo")]
    pub field_score: f64,
}

/// Stored as JSONB. Key names match the rows already in the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityDetails {
    #[serde(rename = "Resumo")]
    pub summary: String,
    #[serde(rename = "ComparativoDetalhado")]
    pub comparisons: Vec<FieldComparison>,
    #[serde(rename = "ScoreGlobal")]
    pub global_score: f64,
}

/// A persisted decision that two customers are probably the same. Never updated once written.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspicionRecord {
    pub id: Uuid,
    pub original_id: Uuid,
    pub suspect_id: Uuid,
    pub score: f64,
    pub similarity_details: SimilarityDetails,
    pub detected_at: DateTime<Utc>,
}

impl SuspicionRecord {
    /// Build a suspicion raised while processing `event_id`.
    ///
    /// The id is derived from the event and the suspect, so processing the same event twice
    /// yields the same id and the second insert is a no-op.
    pub fn new(
        event_id: Uuid,
        original_id: Uuid,
        suspect_id: Uuid,
        score: f64,
        similarity_details: SimilarityDetails,
        detected_at: DateTime<Utc>,
    ) -> Result<Self, InvalidSuspicion> {
        if original_id == suspect_id {
            return Err(InvalidSuspicion::SelfMatch(original_id));
        }
        if similarity_details.comparisons.is_empty() {
            return Err(InvalidSuspicion::NoComparisons);
        }

        Ok(Self {
            id: Uuid::new_v5(&event_id, suspect_id.as_bytes()),
            original_id,
            suspect_id,
            score,
            similarity_details,
            detected_at,
        })
    }
}

/// Durable storage for suspicions.
#[async_trait]
pub trait SuspicionStore {
    /// Write every record in a single transaction: either all of them are stored or none.
    /// Records whose id is already stored are skipped. Returns how many rows were inserted.
    async fn insert_all(&self, records: &[SuspicionRecord]) -> Result<u64, PersistenceError>;
}

/// Suspicions raised while processing one event, waiting to be committed together.
#[derive(Debug, Default)]
pub struct PendingSuspicions {
    staged: Vec<SuspicionRecord>,
}

impl PendingSuspicions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, record: SuspicionRecord) {
        self.staged.push(record);
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Commit everything staged in one transaction. The pending set is consumed either way.
    pub async fn commit_all<S>(self, store: &S) -> Result<u64, PersistenceError>
    where
        S: SuspicionStore + Sync + ?Sized,
    {
        store.insert_all(&self.staged).await
    }
}

/// `SuspicionStore` on top of the `Suspeitas_Duplicidade` table.
#[derive(Clone)]
pub struct PgSuspicionStore {
    pool: PgPool,
}

impl PgSuspicionStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| PersistenceError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SuspicionStore for PgSuspicionStore {
    async fn insert_all(&self, records: &[SuspicionRecord]) -> Result<u64, PersistenceError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| PersistenceError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let base_query = r#"
INSERT INTO "Suspeitas_Duplicidade"
    ("id", "idOriginal", "idSuspeito", "score", "detalhesSimilaridade", "dataDeteccao")
VALUES
    ($1, $2, $3, $4, $5, $6)
ON CONFLICT ("id") DO NOTHING
        "#;

        let mut inserted = 0;
        for record in records {
            let result = sqlx::query(base_query)
                .bind(record.id)
                .bind(record.original_id)
                .bind(record.suspect_id)
                .bind(record.score)
                .bind(sqlx::types::Json(&record.similarity_details))
                .bind(record.detected_at)
                .execute(&mut *tx)
                .await
                .map_err(|error| PersistenceError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                })?;
            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|error| PersistenceError::QueryError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn details() -> SimilarityDetails {
        SimilarityDetails {
            summary: "Comparison between new record (A) and existing record (B)".to_owned(),
            comparisons: vec![FieldComparison {
                field: "nome".to_owned(),
                original_value: "João Silva".to_owned(),
                found_value: "João Silva".to_owned(),
                field_score: 5.0,
            }],
            global_score: 5.0,
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl SuspicionStore for RecordingStore {
        async fn insert_all(&self, records: &[SuspicionRecord]) -> Result<u64, PersistenceError> {
            self.calls.lock().unwrap().push(records.len());
            Ok(records.len() as u64)
        }
    }

    #[test]
    fn test_suspicion_id_is_stable_per_event_and_suspect() {
        let event_id = Uuid::new_v4();
        let original = Uuid::new_v4();
        let suspect = Uuid::new_v4();

        let first =
            SuspicionRecord::new(event_id, original, suspect, 5.0, details(), Utc::now()).unwrap();
        let again =
            SuspicionRecord::new(event_id, original, suspect, 5.0, details(), Utc::now()).unwrap();
        let other_event =
            SuspicionRecord::new(Uuid::new_v4(), original, suspect, 5.0, details(), Utc::now())
                .unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other_event.id);
    }

    #[test]
    fn test_suspicion_invariants() {
        let id = Uuid::new_v4();
        assert_eq!(
            SuspicionRecord::new(Uuid::new_v4(), id, id, 5.0, details(), Utc::now()),
            Err(InvalidSuspicion::SelfMatch(id))
        );

        let mut empty = details();
        empty.comparisons.clear();
        assert_eq!(
            SuspicionRecord::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                5.0,
                empty,
                Utc::now()
            ),
            Err(InvalidSuspicion::NoComparisons)
        );
    }

    #[test]
    fn test_details_keep_stored_key_names() {
        let value = serde_json::to_value(details()).unwrap();

        assert_eq!(
            value,
            json!({
                "Resumo": "Comparison between new record (A) and existing record (B)",
                "ComparativoDetalhado": [{
                    "Campo": "nome",
                    "ValorOriginal": "João Silva",
                    "ValorEncontrado": "João Silva",
                    "ScoreCampo": 5.0
                }],
                "ScoreGlobal": 5.0
            })
        );
    }

    #[tokio::test]
    async fn test_pending_suspicions_commit_in_one_call() {
        let store = RecordingStore::default();
        let mut pending = PendingSuspicions::new();
        for _ in 0..3 {
            pending.stage(
                SuspicionRecord::new(
                    Uuid::new_v4(),
                    Uuid::new_v4(),
                    Uuid::new_v4(),
                    6.0,
                    details(),
                    Utc::now(),
                )
                .unwrap(),
            );
        }
        assert_eq!(pending.len(), 3);

        let written = pending.commit_all(&store).await.unwrap();

        assert_eq!(written, 3);
        assert_eq!(*store.calls.lock().unwrap(), vec![3]);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_insert_all_is_idempotent(db: PgPool) {
        let store = PgSuspicionStore::new_from_pool(db);
        let record = SuspicionRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            5.0,
            details(),
            Utc::now(),
        )
        .unwrap();

        let first = store.insert_all(&[record.clone()]).await.unwrap();
        let second = store.insert_all(&[record.clone()]).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);

        let (score, stored): (f64, sqlx::types::Json<SimilarityDetails>) = sqlx::query_as(
            r#"SELECT "score", "detalhesSimilaridade" FROM "Suspeitas_Duplicidade" WHERE "id" = $1"#,
        )
        .bind(record.id)
        .fetch_one(store.pool())
        .await
        .unwrap();

        assert_eq!(score, 5.0);
        assert_eq!(stored.0, record.similarity_details);
    }
}
