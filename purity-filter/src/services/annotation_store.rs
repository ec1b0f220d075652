//! Annotation cache store
//!
//! Classification results keyed by image reference, shared across all
//! licenses. The store never deduplicates on write; when several rows exist
//! for one reference the oldest row wins on lookup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use purity_common::db::ImageAnnotation;
use purity_common::retry::retry_on_lock;
use purity_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Bound parameters per lookup statement
const LOOKUP_CHUNK: usize = 500;

/// Persistent cache of classification results
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// At most one record per known reference, in the order of `references`.
    /// Unknown references are simply absent from the result.
    async fn find_by_references(&self, references: &[String]) -> Result<Vec<ImageAnnotation>>;

    /// Persist records in one transaction. Empty input is a no-op.
    async fn insert_all(&self, records: &[ImageAnnotation]) -> Result<()>;

    /// Remove every record for `reference`, returning the number removed
    async fn delete_by_reference(&self, reference: &str) -> Result<u64>;
}

/// Keep the first record seen for each reference and order by `references`
fn first_match_in_order(
    references: &[String],
    rows: impl IntoIterator<Item = ImageAnnotation>,
) -> Vec<ImageAnnotation> {
    let mut by_uri: HashMap<String, ImageAnnotation> = HashMap::new();
    for record in rows {
        by_uri.entry(record.uri.clone()).or_insert(record);
    }

    references
        .iter()
        .filter_map(|reference| by_uri.remove(reference))
        .collect()
}

/// SQLite-backed store
pub struct SqliteAnnotationStore {
    pool: SqlitePool,
    lock_wait_ms: u64,
}

impl SqliteAnnotationStore {
    pub fn new(pool: SqlitePool, lock_wait_ms: u64) -> Self {
        Self { pool, lock_wait_ms }
    }
}

fn row_to_annotation(row: &SqliteRow) -> Result<ImageAnnotation> {
    let date_added: String = row.try_get("date_added")?;
    let date_added = DateTime::parse_from_rfc3339(&date_added)
        .map_err(|e| Error::Internal(format!("Invalid date_added '{}': {}", date_added, e)))?
        .with_timezone(&Utc);

    Ok(ImageAnnotation {
        hash: row.try_get("hash")?,
        uri: row.try_get("uri")?,
        error: row.try_get("error")?,
        date_added,
        adult: row.try_get("adult")?,
        spoof: row.try_get("spoof")?,
        medical: row.try_get("medical")?,
        violence: row.try_get("violence")?,
        racy: row.try_get("racy")?,
    })
}

#[async_trait]
impl AnnotationStore for SqliteAnnotationStore {
    async fn find_by_references(&self, references: &[String]) -> Result<Vec<ImageAnnotation>> {
        if references.is_empty() {
            return Err(Error::InvalidInput(
                "at least one image reference is required".to_string(),
            ));
        }

        let mut rows = Vec::new();
        for chunk in references.chunks(LOOKUP_CHUNK) {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT hash, uri, error, date_added, adult, spoof, medical, violence, racy \
                 FROM image_annotations WHERE uri IN (",
            );
            let mut separated = query.separated(", ");
            for reference in chunk {
                separated.push_bind(reference);
            }
            separated.push_unseparated(") ORDER BY id ASC");

            for row in query.build().fetch_all(&self.pool).await? {
                rows.push(row_to_annotation(&row)?);
            }
        }

        let found = first_match_in_order(references, rows);
        tracing::debug!(
            requested = references.len(),
            found = found.len(),
            "Annotation cache lookup"
        );
        Ok(found)
    }

    async fn insert_all(&self, records: &[ImageAnnotation]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        retry_on_lock("insert_annotations", self.lock_wait_ms, || {
            let pool = self.pool.clone();
            async move {
                let mut tx = pool.begin().await?;
                for record in records {
                    sqlx::query(
                        r#"
                        INSERT INTO image_annotations
                            (hash, uri, error, date_added, adult, spoof, medical, violence, racy)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&record.hash)
                    .bind(&record.uri)
                    .bind(&record.error)
                    .bind(record.date_added.to_rfc3339())
                    .bind(record.adult)
                    .bind(record.spoof)
                    .bind(record.medical)
                    .bind(record.violence)
                    .bind(record.racy)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok::<(), Error>(())
            }
        })
        .await?;

        tracing::debug!(count = records.len(), "Cached new annotations");
        Ok(())
    }

    async fn delete_by_reference(&self, reference: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM image_annotations WHERE uri = ?")
            .bind(reference)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// In-process store for tests and local runs
#[derive(Default)]
pub struct MemoryAnnotationStore {
    records: RwLock<Vec<ImageAnnotation>>,
}

impl MemoryAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored rows, duplicates included
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl AnnotationStore for MemoryAnnotationStore {
    async fn find_by_references(&self, references: &[String]) -> Result<Vec<ImageAnnotation>> {
        if references.is_empty() {
            return Err(Error::InvalidInput(
                "at least one image reference is required".to_string(),
            ));
        }

        let records = self.records.read().await;
        Ok(first_match_in_order(references, records.iter().cloned()))
    }

    async fn insert_all(&self, records: &[ImageAnnotation]) -> Result<()> {
        self.records.write().await.extend_from_slice(records);
        Ok(())
    }

    async fn delete_by_reference(&self, reference: &str) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.uri != reference);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use purity_common::db::{create_schema, SafeSearchScores};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    fn annotation(uri: &str, adult: i16) -> ImageAnnotation {
        ImageAnnotation::new(
            uri,
            SafeSearchScores { adult, ..Default::default() },
            None,
        )
    }

    fn refs(uris: &[&str]) -> Vec<String> {
        uris.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn test_sqlite_insert_and_find() {
        let store = SqliteAnnotationStore::new(memory_pool().await, 1000);
        let mut errored = annotation("https://img/b.png", 0);
        errored.error = Some("image not reachable".to_string());

        store
            .insert_all(&[annotation("https://img/a.png", 4), errored.clone()])
            .await
            .unwrap();

        let found = store
            .find_by_references(&refs(&["https://img/b.png", "https://img/missing.png", "https://img/a.png"]))
            .await
            .unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].uri, "https://img/b.png");
        assert_eq!(found[0].error.as_deref(), Some("image not reachable"));
        assert_eq!(found[1].uri, "https://img/a.png");
        assert_eq!(found[1].adult, 4);
        assert_eq!(found[0], errored);
    }

    #[tokio::test]
    async fn test_sqlite_duplicates_return_first_row() {
        let store = SqliteAnnotationStore::new(memory_pool().await, 1000);
        store.insert_all(&[annotation("https://img/a.png", 1)]).await.unwrap();
        store.insert_all(&[annotation("https://img/a.png", 5)]).await.unwrap();

        let found = store.find_by_references(&refs(&["https://img/a.png"])).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].adult, 1);
    }

    #[tokio::test]
    async fn test_sqlite_empty_lookup_is_invalid_input() {
        let store = SqliteAnnotationStore::new(memory_pool().await, 1000);

        let result = store.find_by_references(&[]).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_sqlite_empty_insert_is_noop() {
        let store = SqliteAnnotationStore::new(memory_pool().await, 1000);

        store.insert_all(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_lookup_spans_chunks() {
        let store = SqliteAnnotationStore::new(memory_pool().await, 1000);
        let uris: Vec<String> = (0..LOOKUP_CHUNK + 20)
            .map(|i| format!("https://img/{}.png", i))
            .collect();
        let records: Vec<ImageAnnotation> = uris.iter().map(|u| annotation(u, 2)).collect();
        store.insert_all(&records).await.unwrap();

        let found = store.find_by_references(&uris).await.unwrap();

        assert_eq!(found.len(), uris.len());
        assert_eq!(found.last().unwrap().uri, *uris.last().unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_delete_by_reference() {
        let store = SqliteAnnotationStore::new(memory_pool().await, 1000);
        store
            .insert_all(&[annotation("https://img/a.png", 1), annotation("https://img/a.png", 2), annotation("https://img/b.png", 3)])
            .await
            .unwrap();

        assert_eq!(store.delete_by_reference("https://img/a.png").await.unwrap(), 2);
        assert_eq!(store.delete_by_reference("https://img/a.png").await.unwrap(), 0);
        assert_eq!(store.find_by_references(&refs(&["https://img/b.png"])).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_matches_sqlite_semantics() {
        let store = MemoryAnnotationStore::new();
        store.insert_all(&[annotation("https://img/a.png", 1)]).await.unwrap();
        store.insert_all(&[annotation("https://img/a.png", 5)]).await.unwrap();

        let found = store.find_by_references(&refs(&["https://img/x.png", "https://img/a.png"])).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].adult, 1);
        assert!(matches!(store.find_by_references(&[]).await, Err(Error::InvalidInput(_))));
        assert_eq!(store.delete_by_reference("https://img/a.png").await.unwrap(), 2);
        assert!(store.is_empty().await);
    }
}
