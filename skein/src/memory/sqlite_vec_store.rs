//! SQLite-backed vector store. Persistent with semantic search via sqlite-vec.
//!
//! Dual-table design: `memory_meta` for the payload JSON keyed by record id,
//! a `vec0` virtual table for embeddings sharing the same rowid. Search with a
//! text query embeds it first; KNN distance is converted to a similarity score.
//! rusqlite is synchronous, so every database call runs on the blocking pool and
//! opens its own connection against the stored path.

use std::path::Path;
use std::sync::{Arc, Once};

use async_trait::async_trait;
use rusqlite::params;

use super::embedder::Embedder;
use super::record::RecordPayload;
use super::store::{SearchHit, SearchQuery, StoreError, StoredVector, VectorStore};

static SQLITE_VEC_INIT: Once = Once::new();

fn vector_to_json(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|f| f.to_string()).collect();
    format!("[{}]", parts.join(","))
}

fn payload_to_json(payload: &RecordPayload) -> Result<String, StoreError> {
    serde_json::to_string(payload).map_err(|e| StoreError::Storage(e.to_string()))
}

fn payload_from_json(json: &str) -> Result<RecordPayload, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Storage(e.to_string()))
}

fn embedding_from_json(json: &str) -> Option<Vec<f32>> {
    serde_json::from_str(json).ok()
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Storage(e.to_string())
}

/// Upserts one entry into both tables under the shared meta rowid.
fn insert_entry(
    conn: &rusqlite::Connection,
    vec_table: &str,
    entry: &StoredVector,
) -> Result<(), StoreError> {
    let payload_json = payload_to_json(&entry.payload)?;
    let vector_json = vector_to_json(&entry.vector);
    conn.execute(
        "INSERT OR REPLACE INTO memory_meta (record_id, payload, embedding) VALUES (?1, ?2, ?3)",
        params![entry.id, payload_json, vector_json],
    )
    .map_err(|e| StoreError::Storage(e.to_string()))?;
    let rowid: i64 = conn
        .query_row(
            "SELECT rowid FROM memory_meta WHERE record_id = ?1",
            params![entry.id],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
    // vec0 has no upsert; delete then insert under the meta rowid.
    conn.execute(
        &format!("DELETE FROM {} WHERE rowid = ?1", vec_table),
        params![rowid],
    )
    .map_err(|e| StoreError::Storage(e.to_string()))?;
    conn.execute(
        &format!(
            "INSERT INTO {} (rowid, embedding) VALUES (?1, ?2)",
            vec_table
        ),
        params![rowid, vector_json],
    )
    .map_err(|e| StoreError::Storage(e.to_string()))?;
    Ok(())
}

/// SQLite-backed [`VectorStore`]. Payloads as JSON in `memory_meta`; embeddings in vec0.
pub struct SqliteVecStore {
    db_path: std::path::PathBuf,
    embedder: Arc<dyn Embedder>,
    vec_table: String,
}

impl SqliteVecStore {
    /// Opens (or creates) the store at `path`. Registers the sqlite-vec extension and
    /// creates the tables if needed.
    pub fn new(path: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self, StoreError> {
        SQLITE_VEC_INIT.call_once(|| unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        });

        let db_path = path.as_ref().to_path_buf();
        let dimension = embedder.dimension();
        let vec_table = "memory_embeddings".to_string();

        let conn = rusqlite::Connection::open(&db_path)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS memory_meta (
                rowid INTEGER PRIMARY KEY,
                record_id TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                embedding TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        let create_vec_sql = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING vec0(embedding float[{}])",
            vec_table, dimension
        );
        conn.execute(&create_vec_sql, [])
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(Self {
            db_path,
            embedder,
            vec_table,
        })
    }

    async fn query_vector(&self, query: SearchQuery) -> Result<Vec<f32>, StoreError> {
        match query {
            SearchQuery::Vector(v) => Ok(v),
            SearchQuery::Text(text) => {
                let vectors = self.embedder.embed(&[&text]).await?;
                vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| StoreError::Embedding("no vector returned".into()))
            }
        }
    }
}

#[async_trait]
impl VectorStore for SqliteVecStore {
    async fn insert(&self, entries: Vec<StoredVector>) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let vec_table = self.vec_table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            for entry in &entries {
                insert_entry(&conn, &vec_table, entry)?;
            }
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn update(
        &self,
        id: &str,
        vector: Vec<f32>,
        payload: RecordPayload,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let db_path = self.db_path.clone();
        let vec_table = self.vec_table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM memory_meta WHERE record_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            if !exists {
                return Err(StoreError::NotFound(id));
            }
            insert_entry(
                &conn,
                &vec_table,
                &StoredVector {
                    id,
                    vector,
                    payload,
                },
            )
        })
        .await
        .map_err(join_error)?
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let db_path = self.db_path.clone();
        let vec_table = self.vec_table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rowid: Option<i64> = conn
                .query_row(
                    "SELECT rowid FROM memory_meta WHERE record_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .ok();
            if let Some(rowid) = rowid {
                conn.execute(
                    &format!("DELETE FROM {} WHERE rowid = ?1", vec_table),
                    params![rowid],
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
                conn.execute("DELETE FROM memory_meta WHERE rowid = ?1", params![rowid])
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
            }
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn get(&self, id: &str) -> Result<Option<SearchHit>, StoreError> {
        let id = id.to_string();
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT payload, embedding FROM memory_meta WHERE record_id = ?1")
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut rows = stmt
                .query(params![id])
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let row = match rows
                .next()
                .map_err(|e| StoreError::Storage(e.to_string()))?
            {
                Some(r) => r,
                None => return Ok::<_, StoreError>(None),
            };
            let payload_json: String =
                row.get(0).map_err(|e| StoreError::Storage(e.to_string()))?;
            let embedding_json: String =
                row.get(1).map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(Some(SearchHit {
                id,
                score: 0.0,
                payload: payload_from_json(&payload_json)?,
                embedding: embedding_from_json(&embedding_json),
            }))
        })
        .await
        .map_err(join_error)?
    }

    async fn search(&self, query: SearchQuery, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        let query_vec = self.query_vector(query).await?;
        let db_path = self.db_path.clone();
        let vec_table = self.vec_table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let sql = format!(
                "SELECT rowid, distance FROM {} WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
                vec_table
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows: Vec<(i64, f64)> = stmt
                .query_map(params![vector_to_json(&query_vec), limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(|e| StoreError::Storage(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| StoreError::Storage(e.to_string()))?;

            let mut hits = Vec::with_capacity(rows.len());
            for (rowid, distance) in rows {
                let (record_id, payload_json, embedding_json): (String, String, String) = conn
                    .query_row(
                        "SELECT record_id, payload, embedding FROM memory_meta WHERE rowid = ?1",
                        params![rowid],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                hits.push(SearchHit {
                    id: record_id,
                    score: (1.0 / (1.0 + distance)) as f32,
                    payload: payload_from_json(&payload_json)?,
                    embedding: embedding_from_json(&embedding_json),
                });
            }
            Ok::<_, StoreError>(hits)
        })
        .await
        .map_err(join_error)?
    }

    async fn reset(&self) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let vec_table = self.vec_table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            conn.execute(&format!("DELETE FROM {}", vec_table), [])
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            conn.execute("DELETE FROM memory_meta", [])
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::in_memory_vector_store::tests::MockEmbedder;
    use crate::message::{Content, Role};

    fn payload(text: &str) -> RecordPayload {
        RecordPayload::new(Content::text(text), Role::Assistant, "agent")
    }

    async fn open_store(dir: &tempfile::TempDir) -> SqliteVecStore {
        let embedder = Arc::new(MockEmbedder::new(16));
        SqliteVecStore::new(dir.path().join("mem.db"), embedder).unwrap()
    }

    /// **Scenario**: inserted entries are retrievable by id and by search.
    #[tokio::test]
    async fn insert_get_search_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let embedder = MockEmbedder::new(16);
        let vector = embedder.embed(&["hello world"]).await.unwrap().remove(0);
        store
            .insert(vec![StoredVector {
                id: "r1".into(),
                vector: vector.clone(),
                payload: payload("hello world"),
            }])
            .await
            .unwrap();

        let hit = store.get("r1").await.unwrap().unwrap();
        assert_eq!(hit.payload.data.as_text(), Some("hello world"));

        let hits = store
            .search(SearchQuery::Vector(vector), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "r1");
    }

    /// **Scenario**: update replaces payload in place; delete removes the row.
    #[tokio::test]
    async fn update_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .insert(vec![StoredVector {
                id: "r1".into(),
                vector: vec![0.5; 16],
                payload: payload("old"),
            }])
            .await
            .unwrap();
        store
            .update("r1", vec![0.25; 16], payload("new"))
            .await
            .unwrap();
        let hit = store.get("r1").await.unwrap().unwrap();
        assert_eq!(hit.payload.data.as_text(), Some("new"));

        store.delete("r1").await.unwrap();
        assert!(store.get("r1").await.unwrap().is_none());

        let err = store
            .update("r1", vec![0.0; 16], payload("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    /// **Scenario**: reset leaves the store empty but usable.
    #[tokio::test]
    async fn reset_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .insert(vec![StoredVector {
                id: "r1".into(),
                vector: vec![0.5; 16],
                payload: payload("a"),
            }])
            .await
            .unwrap();
        store.reset().await.unwrap();
        assert!(store.get("r1").await.unwrap().is_none());
        let hits = store
            .search(SearchQuery::Vector(vec![0.5; 16]), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
