/// SQLite-backed document store.
///
/// Documents are JSON bodies in a single `documents` table keyed by
/// `(collection, id)`; field filters and partial updates are evaluated by the
/// JSON1 functions bundled with SQLite. Blobs live in their own table.
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use equaforge_core::{BlobRef, Filter, ForgeError, RecordId};

use crate::engine::{Blob, DocumentStore};

static FIELD_PATTERN: Lazy<Regex> =
    Lazy::new(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("static regex")
    });

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
        collection  TEXT NOT NULL,
        id          BLOB NOT NULL,
        body        TEXT NOT NULL,
        UNIQUE (collection, id)
    );
    CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
    CREATE TABLE IF NOT EXISTS blobs (
        id          BLOB PRIMARY KEY,
        name        TEXT NOT NULL,
        data        BLOB NOT NULL,
        created_at  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS store_meta (
        key    TEXT PRIMARY KEY,
        value  TEXT NOT NULL
    );";

pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open record store {:?}", path.as_ref()))?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize record store schema")?;
        info!(path = ?path.as_ref(), "Record store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for tests).
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Translate a filter into a `WHERE` fragment; parameters start at `?{first}`.
fn filter_sql(filter: &Filter, first: usize) -> Result<(String, Vec<SqlValue>), ForgeError> {
    let mut sql = String::new();
    let mut args = Vec::new();
    for (field, value) in filter.clauses() {
        if !FIELD_PATTERN.is_match(field) {
            return Err(ForgeError::read(format!("invalid filter field '{field}'")));
        }
        let path_idx = first + args.len();
        args.push(SqlValue::Text(format!("$.{field}")));
        let value_idx = path_idx + 1;
        let clause = match value {
            Value::Null => format!(" AND json_extract(body, ?{path_idx}) IS NULL"),
            Value::Bool(b) => {
                args.push(SqlValue::Integer(i64::from(*b)));
                format!(" AND json_extract(body, ?{path_idx}) = ?{value_idx}")
            }
            Value::Number(n) => {
                args.push(match n.as_i64() {
                    Some(i) => SqlValue::Integer(i),
                    None => SqlValue::Real(n.as_f64().unwrap_or_default()),
                });
                format!(" AND json_extract(body, ?{path_idx}) = ?{value_idx}")
            }
            Value::String(s) => {
                args.push(SqlValue::Text(s.clone()));
                format!(" AND json_extract(body, ?{path_idx}) = ?{value_idx}")
            }
            composite => {
                args.push(SqlValue::Text(composite.to_string()));
                format!(" AND json_extract(body, ?{path_idx}) = json(?{value_idx})")
            }
        };
        sql.push_str(&clause);
    }
    Ok((sql, args))
}

fn touch(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES ('last_write', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)],
    )?;
    Ok(())
}

fn parse_body(id: Vec<u8>, body: String) -> Result<(RecordId, Value), ForgeError> {
    let id = RecordId::from_slice(&id).map_err(ForgeError::read)?;
    let value = serde_json::from_str(&body).map_err(ForgeError::read)?;
    Ok((id, value))
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn insert(&self, collection: &str, body: Value) -> Result<RecordId, ForgeError> {
        if !body.is_object() {
            return Err(ForgeError::write("document body must be a JSON object"));
        }
        let id = RecordId::generate();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
            params![collection, id.as_bytes().as_slice(), body.to_string()],
        )
        .map_err(ForgeError::write)?;
        touch(&conn).map_err(ForgeError::write)?;
        debug!(collection, id = %id, "Inserted document");
        Ok(id)
    }

    async fn get(&self, collection: &str, id: RecordId) -> Result<Option<Value>, ForgeError> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(ForgeError::read)?;
        body.map(|b| serde_json::from_str(&b).map_err(ForgeError::read))
            .transpose()
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<(RecordId, Value)>, ForgeError> {
        let (clauses, args) = filter_sql(filter, 2)?;
        let sql = format!(
            "SELECT id, body FROM documents WHERE collection = ?1{clauses} ORDER BY seq ASC"
        );
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql).map_err(ForgeError::read)?;
        let params = std::iter::once(SqlValue::Text(collection.to_string())).chain(args);
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(ForgeError::read)?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, body) = row.map_err(ForgeError::read)?;
            documents.push(parse_body(id, body)?);
        }
        Ok(documents)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<usize, ForgeError> {
        let (clauses, args) = filter_sql(filter, 2)?;
        let sql = format!("SELECT COUNT(*) FROM documents WHERE collection = ?1{clauses}");
        let conn = self.conn.lock().await;
        let params = std::iter::once(SqlValue::Text(collection.to_string())).chain(args);
        let count: i64 = conn
            .query_row(&sql, params_from_iter(params), |row| row.get(0))
            .map_err(ForgeError::read)?;
        Ok(count as usize)
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: RecordId,
        patch: Value,
    ) -> Result<bool, ForgeError> {
        if !patch.is_object() {
            return Err(ForgeError::write("update patch must be a JSON object"));
        }
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE documents SET body = json_patch(body, ?1)
                 WHERE collection = ?2 AND id = ?3",
                params![patch.to_string(), collection, id.as_bytes().as_slice()],
            )
            .map_err(ForgeError::write)?;
        if changed > 0 {
            touch(&conn).map_err(ForgeError::write)?;
        }
        Ok(changed > 0)
    }

    async fn update_fields_if(
        &self,
        collection: &str,
        id: RecordId,
        expected: &Filter,
        patch: Value,
    ) -> Result<bool, ForgeError> {
        if !patch.is_object() {
            return Err(ForgeError::write("update patch must be a JSON object"));
        }
        let (clauses, args) = filter_sql(expected, 4)?;
        let sql = format!(
            "UPDATE documents SET body = json_patch(body, ?1)
             WHERE collection = ?2 AND id = ?3{clauses}"
        );
        let params = [
            SqlValue::Text(patch.to_string()),
            SqlValue::Text(collection.to_string()),
            SqlValue::Blob(id.as_bytes().to_vec()),
        ]
        .into_iter()
        .chain(args);
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(&sql, params_from_iter(params))
            .map_err(ForgeError::write)?;
        if changed > 0 {
            touch(&conn).map_err(ForgeError::write)?;
        }
        Ok(changed > 0)
    }

    async fn delete(&self, collection: &str, id: RecordId) -> Result<bool, ForgeError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id.as_bytes().as_slice()],
            )
            .map_err(ForgeError::write)?;
        if changed > 0 {
            touch(&conn).map_err(ForgeError::write)?;
        }
        Ok(changed > 0)
    }

    async fn put_blob(&self, name: &str, data: &[u8]) -> Result<BlobRef, ForgeError> {
        let id = RecordId::generate();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO blobs (id, name, data, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.as_bytes().as_slice(), name, data, Utc::now().to_rfc3339()],
        )
        .map_err(ForgeError::write)?;
        touch(&conn).map_err(ForgeError::write)?;
        debug!(blob = %id, name, bytes = data.len(), "Stored blob");
        Ok(BlobRef(id))
    }

    async fn get_blob(&self, blob: BlobRef) -> Result<Option<Blob>, ForgeError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT name, data FROM blobs WHERE id = ?1",
            params![blob.0.as_bytes().as_slice()],
            |row| {
                Ok(Blob {
                    name: row.get(0)?,
                    data: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(ForgeError::read)
    }

    async fn delete_blob(&self, blob: BlobRef) -> Result<bool, ForgeError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM blobs WHERE id = ?1",
                params![blob.0.as_bytes().as_slice()],
            )
            .map_err(ForgeError::write)?;
        if changed > 0 {
            touch(&conn).map_err(ForgeError::write)?;
        }
        Ok(changed > 0)
    }

    async fn last_write(&self) -> Result<Option<DateTime<Utc>>, ForgeError> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'last_write'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(ForgeError::read)?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(ForgeError::read)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_get_delete() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        let id = store
            .insert("things", json!({"name": "alpha", "n": 1}))
            .await
            .unwrap();
        let body = store.get("things", id).await.unwrap().unwrap();
        assert_eq!(body["name"], "alpha");

        assert!(store.get("other", id).await.unwrap().is_none());
        assert!(store.delete("things", id).await.unwrap());
        assert!(!store.delete("things", id).await.unwrap());
        assert!(store.get("things", id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filters_on_bool_string_and_number() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        for (name, flag, n) in [("a", true, 1), ("b", false, 2), ("c", true, 2)] {
            store
                .insert("things", json!({"name": name, "flag": flag, "n": n}))
                .await
                .unwrap();
        }

        let flagged = Filter::new().eq("flag", true);
        assert_eq!(store.count("things", &flagged).await.unwrap(), 2);

        let both = Filter::new().eq("flag", true).eq("n", 2);
        let found = store.find("things", &both).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1["name"], "c");

        let by_name = Filter::new().eq("name", "b");
        assert_eq!(store.find("things", &by_name).await.unwrap().len(), 1);

        let all = store.find("things", &Filter::new()).await.unwrap();
        let names: Vec<_> = all.iter().map(|(_, v)| v["name"].clone()).collect();
        assert_eq!(names, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn rejects_suspicious_field_names() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        let filter = Filter::new().eq("name') OR 1=1 --", "x");
        assert!(store.find("things", &filter).await.is_err());
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        let id = store
            .insert("things", json!({"name": "a", "flag": false}))
            .await
            .unwrap();

        let changed = store
            .update_fields("things", id, json!({"flag": true, "label": "x^2"}))
            .await
            .unwrap();
        assert!(changed);
        let body = store.get("things", id).await.unwrap().unwrap();
        assert_eq!(body, json!({"name": "a", "flag": true, "label": "x^2"}));

        let missing = store
            .update_fields("things", RecordId::generate(), json!({"flag": true}))
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn conditional_update_checks_current_values() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        let id = store
            .insert("things", json!({"flag": true, "claim": {"token": "first"}}))
            .await
            .unwrap();

        let stale = Filter::new().eq("claim.token", "second");
        let changed = store
            .update_fields_if("things", id, &stale, json!({"flag": false}))
            .await
            .unwrap();
        assert!(!changed);

        let held = Filter::new().eq("flag", true).eq("claim.token", "first");
        let changed = store
            .update_fields_if("things", id, &held, json!({"flag": false, "claim": null}))
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(store.get("things", id).await.unwrap().unwrap(), json!({"flag": false}));

        let unclaimed = Filter::new().eq("claim", Value::Null);
        let changed = store
            .update_fields_if("things", id, &unclaimed, json!({"claim": {"token": "third"}}))
            .await
            .unwrap();
        assert!(changed);
        assert!(!store
            .update_fields_if("things", id, &unclaimed, json!({"claim": {"token": "fourth"}}))
            .await
            .unwrap());
        assert_eq!(
            store.get("things", id).await.unwrap().unwrap()["claim"]["token"],
            "third"
        );
    }

    #[tokio::test]
    async fn blobs_round_trip_and_track_last_write() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        assert!(store.last_write().await.unwrap().is_none());

        let blob = store.put_blob("eq.png", &[1, 2, 3]).await.unwrap();
        let fetched = store.get_blob(blob).await.unwrap().unwrap();
        assert_eq!(fetched.name, "eq.png");
        assert_eq!(fetched.data, vec![1, 2, 3]);
        let first = store.last_write().await.unwrap().unwrap();

        assert!(store.delete_blob(blob).await.unwrap());
        assert!(store.get_blob(blob).await.unwrap().is_none());
        let second = store.last_write().await.unwrap().unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let id = {
            let store = SqliteDocumentStore::open(&path, Duration::from_secs(1)).unwrap();
            store.insert("things", json!({"name": "kept"})).await.unwrap()
        };
        let store = SqliteDocumentStore::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(store.get("things", id).await.unwrap().unwrap()["name"], "kept");
    }
}
