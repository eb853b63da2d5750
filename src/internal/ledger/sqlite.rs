use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

use crate::internal::ledger::store::{KvStore, LedgerError, Versioned, WriteBatch};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ledger_kv (
        key TEXT PRIMARY KEY NOT NULL,
        value BLOB NOT NULL,
        version INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ledger_meta (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        sequence INTEGER NOT NULL
    )",
    "INSERT OR IGNORE INTO ledger_meta (id, sequence) VALUES (0, 0)",
];

/// Durable store backed by a single SQLite database.
///
/// The pool holds one connection, so commits are serialized and an
/// in-memory database (`sqlite::memory:`) stays a single database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        tracing::info!(url, "sqlite ledger store ready");
        Ok(Self { pool })
    }
}

fn versioned(row: &sqlx::sqlite::SqliteRow) -> Result<Versioned, LedgerError> {
    let value: Vec<u8> = row.try_get("value")?;
    let version: i64 = row.try_get("version")?;
    Ok(Versioned {
        value,
        version: version as u64,
    })
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, LedgerError> {
        let row = sqlx::query("SELECT value, version FROM ledger_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(versioned).transpose()
    }

    async fn range(&self, start: &str, end: &str) -> Result<Vec<(String, Versioned)>, LedgerError> {
        let rows = if end.is_empty() {
            sqlx::query("SELECT key, value, version FROM ledger_kv WHERE key >= ? ORDER BY key")
                .bind(start)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query(
                "SELECT key, value, version FROM ledger_kv WHERE key >= ? AND key < ? ORDER BY key",
            )
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter()
            .map(|row| -> Result<(String, Versioned), LedgerError> {
                let key: String = row.try_get("key")?;
                Ok((key, versioned(row)?))
            })
            .collect()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<u64, LedgerError> {
        let mut tx = self.pool.begin().await?;

        for (key, observed) in &batch.reads {
            let current: Option<i64> = sqlx::query("SELECT version FROM ledger_kv WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get::<i64, _>("version"))
                .transpose()?;
            if current.map(|v| v as u64) != *observed {
                tx.rollback().await?;
                return Err(LedgerError::Conflict { key: key.clone() });
            }
        }

        let sequence: i64 = sqlx::query("UPDATE ledger_meta SET sequence = sequence + 1 WHERE id = 0 RETURNING sequence")
            .fetch_one(&mut *tx)
            .await?
            .try_get("sequence")?;

        for (key, value) in &batch.writes {
            match value {
                Some(value) => {
                    sqlx::query(
                        "INSERT INTO ledger_kv (key, value, version) VALUES (?, ?, ?)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = excluded.version",
                    )
                    .bind(key)
                    .bind(value)
                    .bind(sequence)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM ledger_kv WHERE key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(sequence as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::ledger::store::Ledger;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip_and_conflict() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let ledger = Ledger::new(Arc::new(store));

        let mut tx = ledger.begin("Org1");
        assert!(tx.get_state("spec/abc").await.unwrap().is_none());
        tx.put_state("spec/abc", b"{}".to_vec());
        tx.commit().await.unwrap();

        let mut first = ledger.begin("Org1");
        let mut second = ledger.begin("Org2");
        first.get_state("spec/abc").await.unwrap();
        second.get_state("spec/abc").await.unwrap();
        first.put_state("spec/abc", b"{\"a\":1}".to_vec());
        second.put_state("spec/abc", b"{\"b\":2}".to_vec());

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { ref key } if key == "spec/abc"));

        let mut tx = ledger.begin("Org1");
        let rows = tx.state_by_range("spec/", "spec0").await.unwrap();
        assert_eq!(rows, vec![("spec/abc".to_string(), b"{\"a\":1}".to_vec())]);
    }
}
