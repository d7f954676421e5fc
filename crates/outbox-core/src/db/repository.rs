//! Operation storage implementations

use std::sync::Arc;

use async_trait::async_trait;
use libsql::{params, Connection, Value};
use tokio::sync::Mutex;

use super::Database;
use crate::error::{Error, Result};
use crate::models::{Operation, OperationId, OperationStatus};

/// Storage collaborator behind the durable operation queue.
///
/// Listings are ordered by `created_at` ascending, ties broken by id.
#[async_trait]
pub trait OperationStorage: Send + Sync {
    /// Insert or replace an operation
    async fn put(&self, operation: &Operation) -> Result<()>;

    /// Get an operation by ID
    async fn get(&self, id: &OperationId) -> Result<Option<Operation>>;

    /// List operations with the given status, oldest first
    async fn list_by_status(&self, status: OperationStatus) -> Result<Vec<Operation>>;

    /// List every stored operation, oldest first
    async fn list_all(&self) -> Result<Vec<Operation>>;

    /// Delete an operation, returning whether it existed
    async fn delete(&self, id: &OperationId) -> Result<bool>;

    /// Number of stored operations
    async fn count(&self) -> Result<usize>;

    /// Delete every operation
    async fn clear(&self) -> Result<()>;

    /// Whether writes survive a process restart
    fn is_durable(&self) -> bool;
}

/// libSQL implementation of `OperationStorage`
pub struct LibSqlOperationStorage {
    db: Arc<Mutex<Database>>,
}

const SELECT_COLUMNS: &str = "SELECT id, created_at, kind, target, payload, retry_count, max_retries, status, last_error, synced_at FROM operations";

impl LibSqlOperationStorage {
    /// Create storage over an opened database
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn query_operations(
        conn: &Connection,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Operation>> {
        let mut rows = conn.query(sql, params).await?;
        let mut operations = Vec::new();
        while let Some(row) = rows.next().await? {
            operations.push(Self::parse_operation(&row)?);
        }
        Ok(operations)
    }

    /// Parse an operation from a database row
    fn parse_operation(row: &libsql::Row) -> Result<Operation> {
        let id: String = row.get(0)?;
        let kind: String = row.get(2)?;
        let payload: String = row.get(4)?;
        let status: String = row.get(7)?;

        Ok(Operation {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid operation id '{id}'")))?,
            created_at: row.get(1)?,
            kind: kind.parse().map_err(Error::Database)?,
            target: row.get(3)?,
            payload: serde_json::from_str(&payload)?,
            retry_count: Self::parse_count(row.get(5)?)?,
            max_retries: Self::parse_count(row.get(6)?)?,
            status: status.parse().map_err(Error::Database)?,
            last_error: match row.get_value(8)? {
                Value::Text(error) => Some(error),
                _ => None,
            },
            synced_at: match row.get_value(9)? {
                Value::Integer(synced_at) => Some(synced_at),
                _ => None,
            },
        })
    }

    fn parse_count(value: i64) -> Result<u32> {
        u32::try_from(value).map_err(|_| Error::Database(format!("invalid retry count {value}")))
    }
}

#[async_trait]
impl OperationStorage for LibSqlOperationStorage {
    async fn put(&self, operation: &Operation) -> Result<()> {
        let payload = serde_json::to_string(&operation.payload)?;
        let last_error = operation
            .last_error
            .clone()
            .map_or(Value::Null, Value::Text);
        let synced_at = operation.synced_at.map_or(Value::Null, Value::Integer);

        let db = self.db.lock().await;
        db.connection()
            .execute(
                "INSERT OR REPLACE INTO operations
                 (id, created_at, kind, target, payload, retry_count, max_retries, status, last_error, synced_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    operation.id.as_str(),
                    operation.created_at,
                    operation.kind.as_str(),
                    operation.target.clone(),
                    payload,
                    i64::from(operation.retry_count),
                    i64::from(operation.max_retries),
                    operation.status.as_str(),
                    last_error,
                    synced_at
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &OperationId) -> Result<Option<Operation>> {
        let db = self.db.lock().await;
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        let mut operations =
            Self::query_operations(db.connection(), &sql, params![id.as_str()]).await?;
        Ok(operations.pop())
    }

    async fn list_by_status(&self, status: OperationStatus) -> Result<Vec<Operation>> {
        let db = self.db.lock().await;
        let sql = format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY created_at ASC, id ASC");
        Self::query_operations(db.connection(), &sql, params![status.as_str()]).await
    }

    async fn list_all(&self) -> Result<Vec<Operation>> {
        let db = self.db.lock().await;
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at ASC, id ASC");
        Self::query_operations(db.connection(), &sql, ()).await
    }

    async fn delete(&self, id: &OperationId) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db
            .connection()
            .execute("DELETE FROM operations WHERE id = ?", params![id.as_str()])
            .await?;
        Ok(rows > 0)
    }

    async fn count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM operations", ())
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        usize::try_from(count).map_err(|_| Error::Database(format!("invalid count {count}")))
    }

    async fn clear(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.connection().execute("DELETE FROM operations", ()).await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}
