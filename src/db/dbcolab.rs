use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Error as SqlxError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::models::DocSnapshot;

// Global database instance
static DB: OnceCell<Arc<DbColab>> = OnceCell::const_new();

/// Initialize the global database connection and make sure the snapshot table exists.
///
/// # Arguments
/// * `database_url` - PostgreSQL connection string
pub async fn init_db(database_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = DbColab::new(database_url).await?;
    db.ensure_schema().await?;
    DB.set(Arc::new(db))
        .map_err(|_| "Database already initialized")?;
    Ok(())
}

/// Get the global database instance
///
/// # Returns
/// * `Option<Arc<DbColab>>` - Database instance if initialized
pub fn get_db() -> Option<Arc<DbColab>> {
    DB.get().cloned()
}

/// Snapshot row from the database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentSnapshotRow {
    pub doc_id: String,
    pub version: i64,
    pub content: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentSnapshotRow {
    pub fn to_snapshot(&self) -> Result<DocSnapshot, String> {
        let snapshot = DocSnapshot::from_cbor(&self.content)?;
        if snapshot.version != self.version as u64 {
            return Err(format!(
                "Snapshot blob for {} is at version {} but row says {}",
                self.doc_id, snapshot.version, self.version
            ));
        }
        Ok(snapshot)
    }
}

pub struct DbColab {
    pool: PgPool,
}

impl DbColab {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    ///
    /// # Returns
    /// * `Result<Self, SqlxError>` - Database connection pool or error
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), SqlxError> {
        let create_sql = r#"
            CREATE TABLE IF NOT EXISTS document_snapshots (
                doc_id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                content BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
        "#;
        sqlx::query(create_sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Load the latest snapshot row of a document
    ///
    /// # Arguments
    /// * `doc_id` - Document id
    ///
    /// # Returns
    /// * `Result<Option<DocumentSnapshotRow>, SqlxError>` - The row, if the document was ever saved
    pub async fn load_snapshot(&self, doc_id: &str) -> Result<Option<DocumentSnapshotRow>, SqlxError> {
        let select_sql = r#"
            SELECT doc_id, version, content, updated_at
            FROM document_snapshots
            WHERE doc_id = $1;
        "#;
        sqlx::query_as::<_, DocumentSnapshotRow>(select_sql)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Store a snapshot unless a newer version is already stored
    ///
    /// # Returns
    /// * `Result<bool, SqlxError>` - Whether the row was written
    pub async fn save_snapshot(&self, snapshot: &DocSnapshot) -> Result<bool, SqlxError> {
        let content = snapshot.to_cbor().map_err(|e| SqlxError::Encode(e.into()))?;

        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        info!(
            "Saving snapshot of {} at version {}. Pool connections: {} idle, {} in use",
            snapshot.doc_id,
            snapshot.version,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );

        let upsert_sql = r#"
            INSERT INTO document_snapshots (doc_id, version, content, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (doc_id) DO UPDATE
            SET version = EXCLUDED.version,
                content = EXCLUDED.content,
                updated_at = NOW()
            WHERE document_snapshots.version <= EXCLUDED.version;
        "#;
        let result = sqlx::query(upsert_sql)
            .bind(&snapshot.doc_id)
            .bind(snapshot.version as i64)
            .bind(content)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to save snapshot of {}: {}", snapshot.doc_id, e);
                e
            })?;

        Ok(result.rows_affected() > 0)
    }
}
