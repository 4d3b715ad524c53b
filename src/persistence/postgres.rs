//! PostgreSQL persistence gateway.
//!
//! One row per room in `relay_documents`, holding the latest serialized
//! document state. Saves upsert with last-writer-wins semantics.

use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use super::{PersistenceError, PersistenceGateway};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS relay_documents (
        name        TEXT PRIMARY KEY,
        state       BYTEA NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
"#;

/// Database-backed gateway holding a connection pool.
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    /// Connect to the database and ensure the documents table exists.
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| PersistenceError::Database(e.to_string()))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| PersistenceError::Database(e.to_string()))?;

        info!("Database connection pool created successfully");
        Ok(Self { pool })
    }
}

impl PersistenceGateway for PgGateway {
    fn load(&self, room: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, PersistenceError>> {
        let room = room.to_string();
        Box::pin(async move {
            let row = sqlx::query("SELECT state FROM relay_documents WHERE name = $1")
                .bind(&room)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| PersistenceError::Database(e.to_string()))?;
            Ok(row.map(|r| r.get::<Vec<u8>, _>("state")))
        })
    }

    fn save(&self, room: &str, state: Vec<u8>) -> BoxFuture<'_, Result<(), PersistenceError>> {
        let room = room.to_string();
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO relay_documents (name, state, updated_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (name)
                DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&room)
            .bind(&state)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::Database(e.to_string()))?;
            info!("Saved document state for room '{}' ({} bytes)", room, state.len());
            Ok(())
        })
    }
}
