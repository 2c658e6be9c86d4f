//! sqlx-backed query executor.
//!
//! Owns the database boundary: acquires a connection from the pool, applies
//! the render time budget as a `statement_timeout`, and streams the tile
//! rows back. A canceled statement surfaces with SQLSTATE 57014, which the
//! error taxonomy recognizes as a timeout.

use futures::TryStreamExt;
use sqlx::{PgPool, Row};

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::{QueryExecutor, RenderLimits, TileRow};

/// Executes tile queries against a PostGIS database through a shared
/// connection pool.
#[derive(Clone)]
pub struct PgPoolExecutor {
    pool: PgPool,
}

impl PgPoolExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<sqlx::Error> for ExecutorError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db) => ExecutorError {
                message: db.message().to_string(),
                code: db.code().map(|code| code.into_owned()),
            },
            other => ExecutorError::new(other.to_string()),
        }
    }
}

#[async_trait]
impl QueryExecutor for PgPoolExecutor {
    async fn execute(
        &self,
        sql: &str,
        limits: &RenderLimits,
    ) -> Result<Vec<TileRow>, ExecutorError> {
        let mut tx = self.pool.begin().await?;

        // SET LOCAL keeps the budget scoped to this transaction, so the
        // pooled connection goes back clean.
        if limits.render > 0 {
            sqlx::query(&format!("SET LOCAL statement_timeout = {}", limits.render))
                .execute(&mut *tx)
                .await?;
        }

        let mut rows: Vec<TileRow> = Vec::new();
        {
            let mut stream = sqlx::query(sql).fetch(&mut *tx);
            while let Some(row) = stream.try_next().await? {
                let mvt: Vec<u8> = row.try_get(0).map_err(ExecutorError::from)?;
                rows.push(TileRow { mvt });
            }
        }
        tx.commit().await?;

        Ok(rows)
    }
}
