//! PostgreSQL implementation of the world.
//!
//! Runs, events, stream chunks, and hook tokens live in four tables; the
//! terminal-event fence and the snapshot-returning append are enforced inside
//! a `SELECT ... FOR UPDATE` transaction. Per-correlation state machine
//! validation is left to the in-memory reference implementation; the queue's
//! per-run serialization means this backend never sees racing appends for
//! one run.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use windlass_core::{
    CorrelationId, Event, EventId, EventType, NewEvent, Run, RunId, RunStatus, StreamId,
    WorkflowError, WorkflowName,
};

use crate::store::{decode_run_error, HookRegistration, RunPatch, World, WorldError};

/// Poll interval for tail reads; Postgres has no push channel for chunks.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wkf_runs (
    run_id            TEXT PRIMARY KEY,
    workflow_name     TEXT NOT NULL,
    status            TEXT NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL,
    started_at        TIMESTAMPTZ,
    completed_at      TIMESTAMPTZ,
    expired_at        TIMESTAMPTZ,
    input             BYTEA NOT NULL,
    output            BYTEA,
    error_message     TEXT,
    error_stack       TEXT,
    execution_context JSONB NOT NULL,
    spec_version      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS wkf_events (
    seq            BIGSERIAL PRIMARY KEY,
    event_id       TEXT NOT NULL UNIQUE,
    run_id         TEXT NOT NULL REFERENCES wkf_runs(run_id) ON DELETE CASCADE,
    event_type     TEXT NOT NULL,
    correlation_id TEXT,
    created_at     TIMESTAMPTZ NOT NULL,
    spec_version   INTEGER NOT NULL,
    event_data     BYTEA
);
CREATE INDEX IF NOT EXISTS wkf_events_run_idx ON wkf_events (run_id, seq);

CREATE TABLE IF NOT EXISTS wkf_streams (
    stream_name TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL,
    closed      BOOLEAN NOT NULL DEFAULT FALSE,
    next_index  BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS wkf_stream_chunks (
    stream_name TEXT NOT NULL,
    chunk_index BIGINT NOT NULL,
    data        BYTEA NOT NULL,
    PRIMARY KEY (stream_name, chunk_index)
);

CREATE TABLE IF NOT EXISTS wkf_hooks (
    token          TEXT PRIMARY KEY,
    run_id         TEXT NOT NULL,
    correlation_id TEXT NOT NULL
);
"#;

/// PostgreSQL world.
///
/// # Example
///
/// ```ignore
/// use sqlx::PgPool;
/// use windlass_world::PostgresWorld;
///
/// let pool = PgPool::connect("postgres://localhost/windlass").await?;
/// let world = PostgresWorld::new(pool);
/// world.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorld {
    pool: PgPool,
}

impl PostgresWorld {
    /// Wrap an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), WorldError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(WorldError::from)?;
        Ok(())
    }
}

fn parse_status(s: &str) -> Result<RunStatus, WorldError> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(WorldError::Serialization(format!(
            "unknown run status {other:?}"
        ))),
    }
}

fn row_to_run(row: &PgRow) -> Result<Run, WorldError> {
    let run_id: String = row.try_get("run_id")?;
    let workflow_name: String = row.try_get("workflow_name")?;
    let status: String = row.try_get("status")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    let error_stack: Option<String> = row.try_get("error_stack")?;

    let error = error_message.map(|message| WorkflowError {
        message,
        stack: error_stack,
    });

    Ok(Run {
        run_id: RunId::from_str(&run_id)
            .map_err(|e| WorldError::Serialization(e.to_string()))?,
        workflow_name: WorkflowName::from_str(&workflow_name)
            .map_err(|e| WorldError::Serialization(e.to_string()))?,
        status: parse_status(&status)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
        expired_at: row.try_get::<Option<DateTime<Utc>>, _>("expired_at")?,
        input: row.try_get::<Vec<u8>, _>("input")?,
        output: row.try_get::<Option<Vec<u8>>, _>("output")?,
        error,
        execution_context: row.try_get::<serde_json::Value, _>("execution_context")?,
        spec_version: row.try_get::<i32, _>("spec_version")? as u32,
    })
}

fn row_to_event(row: &PgRow) -> Result<Event, WorldError> {
    let event_id: String = row.try_get("event_id")?;
    let run_id: String = row.try_get("run_id")?;
    let event_type: String = row.try_get("event_type")?;
    let correlation_id: Option<String> = row.try_get("correlation_id")?;

    let event_type: EventType =
        serde_json::from_value(serde_json::Value::String(event_type))
            .map_err(|e| WorldError::Serialization(e.to_string()))?;
    let correlation_id = correlation_id
        .map(|s| CorrelationId::from_str(&s))
        .transpose()
        .map_err(|e| WorldError::Serialization(e.to_string()))?;

    Ok(Event {
        event_id: EventId::from_str(&event_id)
            .map_err(|e| WorldError::Serialization(e.to_string()))?,
        run_id: RunId::from_str(&run_id)
            .map_err(|e| WorldError::Serialization(e.to_string()))?,
        event_type,
        correlation_id,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        spec_version: row.try_get::<i32, _>("spec_version")? as u32,
        event_data: row.try_get::<Option<Vec<u8>>, _>("event_data")?,
    })
}

#[async_trait]
impl World for PostgresWorld {
    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn create_run(&self, run: Run) -> Result<(), WorldError> {
        let result = sqlx::query(
            "INSERT INTO wkf_runs (run_id, workflow_name, status, created_at, \
             input, execution_context, spec_version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(run.run_id.to_string())
        .bind(run.workflow_name.to_string())
        .bind(run.status.to_string())
        .bind(run.created_at)
        .bind(&run.input)
        .bind(&run.execution_context)
        .bind(run.spec_version as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorldError::RunExists(run.run_id));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run, WorldError> {
        let row = sqlx::query("SELECT * FROM wkf_runs WHERE run_id = $1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(WorldError::RunNotFound(run_id))?;
        row_to_run(&row)
    }

    async fn update_run(&self, run_id: RunId, patch: RunPatch) -> Result<Run, WorldError> {
        let row = sqlx::query(
            "UPDATE wkf_runs SET \
             expired_at = COALESCE($2, expired_at), \
             execution_context = COALESCE($3, execution_context) \
             WHERE run_id = $1 RETURNING *",
        )
        .bind(run_id.to_string())
        .bind(patch.expired_at)
        .bind(patch.execution_context)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(WorldError::RunNotFound(run_id))?;
        row_to_run(&row)
    }

    #[instrument(skip(self, new_event), fields(%run_id, event_type = %new_event.event_type))]
    async fn append_event(
        &self,
        run_id: RunId,
        new_event: NewEvent,
    ) -> Result<(Event, Run), WorldError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM wkf_runs WHERE run_id = $1 FOR UPDATE")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(WorldError::RunNotFound(run_id))?;
        let run = row_to_run(&row)?;

        if run.status.is_terminal() {
            return Err(WorldError::RunTerminal {
                run_id,
                status: run.status,
            });
        }

        let now = Utc::now();
        let event = Event {
            event_id: EventId::new(),
            run_id,
            event_type: new_event.event_type,
            correlation_id: new_event.correlation_id,
            created_at: now,
            spec_version: run.spec_version,
            event_data: new_event.event_data,
        };

        sqlx::query(
            "INSERT INTO wkf_events (event_id, run_id, event_type, correlation_id, \
             created_at, spec_version, event_data) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.event_id.to_string())
        .bind(run_id.to_string())
        .bind(event.event_type.to_string())
        .bind(event.correlation_id.map(|c| c.to_string()))
        .bind(event.created_at)
        .bind(event.spec_version as i32)
        .bind(event.event_data.as_deref())
        .execute(&mut *tx)
        .await?;

        // Apply the run-level effect of this event to the snapshot row.
        match event.event_type {
            EventType::RunStarted if run.status == RunStatus::Pending => {
                sqlx::query(
                    "UPDATE wkf_runs SET status = 'running', started_at = $2 WHERE run_id = $1",
                )
                .bind(run_id.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            EventType::RunCompleted => {
                sqlx::query(
                    "UPDATE wkf_runs SET status = 'completed', completed_at = $2, \
                     output = $3 WHERE run_id = $1",
                )
                .bind(run_id.to_string())
                .bind(now)
                .bind(event.event_data.as_deref())
                .execute(&mut *tx)
                .await?;
            }
            EventType::RunFailed => {
                let error =
                    decode_run_error(event.event_data.as_deref(), event.spec_version);
                sqlx::query(
                    "UPDATE wkf_runs SET status = 'failed', completed_at = $2, \
                     error_message = $3, error_stack = $4 WHERE run_id = $1",
                )
                .bind(run_id.to_string())
                .bind(now)
                .bind(&error.message)
                .bind(error.stack.as_deref())
                .execute(&mut *tx)
                .await?;
            }
            EventType::RunCancelled => {
                sqlx::query(
                    "UPDATE wkf_runs SET status = 'cancelled', completed_at = $2 \
                     WHERE run_id = $1",
                )
                .bind(run_id.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            _ => {}
        }

        let row = sqlx::query("SELECT * FROM wkf_runs WHERE run_id = $1")
            .bind(run_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let snapshot = row_to_run(&row)?;

        tx.commit().await?;
        Ok((event, snapshot))
    }

    async fn load_events(&self, run_id: RunId) -> Result<Vec<Event>, WorldError> {
        let rows = sqlx::query("SELECT * FROM wkf_events WHERE run_id = $1 ORDER BY seq")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn write_to_stream(
        &self,
        name: StreamId,
        run_id: RunId,
        chunk: Bytes,
    ) -> Result<(), WorldError> {
        self.write_to_stream_multi(name, run_id, vec![chunk]).await
    }

    async fn write_to_stream_multi(
        &self,
        name: StreamId,
        run_id: RunId,
        chunks: Vec<Bytes>,
    ) -> Result<(), WorldError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO wkf_streams (stream_name, run_id) VALUES ($1, $2) \
             ON CONFLICT (stream_name) DO UPDATE SET run_id = wkf_streams.run_id \
             RETURNING closed, next_index",
        )
        .bind(name.to_string())
        .bind(run_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let closed: bool = row.try_get("closed")?;
        if closed {
            return Err(WorldError::StreamClosed(name));
        }
        let mut next_index: i64 = row.try_get("next_index")?;

        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO wkf_stream_chunks (stream_name, chunk_index, data) \
                 VALUES ($1, $2, $3)",
            )
            .bind(name.to_string())
            .bind(next_index)
            .bind(chunk.as_ref())
            .execute(&mut *tx)
            .await?;
            next_index += 1;
        }

        sqlx::query("UPDATE wkf_streams SET next_index = $2 WHERE stream_name = $1")
            .bind(name.to_string())
            .bind(next_index)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn close_stream(&self, name: StreamId, run_id: RunId) -> Result<(), WorldError> {
        sqlx::query(
            "INSERT INTO wkf_streams (stream_name, run_id, closed) VALUES ($1, $2, TRUE) \
             ON CONFLICT (stream_name) DO UPDATE SET closed = TRUE",
        )
        .bind(name.to_string())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn read_from_stream(
        &self,
        name: StreamId,
        start_index: usize,
    ) -> BoxStream<'static, Result<Bytes, WorldError>> {
        let pool = self.pool.clone();

        Box::pin(futures::stream::unfold(
            (start_index as i64, pool),
            move |(index, pool)| async move {
                loop {
                    let chunk = sqlx::query(
                        "SELECT data FROM wkf_stream_chunks \
                         WHERE stream_name = $1 AND chunk_index = $2",
                    )
                    .bind(name.to_string())
                    .bind(index)
                    .fetch_optional(&pool)
                    .await;

                    match chunk {
                        Ok(Some(row)) => {
                            let data: Vec<u8> = match row.try_get("data") {
                                Ok(data) => data,
                                Err(e) => {
                                    return Some((
                                        Err(WorldError::from(e)),
                                        (index, pool),
                                    ))
                                }
                            };
                            return Some((Ok(Bytes::from(data)), (index + 1, pool)));
                        }
                        Ok(None) => {
                            let closed = sqlx::query(
                                "SELECT closed FROM wkf_streams WHERE stream_name = $1",
                            )
                            .bind(name.to_string())
                            .fetch_optional(&pool)
                            .await;
                            match closed {
                                Ok(Some(row)) => {
                                    if row.try_get::<bool, _>("closed").unwrap_or(false) {
                                        return None;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    return Some((Err(WorldError::from(e)), (index, pool)))
                                }
                            }
                            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
                        }
                        Err(e) => return Some((Err(WorldError::from(e)), (index, pool))),
                    }
                }
            },
        ))
    }

    async fn register_hook(
        &self,
        token: &str,
        registration: HookRegistration,
    ) -> Result<(), WorldError> {
        sqlx::query(
            "INSERT INTO wkf_hooks (token, run_id, correlation_id) VALUES ($1, $2, $3) \
             ON CONFLICT (token) DO UPDATE SET run_id = $2, correlation_id = $3",
        )
        .bind(token)
        .bind(registration.run_id.to_string())
        .bind(registration.correlation_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_hook(&self, token: &str) -> Result<HookRegistration, WorldError> {
        let row = sqlx::query("SELECT run_id, correlation_id FROM wkf_hooks WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(WorldError::UnknownHookToken)?;

        let run_id: String = row.try_get("run_id")?;
        let correlation_id: String = row.try_get("correlation_id")?;
        Ok(HookRegistration {
            run_id: RunId::from_str(&run_id)
                .map_err(|e| WorldError::Serialization(e.to_string()))?,
            correlation_id: CorrelationId::from_str(&correlation_id)
                .map_err(|e| WorldError::Serialization(e.to_string()))?,
        })
    }

    async fn remove_hook(&self, token: &str) -> Result<(), WorldError> {
        sqlx::query("DELETE FROM wkf_hooks WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
