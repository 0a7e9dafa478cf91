//! Bookkeeping store: one durable table recording successful imports.
//!
//! The table is the single source of truth for "which schema holds the
//! current dataset". The schema catalog is scanned separately because the
//! two views may diverge (orphans from crashed runs); reconciling them is
//! the coordinator's job, never this module's.

use crate::error::{ImportError, Result};
use crate::schema::{quote_ident, schema_like_pattern};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection, Row};
use tracing::{info, warn};

/// Name of the bookkeeping table, created in the `public` schema.
pub const IMPORTS_TABLE: &str = "latest_successful_imports";

/// One row per successful import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRecord {
    pub schema_name: String,
    pub imported_at: i64,
    pub feed_digest: String,
}

/// Combined view of the bookkeeping table and the schema catalog.
#[derive(Debug, Clone, Default)]
pub struct ImportInventory {
    /// Recorded successful imports, most recent first.
    pub successful_imports: Vec<ImportRecord>,
    /// Every managed schema present in the catalog, including orphaned
    /// and unfinished ones.
    pub all_schemas: Vec<String>,
}

impl ImportInventory {
    pub fn latest(&self) -> Option<&ImportRecord> {
        self.successful_imports.first()
    }

    pub fn has_record_for(&self, schema_name: &str) -> bool {
        self.successful_imports
            .iter()
            .any(|record| record.schema_name == schema_name)
    }
}

/// Storage seam the coordinator drives.
#[async_trait]
pub trait Bookkeeping: Send {
    /// Create the bookkeeping table if it is not there yet.
    async fn ensure_exists(&mut self) -> Result<()>;

    /// Non-blocking, database-level, session-scoped mutual exclusion.
    /// Returns `false` immediately when another session holds the lock.
    async fn try_acquire_import_lock(&mut self) -> Result<bool>;

    async fn release_import_lock(&mut self) -> Result<()>;

    async fn list_imports(&mut self) -> Result<ImportInventory>;

    /// Insert one import record as a single atomic transaction.
    async fn record_import(&mut self, record: &ImportRecord) -> Result<()>;

    /// Remove a record whose schema has already been destroyed.
    async fn delete_import_record(&mut self, schema_name: &str) -> Result<()>;

    async fn drop_schema(&mut self, schema_name: &str) -> Result<()>;

    /// Grant read access on a schema to the given roles.
    async fn grant_read_access(&mut self, schema_name: &str, roles: &[String]) -> Result<()>;
}

/// Production implementation over a single Postgres session.
///
/// A dedicated connection rather than a pool: the advisory lock and the
/// session timeouts below are per-session state, and the session is the
/// unit of coordination. If the process dies, the lock dies with the
/// connection.
pub struct PgBookkeeping {
    conn: PgConnection,
}

impl PgBookkeeping {
    pub async fn connect(options: PgConnectOptions) -> Result<Self> {
        let mut conn = PgConnection::connect_with(&options).await?;
        configure_session(&mut conn).await?;
        warn_about_stale_sessions(&mut conn).await?;
        Ok(Self { conn })
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Bound how long a stuck run can hold locks and block future runs.
/// A session idle in a transaction past the timeout is killed by
/// Postgres itself, not by the coordinator.
async fn configure_session(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("SET statement_timeout = '0'")
        .execute(&mut *conn)
        .await?;
    sqlx::query("SET lock_timeout = '10s'")
        .execute(&mut *conn)
        .await?;
    sqlx::query("SET idle_in_transaction_session_timeout = '30min'")
        .execute(&mut *conn)
        .await?;

    let statement_timeout: String = sqlx::query_scalar("SHOW statement_timeout")
        .fetch_one(&mut *conn)
        .await?;
    info!("timeouts configured: statement_timeout={}", statement_timeout);
    Ok(())
}

/// Look for sessions likely to cause lock contention and tell the
/// operator how to get rid of them. Purely observational.
async fn warn_about_stale_sessions(conn: &mut PgConnection) -> Result<()> {
    let rows = sqlx::query(
        "SELECT pid, state, (now() - state_change)::text AS idle_duration, query
         FROM pg_stat_activity
         WHERE pid != pg_backend_pid()
           AND datname = current_database()
           AND (
             (state = 'idle in transaction' AND now() - state_change > interval '30 seconds')
             OR (state = 'idle' AND now() - state_change > interval '5 minutes')
           )",
    )
    .fetch_all(&mut *conn)
    .await?;

    if rows.is_empty() {
        info!("no stale database sessions found");
        return Ok(());
    }

    warn!(
        "found {} stale session(s) that may cause lock contention:",
        rows.len()
    );
    for row in &rows {
        let pid: i32 = row.get("pid");
        let state: Option<String> = row.get("state");
        let idle_duration: Option<String> = row.get("idle_duration");
        warn!(
            "  PID {} ({}, idle for {})",
            pid,
            state.as_deref().unwrap_or("unknown"),
            idle_duration.as_deref().unwrap_or("unknown"),
        );
    }
    let first_pid: i32 = rows[0].get("pid");
    warn!("if the import fails with a lock timeout, kill them manually:");
    warn!("  SELECT pg_terminate_backend({});", first_pid);
    Ok(())
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code().map(|code| code.to_string()))
}

#[async_trait]
impl Bookkeeping for PgBookkeeping {
    async fn ensure_exists(&mut self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS public.{} (
                schema_name TEXT PRIMARY KEY,
                imported_at INTEGER NOT NULL,
                feed_digest TEXT NOT NULL
            )",
            quote_ident(IMPORTS_TABLE)
        );
        match sqlx::query(&sql).execute(&mut self.conn).await {
            Ok(_) => Ok(()),
            // 42P07: a concurrent run created the table first. Fine.
            Err(err) if sqlstate(&err).as_deref() == Some("42P07") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn try_acquire_import_lock(&mut self) -> Result<bool> {
        let locked: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1)::bigint)")
                .bind(IMPORTS_TABLE)
                .fetch_one(&mut self.conn)
                .await?;
        Ok(locked)
    }

    async fn release_import_lock(&mut self) -> Result<()> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1)::bigint)")
            .bind(IMPORTS_TABLE)
            .fetch_one(&mut self.conn)
            .await?;
        if !released {
            warn!("import lock was not held at release time");
        }
        Ok(())
    }

    async fn list_imports(&mut self) -> Result<ImportInventory> {
        let records_sql = format!(
            "SELECT schema_name, imported_at, feed_digest
             FROM public.{}
             WHERE schema_name LIKE $1
             ORDER BY imported_at DESC",
            quote_ident(IMPORTS_TABLE)
        );
        let successful_imports = sqlx::query_as::<_, (String, i32, String)>(&records_sql)
            .bind(schema_like_pattern())
            .fetch_all(&mut self.conn)
            .await?
            .into_iter()
            .map(|(schema_name, imported_at, feed_digest)| ImportRecord {
                schema_name,
                imported_at: i64::from(imported_at),
                feed_digest,
            })
            .collect();

        let all_schemas: Vec<String> = sqlx::query_scalar(
            "SELECT nspname
             FROM pg_catalog.pg_namespace
             WHERE nspname LIKE $1
             ORDER BY nspname ASC",
        )
        .bind(schema_like_pattern())
        .fetch_all(&mut self.conn)
        .await?;

        Ok(ImportInventory {
            successful_imports,
            all_schemas,
        })
    }

    async fn record_import(&mut self, record: &ImportRecord) -> Result<()> {
        let mut tx = self.conn.begin().await?;

        let lock_sql = format!(
            "LOCK TABLE public.{} IN EXCLUSIVE MODE NOWAIT",
            quote_ident(IMPORTS_TABLE)
        );
        if let Err(err) = sqlx::query(&lock_sql).execute(&mut *tx).await {
            // 55P03: lock unavailable, another import is recording right now.
            // The transaction rolls back when dropped.
            if sqlstate(&err).as_deref() == Some("55P03") {
                return Err(ImportError::ConcurrentImport);
            }
            return Err(err.into());
        }

        let insert_sql = format!(
            "INSERT INTO public.{} (schema_name, imported_at, feed_digest)
             VALUES ($1, $2, $3)",
            quote_ident(IMPORTS_TABLE)
        );
        // The imported_at column is INTEGER: 32-bit epoch seconds.
        if let Err(err) = sqlx::query(&insert_sql)
            .bind(&record.schema_name)
            .bind(record.imported_at as i32)
            .bind(&record.feed_digest)
            .execute(&mut *tx)
            .await
        {
            if sqlstate(&err).as_deref() == Some("23505") {
                return Err(ImportError::DuplicateImportRecord {
                    schema: record.schema_name.clone(),
                });
            }
            return Err(err.into());
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_import_record(&mut self, schema_name: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM public.{} WHERE schema_name = $1",
            quote_ident(IMPORTS_TABLE)
        );
        sqlx::query(&sql)
            .bind(schema_name)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn drop_schema(&mut self, schema_name: &str) -> Result<()> {
        let sql = format!("DROP SCHEMA {} CASCADE", quote_ident(schema_name));
        sqlx::query(&sql).execute(&mut self.conn).await?;
        Ok(())
    }

    async fn grant_read_access(&mut self, schema_name: &str, roles: &[String]) -> Result<()> {
        let role_list = roles
            .iter()
            .map(|role| quote_ident(role))
            .collect::<Vec<_>>()
            .join(", ");
        let schema = quote_ident(schema_name);

        let statements = [
            format!("GRANT USAGE ON SCHEMA {} TO {}", schema, role_list),
            format!("GRANT ALL ON ALL TABLES IN SCHEMA {} TO {}", schema, role_list),
            format!(
                "GRANT ALL ON ALL ROUTINES IN SCHEMA {} TO {}",
                schema, role_list
            ),
            format!(
                "GRANT ALL ON ALL SEQUENCES IN SCHEMA {} TO {}",
                schema, role_list
            ),
            format!(
                "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT ALL ON TABLES TO {}",
                schema, role_list
            ),
            format!(
                "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT ALL ON ROUTINES TO {}",
                schema, role_list
            ),
            format!(
                "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT ALL ON SEQUENCES TO {}",
                schema, role_list
            ),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&mut self.conn).await?;
        }
        Ok(())
    }
}
