//! Schema creation and versioned migrations.
//!
//! The `schema_version` table holds a single row. To change the schema,
//! bump `CURRENT_SCHEMA_VERSION` and add a step to [`migrate`]; steps run in
//! order from the stored version to the current one.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use super::{Result, StoreError};

const CURRENT_SCHEMA_VERSION: i64 = 2;

pub(super) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );
        "#,
    )?;

    let from_version: i64 = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?
        .unwrap_or(0);

    if from_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: from_version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if from_version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    if from_version < 1 {
        // projects and linked_accounts belong to the registration and OAuth
        // subsystems; they are created here so a standalone deployment works.
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                github_full_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending_verification',
                owner_user_id TEXT,
                deleted_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_full_name
                ON projects(github_full_name COLLATE NOCASE) WHERE deleted_at IS NULL;

            CREATE TABLE IF NOT EXISTS linked_accounts (
                user_id TEXT PRIMARY KEY,
                login TEXT NOT NULL,
                access_token TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS github_events (
                delivery_id TEXT PRIMARY KEY,
                project_id TEXT,
                repo_full_name TEXT NOT NULL,
                event TEXT NOT NULL,
                action TEXT,
                payload TEXT NOT NULL,
                received_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_github_events_project
                ON github_events(project_id, received_at);

            CREATE TABLE IF NOT EXISTS github_issues (
                project_id TEXT NOT NULL,
                github_issue_id INTEGER NOT NULL,
                number INTEGER NOT NULL,
                state TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                author_login TEXT NOT NULL,
                url TEXT NOT NULL,
                assignees TEXT NOT NULL DEFAULT '[]',
                labels TEXT NOT NULL DEFAULT '[]',
                comments_count INTEGER NOT NULL DEFAULT 0,
                comments TEXT NOT NULL DEFAULT '[]',
                created_at_github INTEGER,
                updated_at_github INTEGER,
                closed_at_github INTEGER,
                last_seen_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, github_issue_id),
                UNIQUE (project_id, number)
            );

            CREATE TABLE IF NOT EXISTS github_pull_requests (
                project_id TEXT NOT NULL,
                github_pr_id INTEGER NOT NULL,
                number INTEGER NOT NULL,
                state TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                author_login TEXT NOT NULL,
                url TEXT NOT NULL,
                merged INTEGER NOT NULL DEFAULT 0,
                merged_at_github INTEGER,
                created_at_github INTEGER,
                updated_at_github INTEGER,
                closed_at_github INTEGER,
                last_seen_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, github_pr_id),
                UNIQUE (project_id, number)
            );
            "#,
        )?;
    }

    if from_version < 2 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_jobs (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                run_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                locked_by TEXT,
                locked_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sync_jobs_claim
                ON sync_jobs(status, run_at);
            CREATE INDEX IF NOT EXISTS idx_sync_jobs_project
                ON sync_jobs(project_id, created_at);
            "#,
        )?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
        params![CURRENT_SCHEMA_VERSION],
    )?;
    info!(
        from = from_version,
        to = CURRENT_SCHEMA_VERSION,
        "migrated database schema"
    );
    Ok(())
}
