//! Projects, linked credentials, the webhook audit log and the issue and pull
//! request snapshot tables.
//!
//! Snapshot writes are upserts keyed on `(project_id, github id)`. Replaying
//! the same data any number of times leaves one row, and `last_seen_at` never
//! moves backwards. A write also evicts any row holding the same number under
//! a different github id, so `(project_id, number)` never blocks a sync.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::warn;
use uuid::Uuid;

use super::{Result, Store, StoreError, from_millis, opt_from_millis, opt_to_millis, to_millis};
use crate::types::{
    DeliveryId, IssueSnapshot, Project, ProjectId, PullRequestSnapshot, WebhookDelivery,
};

fn parse_project_id(raw: &str) -> Result<ProjectId> {
    raw.parse().map_err(|_| StoreError::corrupt("project_id", raw))
}

fn json_column(raw: Option<&serde_json::Value>) -> Result<Option<String>> {
    raw.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_project(
    (id, full_name, status, owner): (String, String, String, Option<String>),
) -> Result<Project> {
    let owner_user_id = owner
        .map(|o| Uuid::parse_str(&o).map_err(|_| StoreError::corrupt("owner_user_id", &o)))
        .transpose()?;
    Ok(Project {
        id: parse_project_id(&id)?,
        full_name,
        status,
        owner_user_id,
    })
}

impl Store {
    // ─────────────────────────────────────────────────────────────────────────
    // Projects and credentials
    // ─────────────────────────────────────────────────────────────────────────

    /// Registers a project. Registration is owned by another subsystem; this
    /// exists for bootstrap tooling and tests.
    pub async fn insert_project(&self, project: &Project) -> Result<()> {
        let project = project.clone();
        self.with_conn("insert_project", move |conn| {
            conn.execute(
                "INSERT INTO projects (id, github_full_name, status, owner_user_id) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    project.id.to_string(),
                    project.full_name,
                    project.status,
                    project.owner_user_id.map(|u| u.to_string()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Soft-deletes a project. Deleted projects are invisible to lookups.
    pub async fn soft_delete_project(&self, id: ProjectId, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn("soft_delete_project", move |conn| {
            let changed = conn.execute(
                "UPDATE projects SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![id.to_string(), to_millis(now)],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Finds a live project by repository full name, ignoring case.
    pub async fn find_project_by_full_name(&self, full_name: &str) -> Result<Option<Project>> {
        let full_name = full_name.trim().to_string();
        self.with_conn("find_project_by_full_name", move |conn| {
            conn.query_row(
                "SELECT id, github_full_name, status, owner_user_id FROM projects \
                 WHERE github_full_name = ?1 COLLATE NOCASE AND deleted_at IS NULL",
                params![full_name],
                project_from_row,
            )
            .optional()?
            .map(decode_project)
            .transpose()
        })
        .await
    }

    /// Loads a live project by ID.
    pub async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        self.with_conn("get_project", move |conn| {
            conn.query_row(
                "SELECT id, github_full_name, status, owner_user_id FROM projects \
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id.to_string()],
                project_from_row,
            )
            .optional()?
            .map(decode_project)
            .transpose()
        })
        .await
    }

    /// Stores (or replaces) the linked GitHub account of a user.
    pub async fn link_account(&self, user_id: Uuid, login: &str, access_token: &str) -> Result<()> {
        let login = login.to_string();
        let access_token = access_token.to_string();
        self.with_conn("link_account", move |conn| {
            conn.execute(
                "INSERT INTO linked_accounts (user_id, login, access_token) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (user_id) DO UPDATE SET \
                     login = excluded.login, access_token = excluded.access_token",
                params![user_id.to_string(), login, access_token],
            )?;
            Ok(())
        })
        .await
    }

    /// The access token linked to `user_id`, if any.
    pub async fn access_token_for_user(&self, user_id: Uuid) -> Result<Option<String>> {
        self.with_conn("access_token_for_user", move |conn| {
            Ok(conn
                .query_row(
                    "SELECT access_token FROM linked_accounts WHERE user_id = ?1",
                    params![user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Webhook audit log
    // ─────────────────────────────────────────────────────────────────────────

    /// Appends a delivery to the audit log.
    ///
    /// Returns `true` if the row was written and `false` if a row with the same
    /// delivery ID already existed (a redelivery).
    pub async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<bool> {
        let delivery = delivery.clone();
        self.with_conn("record_delivery", move |conn| {
            let changed = conn.execute(
                "INSERT INTO github_events \
                 (delivery_id, project_id, repo_full_name, event, action, payload, received_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (delivery_id) DO NOTHING",
                params![
                    delivery.delivery_id.as_str(),
                    delivery.project_id.map(|p| p.to_string()),
                    delivery.repo_full_name,
                    delivery.event,
                    delivery.action,
                    delivery.payload,
                    to_millis(delivery.received_at),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Loads an audit row by delivery ID.
    pub async fn get_delivery(&self, delivery_id: &DeliveryId) -> Result<Option<WebhookDelivery>> {
        let delivery_id = delivery_id.clone();
        self.with_conn("get_delivery", move |conn| {
            let row = conn
                .query_row(
                    "SELECT project_id, repo_full_name, event, action, payload, received_at \
                     FROM github_events WHERE delivery_id = ?1",
                    params![delivery_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;
            let Some((project_id, repo_full_name, event, action, payload, received_at)) = row
            else {
                return Ok(None);
            };
            Ok(Some(WebhookDelivery {
                delivery_id,
                project_id: project_id.as_deref().map(parse_project_id).transpose()?,
                repo_full_name,
                event,
                action,
                payload,
                received_at: from_millis("received_at", received_at)?,
            }))
        })
        .await
    }

    /// Number of rows in the audit log.
    pub async fn delivery_count(&self) -> Result<u64> {
        self.with_conn("delivery_count", |conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM github_events", [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Issues
    // ─────────────────────────────────────────────────────────────────────────

    /// Inserts or refreshes an issue snapshot.
    ///
    /// Scalar fields are overwritten. List fields and the comment count are
    /// overwritten only when the snapshot carries them; `None` keeps the stored
    /// value (or the empty default on first insert).
    pub async fn upsert_issue(&self, issue: &IssueSnapshot) -> Result<()> {
        let issue = issue.clone();
        self.with_conn("upsert_issue", move |conn| {
            let assignees = json_column(issue.assignees.as_ref())?;
            let labels = json_column(issue.labels.as_ref())?;
            let comments = json_column(issue.comments.as_ref())?;
            let tx = conn.transaction()?;
            // A number belongs to one issue. A row holding it under another id
            // is stale (or was written from a bad payload) and is replaced.
            let replaced = tx.execute(
                "DELETE FROM github_issues \
                 WHERE project_id = ?1 AND number = ?2 AND github_issue_id != ?3",
                params![issue.project_id.to_string(), issue.number, issue.github_id],
            )?;
            if replaced > 0 {
                warn!(
                    project_id = %issue.project_id,
                    number = issue.number,
                    github_id = issue.github_id,
                    "replacing issue snapshot stored under another id"
                );
            }
            tx.execute(
                "INSERT INTO github_issues (\
                     project_id, github_issue_id, number, state, title, body, author_login, url, \
                     assignees, labels, comments_count, comments, \
                     created_at_github, updated_at_github, closed_at_github, last_seen_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, \
                     COALESCE(?9, '[]'), COALESCE(?10, '[]'), COALESCE(?11, 0), COALESCE(?12, '[]'), \
                     ?13, ?14, ?15, ?16) \
                 ON CONFLICT (project_id, github_issue_id) DO UPDATE SET \
                     number = excluded.number, \
                     state = excluded.state, \
                     title = excluded.title, \
                     body = excluded.body, \
                     author_login = excluded.author_login, \
                     url = excluded.url, \
                     assignees = COALESCE(?9, github_issues.assignees), \
                     labels = COALESCE(?10, github_issues.labels), \
                     comments_count = COALESCE(?11, github_issues.comments_count), \
                     comments = COALESCE(?12, github_issues.comments), \
                     created_at_github = excluded.created_at_github, \
                     updated_at_github = excluded.updated_at_github, \
                     closed_at_github = excluded.closed_at_github, \
                     last_seen_at = MAX(github_issues.last_seen_at, excluded.last_seen_at)",
                params![
                    issue.project_id.to_string(),
                    issue.github_id,
                    issue.number,
                    issue.state,
                    issue.title,
                    issue.body,
                    issue.author_login,
                    issue.url,
                    assignees,
                    labels,
                    issue.comments_count,
                    comments,
                    opt_to_millis(issue.created_at),
                    opt_to_millis(issue.updated_at),
                    opt_to_millis(issue.closed_at),
                    to_millis(issue.last_seen_at),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Loads an issue snapshot by number. List fields are always populated.
    pub async fn get_issue(&self, project_id: ProjectId, number: i64) -> Result<Option<IssueSnapshot>> {
        self.with_conn("get_issue", move |conn| {
            let row = conn
                .query_row(
                    "SELECT github_issue_id, state, title, body, author_login, url, \
                            assignees, labels, comments_count, comments, \
                            created_at_github, updated_at_github, closed_at_github, last_seen_at \
                     FROM github_issues WHERE project_id = ?1 AND number = ?2",
                    params![project_id.to_string(), number],
                    |row| {
                        Ok(IssueRow {
                            github_id: row.get(0)?,
                            state: row.get(1)?,
                            title: row.get(2)?,
                            body: row.get(3)?,
                            author_login: row.get(4)?,
                            url: row.get(5)?,
                            assignees: row.get(6)?,
                            labels: row.get(7)?,
                            comments_count: row.get(8)?,
                            comments: row.get(9)?,
                            created_at: row.get(10)?,
                            updated_at: row.get(11)?,
                            closed_at: row.get(12)?,
                            last_seen_at: row.get(13)?,
                        })
                    },
                )
                .optional()?;
            row.map(|r| r.decode(project_id, number)).transpose()
        })
        .await
    }

    /// Number of issue snapshots stored for a project.
    pub async fn issue_count(&self, project_id: ProjectId) -> Result<u64> {
        self.with_conn("issue_count", move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM github_issues WHERE project_id = ?1",
                params![project_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pull requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Inserts or refreshes a pull request snapshot.
    pub async fn upsert_pull_request(&self, pr: &PullRequestSnapshot) -> Result<()> {
        let pr = pr.clone();
        self.with_conn("upsert_pull_request", move |conn| {
            let tx = conn.transaction()?;
            let replaced = tx.execute(
                "DELETE FROM github_pull_requests \
                 WHERE project_id = ?1 AND number = ?2 AND github_pr_id != ?3",
                params![pr.project_id.to_string(), pr.number, pr.github_id],
            )?;
            if replaced > 0 {
                warn!(
                    project_id = %pr.project_id,
                    number = pr.number,
                    github_id = pr.github_id,
                    "replacing pull request snapshot stored under another id"
                );
            }
            tx.execute(
                "INSERT INTO github_pull_requests (\
                     project_id, github_pr_id, number, state, title, body, author_login, url, \
                     merged, merged_at_github, created_at_github, updated_at_github, \
                     closed_at_github, last_seen_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                 ON CONFLICT (project_id, github_pr_id) DO UPDATE SET \
                     number = excluded.number, \
                     state = excluded.state, \
                     title = excluded.title, \
                     body = excluded.body, \
                     author_login = excluded.author_login, \
                     url = excluded.url, \
                     merged = excluded.merged, \
                     merged_at_github = excluded.merged_at_github, \
                     created_at_github = excluded.created_at_github, \
                     updated_at_github = excluded.updated_at_github, \
                     closed_at_github = excluded.closed_at_github, \
                     last_seen_at = MAX(github_pull_requests.last_seen_at, excluded.last_seen_at)",
                params![
                    pr.project_id.to_string(),
                    pr.github_id,
                    pr.number,
                    pr.state,
                    pr.title,
                    pr.body,
                    pr.author_login,
                    pr.url,
                    pr.merged,
                    opt_to_millis(pr.merged_at),
                    opt_to_millis(pr.created_at),
                    opt_to_millis(pr.updated_at),
                    opt_to_millis(pr.closed_at),
                    to_millis(pr.last_seen_at),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Loads a pull request snapshot by number.
    pub async fn get_pull_request(
        &self,
        project_id: ProjectId,
        number: i64,
    ) -> Result<Option<PullRequestSnapshot>> {
        self.with_conn("get_pull_request", move |conn| {
            let row = conn
                .query_row(
                    "SELECT github_pr_id, state, title, body, author_login, url, merged, \
                            merged_at_github, created_at_github, updated_at_github, \
                            closed_at_github, last_seen_at \
                     FROM github_pull_requests WHERE project_id = ?1 AND number = ?2",
                    params![project_id.to_string(), number],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, bool>(6)?,
                            row.get::<_, Option<i64>>(7)?,
                            row.get::<_, Option<i64>>(8)?,
                            row.get::<_, Option<i64>>(9)?,
                            row.get::<_, Option<i64>>(10)?,
                            row.get::<_, i64>(11)?,
                        ))
                    },
                )
                .optional()?;
            let Some((
                github_id,
                state,
                title,
                body,
                author_login,
                url,
                merged,
                merged_at,
                created_at,
                updated_at,
                closed_at,
                last_seen_at,
            )) = row
            else {
                return Ok(None);
            };
            Ok(Some(PullRequestSnapshot {
                project_id,
                github_id,
                number,
                state,
                title,
                body,
                author_login,
                url,
                merged,
                merged_at: opt_from_millis("merged_at_github", merged_at)?,
                created_at: opt_from_millis("created_at_github", created_at)?,
                updated_at: opt_from_millis("updated_at_github", updated_at)?,
                closed_at: opt_from_millis("closed_at_github", closed_at)?,
                last_seen_at: from_millis("last_seen_at", last_seen_at)?,
            }))
        })
        .await
    }

    /// Number of pull request snapshots stored for a project.
    pub async fn pull_request_count(&self, project_id: ProjectId) -> Result<u64> {
        self.with_conn("pull_request_count", move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM github_pull_requests WHERE project_id = ?1",
                params![project_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
        .await
    }
}

struct IssueRow {
    github_id: i64,
    state: String,
    title: String,
    body: String,
    author_login: String,
    url: String,
    assignees: String,
    labels: String,
    comments_count: i64,
    comments: String,
    created_at: Option<i64>,
    updated_at: Option<i64>,
    closed_at: Option<i64>,
    last_seen_at: i64,
}

impl IssueRow {
    fn decode(self, project_id: ProjectId, number: i64) -> Result<IssueSnapshot> {
        Ok(IssueSnapshot {
            project_id,
            github_id: self.github_id,
            number,
            state: self.state,
            title: self.title,
            body: self.body,
            author_login: self.author_login,
            url: self.url,
            assignees: Some(serde_json::from_str(&self.assignees)?),
            labels: Some(serde_json::from_str(&self.labels)?),
            comments_count: Some(self.comments_count),
            comments: Some(serde_json::from_str(&self.comments)?),
            created_at: opt_from_millis("created_at_github", self.created_at)?,
            updated_at: opt_from_millis("updated_at_github", self.updated_at)?,
            closed_at: opt_from_millis("closed_at_github", self.closed_at)?,
            last_seen_at: from_millis("last_seen_at", self.last_seen_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::test_support::{at, project, temp_store};

    fn issue(project_id: ProjectId, title: &str, seen: DateTime<Utc>) -> IssueSnapshot {
        IssueSnapshot {
            project_id,
            github_id: 1001,
            number: 7,
            state: "open".into(),
            title: title.into(),
            body: "It broke".into(),
            author_login: "octocat".into(),
            url: "https://github.com/acme/widgets/issues/7".into(),
            assignees: None,
            labels: None,
            comments_count: None,
            comments: None,
            created_at: Some(at(-100)),
            updated_at: Some(at(-50)),
            closed_at: None,
            last_seen_at: seen,
        }
    }

    fn pull(project_id: ProjectId, seen: DateTime<Utc>) -> PullRequestSnapshot {
        PullRequestSnapshot {
            project_id,
            github_id: 5005,
            number: 12,
            state: "closed".into(),
            title: "Add gizmo".into(),
            body: String::new(),
            author_login: "hubot".into(),
            url: "https://github.com/acme/widgets/pull/12".into(),
            merged: true,
            merged_at: Some(at(-10)),
            created_at: Some(at(-100)),
            updated_at: Some(at(-10)),
            closed_at: Some(at(-10)),
            last_seen_at: seen,
        }
    }

    mod projects {
        use super::*;

        #[tokio::test]
        async fn lookup_ignores_case() {
            let (store, _dir) = temp_store();
            let p = project(&store, "Acme/Widgets").await;

            let found = store.find_project_by_full_name("acme/widgets").await.unwrap();
            assert_eq!(found, Some(p.clone()));
            assert_eq!(store.get_project(p.id).await.unwrap(), Some(p));
        }

        #[tokio::test]
        async fn soft_deleted_projects_are_invisible() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;
            assert!(store.soft_delete_project(p.id, at(0)).await.unwrap());

            assert!(store.find_project_by_full_name("acme/widgets").await.unwrap().is_none());
            assert!(store.get_project(p.id).await.unwrap().is_none());

            // The name becomes available for a new registration.
            let again = project(&store, "acme/widgets").await;
            assert_ne!(again.id, p.id);
        }

        #[tokio::test]
        async fn unknown_repository_is_none() {
            let (store, _dir) = temp_store();
            assert!(store.find_project_by_full_name("nobody/nothing").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn linked_account_token_is_replaced() {
            let (store, _dir) = temp_store();
            let user = Uuid::new_v4();
            assert_eq!(store.access_token_for_user(user).await.unwrap(), None);

            store.link_account(user, "octocat", "gho_old").await.unwrap();
            store.link_account(user, "octocat", "gho_new").await.unwrap();
            assert_eq!(
                store.access_token_for_user(user).await.unwrap().as_deref(),
                Some("gho_new")
            );
        }
    }

    mod deliveries {
        use super::*;

        fn delivery(id: &str) -> WebhookDelivery {
            WebhookDelivery {
                delivery_id: DeliveryId::new(id),
                project_id: None,
                repo_full_name: "acme/widgets".into(),
                event: "issues".into(),
                action: Some("opened".into()),
                payload: r#"{"action":"opened"}"#.into(),
                received_at: at(0),
            }
        }

        #[tokio::test]
        async fn duplicate_delivery_is_ignored() {
            let (store, _dir) = temp_store();
            assert!(store.record_delivery(&delivery("d-1")).await.unwrap());

            let mut redelivery = delivery("d-1");
            redelivery.action = Some("edited".into());
            assert!(!store.record_delivery(&redelivery).await.unwrap());

            assert_eq!(store.delivery_count().await.unwrap(), 1);
            let stored = store.get_delivery(&DeliveryId::new("d-1")).await.unwrap().unwrap();
            assert_eq!(stored.action.as_deref(), Some("opened"));
        }

        #[tokio::test]
        async fn delivery_keeps_project_reference() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;
            let mut d = delivery("d-2");
            d.project_id = Some(p.id);
            store.record_delivery(&d).await.unwrap();

            let stored = store.get_delivery(&d.delivery_id).await.unwrap().unwrap();
            assert_eq!(stored, d);
        }
    }

    mod issues {
        use super::*;

        #[tokio::test]
        async fn upsert_is_idempotent() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;
            let snapshot = issue(p.id, "Broken", at(0));

            store.upsert_issue(&snapshot).await.unwrap();
            store.upsert_issue(&snapshot).await.unwrap();

            assert_eq!(store.issue_count(p.id).await.unwrap(), 1);
            let stored = store.get_issue(p.id, 7).await.unwrap().unwrap();
            assert_eq!(stored.title, "Broken");
            assert_eq!(stored.assignees, Some(json!([])));
            assert_eq!(stored.comments_count, Some(0));
        }

        #[tokio::test]
        async fn last_seen_never_regresses() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;

            store.upsert_issue(&issue(p.id, "Newer", at(100))).await.unwrap();
            store.upsert_issue(&issue(p.id, "Older", at(50))).await.unwrap();

            let stored = store.get_issue(p.id, 7).await.unwrap().unwrap();
            assert_eq!(stored.last_seen_at, at(100));
            // Scalar fields still take the latest write.
            assert_eq!(stored.title, "Older");
        }

        #[tokio::test]
        async fn absent_lists_keep_stored_values() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;

            let mut full = issue(p.id, "Broken", at(0));
            full.assignees = Some(json!([{"login": "octocat"}]));
            full.labels = Some(json!([{"name": "bug"}]));
            full.comments_count = Some(2);
            full.comments = Some(json!([{"id": 1}, {"id": 2}]));
            store.upsert_issue(&full).await.unwrap();

            // A webhook-sourced write that carries no lists.
            store.upsert_issue(&issue(p.id, "Still broken", at(1))).await.unwrap();

            let stored = store.get_issue(p.id, 7).await.unwrap().unwrap();
            assert_eq!(stored.title, "Still broken");
            assert_eq!(stored.assignees, full.assignees);
            assert_eq!(stored.labels, full.labels);
            assert_eq!(stored.comments_count, Some(2));
            assert_eq!(stored.comments, full.comments);
        }

        #[tokio::test]
        async fn provided_lists_overwrite() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;

            let mut first = issue(p.id, "Broken", at(0));
            first.labels = Some(json!([{"name": "bug"}]));
            store.upsert_issue(&first).await.unwrap();

            let mut second = issue(p.id, "Broken", at(1));
            second.labels = Some(json!([]));
            store.upsert_issue(&second).await.unwrap();

            let stored = store.get_issue(p.id, 7).await.unwrap().unwrap();
            assert_eq!(stored.labels, Some(json!([])));
        }

        #[tokio::test]
        async fn same_number_in_other_project_is_separate() {
            let (store, _dir) = temp_store();
            let a = project(&store, "acme/widgets").await;
            let b = project(&store, "acme/gadgets").await;

            store.upsert_issue(&issue(a.id, "A", at(0))).await.unwrap();
            store.upsert_issue(&issue(b.id, "B", at(0))).await.unwrap();

            assert_eq!(store.get_issue(a.id, 7).await.unwrap().unwrap().title, "A");
            assert_eq!(store.get_issue(b.id, 7).await.unwrap().unwrap().title, "B");
        }

        #[tokio::test]
        async fn number_moves_to_the_id_that_claims_it() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;

            // A row for #7 stored under a bogus id.
            let mut bogus = issue(p.id, "Placeholder", at(0));
            bogus.github_id = 0;
            store.upsert_issue(&bogus).await.unwrap();

            store.upsert_issue(&issue(p.id, "Real", at(1))).await.unwrap();

            assert_eq!(store.issue_count(p.id).await.unwrap(), 1);
            let stored = store.get_issue(p.id, 7).await.unwrap().unwrap();
            assert_eq!(stored.github_id, 1001);
            assert_eq!(stored.title, "Real");
        }

        #[tokio::test]
        async fn renumbered_issue_evicts_previous_holder() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;
            let mut other = issue(p.id, "Other", at(0));
            other.github_id = 2002;
            other.number = 8;
            store.upsert_issue(&other).await.unwrap();
            store.upsert_issue(&issue(p.id, "Seven", at(0))).await.unwrap();

            let mut moved = issue(p.id, "Seven", at(1));
            moved.number = 8;
            store.upsert_issue(&moved).await.unwrap();

            assert_eq!(store.issue_count(p.id).await.unwrap(), 1);
            assert_eq!(store.get_issue(p.id, 8).await.unwrap().unwrap().github_id, 1001);
            assert!(store.get_issue(p.id, 7).await.unwrap().is_none());
        }
    }

    mod pull_requests {
        use super::*;

        #[tokio::test]
        async fn upsert_roundtrips_and_is_idempotent() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;
            let snapshot = pull(p.id, at(0));

            store.upsert_pull_request(&snapshot).await.unwrap();
            store.upsert_pull_request(&snapshot).await.unwrap();

            assert_eq!(store.pull_request_count(p.id).await.unwrap(), 1);
            assert_eq!(store.get_pull_request(p.id, 12).await.unwrap(), Some(snapshot));
        }

        #[tokio::test]
        async fn last_seen_never_regresses() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;

            store.upsert_pull_request(&pull(p.id, at(100))).await.unwrap();
            let mut reopened = pull(p.id, at(10));
            reopened.state = "open".into();
            reopened.merged = false;
            reopened.merged_at = None;
            store.upsert_pull_request(&reopened).await.unwrap();

            let stored = store.get_pull_request(p.id, 12).await.unwrap().unwrap();
            assert_eq!(stored.last_seen_at, at(100));
            assert_eq!(stored.state, "open");
            assert!(!stored.merged);
        }

        #[tokio::test]
        async fn number_moves_to_the_id_that_claims_it() {
            let (store, _dir) = temp_store();
            let p = project(&store, "acme/widgets").await;
            let mut bogus = pull(p.id, at(0));
            bogus.github_id = 0;
            store.upsert_pull_request(&bogus).await.unwrap();

            store.upsert_pull_request(&pull(p.id, at(1))).await.unwrap();

            assert_eq!(store.pull_request_count(p.id).await.unwrap(), 1);
            let stored = store.get_pull_request(p.id, 12).await.unwrap().unwrap();
            assert_eq!(stored.github_id, 5005);
        }
    }

    mod monotonicity {
        use proptest::prelude::*;

        use super::*;
        use crate::store::Store;

        fn runtime() -> tokio::runtime::Runtime {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
        }

        /// `(seconds offset of last_seen_at, title, state)` per write.
        fn write_sequence() -> impl Strategy<Value = Vec<(i64, String, bool)>> {
            proptest::collection::vec((-1_000i64..1_000, "[a-z]{1,12}", any::<bool>()), 1..20)
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn issue_fields_follow_last_write_and_last_seen_is_max(writes in write_sequence()) {
                let rt = runtime();
                let (last, max) = rt.block_on(async {
                    let store = Store::open_in_memory().unwrap();
                    let p = project(&store, "acme/widgets").await;
                    for (offset, title, open) in &writes {
                        let mut snapshot = issue(p.id, title, at(*offset));
                        snapshot.state = if *open { "open" } else { "closed" }.into();
                        store.upsert_issue(&snapshot).await.unwrap();
                    }
                    let stored = store.get_issue(p.id, 7).await.unwrap().unwrap();
                    prop_assert_eq!(store.issue_count(p.id).await.unwrap(), 1);
                    Ok((stored, writes.iter().map(|w| w.0).max().unwrap()))
                })?;
                let (_, title, open) = writes.last().unwrap();
                prop_assert_eq!(&last.title, title);
                prop_assert_eq!(last.state.as_str(), if *open { "open" } else { "closed" });
                prop_assert_eq!(last.last_seen_at, at(max));
            }

            #[test]
            fn pull_fields_follow_last_write_and_last_seen_is_max(writes in write_sequence()) {
                let rt = runtime();
                let (last, max) = rt.block_on(async {
                    let store = Store::open_in_memory().unwrap();
                    let p = project(&store, "acme/widgets").await;
                    for (offset, title, merged) in &writes {
                        let mut snapshot = pull(p.id, at(*offset));
                        snapshot.title = title.clone();
                        snapshot.merged = *merged;
                        store.upsert_pull_request(&snapshot).await.unwrap();
                    }
                    let stored = store.get_pull_request(p.id, 12).await.unwrap().unwrap();
                    prop_assert_eq!(store.pull_request_count(p.id).await.unwrap(), 1);
                    Ok((stored, writes.iter().map(|w| w.0).max().unwrap()))
                })?;
                let (_, title, merged) = writes.last().unwrap();
                prop_assert_eq!(&last.title, title);
                prop_assert_eq!(last.merged, *merged);
                prop_assert_eq!(last.last_seen_at, at(max));
            }
        }
    }
}
