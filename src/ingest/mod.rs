//! Applies verified webhook deliveries to the store.
//!
//! For each delivery the ingestor:
//!
//! 1. Resolves the repository and maps it to a project.
//! 2. Appends the delivery to the audit log (keyed by delivery ID).
//! 3. Upserts the issue or pull request snapshot the payload carries.
//! 4. Enqueues a `sync_issues` and a `sync_prs` job for the project.
//!
//! A redelivery (audit row already present) stops after step 2: its effects
//! were already applied the first time. Deliveries without an ID cannot be
//! deduplicated and are always applied.
//!
//! Ingestion never fails its caller. Store errors are logged, counted in the
//! [`IngestReport`], and the remaining steps still run.

use chrono::{DateTime, Utc};
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::BusMessage;
use crate::store::Store;
use crate::types::{JobKind, Project, ProjectId, WebhookDelivery};
use crate::webhooks::{PartialEnvelope, WebhookReceived};

/// What a single ingestion did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub project_id: Option<ProjectId>,
    /// The audit row was written by this call.
    pub recorded: bool,
    /// The delivery ID was already in the audit log; nothing else ran.
    pub duplicate: bool,
    pub issue_upserted: bool,
    pub pull_request_upserted: bool,
    pub jobs_enqueued: usize,
    /// Store operations that failed and were skipped.
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct WebhookIngestor {
    store: Store,
}

impl WebhookIngestor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn ingest(&self, msg: &WebhookReceived) -> IngestReport {
        self.ingest_at(msg, Utc::now()).await
    }

    #[instrument(
        skip(self, msg),
        fields(delivery_id = %msg.delivery_id, event = %msg.event)
    )]
    pub async fn ingest_at(&self, msg: &WebhookReceived, now: DateTime<Utc>) -> IngestReport {
        let mut report = IngestReport::default();
        let envelope = PartialEnvelope::parse(msg.payload.as_bytes());

        let repo_full_name = Some(msg.repo_full_name.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| envelope.repo_full_name.clone())
            .unwrap_or_default();
        let action = Some(msg.action.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| envelope.action.clone());

        let project = self.resolve_project(&repo_full_name, &mut report).await;
        report.project_id = project.as_ref().map(|p| p.id);

        if !msg.delivery_id.is_empty() {
            let delivery = WebhookDelivery {
                delivery_id: msg.delivery_id.clone(),
                project_id: report.project_id,
                repo_full_name: repo_full_name.clone(),
                event: msg.event.clone(),
                action: action.clone(),
                payload: msg.payload.clone(),
                received_at: now,
            };
            match self.store.record_delivery(&delivery).await {
                Ok(true) => report.recorded = true,
                Ok(false) => {
                    info!("duplicate delivery; already applied");
                    report.duplicate = true;
                    return report;
                }
                Err(e) => {
                    warn!(error = %e, "failed to record delivery");
                    report.errors += 1;
                }
            }
        }

        let Some(project) = project else {
            debug!(repo = %repo_full_name, "no project for repository");
            return report;
        };

        self.apply_snapshot(&msg.event, &envelope, &project, now, &mut report)
            .await;

        match self.store.enqueue(project.id, &JobKind::ALL, now).await {
            Ok(jobs) => report.jobs_enqueued = jobs.len(),
            Err(e) => {
                warn!(project_id = %project.id, error = %e, "failed to enqueue sync jobs");
                report.errors += 1;
            }
        }

        info!(
            project_id = %project.id,
            action = action.as_deref().unwrap_or(""),
            issue = report.issue_upserted,
            pull_request = report.pull_request_upserted,
            jobs = report.jobs_enqueued,
            "ingested delivery"
        );
        report
    }

    async fn resolve_project(&self, repo_full_name: &str, report: &mut IngestReport) -> Option<Project> {
        if repo_full_name.is_empty() {
            return None;
        }
        match self.store.find_project_by_full_name(repo_full_name).await {
            Ok(project) => project,
            Err(e) => {
                warn!(repo = %repo_full_name, error = %e, "project lookup failed");
                report.errors += 1;
                None
            }
        }
    }

    async fn apply_snapshot(
        &self,
        event: &str,
        envelope: &PartialEnvelope,
        project: &Project,
        now: DateTime<Utc>,
        report: &mut IngestReport,
    ) {
        match event {
            "issues" => {
                let Some(issue) = &envelope.issue else {
                    return;
                };
                let snapshot = issue.to_scalar_snapshot(project.id, now);
                match self.store.upsert_issue(&snapshot).await {
                    Ok(()) => report.issue_upserted = true,
                    Err(e) => {
                        warn!(number = issue.number, error = %e, "issue upsert failed");
                        report.errors += 1;
                    }
                }
            }
            "pull_request" | "pull_request_review" => {
                let Some(pr) = &envelope.pull_request else {
                    return;
                };
                match self.store.upsert_pull_request(&pr.to_snapshot(project.id, now)).await {
                    Ok(()) => report.pull_request_upserted = true,
                    Err(e) => {
                        warn!(number = pr.number, error = %e, "pull request upsert failed");
                        report.errors += 1;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Ingests messages from an in-process subscription until `shutdown` fires or
/// the bus closes.
///
/// Messages already buffered when `shutdown` fires are still ingested.
#[instrument(skip_all)]
pub async fn consume(
    mut rx: broadcast::Receiver<BusMessage>,
    ingestor: WebhookIngestor,
    shutdown: CancellationToken,
) {
    info!("webhook consumer started");
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => msg,
        };
        match msg {
            Ok(msg) => handle(&ingestor, &msg).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "webhook consumer lagged; deliveries dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("webhook consumer stopped");
                return;
            }
        }
    }

    let mut drained = 0usize;
    loop {
        match rx.try_recv() {
            Ok(msg) => {
                handle(&ingestor, &msg).await;
                drained += 1;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "webhook consumer lagged; deliveries dropped");
            }
            Err(broadcast::error::TryRecvError::Empty)
            | Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }
    info!(drained, "webhook consumer stopped");
}

/// Ingests messages from a queue-group subscription until `shutdown` fires or
/// the stream ends.
///
/// On shutdown, messages the client has already received are ingested before
/// returning. Dropping the stream ends the subscription.
#[instrument(skip_all)]
pub async fn consume_stream<S>(
    mut messages: S,
    ingestor: WebhookIngestor,
    shutdown: CancellationToken,
) where
    S: Stream<Item = BusMessage> + Unpin,
{
    info!("webhook queue consumer started");
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            msg = messages.next() => msg,
        };
        match msg {
            Some(msg) => handle(&ingestor, &msg).await,
            None => {
                info!("webhook subscription closed");
                return;
            }
        }
    }

    let mut drained = 0usize;
    while let Some(Some(msg)) = messages.next().now_or_never() {
        handle(&ingestor, &msg).await;
        drained += 1;
    }
    info!(drained, "webhook queue consumer stopped");
}

async fn handle(ingestor: &WebhookIngestor, msg: &BusMessage) {
    match serde_json::from_slice::<WebhookReceived>(&msg.payload) {
        Ok(received) => {
            ingestor.ingest(&received).await;
        }
        Err(e) => warn!(subject = %msg.subject, error = %e, "undecodable bus message"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bus::{EventBus, InProcessBus, publish_json};
    use crate::store::test_support::{at, project, temp_store};
    use crate::types::{DeliveryId, JobStatus};
    use crate::webhooks::SUBJECT_WEBHOOK_RECEIVED;

    fn issue_opened(delivery: &str) -> WebhookReceived {
        let payload = json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
            "issue": {
                "id": 1001,
                "number": 7,
                "state": "open",
                "title": "Widget explodes",
                "body": "On startup.",
                "html_url": "https://github.com/acme/widgets/issues/7",
                "user": {"login": "octocat"},
                "created_at": "2024-04-30T10:00:00Z",
                "updated_at": "2024-04-30T10:00:00Z",
                "closed_at": null
            }
        });
        let body = payload.to_string();
        WebhookReceived::from_request(
            DeliveryId::new(delivery),
            "issues",
            &PartialEnvelope::parse(body.as_bytes()),
            body.as_bytes(),
        )
    }

    fn pr_review(delivery: &str) -> WebhookReceived {
        let body = json!({
            "action": "submitted",
            "repository": {"full_name": "acme/widgets"},
            "review": {"state": "approved"},
            "pull_request": {
                "id": 5005, "number": 12, "state": "open", "title": "Add gizmo",
                "user": {"login": "hubot"}, "merged": false
            }
        })
        .to_string();
        WebhookReceived::from_request(
            DeliveryId::new(delivery),
            "pull_request_review",
            &PartialEnvelope::parse(body.as_bytes()),
            body.as_bytes(),
        )
    }

    #[tokio::test]
    async fn issue_delivery_then_redelivery() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let ingestor = WebhookIngestor::new(store.clone());

        let first = ingestor.ingest_at(&issue_opened("d-1"), at(0)).await;
        assert_eq!(
            first,
            IngestReport {
                project_id: Some(p.id),
                recorded: true,
                duplicate: false,
                issue_upserted: true,
                pull_request_upserted: false,
                jobs_enqueued: 2,
                errors: 0,
            }
        );

        assert_eq!(store.delivery_count().await.unwrap(), 1);
        let issue = store.get_issue(p.id, 7).await.unwrap().unwrap();
        assert_eq!(issue.state, "open");
        assert_eq!(issue.title, "Widget explodes");
        assert_eq!(issue.author_login, "octocat");
        let jobs = store.recent_jobs(p.id, 50).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));

        let again = ingestor.ingest_at(&issue_opened("d-1"), at(5)).await;
        assert!(again.duplicate);
        assert_eq!(again.jobs_enqueued, 0);
        assert_eq!(store.delivery_count().await.unwrap(), 1);
        assert_eq!(store.issue_count(p.id).await.unwrap(), 1);
        assert_eq!(store.recent_jobs(p.id, 50).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn audit_row_keeps_event_metadata() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let ingestor = WebhookIngestor::new(store.clone());
        let msg = issue_opened("d-1");

        ingestor.ingest_at(&msg, at(0)).await;

        let row = store.get_delivery(&DeliveryId::new("d-1")).await.unwrap().unwrap();
        assert_eq!(row.project_id, Some(p.id));
        assert_eq!(row.repo_full_name, "acme/widgets");
        assert_eq!(row.event, "issues");
        assert_eq!(row.action.as_deref(), Some("opened"));
        assert_eq!(row.payload, msg.payload);
    }

    #[tokio::test]
    async fn unknown_repository_is_audited_only() {
        let (store, _dir) = temp_store();
        let ingestor = WebhookIngestor::new(store.clone());

        let report = ingestor.ingest_at(&issue_opened("d-9"), at(0)).await;
        assert!(report.recorded);
        assert_eq!(report.project_id, None);
        assert!(!report.issue_upserted);
        assert_eq!(report.jobs_enqueued, 0);

        let row = store.get_delivery(&DeliveryId::new("d-9")).await.unwrap().unwrap();
        assert_eq!(row.project_id, None);
    }

    #[tokio::test]
    async fn repository_lookup_ignores_case() {
        let (store, _dir) = temp_store();
        let p = project(&store, "Acme/Widgets").await;
        let ingestor = WebhookIngestor::new(store);

        let report = ingestor.ingest_at(&issue_opened("d-1"), at(0)).await;
        assert_eq!(report.project_id, Some(p.id));
    }

    #[tokio::test]
    async fn missing_delivery_id_is_applied_every_time() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let ingestor = WebhookIngestor::new(store.clone());

        for i in 0..2 {
            let report = ingestor.ingest_at(&issue_opened(""), at(i)).await;
            assert!(!report.recorded);
            assert!(!report.duplicate);
            assert!(report.issue_upserted);
        }
        assert_eq!(store.delivery_count().await.unwrap(), 0);
        assert_eq!(store.issue_count(p.id).await.unwrap(), 1);
        assert_eq!(store.recent_jobs(p.id, 50).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn review_event_upserts_pull_request() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let ingestor = WebhookIngestor::new(store.clone());

        let report = ingestor.ingest_at(&pr_review("d-2"), at(0)).await;
        assert!(report.pull_request_upserted);
        assert!(!report.issue_upserted);
        let pr = store.get_pull_request(p.id, 12).await.unwrap().unwrap();
        assert_eq!(pr.title, "Add gizmo");
        assert!(!pr.merged);
    }

    #[tokio::test]
    async fn other_events_still_enqueue_reconciliation() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let ingestor = WebhookIngestor::new(store.clone());

        let body = json!({"ref": "refs/heads/main", "repository": {"full_name": "acme/widgets"}})
            .to_string();
        let msg = WebhookReceived::from_request(
            DeliveryId::new("d-3"),
            "push",
            &PartialEnvelope::parse(body.as_bytes()),
            body.as_bytes(),
        );
        let report = ingestor.ingest_at(&msg, at(0)).await;
        assert_eq!(report.jobs_enqueued, 2);
        assert_eq!(store.issue_count(p.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn issues_event_without_issue_object_skips_upsert() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let ingestor = WebhookIngestor::new(store.clone());

        let body = json!({"action": "opened", "repository": {"full_name": "acme/widgets"}})
            .to_string();
        let msg = WebhookReceived::from_request(
            DeliveryId::new("d-4"),
            "issues",
            &PartialEnvelope::parse(body.as_bytes()),
            body.as_bytes(),
        );
        let report = ingestor.ingest_at(&msg, at(0)).await;
        assert!(!report.issue_upserted);
        assert_eq!(report.jobs_enqueued, 2);
        assert_eq!(store.issue_count(p.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn message_fields_take_precedence_over_envelope() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/gadgets").await;
        let ingestor = WebhookIngestor::new(store.clone());

        let mut msg = issue_opened("d-5");
        msg.repo_full_name = "acme/gadgets".into();
        msg.action = "reopened".into();
        let report = ingestor.ingest_at(&msg, at(0)).await;

        assert_eq!(report.project_id, Some(p.id));
        let row = store.get_delivery(&msg.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.action.as_deref(), Some("reopened"));
    }

    #[tokio::test]
    async fn consumer_ingests_bus_messages() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let bus = InProcessBus::default();
        let rx = bus.subscribe(SUBJECT_WEBHOOK_RECEIVED);
        let shutdown = CancellationToken::new();
        let consumer = tokio::spawn(consume(
            rx,
            WebhookIngestor::new(store.clone()),
            shutdown.clone(),
        ));

        publish_json(&bus, SUBJECT_WEBHOOK_RECEIVED, &issue_opened("d-1"))
            .await
            .unwrap();
        bus.publish(SUBJECT_WEBHOOK_RECEIVED, b"not json".to_vec())
            .await
            .unwrap();

        for _ in 0..200 {
            if store.recent_jobs(p.id, 50).await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(store.issue_count(p.id).await.unwrap(), 1);

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_buffered_messages() {
        let (store, _dir) = temp_store();
        project(&store, "acme/widgets").await;
        let bus = InProcessBus::default();
        let rx = bus.subscribe(SUBJECT_WEBHOOK_RECEIVED);
        for i in 0..50 {
            publish_json(&bus, SUBJECT_WEBHOOK_RECEIVED, &issue_opened(&format!("d-{i}")))
                .await
                .unwrap();
        }
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        consume(rx, WebhookIngestor::new(store.clone()), shutdown).await;

        assert_eq!(store.delivery_count().await.unwrap(), 50);
    }

    fn encoded(received: &WebhookReceived) -> BusMessage {
        BusMessage {
            subject: SUBJECT_WEBHOOK_RECEIVED.to_string(),
            payload: serde_json::to_vec(received).unwrap(),
        }
    }

    #[tokio::test]
    async fn queue_consumer_drains_ready_messages_on_shutdown() {
        let (store, _dir) = temp_store();
        project(&store, "acme/widgets").await;
        let messages: Vec<_> = (0..20)
            .map(|i| encoded(&issue_opened(&format!("q-{i}"))))
            .collect();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        consume_stream(
            futures::stream::iter(messages),
            WebhookIngestor::new(store.clone()),
            shutdown,
        )
        .await;

        assert_eq!(store.delivery_count().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn queue_consumer_returns_when_subscription_ends() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let messages = vec![
            encoded(&issue_opened("q-1")),
            BusMessage {
                subject: SUBJECT_WEBHOOK_RECEIVED.to_string(),
                payload: b"not json".to_vec(),
            },
            encoded(&pr_review("q-2")),
        ];

        consume_stream(
            futures::stream::iter(messages),
            WebhookIngestor::new(store.clone()),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(store.delivery_count().await.unwrap(), 2);
        assert_eq!(store.issue_count(p.id).await.unwrap(), 1);
    }
}
