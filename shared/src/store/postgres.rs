//! Postgres-backed ticket store.

use async_trait::async_trait;
use aws_sdk_sns::Client as SnsClient;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::TicketStore;
use crate::models::{
    AiRun, AiSettings, Analysis, Customer, DraftSource, NewNotification, RawAiSettings,
    RunCompletion, Ticket, TicketPatch,
};
use crate::{Config, Error, Result};

const TICKET_COLUMNS: &str = r#"
    id, org_id, customer_id, subject, content,
    category, priority, status, ai_status,
    latest_run_id, draft_response, draft_updated_at,
    confidence, sentiment, version, created_at, updated_at
"#;

const RUN_COLUMNS: &str = r#"
    id, ticket_id, status, started_at, finished_at,
    intent, urgency, confidence, sentiment, draft_response,
    source, error, dispatch_attempts, last_dispatched_at, created_at
"#;

/// Ticket row as stored
#[derive(Debug, sqlx::FromRow)]
struct TicketRow {
    id: Uuid,
    org_id: Uuid,
    customer_id: Uuid,
    subject: String,
    content: String,
    category: String,
    priority: String,
    status: String,
    ai_status: Option<String>,
    latest_run_id: Option<Uuid>,
    draft_response: Option<String>,
    draft_updated_at: Option<DateTime<Utc>>,
    confidence: Option<i32>,
    sentiment: Option<i32>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = Error;

    fn try_from(row: TicketRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            org_id: row.org_id,
            customer_id: row.customer_id,
            subject: row.subject,
            content: row.content,
            category: row.category.parse()?,
            priority: row.priority.parse()?,
            status: row.status.parse()?,
            ai_status: row.ai_status.as_deref().map(str::parse).transpose()?,
            latest_run_id: row.latest_run_id,
            draft_response: row.draft_response,
            draft_updated_at: row.draft_updated_at,
            confidence: row.confidence,
            sentiment: row.sentiment,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// AI run row as stored
#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    ticket_id: Uuid,
    status: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    intent: Option<String>,
    urgency: Option<String>,
    confidence: Option<i32>,
    sentiment: Option<i32>,
    draft_response: Option<String>,
    source: Option<String>,
    error: Option<String>,
    dispatch_attempts: i32,
    last_dispatched_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for AiRun {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            ticket_id: row.ticket_id,
            status: row.status.parse()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            intent: row.intent,
            urgency: row.urgency.as_deref().map(str::parse).transpose()?,
            confidence: row.confidence,
            sentiment: row.sentiment,
            draft_response: row.draft_response,
            source: row.source.as_deref().map(str::parse).transpose()?,
            error: row.error,
            dispatch_attempts: row.dispatch_attempts,
            last_dispatched_at: row.last_dispatched_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SettingsRow {
    ai_enabled: bool,
    selected_persona: Option<String>,
    max_response_length: Option<i32>,
    tone_value: Option<i32>,
    confidence_threshold: Option<i32>,
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: Uuid,
    name: Option<String>,
    email: Option<String>,
}

/// Ticket store over the support desk Postgres database.
pub struct PgTicketStore {
    pool: PgPool,
    sns_client: Option<SnsClient>,
    notification_topic_arn: Option<String>,
}

impl PgTicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sns_client: None,
            notification_topic_arn: None,
        }
    }

    /// Connect using the environment configuration, publishing notifications
    /// when `NOTIFICATION_TOPIC_ARN` is set.
    pub async fn connect(config: &Config, sdk_config: &aws_config::SdkConfig) -> Result<Self> {
        let pool = crate::db::connect(config, sdk_config).await?;
        let store = Self::new(pool);
        Ok(match &config.notification_topic_arn {
            Some(topic_arn) => store.with_notification_topic(SnsClient::new(sdk_config), topic_arn.clone()),
            None => store,
        })
    }

    /// Also publish inserted notifications to an SNS topic.
    pub fn with_notification_topic(mut self, sns_client: SnsClient, topic_arn: String) -> Self {
        self.sns_client = Some(sns_client);
        self.notification_topic_arn = Some(topic_arn);
        self
    }

    async fn publish_notification(&self, notification_id: Uuid, notification: &NewNotification) {
        let (Some(client), Some(topic_arn)) = (&self.sns_client, &self.notification_topic_arn) else {
            return;
        };

        let message = serde_json::json!({
            "notification_id": notification_id.to_string(),
            "type": notification.kind,
            "priority": notification.priority.as_str(),
            "title": notification.title,
            "ticket_id": notification.ticket_id.map(|id| id.to_string()),
        });

        if let Err(e) = client
            .publish()
            .topic_arn(topic_arn)
            .message(message.to_string())
            .send()
            .await
        {
            warn!(notification_id = %notification_id, error = %e, "Failed to publish notification to SNS");
        }
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>> {
        let row: Option<TicketRow> =
            sqlx::query_as(&format!("SELECT {} FROM tickets WHERE id = $1", TICKET_COLUMNS))
                .bind(ticket_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Ticket::try_from).transpose()
    }

    async fn update_ticket(
        &self,
        ticket_id: Uuid,
        expected_version: Option<i64>,
        patch: TicketPatch,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tickets
            SET status = COALESCE($2, status),
                ai_status = CASE WHEN $3 THEN $4 ELSE ai_status END,
                latest_run_id = COALESCE($5, latest_run_id),
                draft_response = COALESCE($6, draft_response),
                confidence = COALESCE($7, confidence),
                sentiment = COALESCE($8, sentiment),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            AND ($9::bigint IS NULL OR version = $9)
            "#,
        )
        .bind(ticket_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.ai_status.is_some())
        .bind(patch.ai_status.flatten().map(|s| s.as_str()))
        .bind(patch.latest_run_id)
        .bind(patch.draft_response)
        .bind(patch.confidence)
        .bind(patch.sentiment)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_draft_edit(&self, ticket_id: Uuid, draft: &str) -> Result<Option<i64>> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE tickets
            SET draft_response = $2,
                draft_updated_at = NOW(),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING version
            "#,
        )
        .bind(ticket_id)
        .bind(draft)
        .fetch_optional(&self.pool)
        .await?;

        Ok(version)
    }

    async fn get_org_settings(&self, org_id: Uuid) -> Result<AiSettings> {
        let row: Option<SettingsRow> = sqlx::query_as(
            r#"
            SELECT
                ai_enabled,
                selected_persona,
                max_response_length,
                tone_value,
                confidence_threshold
            FROM ai_settings
            WHERE org_id = $1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => AiSettings::from_raw(RawAiSettings {
                ai_enabled: row.ai_enabled,
                selected_persona: row.selected_persona,
                max_response_length: row.max_response_length,
                tone_value: row.tone_value,
                confidence_threshold: row.confidence_threshold,
            }),
            None => AiSettings::default(),
        })
    }

    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>> {
        let row: Option<CustomerRow> =
            sqlx::query_as("SELECT id, name, email FROM customers WHERE id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|row| Customer {
            id: row.id,
            name: row.name.unwrap_or_default(),
            email: row.email.unwrap_or_default(),
        }))
    }

    async fn insert_run(&self, ticket_id: Uuid) -> Result<AiRun> {
        let row: RunRow = sqlx::query_as(&format!(
            "INSERT INTO ai_runs (ticket_id, status) VALUES ($1, 'queued') RETURNING {}",
            RUN_COLUMNS
        ))
        .bind(ticket_id)
        .fetch_one(&self.pool)
        .await?;

        AiRun::try_from(row)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<AiRun>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {} FROM ai_runs WHERE id = $1", RUN_COLUMNS))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(AiRun::try_from).transpose()
    }

    async fn start_run(&self, run_id: Uuid) -> Result<Option<AiRun>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            r#"
            UPDATE ai_runs
            SET status = 'running',
                started_at = COALESCE(started_at, NOW())
            WHERE id = $1
            AND status IN ('queued', 'running')
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AiRun::try_from).transpose()
    }

    async fn record_run_output(&self, run_id: Uuid, analysis: &Analysis, source: DraftSource) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ai_runs
            SET intent = $2,
                urgency = $3,
                confidence = $4,
                sentiment = $5,
                draft_response = $6,
                source = $7
            WHERE id = $1
            AND status IN ('queued', 'running')
            "#,
        )
        .bind(run_id)
        .bind(&analysis.intent)
        .bind(analysis.urgency.as_str())
        .bind(analysis.confidence)
        .bind(analysis.sentiment)
        .bind(&analysis.draft_response)
        .bind(source.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_run(&self, run_id: Uuid, completion: RunCompletion) -> Result<bool> {
        let status = completion.status();
        let error = match completion {
            RunCompletion::Done => None,
            RunCompletion::Failed { error } => Some(error),
        };

        let result = sqlx::query(
            r#"
            UPDATE ai_runs
            SET status = $2,
                finished_at = NOW(),
                error = $3
            WHERE id = $1
            AND status IN ('queued', 'running')
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_dispatch(&self, run_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ai_runs
            SET dispatch_attempts = dispatch_attempts + 1,
                last_dispatched_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_stale_queued_runs(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<AiRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM ai_runs
            WHERE status = 'queued'
            AND COALESCE(last_dispatched_at, created_at) < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            RUN_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AiRun::try_from).collect()
    }

    async fn insert_notification(&self, notification: NewNotification) -> Result<Uuid> {
        let notification_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO notifications (
                org_id, type, priority, title, message, ticket_id
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(notification.org_id)
        .bind(&notification.kind)
        .bind(notification.priority.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.ticket_id)
        .fetch_one(&self.pool)
        .await?;

        info!(notification_id = %notification_id, kind = %notification.kind, "Notification queued");
        self.publish_notification(notification_id, &notification).await;

        Ok(notification_id)
    }
}
