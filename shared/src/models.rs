//! Shared data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Declares a text-backed enum with `as_str`, `Display` and `FromStr`.
///
/// Stored columns are plain `text`, so rows carry `String`s that are parsed
/// through `FromStr` when converted into domain types.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::Validation(format!(
                        "invalid {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(
    /// Ticket category.
    Category {
        Refund => "refund",
        Shipping => "shipping",
        Product => "product",
        Billing => "billing",
        General => "general",
    }
);

text_enum!(
    /// Priority of a ticket or notification.
    Priority {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
);

text_enum!(
    /// Ticket workflow status.
    TicketStatus {
        Open => "open",
        Resolved => "resolved",
    }
);

text_enum!(
    /// AI involvement state shown on a ticket.
    AiStatus {
        Pending => "pending",
        DraftReady => "draft_ready",
        HumanNeeded => "human_needed",
    }
);

text_enum!(
    /// Lifecycle state of an AI run.
    RunStatus {
        Queued => "queued",
        Running => "running",
        Done => "done",
        Error => "error",
    }
);

text_enum!(
    /// Urgency assessed for a ticket.
    Urgency {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
);

text_enum!(
    /// Tone/phrasing profile applied to drafts.
    Persona {
        Professional => "professional",
        Friendly => "friendly",
        Concise => "concise",
    }
);

text_enum!(
    /// Where a run's output came from.
    DraftSource {
        Generative => "generative",
        Heuristic => "heuristic",
    }
);

impl RunStatus {
    /// Terminal runs are never re-entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error)
    }

    /// Queued or running.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }
}

/// A customer support request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: Uuid,
    pub org_id: Uuid,
    pub customer_id: Uuid,
    pub subject: String,
    pub content: String,
    pub category: Category,
    pub priority: Priority,
    pub status: TicketStatus,
    pub ai_status: Option<AiStatus>,
    pub latest_run_id: Option<Uuid>,
    pub draft_response: Option<String>,
    pub draft_updated_at: Option<DateTime<Utc>>,
    pub confidence: Option<i32>,
    pub sentiment: Option<i32>,
    /// Incremented on every write; used for compare-and-swap updates.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial ticket update.
///
/// Outer `None` leaves a column untouched; `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketPatch {
    pub status: Option<TicketStatus>,
    pub ai_status: Option<Option<AiStatus>>,
    pub latest_run_id: Option<Uuid>,
    pub draft_response: Option<String>,
    pub confidence: Option<i32>,
    pub sentiment: Option<i32>,
}

impl TicketPatch {
    /// Apply the patch to an in-memory ticket (version/timestamps excluded).
    pub fn apply_to(&self, ticket: &mut Ticket) {
        if let Some(status) = self.status {
            ticket.status = status;
        }
        if let Some(ai_status) = self.ai_status {
            ticket.ai_status = ai_status;
        }
        if let Some(run_id) = self.latest_run_id {
            ticket.latest_run_id = Some(run_id);
        }
        if let Some(draft) = &self.draft_response {
            ticket.draft_response = Some(draft.clone());
        }
        if let Some(confidence) = self.confidence {
            ticket.confidence = Some(confidence);
        }
        if let Some(sentiment) = self.sentiment {
            ticket.sentiment = Some(sentiment);
        }
    }
}

/// Contact details of the customer who opened a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

/// One attempt to produce an AI draft for a ticket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiRun {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub intent: Option<String>,
    pub urgency: Option<Urgency>,
    pub confidence: Option<i32>,
    pub sentiment: Option<i32>,
    pub draft_response: Option<String>,
    pub source: Option<DraftSource>,
    pub error: Option<String>,
    pub dispatch_attempts: i32,
    pub last_dispatched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Structured result of analyzing a ticket, whether generated or heuristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub intent: String,
    pub urgency: Urgency,
    pub confidence: i32,
    pub sentiment: i32,
    pub draft_response: String,
}

/// Terminal write for a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunCompletion {
    Done,
    Failed { error: String },
}

impl RunCompletion {
    pub fn status(&self) -> RunStatus {
        match self {
            RunCompletion::Done => RunStatus::Done,
            RunCompletion::Failed { .. } => RunStatus::Error,
        }
    }

    /// Apply to an in-memory run record.
    pub fn apply_to(&self, run: &mut AiRun, finished_at: DateTime<Utc>) {
        run.status = self.status();
        run.finished_at = Some(finished_at);
        if let RunCompletion::Failed { error } = self {
            run.error = Some(error.clone());
        }
    }
}

impl AiRun {
    /// Record generated output on an in-memory run record.
    pub fn set_output(&mut self, analysis: &Analysis, source: DraftSource) {
        self.intent = Some(analysis.intent.clone());
        self.urgency = Some(analysis.urgency);
        self.confidence = Some(analysis.confidence);
        self.sentiment = Some(analysis.sentiment);
        self.draft_response = Some(analysis.draft_response.clone());
        self.source = Some(source);
    }
}

/// Word budget bounds for generated drafts.
pub const MIN_RESPONSE_WORDS: i32 = 50;
pub const MAX_RESPONSE_WORDS: i32 = 2000;

/// Per-organization AI settings as stored, before validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawAiSettings {
    pub ai_enabled: bool,
    pub selected_persona: Option<String>,
    pub max_response_length: Option<i32>,
    pub tone_value: Option<i32>,
    pub confidence_threshold: Option<i32>,
}

/// Validated, immutable AI settings for one organization.
///
/// Built once when a run starts processing and passed by value, so a settings
/// change mid-run never reaches a run already in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSettings {
    pub ai_enabled: bool,
    pub persona: Persona,
    pub max_response_length: i32,
    pub tone_value: i32,
    /// Advisory only; consumed by automation outside the pipeline.
    pub confidence_threshold: i32,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            ai_enabled: true,
            persona: Persona::Professional,
            max_response_length: 250,
            tone_value: 50,
            confidence_threshold: 80,
        }
    }
}

impl AiSettings {
    /// Normalize stored settings. Unknown personas fall back to the default
    /// persona and numeric fields are clamped into their valid ranges.
    pub fn from_raw(raw: RawAiSettings) -> Self {
        let defaults = Self::default();
        let persona = raw
            .selected_persona
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.persona);

        Self {
            ai_enabled: raw.ai_enabled,
            persona,
            max_response_length: raw
                .max_response_length
                .unwrap_or(defaults.max_response_length)
                .clamp(MIN_RESPONSE_WORDS, MAX_RESPONSE_WORDS),
            tone_value: raw.tone_value.unwrap_or(defaults.tone_value).clamp(0, 100),
            confidence_threshold: raw
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold)
                .clamp(0, 100),
        }
    }

    pub fn disabled() -> Self {
        Self {
            ai_enabled: false,
            ..Self::default()
        }
    }
}

/// Operator-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    pub org_id: Uuid,
    pub kind: String,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub ticket_id: Option<Uuid>,
}
