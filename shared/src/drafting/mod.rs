//! Generative drafting client.
//!
//! Wraps a single call to a text-generation provider, turns its free-form
//! output into a validated [`Analysis`], and bounds the whole exchange with a
//! hard timeout. Every failure mode collapses into one [`DraftingError`]; the
//! caller always has the heuristic analyzer to fall back on.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::{Config, ProviderKind};
use crate::models::{AiSettings, Analysis, Customer, Persona, Ticket};
use crate::secrets::get_api_key;

pub mod bedrock;
pub mod http;
pub mod parse;

pub use bedrock::BedrockGenerator;
pub use http::HttpGenerator;
pub use parse::{extract_json, validate_analysis};

/// Why a generative draft could not be produced.
#[derive(Error, Debug)]
pub enum DraftingError {
    #[error("provider call failed: {0}")]
    Provider(String),
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed model output: {0}")]
    MalformedOutput(String),
    #[error("model output violates schema: {0}")]
    SchemaViolation(String),
}

/// A single request to a text-generation provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub max_tokens: i32,
}

/// A black-box text generation capability. Output is untrusted.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, DraftingError>;
}

/// Produces AI drafts for tickets through a [`TextGenerator`].
#[derive(Clone)]
pub struct DraftingClient {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl DraftingClient {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    /// Draft a response for `ticket`. Fails closed.
    pub async fn generate(
        &self,
        ticket: &Ticket,
        customer: &Customer,
        settings: &AiSettings,
    ) -> Result<Analysis, DraftingError> {
        let prompt = build_prompt(ticket, customer, settings);

        let output = tokio::time::timeout(self.timeout, self.generator.complete(&prompt))
            .await
            .map_err(|_| DraftingError::Timeout(self.timeout))??;

        let value = extract_json(&output)?;
        validate_analysis(&value)
    }
}

/// Build the provider client selected by configuration, if any.
pub async fn client_from_config(
    config: &Config,
    sdk_config: &aws_config::SdkConfig,
) -> crate::Result<Option<DraftingClient>> {
    let generator: Arc<dyn TextGenerator> = match &config.provider {
        ProviderKind::None => {
            info!("No generative provider configured; runs will use heuristic drafts");
            return Ok(None);
        }
        ProviderKind::Bedrock { model_id } => Arc::new(BedrockGenerator::new(
            aws_sdk_bedrockruntime::Client::new(sdk_config),
            model_id.clone(),
        )),
        ProviderKind::Http {
            endpoint,
            model,
            api_key_secret_arn,
        } => {
            let api_key = match api_key_secret_arn {
                Some(arn) => {
                    let secrets = aws_sdk_secretsmanager::Client::new(sdk_config);
                    Some(get_api_key(&secrets, arn).await?)
                }
                None => None,
            };
            Arc::new(HttpGenerator::new(
                reqwest::Client::new(),
                endpoint.clone(),
                model.clone(),
                api_key,
            ))
        }
    };

    Ok(Some(DraftingClient::new(generator, config.ai_timeout)))
}

fn persona_guidance(persona: Persona) -> &'static str {
    match persona {
        Persona::Professional => "professional: courteous, precise and formal",
        Persona::Friendly => "friendly: warm, upbeat and conversational",
        Persona::Concise => "concise: brief and to the point, no filler",
    }
}

fn tone_guidance(tone_value: i32) -> &'static str {
    match tone_value {
        i32::MIN..=33 => "reserved",
        34..=66 => "balanced",
        _ => "expressive",
    }
}

/// Build the request: schema-bearing system instruction plus ticket details.
pub fn build_prompt(ticket: &Ticket, customer: &Customer, settings: &AiSettings) -> Prompt {
    let system = format!(
        r#"You are a customer support assistant. Analyze the ticket and draft a reply.

Respond with ONLY a JSON object of exactly this shape:
{{
  "intent": string (short label for what the customer wants),
  "urgency": "low" | "medium" | "high",
  "confidence": integer 0-100 (how confident you are the draft resolves the ticket),
  "sentiment": integer 1-10 (1 = very negative, 10 = very positive),
  "draftResponse": string (the reply to send to the customer)
}}

Constraints:
- Persona: {persona}
- Keep draftResponse under {max_words} words.
- Tone strength: {tone}/100 ({tone_label}).
- Do not invent order numbers, tracking numbers or policies."#,
        persona = persona_guidance(settings.persona),
        max_words = settings.max_response_length,
        tone = settings.tone_value,
        tone_label = tone_guidance(settings.tone_value),
    );

    let user = format!(
        "Customer name: {}\nCustomer email: {}\nCategory: {}\nPriority: {}\nSubject: {}\n\n{}",
        customer.name,
        customer.email,
        ticket.category,
        ticket.priority,
        ticket.subject,
        ticket.content,
    );

    Prompt {
        system,
        user,
        // Roughly two tokens per word plus room for the JSON envelope.
        max_tokens: settings.max_response_length * 2 + 256,
    }
}
