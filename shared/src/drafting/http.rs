//! OpenAI-compatible chat completions over HTTP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DraftingError, Prompt, TextGenerator};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: i32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub struct HttpGenerator {
    http_client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    pub fn new(
        http_client: reqwest::Client,
        endpoint: String,
        model: String,
        api_key: Option<String>,
    ) -> Self {
        Self {
            http_client,
            endpoint,
            model,
            api_key,
        }
    }
}

#[async_trait]
impl TextGenerator for HttpGenerator {
    async fn complete(&self, prompt: &Prompt) -> Result<String, DraftingError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: prompt.max_tokens,
            temperature: 0.3,
        };

        let mut builder = self.http_client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DraftingError::Provider(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DraftingError::Http {
                status,
                body: body.chars().take(500).collect(),
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| DraftingError::MalformedOutput(format!("Invalid provider response: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| DraftingError::MalformedOutput("Provider returned no content".to_string()))
    }
}
