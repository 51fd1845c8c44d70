//! Amazon Bedrock text generation via the Converse API.

use async_trait::async_trait;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ConversationRole, InferenceConfiguration, Message, SystemContentBlock,
};
use aws_sdk_bedrockruntime::Client as BedrockClient;

use super::{DraftingError, Prompt, TextGenerator};

pub struct BedrockGenerator {
    client: BedrockClient,
    model_id: String,
}

impl BedrockGenerator {
    pub fn new(client: BedrockClient, model_id: String) -> Self {
        Self { client, model_id }
    }
}

#[async_trait]
impl TextGenerator for BedrockGenerator {
    async fn complete(&self, prompt: &Prompt) -> Result<String, DraftingError> {
        let message = Message::builder()
            .role(ConversationRole::User)
            .content(ContentBlock::Text(prompt.user.clone()))
            .build()
            .map_err(|e| DraftingError::Provider(format!("Failed to build message: {}", e)))?;

        let response = self
            .client
            .converse()
            .model_id(&self.model_id)
            .system(SystemContentBlock::Text(prompt.system.clone()))
            .messages(message)
            .inference_config(
                InferenceConfiguration::builder()
                    .max_tokens(prompt.max_tokens)
                    .temperature(0.3)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| DraftingError::Provider(format!("Bedrock converse failed: {}", e)))?;

        let text: String = response
            .output()
            .and_then(|output| output.as_message().ok())
            .map(|message| {
                message
                    .content()
                    .iter()
                    .filter_map(|block| block.as_text().ok())
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(DraftingError::MalformedOutput(
                "Bedrock returned no text content".to_string(),
            ));
        }

        Ok(text)
    }
}
