//! LLM-backed strategy proposer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::ProposerError;
use crate::policy::types::Action;
use crate::proposer::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::proposer::{
    Alternative, AlternativeRequest, Pattern, PatternRequest, ProposerConfig, StrategyProposer,
};

const ALTERNATIVE_SYSTEM_PROMPT: &str = "You invent alternative email handling strategies so an \
     assistant can test them against user feedback. Always answer with a single JSON object.";

const SYNTHESIS_SYSTEM_PROMPT: &str = "You extract generalizable rules from email decisions that \
     users confirmed. Always answer with a single JSON object.";

/// Proposer that asks a chat model for alternatives and pattern descriptions.
pub struct LlmProposer {
    llm: Arc<dyn LlmProvider>,
    config: ProposerConfig,
}

impl LlmProposer {
    pub fn new(llm: Arc<dyn LlmProvider>, config: ProposerConfig) -> Self {
        Self { llm, config }
    }

    fn alternative_prompt(request: &AlternativeRequest) -> String {
        let ctx = &request.context;
        let field = |key: &str| {
            ctx.get(key)
                .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                .unwrap_or_else(|| "unknown".to_string())
        };
        let actions: Vec<&str> = Action::ALL.iter().map(Action::as_str).collect();

        format!(
            "Current email:\n\
             - From: {from}\n\
             - Subject: {subject}\n\
             - Time: {time}\n\
             - Relationship: {relationship}\n\
             - Sender domain: {domain}\n\n\
             Current strategy would be: {action} (confidence: {confidence:.2})\n\n\
             Invent an ALTERNATIVE action to test. Consider whether time of day, subject \
             keywords or past sender behavior should change the handling.\n\n\
             Return JSON:\n\
             {{\n\
             \"alternative_action\": one of {actions:?},\n\
             \"hypothesis\": \"what we are testing\",\n\
             \"expected_outcome\": \"what happens if the hypothesis is right\",\n\
             \"success_criteria\": \"how to measure it\",\n\
             \"confidence\": 0-1 how likely the alternative beats the current strategy\n\
             }}",
            from = field("from"),
            subject = field("subject"),
            time = field("timestamp"),
            relationship = ctx.cluster_key(),
            domain = field("sender_domain"),
            action = request.current_prediction.action,
            confidence = request.current_prediction.confidence,
        )
    }

    fn pattern_prompt(request: &PatternRequest) -> Result<String, ProposerError> {
        let mut examples = String::new();
        for (i, example) in request.examples.iter().enumerate() {
            let context = serde_json::to_string(&example.context)?;
            examples.push_str(&format!(
                "{n}. action={action} context={context} hypothesis={hypothesis:?}\n",
                n = i + 1,
                action = example.action,
                hypothesis = example.hypothesis,
            ));
        }

        Ok(format!(
            "These email decisions all succeeded:\n\n{examples}\n\
             What is the underlying rule that explains why?\n\n\
             Return JSON:\n\
             {{\n\
             \"condition\": \"logical expression, e.g. relationship_type == friend AND hour < 10\",\n\
             \"action\": \"what to do when the condition holds\",\n\
             \"confidence\": 0-1 based on consistency,\n\
             \"description\": \"plain English explanation\"\n\
             }}"
        ))
    }

    async fn ask<T: DeserializeOwned>(
        &self,
        system: &str,
        prompt: String,
        temperature: f32,
    ) -> Result<T, ProposerError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(prompt),
        ])
        .with_temperature(temperature)
        .with_max_tokens(self.config.max_tokens);

        let response = self.llm.complete(request).await?;
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Proposer completion received"
        );

        let json = extract_json_object(&response.content).ok_or_else(|| {
            warn!(response = %response.content, "No JSON object in proposer response");
            ProposerError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "no JSON object in response".to_string(),
            }
        })?;

        serde_json::from_str(json).map_err(|e| ProposerError::InvalidResponse {
            provider: self.llm.model_name().to_string(),
            reason: e.to_string(),
        })
    }

    fn invalid(&self, reason: impl Into<String>) -> ProposerError {
        ProposerError::InvalidResponse {
            provider: self.llm.model_name().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl StrategyProposer for LlmProposer {
    async fn propose_alternative(
        &self,
        request: &AlternativeRequest,
    ) -> Result<Alternative, ProposerError> {
        let alt: Alternative = self
            .ask(
                ALTERNATIVE_SYSTEM_PROMPT,
                Self::alternative_prompt(request),
                self.config.alternative_temperature,
            )
            .await?;

        if alt.hypothesis.trim().is_empty() {
            return Err(self.invalid("empty hypothesis"));
        }
        if !alt.confidence.is_finite() {
            return Err(self.invalid("non-finite confidence"));
        }
        Ok(Alternative {
            confidence: alt.confidence.clamp(0.0, 1.0),
            ..alt
        })
    }

    async fn synthesize_pattern(&self, request: &PatternRequest) -> Result<Pattern, ProposerError> {
        let pattern: Pattern = self
            .ask(
                SYNTHESIS_SYSTEM_PROMPT,
                Self::pattern_prompt(request)?,
                self.config.synthesis_temperature,
            )
            .await?;

        if pattern.description.trim().is_empty() {
            return Err(self.invalid("empty description"));
        }
        if !pattern.confidence.is_finite() {
            return Err(self.invalid("non-finite confidence"));
        }
        Ok(Pattern {
            confidence: pattern.confidence.clamp(0.0, 1.0),
            ..pattern
        })
    }
}

/// Find the outermost JSON object in model output that may be wrapped in
/// markdown fences or surrounding prose.
fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}
