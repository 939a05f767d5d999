//! Strategy proposer: the external reasoning service behind exploration and
//! rule synthesis.
//!
//! The policy core only sees the `StrategyProposer` trait. `LlmProposer`
//! implements it over any `LlmProvider` (rig-core clients through
//! `RigAdapter`); `TimeoutProposer` bounds every call.

pub mod llm;
pub mod provider;

pub use llm::LlmProposer;
pub use provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, RigAdapter};

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ProposerError};
use crate::policy::types::{Action, DecisionContext, Prediction};

/// Input to `propose_alternative`.
#[derive(Debug, Clone, Serialize)]
pub struct AlternativeRequest {
    pub context: DecisionContext,
    pub current_prediction: Prediction,
}

/// A proposed exploratory action and the hypothesis it tests.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Alternative {
    pub alternative_action: Action,
    pub hypothesis: String,
    pub expected_outcome: String,
    #[serde(default)]
    pub success_criteria: Option<String>,
    /// Proposer's own confidence in the alternative. Required: it decides
    /// whether the hypothesis counts toward a synthesized rule's confidence.
    pub confidence: f64,
}

/// One validated hypothesis shown to `synthesize_pattern`.
#[derive(Debug, Clone, Serialize)]
pub struct PatternExample {
    pub context: DecisionContext,
    pub action: Action,
    pub hypothesis: String,
}

/// Input to `synthesize_pattern`.
#[derive(Debug, Clone, Serialize)]
pub struct PatternRequest {
    pub examples: Vec<PatternExample>,
}

/// A generalized pattern described by the proposer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Pattern {
    pub condition: String,
    pub action: Action,
    pub confidence: f64,
    pub description: String,
}

/// External reasoning service. Every failure is an explicit `ProposerError`
/// that callers map to their fallback.
#[async_trait]
pub trait StrategyProposer: Send + Sync {
    async fn propose_alternative(
        &self,
        request: &AlternativeRequest,
    ) -> Result<Alternative, ProposerError>;

    async fn synthesize_pattern(&self, request: &PatternRequest) -> Result<Pattern, ProposerError>;
}

/// Bounds every proposer call with a timeout.
pub struct TimeoutProposer {
    inner: Arc<dyn StrategyProposer>,
    timeout: Duration,
}

impl TimeoutProposer {
    pub fn new(inner: Arc<dyn StrategyProposer>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl StrategyProposer for TimeoutProposer {
    async fn propose_alternative(
        &self,
        request: &AlternativeRequest,
    ) -> Result<Alternative, ProposerError> {
        tokio::time::timeout(self.timeout, self.inner.propose_alternative(request))
            .await
            .map_err(|_| ProposerError::Timeout {
                timeout: self.timeout,
            })?
    }

    async fn synthesize_pattern(&self, request: &PatternRequest) -> Result<Pattern, ProposerError> {
        tokio::time::timeout(self.timeout, self.inner.synthesize_pattern(request))
            .await
            .map_err(|_| ProposerError::Timeout {
                timeout: self.timeout,
            })?
    }
}

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    OpenAi,
    Anthropic,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Anthropic => "claude-3-5-haiku-latest",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(ConfigError::InvalidValue {
                key: "TRIAGE_POLICY_LLM_BACKEND".to_string(),
                message: format!("unknown backend '{other}' (expected openai or anthropic)"),
            }),
        }
    }
}

/// Proposer configuration.
#[derive(Debug, Clone)]
pub struct ProposerConfig {
    pub backend: LlmBackend,
    pub model: String,
    pub api_key: SecretString,
    pub timeout: Duration,
    pub alternative_temperature: f32,
    pub synthesis_temperature: f32,
    pub max_tokens: u32,
}

impl ProposerConfig {
    pub fn new(backend: LlmBackend, api_key: SecretString) -> Self {
        Self {
            backend,
            model: backend.default_model().to_string(),
            api_key,
            timeout: Duration::from_secs(10),
            alternative_temperature: 0.8,
            synthesis_temperature: 0.3,
            max_tokens: 300,
        }
    }

    /// Build from environment. `TRIAGE_POLICY_LLM_API_KEY` is required;
    /// the backend defaults to OpenAI.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("TRIAGE_POLICY_LLM_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("TRIAGE_POLICY_LLM_API_KEY".to_string()))?;
        let backend = match std::env::var("TRIAGE_POLICY_LLM_BACKEND") {
            Ok(raw) => raw.parse()?,
            Err(_) => LlmBackend::OpenAi,
        };
        let mut config = Self::new(backend, SecretString::from(api_key));

        if let Ok(model) = std::env::var("TRIAGE_POLICY_LLM_MODEL") {
            config.model = model;
        }
        if let Ok(raw) = std::env::var("TRIAGE_POLICY_PROPOSER_TIMEOUT_SECS") {
            let secs = raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: "TRIAGE_POLICY_PROPOSER_TIMEOUT_SECS".to_string(),
                message: e.to_string(),
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Create the chat provider for the configured backend.
pub fn create_provider(config: &ProposerConfig) -> Result<Arc<dyn LlmProvider>, ProposerError> {
    match config.backend {
        LlmBackend::OpenAi => create_openai_provider(config),
        LlmBackend::Anthropic => create_anthropic_provider(config),
    }
}

fn create_openai_provider(config: &ProposerConfig) -> Result<Arc<dyn LlmProvider>, ProposerError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            ProposerError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

fn create_anthropic_provider(
    config: &ProposerConfig,
) -> Result<Arc<dyn LlmProvider>, ProposerError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            ProposerError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

/// Build the production proposer: LLM-backed, behind a timeout.
pub fn create_proposer(
    config: &ProposerConfig,
) -> Result<Arc<dyn StrategyProposer>, ProposerError> {
    let provider = create_provider(config)?;
    tracing::info!(
        backend = config.backend.as_str(),
        model = %config.model,
        "Using LLM strategy proposer"
    );
    let proposer = Arc::new(LlmProposer::new(provider, config.clone()));
    Ok(Arc::new(TimeoutProposer::new(proposer, config.timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowProposer;

    #[async_trait]
    impl StrategyProposer for SlowProposer {
        async fn propose_alternative(
            &self,
            _request: &AlternativeRequest,
        ) -> Result<Alternative, ProposerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(ProposerError::InvalidResponse {
                provider: "slow".into(),
                reason: "unreachable".into(),
            })
        }

        async fn synthesize_pattern(
            &self,
            _request: &PatternRequest,
        ) -> Result<Pattern, ProposerError> {
            Ok(Pattern {
                condition: "always".into(),
                action: Action::Star,
                confidence: 0.9,
                description: "fast".into(),
            })
        }
    }

    #[tokio::test]
    async fn timeout_wrapper_bounds_slow_calls() {
        let proposer = TimeoutProposer::new(Arc::new(SlowProposer), Duration::from_millis(20));
        let request = AlternativeRequest {
            context: DecisionContext::new(),
            current_prediction: Prediction::new(Action::Archive, 0.4),
        };
        let err = proposer.propose_alternative(&request).await.unwrap_err();
        assert!(matches!(err, ProposerError::Timeout { .. }));

        let pattern = proposer
            .synthesize_pattern(&PatternRequest { examples: vec![] })
            .await
            .unwrap();
        assert_eq!(pattern.description, "fast");
    }

    #[test]
    fn alternative_requires_confidence() {
        let missing = serde_json::from_str::<Alternative>(
            r#"{"alternative_action":"reply","hypothesis":"h","expected_outcome":"e"}"#,
        );
        assert!(missing.is_err());

        let alt: Alternative = serde_json::from_str(
            r#"{"alternative_action":"reply","hypothesis":"h","expected_outcome":"e","confidence":0.35}"#,
        )
        .unwrap();
        assert_eq!(alt.alternative_action, Action::Reply);
        assert_eq!(alt.confidence, 0.35);
        assert!(alt.success_criteria.is_none());
    }

    #[test]
    fn config_defaults() {
        let config = ProposerConfig::new(LlmBackend::OpenAi, SecretString::from("k"));
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.max_tokens, 300);
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("OpenAI".parse::<LlmBackend>().unwrap(), LlmBackend::OpenAi);
        assert_eq!("anthropic".parse::<LlmBackend>().unwrap(), LlmBackend::Anthropic);
        assert!(matches!(
            "groq".parse::<LlmBackend>(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn providers_construct_without_network() {
        // rig clients accept any key at construction; auth fails on first request.
        for backend in [LlmBackend::OpenAi, LlmBackend::Anthropic] {
            let config = ProposerConfig::new(backend, SecretString::from("test-key"));
            let provider = create_provider(&config).unwrap();
            assert_eq!(provider.model_name(), config.model);
        }
    }
}
