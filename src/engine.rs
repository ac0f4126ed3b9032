//! # Engine orchestration
//!
//! [PromptEngine] wires the pipeline together for one inbound message:
//! classify → consult the A/B engine for the variant (the assigned arm pins
//! which template and version get served) → resolve, validate and bind the
//! template → sanitize and compose → check the cache (single-flight) →
//! invoke the model on a miss → score the response → record the experiment
//! outcome → store in the cache → append the exchange to the conversation.
//!
//! The cache key covers everything that shaped the prompt: composition is
//! deterministic, so the composed text itself is fingerprinted along with
//! the prompt type, the assigned variant, and the TTL context factors.
//!
//! Parameter and permission errors are caught before any external call is
//! made; model failures pass through verbatim. Outcome recording happens
//! when generation completes inside the request task, so a caller that gave
//! up waiting does not bias the experiment statistics.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::debug;

use crate::cache::{fingerprint, AdaptiveCache, CachedResponse};
use crate::compose::{ComposeContext, PromptComposer};
use crate::conversation::{Conversation, Message, MessageRole};
use crate::experiment::AbEngine;
use crate::intent::{classify, ClassifyContext, Intent, IntentResult};
use crate::ledger::Environment;
use crate::llm::GenerateText;
use crate::quality::{QualityAssessor, QualityScore};
use crate::registry::{validate_and_bind, Role, TemplateRegistry};
use crate::utils::JsonMap;

/// Overall quality at or above this counts as a success for A/B metrics.
const SUCCESS_QUALITY_THRESHOLD: f64 = 0.7;
/// How many trailing messages the composer sees.
const HISTORY_WINDOW: usize = 6;
/// Prompt type used when no template is involved.
const CHAT_PROMPT_TYPE: &str = "general_chat";

/// One inbound operator message plus its routing hints.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub user_id: String,
    pub role: Role,
    pub text: String,
    /// Which environment's promoted template version to serve.
    pub environment: Environment,
    /// Use this diagnostic template instead of free-form chat. Ignored when
    /// `ab_test_id` is set: the assigned arm decides the template then.
    pub template_id: Option<String>,
    /// Caller-supplied template variables.
    pub variables: JsonMap,
    pub context: ComposeContext,
    /// Context factors fed to the cache TTL policy, e.g. `alert_active`.
    pub cache_factors: Vec<String>,
    /// Participate in this experiment, if it is running.
    pub ab_test_id: Option<String>,
    /// Elements the response is expected to contain, for quality scoring.
    pub expected_elements: Vec<String>,
    pub model_hint: Option<String>,
}

/// What the engine hands back for one exchange.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub content: String,
    pub intent: IntentResult,
    pub quality: QualityScore,
    pub cached: bool,
    pub tokens: u32,
    pub latency: std::time::Duration,
    pub variant: Option<String>,
    pub prompt: String,
}

/// The conversational prompt engine. All shared state (templates, cache,
/// experiments) is owned by explicit store objects passed in at construction;
/// there is no ambient global state.
pub struct PromptEngine {
    registry: Arc<TemplateRegistry>,
    experiments: Arc<AbEngine>,
    cache: Arc<AdaptiveCache>,
    composer: PromptComposer,
    assessor: QualityAssessor,
    model: Arc<dyn GenerateText>,
}

impl PromptEngine {
    pub fn new(
        registry: Arc<TemplateRegistry>,
        experiments: Arc<AbEngine>,
        cache: Arc<AdaptiveCache>,
        composer: PromptComposer,
        assessor: QualityAssessor,
        model: Arc<dyn GenerateText>,
    ) -> Self {
        Self { registry, experiments, cache, composer, assessor, model }
    }

    /// Classify operator text, consulting the conversation's last intent.
    pub fn classify_intent(&self, text: &str, conversation: Option<&Conversation>) -> IntentResult {
        let context = ClassifyContext {
            prior_intent: conversation
                .and_then(|c| c.last_intent())
                .map(|result| result.intent),
        };
        classify(text, &context)
    }

    /// Compose a prompt without generating. Resolves and binds the template
    /// when one is named; parameter and permission errors surface here.
    pub async fn compose(
        &self,
        intent: Option<Intent>,
        template_id: Option<&str>,
        role: Role,
        variables: &JsonMap,
        context: &ComposeContext,
        history: &[Message],
    ) -> Result<String, errors::EngineError> {
        let (task, bound) = match template_id {
            Some(id) => {
                let template = self.registry.get(id, role).await?;
                let bound = validate_and_bind(&template, variables)?;
                let task = template.prompt_template().render(&bound)?;
                (task, Some(bound))
            }
            None => (String::new(), None),
        };
        Ok(self
            .composer
            .compose(intent, &task, bound.as_ref(), context, history))
    }

    /// Score a response; thin passthrough to the assessor.
    pub fn score(
        &self,
        response: &str,
        expected_elements: &[String],
        latency: std::time::Duration,
    ) -> QualityScore {
        self.assessor.score(response, expected_elements, latency)
    }

    /// Deterministic variant assignment; thin passthrough to the A/B engine.
    pub async fn assign_variant(
        &self,
        test_id: &str,
        user_id: &str,
    ) -> Result<String, crate::experiment::errors::ExperimentError> {
        self.experiments.assign(test_id, user_id).await
    }

    /// Record an experiment outcome; thin passthrough to the A/B engine.
    pub async fn record_outcome(
        &self,
        test_id: &str,
        variant: &str,
        success: bool,
        latency: std::time::Duration,
    ) -> Result<(), crate::experiment::errors::ExperimentError> {
        self.experiments.record_outcome(test_id, variant, success, latency).await
    }

    /// Look up a cached response by fingerprint.
    pub async fn cache_lookup(&self, key: &str) -> Option<CachedResponse> {
        self.cache.get(key).await
    }

    /// Store a response under the adaptive TTL policy.
    pub async fn cache_store(
        &self,
        key: &str,
        value: CachedResponse,
        prompt_type: &str,
        factors: &[&str],
    ) {
        self.cache.put(key, value, prompt_type, factors).await
    }

    /// Process one inbound message end to end, appending the exchange to the
    /// conversation.
    pub async fn handle(
        &self,
        conversation: &mut Conversation,
        request: ChatRequest,
    ) -> Result<EngineResponse, errors::EngineError> {
        let intent = self.classify_intent(&request.text, Some(conversation));
        debug!(
            "handling message for {}: intent {} ({:.2})",
            request.user_id,
            intent.intent.as_str(),
            intent.confidence
        );

        // Assign the arm first: its name is what the outcome gets recorded
        // against, and its template binding decides what gets composed.
        let arm = match &request.ab_test_id {
            Some(test_id) => Some(self.experiments.assign_arm(test_id, &request.user_id).await?),
            None => None,
        };
        let variant = arm.as_ref().map(|a| a.name.clone());
        let choice: Option<(&str, Option<u32>)> = match &arm {
            Some(arm) => Some((arm.template_id.as_str(), Some(arm.template_version))),
            None => request.template_id.as_deref().map(|id| (id, None)),
        };

        // Parameter and permission errors surface here, before any external
        // call is made.
        let (prompt_type, task, bound_variables) = match choice {
            Some((template_id, pinned_version)) => {
                let template = self
                    .registry
                    .resolve(template_id, request.role, request.environment, pinned_version)
                    .await?;
                let bound = validate_and_bind(&template, &request.variables)?;
                let task = template.prompt_template().render(&bound)?;
                self.registry.record_usage(template_id).await;
                (template.category.clone(), task, Some(bound))
            }
            None => (CHAT_PROMPT_TYPE.to_string(), request.text.clone(), None),
        };

        let history: Vec<Message> = conversation.history_window(HISTORY_WINDOW).to_vec();
        let prompt = self.composer.compose(
            Some(intent.intent),
            &task,
            bound_variables.as_ref(),
            &request.context,
            &history,
        );

        let factors: Vec<&str> = request.cache_factors.iter().map(String::as_str).collect();
        let key = fingerprint(&prompt_type, &prompt, variant.as_deref(), &factors);

        let started = Instant::now();
        let model = self.model.clone();
        let prompt_for_model = prompt.clone();
        let hint = request.model_hint.clone();
        let (response, cached) = self
            .cache
            .get_or_generate(&key, &prompt_type, &factors, move || async move {
                let generation = model.generate(&prompt_for_model, hint.as_deref()).await?;
                Ok(CachedResponse {
                    content: generation.content,
                    model: generation.model,
                    tokens: generation.tokens,
                    generated_at: Utc::now(),
                })
            })
            .await?;
        let latency = started.elapsed();

        let quality = self
            .assessor
            .score(&response.content, &request.expected_elements, latency);

        // Recorded here, after generation completed in this task, so caller
        // timeouts cannot bias the statistics.
        if let (Some(test_id), Some(variant_name)) = (&request.ab_test_id, &variant) {
            let success = quality.overall >= SUCCESS_QUALITY_THRESHOLD;
            self.experiments
                .record_outcome(test_id, variant_name, success, latency)
                .await?;
        }

        conversation.push(Message::new(MessageRole::User, request.text.clone()).with_intent(intent.clone()))?;
        conversation.push(
            Message::new(MessageRole::Assistant, response.content.clone())
                .with_model(response.model.clone())
                .with_tokens(response.tokens)
                .with_latency(latency)
                .with_cached(cached)
                .with_quality(quality.clone()),
        )?;

        Ok(EngineResponse {
            content: response.content,
            intent,
            quality,
            cached,
            tokens: response.tokens,
            latency,
            variant,
            prompt,
        })
    }
}

pub mod errors {
    use std::error::Error;
    use std::fmt;
    use std::fmt::Formatter;

    use crate::conversation::errors::ConversationClosed;
    use crate::experiment::errors::ExperimentError;
    use crate::llm::errors::GenerateError;
    use crate::prompt::errors::UnfilledPlaceholders;
    use crate::registry::errors::{BindError, RegistryError};

    /// Everything that can go wrong while handling one message. Each
    /// condition stays individually observable; nothing collapses into a
    /// generic failure.
    #[derive(Debug)]
    pub enum EngineError {
        Registry(RegistryError),
        Bind(BindError),
        /// The template text has a placeholder its schema never binds; a
        /// template-authoring bug caught before the model call.
        Template(UnfilledPlaceholders),
        Experiment(ExperimentError),
        Generate(GenerateError),
        Conversation(ConversationClosed),
    }

    impl fmt::Display for EngineError {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                EngineError::Registry(e) => write!(f, "{}", e),
                EngineError::Bind(e) => write!(f, "{}", e),
                EngineError::Template(e) => write!(f, "{}", e),
                EngineError::Experiment(e) => write!(f, "{}", e),
                EngineError::Generate(e) => write!(f, "{}", e),
                EngineError::Conversation(e) => write!(f, "{}", e),
            }
        }
    }

    impl Error for EngineError {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            match self {
                EngineError::Registry(e) => Some(e),
                EngineError::Bind(e) => Some(e),
                EngineError::Template(e) => Some(e),
                EngineError::Experiment(e) => Some(e),
                EngineError::Generate(e) => Some(e),
                EngineError::Conversation(e) => Some(e),
            }
        }
    }

    impl From<UnfilledPlaceholders> for EngineError {
        fn from(e: UnfilledPlaceholders) -> Self {
            EngineError::Template(e)
        }
    }

    impl From<RegistryError> for EngineError {
        fn from(e: RegistryError) -> Self {
            EngineError::Registry(e)
        }
    }

    impl From<BindError> for EngineError {
        fn from(e: BindError) -> Self {
            EngineError::Bind(e)
        }
    }

    impl From<ExperimentError> for EngineError {
        fn from(e: ExperimentError) -> Self {
            EngineError::Experiment(e)
        }
    }

    impl From<GenerateError> for EngineError {
        fn from(e: GenerateError) -> Self {
            EngineError::Generate(e)
        }
    }

    impl From<ConversationClosed> for EngineError {
        fn from(e: ConversationClosed) -> Self {
            EngineError::Conversation(e)
        }
    }
}
