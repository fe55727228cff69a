mod analyzer;
mod batch;
mod composer;
mod config;
mod error;
mod evaluator;
mod gate;
mod model;
mod orchestrator;
mod resilience;
mod retrieval;
mod sensitive;

pub use analyzer::QueryAnalyzer;
pub use batch::{answer_from_result, run_batch, BatchAnswer, BatchInput, BatchOutput, BatchQuestion};
pub use composer::ResponseComposer;
pub use config::{
    ResilienceConfig, RuntimeSettings, TriageConfig, DEFAULT_BIND_ADDR, DEFAULT_CONFIG_PATH,
    DEFAULT_DB_PATH,
};
pub use error::{Result, TriageError};
pub use evaluator::{blend_confidence, ConfidenceEvaluator, EvaluatorSettings};
pub use gate::{
    response_language, Gate, LanguageDetector, LanguageGuess, WhatlangDetector, LANGUAGE_REASON,
    SPAM_REASON,
};
pub use model::{
    similarity_from_distance, AgentRole, Category, EscalationContext, EscalationKind, Escalated,
    Evaluation, Orientation, PipelineResult, PrecheckResult, QueryAnalysis, RagResult,
    RatingOutcome, Rejected, RejectionKind, RetrievedDocument, SensitiveCategory,
    SensitiveFinding, Sentiment, Success, Ticket,
};
pub use orchestrator::{
    apply_brand_override, escalation_reason, orient_to_human, Collaborators, Orchestrator,
    LOW_RATING_REASON, OUT_OF_SCOPE_MESSAGE, OUT_OF_SCOPE_REASON, RATING_THANKS,
    SENSITIVE_GATE_MESSAGE, SENSITIVE_GATE_REASON, UPSTREAM_FAILURE_REASON,
};
pub use resilience::{
    CircuitBreaker, CircuitState, Collaborator, GuardedModel, GuardedSearch, ResiliencePolicy,
};
pub use retrieval::{is_refusal, RetrievalEngine, RetrievalSettings, NO_INFORMATION_ANSWER};
pub use sensitive::SensitiveDataScanner;
