use std::sync::Arc;

use tracing::{error, info, warn};
use triage_llm::{LanguageModel, LlmClient};
use triage_rag::{EmbeddingClient, KnowledgeBase, KnowledgeStore, VectorSearch};

use crate::analyzer::QueryAnalyzer;
use crate::composer::ResponseComposer;
use crate::config::{RuntimeSettings, TriageConfig};
use crate::error::{Result, TriageError};
use crate::evaluator::{ConfidenceEvaluator, EvaluatorSettings};
use crate::gate::{Gate, LanguageDetector, WhatlangDetector};
use crate::model::{
    AgentRole, Category, EscalationContext, EscalationKind, Escalated, Evaluation, Orientation,
    PipelineResult, PrecheckResult, QueryAnalysis, RatingOutcome, Rejected, RejectionKind,
    Sentiment, Success, Ticket,
};
use crate::resilience::{CircuitBreaker, GuardedModel, GuardedSearch};
use crate::retrieval::{RetrievalEngine, RetrievalSettings};
use crate::sensitive::SensitiveDataScanner;

pub const SENSITIVE_GATE_MESSAGE: &str = "Votre demande contient des informations sensibles (comme un numéro de carte ou des données personnelles). Pour votre sécurité, nous avons transmis votre dossier directement à un agent humain qui vous répondra par email sécurisé.";
pub const SENSITIVE_GATE_REASON: &str = "Sensitive data detected in query (Regex)";
pub const OUT_OF_SCOPE_MESSAGE: &str = "Désolé, je ne peux répondre qu'aux questions liées à Doxa et à nos services techniques. Votre demande semble être hors sujet.";
pub const OUT_OF_SCOPE_REASON: &str = "Out of scope";
pub const UPSTREAM_FAILURE_REASON: &str = "Technical failure during processing";
pub const LOW_RATING_REASON: &str = "Low customer rating";
pub const RATING_THANKS: &str = "Thank you for your feedback!";

const ERROR_SUMMARY: &str = "Error during processing";

/// Concrete collaborators built from the environment.
pub struct Collaborators {
    pub model: Arc<dyn LanguageModel>,
    pub knowledge: KnowledgeBase,
}

impl Collaborators {
    pub fn from_settings(settings: &RuntimeSettings) -> Result<Self> {
        let model = LlmClient::new(settings.provider, settings.model.clone())?;
        let store = KnowledgeStore::open(&settings.db_path)?;
        let embeddings = EmbeddingClient::from_env()?;
        info!(
            provider = settings.provider.as_str(),
            model = %settings.model,
            db = %settings.db_path.display(),
            "collaborators ready"
        );
        Ok(Self {
            model: Arc::new(model),
            knowledge: KnowledgeBase::new(store, embeddings),
        })
    }

    /// Same as [`Collaborators::from_settings`], run off the async runtime:
    /// opening SQLite and building blocking HTTP clients must not happen on
    /// a runtime worker.
    pub async fn connect(settings: RuntimeSettings) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::from_settings(&settings))
            .await
            .map_err(|err| {
                TriageError::Upstream(anyhow::anyhow!("initialization task failed: {err}"))
            })?
    }

    pub fn search(&self) -> Arc<dyn VectorSearch> {
        Arc::new(self.knowledge.clone())
    }
}

/// Sequences the pipeline stages into one decision per ticket.
pub struct Orchestrator {
    config: TriageConfig,
    gate: Gate,
    scanner: SensitiveDataScanner,
    analyzer: QueryAnalyzer,
    retrieval: RetrievalEngine,
    evaluator: ConfidenceEvaluator,
    composer: ResponseComposer,
    model: GuardedModel,
    search: GuardedSearch,
}

impl Orchestrator {
    pub fn new(
        config: TriageConfig,
        model: Arc<dyn LanguageModel>,
        search: Arc<dyn VectorSearch>,
    ) -> Self {
        Self::with_detector(config, model, search, Arc::new(WhatlangDetector))
    }

    pub fn with_detector(
        config: TriageConfig,
        model: Arc<dyn LanguageModel>,
        search: Arc<dyn VectorSearch>,
        detector: Arc<dyn LanguageDetector>,
    ) -> Self {
        let model = GuardedModel::new(model, &config.resilience);
        let search = GuardedSearch::new(search, &config.resilience);
        let analyzer = QueryAnalyzer::new(model.clone(), config.brand_name.clone());
        let retrieval = RetrievalEngine::new(
            search.clone(),
            model.clone(),
            RetrievalSettings {
                top_k: config.top_k,
                similarity_threshold: config.similarity_threshold,
                max_doc_chars: config.max_doc_chars,
            },
            config.brand_name.clone(),
        );
        let evaluator = ConfidenceEvaluator::new(
            model.clone(),
            EvaluatorSettings {
                confidence_threshold: config.confidence_threshold,
                retrieval_weight: config.retrieval_weight,
                min_context_chars: config.min_context_chars,
            },
        );
        let composer = ResponseComposer::new(model.clone(), Arc::clone(&detector));
        Self {
            gate: Gate::new(detector),
            scanner: SensitiveDataScanner::new(),
            analyzer,
            retrieval,
            evaluator,
            composer,
            model,
            search,
            config,
        }
    }

    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn model_breaker(&self) -> &CircuitBreaker {
        self.model.policy().breaker()
    }

    pub fn search_breaker(&self) -> &CircuitBreaker {
        self.search.policy().breaker()
    }

    pub async fn process_ticket(&self, text: &str) -> PipelineResult {
        self.process(&Ticket::new(text)).await
    }

    pub async fn process(&self, ticket: &Ticket) -> PipelineResult {
        let trace_id = ticket.trace_id();
        let text = ticket.text();
        info!(trace_id, stage = "received", chars = text.chars().count(), "ticket received");

        let precheck = self.gate.run_precheck(text);
        info!(
            trace_id,
            stage = "precheck",
            passed = precheck.passed,
            reasons = ?precheck.reasons,
            "precheck completed"
        );
        if !precheck.passed {
            return PipelineResult::Rejected(Rejected {
                kind: RejectionKind::Admission,
                reason: precheck.reasons.clone(),
                final_response: None,
                precheck,
                analysis: None,
            });
        }

        let finding = self.scanner.classify(text);
        if finding.matched {
            warn!(
                trace_id,
                stage = "sensitive_gate",
                category = ?finding.category,
                "sensitive data in ticket, escalating"
            );
            return PipelineResult::Escalated(sensitive_gate_escalation(text, precheck));
        }

        match self.run_stages(ticket, &precheck).await {
            Ok(result) => {
                info!(trace_id, stage = "done", status = result.status(), "ticket processed");
                result
            }
            Err(err) => {
                error!(trace_id, stage = "done", error = %err, "pipeline failed, escalating");
                PipelineResult::Escalated(upstream_failure(precheck))
            }
        }
    }

    async fn run_stages(&self, ticket: &Ticket, precheck: &PrecheckResult) -> Result<PipelineResult> {
        let trace_id = ticket.trace_id();
        let text = ticket.text();

        let analysis = self.analyzer.analyze(text, trace_id).await;
        let analysis = apply_brand_override(text, &self.config.brand_name, analysis);
        if !analysis.is_in_scope {
            info!(trace_id, stage = "scope_check", "ticket out of scope");
            return Ok(PipelineResult::Rejected(Rejected {
                kind: RejectionKind::Scope,
                reason: vec![OUT_OF_SCOPE_REASON.to_string()],
                final_response: Some(OUT_OF_SCOPE_MESSAGE.to_string()),
                precheck: precheck.clone(),
                analysis: Some(analysis),
            }));
        }

        let query = analysis.retrieval_query(text).to_string();
        let rag = self.retrieval.find(&query, analysis.category, trace_id).await?;
        info!(
            trace_id,
            stage = "retrieving",
            fallback_used = rag.fallback_used,
            documents = rag.documents.len(),
            "solution search completed"
        );

        let evaluation = self
            .evaluator
            .evaluate(&query, &rag.context(), &rag.answer, rag.best_similarity(), trace_id)
            .await;

        let threshold = self.config.confidence_threshold;
        let escalation = if evaluation.escalate || evaluation.is_refusal {
            evaluation.escalation_kind(threshold)
        } else {
            None
        };
        let Some(kind) = escalation else {
            let final_response = self
                .composer
                .compose(text, &rag.answer, &evaluation, trace_id)
                .await?;
            return Ok(PipelineResult::Success(Success {
                final_response,
                confidence: evaluation.confidence_score,
                analysis,
                precheck: precheck.clone(),
                proposed_answer: rag.answer,
                fallback_used: rag.fallback_used,
            }));
        };

        let reason = escalation_reason(kind, &evaluation);
        info!(trace_id, stage = "escalating", kind = ?kind, reason = %reason, "orienting to human agent");
        let final_response = if self.config.compose_escalation_message {
            match self
                .composer
                .compose_escalation(text, &reason, trace_id)
                .await
            {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(trace_id, stage = "escalating", error = %err, "escalation message unavailable");
                    None
                }
            }
        } else {
            None
        };

        let mut evaluation = evaluation;
        if !evaluation.escalate {
            evaluation.escalate = true;
            evaluation.escalation_context = Some(EscalationContext {
                user_query: query.clone(),
                ai_response: rag.answer.clone(),
            });
        }

        let mut escalated = orient_to_human(&analysis, precheck, kind, reason);
        escalated.final_response = final_response;
        escalated.analysis = Some(analysis);
        escalated.evaluation = Some(evaluation);
        escalated.proposed_answer = Some(rag.answer);
        Ok(PipelineResult::Escalated(escalated))
    }

    /// Customer rating after an answered ticket. Two stars or fewer sends the
    /// ticket down the same orientation path as an evaluation escalation.
    pub fn handle_rating(
        &self,
        ticket_id: &str,
        stars: u8,
        analysis: &QueryAnalysis,
        precheck: &PrecheckResult,
    ) -> RatingOutcome {
        if stars <= 2 {
            info!(ticket_id, stars, "low rating, escalating");
            RatingOutcome::Escalated(orient_to_human(
                analysis,
                precheck,
                EscalationKind::LowRating,
                LOW_RATING_REASON.to_string(),
            ))
        } else {
            info!(ticket_id, stars, "rating recorded");
            RatingOutcome::Completed {
                message: RATING_THANKS.to_string(),
            }
        }
    }
}

/// Builds the orientation record handed to a human specialist.
pub fn orient_to_human(
    analysis: &QueryAnalysis,
    precheck: &PrecheckResult,
    kind: EscalationKind,
    reason: String,
) -> Escalated {
    Escalated {
        kind,
        reason,
        orientation: Some(Orientation::from_analysis(analysis)),
        final_response: None,
        precheck: Some(precheck.clone()),
        analysis: None,
        evaluation: None,
        proposed_answer: None,
    }
}

/// A brand mention settles relevance: an out-of-scope verdict is reversed
/// and an unset or `Other` category becomes support documentation.
pub fn apply_brand_override(text: &str, brand: &str, analysis: QueryAnalysis) -> QueryAnalysis {
    let brand = brand.trim().to_lowercase();
    if brand.is_empty() || analysis.is_in_scope || !text.to_lowercase().contains(&brand) {
        return analysis;
    }
    let category = match analysis.category {
        None | Some(Category::Other) => Some(Category::SupportReference),
        other => other,
    };
    QueryAnalysis {
        is_in_scope: true,
        category,
        ..analysis
    }
}

pub fn escalation_reason(kind: EscalationKind, evaluation: &Evaluation) -> String {
    match kind {
        EscalationKind::SensitiveData => "Sensitive data detected (PII)".to_string(),
        EscalationKind::Anger => "User is angry".to_string(),
        EscalationKind::Refusal => "No information found in KB".to_string(),
        EscalationKind::LowConfidence => {
            format!("Low confidence score ({})", evaluation.confidence_score)
        }
        EscalationKind::UpstreamFailure => UPSTREAM_FAILURE_REASON.to_string(),
        EscalationKind::LowRating => LOW_RATING_REASON.to_string(),
    }
}

fn sensitive_gate_escalation(text: &str, precheck: PrecheckResult) -> Escalated {
    Escalated {
        kind: EscalationKind::SensitiveData,
        reason: SENSITIVE_GATE_REASON.to_string(),
        orientation: None,
        final_response: Some(SENSITIVE_GATE_MESSAGE.to_string()),
        precheck: Some(precheck),
        analysis: None,
        evaluation: Some(Evaluation {
            confidence_score: 0.0,
            escalate: true,
            sentiment: Sentiment::Neutral,
            sensitive_data: true,
            non_standard: false,
            is_refusal: false,
            reason: SENSITIVE_GATE_REASON.to_string(),
            escalation_context: Some(EscalationContext {
                user_query: text.to_string(),
                ai_response: String::new(),
            }),
        }),
        proposed_answer: None,
    }
}

fn upstream_failure(precheck: PrecheckResult) -> Escalated {
    Escalated {
        kind: EscalationKind::UpstreamFailure,
        reason: UPSTREAM_FAILURE_REASON.to_string(),
        orientation: Some(Orientation {
            summary: ERROR_SUMMARY.to_string(),
            keywords: Vec::new(),
            target_department: AgentRole::Tech,
        }),
        final_response: None,
        precheck: Some(precheck),
        analysis: None,
        evaluation: None,
        proposed_answer: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out_of_scope(category: Option<Category>) -> QueryAnalysis {
        QueryAnalysis {
            is_in_scope: false,
            is_sufficient: true,
            category,
            ..QueryAnalysis::degraded("x", "unused")
        }
    }

    #[test]
    fn brand_mention_forces_scope_and_category() {
        let analysis = apply_brand_override("Mon compte DOXA est bloqué", "doxa", out_of_scope(None));
        assert!(analysis.is_in_scope);
        assert_eq!(analysis.category, Some(Category::SupportReference));

        let analysis = apply_brand_override(
            "Contrat doxa",
            "doxa",
            out_of_scope(Some(Category::Legal)),
        );
        assert_eq!(analysis.category, Some(Category::Legal));
    }

    #[test]
    fn no_brand_mention_keeps_verdict() {
        let analysis = apply_brand_override("recette de crêpes", "doxa", out_of_scope(None));
        assert!(!analysis.is_in_scope);
        assert_eq!(analysis.category, None);
    }

    #[test]
    fn orientation_defaults_to_tech() {
        let analysis = QueryAnalysis::degraded("x", "e");
        let precheck = PrecheckResult {
            is_supported_language: true,
            is_spam: false,
            passed: true,
            reasons: vec![],
        };
        let escalated = orient_to_human(
            &analysis,
            &precheck,
            EscalationKind::LowConfidence,
            "Low confidence score (0.4)".into(),
        );
        let orientation = escalated.orientation.unwrap();
        assert_eq!(orientation.target_department, AgentRole::Tech);
        assert_eq!(orientation.summary, "N/A");
    }

    #[test]
    fn low_confidence_reason_carries_score() {
        let evaluation = Evaluation {
            confidence_score: 0.44,
            escalate: true,
            sentiment: Sentiment::Neutral,
            sensitive_data: false,
            non_standard: false,
            is_refusal: false,
            reason: String::new(),
            escalation_context: None,
        };
        assert_eq!(
            escalation_reason(EscalationKind::LowConfidence, &evaluation),
            "Low confidence score (0.44)"
        );
    }
}
