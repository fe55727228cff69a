use serde::Deserialize;
use tracing::{info, warn};
use triage_llm::{parse_json_reply, LlmRequest};

use crate::error::TriageError;
use crate::model::{EscalationContext, Evaluation, Sentiment};
use crate::resilience::GuardedModel;
use crate::sensitive::SensitiveDataScanner;

const STAGE: &str = "evaluating";

const SYSTEM_PROMPT: &str = r#"You are an expert evaluator for a support RAG system.

Your task:
1. Assign a GLOBAL CONFIDENCE SCORE (0.0 to 1.0) for the AI response based on the context.
2. Detect the sentiment of the USER QUERY:
   - "positive": happy, thankful, satisfied.
   - "neutral": objective, just asking a question.
   - "frustrated": annoyed, impatient, but still polite.
   - "angry": upset, using strong language, or very demanding.
3. Detect:
   - Sensitive data (credit cards, private emails, private phone numbers).
     NOTE: Do NOT flag public support emails, support phone numbers, company contact info, login attempts, or general frustration as sensitive data.
   - Non-standard or ambiguous requests
   - Refusal: true if the AI response says it doesn't know or cannot answer.
4. Escalate if:
   - Confidence < 0.6
   - Sensitive data (PII) detected in the AI response.
   - Sentiment is "angry".

Respond ONLY in valid JSON:
{
  "confidence": 0.0-1.0,
  "sentiment": "positive" | "neutral" | "frustrated" | "angry",
  "sensitive_data": true/false,
  "non_standard": true/false,
  "is_refusal": true/false,
  "reason": "short explanation"
}"#;

const CARD_NOTE: &str = "Credit card pattern detected (Regex).";
const CONTACT_NOTE: &str = "Note: Potential contact info detected by Regex but cleared by LLM.";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EvaluationReply {
    confidence: Option<f64>,
    sentiment: Option<String>,
    sensitive_data: bool,
    non_standard: bool,
    is_refusal: bool,
    reason: String,
}

#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub confidence_threshold: f32,
    pub retrieval_weight: f32,
    pub min_context_chars: usize,
}

/// `round((1 - w) * model + w * retrieval, 2)`, inputs clamped to [0, 1].
pub fn blend_confidence(model_confidence: f64, retrieval_score: f64, retrieval_weight: f64) -> f32 {
    let model_confidence = clamp_unit(model_confidence);
    let retrieval_score = clamp_unit(retrieval_score);
    let weight = clamp_unit(retrieval_weight);
    let blended = (1.0 - weight) * model_confidence + weight * retrieval_score;
    ((blended * 100.0).round() / 100.0) as f32
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Clone)]
pub struct ConfidenceEvaluator {
    model: GuardedModel,
    scanner: SensitiveDataScanner,
    settings: EvaluatorSettings,
}

impl ConfidenceEvaluator {
    pub fn new(model: GuardedModel, settings: EvaluatorSettings) -> Self {
        Self {
            model,
            scanner: SensitiveDataScanner::new(),
            settings,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.settings.confidence_threshold
    }

    /// Scores `response` against `context`. Never fails; a failed model call
    /// becomes an escalation with zero confidence.
    pub async fn evaluate(
        &self,
        query: &str,
        context: &str,
        response: &str,
        retrieval_score: f32,
        trace_id: &str,
    ) -> Evaluation {
        if context.trim().chars().count() < self.settings.min_context_chars {
            info!(trace_id, stage = STAGE, "context too thin, escalating without model call");
            return escalation(Sentiment::Neutral, "No reliable context", query, response);
        }

        let evaluation = match self.ask_model(query, context, response).await {
            Ok(reply) => self.reconcile(reply, query, response, retrieval_score),
            Err(err) => {
                warn!(trace_id, stage = STAGE, error = %err, "evaluation failed");
                escalation(Sentiment::Neutral, "Evaluation failure", query, response)
            }
        };
        info!(
            trace_id,
            stage = STAGE,
            confidence = evaluation.confidence_score,
            escalate = evaluation.escalate,
            sensitive_data = evaluation.sensitive_data,
            refusal = evaluation.is_refusal,
            "evaluation completed"
        );
        evaluation
    }

    async fn ask_model(
        &self,
        query: &str,
        context: &str,
        response: &str,
    ) -> Result<EvaluationReply, TriageError> {
        let user = format!("USER QUERY:\n{query}\n\nCONTEXT:\n{context}\n\nAI RESPONSE:\n{response}");
        let request = LlmRequest::new(SYSTEM_PROMPT, user).json();
        let reply = self.model.complete("evaluate", &request).await?;
        parse_json_reply(&reply.content).map_err(|err| TriageError::MalformedOutput {
            stage: STAGE,
            detail: err.to_string(),
        })
    }

    fn reconcile(
        &self,
        reply: EvaluationReply,
        query: &str,
        response: &str,
        retrieval_score: f32,
    ) -> Evaluation {
        let confidence_score = blend_confidence(
            reply.confidence.unwrap_or(0.0),
            f64::from(retrieval_score),
            f64::from(self.settings.retrieval_weight),
        );
        let sentiment = reply
            .sentiment
            .as_deref()
            .map(Sentiment::parse)
            .unwrap_or_default();

        let mut sensitive_data = reply.sensitive_data;
        let mut reason = reply.reason.trim().to_string();
        let pattern_hit = self.scanner.scan(query) || self.scanner.scan(response);
        if pattern_hit && !sensitive_data {
            // Card numbers are always trusted; contact-shaped matches defer to
            // the model but stay visible in the reason.
            let note = if self.scanner.matches_card(query) || self.scanner.matches_card(response) {
                sensitive_data = true;
                CARD_NOTE
            } else {
                CONTACT_NOTE
            };
            reason = format!("{note} {reason}").trim().to_string();
        }

        let escalate = confidence_score < self.settings.confidence_threshold
            || sensitive_data
            || sentiment == Sentiment::Angry;
        Evaluation {
            confidence_score,
            escalate,
            sentiment,
            sensitive_data,
            non_standard: reply.non_standard,
            is_refusal: reply.is_refusal,
            reason,
            escalation_context: escalate.then(|| EscalationContext {
                user_query: query.to_string(),
                ai_response: response.to_string(),
            }),
        }
    }
}

fn escalation(sentiment: Sentiment, reason: &str, query: &str, response: &str) -> Evaluation {
    Evaluation {
        confidence_score: 0.0,
        escalate: true,
        sentiment,
        sensitive_data: false,
        non_standard: true,
        is_refusal: false,
        reason: reason.to_string(),
        escalation_context: Some(EscalationContext {
            user_query: query.to_string(),
            ai_response: response.to_string(),
        }),
    }
}
