use std::sync::Arc;

use tracing::info;
use triage_llm::LlmRequest;

use crate::error::Result;
use crate::gate::{response_language, LanguageDetector};
use crate::model::Evaluation;
use crate::resilience::GuardedModel;

const STAGE: &str = "composing";

/// Writes the user-facing message, in French or English only.
#[derive(Clone)]
pub struct ResponseComposer {
    model: GuardedModel,
    detector: Arc<dyn LanguageDetector>,
}

impl ResponseComposer {
    pub fn new(model: GuardedModel, detector: Arc<dyn LanguageDetector>) -> Self {
        Self { model, detector }
    }

    /// Picks the mode from the evaluation verdict.
    pub async fn compose(
        &self,
        query: &str,
        solution: &str,
        evaluation: &Evaluation,
        trace_id: &str,
    ) -> Result<String> {
        if evaluation.escalate {
            self.compose_escalation(query, &evaluation.reason, trace_id)
                .await
        } else {
            self.compose_success(query, solution, trace_id).await
        }
    }

    pub async fn compose_success(&self, query: &str, solution: &str, trace_id: &str) -> Result<String> {
        let language = self.language_name(query);
        let system = format!(
            "You are a response composer for a technical support AI.\n\n\
Generate a professional, clear and human response in {language} with the following structure (use natural paragraphs, NO numbered lists):\n\
- Polite acknowledgement / thanks\n\
- Restatement of the user's problem\n\
- Proposed solution\n\
- Optional next steps or tips\n\n\
IMPORTANT RULES:\n\
- Use ONLY the information provided in the \"Proposed solution\" section\n\
- Do NOT add, invent, or hallucinate any information not present in the proposed solution\n\
- Ensure the response completely addresses the user's question using the provided solution\n\
- If the solution is incomplete, do not attempt to complete it yourself\n\
- Maintain a calm, professional, and reassuring tone\n\n\
Do NOT mention internal systems or evaluation scores."
        );
        let user = format!("User query:\n{query}\n\nProposed solution:\n{solution}");
        self.generate("compose_success", system, user, language, trace_id)
            .await
    }

    /// Empathetic hand-off message. `detected_issues` steers the tone only;
    /// the prompt forbids repeating internals.
    pub async fn compose_escalation(
        &self,
        query: &str,
        detected_issues: &str,
        trace_id: &str,
    ) -> Result<String> {
        let language = self.language_name(query);
        let system = format!(
            "You are a support assistant.\n\n\
Generate a calm response in {language} that:\n\
1. Acknowledges the issue\n\
2. Explains that the request needs further review\n\
3. Reassures the user that it is being escalated to a human specialist\n\
4. Avoids technical details, scores or blame\n\n\
Tone:\n\
- Empathetic\n\
- Professional"
        );
        let user = format!("User query:\n{query}\n\nDetected issues:\n{detected_issues}");
        self.generate("compose_escalation", system, user, language, trace_id)
            .await
    }

    fn language_name(&self, query: &str) -> &'static str {
        match response_language(self.detector.as_ref(), query) {
            Some("fr") => "French",
            _ => "English",
        }
    }

    async fn generate(
        &self,
        operation: &'static str,
        system: String,
        user: String,
        language: &str,
        trace_id: &str,
    ) -> Result<String> {
        let response = self
            .model
            .complete(operation, &LlmRequest::new(system, user))
            .await?;
        info!(trace_id, stage = STAGE, operation, language, "response composed");
        Ok(response.content.trim().to_string())
    }
}
