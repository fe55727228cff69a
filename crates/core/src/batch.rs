use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::model::PipelineResult;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Deserialize)]
pub struct BatchInput {
    #[serde(rename = "Questions")]
    pub questions: Vec<BatchQuestion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchQuestion {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    #[serde(rename = "Team")]
    pub team: String,
    #[serde(rename = "Answers")]
    pub answers: Vec<BatchAnswer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAnswer {
    pub id: Value,
    pub answer: String,
}

/// Answer text for one result: the final message when there is one, then
/// the proposed answer, then a hand-off sentence.
pub fn answer_from_result(result: &PipelineResult) -> String {
    match result {
        PipelineResult::Success(success) => {
            if !success.final_response.trim().is_empty() {
                success.final_response.trim().to_string()
            } else {
                success.proposed_answer.trim().to_string()
            }
        }
        PipelineResult::Escalated(escalated) => match non_empty(&escalated.final_response)
            .or_else(|| non_empty(&escalated.proposed_answer))
        {
            Some(message) => message,
            None => handoff_sentence(
                escalated
                    .orientation
                    .as_ref()
                    .map(|o| o.target_department.as_str()),
                &escalated.reason,
            ),
        },
        PipelineResult::Rejected(rejected) => match non_empty(&rejected.final_response) {
            Some(message) => message,
            None => handoff_sentence(None, &rejected.reason.join("; ")),
        },
    }
}

fn non_empty(message: &Option<String>) -> Option<String> {
    message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

fn handoff_sentence(department: Option<&str>, reasons: &str) -> String {
    let lead = match department {
        Some(dept) => format!("La demande a été transmise à un agent humain ({dept}) pour prise en charge."),
        None => "La demande a été transmise à un agent humain pour prise en charge.".to_string(),
    };
    format!("{lead} {reasons}").trim().to_string()
}

/// Runs every question through the pipeline, one at a time, in input order.
pub async fn run_batch(orchestrator: &Orchestrator, input: &BatchInput, team: &str) -> BatchOutput {
    let mut answers = Vec::with_capacity(input.questions.len());
    for (idx, question) in input.questions.iter().enumerate() {
        let result = orchestrator.process_ticket(&question.query).await;
        info!(
            index = idx,
            id = %question.id,
            status = result.status(),
            "batch question processed"
        );
        answers.push(BatchAnswer {
            id: question.id.clone(),
            answer: answer_from_result(&result),
        });
    }
    BatchOutput {
        team: team.to_string(),
        answers,
    }
}
