use indexmap::IndexSet;
use serde::Deserialize;
use tracing::{info, warn};
use triage_llm::{parse_json_reply, LlmRequest};

use crate::error::TriageError;
use crate::model::{AgentRole, Category, QueryAnalysis};
use crate::resilience::GuardedModel;

const STAGE: &str = "analyzing";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnalysisReply {
    summary: Option<String>,
    keywords: Vec<String>,
    category: Option<String>,
    agent_role: Option<String>,
    is_sufficient: Option<bool>,
    is_in_scope: Option<bool>,
    optimized_query: Option<String>,
}

/// Turns raw ticket text into a [`QueryAnalysis`] with one model call.
#[derive(Clone)]
pub struct QueryAnalyzer {
    model: GuardedModel,
    brand_name: String,
}

impl QueryAnalyzer {
    pub fn new(model: GuardedModel, brand_name: impl Into<String>) -> Self {
        Self {
            model,
            brand_name: brand_name.into(),
        }
    }

    /// Never fails: any model or parsing problem yields the degraded analysis.
    pub async fn analyze(&self, text: &str, trace_id: &str) -> QueryAnalysis {
        match self.try_analyze(text).await {
            Ok(analysis) => {
                info!(
                    trace_id,
                    stage = STAGE,
                    category = analysis.category.map(|c| c.label()).unwrap_or("none"),
                    in_scope = analysis.is_in_scope,
                    sufficient = analysis.is_sufficient,
                    "query analysis completed"
                );
                analysis
            }
            Err(err) => {
                warn!(trace_id, stage = STAGE, error = %err, "query analysis degraded");
                QueryAnalysis::degraded(text, err.to_string())
            }
        }
    }

    async fn try_analyze(&self, text: &str) -> Result<QueryAnalysis, TriageError> {
        let request = LlmRequest::new(self.system_prompt(), text).json();
        let response = self.model.complete("analyze", &request).await?;
        let reply: AnalysisReply =
            parse_json_reply(&response.content).map_err(|err| TriageError::MalformedOutput {
                stage: STAGE,
                detail: err.to_string(),
            })?;
        Ok(into_analysis(reply, text))
    }

    fn system_prompt(&self) -> String {
        let categories = Category::ALL
            .iter()
            .map(|c| format!("   - '{}'", c.label()))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "You are an expert query analyzer for a technical support system (Company: {brand}).\n\
Your task is to:\n\
1. Provide a short summary of less than 100 words of the query in French.\n\
2. Evaluate if the query is sufficient (detailed enough) to find a precise solution.\n\
3. Evaluate if the query is 'is_in_scope':\n\
   - True if it's related to {brand}, technical support, user guides, or professional services.\n\
   - False if it's completely unrelated (e.g., cooking, sports, general jokes, other companies).\n\
4. Provide an 'optimized_query':\n\
   - If the query is too short or vague, expand it by detailing the likely technical context.\n\
   - Replace common words with technical synonyms to improve search results.\n\
5. Extract from 5 to 10 key keywords (recommended 7).\n\
6. Identify the 'category' of the query among:\n{categories}\n\
7. Identify the 'agent_role' to route the query to:\n\
   - 'agt_tech': if the query is technical, related to bugs, errors, setup, or user guides.\n\
   - 'agt_sales': if the query is commercial, related to pricing, contracts, or legal frameworks.\n\n\
Respond ONLY in JSON format:\n\
{{\n\
    \"summary\": \"...\",\n\
    \"keywords\": [\"...\", \"...\"],\n\
    \"category\": \"...\",\n\
    \"agent_role\": \"agt_tech\" | \"agt_sales\",\n\
    \"is_sufficient\": true,\n\
    \"is_in_scope\": true,\n\
    \"optimized_query\": \"...\"\n\
}}",
            brand = capitalize(&self.brand_name),
        )
    }
}

fn into_analysis(reply: AnalysisReply, text: &str) -> QueryAnalysis {
    let keywords: IndexSet<String> = reply
        .keywords
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    let optimized_query = reply
        .optimized_query
        .filter(|q| !q.trim().is_empty())
        .or_else(|| Some(text.to_string()));
    QueryAnalysis {
        summary: reply.summary.unwrap_or_default(),
        keywords,
        category: reply.category.as_deref().and_then(Category::parse),
        agent_role: reply.agent_role.as_deref().and_then(AgentRole::parse),
        is_sufficient: reply.is_sufficient.unwrap_or(true),
        is_in_scope: reply.is_in_scope.unwrap_or(true),
        optimized_query,
        error: None,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
