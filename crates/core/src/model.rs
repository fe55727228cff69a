use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One inbound support request. The trace id is minted once and tags every
/// log record produced while the ticket moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    text: String,
    trace_id: String,
}

impl Ticket {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecheckResult {
    pub is_supported_language: bool,
    pub is_spam: bool,
    pub passed: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitiveCategory {
    CreditCard,
    Email,
    Phone,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveFinding {
    pub matched: bool,
    pub category: SensitiveCategory,
}

impl SensitiveFinding {
    pub fn none() -> Self {
        Self {
            matched: false,
            category: SensitiveCategory::None,
        }
    }

    pub fn of(category: SensitiveCategory) -> Self {
        Self {
            matched: category != SensitiveCategory::None,
            category,
        }
    }
}

/// Knowledge-base partition a query is routed to. The serialized labels are
/// the category metadata stored alongside indexed passages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Legal, Regulatory, and Commercial Frameworks")]
    Legal,
    #[serde(rename = "Support and Reference Documentation")]
    SupportReference,
    #[serde(rename = "Operational and Practical User Guides")]
    Operational,
    #[serde(rename = "Other")]
    Other,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Legal,
        Category::SupportReference,
        Category::Operational,
        Category::Other,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Category::Legal => "Legal, Regulatory, and Commercial Frameworks",
            Category::SupportReference => "Support and Reference Documentation",
            Category::Operational => "Operational and Practical User Guides",
            Category::Other => "Other",
        }
    }

    /// Lenient parse of a model-produced label: exact labels, the leading
    /// keyword, or a handful of short aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }
        if let Some(exact) = Self::ALL
            .iter()
            .find(|category| category.label().to_lowercase() == lower)
        {
            return Some(*exact);
        }
        if lower.starts_with("legal") || lower == "commercial" {
            Some(Category::Legal)
        } else if lower.starts_with("support") || lower == "reference" {
            Some(Category::SupportReference)
        } else if lower.starts_with("operational") || lower.contains("user guide") {
            Some(Category::Operational)
        } else if lower == "other" || lower == "autre" {
            Some(Category::Other)
        } else {
            None
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentRole {
    #[serde(rename = "agt_tech")]
    Tech,
    #[serde(rename = "agt_sales")]
    Sales,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Tech => "agt_tech",
            AgentRole::Sales => "agt_sales",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "agt_tech" | "tech" | "technical" => Some(AgentRole::Tech),
            "agt_sales" | "sales" | "commercial" => Some(AgentRole::Sales),
            _ => None,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub keywords: IndexSet<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub agent_role: Option<AgentRole>,
    #[serde(default = "default_true")]
    pub is_sufficient: bool,
    #[serde(default = "default_true")]
    pub is_in_scope: bool,
    #[serde(default)]
    pub optimized_query: Option<String>,
    /// Set when the analyzer could not produce a real analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

impl QueryAnalysis {
    /// The analysis used when the language model could not be reached or
    /// returned something unusable.
    pub fn degraded(text: &str, error: impl Into<String>) -> Self {
        Self {
            summary: String::new(),
            keywords: IndexSet::new(),
            category: None,
            agent_role: None,
            is_sufficient: false,
            is_in_scope: true,
            optimized_query: Some(text.to_string()),
            error: Some(error.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    /// Query sent to retrieval: the optimized rewrite when there is one.
    pub fn retrieval_query<'a>(&'a self, raw: &'a str) -> &'a str {
        match self.optimized_query.as_deref() {
            Some(query) if !query.trim().is_empty() => query,
            _ => raw,
        }
    }

    pub fn target_department(&self) -> AgentRole {
        self.agent_role.unwrap_or(AgentRole::Tech)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub content: String,
    pub category: Option<String>,
    pub similarity: f32,
}

/// Maps a search distance onto (0, 1]; only zero distance yields 1.0.
pub fn similarity_from_distance(distance: f32) -> f32 {
    let distance = if distance.is_finite() {
        distance.max(0.0)
    } else {
        return 0.0;
    };
    1.0 / (1.0 + distance)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagResult {
    pub query: String,
    pub documents: Vec<RetrievedDocument>,
    pub answer: String,
    pub fallback_used: bool,
}

impl RagResult {
    pub fn best_similarity(&self) -> f32 {
        self.documents.first().map(|doc| doc.similarity).unwrap_or(0.0)
    }

    /// Retrieved passages joined for the evaluator.
    pub fn context(&self) -> String {
        self.documents
            .iter()
            .map(|doc| doc.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Frustrated,
    Angry,
}

impl Sentiment {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "positive" => Sentiment::Positive,
            "frustrated" => Sentiment::Frustrated,
            "angry" => Sentiment::Angry,
            _ => Sentiment::Neutral,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationContext {
    pub user_query: String,
    pub ai_response: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub confidence_score: f32,
    pub escalate: bool,
    pub sentiment: Sentiment,
    pub sensitive_data: bool,
    pub non_standard: bool,
    pub is_refusal: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_context: Option<EscalationContext>,
}

impl Evaluation {
    /// The pipeline-level escalation rule: the evaluator's own verdict plus
    /// the refusal flag.
    pub fn requires_escalation(&self, threshold: f32) -> bool {
        self.escalate
            || self.sensitive_data
            || self.confidence_score < threshold
            || self.is_refusal
            || self.sentiment == Sentiment::Angry
    }

    /// First applicable escalation cause, in reporting precedence. A verdict
    /// the evaluator forced (no context, failed evaluation) reports as low
    /// confidence whatever the threshold.
    pub fn escalation_kind(&self, threshold: f32) -> Option<EscalationKind> {
        if self.sensitive_data {
            Some(EscalationKind::SensitiveData)
        } else if self.sentiment == Sentiment::Angry {
            Some(EscalationKind::Anger)
        } else if self.is_refusal {
            Some(EscalationKind::Refusal)
        } else if self.confidence_score < threshold || self.escalate {
            Some(EscalationKind::LowConfidence)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Admission,
    Scope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    SensitiveData,
    Anger,
    Refusal,
    LowConfidence,
    UpstreamFailure,
    LowRating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub summary: String,
    pub keywords: Vec<String>,
    pub target_department: AgentRole,
}

impl Orientation {
    pub fn from_analysis(analysis: &QueryAnalysis) -> Self {
        let summary = if analysis.summary.trim().is_empty() {
            "N/A".to_string()
        } else {
            analysis.summary.clone()
        };
        Self {
            summary,
            keywords: analysis.keywords.iter().cloned().collect(),
            target_department: analysis.target_department(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejected {
    pub kind: RejectionKind,
    pub reason: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
    pub precheck: PrecheckResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<QueryAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalated {
    pub kind: EscalationKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Orientation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precheck: Option<PrecheckResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<QueryAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Success {
    pub final_response: String,
    pub confidence: f32,
    pub analysis: QueryAnalysis,
    pub precheck: PrecheckResult,
    pub proposed_answer: String,
    pub fallback_used: bool,
}

/// The only value handed back to callers of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PipelineResult {
    Rejected(Rejected),
    Escalated(Escalated),
    Success(Success),
}

impl PipelineResult {
    pub fn status(&self) -> &'static str {
        match self {
            PipelineResult::Rejected(_) => "rejected",
            PipelineResult::Escalated(_) => "escalated",
            PipelineResult::Success(_) => "success",
        }
    }

    pub fn final_response(&self) -> Option<&str> {
        match self {
            PipelineResult::Rejected(r) => r.final_response.as_deref(),
            PipelineResult::Escalated(e) => e.final_response.as_deref(),
            PipelineResult::Success(s) => Some(s.final_response.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RatingOutcome {
    Completed { message: String },
    Escalated(Escalated),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn similarity_is_one_only_at_zero_distance() {
        assert_eq!(similarity_from_distance(0.0), 1.0);
        assert!(similarity_from_distance(0.01) < 1.0);
        assert!(similarity_from_distance(0.2) > similarity_from_distance(0.3));
        assert_eq!(similarity_from_distance(1.0), 0.5);
        assert_eq!(similarity_from_distance(f32::NAN), 0.0);
        assert_eq!(similarity_from_distance(-3.0), 1.0);
    }

    #[test]
    fn category_parse_accepts_labels_and_aliases() {
        for category in Category::ALL {
            assert_eq!(Category::parse(category.label()), Some(category));
        }
        assert_eq!(
            Category::parse("support and reference documentation"),
            Some(Category::SupportReference)
        );
        assert_eq!(Category::parse("Legal"), Some(Category::Legal));
        assert_eq!(Category::parse(""), None);
        assert_eq!(Category::parse("cooking"), None);
    }

    #[test]
    fn retrieval_query_falls_back_to_raw_text() {
        let mut analysis = QueryAnalysis::degraded("raw", "boom");
        assert_eq!(analysis.retrieval_query("raw"), "raw");
        analysis.optimized_query = Some("  ".into());
        assert_eq!(analysis.retrieval_query("raw"), "raw");
        analysis.optimized_query = Some("optimized".into());
        assert_eq!(analysis.retrieval_query("raw"), "optimized");
        analysis.optimized_query = None;
        assert_eq!(analysis.retrieval_query("raw"), "raw");
    }

    #[test]
    fn escalation_kind_follows_precedence() {
        let mut evaluation = Evaluation {
            confidence_score: 0.2,
            escalate: true,
            sentiment: Sentiment::Angry,
            sensitive_data: true,
            non_standard: false,
            is_refusal: true,
            reason: String::new(),
            escalation_context: None,
        };
        assert_eq!(
            evaluation.escalation_kind(0.6),
            Some(EscalationKind::SensitiveData)
        );
        evaluation.sensitive_data = false;
        assert_eq!(evaluation.escalation_kind(0.6), Some(EscalationKind::Anger));
        evaluation.sentiment = Sentiment::Frustrated;
        assert_eq!(evaluation.escalation_kind(0.6), Some(EscalationKind::Refusal));
        evaluation.is_refusal = false;
        assert_eq!(
            evaluation.escalation_kind(0.6),
            Some(EscalationKind::LowConfidence)
        );
        evaluation.confidence_score = 0.6;
        assert_eq!(
            evaluation.escalation_kind(0.6),
            Some(EscalationKind::LowConfidence)
        );
        evaluation.escalate = false;
        assert_eq!(evaluation.escalation_kind(0.6), None);
        assert!(!evaluation.requires_escalation(0.6));
    }

    #[test]
    fn pipeline_result_is_tagged_by_status() {
        let result = PipelineResult::Rejected(Rejected {
            kind: RejectionKind::Admission,
            reason: vec!["Ticket identified as spam.".into()],
            final_response: None,
            precheck: PrecheckResult {
                is_supported_language: true,
                is_spam: true,
                passed: false,
                reasons: vec!["Ticket identified as spam.".into()],
            },
            analysis: None,
        });
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], json!("rejected"));
        assert_eq!(value["kind"], json!("admission"));
        assert!(value.get("analysis").is_none());
        let back: PipelineResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.status(), "rejected");
    }

    #[test]
    fn analysis_deserializes_with_defaults() {
        let analysis: QueryAnalysis = serde_json::from_value(json!({
            "summary": "s",
            "category": "Other",
            "agent_role": "agt_sales"
        }))
        .unwrap();
        assert!(analysis.is_in_scope);
        assert!(analysis.is_sufficient);
        assert_eq!(analysis.category, Some(Category::Other));
        assert_eq!(analysis.target_department(), AgentRole::Sales);
    }
}
