use std::cmp::Ordering;

use tracing::{debug, info};
use triage_llm::LlmRequest;

use crate::error::Result;
use crate::model::{similarity_from_distance, Category, RagResult, RetrievedDocument};
use crate::resilience::{GuardedModel, GuardedSearch};

const STAGE: &str = "retrieving";

pub const NO_INFORMATION_ANSWER: &str = "Désolé, je n'ai trouvé aucune information pertinente dans la base de connaissances pour répondre à votre demande.";

const REFUSAL_MARKERS: &[&str] = &[
    "ne contiennent pas",
    "pas d'informations",
    "pas d'information",
    "je ne sais pas",
    "information is missing",
    "not mentioned",
    "aucune information",
    "malheureusement",
    "don't have information",
    "do not contain",
    "no information",
    "not found",
    "not provide",
    "unable to find",
    "cannot find",
    "not available",
    "n'est pas mentionné",
    "ne précise pas",
    "ne mentionnent pas",
    "ne mentionne pas",
    "pas explicitement",
];

/// True when a generated answer says the documents did not hold the answer.
pub fn is_refusal(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    REFUSAL_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub max_doc_chars: usize,
}

/// Category-scoped retrieval with a global fallback.
#[derive(Clone)]
pub struct RetrievalEngine {
    search: GuardedSearch,
    model: GuardedModel,
    settings: RetrievalSettings,
    brand_name: String,
}

struct Attempt {
    documents: Vec<RetrievedDocument>,
    answer: String,
}

impl Attempt {
    fn best(&self) -> f32 {
        self.documents.first().map(|d| d.similarity).unwrap_or(0.0)
    }
}

impl RetrievalEngine {
    pub fn new(
        search: GuardedSearch,
        model: GuardedModel,
        settings: RetrievalSettings,
        brand_name: impl Into<String>,
    ) -> Self {
        Self {
            search,
            model,
            settings,
            brand_name: brand_name.into(),
        }
    }

    pub async fn find(
        &self,
        query: &str,
        category: Option<Category>,
        trace_id: &str,
    ) -> Result<RagResult> {
        let local = self.attempt(query, category).await?;
        let local_best = local.best();
        let local_refused = is_refusal(&local.answer);
        debug!(
            trace_id,
            stage = STAGE,
            category = category.map(|c| c.label()).unwrap_or("all"),
            documents = local.documents.len(),
            best = local_best,
            refusal = local_refused,
            "scoped retrieval done"
        );

        if category.is_some()
            && (local_best < self.settings.similarity_threshold || local_refused)
        {
            let global_docs = self.retrieve(query, None).await?;
            let global_best = global_docs.first().map(|d| d.similarity).unwrap_or(0.0);
            info!(
                trace_id,
                stage = STAGE,
                local_best,
                global_best,
                local_refused,
                "widened search to all categories"
            );
            if global_best > local_best || local_refused {
                let answer = self.generate(query, &global_docs).await?;
                return Ok(RagResult {
                    query: query.to_string(),
                    documents: global_docs,
                    answer,
                    fallback_used: true,
                });
            }
        }

        Ok(RagResult {
            query: query.to_string(),
            documents: local.documents,
            answer: local.answer,
            fallback_used: false,
        })
    }

    async fn attempt(&self, query: &str, category: Option<Category>) -> Result<Attempt> {
        let documents = self.retrieve(query, category).await?;
        let answer = self.generate(query, &documents).await?;
        Ok(Attempt { documents, answer })
    }

    async fn retrieve(
        &self,
        query: &str,
        category: Option<Category>,
    ) -> Result<Vec<RetrievedDocument>> {
        let hits = self
            .search
            .query(query, category.map(|c| c.label()), self.settings.top_k)
            .await?;
        let mut documents: Vec<RetrievedDocument> = hits
            .into_iter()
            .map(|hit| RetrievedDocument {
                similarity: similarity_from_distance(hit.distance),
                id: hit.id,
                content: hit.content,
                category: hit.category,
            })
            .collect();
        documents.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
        });
        Ok(documents)
    }

    async fn generate(&self, query: &str, documents: &[RetrievedDocument]) -> Result<String> {
        if documents.is_empty() {
            return Ok(NO_INFORMATION_ANSWER.to_string());
        }
        let context = documents
            .iter()
            .take(self.settings.top_k)
            .enumerate()
            .map(|(idx, doc)| {
                let excerpt: String = doc.content.chars().take(self.settings.max_doc_chars).collect();
                format!(
                    "[Doc {} - Catégorie: {}] {}",
                    idx + 1,
                    doc.category.as_deref().unwrap_or("N/A"),
                    excerpt
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let system = format!(
            "You are a solution finder for {}.\n\
Use ONLY the provided documents to answer.\n\
If the information is not in the documents, say clearly that you don't have the information.\n\
Answer in French.",
            self.brand_name
        );
        let user = format!(
            "Context documents:\n{context}\n\nQuestion:\n{query}\n\nAnswer with a clear solution and short explanation."
        );
        let response = self
            .model
            .complete("generate_answer", &LlmRequest::new(system, user))
            .await?;
        Ok(response.content.trim().to_string())
    }
}
