use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use triage_core::{
    Category, Collaborators, Orchestrator, PrecheckResult, QueryAnalysis, RuntimeSettings,
    TriageConfig,
};
use triage_rag::{ingest_path, VectorSearch, DEFAULT_CHUNK_CHARS};

const STARTING_MESSAGE: &str =
    "The triage pipeline is starting up, please retry in a few seconds.";

/// Everything a request needs once the collaborators are connected.
struct Pipeline {
    orchestrator: Orchestrator,
    search: Arc<dyn VectorSearch>,
}

struct AppState {
    settings: RuntimeSettings,
    config: TriageConfig,
    pipeline: OnceCell<Arc<Pipeline>>,
    starting: AtomicBool,
}

impl AppState {
    fn new(settings: RuntimeSettings, config: TriageConfig) -> Self {
        Self {
            settings,
            config,
            pipeline: OnceCell::new(),
            starting: AtomicBool::new(false),
        }
    }

    fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.get().cloned()
    }

    fn is_starting(&self) -> bool {
        self.starting.load(Ordering::SeqCst)
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let settings = RuntimeSettings::from_env()?;
    let config = TriageConfig::load(&settings.config_path)?;
    let addr: SocketAddr = settings.bind_addr.parse()?;
    let state = Arc::new(AppState::new(settings, config));
    start_initialization(&state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/process_ticket", post(handle_process_ticket))
        .route("/rate_ticket", post(handle_rate_ticket))
        .route("/ingest", post(handle_ingest))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Connects the collaborators in the background. Returns false when the
/// pipeline is already up or another initialization is running.
fn start_initialization(state: &Arc<AppState>) -> bool {
    if state.pipeline.get().is_some() {
        return false;
    }
    if state
        .starting
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return false;
    }
    let state = Arc::clone(state);
    tokio::spawn(async move {
        match Collaborators::connect(state.settings.clone()).await {
            Ok(collaborators) => {
                let search = collaborators.search();
                let orchestrator = Orchestrator::new(
                    state.config.clone(),
                    Arc::clone(&collaborators.model),
                    Arc::clone(&search),
                );
                if state
                    .pipeline
                    .set(Arc::new(Pipeline {
                        orchestrator,
                        search,
                    }))
                    .is_ok()
                {
                    info!("pipeline ready");
                }
            }
            Err(err) => error!(error = %err, "pipeline initialization failed"),
        }
        state.starting.store(false, Ordering::SeqCst);
    });
    true
}

#[derive(Debug, Serialize)]
struct StartingResponse {
    status: &'static str,
    message: &'static str,
}

fn starting_response(state: &Arc<AppState>) -> Response {
    if start_initialization(state) {
        warn!("request arrived before the pipeline was ready, initialization restarted");
    }
    (
        StatusCode::ACCEPTED,
        Json(StartingResponse {
            status: "starting",
            message: STARTING_MESSAGE,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct TicketRequest {
    #[serde(default)]
    ticket: String,
}

async fn handle_process_ticket(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TicketRequest>,
) -> Result<Response, AppError> {
    if body.ticket.trim().is_empty() {
        return Err(AppError::bad_request("ticket must not be empty"));
    }
    let Some(pipeline) = state.pipeline() else {
        return Ok(starting_response(&state));
    };
    let result = pipeline.orchestrator.process_ticket(&body.ticket).await;
    Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
struct RatingRequest {
    ticket_id: String,
    stars: u8,
    analysis: QueryAnalysis,
    precheck: PrecheckResult,
}

async fn handle_rate_ticket(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RatingRequest>,
) -> Result<Response, AppError> {
    if !(1..=5).contains(&body.stars) {
        return Err(AppError::bad_request("stars must be between 1 and 5"));
    }
    let Some(pipeline) = state.pipeline() else {
        return Ok(starting_response(&state));
    };
    let outcome = pipeline.orchestrator.handle_rating(
        &body.ticket_id,
        body.stars,
        &body.analysis,
        &body.precheck,
    );
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    path: PathBuf,
    category: String,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    status: &'static str,
    chunks: usize,
}

async fn handle_ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestRequest>,
) -> Result<Response, AppError> {
    let category = Category::parse(&body.category)
        .ok_or_else(|| AppError::bad_request(format!("unknown category {}", body.category)))?;
    if !body.path.is_file() {
        return Err(AppError::NotFound(format!(
            "{} does not exist",
            body.path.display()
        )));
    }
    let Some(pipeline) = state.pipeline() else {
        return Ok(starting_response(&state));
    };
    let chunks = ingest_path(
        pipeline.search.as_ref(),
        &body.path,
        category.label(),
        DEFAULT_CHUNK_CHARS,
    )
    .await
    .map_err(AppError::internal)?;
    Ok(Json(IngestResponse {
        status: "ok",
        chunks,
    })
    .into_response())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ready: bool,
    starting: bool,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ready: state.pipeline.get().is_some(),
        starting: state.is_starting(),
    })
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn bad_request<E: ToString>(msg: E) -> Self {
        Self::BadRequest(msg.to_string())
    }

    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal(err) => {
                error!("internal_error" = %err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::io::Write;
    use triage_llm::{LanguageModel, LlmProvider, LlmRequest, LlmResponse};
    use triage_rag::{ChunkInsert, SearchHit};

    struct OfflineModel;

    #[async_trait]
    impl LanguageModel for OfflineModel {
        async fn complete(&self, _req: &LlmRequest) -> anyhow::Result<LlmResponse> {
            anyhow::bail!("offline")
        }
    }

    #[derive(Default)]
    struct MemorySearch {
        chunks: Mutex<Vec<ChunkInsert>>,
    }

    #[async_trait]
    impl VectorSearch for MemorySearch {
        async fn query(
            &self,
            _text: &str,
            _category: Option<&str>,
            _k: usize,
        ) -> anyhow::Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }

        async fn add(&self, batch: Vec<ChunkInsert>) -> anyhow::Result<usize> {
            let added = batch.len();
            self.chunks.lock().extend(batch);
            Ok(added)
        }
    }

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            provider: LlmProvider::Mistral,
            model: "test".into(),
            db_path: PathBuf::from("unused.sqlite"),
            config_path: PathBuf::from("unused.toml"),
            bind_addr: "127.0.0.1:0".into(),
        }
    }

    /// A state that looks mid-initialization, so handlers never spawn one.
    fn starting_state() -> Arc<AppState> {
        let state = AppState::new(settings(), TriageConfig::default());
        state.starting.store(true, Ordering::SeqCst);
        Arc::new(state)
    }

    fn ready_state() -> (Arc<AppState>, Arc<MemorySearch>) {
        let search = Arc::new(MemorySearch::default());
        let mut config = TriageConfig::default();
        config.resilience.min_wait_ms = 0;
        config.resilience.max_wait_ms = 0;
        let state = AppState::new(settings(), config);
        let orchestrator =
            Orchestrator::new(state.config.clone(), Arc::new(OfflineModel), search.clone());
        let installed = state.pipeline.set(Arc::new(Pipeline {
            orchestrator,
            search: search.clone(),
        }));
        assert!(installed.is_ok());
        (Arc::new(state), search)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn ticket(text: &str) -> Json<TicketRequest> {
        Json(TicketRequest {
            ticket: text.to_string(),
        })
    }

    #[tokio::test]
    async fn health_reflects_startup() {
        let Json(health) = handle_health(State(starting_state())).await;
        assert!(!health.ready);
        assert!(health.starting);

        let (state, _) = ready_state();
        let Json(health) = handle_health(State(state)).await;
        assert!(health.ready);
        assert!(!health.starting);
    }

    #[tokio::test]
    async fn blank_ticket_is_rejected() {
        let err = handle_process_ticket(State(starting_state()), ticket("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ticket_before_ready_is_accepted_for_later() {
        let response = handle_process_ticket(State(starting_state()), ticket("Bonjour"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "starting");
        assert_eq!(body["message"], STARTING_MESSAGE);
    }

    #[tokio::test]
    async fn ready_pipeline_returns_result_json() {
        let (state, _) = ready_state();
        let response =
            handle_process_ticket(State(state), ticket("こんにちは、パスワードを忘れました"))
                .await
                .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "rejected");
    }

    #[tokio::test]
    async fn upstream_outage_still_answers() {
        let (state, _) = ready_state();
        let response = handle_process_ticket(
            State(state),
            ticket("Bonjour, je n'arrive plus à me connecter à mon compte depuis hier."),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "escalated");
    }

    #[tokio::test]
    async fn low_rating_escalates() {
        let (state, _) = ready_state();
        let request = RatingRequest {
            ticket_id: "t-1".into(),
            stars: 1,
            analysis: serde_json::from_value(json!({"summary": "login", "agent_role": "agt_sales"}))
                .unwrap(),
            precheck: PrecheckResult {
                is_supported_language: true,
                is_spam: false,
                passed: true,
                reasons: vec![],
            },
        };
        let response = handle_rate_ticket(State(state), Json(request)).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "escalated");
        assert_eq!(body["orientation"]["target_department"], "agt_sales");
    }

    #[tokio::test]
    async fn out_of_range_rating_is_bad_request() {
        let (state, _) = ready_state();
        let request = RatingRequest {
            ticket_id: "t-1".into(),
            stars: 9,
            analysis: serde_json::from_value(json!({})).unwrap(),
            precheck: PrecheckResult {
                is_supported_language: true,
                is_spam: false,
                passed: true,
                reasons: vec![],
            },
        };
        let err = handle_rate_ticket(State(state), Json(request))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn ingest_missing_file_is_not_found() {
        let (state, _) = ready_state();
        let err = handle_ingest(
            State(state),
            Json(IngestRequest {
                path: PathBuf::from("/nonexistent/guide.txt"),
                category: "Other".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ingest_indexes_file_under_category() {
        let (state, search) = ready_state();
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        writeln!(file, "Pour réinitialiser votre mot de passe, ouvrez les paramètres.").unwrap();
        let response = handle_ingest(
            State(state),
            Json(IngestRequest {
                path: file.path().to_path_buf(),
                category: "operational".into(),
            }),
        )
        .await
        .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        let chunks = body["chunks"].as_u64().unwrap() as usize;
        assert!(chunks >= 1);
        let stored = search.chunks.lock();
        assert_eq!(stored.len(), chunks);
        assert_eq!(
            stored[0].category.as_deref(),
            Some(Category::Operational.label())
        );
    }
}
