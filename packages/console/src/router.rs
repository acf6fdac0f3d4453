use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use agent_console_error::{ConsoleError, ErrorType, ProblemDetails};

use crate::config::{Config, MAX_MODEL_CHARS, MAX_PROMPT_CHARS, MAX_REASONING_CHARS};
use crate::context;
use crate::engine::{
    ExecOutcome, JobSummary, PollResponse, StartTurnResponse, StopResponse, StopStatus,
    StreamEngine,
};
use crate::settings::{SettingsService, WorkspaceSettings};
use crate::store::{Message, Role, Session, SessionStore, SessionSummary};
use crate::usage::{self, RateWindow, UsageSummary};
use crate::vcs::{VcsAction, VcsActionResult, VcsService};

#[derive(Debug)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub engine: Arc<StreamEngine>,
    pub settings: Arc<SettingsService>,
    pub vcs: Arc<VcsService>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(SessionStore::new(config.store_path.clone()));
        let settings = Arc::new(SettingsService::new(
            config.settings_path.clone(),
            config.agent_home.join("config.toml"),
        ));
        let engine = Arc::new(StreamEngine::new(
            store.clone(),
            settings.clone(),
            config.clone(),
        ));
        let vcs = Arc::new(VcsService::new(config.workspace_dir.clone(), store.clone()));
        Self {
            store,
            engine,
            settings,
            vcs,
            config,
        }
    }
}

pub fn build_router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    let api_router = Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/:session_id",
            get(get_session).patch(rename_session).delete(delete_session),
        )
        .route("/sessions/:session_id/messages", post(post_message))
        .route(
            "/sessions/:session_id/messages/stream",
            post(post_message_stream),
        )
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id", get(poll_job))
        .route("/jobs/:job_id/stop", post(stop_job))
        .route("/settings", get(get_settings).patch(patch_settings))
        .route("/usage", get(get_usage))
        .route("/vcs/:action", post(run_vcs_action))
        .with_state(state.clone());

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .nest("/api", api_router)
        .with_state(state)
        .fallback(not_found)
        .layer(cors)
        .layer(trace_layer)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_sessions,
        create_session,
        get_session,
        rename_session,
        delete_session,
        post_message,
        post_message_stream,
        list_jobs,
        poll_job,
        stop_job,
        get_settings,
        patch_settings,
        get_usage,
        run_vcs_action
    ),
    components(schemas(
        HealthResponse,
        ServiceDescriptor,
        Role,
        Message,
        Session,
        SessionSummary,
        SessionListResponse,
        SessionEnvelope,
        CreateSessionRequest,
        RenameSessionRequest,
        MessageRequest,
        ExchangeResponse,
        StartTurnResponse,
        JobSummary,
        JobListResponse,
        PollResponse,
        StopResponse,
        StopStatus,
        WorkspaceSettings,
        SettingsResponse,
        SettingsUpdateRequest,
        RateWindow,
        UsageSummary,
        VcsAction,
        VcsActionResult,
        ProblemDetails,
        ErrorType
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Conversation management"),
        (name = "jobs", description = "Streaming agent runs"),
        (name = "workspace", description = "Settings, usage, and version control")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Console(#[from] ConsoleError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Console(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema, JsonSchema)]
struct ServiceDescriptor {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize, ToSchema, JsonSchema)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize, ToSchema, JsonSchema)]
struct SessionListResponse {
    sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize, ToSchema, JsonSchema)]
struct SessionEnvelope {
    session: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_job_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema, JsonSchema)]
struct CreateSessionRequest {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema, JsonSchema)]
struct RenameSessionRequest {
    title: String,
}

#[derive(Debug, Deserialize, ToSchema, JsonSchema)]
struct MessageRequest {
    prompt: String,
}

#[derive(Debug, Serialize, ToSchema, JsonSchema)]
struct ExchangeResponse {
    user_message: Message,
    reply_message: Message,
    session: Session,
}

#[derive(Debug, Deserialize)]
struct JobListQuery {
    #[serde(default)]
    include_done: bool,
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    error_offset: i64,
}

#[derive(Debug, Serialize, ToSchema, JsonSchema)]
struct JobListResponse {
    jobs: Vec<JobSummary>,
}

#[derive(Debug, Serialize, ToSchema, JsonSchema)]
struct SettingsResponse {
    settings: WorkspaceSettings,
    model_options: Vec<String>,
    reasoning_options: Vec<String>,
    usage: UsageSummary,
}

#[derive(Debug, Deserialize, ToSchema, JsonSchema)]
struct SettingsUpdateRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    reasoning_effort: Option<String>,
}

async fn get_root() -> Json<ServiceDescriptor> {
    Json(ServiceDescriptor {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn not_found() -> Response {
    let problem = ProblemDetails::new(ErrorType::NotFound, Some("unknown route".to_string()));
    (StatusCode::NOT_FOUND, Json(problem)).into_response()
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "meta",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/api/sessions",
    tag = "sessions",
    responses((status = 200, description = "Conversations, newest first", body = SessionListResponse))
)]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = state.store.list()?;
    Ok(Json(SessionListResponse { sessions }))
}

#[utoipa::path(
    post,
    path = "/api/sessions",
    tag = "sessions",
    request_body = CreateSessionRequest,
    responses((status = 201, description = "Conversation created", body = Session))
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let session = state.store.create(request.title.as_deref())?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[utoipa::path(
    get,
    path = "/api/sessions/{session_id}",
    tag = "sessions",
    params(("session_id" = String, Path, description = "Conversation id")),
    responses(
        (status = 200, description = "Conversation with full transcript", body = SessionEnvelope),
        (status = 404, description = "Unknown conversation", body = ProblemDetails)
    )
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionEnvelope>, ApiError> {
    let session = state.store.get(&session_id)?;
    let active_job_id = state.engine.active_job_id(&session_id).await;
    Ok(Json(SessionEnvelope {
        session,
        active_job_id,
    }))
}

#[utoipa::path(
    patch,
    path = "/api/sessions/{session_id}",
    tag = "sessions",
    request_body = RenameSessionRequest,
    responses(
        (status = 200, description = "Renamed conversation", body = Session),
        (status = 409, description = "A job is running for this conversation", body = ProblemDetails)
    )
)]
async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<RenameSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    reject_while_running(&state, &session_id).await?;
    let session = state.store.rename(&session_id, &request.title)?;
    Ok(Json(session))
}

#[utoipa::path(
    delete,
    path = "/api/sessions/{session_id}",
    tag = "sessions",
    responses(
        (status = 204, description = "Conversation deleted"),
        (status = 409, description = "A job is running for this conversation", body = ProblemDetails)
    )
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    reject_while_running(&state, &session_id).await?;
    state.store.delete(&session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Blocking turn: the whole agent run happens inside the request, and both
/// sides of the exchange come back together.
#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/messages",
    tag = "sessions",
    request_body = MessageRequest,
    responses(
        (status = 200, description = "Completed exchange", body = ExchangeResponse),
        (status = 400, description = "Invalid prompt", body = ProblemDetails),
        (status = 409, description = "A job is already running", body = ProblemDetails)
    )
)]
async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<ExchangeResponse>, ApiError> {
    let prompt = validate_prompt(&request.prompt)?;
    reject_while_running(&state, &session_id).await?;
    let session = state.store.get(&session_id)?;
    state.store.ensure_default_title(&session_id, prompt)?;
    let payload =
        context::build_agent_prompt(&session.messages, prompt, state.config.context_max_chars);
    let user_message = state
        .store
        .append_message(&session_id, Role::User, prompt, None)?;

    let started = std::time::Instant::now();
    let outcome = state.engine.execute_once(&payload).await;
    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "duration_ms".to_string(),
        (started.elapsed().as_millis() as i64).into(),
    );
    // Timeouts and launch failures still land in the chat history; the
    // caller already has the user message recorded at this point.
    let reply_message = match outcome {
        Ok(ExecOutcome::Success(text)) => {
            state
                .store
                .append_message(&session_id, Role::Assistant, &text, Some(metadata))?
        }
        Ok(ExecOutcome::Failure(text)) => {
            state
                .store
                .append_message(&session_id, Role::Error, &text, Some(metadata))?
        }
        Err(err @ (ConsoleError::Timeout { .. } | ConsoleError::LaunchFailure { .. })) => {
            let text = match &err {
                ConsoleError::Timeout {
                    message: Some(message),
                } => message.clone(),
                other => other.to_string(),
            };
            state
                .store
                .append_message(&session_id, Role::Error, &text, Some(metadata))?
        }
        Err(err) => return Err(err.into()),
    };
    let session = state.store.get(&session_id)?;
    Ok(Json(ExchangeResponse {
        user_message,
        reply_message,
        session,
    }))
}

#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/messages/stream",
    tag = "sessions",
    request_body = MessageRequest,
    responses(
        (status = 202, description = "Streaming turn started", body = StartTurnResponse),
        (status = 409, description = "A job is already running", body = ProblemDetails)
    )
)]
async fn post_message_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<(StatusCode, Json<StartTurnResponse>), ApiError> {
    let prompt = validate_prompt(&request.prompt)?;
    let started = state.engine.start_turn(&session_id, prompt).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

#[utoipa::path(
    get,
    path = "/api/jobs",
    tag = "jobs",
    params(("include_done" = bool, Query, description = "Include finished jobs")),
    responses((status = 200, description = "Jobs, most recently active first", body = JobListResponse))
)]
async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobListQuery>,
) -> Json<JobListResponse> {
    let jobs = state.engine.list_jobs(query.include_done).await;
    Json(JobListResponse { jobs })
}

/// Poll handler doubles as the finalizer: a done-but-unsaved job gets its
/// transcript committed here, and the saved message rides along once.
#[utoipa::path(
    get,
    path = "/api/jobs/{job_id}",
    tag = "jobs",
    params(
        ("job_id" = String, Path, description = "Job id"),
        ("offset" = i64, Query, description = "Character offset into the output buffer"),
        ("error_offset" = i64, Query, description = "Character offset into the error buffer")
    ),
    responses(
        (status = 200, description = "Incremental job view", body = PollResponse),
        (status = 404, description = "Unknown or reaped job", body = ProblemDetails)
    )
)]
async fn poll_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    state.engine.reap().await;
    let saved_message = state.engine.finalize(&job_id).await?;
    let mut poll = state
        .engine
        .poll(
            &job_id,
            query.offset.max(0) as usize,
            query.error_offset.max(0) as usize,
        )
        .await?;
    poll.saved_message = saved_message;
    Ok(Json(poll))
}

#[utoipa::path(
    post,
    path = "/api/jobs/{job_id}/stop",
    tag = "jobs",
    responses(
        (status = 200, description = "Stop outcome", body = StopResponse),
        (status = 404, description = "Unknown job", body = ProblemDetails)
    )
)]
async fn stop_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let response = state.engine.stop(&job_id).await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/settings",
    tag = "workspace",
    responses((status = 200, description = "Workspace settings and usage", body = SettingsResponse))
)]
async fn get_settings(State(state): State<Arc<AppState>>) -> Json<SettingsResponse> {
    let settings = state.settings.get();
    Json(settings_response(&state, settings))
}

#[utoipa::path(
    patch,
    path = "/api/settings",
    tag = "workspace",
    request_body = SettingsUpdateRequest,
    responses(
        (status = 200, description = "Updated settings", body = SettingsResponse),
        (status = 400, description = "Value too long", body = ProblemDetails)
    )
)]
async fn patch_settings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SettingsUpdateRequest>,
) -> Result<Json<SettingsResponse>, ApiError> {
    if let Some(model) = request.model.as_deref() {
        validate_length("model", model, MAX_MODEL_CHARS)?;
    }
    if let Some(reasoning) = request.reasoning_effort.as_deref() {
        validate_length("reasoning_effort", reasoning, MAX_REASONING_CHARS)?;
    }
    let settings = state.settings.update(
        request.model.as_deref(),
        request.reasoning_effort.as_deref(),
    );
    Ok(Json(settings_response(&state, settings)))
}

#[utoipa::path(
    get,
    path = "/api/usage",
    tag = "workspace",
    responses((status = 200, description = "Account usage summary", body = UsageSummary))
)]
async fn get_usage(State(state): State<Arc<AppState>>) -> Json<UsageSummary> {
    Json(usage::usage_summary(&state.config.agent_home))
}

#[utoipa::path(
    post,
    path = "/api/vcs/{action}",
    tag = "workspace",
    params(("action" = String, Path, description = "One of `sync` or `submit`")),
    responses(
        (status = 200, description = "Action result", body = VcsActionResult),
        (status = 409, description = "Another action is running", body = ProblemDetails)
    )
)]
async fn run_vcs_action(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> Result<Json<VcsActionResult>, ApiError> {
    let action = VcsAction::parse(&action)?;
    let vcs = state.vcs.clone();
    let result = tokio::task::spawn_blocking(move || vcs.run(action))
        .await
        .map_err(|err| ConsoleError::Internal {
            message: format!("vcs task failed: {err}"),
        })??;
    Ok(Json(result))
}

fn settings_response(state: &AppState, settings: WorkspaceSettings) -> SettingsResponse {
    SettingsResponse {
        settings,
        model_options: state.config.model_options.clone(),
        reasoning_options: state.config.reasoning_options.clone(),
        usage: usage::usage_summary(&state.config.agent_home),
    }
}

async fn reject_while_running(state: &AppState, session_id: &str) -> Result<(), ApiError> {
    if let Some(job_id) = state.engine.active_job_id(session_id).await {
        return Err(ApiError::Console(ConsoleError::AlreadyRunning {
            session_id: session_id.to_string(),
            job_id,
        }));
    }
    Ok(())
}

fn validate_prompt(prompt: &str) -> Result<&str, ConsoleError> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(ConsoleError::InvalidArgument {
            message: "prompt must not be empty".to_string(),
        });
    }
    if trimmed.chars().count() > MAX_PROMPT_CHARS {
        return Err(ConsoleError::InvalidArgument {
            message: format!("prompt exceeds {MAX_PROMPT_CHARS} characters"),
        });
    }
    Ok(trimmed)
}

fn validate_length(field: &str, value: &str, max_chars: usize) -> Result<(), ConsoleError> {
    if value.chars().count() > max_chars {
        return Err(ConsoleError::InvalidArgument {
            message: format!("{field} exceeds {max_chars} characters"),
        });
    }
    Ok(())
}
