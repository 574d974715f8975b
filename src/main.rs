//! Bulletin triage worker: HTTP surface for processing bidding bulletins.

mod analysis;
mod bundle;
mod config;
mod error;
mod export;
mod llm;
mod model;
mod notify;
mod ocr;
mod pipeline;
mod store;
mod triage;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use analysis::LlmAnalyst;
use config::{Catalog, Settings};
use llm::OpenRouterClient;
use model::RunSummary;
use notify::WhatsAppNotifier;
use ocr::{MistralOcrProvider, OcrProvider};
use pipeline::{Pipeline, RunInput};
use store::SupabaseStore;
use triage::LlmTriage;

/// Status of a background run, exposed on /runs/:id.
#[derive(Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum RunStatus {
    Running,
    Done { summary: RunSummary },
    Failed { error: String },
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    runs: Arc<RwLock<HashMap<String, RunStatus>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "licitacao_triage=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let catalog = Catalog::load(std::path::Path::new("configs/catalog.json"))?;

    let http = reqwest::Client::new();
    let openrouter = OpenRouterClient::new(
        http.clone(),
        &settings.openrouter_api_key,
        &settings.triage_model,
        &settings.analysis_model,
    );

    let ocr: Option<Arc<dyn OcrProvider>> = match &settings.mistral_api_key {
        Some(key) => {
            info!("OCR fallback enabled (Mistral)");
            Some(Arc::new(MistralOcrProvider::new(http.clone(), key)))
        }
        None => {
            info!("MISTRAL_API_KEY not set, OCR fallback disabled");
            None
        }
    };

    let pipeline = Pipeline {
        catalog,
        classifier: Arc::new(LlmTriage::new(openrouter.clone())),
        analyst: Arc::new(LlmAnalyst::new(openrouter)),
        store: Arc::new(SupabaseStore::new(
            http.clone(),
            &settings.supabase_url,
            &settings.supabase_service_role_key,
        )),
        notifier: Arc::new(WhatsAppNotifier::new(
            http,
            &settings.evolution_api_url,
            &settings.evolution_api_key,
            &settings.evolution_instance,
        )),
        ocr,
        whatsapp_recipient: settings.whatsapp_recipient.clone(),
    };

    let state = AppState {
        pipeline: Arc::new(pipeline),
        runs: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/process", post(process))
        .route("/process-async", post(process_async))
        .route("/runs/:id", get(get_run))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

fn parse_flag(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "sim" | "yes" => true,
        "false" | "0" | "nao" | "não" | "no" => false,
        _ => default,
    }
}

/// Read the multipart upload into a run input.
///
/// Fields: `file` (the bulletin export, required), `documents` (edital
/// archive, optional), `subject` (bulletin e-mail subject, optional).
async fn read_input(mut multipart: Multipart) -> Result<RunInput, (StatusCode, String)> {
    let mut input = RunInput {
        export_filename: String::new(),
        export_data: Vec::new(),
        documents: None,
        subject: None,
        resolve_documents: true,
        send_notification: true,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                input.export_filename = field.file_name().unwrap_or("boletim.xlsx").to_string();
                input.export_data = field
                    .bytes()
                    .await
                    .map_err(|e| {
                        (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
                    })?
                    .to_vec();
            }
            Some("documents") => {
                let name = field.file_name().unwrap_or("editais.zip").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| {
                        (StatusCode::BAD_REQUEST, format!("Failed to read documents: {}", e))
                    })?
                    .to_vec();
                input.documents = Some((name, data));
            }
            Some("subject") => {
                input.subject = field.text().await.ok();
            }
            Some("resolve_documents") => {
                if let Ok(v) = field.text().await {
                    input.resolve_documents = parse_flag(&v, true);
                }
            }
            Some("send_notification") => {
                if let Ok(v) = field.text().await {
                    input.send_notification = parse_flag(&v, true);
                }
            }
            _ => {}
        }
    }

    if input.export_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }

    Ok(input)
}

/// Process a bulletin synchronously; the response is the run summary.
async fn process(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<RunSummary>, (StatusCode, String)> {
    let input = read_input(multipart).await?;
    info!(
        "Received bulletin {} ({} bytes)",
        input.export_filename,
        input.export_data.len()
    );

    match state.pipeline.run(input).await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) if e.is_fatal() => Err((StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
        Err(e) => {
            error!("Run failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

#[derive(Serialize)]
struct AsyncAccepted {
    id: String,
}

/// Accept a bulletin and process it in the background. Poll /runs/:id for
/// the outcome.
async fn process_async(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<AsyncAccepted>), (StatusCode, String)> {
    let input = read_input(multipart).await?;
    let id = format!("job_{}", Uuid::new_v4().simple());

    state
        .runs
        .write()
        .unwrap()
        .insert(id.clone(), RunStatus::Running);

    let pipeline = state.pipeline.clone();
    let runs = state.runs.clone();
    let job_id = id.clone();
    tokio::spawn(async move {
        let status = match pipeline.run(input).await {
            Ok(summary) => RunStatus::Done { summary },
            Err(e) => {
                error!("Background run {} failed: {}", job_id, e);
                RunStatus::Failed {
                    error: e.to_string(),
                }
            }
        };
        runs.write().unwrap().insert(job_id, status);
    });

    Ok((StatusCode::ACCEPTED, Json(AsyncAccepted { id })))
}

/// Fetch the status of a background run.
async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunStatus>, StatusCode> {
    let runs = state.runs.read().unwrap();
    runs.get(&id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}
