use std::sync::Arc;

use classical_cv::{DispatchError, DispatchPool, Dispatcher, DispatcherConfig};

/// Largest accepted upload unless `CV_BODY_LIMIT` says otherwise.
pub const DEFAULT_BODY_LIMIT: usize = 32 * 1024 * 1024;

/// Where the server listens and how much it accepts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Maximum request body in bytes.
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:3001".to_string(), body_limit: DEFAULT_BODY_LIMIT }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CV_BIND` and `CV_BODY_LIMIT`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(bind) = std::env::var("CV_BIND") {
            cfg.bind_addr = bind;
        }
        if let Some(limit) = std::env::var("CV_BODY_LIMIT").ok().and_then(|v| v.parse().ok()) {
            cfg.body_limit = limit;
        }
        cfg
    }
}

/// Shared request state: one pool over one dispatcher for the whole server.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<DispatchPool>,
}

impl AppState {
    /// Must be called inside a tokio runtime; the pool spawns its workers here.
    pub fn new(config: DispatcherConfig) -> anyhow::Result<Self> {
        let dispatcher = Dispatcher::new(config)?;
        Ok(Self { pool: Arc::new(DispatchPool::new(Arc::new(dispatcher))) })
    }
}

/// HTTP status code for a failed request.
pub fn http_status(error: &DispatchError) -> u16 {
    match error {
        DispatchError::MissingInput | DispatchError::InvalidParameter(_) => 400,
        DispatchError::UnknownCategory(_) | DispatchError::UnknownAlgorithm { .. } => 404,
        DispatchError::ProcessingFailure(_) => 422,
        DispatchError::WorkerUnavailable => 503,
        DispatchError::DuplicateKey { .. } => 500,
    }
}

#[cfg(feature = "web")]
pub fn router(state: AppState, body_limit: usize) -> axum::Router {
    use axum::body::Bytes;
    use axum::extract::{DefaultBodyLimit, Path, Query, State};
    use axum::http::{header, HeaderValue, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use classical_cv::{status_for, AlgorithmDescriptor, ParameterSet};
    use serde::Serialize;
    use std::io::Cursor;

    #[derive(Serialize)]
    struct CategorySummary {
        name: &'static str,
        algorithms: Vec<&'static str>,
    }

    #[derive(Serialize)]
    struct StatusBody {
        status: String,
    }

    fn failure(error: &DispatchError) -> Response {
        let code = StatusCode::from_u16(http_status(error)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (code, Json(StatusBody { status: status_for(error) })).into_response()
    }

    async fn categories(State(state): State<AppState>) -> Json<Vec<CategorySummary>> {
        let registry = state.pool.dispatcher().registry();
        Json(
            registry
                .categories()
                .into_iter()
                .map(|category| CategorySummary {
                    name: category.name(),
                    algorithms: registry.descriptors(category).map(AlgorithmDescriptor::name).collect(),
                })
                .collect(),
        )
    }

    async fn algorithms(State(state): State<AppState>, Path(category): Path<String>) -> Response {
        let registry = state.pool.dispatcher().registry();
        match category.parse() {
            Ok(category) => Json(registry.descriptors(category).cloned().collect::<Vec<_>>()).into_response(),
            Err(error) => failure(&error),
        }
    }

    async fn process(
        State(state): State<AppState>,
        Path((category, name)): Path<(String, String)>,
        Query(query): Query<Vec<(String, String)>>,
        body: Bytes,
    ) -> Response {
        let dispatcher = state.pool.dispatcher();
        let schema = match dispatcher.registry().lookup(&category, &name) {
            Ok(entry) => entry.descriptor.params,
            Err(error) => return failure(&error),
        };
        let pairs: Vec<String> = query.iter().map(|(key, value)| format!("{key}={value}")).collect();
        let params = match ParameterSet::parse(pairs.iter().map(String::as_str), schema) {
            Ok(params) => params,
            Err(error) => return failure(&error),
        };
        let image = if body.is_empty() {
            None
        } else {
            match image::load_from_memory(&body) {
                Ok(image) => Some(Arc::new(image)),
                Err(error) => {
                    tracing::warn!(%error, "undecodable upload");
                    let status = format!("Error processing image: {error}");
                    return (StatusCode::BAD_REQUEST, Json(StatusBody { status })).into_response();
                }
            }
        };

        let processed = match state.pool.submit(category, name, image, params).await {
            Ok(processed) => processed,
            Err(error) => return failure(&error),
        };
        let mut png = Vec::new();
        if let Err(error) = processed.image.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png) {
            return failure(&DispatchError::ProcessingFailure(error.to_string()));
        }
        let mut response = (StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], png).into_response();
        if let Ok(value) = HeaderValue::from_str(&processed.status) {
            response.headers_mut().insert("x-cv-status", value);
        }
        response
    }

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/categories", get(categories))
        .route("/categories/:category/algorithms", get(algorithms))
        .route("/process/:category/:algorithm", post(process))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

#[cfg(feature = "web")]
pub async fn start_server(cfg: ServerConfig, dispatcher: DispatcherConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = router(AppState::new(dispatcher)?, cfg.body_limit);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!("classical_cv server listening on http://{}", cfg.bind_addr);
    let server = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(%error, "server stopped");
        }
    });
    Ok(server)
}

#[cfg(not(feature = "web"))]
pub async fn start_server(_cfg: ServerConfig, _dispatcher: DispatcherConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    Err(anyhow::anyhow!("web feature not enabled for classical_cv_server"))
}
