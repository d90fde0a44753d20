use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::api::{ConnectError, ConnectResponse, SelfInfo};
use crate::auth::{AuthToken, Authenticator};
use crate::config::ServerConfig;
use crate::mcu::{McuManager, PipelineProvider};
use crate::metrics::{InstanceMetrics, MetricsSink};
use crate::rtm::{RtmManager, RtmManagerOptions};

#[derive(Clone)]
pub struct AppState {
    pub rtm: Arc<RtmManager>,
    pub mcu: Option<Arc<McuManager>>,
    pub authenticator: Arc<dyn Authenticator>,
    pub insecure: bool,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Builds the managers for `config`. Every connection and background task
    /// they start stops once `shutdown` is cancelled.
    pub fn new(
        config: &ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        sink: Arc<dyn MetricsSink>,
        metrics: Option<PrometheusHandle>,
        shutdown: CancellationToken,
    ) -> Self {
        let mcu = config.enable_mcu_api.then(|| {
            McuManager::new(
                config.mcu.clone(),
                config.pipeline.clone(),
                config.connection.clone(),
                shutdown.child_token(),
            )
        });
        let pipelines = mcu
            .clone()
            .map(|mcu| mcu as Arc<dyn PipelineProvider>);
        let rtm = RtmManager::new(RtmManagerOptions {
            instance_id: config.instance_id.clone(),
            settings: config.rtm.clone(),
            connection_settings: config.connection.clone(),
            authenticator: Arc::clone(&authenticator),
            pipelines,
            metrics: InstanceMetrics::new(sink, config.instance_id.as_str()),
            shutdown: shutdown.child_token(),
        });

        Self {
            rtm,
            mcu,
            authenticator,
            insecure: config.insecure,
            metrics,
        }
    }

    /// Starts the periodic sweeps of every manager.
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.rtm.spawn_sweeper()];
        if let Some(mcu) = &self.mcu {
            handles.push(mcu.spawn_sweeper());
        }
        handles
    }

    /// Refuses new RTM sessions while the live ones wind down.
    pub fn begin_drain(&self) {
        self.rtm.begin_drain();
    }

    pub fn active_connections(&self) -> usize {
        self.rtm.num_active() + self.mcu.as_ref().map_or(0, |mcu| mcu.num_active())
    }
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/api/v1/rtm/connect", get(rtm_connect).post(rtm_connect))
        .route("/api/v1/rtm/websocket/:key", get(rtm_websocket));
    if state.mcu.is_some() {
        router = router
            .route("/api/v1/mcu/websocket", get(mcu_control_websocket))
            .route("/api/v1/mcu/websocket/:transaction", get(mcu_attach_websocket));
    }
    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_connections: state.active_connections(),
    })
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    #[serde(default)]
    user: Option<String>,
}

async fn rtm_connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Result<Json<ConnectResponse>, ConnectError> {
    let requested = query.user.filter(|user| !user.is_empty());
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty());

    let (auth, user_id) = match authorization {
        Some(authorization) => {
            let auth = state.authenticator.authenticate(authorization).await?;
            let user_id = match requested {
                // Insecure mode lets the caller pick any user.
                Some(user) if state.insecure => user,
                Some(user) if user != auth.subject => {
                    return Err(ConnectError::BadRequest("user does not match credentials"));
                }
                _ => auth.subject.clone(),
            };
            (auth, user_id)
        }
        None if state.insecure => {
            let user = requested.ok_or(ConnectError::BadRequest("missing user"))?;
            (AuthToken::anonymous(user.clone()), user)
        }
        None => return Err(crate::auth::AuthError::Missing.into()),
    };
    let self_info = SelfInfo {
        id: user_id.clone(),
        name: auth.name(),
    };
    let key = state.rtm.connect(&user_id, auth)?;
    debug!(user_id = %user_id, "rtm connect");
    Ok(Json(ConnectResponse {
        ok: true,
        url: format!("/api/v1/rtm/websocket/{key}"),
        self_info,
    }))
}

async fn rtm_websocket(
    State(state): State<AppState>,
    Path(key): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ConnectError> {
    state.rtm.handle_websocket_connect(&key, ws).await
}

async fn mcu_control_websocket(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ConnectError> {
    let mcu = state.mcu.as_ref().ok_or(ConnectError::NotFound)?;
    mcu.handle_websocket(None, &headers, ws)
}

async fn mcu_attach_websocket(
    State(state): State<AppState>,
    Path(transaction): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ConnectError> {
    let mcu = state.mcu.as_ref().ok_or(ConnectError::NotFound)?;
    mcu.handle_websocket(Some(transaction), &headers, ws)
}
