//! Open Service Broker HTTP API
//!
//! Thin axum layer over [`InstanceLifecycleController`]. Controller calls run
//! on their own task so a dropped client connection never cancels a
//! provisioning or teardown halfway through.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::controller::InstanceLifecycleController;
use crate::error::BrokerError;
use crate::types::{BindingRequest, CreateServiceInstanceRequest};

#[derive(Clone)]
struct AppState {
    controller: Arc<InstanceLifecycleController>,
}

/// Error body returned to broker clients
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    description: String,
}

impl ApiError {
    fn internal(description: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "InternalError",
            description,
        }
    }

    /// Deletes of unknown instances/bindings answer 410 Gone
    fn gone_if_missing(self) -> Self {
        if self.status == StatusCode::NOT_FOUND {
            Self {
                status: StatusCode::GONE,
                ..self
            }
        } else {
            self
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        let status = match &err {
            BrokerError::AlreadyExists(_) => StatusCode::CONFLICT,
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::ProvisioningFailure(_) => StatusCode::BAD_GATEWAY,
            BrokerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::OperationInProgress(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            status,
            kind: err.kind(),
            description: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "error": self.kind,
                "description": self.description
            })),
        )
            .into_response()
    }
}

/// Run a controller call to completion on its own task
async fn detached<F, T>(call: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, BrokerError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!(error = %e, "Broker operation task failed");
            Err(ApiError::internal(e.to_string()))
        }
    }
}

/// Build the broker router
pub fn router(controller: Arc<InstanceLifecycleController>) -> Router {
    let state = AppState { controller };

    Router::new()
        .route("/health", get(health_check))
        .route("/debug", get(debug))
        .route("/v2/catalog", get(catalog))
        .route(
            "/v2/service_instances/:instance_id",
            put(create_instance).get(get_instance).delete(remove_instance),
        )
        .route(
            "/v2/service_instances/:instance_id/service_bindings/:binding_id",
            put(bind).delete(unbind),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lornu-broker",
        "version": env!("CARGO_PKG_VERSION"),
        "instances": state.controller.registry().len().await
    }))
}

async fn debug(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let version = state.controller.debug().await?;
    Ok(Json(serde_json::json!({ "version": version })))
}

async fn catalog(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.catalog().clone())
}

async fn create_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(req): Json<CreateServiceInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let controller = state.controller.clone();
    let response = detached(async move { controller.create(&instance_id, &req).await }).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state.controller.get(&instance_id).await?;
    Ok(Json(instance))
}

async fn remove_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let controller = state.controller.clone();
    let response = detached(async move { controller.remove(&instance_id).await })
        .await
        .map_err(ApiError::gone_if_missing)?;
    Ok(Json(response))
}

async fn bind(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Json(req): Json<BindingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let controller = state.controller.clone();
    let response =
        detached(async move { controller.bind(&instance_id, &binding_id, &req).await }).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn unbind(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let controller = state.controller.clone();
    detached(async move { controller.unbind(&instance_id, &binding_id).await })
        .await
        .map_err(ApiError::gone_if_missing)?;
    Ok(Json(serde_json::json!({})))
}
