use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;

use crate::actions::{ActionInvocation, ActionOutcome};
use crate::error::{ErrorDetails, ErrorKind, LibError};
use crate::models::NestedNodeList;
use crate::operations::TreeOperations;
use crate::permissions::Authorizer;
use crate::store::TreeStore;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<ErrorDetails>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(kind = ?self.0.kind, code = self.0.code, error = %self.0.source, "tree api request failed");
        let body = ErrorBody {
            code: self.0.code,
            message: self.0.public,
            details: self.0.details,
        };
        (status, Json(body)).into_response()
    }
}

/// Application state behind the tree routes.
pub trait TreeApp {
    type Store: TreeStore + 'static;

    fn operations(&self) -> &TreeOperations<Self::Store>;

    /// Policy oracle for the caller of the current request.
    fn authorizer_for(&self, headers: &HeaderMap) -> Arc<dyn Authorizer>;
}

async fn load_tree_handler<S>(
    State(app): State<S>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError>
where
    S: TreeApp + Clone + Send + Sync + 'static,
{
    let authorizer = app.authorizer_for(&headers);
    let view = app.operations().load_tree(authorizer.as_ref()).await?;
    Ok(Json(view))
}

async fn update_tree_handler<S>(
    State(app): State<S>,
    headers: HeaderMap,
    Json(layout): Json<NestedNodeList>,
) -> Result<impl IntoResponse, AppError>
where
    S: TreeApp + Clone + Send + Sync + 'static,
{
    let authorizer = app.authorizer_for(&headers);
    let response = app
        .operations()
        .update_tree(authorizer.as_ref(), layout)
        .await?;
    Ok(Json(response))
}

async fn integrity_handler<S>(
    State(app): State<S>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError>
where
    S: TreeApp + Clone + Send + Sync + 'static,
{
    let authorizer = app.authorizer_for(&headers);
    let report = app
        .operations()
        .check_integrity(authorizer.as_ref())
        .await?;
    Ok(Json(report))
}

async fn mount_action_handler<S>(
    State(app): State<S>,
    headers: HeaderMap,
    Path(action): Path<String>,
    Json(invocation): Json<ActionInvocation>,
) -> Result<impl IntoResponse, AppError>
where
    S: TreeApp + Clone + Send + Sync + 'static,
{
    let authorizer = app.authorizer_for(&headers);
    let outcome = app
        .operations()
        .mount_action(authorizer.as_ref(), &action, invocation)
        .await?;
    let status = match outcome {
        ActionOutcome::Created { .. } => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

pub fn routes<S>() -> Router<S>
where
    S: TreeApp + Clone + Send + Sync + 'static,
{
    tracing::info!("Registering route /tree [GET,PUT]");
    tracing::info!("Registering route /tree/integrity [GET]");
    tracing::info!("Registering route /tree/actions/{{action}} [POST]");

    Router::new()
        .route(
            "/tree",
            get(load_tree_handler::<S>).put(update_tree_handler::<S>),
        )
        .route("/tree/integrity", get(integrity_handler::<S>))
        .route("/tree/actions/{action}", post(mount_action_handler::<S>))
}
