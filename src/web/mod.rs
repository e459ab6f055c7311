//! HTTP surface: the index page and the two form actions behind it.

mod render;

use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::engine::{Engine, SubscribeError};
use crate::storage::{StateStore, UnreadView};

pub use render::{escape, index_page};

#[derive(Debug, Deserialize)]
pub struct MarkReadForm {
    pub href: String,
}

#[derive(Debug, Deserialize)]
pub struct AddForm {
    pub url: String,
}

/// Build the router over a shared engine.
pub fn router<S: StateStore>(engine: Arc<Engine<S>>) -> Router {
    Router::new()
        .route("/", get(index::<S>))
        .route("/markAsRead", post(mark_as_read::<S>))
        .route("/add", post(add::<S>))
        .route("/api/unread", get(unread_json::<S>))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn index<S: StateStore>(State(engine): State<Arc<Engine<S>>>) -> Html<String> {
    Html(index_page(&engine.list_unread().await))
}

async fn unread_json<S: StateStore>(State(engine): State<Arc<Engine<S>>>) -> Json<UnreadView> {
    Json(engine.list_unread().await)
}

async fn mark_as_read<S: StateStore>(
    State(engine): State<Arc<Engine<S>>>,
    Form(form): Form<MarkReadForm>,
) -> StatusCode {
    engine.mark_read(&form.href).await;
    StatusCode::NO_CONTENT
}

async fn add<S: StateStore>(
    State(engine): State<Arc<Engine<S>>>,
    Form(form): Form<AddForm>,
) -> Result<Redirect, SubscribeError> {
    engine.add_subscription(&form.url).await?;
    Ok(Redirect::to("/"))
}

async fn health_check() -> &'static str {
    "OK"
}

impl IntoResponse for SubscribeError {
    fn into_response(self) -> Response {
        let status = match &self {
            SubscribeError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            SubscribeError::AlreadySubscribed(_) => StatusCode::CONFLICT,
            SubscribeError::Source(_) => StatusCode::BAD_GATEWAY,
        };
        tracing::warn!(error = %self, status = status.as_u16(), "Subscription rejected");
        (status, format!("Cannot add subscription: {}", self)).into_response()
    }
}
