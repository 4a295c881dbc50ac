use axum::{
	Json, Router,
	extract::State,
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
};
use serde::Serialize;
use tokio::sync::mpsc;

use vqp_search::{IterateSummary, SearchRequest, SearchResults, TaskContext};

use crate::state::AppState;

/// Pages buffered between the iterator and the response being built.
const ITERATE_BUFFER: usize = 4;

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/v1/search", post(search))
		.route("/v1/search/iterate", post(iterate))
		.with_state(state)
}

async fn health() -> StatusCode {
	StatusCode::OK
}

async fn search(
	State(state): State<AppState>,
	Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResults>, ApiError> {
	let ctx = TaskContext::new();
	// Dropping the handler, e.g. on client disconnect, cancels the search.
	let _guard = ctx.cancellation_token().clone().drop_guard();
	let response = state.service.search(payload, &ctx).await?;

	Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct IterateResponse {
	pub summary: IterateSummary,
	pub pages: Vec<SearchResults>,
}

async fn iterate(
	State(state): State<AppState>,
	Json(payload): Json<SearchRequest>,
) -> Result<Json<IterateResponse>, ApiError> {
	let ctx = TaskContext::new();
	let _guard = ctx.cancellation_token().clone().drop_guard();
	let (tx, mut rx) = mpsc::channel(ITERATE_BUFFER);
	let service = state.service.clone();
	let worker_ctx = ctx.clone();
	let worker = tokio::spawn(async move { service.iterate(payload, &worker_ctx, tx).await });
	let mut pages = Vec::new();

	while let Some(page) = rx.recv().await {
		pages.push(page);
	}

	let summary = worker.await.map_err(|err| {
		json_error(
			StatusCode::INTERNAL_SERVER_ERROR,
			"internal",
			format!("iterator worker did not finish: {err}"),
		)
	})??;

	Ok(Json(IterateResponse { summary, pages }))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error_code: String,
	message: String,
}

#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	error_code: String,
	message: String,
}
impl ApiError {
	fn new(status: StatusCode, error_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self { status, error_code: error_code.into(), message: message.into() }
	}
}

pub fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
	ApiError::new(status, code, message)
}

impl From<vqp_search::Error> for ApiError {
	fn from(err: vqp_search::Error) -> Self {
		let code = err.status();
		let status = match code {
			vqp_search::StatusCode::InputInvalid => StatusCode::BAD_REQUEST,
			vqp_search::StatusCode::NotFound => StatusCode::NOT_FOUND,
			vqp_search::StatusCode::ShardFailure => StatusCode::BAD_GATEWAY,
			vqp_search::StatusCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
			vqp_search::StatusCode::Cancelled => StatusCode::REQUEST_TIMEOUT,
			vqp_search::StatusCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
		};

		if status.is_server_error() {
			tracing::error!(error = %err, "Search request failed.");
		}

		json_error(status, code.as_str(), err.to_string())
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = ErrorBody { error_code: self.error_code, message: self.message };

		(self.status, Json(body)).into_response()
	}
}
