use serde::{Deserialize, Serialize};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Node {node_id} is not the shard leader of channel {channel}.")]
	RoutingStale { node_id: i64, channel: String },
	#[error("Shard failure on node {node_id}: {message}")]
	Shard { node_id: i64, message: String },
	#[error("RPC to node {node_id} failed: {message}")]
	Rpc { node_id: i64, message: String },
	#[error("Timed out: {message}")]
	Timeout { message: String },
	#[error("Cancelled: {message}")]
	Cancelled { message: String },
	#[error("Internal error: {message}")]
	Internal { message: String },
	#[error(transparent)]
	Json(#[from] serde_json::Error),
}
impl Error {
	pub fn invalid(message: impl Into<String>) -> Self {
		Self::InvalidRequest { message: message.into() }
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::NotFound { message: message.into() }
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::Internal { message: message.into() }
	}

	pub fn status(&self) -> StatusCode {
		match self {
			Self::InvalidRequest { .. } => StatusCode::InputInvalid,
			Self::NotFound { .. } => StatusCode::NotFound,
			Self::RoutingStale { .. } | Self::Shard { .. } | Self::Rpc { .. } =>
				StatusCode::ShardFailure,
			Self::Timeout { .. } => StatusCode::Timeout,
			Self::Cancelled { .. } => StatusCode::Cancelled,
			Self::Internal { .. } | Self::Json(_) => StatusCode::Internal,
		}
	}
}

/// Failure class reported to callers alongside the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
	InputInvalid,
	NotFound,
	ShardFailure,
	Timeout,
	Cancelled,
	Internal,
}
impl StatusCode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::InputInvalid => "input_invalid",
			Self::NotFound => "not_found",
			Self::ShardFailure => "shard_failure",
			Self::Timeout => "timeout",
			Self::Cancelled => "cancelled",
			Self::Internal => "internal",
		}
	}
}
