use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub search: Search,
	pub balancer: Balancer,
	#[serde(default)]
	pub memory: Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub http_bind: String,
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Search {
	/// Upper bound on the number of legs in one advanced search.
	pub max_sub_requests: usize,
	pub max_nq: i64,
	/// Applies to `topk + offset`, which is what shards are asked for.
	pub max_topk: i64,
	pub max_group_size: i64,
	/// Staleness window subtracted from the begin timestamp for bounded reads.
	pub graceful_time_ms: u64,
	pub task_timeout_ms: u64,
	pub must_use_partition_key: bool,
	pub enable_materialized_view: bool,
	pub enable_multiple_vector_fields: bool,
	pub iterator_batch_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Balancer {
	/// Weight of the newest sample in the per-node cost moving average.
	pub cost_smoothing: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Memory {
	/// JSON fixture describing collections, shards and rows for the in-process cluster.
	pub fixture: Option<PathBuf>,
}

impl Default for Search {
	fn default() -> Self {
		Self {
			max_sub_requests: 1_024,
			max_nq: 16_384,
			max_topk: 16_384,
			max_group_size: 1_024,
			graceful_time_ms: 5_000,
			task_timeout_ms: 30_000,
			must_use_partition_key: false,
			enable_materialized_view: false,
			enable_multiple_vector_fields: true,
			iterator_batch_size: 1_000,
		}
	}
}

impl Default for Balancer {
	fn default() -> Self {
		Self { cost_smoothing: 0.3 }
	}
}
