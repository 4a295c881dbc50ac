//! Wire messages exchanged between the proxy and shard leaders.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use vqp_domain::{ConsistencyLevel, FieldData, FieldValue, MetricType, PrimaryKey, Timestamp};

/// Query vectors of one search leg, one entry per query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryVectors {
	Float(Vec<Vec<f32>>),
	Binary(Vec<Vec<u8>>),
	Sparse(Vec<Vec<(u32, f32)>>),
	/// Raw text, embedded by a schema function or scored by BM25 inside the shard.
	Text(Vec<String>),
}
impl QueryVectors {
	pub fn nq(&self) -> i64 {
		let len = match self {
			Self::Float(rows) => rows.len(),
			Self::Binary(rows) => rows.len(),
			Self::Sparse(rows) => rows.len(),
			Self::Text(rows) => rows.len(),
		};

		len as i64
	}

	/// Average non-zero count per query for sparse payloads.
	pub fn sparse_nnz(&self) -> Option<f64> {
		match self {
			Self::Sparse(rows) if !rows.is_empty() => {
				let total: usize = rows.iter().map(Vec::len).sum();

				Some(total as f64 / rows.len() as f64)
			},
			_ => None,
		}
	}
}
impl Default for QueryVectors {
	fn default() -> Self {
		Self::Float(Vec::new())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubSearchRequest {
	pub dsl: String,
	pub placeholder: QueryVectors,
	pub serialized_plan: Vec<u8>,
	pub nq: i64,
	pub partition_ids: Vec<i64>,
	pub topk: i64,
	pub offset: i64,
	pub metric_type: Option<MetricType>,
	pub field_id: i64,
	pub group_by_field_id: Option<i64>,
	pub group_size: i64,
	pub ignore_growing: bool,
	pub analyzer_name: Option<String>,
}

/// Fully resolved search shipped to shard leaders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalSearchRequest {
	pub msg_id: i64,
	pub source_id: i64,
	pub db_name: String,
	pub collection_id: i64,
	pub partition_ids: Vec<i64>,
	pub dsl: String,
	pub placeholder: QueryVectors,
	pub serialized_plan: Vec<u8>,
	pub output_field_ids: Vec<i64>,
	pub nq: i64,
	pub topk: i64,
	pub offset: i64,
	pub metric_type: Option<MetricType>,
	pub field_id: i64,
	pub guarantee_timestamp: Timestamp,
	/// Snapshot the shards read at; zero means "use the guarantee timestamp".
	pub mvcc_timestamp: Timestamp,
	pub timeout_timestamp: Option<Timestamp>,
	/// Rows written before this timestamp are expired.
	pub collection_ttl_timestamp: Option<Timestamp>,
	pub consistency_level: ConsistencyLevel,
	pub is_advanced: bool,
	pub sub_reqs: Vec<SubSearchRequest>,
	pub group_by_field_id: Option<i64>,
	pub group_size: i64,
	pub analyzer_name: Option<String>,
	pub ignore_growing: bool,
	pub is_iterator: bool,
}
impl InternalSearchRequest {
	/// Timestamp shards must read at.
	pub fn read_timestamp(&self) -> Timestamp {
		if self.mvcc_timestamp > 0 { self.mvcc_timestamp } else { self.guarantee_timestamp }
	}

	/// True when `ts` falls inside the collection TTL window.
	pub fn is_live(&self, ts: Timestamp) -> bool {
		self.collection_ttl_timestamp.map(|cutoff| ts >= cutoff).unwrap_or(true)
	}

	pub fn timed_out(&self, now: Timestamp) -> bool {
		self.timeout_timestamp.map(|deadline| now > deadline).unwrap_or(false)
	}
}

/// Per-target copy of a search; the resolved request itself is shared.
#[derive(Debug, Clone)]
pub struct ShardSearchRequest {
	pub req: Arc<InternalSearchRequest>,
	pub target_node_id: i64,
	pub dml_channels: Vec<String>,
	pub total_channel_num: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "code")]
pub enum ShardStatus {
	Success,
	NotShardLeader,
	Failure { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostAggregation {
	pub response_time_ms: u64,
	pub service_time_ms: u64,
	pub total_nq: i64,
	pub total_related_data_size: i64,
}

/// Hits of one search leg from one shard, query-major.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegHits {
	pub metric_type: Option<MetricType>,
	/// Number of hits per query.
	pub topks: Vec<i64>,
	pub ids: Vec<PrimaryKey>,
	/// Larger is better; distance metrics arrive negated.
	pub scores: Vec<f32>,
	#[serde(default)]
	pub group_by_values: Vec<FieldValue>,
	#[serde(default)]
	pub fields_data: Vec<FieldData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSearchResult {
	pub status: ShardStatus,
	pub source_node_id: i64,
	pub channel: String,
	pub num_queries: i64,
	pub legs: Vec<LegHits>,
	#[serde(default)]
	pub channels_mvcc: BTreeMap<String, Timestamp>,
	#[serde(default)]
	pub cost: CostAggregation,
	#[serde(default)]
	pub is_topk_reduce: bool,
	#[serde(default)]
	pub is_recall_evaluation: bool,
}
impl ShardSearchResult {
	pub fn failed(source_node_id: i64, channel: &str, status: ShardStatus) -> Self {
		Self {
			status,
			source_node_id,
			channel: channel.to_string(),
			num_queries: 0,
			legs: Vec::new(),
			channels_mvcc: BTreeMap::new(),
			cost: CostAggregation::default(),
			is_topk_reduce: false,
			is_recall_evaluation: false,
		}
	}
}

/// Point lookup by primary key, used to fetch output columns after ranking.
#[derive(Debug, Clone)]
pub struct ShardQueryRequest {
	pub db_name: String,
	pub collection_id: i64,
	pub partition_ids: Vec<i64>,
	pub ids: Arc<Vec<PrimaryKey>>,
	pub output_field_ids: Vec<i64>,
	pub guarantee_timestamp: Timestamp,
	pub mvcc_timestamp: Timestamp,
	pub collection_ttl_timestamp: Option<Timestamp>,
	pub consistency_level: ConsistencyLevel,
	pub target_node_id: i64,
	pub dml_channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardQueryResult {
	pub status: ShardStatus,
	pub source_node_id: i64,
	pub channel: String,
	pub ids: Vec<PrimaryKey>,
	pub fields_data: Vec<FieldData>,
	#[serde(default)]
	pub cost: CostAggregation,
}
