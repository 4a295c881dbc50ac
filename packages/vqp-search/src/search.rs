//! Search orchestration: composition, fan-out, reduction and iteration.

mod compose;
mod consistency;
mod iterator;
mod output;
mod params;
mod partition;
mod plan;
mod reduce;
mod requery;
mod rerank;
mod shard;
mod task;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use vqp_domain::{
	ConsistencyLevel, DEFAULT_DB_NAME, FieldData, FieldValue, PrimaryKey, Timestamp,
};

pub use consistency::{
	ConsistencyInput, ResolvedConsistency, can_skip_alloc_timestamp, guarantee_from_level,
	legacy_guarantee, resolve as resolve_consistency, ttl_cutoff,
};
pub use iterator::IterateSummary;
pub use output::{TranslatedOutput, translate_output_fields};
pub use params::{RankParams, SearchInfo, SearchParams, parse_rank_params, parse_search_info};
pub use partition::{hash_partition_keys, partition_keys, validate_partition_key_isolation};
pub use reduce::{LegSpec, Reduced, ShardBookkeeping, aggregate_bookkeeping, last_bound, reduce_leg};
pub use rerank::{FunctionScore, FusionSource, Reranker};
pub use task::SearchTask;

use crate::{Result, SearchService, TaskContext};

fn default_true() -> bool {
	true
}

fn default_db_name() -> String {
	DEFAULT_DB_NAME.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
	#[serde(default = "default_db_name")]
	pub db_name: String,
	pub collection_name: String,
	#[serde(default)]
	pub partition_names: Vec<String>,
	/// Boolean filter expression; empty means no filter.
	#[serde(default)]
	pub dsl: String,
	#[serde(default)]
	pub template_values: BTreeMap<String, FieldValue>,
	#[serde(default)]
	pub placeholder: crate::QueryVectors,
	#[serde(default)]
	pub search_params: SearchParams,
	/// Legs of an advanced (hybrid) search; empty for a single-vector search.
	#[serde(default)]
	pub sub_reqs: Vec<SubSearch>,
	#[serde(default)]
	pub output_fields: Vec<String>,
	#[serde(default)]
	pub guarantee_timestamp: Timestamp,
	#[serde(default)]
	pub consistency_level: ConsistencyLevel,
	/// When set the collection's configured consistency level applies.
	#[serde(default = "default_true")]
	pub use_default_consistency: bool,
	#[serde(default)]
	pub function_score: Option<FunctionScoreSpec>,
}
impl Default for SearchRequest {
	fn default() -> Self {
		Self {
			db_name: default_db_name(),
			collection_name: String::new(),
			partition_names: Vec::new(),
			dsl: String::new(),
			template_values: BTreeMap::new(),
			placeholder: Default::default(),
			search_params: SearchParams::new(),
			sub_reqs: Vec::new(),
			output_fields: Vec::new(),
			guarantee_timestamp: 0,
			consistency_level: ConsistencyLevel::default(),
			use_default_consistency: true,
			function_score: None,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubSearch {
	#[serde(default)]
	pub dsl: String,
	#[serde(default)]
	pub template_values: BTreeMap<String, FieldValue>,
	pub placeholder: crate::QueryVectors,
	#[serde(default)]
	pub search_params: SearchParams,
}

/// Client-supplied rerank function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionScoreSpec {
	pub functions: Vec<RerankFunctionSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankFunctionSpec {
	pub name: String,
	#[serde(default)]
	pub input_field_names: Vec<String>,
	#[serde(default)]
	pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorResults {
	pub token: String,
	pub last_bound: f32,
	/// Primary key of the row that set `last_bound`; breaks ties on the next page.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_pk: Option<PrimaryKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
	pub collection_name: String,
	pub primary_field_name: String,
	pub num_queries: i64,
	pub top_k: i64,
	/// Rows returned per query; `ids` and `scores` are query-major.
	pub topks: Vec<i64>,
	pub ids: Vec<PrimaryKey>,
	pub scores: Vec<f32>,
	pub fields_data: Vec<FieldData>,
	pub output_fields: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub group_by_field_value: Option<FieldData>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub iterator: Option<IteratorResults>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_ts: Option<Timestamp>,
	pub result_size_insufficient: bool,
	pub is_topk_reduce: bool,
	pub is_recall_evaluation: bool,
}

impl SearchService {
	/// Runs one search through the task lifecycle.
	pub async fn search(&self, req: SearchRequest, ctx: &TaskContext) -> Result<SearchResults> {
		let ctx = match ctx.deadline() {
			Some(_) => ctx.child(),
			None => ctx.child().with_deadline(
				tokio::time::Instant::now()
					+ std::time::Duration::from_millis(self.cfg.task_timeout_ms),
			),
		};
		let mut task = SearchTask::new(req, ctx, self.cfg.clone(), self.collaborators.clone())
			.with_source_id(self.node_id);

		crate::task::run(&mut task, self.collaborators.tso.as_ref(), &self.ids).await?;

		task.into_results()
	}
}
