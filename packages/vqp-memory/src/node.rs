//! Brute-force shard node serving searches and point queries from rows held in memory.

use std::{
	collections::{HashMap, HashSet},
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Instant,
};

use dashmap::DashMap;
use parking_lot::RwLock;

use vqp_domain::{
	CollectionSchema, DataType, FieldData, FieldSchema, FieldValue, FunctionKind, MetricType,
	PrimaryKey, Timestamp,
	plan::PlanNode,
	tso,
	value::GroupKey,
};
use vqp_search::{
	BoxFuture, CostAggregation, LegHits, QueryVectors, Result, ShardClient, ShardQueryRequest,
	ShardQueryResult, ShardSearchRequest, ShardSearchResult, ShardStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
	pub pk: PrimaryKey,
	pub partition_id: i64,
	pub insert_ts: Timestamp,
	/// Growing rows are skipped by searches that ignore growing segments.
	pub growing: bool,
	pub values: HashMap<i64, FieldValue>,
}

struct ChannelData {
	schema: Arc<CollectionSchema>,
	rows: Vec<StoredRow>,
}

struct LegInput<'a> {
	plan: &'a [u8],
	placeholder: &'a QueryVectors,
	partition_ids: &'a [i64],
	ignore_growing: bool,
}

#[derive(Clone, Copy)]
enum Query<'a> {
	Float(&'a [f32]),
	Binary(&'a [u8]),
	Sparse(&'a [(u32, f32)]),
	Text(&'a str),
}

pub struct MemoryNode {
	node_id: i64,
	channels: DashMap<(i64, String), ChannelData>,
	leading: RwLock<HashSet<String>>,
	searches: AtomicUsize,
	queries: AtomicUsize,
}
impl MemoryNode {
	pub fn new(node_id: i64) -> Self {
		Self {
			node_id,
			channels: DashMap::new(),
			leading: RwLock::new(HashSet::new()),
			searches: AtomicUsize::new(0),
			queries: AtomicUsize::new(0),
		}
	}

	pub fn node_id(&self) -> i64 {
		self.node_id
	}

	/// Appends rows of one collection to a channel replica held by this node.
	pub fn load(
		&self,
		collection_id: i64,
		channel: &str,
		schema: Arc<CollectionSchema>,
		rows: Vec<StoredRow>,
	) {
		self.channels
			.entry((collection_id, channel.to_string()))
			.or_insert_with(|| ChannelData { schema, rows: Vec::new() })
			.rows
			.extend(rows);
	}

	pub fn lead(&self, channel: &str) {
		self.leading.write().insert(channel.to_string());
	}

	pub fn resign(&self, channel: &str) {
		self.leading.write().remove(channel);
	}

	pub fn is_leading(&self, channel: &str) -> bool {
		self.leading.read().contains(channel)
	}

	/// Search requests received, including ones refused for leadership.
	pub fn searches(&self) -> usize {
		self.searches.load(Ordering::SeqCst)
	}

	pub fn queries(&self) -> usize {
		self.queries.load(Ordering::SeqCst)
	}

	fn serve_search(&self, req: &ShardSearchRequest) -> ShardSearchResult {
		let started = Instant::now();

		self.searches.fetch_add(1, Ordering::SeqCst);

		let Some(channel) = req.dml_channels.first() else {
			return self.search_failure("", "search request names no channel.");
		};

		if !self.is_leading(channel) {
			return ShardSearchResult::failed(self.node_id, channel, ShardStatus::NotShardLeader);
		}

		let internal = req.req.as_ref();
		let now = tso::now();

		if internal.timed_out(now) {
			return self.search_failure(channel, "search request expired before execution.");
		}

		let read_ts = read_timestamp(internal.mvcc_timestamp, internal.guarantee_timestamp, now);
		let Some(data) = self.channels.get(&(internal.collection_id, channel.clone())) else {
			return self.search_failure(
				channel,
				&format!("collection {} is not loaded on {channel}.", internal.collection_id),
			);
		};
		let visible: Vec<&StoredRow> = data
			.rows
			.iter()
			.filter(|row| row.insert_ts <= read_ts && internal.is_live(row.insert_ts))
			.collect();
		let legs = if internal.is_advanced {
			internal
				.sub_reqs
				.iter()
				.map(|sub| {
					search_leg(&data.schema, &visible, LegInput {
						plan: &sub.serialized_plan,
						placeholder: &sub.placeholder,
						partition_ids: &sub.partition_ids,
						ignore_growing: sub.ignore_growing,
					})
				})
				.collect::<Result<Vec<_>, String>>()
		} else {
			search_leg(&data.schema, &visible, LegInput {
				plan: &internal.serialized_plan,
				placeholder: &internal.placeholder,
				partition_ids: &internal.partition_ids,
				ignore_growing: internal.ignore_growing,
			})
			.map(|leg| vec![leg])
		};
		let legs = match legs {
			Ok(legs) => legs,
			Err(reason) => return self.search_failure(channel, &reason),
		};
		let elapsed_ms = started.elapsed().as_millis() as u64;

		ShardSearchResult {
			status: ShardStatus::Success,
			source_node_id: self.node_id,
			channel: channel.clone(),
			num_queries: internal.nq,
			legs,
			channels_mvcc: [(channel.clone(), read_ts)].into_iter().collect(),
			cost: CostAggregation {
				response_time_ms: elapsed_ms,
				service_time_ms: elapsed_ms,
				total_nq: internal.nq,
				total_related_data_size: visible.len() as i64,
			},
			is_topk_reduce: false,
			is_recall_evaluation: false,
		}
	}

	fn serve_query(&self, req: &ShardQueryRequest) -> ShardQueryResult {
		let started = Instant::now();

		self.queries.fetch_add(1, Ordering::SeqCst);

		let channel = req.dml_channels.first().cloned().unwrap_or_default();
		let failed = |status| ShardQueryResult {
			status,
			source_node_id: self.node_id,
			channel: channel.clone(),
			ids: Vec::new(),
			fields_data: Vec::new(),
			cost: CostAggregation::default(),
		};

		if !self.is_leading(&channel) {
			return failed(ShardStatus::NotShardLeader);
		}

		let Some(data) = self.channels.get(&(req.collection_id, channel.clone())) else {
			return failed(ShardStatus::Failure {
				reason: format!("collection {} is not loaded on {channel}.", req.collection_id),
			});
		};
		let read_ts = read_timestamp(req.mvcc_timestamp, req.guarantee_timestamp, tso::now());
		let wanted: HashSet<&PrimaryKey> = req.ids.iter().collect();
		let rows: Vec<&StoredRow> = data
			.rows
			.iter()
			.filter(|row| wanted.contains(&row.pk))
			.filter(|row| row.insert_ts <= read_ts)
			.filter(|row| {
				req.collection_ttl_timestamp.map(|cutoff| row.insert_ts >= cutoff).unwrap_or(true)
			})
			.filter(|row| {
				req.partition_ids.is_empty() || req.partition_ids.contains(&row.partition_id)
			})
			.collect();
		let fields_data = columns(&data.schema, &req.output_field_ids, &rows);
		let elapsed_ms = started.elapsed().as_millis() as u64;

		ShardQueryResult {
			status: ShardStatus::Success,
			source_node_id: self.node_id,
			channel: channel.clone(),
			ids: rows.iter().map(|row| row.pk.clone()).collect(),
			fields_data,
			cost: CostAggregation {
				response_time_ms: elapsed_ms,
				service_time_ms: elapsed_ms,
				total_nq: 1,
				total_related_data_size: rows.len() as i64,
			},
		}
	}

	fn search_failure(&self, channel: &str, reason: &str) -> ShardSearchResult {
		tracing::warn!(node_id = self.node_id, channel, reason, "Shard search failed.");

		ShardSearchResult::failed(self.node_id, channel, ShardStatus::Failure {
			reason: reason.to_string(),
		})
	}
}

impl ShardClient for MemoryNode {
	fn search<'a>(&'a self, req: &'a ShardSearchRequest) -> BoxFuture<'a, Result<ShardSearchResult>> {
		Box::pin(async move { Ok(self.serve_search(req)) })
	}

	fn query<'a>(&'a self, req: &'a ShardQueryRequest) -> BoxFuture<'a, Result<ShardQueryResult>> {
		Box::pin(async move { Ok(self.serve_query(req)) })
	}
}

/// The node is always caught up, so an unpinned read happens at the later of the guarantee and
/// the local clock.
fn read_timestamp(mvcc_ts: Timestamp, guarantee_ts: Timestamp, now: Timestamp) -> Timestamp {
	if mvcc_ts > 0 { mvcc_ts } else { guarantee_ts.max(now) }
}

fn search_leg(
	schema: &CollectionSchema,
	rows: &[&StoredRow],
	input: LegInput<'_>,
) -> Result<LegHits, String> {
	let plan =
		PlanNode::from_bytes(input.plan).map_err(|err| format!("failed to decode plan: {err}"))?;
	let info = &plan.query_info;
	let field = schema
		.field_by_id(info.query_field_id)
		.ok_or_else(|| format!("vector field {} not found.", info.query_field_id))?;
	let metric = info.metric_type.unwrap_or_else(|| default_metric(field.data_type));
	let text_field = match input.placeholder {
		QueryVectors::Text(_) => Some(bm25_input(schema, field)?),
		_ => None,
	};
	let bound = info
		.iterator
		.as_ref()
		.and_then(|iterator| iterator.last_bound)
		.map(|bound| if metric.positively_related() { bound } else { -bound });
	let last_pk = info.iterator.as_ref().and_then(|iterator| iterator.last_pk.as_ref());
	// Ties with the bound survive only past the last returned key, matching the pk-ascending order.
	let past_bound = |score: f32, pk: &PrimaryKey| match bound {
		None => true,
		Some(bound) if score < bound => true,
		Some(bound) => score == bound && last_pk.is_some_and(|last_pk| pk > last_pk),
	};
	let candidates: Vec<&StoredRow> = rows
		.iter()
		.copied()
		.filter(|row| input.partition_ids.is_empty() || input.partition_ids.contains(&row.partition_id))
		.filter(|row| !(input.ignore_growing && row.growing))
		.filter(|row| {
			plan.expr.as_ref().map(|expr| expr.matches(&|field_id| row.values.get(&field_id))).unwrap_or(true)
		})
		.collect();
	let mut hits = LegHits { metric_type: Some(metric), ..LegHits::default() };
	let mut selected_rows = Vec::new();

	for query in 0..input.placeholder.nq() as usize {
		let query = query_at(input.placeholder, query)?;
		let mut scored = Vec::with_capacity(candidates.len());

		for row in &candidates {
			let value = match text_field {
				Some(text_field) => row.values.get(&text_field),
				None => row.values.get(&field.field_id),
			};
			let Some(value) = value else {
				continue;
			};
			let raw = raw_score(metric, query, value)?;
			let score = if metric.positively_related() { raw } else { -raw };

			if past_bound(score, &row.pk) {
				scored.push((score, *row));
			}
		}

		scored.sort_by(|lhs, rhs| rhs.0.total_cmp(&lhs.0).then_with(|| lhs.1.pk.cmp(&rhs.1.pk)));

		let picked = match info.group_by_field_id {
			Some(group_field) => pick_groups(&scored, group_field, info.topk, info.group_size),
			None => scored.into_iter().take(info.topk.max(0) as usize).collect(),
		};

		hits.topks.push(picked.len() as i64);

		for (score, row) in picked {
			hits.ids.push(row.pk.clone());
			hits.scores.push(score);

			if let Some(group_field) = info.group_by_field_id {
				hits.group_by_values.push(row.values.get(&group_field).cloned().unwrap_or(FieldValue::Null));
			}

			selected_rows.push(row);
		}
	}

	hits.fields_data = columns(schema, &plan.output_field_ids, &selected_rows);

	Ok(hits)
}

/// At most `topk` groups, each holding at most `group_size` rows, best groups first.
fn pick_groups<'a>(
	scored: &[(f32, &'a StoredRow)],
	group_field: i64,
	topk: i64,
	group_size: i64,
) -> Vec<(f32, &'a StoredRow)> {
	let mut groups: HashMap<GroupKey, i64> = HashMap::new();
	let mut picked = Vec::new();

	for (score, row) in scored {
		let Some(key) = row.values.get(&group_field).unwrap_or(&FieldValue::Null).group_key() else {
			continue;
		};
		let known = groups.len() as i64;
		let count = groups.entry(key).or_insert(0);

		if *count == 0 && known >= topk {
			continue;
		}
		if *count >= group_size {
			continue;
		}

		*count += 1;

		picked.push((*score, *row));
	}

	picked
}

fn columns(schema: &CollectionSchema, field_ids: &[i64], rows: &[&StoredRow]) -> Vec<FieldData> {
	field_ids
		.iter()
		.filter_map(|field_id| schema.field_by_id(*field_id))
		.map(|field| FieldData {
			field_id: field.field_id,
			field_name: field.name.clone(),
			data_type: field.data_type,
			is_dynamic: field.is_dynamic,
			values: rows
				.iter()
				.map(|row| row.values.get(&field.field_id).cloned().unwrap_or(FieldValue::Null))
				.collect(),
		})
		.collect()
}

fn default_metric(data_type: DataType) -> MetricType {
	match data_type {
		DataType::BinaryVector => MetricType::Hamming,
		DataType::SparseFloatVector => MetricType::Ip,
		_ => MetricType::L2,
	}
}

/// Text column a BM25 function reads for `field`.
fn bm25_input(schema: &CollectionSchema, field: &FieldSchema) -> Result<i64, String> {
	schema
		.functions
		.iter()
		.filter(|function| function.kind == FunctionKind::Bm25)
		.find(|function| function.output_field_names.contains(&field.name))
		.and_then(|function| function.input_field_names.first())
		.and_then(|name| schema.field_by_name(name))
		.map(|input| input.field_id)
		.ok_or_else(|| format!("field {} has no BM25 function for text queries.", field.name))
}

fn query_at(placeholder: &QueryVectors, idx: usize) -> Result<Query<'_>, String> {
	let query = match placeholder {
		QueryVectors::Float(rows) => rows.get(idx).map(|row| Query::Float(row)),
		QueryVectors::Binary(rows) => rows.get(idx).map(|row| Query::Binary(row)),
		QueryVectors::Sparse(rows) => rows.get(idx).map(|row| Query::Sparse(row)),
		QueryVectors::Text(rows) => rows.get(idx).map(|row| Query::Text(row)),
	};

	query.ok_or_else(|| format!("placeholder has no query {idx}."))
}

fn raw_score(metric: MetricType, query: Query<'_>, value: &FieldValue) -> Result<f32, String> {
	match (query, value) {
		(Query::Float(query), FieldValue::FloatVector(row)) => {
			if query.len() != row.len() {
				return Err(format!(
					"query dimension {} does not match stored dimension {}.",
					query.len(),
					row.len()
				));
			}

			let dot: f32 = query.iter().zip(row).map(|(lhs, rhs)| lhs * rhs).sum();

			match metric {
				MetricType::L2 => Ok(query.iter().zip(row).map(|(lhs, rhs)| (lhs - rhs).powi(2)).sum()),
				MetricType::Ip => Ok(dot),
				MetricType::Cosine => {
					let norm = norm(query) * norm(row);

					Ok(if norm == 0.0 { 0.0 } else { dot / norm })
				},
				other => Err(format!("metric {other} does not apply to float vectors.")),
			}
		},
		(Query::Binary(query), FieldValue::BinaryVector(row)) => {
			let common: u32 = query.iter().zip(row).map(|(lhs, rhs)| (lhs & rhs).count_ones()).sum();
			let either: u32 = query.iter().zip(row).map(|(lhs, rhs)| (lhs | rhs).count_ones()).sum();

			match metric {
				MetricType::Hamming => Ok((either - common) as f32),
				MetricType::Jaccard =>
					Ok(if either == 0 { 0.0 } else { 1.0 - common as f32 / either as f32 }),
				other => Err(format!("metric {other} does not apply to binary vectors.")),
			}
		},
		(Query::Sparse(query), FieldValue::SparseVector(row)) => {
			let row: HashMap<u32, f32> = row.iter().copied().collect();

			Ok(query.iter().map(|(idx, weight)| weight * row.get(idx).copied().unwrap_or(0.0)).sum())
		},
		(Query::Text(query), FieldValue::Str(text)) => {
			let terms: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();

			Ok(query
				.split_whitespace()
				.map(str::to_lowercase)
				.map(|term| terms.iter().filter(|candidate| **candidate == term).count() as f32)
				.sum())
		},
		_ => Err("query payload does not match the stored field type.".to_string()),
	}
}

fn norm(values: &[f32]) -> f32 {
	values.iter().map(|value| value * value).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
	use vqp_domain::plan::QueryInfo;
	use vqp_search::InternalSearchRequest;

	use super::*;

	fn field(field_id: i64, name: &str, data_type: DataType) -> FieldSchema {
		FieldSchema {
			field_id,
			name: name.to_string(),
			data_type,
			is_primary_key: field_id == 100,
			is_partition_key: false,
			is_dynamic: false,
			dim: None,
		}
	}

	fn schema() -> Arc<CollectionSchema> {
		Arc::new(CollectionSchema {
			name: "docs".to_string(),
			fields: vec![
				field(100, "id", DataType::Int64),
				field(101, "tag", DataType::VarChar),
				field(102, "embedding", DataType::FloatVector),
			],
			functions: Vec::new(),
			enable_dynamic_field: false,
		})
	}

	fn row(pk: i64, tag: &str, vector: [f32; 2]) -> StoredRow {
		StoredRow {
			pk: PrimaryKey::Int(pk),
			partition_id: 1,
			insert_ts: 1,
			growing: false,
			values: HashMap::from([
				(100, FieldValue::Int(pk)),
				(101, FieldValue::Str(tag.to_string())),
				(102, FieldValue::FloatVector(vector.to_vec())),
			]),
		}
	}

	fn plan(topk: i64, group_by: Option<i64>, last_bound: Option<f32>) -> Vec<u8> {
		plan_after(topk, group_by, last_bound, None)
	}

	fn plan_after(
		topk: i64,
		group_by: Option<i64>,
		last_bound: Option<f32>,
		last_pk: Option<PrimaryKey>,
	) -> Vec<u8> {
		PlanNode {
			expr: None,
			query_info: QueryInfo {
				topk,
				metric_type: Some(MetricType::L2),
				query_field_id: 102,
				search_params: "{}".to_string(),
				round_decimal: -1,
				group_by_field_id: group_by,
				group_size: 1,
				materialized_view_involved: false,
				hints: None,
				iterator: last_bound.map(|bound| vqp_domain::plan::IteratorInfo {
					token: "it".to_string(),
					batch_size: topk,
					last_bound: Some(bound),
					last_pk,
				}),
			},
			output_field_ids: vec![101],
			dynamic_fields: Vec::new(),
		}
		.to_bytes()
		.expect("Failed to encode plan.")
	}

	fn node() -> MemoryNode {
		let node = MemoryNode::new(1);

		node.load(7, "dml-0", schema(), vec![
			row(1, "a", [0.0, 0.0]),
			row(2, "a", [1.0, 0.0]),
			row(3, "b", [3.0, 0.0]),
		]);
		node.lead("dml-0");

		node
	}

	fn request(serialized_plan: Vec<u8>) -> ShardSearchRequest {
		ShardSearchRequest {
			req: Arc::new(InternalSearchRequest {
				collection_id: 7,
				nq: 1,
				placeholder: QueryVectors::Float(vec![vec![0.0, 0.0]]),
				serialized_plan,
				guarantee_timestamp: 1,
				..InternalSearchRequest::default()
			}),
			target_node_id: 1,
			dml_channels: vec!["dml-0".to_string()],
			total_channel_num: 1,
		}
	}

	#[test]
	fn distances_come_back_negated_and_best_first() {
		let result = node().serve_search(&request(plan(2, None, None)));
		let leg = &result.legs[0];

		assert_eq!(result.status, ShardStatus::Success);
		assert_eq!(leg.ids, vec![PrimaryKey::Int(1), PrimaryKey::Int(2)]);
		assert_eq!(leg.scores, vec![0.0, -1.0]);
		assert_eq!(leg.fields_data[0].values[1], FieldValue::Str("a".to_string()));
		assert_eq!(result.channels_mvcc.len(), 1);
	}

	#[test]
	fn grouping_caps_rows_per_group() {
		let result = node().serve_search(&request(plan(5, Some(101), None)));

		assert_eq!(result.legs[0].ids, vec![PrimaryKey::Int(1), PrimaryKey::Int(3)]);
		assert_eq!(result.legs[0].group_by_values.len(), 2);
	}

	#[test]
	fn iterator_bound_skips_rows_already_returned() {
		let result = node().serve_search(&request(plan(5, None, Some(1.0))));

		assert_eq!(result.legs[0].ids, vec![PrimaryKey::Int(3)]);
	}

	#[test]
	fn iterator_keeps_tied_rows_past_the_last_key() {
		let node = node();

		node.load(7, "dml-0", schema(), vec![row(4, "c", [0.0, 1.0]), row(0, "c", [0.0, -1.0])]);

		let result =
			node.serve_search(&request(plan_after(5, None, Some(1.0), Some(PrimaryKey::Int(2)))));

		assert_eq!(result.legs[0].ids, vec![PrimaryKey::Int(4), PrimaryKey::Int(3)]);
	}

	#[test]
	fn refuses_channels_it_does_not_lead() {
		let node = node();

		node.resign("dml-0");

		let result = node.serve_search(&request(plan(2, None, None)));

		assert_eq!(result.status, ShardStatus::NotShardLeader);
	}

	#[test]
	fn point_queries_return_requested_rows() {
		let result = node().serve_query(&ShardQueryRequest {
			db_name: "default".to_string(),
			collection_id: 7,
			partition_ids: Vec::new(),
			ids: Arc::new(vec![PrimaryKey::Int(3), PrimaryKey::Int(9)]),
			output_field_ids: vec![102],
			guarantee_timestamp: 1,
			mvcc_timestamp: 0,
			collection_ttl_timestamp: None,
			consistency_level: Default::default(),
			target_node_id: 1,
			dml_channels: vec!["dml-0".to_string()],
		});

		assert_eq!(result.ids, vec![PrimaryKey::Int(3)]);
		assert_eq!(result.fields_data[0].values, vec![FieldValue::FloatVector(vec![3.0, 0.0])]);
	}
}
