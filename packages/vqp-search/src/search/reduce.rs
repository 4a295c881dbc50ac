//! Merging partial shard results into the user-facing ranking.

use std::{
	cmp::Ordering,
	collections::{BTreeMap, HashMap, HashSet},
	ops::Range,
};

use vqp_domain::{
	FieldData, FieldValue, MetricType, PrimaryKey, Timestamp, value::GroupKey,
};

use crate::{
	Error, Result,
	request::{LegHits, ShardSearchResult},
	search::{
		params::RankParams,
		rerank::{FunctionScore, InputValues},
	},
};

pub fn cmp_f32_desc(a: f32, b: f32) -> Ordering {
	match (a.is_nan(), b.is_nan()) {
		(true, true) => Ordering::Equal,
		(true, false) => Ordering::Greater,
		(false, true) => Ordering::Less,
		(false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
	}
}

/// Query-major ranking for one leg, or for the fused answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reduced {
	pub metric_type: Option<MetricType>,
	pub topks: Vec<i64>,
	pub ids: Vec<PrimaryKey>,
	pub scores: Vec<f32>,
	/// Row-aligned group values; empty unless grouping.
	pub group_by_values: Vec<FieldValue>,
	/// Row-aligned columns.
	pub fields_data: Vec<FieldData>,
}
impl Reduced {
	pub fn nq(&self) -> usize {
		self.topks.len()
	}

	pub fn query_rows(&self, query: usize) -> Range<usize> {
		let start: i64 = self.topks[..query].iter().sum();
		let len = self.topks[query];

		start as usize..(start + len) as usize
	}
}

/// Window and grouping applied when reducing one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegSpec {
	pub nq: i64,
	pub offset: i64,
	pub limit: i64,
	pub group_by_field_id: Option<i64>,
	pub group_size: i64,
}

/// Cross-shard flags and watermarks gathered before reduction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardBookkeeping {
	pub is_topk_reduce: bool,
	pub is_recall_evaluation: bool,
	pub related_data_size: i64,
	pub channels_mvcc: BTreeMap<String, Timestamp>,
}

pub fn aggregate_bookkeeping(results: &[ShardSearchResult]) -> ShardBookkeeping {
	let mut out = ShardBookkeeping::default();

	for result in results {
		out.is_topk_reduce |= result.is_topk_reduce;
		out.is_recall_evaluation |= result.is_recall_evaluation;
		out.related_data_size += result.cost.total_related_data_size;

		for (channel, ts) in &result.channels_mvcc {
			let entry = out.channels_mvcc.entry(channel.clone()).or_insert(*ts);

			*entry = (*entry).max(*ts);
		}
	}

	out
}

struct Candidate<'a> {
	pk: &'a PrimaryKey,
	score: f32,
	source: usize,
	row: usize,
	group: Option<GroupKey>,
}

/// Orders candidates by score, primary key, then origin; drops repeated keys; applies the
/// window. Returns indices into `candidates` in output order.
fn select(
	candidates: &mut [Candidate<'_>],
	offset: i64,
	limit: i64,
	group_size: Option<i64>,
) -> Result<Vec<usize>> {
	candidates.sort_by(|lhs, rhs| {
		cmp_f32_desc(lhs.score, rhs.score)
			.then_with(|| lhs.pk.cmp(rhs.pk))
			.then_with(|| lhs.source.cmp(&rhs.source))
			.then_with(|| lhs.row.cmp(&rhs.row))
	});

	let mut seen = HashSet::new();
	let unique = candidates.iter().enumerate().filter(|(_, candidate)| seen.insert(candidate.pk));
	let offset = offset.max(0) as usize;
	let limit = limit.max(0) as usize;
	let Some(group_size) = group_size else {
		return Ok(unique.skip(offset).take(limit).map(|(idx, _)| idx).collect());
	};
	let group_size = group_size.max(1) as usize;
	let mut slots: HashMap<GroupKey, usize> = HashMap::new();
	let mut groups: Vec<Vec<usize>> = Vec::new();

	for (idx, candidate) in unique {
		let key = candidate
			.group
			.clone()
			.ok_or_else(|| Error::internal("grouped result row has no group value."))?;

		match slots.get(&key) {
			Some(slot) => {
				let group = &mut groups[*slot];

				if group.len() < group_size {
					group.push(idx);
				}
			},
			None if groups.len() < offset + limit => {
				slots.insert(key, groups.len());
				groups.push(vec![idx]);
			},
			None => {},
		}
	}

	Ok(groups.into_iter().skip(offset).flatten().collect())
}

fn query_starts(hits: &LegHits, nq: usize, node_id: i64) -> Result<Vec<usize>> {
	if hits.topks.len() != nq {
		return Err(Error::internal(format!(
			"node {node_id} returned {} query results, expected {nq}.",
			hits.topks.len()
		)));
	}

	let mut starts = Vec::with_capacity(nq);
	let mut total = 0_usize;

	for topk in &hits.topks {
		starts.push(total);
		total += usize::try_from(*topk)
			.map_err(|_| Error::internal(format!("node {node_id} returned a negative topk.")))?;
	}

	if hits.ids.len() != total || hits.scores.len() != total {
		return Err(Error::internal(format!(
			"node {node_id} returned {} ids and {} scores for {total} hits.",
			hits.ids.len(),
			hits.scores.len()
		)));
	}

	Ok(starts)
}

/// Merges leg `leg` of every partial result into at most `limit` rows (or groups) per query.
pub fn reduce_leg(results: &[ShardSearchResult], leg: usize, spec: &LegSpec) -> Result<Reduced> {
	let nq = usize::try_from(spec.nq).map_err(|_| Error::internal("negative nq."))?;
	let mut sources = Vec::with_capacity(results.len());

	for result in results {
		let hits = result.legs.get(leg).ok_or_else(|| {
			Error::internal(format!(
				"node {} returned {} legs, expected at least {}.",
				result.source_node_id,
				result.legs.len(),
				leg + 1
			))
		})?;
		let starts = query_starts(hits, nq, result.source_node_id)?;

		if spec.group_by_field_id.is_some() && hits.group_by_values.len() != hits.ids.len() {
			return Err(Error::internal(format!(
				"node {} returned grouped hits without group values.",
				result.source_node_id
			)));
		}

		sources.push((hits, starts));
	}

	let mut out = Reduced {
		metric_type: sources.iter().find_map(|(hits, _)| hits.metric_type),
		..Reduced::default()
	};
	let mut columns: Vec<FieldData> = Vec::new();

	for (hits, _) in &sources {
		for column in &hits.fields_data {
			if !columns.iter().any(|known| known.field_id == column.field_id) {
				columns.push(column.empty_like());
			}
		}
	}

	for query in 0..nq {
		let mut candidates = Vec::new();

		for (source, (hits, starts)) in sources.iter().enumerate() {
			let start = starts[query];
			let len = hits.topks[query] as usize;

			for row in start..start + len {
				candidates.push(Candidate {
					pk: &hits.ids[row],
					score: hits.scores[row],
					source,
					row,
					group: hits.group_by_values.get(row).and_then(FieldValue::group_key),
				});
			}
		}

		let group_size = spec.group_by_field_id.map(|_| spec.group_size);
		let selected = select(&mut candidates, spec.offset, spec.limit, group_size)?;

		for idx in &selected {
			let candidate = &candidates[*idx];
			let (hits, _) = &sources[candidate.source];

			out.ids.push(candidate.pk.clone());
			out.scores.push(candidate.score);

			if spec.group_by_field_id.is_some() {
				out.group_by_values.push(hits.group_by_values[candidate.row].clone());
			}

			for column in &mut columns {
				let value = hits
					.fields_data
					.iter()
					.find(|source| source.field_id == column.field_id)
					.and_then(|source| source.values.get(candidate.row))
					.cloned()
					.unwrap_or(FieldValue::Null);

				column.values.push(value);
			}
		}

		out.topks.push(selected.len() as i64);
	}

	out.fields_data = columns;

	Ok(out)
}

/// Applies the fusion function across legs, then the final window and grouping.
pub fn fuse_legs(
	legs: &[Reduced],
	function: &FunctionScore,
	inputs: &InputValues,
	rank: &RankParams,
) -> Result<Reduced> {
	let fused = function.fuse(legs, inputs)?;
	let mut groups: HashMap<&PrimaryKey, &FieldValue> = HashMap::new();

	if rank.group_by_field_id.is_some() {
		for leg in legs {
			for (pk, value) in leg.ids.iter().zip(&leg.group_by_values) {
				groups.entry(pk).or_insert(value);
			}
		}
	}

	let mut out = Reduced::default();

	for query in fused {
		let mut candidates: Vec<_> = query
			.iter()
			.enumerate()
			.map(|(row, (pk, score))| Candidate {
				pk,
				score: *score,
				source: 0,
				row,
				group: groups.get(pk).and_then(|value| value.group_key()),
			})
			.collect();
		let group_size = rank.group_by_field_id.map(|_| rank.group_size);
		let selected = select(&mut candidates, rank.offset, rank.limit, group_size)?;

		for idx in &selected {
			let candidate = &candidates[*idx];

			out.ids.push(candidate.pk.clone());
			out.scores.push(candidate.score);

			if rank.group_by_field_id.is_some() {
				let value = groups.get(candidate.pk).map(|value| (*value).clone());

				out.group_by_values.push(value.unwrap_or(FieldValue::Null));
			}
		}

		out.topks.push(selected.len() as i64);
	}

	Ok(out)
}

/// Converts larger-is-better scores back to the metric's orientation and rounds them.
pub fn finalize_scores(scores: &mut [f32], flip_distance: bool, round_decimal: i64) {
	let scale = (round_decimal >= 0).then(|| 10_f32.powi(round_decimal as i32));

	for score in scores {
		if flip_distance {
			*score = -*score;
		}
		if let Some(scale) = scale {
			*score = (*score * scale).round() / scale;
		}
	}
}

pub fn result_size_insufficient(topks: &[i64], limit: i64) -> bool {
	topks.iter().any(|topk| *topk < limit)
}

/// Score bound for the next iterator page, in user-facing orientation.
pub fn last_bound(
	scores: &[f32],
	nq: i64,
	incoming: Option<f32>,
	metric_type: Option<MetricType>,
) -> f32 {
	if nq == 1
		&& let Some(last) = scores.last()
	{
		return *last;
	}
	if let Some(incoming) = incoming {
		return incoming;
	}

	match metric_type {
		Some(metric) if !metric.positively_related() => -f32::MAX,
		_ => f32::MAX,
	}
}

/// Primary key paired with [`last_bound`]: the last returned row, else the incoming key.
pub fn last_pk(ids: &[PrimaryKey], nq: i64, incoming: Option<&PrimaryKey>) -> Option<PrimaryKey> {
	if nq == 1
		&& let Some(last) = ids.last()
	{
		return Some(last.clone());
	}

	incoming.cloned()
}

/// Session timestamp for the first iterator page.
pub fn session_ts(channels_mvcc: &BTreeMap<String, Timestamp>, begin_ts: Timestamp) -> Timestamp {
	channels_mvcc.values().copied().max().unwrap_or(begin_ts)
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;
	use crate::request::{CostAggregation, ShardStatus};

	fn shard(channel: &str, topks: &[i64], hits: &[(i64, f32)]) -> ShardSearchResult {
		ShardSearchResult {
			status: ShardStatus::Success,
			source_node_id: 1,
			channel: channel.to_string(),
			num_queries: topks.len() as i64,
			legs: vec![LegHits {
				metric_type: Some(MetricType::L2),
				topks: topks.to_vec(),
				ids: hits.iter().map(|(id, _)| PrimaryKey::Int(*id)).collect(),
				scores: hits.iter().map(|(_, score)| *score).collect(),
				group_by_values: hits.iter().map(|(id, _)| FieldValue::Int(id % 2)).collect(),
				fields_data: Vec::new(),
			}],
			channels_mvcc: BTreeMap::from([(channel.to_string(), 10)]),
			cost: CostAggregation { total_related_data_size: 3, ..CostAggregation::default() },
			is_topk_reduce: false,
			is_recall_evaluation: false,
		}
	}

	fn spec(limit: i64, offset: i64) -> LegSpec {
		LegSpec { nq: 1, offset, limit, group_by_field_id: None, group_size: 1 }
	}

	#[test]
	fn merges_by_score_and_skips_offset() {
		let results = [
			shard("a", &[3], &[(1, -0.1), (3, -0.3), (5, -0.5)]),
			shard("b", &[3], &[(2, -0.2), (4, -0.4), (6, -0.6)]),
		];
		let reduced = reduce_leg(&results, 0, &spec(3, 1)).expect("reduce failed");

		assert_eq!(reduced.ids, [2, 3, 4].map(PrimaryKey::Int).to_vec());
		assert_eq!(reduced.topks, vec![3]);
	}

	#[test]
	fn ties_break_by_primary_key_and_duplicates_collapse() {
		let results =
			[shard("a", &[2], &[(9, -0.5), (4, -0.7)]), shard("b", &[2], &[(4, -0.7), (3, -0.5)])];
		let reduced = reduce_leg(&results, 0, &spec(10, 0)).expect("reduce failed");

		assert_eq!(reduced.ids, [3, 9, 4].map(PrimaryKey::Int).to_vec());
	}

	#[test]
	fn grouping_caps_rows_per_group() {
		let results = [shard(
			"a",
			&[5],
			&[(2, -0.1), (4, -0.2), (6, -0.3), (1, -0.4), (3, -0.5)],
		)];
		let spec =
			LegSpec { nq: 1, offset: 0, limit: 2, group_by_field_id: Some(7), group_size: 2 };
		let reduced = reduce_leg(&results, 0, &spec).expect("reduce failed");

		assert_eq!(reduced.ids, [2, 4, 1, 3].map(PrimaryKey::Int).to_vec());
		assert_eq!(reduced.group_by_values.len(), 4);
	}

	#[test]
	fn mismatched_shard_payload_is_internal() {
		let mut broken = shard("a", &[2], &[(1, -0.1)]);

		broken.legs[0].topks = vec![2];

		let err = reduce_leg(&[broken], 0, &spec(5, 0)).expect_err("Expected payload error.");

		assert!(matches!(err, Error::Internal { .. }));
	}

	#[test]
	fn bookkeeping_keeps_maximum_watermarks() {
		let mut first = shard("a", &[0], &[]);
		let mut second = shard("b", &[0], &[]);

		first.channels_mvcc.insert("a".to_string(), 40);
		second.channels_mvcc.insert("a".to_string(), 25);
		second.is_topk_reduce = true;

		let bookkeeping = aggregate_bookkeeping(&[first, second]);

		assert_eq!(bookkeeping.channels_mvcc["a"], 40);
		assert_eq!(bookkeeping.channels_mvcc["b"], 10);
		assert!(bookkeeping.is_topk_reduce);
		assert_eq!(bookkeeping.related_data_size, 6);
		assert_eq!(session_ts(&bookkeeping.channels_mvcc, 5), 40);
		assert_eq!(session_ts(&BTreeMap::new(), 5), 5);
	}

	#[test]
	fn last_bound_defaults_follow_metric_orientation() {
		assert_eq!(last_bound(&[], 1, None, Some(MetricType::Ip)), f32::MAX);
		assert_eq!(last_bound(&[], 1, None, Some(MetricType::L2)), -f32::MAX);
		assert_eq!(last_bound(&[], 1, Some(0.3), Some(MetricType::Ip)), 0.3);
		assert_eq!(last_bound(&[0.9, 0.4], 1, Some(0.3), Some(MetricType::Ip)), 0.4);
		assert_eq!(last_bound(&[0.9, 0.4], 2, None, Some(MetricType::Ip)), f32::MAX);
	}

	#[test]
	fn last_pk_tracks_the_row_that_set_the_bound() {
		let ids = [PrimaryKey::Int(4), PrimaryKey::Int(9)];
		let incoming = PrimaryKey::Int(2);

		assert_eq!(last_pk(&ids, 1, Some(&incoming)), Some(PrimaryKey::Int(9)));
		assert_eq!(last_pk(&[], 1, Some(&incoming)), Some(PrimaryKey::Int(2)));
		assert_eq!(last_pk(&ids, 2, None), None);
	}

	#[test]
	fn finalize_flips_distances_and_rounds() {
		let mut scores = [-1.23456, -0.5];

		finalize_scores(&mut scores, true, 2);

		assert_eq!(scores, [1.23, 0.5]);
	}

	fn partials() -> impl Strategy<Value = Vec<ShardSearchResult>> {
		prop::collection::vec(prop::collection::vec((0_i64..40, -10.0_f32..10.0), 0..12), 1..4)
			.prop_map(|shards| {
				shards
					.into_iter()
					.enumerate()
					.map(|(idx, hits)| shard(&format!("dml_{idx}"), &[hits.len() as i64], &hits))
					.collect()
			})
	}

	proptest! {
		#[test]
		fn reduction_respects_row_bound(
			results in partials(),
			limit in 1_i64..20,
			offset in 0_i64..5,
		) {
			let reduced = reduce_leg(&results, 0, &spec(limit, offset)).expect("reduce failed");

			prop_assert!(reduced.topks.iter().all(|topk| *topk <= limit));
			prop_assert_eq!(reduced.ids.len() as i64, reduced.topks.iter().sum::<i64>());

			let unique: HashSet<_> = reduced.ids.iter().collect();

			prop_assert_eq!(unique.len(), reduced.ids.len());
		}

		#[test]
		fn reduction_is_idempotent(results in partials(), limit in 1_i64..20) {
			let first = reduce_leg(&results, 0, &spec(limit, 0)).expect("reduce failed");
			let second = reduce_leg(&results, 0, &spec(limit, 0)).expect("reduce failed");
			let mut reversed = results.clone();

			reversed.reverse();

			let third = reduce_leg(&reversed, 0, &spec(limit, 0)).expect("reduce failed");

			prop_assert_eq!(&first, &second);
			prop_assert_eq!(&first.ids, &third.ids);
			prop_assert_eq!(&first.scores, &third.scores);
		}
	}
}
