//! Search and rank parameter parsing.

use std::collections::BTreeMap;

use vqp_domain::{
	CollectionSchema, MetricType, PrimaryKey,
	plan::{IteratorInfo, QueryInfo},
};

use crate::{Error, Result};

pub type SearchParams = BTreeMap<String, String>;

pub const ANNS_FIELD_KEY: &str = "anns_field";
pub const TOPK_KEY: &str = "topk";
pub const LIMIT_KEY: &str = "limit";
pub const OFFSET_KEY: &str = "offset";
pub const METRIC_TYPE_KEY: &str = "metric_type";
pub const PARAMS_KEY: &str = "params";
pub const ROUND_DECIMAL_KEY: &str = "round_decimal";
pub const GROUP_BY_FIELD_KEY: &str = "group_by_field";
pub const GROUP_SIZE_KEY: &str = "group_size";
pub const IGNORE_GROWING_KEY: &str = "ignore_growing";
pub const ANALYZER_NAME_KEY: &str = "analyzer_name";
pub const ITERATOR_KEY: &str = "iterator";
pub const ITER_V2_KEY: &str = "search_iter_v2";
pub const ITER_BATCH_SIZE_KEY: &str = "search_iter_batch_size";
pub const ITER_ID_KEY: &str = "search_iter_id";
pub const ITER_LAST_BOUND_KEY: &str = "search_iter_last_bound";
/// JSON-encoded primary key of the last row of the previous page.
pub const ITER_LAST_PK_KEY: &str = "search_iter_last_pk";
pub const COLLECTION_ID_KEY: &str = "collection_id";
pub const RANK_STRATEGY_KEY: &str = "strategy";

const MAX_ROUND_DECIMAL: i64 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchInfo {
	pub query_info: QueryInfo,
	pub offset: i64,
	pub is_iterator: bool,
	/// Collection the caller believes it addresses, when stated.
	pub collection_id: Option<i64>,
}

/// Final-result parameters of an advanced search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankParams {
	pub limit: i64,
	pub offset: i64,
	pub round_decimal: i64,
	pub group_by_field_id: Option<i64>,
	pub group_size: i64,
}

pub fn get<'a>(params: &'a SearchParams, key: &str) -> Option<&'a str> {
	params.get(key).map(|value| value.trim()).filter(|value| !value.is_empty())
}

pub fn parse_bool(params: &SearchParams, key: &str) -> Result<bool> {
	match get(params, key) {
		None => Ok(false),
		Some(raw) => raw
			.to_ascii_lowercase()
			.parse::<bool>()
			.map_err(|_| Error::invalid(format!("{key} must be true or false, got {raw}."))),
	}
}

fn parse_i64(params: &SearchParams, key: &str) -> Result<Option<i64>> {
	get(params, key)
		.map(|raw| {
			raw.parse::<i64>()
				.map_err(|_| Error::invalid(format!("{key} must be an integer, got {raw}.")))
		})
		.transpose()
}

fn parse_limit(params: &SearchParams) -> Result<i64> {
	match parse_i64(params, TOPK_KEY)? {
		Some(topk) => Ok(topk),
		None => parse_i64(params, LIMIT_KEY)?
			.ok_or_else(|| Error::invalid(format!("{TOPK_KEY} or {LIMIT_KEY} not found in search_params."))),
	}
}

fn check_window(limit: i64, offset: i64, cfg: &vqp_config::Search) -> Result<()> {
	if limit <= 0 || limit > cfg.max_topk {
		return Err(Error::invalid(format!(
			"topk should be in range [1, {}], but got {limit}.",
			cfg.max_topk
		)));
	}
	if offset < 0 || offset > cfg.max_topk {
		return Err(Error::invalid(format!(
			"offset should be in range [0, {}], but got {offset}.",
			cfg.max_topk
		)));
	}
	if limit + offset > cfg.max_topk {
		return Err(Error::invalid(format!(
			"topk + offset should be in range [1, {}], but got {}.",
			cfg.max_topk,
			limit + offset
		)));
	}

	Ok(())
}

fn parse_round_decimal(params: &SearchParams) -> Result<i64> {
	let round_decimal = parse_i64(params, ROUND_DECIMAL_KEY)?.unwrap_or(-1);

	if !(-1..=MAX_ROUND_DECIMAL).contains(&round_decimal) {
		return Err(Error::invalid(format!(
			"round_decimal should be in range [-1, {MAX_ROUND_DECIMAL}], but got {round_decimal}."
		)));
	}

	Ok(round_decimal)
}

fn parse_group_by(
	params: &SearchParams,
	schema: &CollectionSchema,
	cfg: &vqp_config::Search,
) -> Result<(Option<i64>, i64)> {
	let Some(name) = get(params, GROUP_BY_FIELD_KEY) else {
		return Ok((None, 1));
	};
	let field = schema
		.field_by_name(name)
		.ok_or_else(|| Error::invalid(format!("group_by_field {name} not found in schema.")))?;

	if !field.data_type.supports_group_by() {
		return Err(Error::invalid(format!(
			"group_by_field {name} has type {:?}, which does not support grouping.",
			field.data_type
		)));
	}

	let group_size = parse_i64(params, GROUP_SIZE_KEY)?.unwrap_or(1);

	if group_size <= 0 || group_size > cfg.max_group_size {
		return Err(Error::invalid(format!(
			"group_size should be in range [1, {}], but got {group_size}.",
			cfg.max_group_size
		)));
	}

	Ok((Some(field.field_id), group_size))
}

/// Parses one leg's parameters. In an advanced search `rank` supplies grouping, and the leg's
/// own window needs no offset.
pub fn parse_search_info(
	params: &SearchParams,
	schema: &CollectionSchema,
	rank: Option<&RankParams>,
	cfg: &vqp_config::Search,
) -> Result<SearchInfo> {
	let is_iterator = parse_bool(params, ITERATOR_KEY)?;
	let iter_v2 = parse_bool(params, ITER_V2_KEY)?;

	if iter_v2 && !is_iterator {
		return Err(Error::invalid(format!("both {ITER_V2_KEY} and {ITERATOR_KEY} must be set.")));
	}

	let mut iterator = None;
	let (limit, offset) = if iter_v2 {
		let batch_size = parse_i64(params, ITER_BATCH_SIZE_KEY)?.ok_or_else(|| {
			Error::invalid(format!("{ITER_BATCH_SIZE_KEY} is required for search iteration."))
		})?;
		let last_bound = get(params, ITER_LAST_BOUND_KEY)
			.map(|raw| {
				raw.parse::<f32>().map_err(|_| {
					Error::invalid(format!("{ITER_LAST_BOUND_KEY} must be a number, got {raw}."))
				})
			})
			.transpose()?;
		let last_pk = get(params, ITER_LAST_PK_KEY)
			.map(|raw| {
				serde_json::from_str::<PrimaryKey>(raw).map_err(|_| {
					Error::invalid(format!("{ITER_LAST_PK_KEY} must be a JSON primary key, got {raw}."))
				})
			})
			.transpose()?;
		let token = get(params, ITER_ID_KEY)
			.map(str::to_string)
			.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

		iterator = Some(IteratorInfo { token, batch_size, last_bound, last_pk });

		(batch_size, 0)
	} else {
		(parse_limit(params)?, parse_i64(params, OFFSET_KEY)?.unwrap_or(0))
	};

	check_window(limit, offset, cfg)?;

	let metric_type = get(params, METRIC_TYPE_KEY)
		.map(|raw| raw.parse::<MetricType>().map_err(Error::invalid))
		.transpose()?;
	let search_params = get(params, PARAMS_KEY).unwrap_or("{}").to_string();
	let parsed: serde_json::Value = serde_json::from_str(&search_params)
		.map_err(|err| Error::invalid(format!("{PARAMS_KEY} is not valid JSON: {err}.")))?;

	if !parsed.is_object() {
		return Err(Error::invalid(format!("{PARAMS_KEY} must be a JSON object.")));
	}

	let round_decimal = parse_round_decimal(params)?;
	let (group_by_field_id, group_size) = match rank {
		Some(rank) => (rank.group_by_field_id, rank.group_size),
		None => parse_group_by(params, schema, cfg)?,
	};

	if group_by_field_id.is_some() && is_iterator {
		return Err(Error::invalid("search iteration does not support grouping."));
	}

	let collection_id = parse_i64(params, COLLECTION_ID_KEY)?;

	Ok(SearchInfo {
		query_info: QueryInfo {
			topk: limit + offset,
			metric_type,
			query_field_id: 0,
			search_params,
			round_decimal,
			group_by_field_id,
			group_size,
			materialized_view_involved: false,
			hints: None,
			iterator,
		},
		offset,
		is_iterator,
		collection_id,
	})
}

pub fn parse_rank_params(
	params: &SearchParams,
	schema: &CollectionSchema,
	cfg: &vqp_config::Search,
) -> Result<RankParams> {
	let limit = parse_limit(params)?;
	let offset = parse_i64(params, OFFSET_KEY)?.unwrap_or(0);

	check_window(limit, offset, cfg)?;

	let round_decimal = parse_round_decimal(params)?;
	let (group_by_field_id, group_size) = parse_group_by(params, schema, cfg)?;

	Ok(RankParams { limit, offset, round_decimal, group_by_field_id, group_size })
}

#[cfg(test)]
mod tests {
	use vqp_domain::{DataType, FieldSchema};

	use super::*;

	fn schema() -> CollectionSchema {
		let field = |field_id, name: &str, data_type| FieldSchema {
			field_id,
			name: name.to_string(),
			data_type,
			is_primary_key: field_id == 100,
			is_partition_key: false,
			is_dynamic: false,
			dim: None,
		};

		CollectionSchema {
			name: "docs".to_string(),
			fields: vec![
				field(100, "id", DataType::Int64),
				field(101, "tag", DataType::VarChar),
				field(102, "embedding", DataType::FloatVector),
			],
			functions: Vec::new(),
			enable_dynamic_field: false,
		}
	}

	fn params(pairs: &[(&str, &str)]) -> SearchParams {
		pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
	}

	#[test]
	fn shards_receive_limit_plus_offset() {
		let info = parse_search_info(
			&params(&[("topk", "10"), ("offset", "5"), ("metric_type", "l2")]),
			&schema(),
			None,
			&vqp_config::Search::default(),
		)
		.expect("parse failed");

		assert_eq!(info.query_info.topk, 15);
		assert_eq!(info.offset, 5);
		assert_eq!(info.query_info.metric_type, Some(MetricType::L2));
		assert_eq!(info.query_info.round_decimal, -1);
	}

	#[test]
	fn window_above_max_topk_is_rejected() {
		let cfg = vqp_config::Search::default();
		let limit = cfg.max_topk.to_string();
		let err = parse_search_info(
			&params(&[("limit", &limit), ("offset", "1")]),
			&schema(),
			None,
			&cfg,
		)
		.expect_err("Expected window error.");

		assert!(err.to_string().contains("topk + offset"), "Unexpected error: {err}");
	}

	#[test]
	fn grouping_resolves_field_and_rejects_iteration() {
		let info = parse_search_info(
			&params(&[("limit", "3"), ("group_by_field", "tag"), ("group_size", "2")]),
			&schema(),
			None,
			&vqp_config::Search::default(),
		)
		.expect("parse failed");

		assert_eq!(info.query_info.group_by_field_id, Some(101));
		assert_eq!(info.query_info.group_size, 2);

		let err = parse_search_info(
			&params(&[("limit", "3"), ("group_by_field", "tag"), ("iterator", "true")]),
			&schema(),
			None,
			&vqp_config::Search::default(),
		)
		.expect_err("Expected grouping rejection.");

		assert!(matches!(err, Error::InvalidRequest { .. }));
	}

	#[test]
	fn iterator_v2_uses_batch_size_and_keeps_token() {
		let info = parse_search_info(
			&params(&[
				("iterator", "true"),
				("search_iter_v2", "true"),
				("search_iter_batch_size", "4"),
				("search_iter_id", "tok"),
				("search_iter_last_bound", "0.5"),
				("search_iter_last_pk", "\"doc-7\""),
			]),
			&schema(),
			None,
			&vqp_config::Search::default(),
		)
		.expect("parse failed");
		let iterator = info.query_info.iterator.expect("iterator info missing");

		assert_eq!(info.query_info.topk, 4);
		assert_eq!(iterator.token, "tok");
		assert_eq!(iterator.last_bound, Some(0.5));
		assert_eq!(iterator.last_pk, Some(PrimaryKey::Str("doc-7".to_string())));
	}

	#[test]
	fn invalid_params_json_is_rejected() {
		let err = parse_search_info(
			&params(&[("limit", "3"), ("params", "[1, 2]")]),
			&schema(),
			None,
			&vqp_config::Search::default(),
		)
		.expect_err("Expected params rejection.");

		assert!(err.to_string().contains("JSON object"));
	}

	#[test]
	fn rank_params_require_limit() {
		let err = parse_rank_params(&params(&[]), &schema(), &vqp_config::Search::default())
			.expect_err("Expected missing limit.");

		assert!(matches!(err, Error::InvalidRequest { .. }));

		let rank = parse_rank_params(
			&params(&[("limit", "5"), ("offset", "2"), ("round_decimal", "3")]),
			&schema(),
			&vqp_config::Search::default(),
		)
		.expect("parse failed");

		assert_eq!(rank, RankParams {
			limit: 5,
			offset: 2,
			round_decimal: 3,
			group_by_field_id: None,
			group_size: 1,
		});
	}
}
