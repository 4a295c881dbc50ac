//! Builds the wire request for single-vector and advanced searches.

use std::collections::BTreeSet;

use vqp_domain::{CollectionSchema, DataType, FieldSchema, MetricType, plan::QueryInfo};

use crate::{
	Error, FunctionExecutor, Result,
	request::{InternalSearchRequest, QueryVectors, SubSearchRequest},
	search::{
		SearchRequest,
		output::{self, TranslatedOutput},
		params::{self, ANALYZER_NAME_KEY, IGNORE_GROWING_KEY, RankParams, SearchParams},
		plan::{self, PlanContext},
		rerank::FunctionScore,
	},
};

const METRICS_TARGET: &str = "vqp_search::metrics";

pub(crate) struct ComposeArgs<'a> {
	pub(crate) plan: PlanContext<'a>,
	pub(crate) functions: &'a dyn FunctionExecutor,
	pub(crate) request: &'a SearchRequest,
	/// Ids resolved from caller-named partitions.
	pub(crate) partition_ids: &'a [i64],
	pub(crate) output: &'a TranslatedOutput,
	pub(crate) output_field_ids: &'a [i64],
	pub(crate) ignore_growing: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Composition {
	pub(crate) query_infos: Vec<QueryInfo>,
	pub(crate) function_score: Option<FunctionScore>,
	pub(crate) rank_params: Option<RankParams>,
	pub(crate) need_requery: bool,
	pub(crate) is_iterator: bool,
}

/// Common `nq` of the request; advanced legs must agree.
pub fn check_nq(request: &SearchRequest, max_nq: i64) -> Result<i64> {
	let nq = match request.sub_reqs.split_first() {
		Some((first, rest)) => {
			let nq = first.placeholder.nq();

			if rest.iter().any(|sub| sub.placeholder.nq() != nq) {
				return Err(Error::invalid("sub search request nq should be the same."));
			}

			nq
		},
		None => request.placeholder.nq(),
	};

	if nq <= 0 || nq > max_nq {
		return Err(Error::invalid(format!("nq should be in range [1, {max_nq}], but got {nq}.")));
	}

	Ok(nq)
}

fn analyzer_name(params: &SearchParams, metric_type: Option<MetricType>) -> Option<String> {
	(metric_type == Some(MetricType::Bm25))
		.then(|| params::get(params, ANALYZER_NAME_KEY).map(str::to_string))
		.flatten()
}

fn record_sparse_nnz(collection: &str, label: &str, field: &FieldSchema, placeholder: &QueryVectors) {
	if field.data_type != DataType::SparseFloatVector {
		return;
	}

	if let Some(nnz) = placeholder.sparse_nnz() {
		tracing::debug!(
			target: METRICS_TARGET,
			collection,
			label,
			field_id = field.field_id,
			nnz,
			"Sparse query non-zero count."
		);
	}
}

async fn run_functions(
	functions: &dyn FunctionExecutor,
	schema: &CollectionSchema,
	field_ids: &[i64],
	internal: &mut InternalSearchRequest,
) -> Result<()> {
	if schema.has_non_bm25_functions(field_ids) {
		functions.process_search(schema, internal).await?;
	}

	Ok(())
}

pub(crate) async fn compose_single(
	args: &ComposeArgs<'_>,
	internal: &mut InternalSearchRequest,
) -> Result<Composition> {
	let request = args.request;
	let schema = args.plan.info.schema.clone();
	let mut leg = plan::build_plan(
		&args.plan,
		&request.search_params,
		&request.dsl,
		&request.template_values,
		None,
	)?;
	let function_score = request
		.function_score
		.as_ref()
		.map(|spec| FunctionScore::explicit(&schema, spec))
		.transpose()?;

	if let Some(function) = &function_score
		&& !function.supports_group_by()
		&& leg.plan.query_info.group_by_field_id.is_some()
	{
		return Err(Error::invalid(format!(
			"rerank {} does not support grouping search.",
			function.name()
		)));
	}

	internal.is_iterator = leg.is_iterator;
	internal.offset = leg.offset;
	internal.field_id = leg.anns_field.field_id;
	internal.partition_ids = if args.plan.partition_key_mode {
		plan::route_partitions(&args.plan, &mut leg.plan).await?
	} else {
		args.partition_ids.to_vec()
	};

	let function_inputs =
		function_score.as_ref().map(FunctionScore::input_field_ids).unwrap_or_default();
	let need_requery = !output::vector_output_fields(&schema, &args.output.translated).is_empty();

	if need_requery {
		leg.plan.output_field_ids = function_inputs;
		leg.plan.dynamic_fields = Vec::new();
	} else {
		let mut ids: BTreeSet<i64> = args.output_field_ids.iter().copied().collect();

		ids.extend(function_inputs);

		if let Some(pk) = schema.primary_field() {
			ids.insert(pk.field_id);
		}

		leg.plan.output_field_ids = ids.into_iter().collect();
		leg.plan.dynamic_fields = args.output.user_dynamic_fields.clone();
	}

	let query_info = leg.plan.query_info.clone();

	internal.serialized_plan = leg.plan.to_bytes()?;
	internal.dsl = request.dsl.clone();
	internal.placeholder = request.placeholder.clone();
	internal.topk = query_info.topk;
	internal.metric_type = query_info.metric_type;
	internal.group_by_field_id = query_info.group_by_field_id;
	internal.group_size = query_info.group_size;
	internal.analyzer_name = analyzer_name(&request.search_params, query_info.metric_type);

	record_sparse_nnz(args.plan.collection_name, "search", &leg.anns_field, &request.placeholder);
	run_functions(args.functions, &schema, &[internal.field_id], internal).await?;

	Ok(Composition {
		query_infos: vec![query_info],
		function_score,
		rank_params: None,
		need_requery,
		is_iterator: leg.is_iterator,
	})
}

pub(crate) async fn compose_advanced(
	args: &ComposeArgs<'_>,
	internal: &mut InternalSearchRequest,
) -> Result<Composition> {
	let request = args.request;
	let schema = args.plan.info.schema.clone();
	let function_score = match &request.function_score {
		Some(spec) => FunctionScore::explicit(&schema, spec)?,
		None => FunctionScore::legacy(&request.search_params)?,
	};

	function_score.check_leg_count(request.sub_reqs.len())?;

	let need_requery =
		!request.output_fields.is_empty() || !function_score.input_field_names().is_empty();
	let rank = params::parse_rank_params(&request.search_params, &schema, args.plan.cfg)?;

	if rank.group_by_field_id.is_some() && !function_score.supports_group_by() {
		return Err(Error::invalid(format!(
			"rerank {} does not support grouping search.",
			function_score.name()
		)));
	}

	let mut query_infos = Vec::with_capacity(request.sub_reqs.len());
	let mut union = BTreeSet::new();

	internal.sub_reqs.clear();

	for sub in &request.sub_reqs {
		let mut leg = plan::build_plan(
			&args.plan,
			&sub.search_params,
			&sub.dsl,
			&sub.template_values,
			Some(&rank),
		)?;

		if leg.is_iterator {
			return Err(Error::invalid("search iteration does not support advanced search."));
		}

		let ignore_growing =
			args.ignore_growing || params::parse_bool(&sub.search_params, IGNORE_GROWING_KEY)?;
		let partition_ids = if args.plan.partition_key_mode {
			let ids = plan::route_partitions(&args.plan, &mut leg.plan).await?;

			union.extend(ids.iter().copied());

			ids
		} else {
			args.partition_ids.to_vec()
		};

		leg.plan.output_field_ids.clear();
		leg.plan.dynamic_fields.clear();

		let query_info = leg.plan.query_info.clone();

		record_sparse_nnz(args.plan.collection_name, "hybrid_search", &leg.anns_field, &sub.placeholder);
		internal.sub_reqs.push(SubSearchRequest {
			dsl: sub.dsl.clone(),
			placeholder: sub.placeholder.clone(),
			serialized_plan: leg.plan.to_bytes()?,
			nq: sub.placeholder.nq(),
			partition_ids,
			topk: query_info.topk,
			offset: leg.offset,
			metric_type: query_info.metric_type,
			field_id: leg.anns_field.field_id,
			group_by_field_id: rank.group_by_field_id,
			group_size: rank.group_size,
			ignore_growing,
			analyzer_name: analyzer_name(&sub.search_params, query_info.metric_type),
		});
		query_infos.push(query_info);
	}

	let field_ids: Vec<i64> = internal.sub_reqs.iter().map(|sub| sub.field_id).collect();

	run_functions(args.functions, &schema, &field_ids, internal).await?;

	internal.is_advanced = true;
	internal.topk = rank.limit + rank.offset;
	internal.offset = rank.offset;
	internal.group_by_field_id = rank.group_by_field_id;
	internal.group_size = rank.group_size;
	internal.partition_ids = if args.plan.partition_key_mode {
		union.into_iter().collect()
	} else {
		args.partition_ids.to_vec()
	};

	Ok(Composition {
		query_infos,
		function_score: Some(function_score),
		rank_params: Some(rank),
		need_requery,
		is_iterator: false,
	})
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;
	use crate::search::SubSearch;

	fn vectors(nq: usize) -> QueryVectors {
		QueryVectors::Float(vec![vec![0.0, 1.0]; nq])
	}

	fn advanced(nqs: &[usize]) -> SearchRequest {
		SearchRequest {
			collection_name: "docs".to_string(),
			sub_reqs: nqs
				.iter()
				.map(|nq| SubSearch { placeholder: vectors(*nq), ..SubSearch::default() })
				.collect(),
			..SearchRequest::default()
		}
	}

	#[test]
	fn single_search_uses_placeholder_nq() {
		let request = SearchRequest { placeholder: vectors(3), ..SearchRequest::default() };

		assert_eq!(check_nq(&request, 16).expect("nq failed"), 3);
		assert!(check_nq(&request, 2).is_err());
		assert!(check_nq(&SearchRequest::default(), 16).is_err());
	}

	#[test]
	fn analyzer_only_applies_to_bm25() {
		let params = SearchParams::from([("analyzer_name".to_string(), "en".to_string())]);

		assert_eq!(analyzer_name(&params, Some(MetricType::Bm25)), Some("en".to_string()));
		assert_eq!(analyzer_name(&params, Some(MetricType::Ip)), None);
	}

	proptest! {
		#[test]
		fn mismatched_leg_nq_is_always_rejected(nqs in prop::collection::vec(1_usize..5, 2..6)) {
			let outcome = check_nq(&advanced(&nqs), 16);

			if nqs.iter().all(|nq| *nq == nqs[0]) {
				prop_assert_eq!(outcome.expect("nq failed"), nqs[0] as i64);
			} else {
				let err = outcome.expect_err("Expected nq mismatch.");

				prop_assert!(matches!(err, Error::InvalidRequest { .. }), "expected InvalidRequest, got {:?}", err);
			}
		}
	}
}
