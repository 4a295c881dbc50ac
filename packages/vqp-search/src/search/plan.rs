//! Plan compilation and partition routing for one search leg.

use std::collections::BTreeMap;

use vqp_domain::{CollectionSchema, DataType, FieldSchema, FieldValue, plan::PlanNode};

use crate::{
	CollectionInfo, CompileInput, Error, MetaCache, PlanCompiler, Result,
	search::{
		params::{self, ANNS_FIELD_KEY, RankParams, SearchParams},
		partition,
	},
};

/// Hint asking shards to skip alternative execution paths for an isolated partition.
pub const DISABLE_HINT: &str = "disable";

pub(crate) struct PlanContext<'a> {
	pub(crate) cfg: &'a vqp_config::Search,
	pub(crate) compiler: &'a dyn PlanCompiler,
	pub(crate) meta: &'a dyn MetaCache,
	pub(crate) info: &'a CollectionInfo,
	pub(crate) db_name: &'a str,
	pub(crate) collection_name: &'a str,
	pub(crate) partition_key_mode: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct LegPlan {
	pub(crate) plan: PlanNode,
	pub(crate) offset: i64,
	pub(crate) is_iterator: bool,
	pub(crate) anns_field: FieldSchema,
}

/// The explicitly named vector field, or the collection's only one.
pub fn resolve_anns_field<'a>(
	params: &SearchParams,
	schema: &'a CollectionSchema,
	enable_multiple_vector_fields: bool,
) -> Result<&'a FieldSchema> {
	if let Some(name) = params::get(params, ANNS_FIELD_KEY) {
		let field = schema
			.field_by_name(name)
			.ok_or_else(|| Error::invalid(format!("anns_field {name} not found in schema.")))?;

		if !field.data_type.is_vector() {
			return Err(Error::invalid(format!("anns_field {name} is not a vector field.")));
		}

		return Ok(field);
	}

	let vectors = schema.vector_fields();

	match vectors.as_slice() {
		[] => Err(Error::invalid("vector field not found in schema.")),
		[only] => Ok(only),
		[first, ..] if !enable_multiple_vector_fields => Ok(first),
		_ => Err(Error::invalid(
			"multiple anns_fields exist, please specify a anns_field in search_params.",
		)),
	}
}

pub(crate) fn build_plan(
	cx: &PlanContext<'_>,
	params: &SearchParams,
	dsl: &str,
	template_values: &BTreeMap<String, FieldValue>,
	rank: Option<&RankParams>,
) -> Result<LegPlan> {
	let schema = cx.info.schema.as_ref();
	let anns_field = resolve_anns_field(params, schema, cx.cfg.enable_multiple_vector_fields)?;
	let mut info = params::parse_search_info(params, schema, rank, cx.cfg)?;

	if let Some(collection_id) = info.collection_id
		&& collection_id != cx.info.collection_id
	{
		return Err(Error::invalid(format!(
			"collection id mismatch: search params name {collection_id}, resolved {}.",
			cx.info.collection_id
		)));
	}
	if info.query_info.group_by_field_id.is_some()
		&& anns_field.data_type == DataType::BinaryVector
	{
		return Err(Error::invalid(
			"not support search_group_by operation based on binary vector column.",
		));
	}

	info.query_info.query_field_id = anns_field.field_id;

	let plan = cx
		.compiler
		.compile(CompileInput {
			schema,
			dsl,
			anns_field: &anns_field.name,
			query_info: info.query_info,
			template_values,
		})
		.map_err(|err| {
			tracing::warn!(collection = cx.collection_name, dsl, error = %err, "Failed to create query plan.");

			Error::invalid(format!("failed to create query plan: {err}"))
		})?;

	Ok(LegPlan { plan, offset: info.offset, is_iterator: info.is_iterator, anns_field: anns_field.clone() })
}

/// Marks the plan as served by a partition-key materialized view, checking isolation when the
/// collection demands it.
pub(crate) fn apply_materialized_view(cx: &PlanContext<'_>, plan: &mut PlanNode) -> Result<()> {
	if !cx.cfg.enable_materialized_view {
		return Ok(());
	}

	let key_field = cx
		.info
		.schema
		.partition_key_field()
		.ok_or_else(|| Error::invalid("partition key field not found in schema."))?;

	if !key_field.data_type.supports_materialized_view() {
		return Err(Error::invalid(
			"partition key field data type is not supported in materialized view.",
		));
	}

	if cx.info.partition_key_isolation {
		partition::validate_partition_key_isolation(plan.expr.as_ref())?;

		plan.query_info.hints = Some(DISABLE_HINT.to_string());
	}

	plan.query_info.materialized_view_involved = true;

	Ok(())
}

/// Partition ids a partition-key plan is restricted to; empty means every partition.
pub(crate) async fn route_partitions(cx: &PlanContext<'_>, plan: &mut PlanNode) -> Result<Vec<i64>> {
	apply_materialized_view(cx, plan)?;

	let keys = plan.expr.as_ref().map(partition::partition_keys).unwrap_or_default();

	if keys.is_empty() {
		if cx.cfg.must_use_partition_key {
			return Err(Error::invalid(
				"must use partition key in the search request because must_use_partition_key is enabled.",
			));
		}

		return Ok(Vec::new());
	}

	let partitions = cx.meta.partitions(cx.db_name, cx.collection_name).await?;

	partition::hash_partition_keys(&keys, &partitions)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn field(field_id: i64, name: &str, data_type: DataType) -> FieldSchema {
		FieldSchema {
			field_id,
			name: name.to_string(),
			data_type,
			is_primary_key: field_id == 100,
			is_partition_key: false,
			is_dynamic: false,
			dim: Some(2),
		}
	}

	fn schema(vectors: &[(&str, DataType)]) -> CollectionSchema {
		let mut fields = vec![field(100, "id", DataType::Int64)];

		for (idx, (name, data_type)) in vectors.iter().enumerate() {
			fields.push(field(101 + idx as i64, name, *data_type));
		}

		CollectionSchema {
			name: "docs".to_string(),
			fields,
			functions: Vec::new(),
			enable_dynamic_field: false,
		}
	}

	#[test]
	fn sole_vector_field_is_implied() {
		let schema = schema(&[("embedding", DataType::FloatVector)]);
		let field = resolve_anns_field(&SearchParams::new(), &schema, true).expect("resolve failed");

		assert_eq!(field.name, "embedding");
	}

	#[test]
	fn ambiguous_vector_field_is_rejected() {
		let schema = schema(&[("dense", DataType::FloatVector), ("bits", DataType::BinaryVector)]);
		let err = resolve_anns_field(&SearchParams::new(), &schema, true)
			.expect_err("Expected ambiguity error.");

		assert!(err.to_string().contains("multiple anns_fields"));

		let params = SearchParams::from([("anns_field".to_string(), "bits".to_string())]);

		assert_eq!(resolve_anns_field(&params, &schema, true).expect("resolve failed").field_id, 102);
	}

	#[test]
	fn missing_or_scalar_anns_field_is_rejected() {
		let none = schema(&[]);

		assert!(resolve_anns_field(&SearchParams::new(), &none, true).is_err());

		let params = SearchParams::from([("anns_field".to_string(), "id".to_string())]);

		assert!(resolve_anns_field(&params, &none, true).is_err());
	}
}
