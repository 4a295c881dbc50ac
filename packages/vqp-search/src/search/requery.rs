//! Second-phase point lookup of output columns for already ranked rows.

use std::{collections::HashMap, sync::Arc};

use vqp_domain::{CollectionSchema, ConsistencyLevel, FieldData, PrimaryKey, Timestamp};

use crate::{
	CollectionWorkload, Error, Result,
	handoff::TaskContext,
	request::ShardQueryRequest,
	result_set::ResultSet,
	search::shard::{QueryShardWork, Routing},
};

pub(crate) struct RequeryArgs<'a> {
	pub(crate) ctx: &'a TaskContext,
	pub(crate) routing: Routing,
	pub(crate) schema: &'a CollectionSchema,
	pub(crate) collection_id: i64,
	pub(crate) partition_ids: Vec<i64>,
	/// Rows to fetch, unique, in result order.
	pub(crate) ids: Vec<PrimaryKey>,
	pub(crate) output_field_ids: Vec<i64>,
	pub(crate) guarantee_ts: Timestamp,
	pub(crate) mvcc_ts: Timestamp,
	pub(crate) ttl_ts: Option<Timestamp>,
	pub(crate) consistency_level: ConsistencyLevel,
}

/// Columns for `output_field_ids`, row-aligned with `args.ids`.
pub(crate) async fn requery(args: RequeryArgs<'_>) -> Result<Vec<FieldData>> {
	let mut columns = Vec::with_capacity(args.output_field_ids.len());

	for field_id in &args.output_field_ids {
		let field = args.schema.field_by_id(*field_id).ok_or_else(|| {
			Error::internal(format!("requery field {field_id} not found in schema."))
		})?;

		columns.push(FieldData {
			field_id: field.field_id,
			field_name: field.name.clone(),
			data_type: field.data_type,
			is_dynamic: field.is_dynamic,
			values: Vec::with_capacity(args.ids.len()),
		});
	}

	if args.ids.is_empty() || columns.is_empty() {
		return Ok(columns);
	}

	let results = Arc::new(ResultSet::new());
	let request = ShardQueryRequest {
		db_name: args.routing.db_name.clone(),
		collection_id: args.collection_id,
		partition_ids: args.partition_ids,
		ids: Arc::new(args.ids.clone()),
		output_field_ids: args.output_field_ids.clone(),
		guarantee_timestamp: args.guarantee_ts,
		mvcc_timestamp: args.mvcc_ts,
		collection_ttl_timestamp: args.ttl_ts,
		consistency_level: args.consistency_level,
		target_node_id: 0,
		dml_channels: Vec::new(),
	};
	let workload = CollectionWorkload {
		db: args.routing.db_name.clone(),
		collection_name: args.routing.collection_name.clone(),
		collection_id: args.collection_id,
		nq: 1,
		work: Arc::new(QueryShardWork {
			request,
			results: results.clone(),
			routing: args.routing.clone(),
		}),
	};

	args.routing.balancer.execute(args.ctx, workload).await?;

	let partials = results.take_sorted();
	let mut located: HashMap<&PrimaryKey, (usize, usize)> = HashMap::new();

	for (source, partial) in partials.iter().enumerate() {
		for (row, pk) in partial.ids.iter().enumerate() {
			located.entry(pk).or_insert((source, row));
		}
	}

	for pk in &args.ids {
		let (source, row) = located
			.get(pk)
			.copied()
			.ok_or_else(|| Error::internal(format!("requery returned no row for primary key {pk}.")))?;
		let partial = &partials[source];

		for column in &mut columns {
			let value = partial
				.fields_data
				.iter()
				.find(|data| data.field_id == column.field_id)
				.and_then(|data| data.values.get(row))
				.cloned()
				.ok_or_else(|| {
					Error::internal(format!(
						"requery returned no {} value for primary key {pk}.",
						column.field_name
					))
				})?;

			column.values.push(value);
		}
	}

	tracing::debug!(
		collection_id = args.collection_id,
		rows = args.ids.len(),
		shards = partials.len(),
		"Requery finished."
	);

	Ok(columns)
}
