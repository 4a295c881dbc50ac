//! The search task: one request's state through the lifecycle phases.

use std::{collections::HashMap, sync::Arc};

use time::OffsetDateTime;

use vqp_domain::{
	DEFAULT_DB_NAME, FieldData, FieldValue, MetricType, PrimaryKey, Timestamp,
	schema::DYNAMIC_FIELD_NAME, tso,
};

use crate::{
	BoxFuture, CollectionInfo, CollectionWorkload, Collaborators, Error, Result, Task,
	handoff::{self, TaskContext},
	request::{InternalSearchRequest, ShardSearchResult},
	result_set::ResultSet,
	search::{
		IteratorResults, SearchRequest, SearchResults,
		compose::{self, ComposeArgs, Composition},
		consistency::{self, ConsistencyInput},
		output::{self, TranslatedOutput},
		params::{self, IGNORE_GROWING_KEY, RankParams},
		partition,
		plan::PlanContext,
		reduce::{self, LegSpec, Reduced, ShardBookkeeping},
		requery::{self, RequeryArgs},
		rerank::InputValues,
		shard::{Routing, SearchShardWork},
	},
};

pub struct SearchTask {
	request: SearchRequest,
	ctx: TaskContext,
	cfg: Arc<vqp_config::Search>,
	collaborators: Collaborators,
	source_id: i64,
	id: i64,
	begin_ts: Timestamp,
	created_at: OffsetDateTime,
	collection: Option<CollectionInfo>,
	output: TranslatedOutput,
	internal: Arc<InternalSearchRequest>,
	composition: Option<Composition>,
	result_set: Arc<ResultSet<ShardSearchResult>>,
	bookkeeping: ShardBookkeeping,
	results: Option<SearchResults>,
}
impl SearchTask {
	pub fn new(
		request: SearchRequest,
		ctx: TaskContext,
		cfg: Arc<vqp_config::Search>,
		collaborators: Collaborators,
	) -> Self {
		Self {
			request,
			ctx,
			cfg,
			collaborators,
			source_id: 0,
			id: 0,
			begin_ts: 0,
			created_at: OffsetDateTime::now_utc(),
			collection: None,
			output: TranslatedOutput::default(),
			internal: Arc::new(InternalSearchRequest::default()),
			composition: None,
			result_set: Arc::new(ResultSet::new()),
			bookkeeping: ShardBookkeeping::default(),
			results: None,
		}
	}

	pub fn with_source_id(mut self, source_id: i64) -> Self {
		self.source_id = source_id;

		self
	}

	/// Resolved wire request; populated by `pre_execute`.
	pub fn internal_request(&self) -> &InternalSearchRequest {
		&self.internal
	}

	pub fn bookkeeping(&self) -> &ShardBookkeeping {
		&self.bookkeeping
	}

	pub fn into_results(mut self) -> Result<SearchResults> {
		self.results.take().ok_or_else(|| Error::internal("search task finished without results."))
	}

	fn collection(&self) -> Result<&CollectionInfo> {
		self.collection.as_ref().ok_or_else(|| Error::internal("search task has no resolved collection."))
	}

	fn composition(&self) -> Result<&Composition> {
		self.composition.as_ref().ok_or_else(|| Error::internal("search task has no composed request."))
	}

	fn routing(&self) -> Routing {
		Routing {
			meta: self.collaborators.meta.clone(),
			balancer: self.collaborators.balancer.clone(),
			db_name: self.request.db_name.clone(),
			collection_name: self.request.collection_name.clone(),
		}
	}

	async fn prepare(&mut self) -> Result<()> {
		let db_name = self.request.db_name.clone();
		let collection_name = self.request.collection_name.clone();
		let meta = self.collaborators.meta.clone();
		let info = handoff::wait(
			&self.ctx,
			"loading collection metadata",
			meta.collection_info(&db_name, &collection_name),
		)
		.await??;
		let schema = info.schema.clone();
		let partition_key_mode = schema.partition_key_field().is_some();

		if partition_key_mode && !self.request.partition_names.is_empty() {
			return Err(Error::invalid(
				"not support manually specifying the partition names if partition key mode is used.",
			));
		}
		if self.cfg.must_use_partition_key && !partition_key_mode {
			return Err(Error::invalid(
				"must use partition key in the search request because must_use_partition_key is enabled.",
			));
		}

		let partition_ids = if !partition_key_mode && !self.request.partition_names.is_empty() {
			let partitions = handoff::wait(
				&self.ctx,
				"resolving partitions",
				meta.partitions(&db_name, &collection_name),
			)
			.await??;

			partition::resolve_partition_names(&self.request.partition_names, &partitions)?
		} else {
			Vec::new()
		};
		let output = output::translate_output_fields(&self.request.output_fields, &schema)?;
		let is_advanced = !self.request.sub_reqs.is_empty();

		if is_advanced && self.request.sub_reqs.len() > self.cfg.max_sub_requests {
			return Err(Error::invalid(format!(
				"maximum of ann search requests is {}.",
				self.cfg.max_sub_requests
			)));
		}

		let nq = compose::check_nq(&self.request, self.cfg.max_nq)?;
		let ignore_growing = params::parse_bool(&self.request.search_params, IGNORE_GROWING_KEY)?;
		let output_field_ids = output::output_field_ids(&schema, &output.translated)?;
		let mut internal = InternalSearchRequest {
			msg_id: self.id,
			source_id: self.source_id,
			db_name: db_name.clone(),
			collection_id: info.collection_id,
			output_field_ids: output_field_ids.clone(),
			nq,
			ignore_growing,
			..InternalSearchRequest::default()
		};
		let args = ComposeArgs {
			plan: PlanContext {
				cfg: &self.cfg,
				compiler: self.collaborators.compiler.as_ref(),
				meta: meta.as_ref(),
				info: &info,
				db_name: &db_name,
				collection_name: &collection_name,
				partition_key_mode,
			},
			functions: self.collaborators.functions.as_ref(),
			request: &self.request,
			partition_ids: &partition_ids,
			output: &output,
			output_field_ids: &output_field_ids,
			ignore_growing,
		};
		let composition = if is_advanced {
			handoff::wait(&self.ctx, "composing the search", compose::compose_advanced(&args, &mut internal))
				.await??
		} else {
			handoff::wait(&self.ctx, "composing the search", compose::compose_single(&args, &mut internal))
				.await??
		};
		let resolved = consistency::resolve(ConsistencyInput {
			use_default: self.request.use_default_consistency,
			requested: self.request.consistency_level,
			guarantee_ts: self.request.guarantee_timestamp,
			begin_ts: self.begin_ts,
			graceful_time_ms: self.cfg.graceful_time_ms,
			collection_level: info.consistency_level,
			update_ts: info.update_timestamp,
		});

		internal.consistency_level = resolved.level;
		internal.guarantee_timestamp = resolved.guarantee_ts;

		if composition.is_iterator && self.request.guarantee_timestamp > 0 {
			internal.mvcc_timestamp = self.request.guarantee_timestamp;
			internal.guarantee_timestamp = self.request.guarantee_timestamp.max(info.update_timestamp);
		}
		if let Some(remaining) = self.ctx.remaining() {
			internal.timeout_timestamp = Some(tso::compose_from_time(OffsetDateTime::now_utc() + remaining));
		}

		internal.collection_ttl_timestamp = consistency::ttl_cutoff(self.begin_ts, info.ttl)?;

		tracing::debug!(
			collection_id = info.collection_id,
			nq,
			advanced = is_advanced,
			guarantee_ts = internal.guarantee_timestamp,
			consistency = internal.consistency_level.as_str(),
			partitions = internal.partition_ids.len(),
			need_requery = composition.need_requery,
			"Search prepared."
		);

		self.internal = Arc::new(internal);
		self.result_set = Arc::new(ResultSet::new());
		self.output = output;
		self.composition = Some(composition);
		self.collection = Some(info);

		Ok(())
	}

	async fn fan_out(&mut self) -> Result<()> {
		let info = self.collection()?;
		let workload = CollectionWorkload {
			db: self.request.db_name.clone(),
			collection_name: self.request.collection_name.clone(),
			collection_id: info.collection_id,
			nq: self.internal.nq,
			work: Arc::new(SearchShardWork {
				request: self.internal.clone(),
				results: self.result_set.clone(),
				routing: self.routing(),
			}),
		};

		self.collaborators.balancer.execute(&self.ctx, workload).await?;

		tracing::debug!(
			collection_id = self.internal.collection_id,
			shards = self.result_set.len(),
			duplicates = self.result_set.duplicates(),
			"Search fan-out finished."
		);

		Ok(())
	}

	async fn finish(&mut self) -> Result<()> {
		let partials = self.result_set.take_sorted();

		if let Some(interrupt) = self.ctx.interrupt() {
			return Err(interrupt.into_error("reducing search results"));
		}

		self.bookkeeping = reduce::aggregate_bookkeeping(&partials);

		let composition = self.composition()?.clone();
		let mut reduced = match &composition.rank_params {
			Some(rank) => self.reduce_advanced(&partials, &composition, rank).await?,
			None => self.reduce_single(&partials, &composition).await?,
		};
		let metric_type =
			composition.query_infos.first().and_then(|info| info.metric_type).or(reduced.metric_type);
		let flip_distance = composition.function_score.is_none()
			&& metric_type.map(|metric| !metric.positively_related()).unwrap_or(false);
		let round_decimal = match &composition.rank_params {
			Some(rank) => rank.round_decimal,
			None => composition.query_infos.first().map(|info| info.round_decimal).unwrap_or(-1),
		};

		reduce::finalize_scores(&mut reduced.scores, flip_distance, round_decimal);

		let results = self.assemble(reduced, &composition, metric_type)?;

		tracing::debug!(
			collection_id = self.internal.collection_id,
			rows = results.ids.len(),
			insufficient = results.result_size_insufficient,
			related_data_size = self.bookkeeping.related_data_size,
			elapsed_ms = (OffsetDateTime::now_utc() - self.created_at).whole_milliseconds() as i64,
			"Search reduced."
		);

		self.results = Some(results);

		Ok(())
	}

	async fn reduce_single(
		&self,
		partials: &[ShardSearchResult],
		composition: &Composition,
	) -> Result<Reduced> {
		let query_info = composition
			.query_infos
			.first()
			.ok_or_else(|| Error::internal("single search has no query info."))?;
		let internal = &self.internal;
		let grouped = LegSpec {
			nq: internal.nq,
			offset: internal.offset,
			limit: query_info.topk - internal.offset,
			group_by_field_id: internal.group_by_field_id,
			group_size: internal.group_size,
		};
		let mut reduced = match &composition.function_score {
			None => reduce::reduce_leg(partials, 0, &grouped)?,
			Some(function) => {
				let leg = reduce::reduce_leg(partials, 0, &LegSpec {
					offset: 0,
					limit: query_info.topk,
					..grouped
				})?;
				let inputs =
					InputValues::from_columns(&leg.ids, &leg.fields_data, &function.input_field_ids());
				let rank = RankParams {
					limit: grouped.limit,
					offset: grouped.offset,
					round_decimal: query_info.round_decimal,
					group_by_field_id: grouped.group_by_field_id,
					group_size: grouped.group_size,
				};
				let mut fused = reduce::fuse_legs(std::slice::from_ref(&leg), function, &inputs, &rank)?;

				fused.metric_type = leg.metric_type;
				attach_columns(&mut fused, &leg.ids, &leg.fields_data);

				fused
			},
		};

		if composition.need_requery {
			let ids = unique_ids(&reduced.ids);
			let columns = self.requery(ids.clone(), self.internal.output_field_ids.clone()).await?;

			attach_columns(&mut reduced, &ids, &columns);
		}

		Ok(reduced)
	}

	async fn reduce_advanced(
		&self,
		partials: &[ShardSearchResult],
		composition: &Composition,
		rank: &RankParams,
	) -> Result<Reduced> {
		let function = composition
			.function_score
			.as_ref()
			.ok_or_else(|| Error::internal("advanced search has no rank function."))?;
		let mut legs = Vec::with_capacity(composition.query_infos.len());

		for (idx, (query_info, sub)) in
			composition.query_infos.iter().zip(&self.internal.sub_reqs).enumerate()
		{
			legs.push(reduce::reduce_leg(partials, idx, &LegSpec {
				nq: self.internal.nq,
				offset: sub.offset,
				limit: query_info.topk - sub.offset,
				group_by_field_id: rank.group_by_field_id,
				group_size: rank.group_size,
			})?);
		}

		let candidates = unique_ids(legs.iter().flat_map(|leg| leg.ids.iter()));
		let columns = if composition.need_requery {
			let mut field_ids = self.internal.output_field_ids.clone();

			for field_id in function.input_field_ids() {
				if !field_ids.contains(&field_id) {
					field_ids.push(field_id);
				}
			}

			self.requery(candidates.clone(), field_ids).await?
		} else {
			Vec::new()
		};
		let inputs = InputValues::from_columns(&candidates, &columns, &function.input_field_ids());
		let mut fused = reduce::fuse_legs(&legs, function, &inputs, rank)?;

		attach_columns(&mut fused, &candidates, &columns);

		Ok(fused)
	}

	async fn requery(&self, ids: Vec<PrimaryKey>, output_field_ids: Vec<i64>) -> Result<Vec<FieldData>> {
		let info = self.collection()?;
		let internal = &self.internal;

		requery::requery(RequeryArgs {
			ctx: &self.ctx,
			routing: self.routing(),
			schema: &info.schema,
			collection_id: info.collection_id,
			partition_ids: internal.partition_ids.clone(),
			ids,
			output_field_ids,
			guarantee_ts: internal.guarantee_timestamp,
			mvcc_ts: internal.read_timestamp(),
			ttl_ts: internal.collection_ttl_timestamp,
			consistency_level: internal.consistency_level,
		})
		.await
	}

	fn assemble(
		&self,
		reduced: Reduced,
		composition: &Composition,
		metric_type: Option<MetricType>,
	) -> Result<SearchResults> {
		let info = self.collection()?;
		let schema = info.schema.as_ref();
		let pk_field = schema
			.primary_field()
			.ok_or_else(|| Error::internal(format!("collection {} has no primary key.", schema.name)))?;
		let limit = self.internal.topk - self.internal.offset;
		let translated = &self.output.translated;
		let project_dynamic = !self.output.user_dynamic_fields.is_empty()
			&& !self.output.user_output_fields.iter().any(|name| name == DYNAMIC_FIELD_NAME);
		let mut fields_data: Vec<FieldData> = reduced
			.fields_data
			.into_iter()
			.filter(|column| translated.contains(&column.field_name))
			.map(|mut column| {
				if column.is_dynamic && project_dynamic {
					for value in &mut column.values {
						project_json(value, &self.output.user_dynamic_fields);
					}
				}

				column
			})
			.collect();

		fields_data.sort_by_key(|column| translated.iter().position(|name| *name == column.field_name));

		let mut output_fields = self.output.user_output_fields.clone();

		if self.output.pk_requested_explicitly {
			output_fields.push(pk_field.name.clone());
			fields_data.push(FieldData {
				field_id: pk_field.field_id,
				field_name: pk_field.name.clone(),
				data_type: pk_field.data_type,
				is_dynamic: false,
				values: reduced.ids.iter().map(PrimaryKey::to_field_value).collect(),
			});
		}

		let group_by_field_value = self
			.internal
			.group_by_field_id
			.and_then(|field_id| schema.field_by_id(field_id))
			.map(|field| FieldData {
				field_id: field.field_id,
				field_name: field.name.clone(),
				data_type: field.data_type,
				is_dynamic: false,
				values: reduced.group_by_values.clone(),
			});
		let iterator = match composition.query_infos.as_slice() {
			[query_info] if composition.is_iterator => query_info.iterator.as_ref().map(|iterator| {
				IteratorResults {
					token: iterator.token.clone(),
					last_bound: reduce::last_bound(
						&reduced.scores,
						self.internal.nq,
						iterator.last_bound,
						metric_type,
					),
					last_pk: reduce::last_pk(&reduced.ids, self.internal.nq, iterator.last_pk.as_ref()),
				}
			}),
			_ => None,
		};
		let session_ts = (composition.is_iterator && self.request.guarantee_timestamp == 0)
			.then(|| reduce::session_ts(&self.bookkeeping.channels_mvcc, self.begin_ts));

		Ok(SearchResults {
			collection_name: self.request.collection_name.clone(),
			primary_field_name: pk_field.name.clone(),
			num_queries: self.internal.nq,
			top_k: limit,
			result_size_insufficient: reduce::result_size_insufficient(&reduced.topks, limit),
			topks: reduced.topks,
			ids: reduced.ids,
			scores: reduced.scores,
			fields_data,
			output_fields,
			group_by_field_value,
			iterator,
			session_ts,
			is_topk_reduce: self.bookkeeping.is_topk_reduce,
			is_recall_evaluation: self.bookkeeping.is_recall_evaluation,
		})
	}
}

impl Task for SearchTask {
	fn name(&self) -> &'static str {
		"search"
	}

	fn context(&self) -> &TaskContext {
		&self.ctx
	}

	fn id(&self) -> i64 {
		self.id
	}

	fn set_id(&mut self, id: i64) {
		self.id = id;
	}

	fn begin_ts(&self) -> Timestamp {
		self.begin_ts
	}

	fn set_ts(&mut self, ts: Timestamp) {
		self.begin_ts = ts;
	}

	fn on_enqueue(&mut self) -> Result<()> {
		if self.request.collection_name.trim().is_empty() {
			return Err(Error::invalid("collection_name must not be empty."));
		}
		if self.request.db_name.trim().is_empty() {
			self.request.db_name = DEFAULT_DB_NAME.to_string();
		}

		self.created_at = OffsetDateTime::now_utc();
		self.internal = Arc::new(InternalSearchRequest::default());
		self.results = None;

		Ok(())
	}

	fn can_skip_alloc_timestamp(&self) -> BoxFuture<'_, bool> {
		Box::pin(async move {
			let collection_level = if self.request.use_default_consistency {
				let lookup = self
					.collaborators
					.meta
					.collection_info(&self.request.db_name, &self.request.collection_name);

				handoff::wait(&self.ctx, "loading collection metadata", lookup)
					.await
					.ok()
					.and_then(|info| info.ok())
					.map(|info| info.consistency_level)
			} else {
				None
			};

			consistency::can_skip_alloc_timestamp(
				self.request.use_default_consistency,
				self.request.consistency_level,
				self.request.guarantee_timestamp,
				collection_level,
			)
		})
	}

	fn pre_execute(&mut self) -> BoxFuture<'_, Result<()>> {
		Box::pin(self.prepare())
	}

	fn execute(&mut self) -> BoxFuture<'_, Result<()>> {
		Box::pin(self.fan_out())
	}

	fn post_execute(&mut self) -> BoxFuture<'_, Result<()>> {
		Box::pin(self.finish())
	}
}

/// Unique ids in first-seen order.
fn unique_ids<'a>(ids: impl IntoIterator<Item = &'a PrimaryKey>) -> Vec<PrimaryKey> {
	let mut seen = std::collections::HashSet::new();

	ids.into_iter().filter(|pk| seen.insert(*pk)).cloned().collect()
}

/// Replaces `reduced`'s columns with `columns`, which are row-aligned with `source_ids`.
fn attach_columns(reduced: &mut Reduced, source_ids: &[PrimaryKey], columns: &[FieldData]) {
	let positions: HashMap<&PrimaryKey, usize> =
		source_ids.iter().enumerate().map(|(idx, pk)| (pk, idx)).collect();
	let rows: Vec<usize> = reduced
		.ids
		.iter()
		.map(|pk| positions.get(pk).copied().unwrap_or(usize::MAX))
		.collect();

	reduced.fields_data = columns.iter().map(|column| column.select(&rows)).collect();
}

/// Keeps only the requested keys of a dynamic-field object.
fn project_json(value: &mut FieldValue, keys: &[String]) {
	if let FieldValue::Json(serde_json::Value::Object(map)) = value {
		map.retain(|key, _| keys.iter().any(|wanted| wanted == key));
	}
}

#[cfg(test)]
mod tests {
	use vqp_domain::DataType;

	use super::*;

	#[test]
	fn attach_aligns_columns_by_primary_key() {
		let mut reduced = Reduced {
			topks: vec![2],
			ids: vec![PrimaryKey::Int(9), PrimaryKey::Int(4)],
			scores: vec![1.0, 0.5],
			..Reduced::default()
		};
		let column = FieldData {
			field_id: 1,
			field_name: "title".to_string(),
			data_type: DataType::VarChar,
			is_dynamic: false,
			values: vec![FieldValue::Str("four".to_string()), FieldValue::Str("nine".to_string())],
		};

		attach_columns(&mut reduced, &[PrimaryKey::Int(4), PrimaryKey::Int(9)], &[column]);

		assert_eq!(reduced.fields_data[0].values, vec![
			FieldValue::Str("nine".to_string()),
			FieldValue::Str("four".to_string()),
		]);
	}

	#[test]
	fn dynamic_projection_keeps_requested_keys() {
		let mut value = FieldValue::Json(serde_json::json!({"color": "red", "size": 3}));

		project_json(&mut value, &["color".to_string()]);

		assert_eq!(value, FieldValue::Json(serde_json::json!({"color": "red"})));
	}

	#[test]
	fn unique_ids_keep_first_seen_order() {
		let ids = [PrimaryKey::Int(3), PrimaryKey::Int(1), PrimaryKey::Int(3)];

		assert_eq!(unique_ids(&ids), vec![PrimaryKey::Int(3), PrimaryKey::Int(1)]);
	}
}
