//! Per-shard work units handed to the load balancer.

use std::sync::Arc;

use crate::{
	BoxFuture, Error, LbPolicy, MetaCache, Result, ShardTarget, ShardWork,
	request::{
		InternalSearchRequest, ShardQueryRequest, ShardQueryResult, ShardSearchRequest,
		ShardSearchResult, ShardStatus,
	},
	result_set::ResultSet,
};

/// Where routing invalidation and cost feedback go.
#[derive(Clone)]
pub(crate) struct Routing {
	pub(crate) meta: Arc<dyn MetaCache>,
	pub(crate) balancer: Arc<dyn LbPolicy>,
	pub(crate) db_name: String,
	pub(crate) collection_name: String,
}
impl Routing {
	fn deprecate(&self) {
		self.meta.deprecate_shard_cache(&self.db_name, &self.collection_name);
	}

	/// Maps a non-success shard status to the error the balancer acts on.
	fn check_status(&self, status: &ShardStatus, node_id: i64, channel: &str, op: &str) -> Result<()> {
		match status {
			ShardStatus::Success => Ok(()),
			ShardStatus::NotShardLeader => {
				tracing::warn!(node_id, channel, "Shard reported it is no longer the leader.");

				self.deprecate();

				Err(Error::RoutingStale { node_id, channel: channel.to_string() })
			},
			ShardStatus::Failure { reason } => {
				tracing::warn!(node_id, channel, reason = %reason, "Shard {op} failed.");

				Err(Error::Shard { node_id, message: format!("fail to {op} on node {node_id}: {reason}") })
			},
		}
	}

	fn transport_error(&self, err: Error, node_id: i64, channel: &str, op: &str) -> Error {
		tracing::warn!(node_id, channel, error = %err, "Shard {op} RPC failed.");

		self.deprecate();

		Error::Shard { node_id, message: format!("fail to {op} on node {node_id}: {err}") }
	}
}

pub(crate) struct SearchShardWork {
	pub(crate) request: Arc<InternalSearchRequest>,
	pub(crate) results: Arc<ResultSet<ShardSearchResult>>,
	pub(crate) routing: Routing,
}
impl ShardWork for SearchShardWork {
	fn run(&self, target: ShardTarget) -> BoxFuture<'static, Result<()>> {
		let request = ShardSearchRequest {
			req: self.request.clone(),
			target_node_id: target.node_id,
			dml_channels: vec![target.channel.clone()],
			total_channel_num: 1,
		};
		let results = self.results.clone();
		let routing = self.routing.clone();

		Box::pin(async move {
			let node_id = target.node_id;
			let result = match target.client.search(&request).await {
				Ok(result) => result,
				Err(err) => return Err(routing.transport_error(err, node_id, &target.channel, "search")),
			};

			routing.check_status(&result.status, node_id, &target.channel, "search")?;
			routing.balancer.update_cost_metrics(node_id, &result.cost);

			if !results.insert(result) {
				tracing::debug!(node_id, channel = %target.channel, "Dropped duplicate shard result.");
			}

			Ok(())
		})
	}
}

/// Point lookup template; target-specific fields are filled per shard.
pub(crate) struct QueryShardWork {
	pub(crate) request: ShardQueryRequest,
	pub(crate) results: Arc<ResultSet<ShardQueryResult>>,
	pub(crate) routing: Routing,
}
impl ShardWork for QueryShardWork {
	fn run(&self, target: ShardTarget) -> BoxFuture<'static, Result<()>> {
		let mut request = self.request.clone();
		let results = self.results.clone();
		let routing = self.routing.clone();

		request.target_node_id = target.node_id;
		request.dml_channels = vec![target.channel.clone()];

		Box::pin(async move {
			let node_id = target.node_id;
			let result = match target.client.query(&request).await {
				Ok(result) => result,
				Err(err) => return Err(routing.transport_error(err, node_id, &target.channel, "query")),
			};

			routing.check_status(&result.status, node_id, &target.channel, "query")?;
			routing.balancer.update_cost_metrics(node_id, &result.cost);

			if !results.insert(result) {
				tracing::debug!(node_id, channel = %target.channel, "Dropped duplicate query result.");
			}

			Ok(())
		})
	}
}
