//! Collection-wide scatter/gather over shard leaders.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinSet;

use crate::{
	BoxFuture, Error, MetaCache, Result, ShardClient, ShardConnector, handoff::TaskContext,
	request::CostAggregation,
};

/// Stale-leader retries allowed per channel and workload.
const MAX_STALE_RETRIES: usize = 1;

pub struct ShardTarget {
	pub node_id: i64,
	pub channel: String,
	pub client: Arc<dyn ShardClient>,
}

/// Work run once per channel against the chosen leader.
pub trait ShardWork
where
	Self: Send + Sync,
{
	fn run(&self, target: ShardTarget) -> BoxFuture<'static, Result<()>>;
}

pub struct CollectionWorkload {
	pub db: String,
	pub collection_name: String,
	pub collection_id: i64,
	pub nq: i64,
	pub work: Arc<dyn ShardWork>,
}

pub trait LbPolicy
where
	Self: Send + Sync,
{
	fn execute<'a>(
		&'a self,
		ctx: &'a TaskContext,
		workload: CollectionWorkload,
	) -> BoxFuture<'a, Result<()>>;

	fn update_cost_metrics(&self, node_id: i64, cost: &CostAggregation);
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeCost {
	/// Smoothed shard service time in milliseconds.
	pub service_ms: f32,
	/// Smoothed queue depth, in query vectors, reported by the shard.
	pub queue_nq: f32,
	/// Query vectors this proxy currently has in flight on the node.
	pub outstanding_nq: i64,
	samples: u64,
}
impl NodeCost {
	fn score(&self) -> f32 {
		self.service_ms + self.queue_nq + self.outstanding_nq as f32
	}
}

/// Leader-aware balancer preferring the cheapest candidate per channel.
pub struct LeaderBalancer {
	meta: Arc<dyn MetaCache>,
	connector: Arc<dyn ShardConnector>,
	costs: Arc<DashMap<i64, NodeCost>>,
	smoothing: f32,
}
impl LeaderBalancer {
	pub fn new(
		meta: Arc<dyn MetaCache>,
		connector: Arc<dyn ShardConnector>,
		cfg: &vqp_config::Balancer,
	) -> Self {
		Self { meta, connector, costs: Arc::new(DashMap::new()), smoothing: cfg.cost_smoothing }
	}

	pub fn node_cost(&self, node_id: i64) -> Option<NodeCost> {
		self.costs.get(&node_id).map(|cost| *cost)
	}
}

impl LbPolicy for LeaderBalancer {
	fn execute<'a>(
		&'a self,
		ctx: &'a TaskContext,
		workload: CollectionWorkload,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let leaders = crate::handoff::wait(
				ctx,
				"resolving shard leaders",
				self.meta.shard_leaders(
					&workload.db,
					&workload.collection_name,
					workload.collection_id,
				),
			)
			.await??;

			if leaders.is_empty() {
				return Err(Error::internal(format!(
					"no shard leaders available for collection {}.",
					workload.collection_name
				)));
			}

			let mut set = JoinSet::new();

			for leaders in leaders {
				let channel = ChannelRun {
					meta: self.meta.clone(),
					connector: self.connector.clone(),
					costs: self.costs.clone(),
					work: workload.work.clone(),
					db: workload.db.clone(),
					collection_name: workload.collection_name.clone(),
					collection_id: workload.collection_id,
					nq: workload.nq,
					channel: leaders.channel,
					candidates: leaders.node_ids,
				};

				set.spawn(channel.run());
			}

			loop {
				let joined = tokio::select! {
					biased;
					interrupt = ctx.interrupted() => {
						set.shutdown().await;

						return Err(interrupt.into_error("collecting shard results"));
					},
					joined = set.join_next() => joined,
				};

				match joined {
					None => break,
					Some(Ok(Ok(()))) => {},
					Some(Ok(Err(err))) => {
						set.shutdown().await;

						return Err(err);
					},
					Some(Err(err)) => {
						set.shutdown().await;

						return Err(Error::internal(format!("shard worker did not finish: {err}")));
					},
				}
			}

			Ok(())
		})
	}

	fn update_cost_metrics(&self, node_id: i64, cost: &CostAggregation) {
		let mut entry = self.costs.entry(node_id).or_default();
		let service_ms = cost.service_time_ms as f32;
		let queue_nq = cost.total_nq as f32;

		if entry.samples == 0 {
			entry.service_ms = service_ms;
			entry.queue_nq = queue_nq;
		} else {
			entry.service_ms = self.smoothing * service_ms + (1.0 - self.smoothing) * entry.service_ms;
			entry.queue_nq = self.smoothing * queue_nq + (1.0 - self.smoothing) * entry.queue_nq;
		}

		entry.samples += 1;
	}
}

struct ChannelRun {
	meta: Arc<dyn MetaCache>,
	connector: Arc<dyn ShardConnector>,
	costs: Arc<DashMap<i64, NodeCost>>,
	work: Arc<dyn ShardWork>,
	db: String,
	collection_name: String,
	collection_id: i64,
	nq: i64,
	channel: String,
	candidates: Vec<i64>,
}
impl ChannelRun {
	async fn run(mut self) -> Result<()> {
		let mut excluded = Vec::new();
		let mut stale_retries = 0;

		loop {
			let node_id = pick_node(&self.costs, &self.candidates, &excluded).ok_or_else(|| {
				Error::Shard {
					node_id: excluded.last().copied().unwrap_or(-1),
					message: format!("no shard leader available for channel {}.", self.channel),
				}
			})?;
			let client = self
				.connector
				.connect(node_id)
				.map_err(|err| Error::Shard { node_id, message: err.to_string() })?;

			let outcome = {
				let _outstanding = Outstanding::begin(&self.costs, node_id, self.nq);

				self.work.run(ShardTarget { node_id, channel: self.channel.clone(), client }).await
			};

			match outcome {
				Err(Error::RoutingStale { node_id, channel }) if stale_retries < MAX_STALE_RETRIES => {
					stale_retries += 1;

					tracing::warn!(
						node_id,
						channel = %channel,
						collection_id = self.collection_id,
						"Shard leader moved. Retrying with refreshed routing."
					);

					excluded.push(node_id);

					self.candidates = self
						.meta
						.shard_leaders(&self.db, &self.collection_name, self.collection_id)
						.await?
						.into_iter()
						.find(|leaders| leaders.channel == self.channel)
						.map(|leaders| leaders.node_ids)
						.unwrap_or_default();
				},
				Err(Error::RoutingStale { node_id, channel }) => {
					return Err(Error::Shard {
						node_id,
						message: format!(
							"node {node_id} is still not the leader of channel {channel} after refreshing routing."
						),
					});
				},
				other => return other,
			}
		}
	}
}

/// Query vectors in flight on one node, released on drop so aborted workers settle too.
struct Outstanding {
	costs: Arc<DashMap<i64, NodeCost>>,
	node_id: i64,
	nq: i64,
}
impl Outstanding {
	fn begin(costs: &Arc<DashMap<i64, NodeCost>>, node_id: i64, nq: i64) -> Self {
		costs.entry(node_id).or_default().outstanding_nq += nq;

		Self { costs: costs.clone(), node_id, nq }
	}
}
impl Drop for Outstanding {
	fn drop(&mut self) {
		if let Some(mut cost) = self.costs.get_mut(&self.node_id) {
			cost.outstanding_nq -= self.nq;
		}
	}
}

/// Cheapest candidate not yet excluded, falling back to excluded ones. Ties go to the
/// candidate listed first.
fn pick_node(costs: &DashMap<i64, NodeCost>, candidates: &[i64], excluded: &[i64]) -> Option<i64> {
	let cheapest = |allow_excluded: bool| {
		candidates
			.iter()
			.enumerate()
			.filter(|(_, node_id)| allow_excluded || !excluded.contains(node_id))
			.map(|(rank, node_id)| {
				let score = costs.get(node_id).map(|cost| cost.score()).unwrap_or(0.0);

				(score, rank, *node_id)
			})
			.min_by(|lhs, rhs| lhs.0.total_cmp(&rhs.0).then(lhs.1.cmp(&rhs.1)))
			.map(|(_, _, node_id)| node_id)
	};

	cheapest(false).or_else(|| cheapest(true))
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::{
		CollectionInfo, PartitionInfo, ShardLeaders, ShardQueryRequest, ShardQueryResult,
		ShardSearchRequest, ShardSearchResult, StatusCode,
	};

	struct TwoChannels;
	impl MetaCache for TwoChannels {
		fn collection_info<'a>(
			&'a self,
			_: &'a str,
			_: &'a str,
		) -> BoxFuture<'a, Result<CollectionInfo>> {
			Box::pin(async { Err(Error::not_found("collection docs not found.")) })
		}

		fn partitions<'a>(
			&'a self,
			_: &'a str,
			_: &'a str,
		) -> BoxFuture<'a, Result<Vec<PartitionInfo>>> {
			Box::pin(async { Ok(Vec::new()) })
		}

		fn shard_leaders<'a>(
			&'a self,
			_: &'a str,
			_: &'a str,
			_: i64,
		) -> BoxFuture<'a, Result<Vec<ShardLeaders>>> {
			Box::pin(async {
				Ok(vec![
					ShardLeaders { channel: "dml-0".to_string(), node_ids: vec![1] },
					ShardLeaders { channel: "dml-1".to_string(), node_ids: vec![2] },
				])
			})
		}

		fn deprecate_shard_cache(&self, _: &str, _: &str) {}
	}

	struct Unreachable;
	impl ShardClient for Unreachable {
		fn search<'a>(
			&'a self,
			_: &'a ShardSearchRequest,
		) -> BoxFuture<'a, Result<ShardSearchResult>> {
			Box::pin(async { Err(Error::internal("not connected.")) })
		}

		fn query<'a>(&'a self, _: &'a ShardQueryRequest) -> BoxFuture<'a, Result<ShardQueryResult>> {
			Box::pin(async { Err(Error::internal("not connected.")) })
		}
	}
	impl ShardConnector for Unreachable {
		fn connect(&self, _: i64) -> Result<Arc<dyn ShardClient>> {
			Ok(Arc::new(Unreachable))
		}
	}

	/// Sleeps far past any test deadline, or fails at once on `fail_on`.
	struct Stall {
		fail_on: Option<i64>,
	}
	impl ShardWork for Stall {
		fn run(&self, target: ShardTarget) -> BoxFuture<'static, Result<()>> {
			let fail = self.fail_on == Some(target.node_id);

			Box::pin(async move {
				if fail {
					return Err(Error::Shard {
						node_id: target.node_id,
						message: "segment lost.".to_string(),
					});
				}

				tokio::time::sleep(Duration::from_secs(30)).await;

				Ok(())
			})
		}
	}

	fn balancer() -> LeaderBalancer {
		let cfg = vqp_config::Balancer::default();

		LeaderBalancer::new(Arc::new(TwoChannels), Arc::new(Unreachable), &cfg)
	}

	fn workload(work: Stall) -> CollectionWorkload {
		CollectionWorkload {
			db: "default".to_string(),
			collection_name: "docs".to_string(),
			collection_id: 11,
			nq: 5,
			work: Arc::new(work),
		}
	}

	fn outstanding(balancer: &LeaderBalancer, node_id: i64) -> Option<i64> {
		balancer.node_cost(node_id).map(|cost| cost.outstanding_nq)
	}

	#[test]
	fn picks_cheapest_then_first_listed() {
		let costs = DashMap::new();

		costs.insert(1, NodeCost { service_ms: 40.0, ..NodeCost::default() });
		costs.insert(2, NodeCost { service_ms: 5.0, ..NodeCost::default() });

		assert_eq!(pick_node(&costs, &[1, 2], &[]), Some(2));
		assert_eq!(pick_node(&costs, &[3, 4], &[]), Some(3));
	}

	#[test]
	fn excluded_nodes_are_a_last_resort() {
		let costs = DashMap::new();

		assert_eq!(pick_node(&costs, &[7, 8], &[7]), Some(8));
		assert_eq!(pick_node(&costs, &[7], &[7]), Some(7));
		assert_eq!(pick_node(&costs, &[], &[7]), None);
	}

	#[tokio::test]
	async fn deadline_releases_outstanding_load_of_aborted_workers() {
		let balancer = balancer();
		let ctx = TaskContext::with_timeout(Duration::from_millis(50));
		let err = balancer
			.execute(&ctx, workload(Stall { fail_on: None }))
			.await
			.expect_err("Expected a timeout.");

		assert_eq!(err.status(), StatusCode::Timeout);
		assert_eq!(outstanding(&balancer, 1), Some(0));
		assert_eq!(outstanding(&balancer, 2), Some(0));
	}

	#[tokio::test]
	async fn failed_channel_releases_load_of_its_siblings() {
		let balancer = balancer();
		let err = balancer
			.execute(&TaskContext::new(), workload(Stall { fail_on: Some(1) }))
			.await
			.expect_err("Expected a shard failure.");

		assert_eq!(err.status(), StatusCode::ShardFailure);
		assert_eq!(outstanding(&balancer, 1), Some(0));
		assert_eq!(outstanding(&balancer, 2), Some(0));
	}
}
