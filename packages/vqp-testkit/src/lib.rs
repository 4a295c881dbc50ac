//! Shared fixtures for search tests: a demo cluster, canned configuration, a fault-injecting
//! shard connector and a deterministic stand-in for embedding functions.

mod error;

pub use error::{Error, Result};

use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};

use dashmap::DashMap;

use vqp_domain::{CollectionSchema, FunctionKind};
use vqp_memory::{ClusterFixture, MemoryCluster};
use vqp_search::{
	BoxFuture, FunctionExecutor, InternalSearchRequest, QueryVectors, SearchService, ShardClient,
	ShardConnector, ShardQueryRequest, ShardQueryResult, ShardSearchRequest, ShardSearchResult,
	ShardStatus, search::SearchParams,
};

/// Four collections: `docs` (two channels), `tenants` (partition key with isolation), `hybrid`
/// (dense and sparse vectors) and `articles` (embedding function).
pub const DEMO_FIXTURE: &str = include_str!("../fixtures/demo.json");

pub fn search_config() -> vqp_config::Search {
	vqp_config::Search { task_timeout_ms: 5_000, ..vqp_config::Search::default() }
}

pub fn balancer_config() -> vqp_config::Balancer {
	vqp_config::Balancer::default()
}

pub fn demo_cluster() -> Result<MemoryCluster> {
	let fixture = ClusterFixture::from_json(DEMO_FIXTURE)?;

	Ok(MemoryCluster::from_fixture(&fixture)?)
}

/// A service over `cluster` with the fake embedder installed.
pub fn demo_service(cluster: &MemoryCluster) -> SearchService {
	service_with(cluster, search_config(), Arc::new(cluster.connector()))
}

pub fn service_with(
	cluster: &MemoryCluster,
	cfg: vqp_config::Search,
	connector: Arc<dyn ShardConnector>,
) -> SearchService {
	let collaborators = cluster
		.collaborators_with(&balancer_config(), connector)
		.with_functions(Arc::new(FakeEmbedder::new()));

	SearchService::new(cfg, collaborators)
}

pub fn params(pairs: &[(&str, &str)]) -> SearchParams {
	pairs.iter().map(|(key, value)| (key.to_string(), value.to_string())).collect()
}

pub fn float_queries(rows: &[&[f32]]) -> QueryVectors {
	QueryVectors::Float(rows.iter().map(|row| row.to_vec()).collect())
}

#[derive(Debug, Clone)]
pub enum Fault {
	/// Holds every call for the given time before forwarding it.
	Delay(Duration),
	/// Fails every call at the transport level.
	Transport(String),
	/// Answers every call as a node that no longer leads the channel.
	NotLeader,
}

/// Wraps a connector and applies per-node faults at call time.
pub struct FaultyConnector {
	inner: Arc<dyn ShardConnector>,
	faults: Arc<DashMap<i64, Fault>>,
	calls: Arc<DashMap<i64, usize>>,
}
impl FaultyConnector {
	pub fn new(inner: Arc<dyn ShardConnector>) -> Self {
		Self { inner, faults: Arc::new(DashMap::new()), calls: Arc::new(DashMap::new()) }
	}

	pub fn inject(&self, node_id: i64, fault: Fault) {
		self.faults.insert(node_id, fault);
	}

	pub fn clear(&self, node_id: i64) {
		self.faults.remove(&node_id);
	}

	/// Search and query calls that reached `node_id`, faulted or not.
	pub fn calls(&self, node_id: i64) -> usize {
		self.calls.get(&node_id).map(|calls| *calls).unwrap_or(0)
	}
}

impl ShardConnector for FaultyConnector {
	fn connect(&self, node_id: i64) -> vqp_search::Result<Arc<dyn ShardClient>> {
		let inner = self.inner.connect(node_id)?;

		Ok(Arc::new(FaultyClient {
			node_id,
			inner,
			faults: self.faults.clone(),
			calls: self.calls.clone(),
		}))
	}
}

struct FaultyClient {
	node_id: i64,
	inner: Arc<dyn ShardClient>,
	faults: Arc<DashMap<i64, Fault>>,
	calls: Arc<DashMap<i64, usize>>,
}
impl FaultyClient {
	fn begin_call(&self) -> Option<Fault> {
		*self.calls.entry(self.node_id).or_insert(0) += 1;

		self.faults.get(&self.node_id).map(|fault| fault.clone())
	}
}

impl ShardClient for FaultyClient {
	fn search<'a>(
		&'a self,
		req: &'a ShardSearchRequest,
	) -> BoxFuture<'a, vqp_search::Result<ShardSearchResult>> {
		Box::pin(async move {
			let channel = req.dml_channels.first().cloned().unwrap_or_default();

			match self.begin_call() {
				None => self.inner.search(req).await,
				Some(Fault::Delay(delay)) => {
					tokio::time::sleep(delay).await;

					self.inner.search(req).await
				},
				Some(Fault::Transport(message)) =>
					Err(vqp_search::Error::Rpc { node_id: self.node_id, message }),
				Some(Fault::NotLeader) =>
					Ok(ShardSearchResult::failed(self.node_id, &channel, ShardStatus::NotShardLeader)),
			}
		})
	}

	fn query<'a>(
		&'a self,
		req: &'a ShardQueryRequest,
	) -> BoxFuture<'a, vqp_search::Result<ShardQueryResult>> {
		Box::pin(async move {
			let channel = req.dml_channels.first().cloned().unwrap_or_default();

			match self.begin_call() {
				None => self.inner.query(req).await,
				Some(Fault::Delay(delay)) => {
					tokio::time::sleep(delay).await;

					self.inner.query(req).await
				},
				Some(Fault::Transport(message)) =>
					Err(vqp_search::Error::Rpc { node_id: self.node_id, message }),
				Some(Fault::NotLeader) => Ok(ShardQueryResult {
					status: ShardStatus::NotShardLeader,
					source_node_id: self.node_id,
					channel,
					ids: Vec::new(),
					fields_data: Vec::new(),
					cost: Default::default(),
				}),
			}
		})
	}
}

/// Embeds text queries as `[characters, 1.0]` for fields fed by a text-embedding function.
#[derive(Debug, Default)]
pub struct FakeEmbedder {
	calls: AtomicUsize,
}
impl FakeEmbedder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

impl FunctionExecutor for FakeEmbedder {
	fn process_search<'a>(
		&'a self,
		schema: &'a CollectionSchema,
		req: &'a mut InternalSearchRequest,
	) -> BoxFuture<'a, vqp_search::Result<()>> {
		Box::pin(async move {
			self.calls.fetch_add(1, Ordering::SeqCst);

			if req.sub_reqs.is_empty() {
				embed(schema, req.field_id, &mut req.placeholder)?;
			} else {
				for sub in &mut req.sub_reqs {
					embed(schema, sub.field_id, &mut sub.placeholder)?;
				}
			}

			Ok(())
		})
	}
}

fn embed(
	schema: &CollectionSchema,
	field_id: i64,
	placeholder: &mut QueryVectors,
) -> vqp_search::Result<()> {
	let Some(field) = schema.field_by_id(field_id) else {
		return Ok(());
	};
	let embedded = schema
		.functions
		.iter()
		.filter(|function| function.kind == FunctionKind::TextEmbedding)
		.any(|function| function.output_field_names.contains(&field.name));

	if !embedded {
		return Ok(());
	}

	let QueryVectors::Text(texts) = placeholder else {
		return Err(vqp_search::Error::invalid(format!(
			"field {} is produced by an embedding function and expects text queries.",
			field.name
		)));
	};
	let vectors = texts.iter().map(|text| vec![text.chars().count() as f32, 1.0]).collect();

	*placeholder = QueryVectors::Float(vectors);

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn demo_fixture_builds() {
		let cluster = demo_cluster().expect("Failed to build demo cluster.");

		for node_id in [1, 2, 3] {
			assert!(cluster.node(node_id).is_some());
		}
	}
}
