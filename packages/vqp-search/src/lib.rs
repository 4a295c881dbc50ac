pub mod balancer;
pub mod error;
pub mod handoff;
pub mod request;
pub mod result_set;
pub mod search;
pub mod task;

use std::{
	collections::BTreeMap,
	future::Future,
	pin::Pin,
	sync::Arc,
	time::Duration,
};

use vqp_domain::{
	CollectionSchema, ConsistencyLevel, FieldValue, Timestamp,
	plan::{PlanNode, QueryInfo},
};

pub use balancer::{CollectionWorkload, LbPolicy, LeaderBalancer, ShardTarget, ShardWork};
pub use error::{Error, Result, StatusCode};
pub use handoff::{Interrupt, TaskContext};
pub use request::{
	CostAggregation, InternalSearchRequest, LegHits, QueryVectors, ShardQueryRequest,
	ShardQueryResult, ShardSearchRequest, ShardSearchResult, ShardStatus, SubSearchRequest,
};
pub use result_set::ResultSet;
pub use search::{
	FunctionScoreSpec, IterateSummary, IteratorResults, RerankFunctionSpec, SearchRequest,
	SearchResults, SubSearch,
};
pub use task::{IdAllocator, Task};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct CollectionInfo {
	pub collection_id: i64,
	pub schema: Arc<CollectionSchema>,
	pub consistency_level: ConsistencyLevel,
	pub ttl: Option<Duration>,
	/// Timestamp of the most recent DDL against the collection.
	pub update_timestamp: Timestamp,
	pub partition_key_isolation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
	pub name: String,
	pub partition_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLeaders {
	pub channel: String,
	/// Candidate leader nodes, best first.
	pub node_ids: Vec<i64>,
}

pub struct CompileInput<'a> {
	pub schema: &'a CollectionSchema,
	pub dsl: &'a str,
	pub anns_field: &'a str,
	pub query_info: QueryInfo,
	pub template_values: &'a BTreeMap<String, FieldValue>,
}

pub trait MetaCache
where
	Self: Send + Sync,
{
	fn collection_info<'a>(
		&'a self,
		db: &'a str,
		collection: &'a str,
	) -> BoxFuture<'a, Result<CollectionInfo>>;

	/// Partitions in a stable order; in partition-key mode these are the hash buckets.
	fn partitions<'a>(
		&'a self,
		db: &'a str,
		collection: &'a str,
	) -> BoxFuture<'a, Result<Vec<PartitionInfo>>>;

	fn shard_leaders<'a>(
		&'a self,
		db: &'a str,
		collection: &'a str,
		collection_id: i64,
	) -> BoxFuture<'a, Result<Vec<ShardLeaders>>>;

	/// Drops cached shard routing for the collection. Never blocks.
	fn deprecate_shard_cache(&self, db: &str, collection: &str);
}

pub trait PlanCompiler
where
	Self: Send + Sync,
{
	fn compile(&self, input: CompileInput<'_>) -> Result<PlanNode>;
}

/// Runs schema functions (embeddings and the like) over query payloads before fan-out.
pub trait FunctionExecutor
where
	Self: Send + Sync,
{
	fn process_search<'a>(
		&'a self,
		schema: &'a CollectionSchema,
		req: &'a mut InternalSearchRequest,
	) -> BoxFuture<'a, Result<()>>;
}

pub trait ShardClient
where
	Self: Send + Sync,
{
	fn search<'a>(&'a self, req: &'a ShardSearchRequest) -> BoxFuture<'a, Result<ShardSearchResult>>;

	fn query<'a>(&'a self, req: &'a ShardQueryRequest) -> BoxFuture<'a, Result<ShardQueryResult>>;
}

pub trait ShardConnector
where
	Self: Send + Sync,
{
	fn connect(&self, node_id: i64) -> Result<Arc<dyn ShardClient>>;
}

pub trait Tso
where
	Self: Send + Sync,
{
	fn allocate(&self) -> BoxFuture<'_, Result<Timestamp>>;
}

#[derive(Clone)]
pub struct Collaborators {
	pub meta: Arc<dyn MetaCache>,
	pub compiler: Arc<dyn PlanCompiler>,
	pub functions: Arc<dyn FunctionExecutor>,
	pub balancer: Arc<dyn LbPolicy>,
	pub tso: Arc<dyn Tso>,
}
impl Collaborators {
	/// Collaborators without a function executor; searches that need one are rejected.
	pub fn new(
		meta: Arc<dyn MetaCache>,
		compiler: Arc<dyn PlanCompiler>,
		balancer: Arc<dyn LbPolicy>,
		tso: Arc<dyn Tso>,
	) -> Self {
		Self { meta, compiler, functions: Arc::new(NoFunctions), balancer, tso }
	}

	pub fn with_functions(mut self, functions: Arc<dyn FunctionExecutor>) -> Self {
		self.functions = functions;

		self
	}
}

struct NoFunctions;
impl FunctionExecutor for NoFunctions {
	fn process_search<'a>(
		&'a self,
		schema: &'a CollectionSchema,
		_: &'a mut InternalSearchRequest,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			Err(Error::invalid(format!(
				"collection {} declares functions but no function executor is configured.",
				schema.name
			)))
		})
	}
}

pub struct SearchService {
	pub cfg: Arc<vqp_config::Search>,
	pub collaborators: Collaborators,
	/// Identity stamped into outgoing requests as their source.
	pub node_id: i64,
	ids: IdAllocator,
}
impl SearchService {
	pub fn new(cfg: vqp_config::Search, collaborators: Collaborators) -> Self {
		Self { cfg: Arc::new(cfg), collaborators, node_id: 0, ids: IdAllocator::default() }
	}

	pub fn with_node_id(mut self, node_id: i64) -> Self {
		self.node_id = node_id;

		self
	}
}
