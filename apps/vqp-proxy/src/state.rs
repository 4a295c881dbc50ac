use std::sync::Arc;

use vqp_memory::MemoryCluster;
use vqp_search::SearchService;

#[derive(Clone)]
pub struct AppState {
	pub service: Arc<SearchService>,
	pub cluster: Arc<MemoryCluster>,
}
impl AppState {
	/// Serves the in-process cluster described by `memory.fixture`, or an empty one.
	pub fn new(config: vqp_config::Config) -> color_eyre::Result<Self> {
		let cluster = match &config.memory.fixture {
			Some(path) => MemoryCluster::load(path)?,
			None => MemoryCluster::new(),
		};

		tracing::info!(fixture = ?config.memory.fixture, "In-memory cluster ready.");

		Ok(Self::from_cluster(cluster, &config))
	}

	pub fn from_cluster(cluster: MemoryCluster, config: &vqp_config::Config) -> Self {
		let collaborators = cluster.collaborators(&config.balancer);
		let service = SearchService::new(config.search.clone(), collaborators);

		Self { service: Arc::new(service), cluster: Arc::new(cluster) }
	}

	pub fn with_service(service: SearchService, cluster: MemoryCluster) -> Self {
		Self { service: Arc::new(service), cluster: Arc::new(cluster) }
	}
}
