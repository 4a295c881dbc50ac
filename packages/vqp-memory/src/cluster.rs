//! Wires catalog, oracle, compiler and nodes into one in-process cluster.

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use dashmap::DashMap;

use vqp_domain::{FieldValue, PrimaryKey};
use vqp_search::{
	CollectionInfo, Collaborators, LeaderBalancer, PartitionInfo, ShardClient, ShardConnector,
	ShardLeaders, search::hash_partition_keys,
};

use crate::{
	CollectionEntry, Error, JsonPlanCompiler, MemoryCatalog, MemoryNode, MonotonicTso, Result,
	StoredRow,
	fixture::{ClusterFixture, CollectionFixture, RowFixture},
};

type ChannelKey = (i64, String);

#[derive(Default)]
pub struct MemoryCluster {
	catalog: Arc<MemoryCatalog>,
	tso: Arc<MonotonicTso>,
	nodes: Arc<DashMap<i64, Arc<MemoryNode>>>,
	replicas: DashMap<ChannelKey, Vec<i64>>,
}
impl MemoryCluster {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_fixture(fixture: &ClusterFixture) -> Result<Self> {
		let cluster = Self::new();

		for node_id in &fixture.nodes {
			cluster.add_node(*node_id);
		}
		for collection in &fixture.collections {
			cluster.create_collection(collection)?;
		}

		Ok(cluster)
	}

	pub fn load(path: &Path) -> Result<Self> {
		Self::from_fixture(&ClusterFixture::load(path)?)
	}

	pub fn add_node(&self, node_id: i64) -> Arc<MemoryNode> {
		self.nodes.entry(node_id).or_insert_with(|| Arc::new(MemoryNode::new(node_id))).clone()
	}

	pub fn node(&self, node_id: i64) -> Option<Arc<MemoryNode>> {
		self.nodes.get(&node_id).map(|node| node.clone())
	}

	pub fn catalog(&self) -> Arc<MemoryCatalog> {
		self.catalog.clone()
	}

	pub fn tso(&self) -> Arc<MonotonicTso> {
		self.tso.clone()
	}

	pub fn connector(&self) -> NodeConnector {
		NodeConnector { nodes: self.nodes.clone() }
	}

	/// Collaborators routing through this cluster's own nodes.
	pub fn collaborators(&self, cfg: &vqp_config::Balancer) -> Collaborators {
		self.collaborators_with(cfg, Arc::new(self.connector()))
	}

	/// Collaborators routing through `connector`, e.g. one that injects faults.
	pub fn collaborators_with(
		&self,
		cfg: &vqp_config::Balancer,
		connector: Arc<dyn ShardConnector>,
	) -> Collaborators {
		let balancer = LeaderBalancer::new(self.catalog.clone(), connector, cfg);

		Collaborators::new(
			self.catalog.clone(),
			Arc::new(JsonPlanCompiler),
			Arc::new(balancer),
			self.tso.clone(),
		)
	}

	pub fn create_collection(&self, fixture: &CollectionFixture) -> Result<()> {
		let schema = Arc::new(fixture.schema.clone());

		if schema.primary_field().is_none() {
			return Err(Error::fixture(format!("collection {} has no primary key.", fixture.name)));
		}
		if fixture.channels.is_empty() {
			return Err(Error::fixture(format!("collection {} has no channels.", fixture.name)));
		}

		let partitions: Vec<PartitionInfo> = if schema.partition_key_field().is_some() {
			(0..fixture.num_partitions.max(1))
				.map(|idx| PartitionInfo {
					name: format!("_default_{idx}"),
					partition_id: fixture.collection_id * 1_000 + idx as i64,
				})
				.collect()
		} else if fixture.partitions.is_empty() {
			vec![PartitionInfo {
				name: "_default".to_string(),
				partition_id: fixture.collection_id * 1_000,
			}]
		} else {
			fixture
				.partitions
				.iter()
				.enumerate()
				.map(|(idx, name)| PartitionInfo {
					name: name.clone(),
					partition_id: fixture.collection_id * 1_000 + idx as i64,
				})
				.collect()
		};
		let mut leaders = Vec::with_capacity(fixture.channels.len());

		for channel in &fixture.channels {
			let mut holders = vec![channel.leader];

			holders.extend(
				channel.replicas.iter().copied().filter(|node_id| *node_id != channel.leader),
			);

			for node_id in &holders {
				self.add_node(*node_id);
			}

			self.add_node(channel.leader).lead(&channel.name);
			self.replicas.insert((fixture.collection_id, channel.name.clone()), holders);

			leaders.push(ShardLeaders { channel: channel.name.clone(), node_ids: vec![channel.leader] });
		}

		let info = CollectionInfo {
			collection_id: fixture.collection_id,
			schema,
			consistency_level: fixture.consistency_level,
			ttl: fixture.ttl_seconds.map(Duration::from_secs),
			update_timestamp: self.tso.next(),
			partition_key_isolation: fixture.partition_key_isolation,
		};

		self.catalog.register(&fixture.db_name, &fixture.name, CollectionEntry {
			info,
			partitions,
			leaders,
		});
		self.insert(&fixture.db_name, &fixture.name, &fixture.rows)?;

		tracing::debug!(
			collection = fixture.name.as_str(),
			collection_id = fixture.collection_id,
			channels = fixture.channels.len(),
			rows = fixture.rows.len(),
			"In-memory collection created."
		);

		Ok(())
	}

	/// Inserts rows, stamping each with a fresh timestamp. Returns the number of rows written.
	pub fn insert(&self, db: &str, name: &str, rows: &[RowFixture]) -> Result<usize> {
		let entry = self
			.catalog
			.entry(db, name)
			.ok_or_else(|| Error::fixture(format!("collection {name} not found in {db}.")))?;
		let schema = entry.info.schema.clone();
		let collection_id = entry.info.collection_id;
		let mut by_channel: HashMap<String, Vec<StoredRow>> = HashMap::new();

		for row in rows {
			let mut values = HashMap::with_capacity(row.values.len());

			for (field_name, value) in &row.values {
				let field = schema.field_by_name(field_name).ok_or_else(|| {
					Error::fixture(format!("field {field_name} not found in {name}."))
				})?;

				values.insert(field.field_id, value.clone());
			}

			let pk = primary_key(&schema, &values)?;
			let partition_id = self.partition_for(&entry, &values, row.partition.as_deref())?;
			let channel = match &row.channel {
				Some(channel) => channel.clone(),
				None => channel_for(&pk, &entry.leaders),
			};

			by_channel.entry(channel).or_default().push(StoredRow {
				pk,
				partition_id,
				insert_ts: self.tso.next(),
				growing: row.growing,
				values,
			});
		}

		let mut written = 0;

		for (channel, rows) in by_channel {
			let holders = self
				.replicas
				.get(&(collection_id, channel.clone()))
				.map(|holders| holders.clone())
				.ok_or_else(|| Error::fixture(format!("channel {channel} not found in {name}.")))?;

			written += rows.len();

			for node_id in holders {
				self.add_node(node_id).load(collection_id, &channel, schema.clone(), rows.clone());
			}
		}

		Ok(written)
	}

	/// Moves leadership of `channel` to `node_id` on the nodes and in the catalog, leaving the
	/// front end's cached routing stale.
	pub fn promote(&self, db: &str, name: &str, channel: &str, node_id: i64) -> Result<()> {
		let entry = self
			.catalog
			.entry(db, name)
			.ok_or_else(|| Error::fixture(format!("collection {name} not found in {db}.")))?;
		let holders = self
			.replicas
			.get(&(entry.info.collection_id, channel.to_string()))
			.map(|holders| holders.clone())
			.unwrap_or_default();

		if !holders.contains(&node_id) {
			return Err(Error::fixture(format!("node {node_id} holds no replica of {channel}.")));
		}

		for holder in &holders {
			if let Some(node) = self.node(*holder) {
				node.resign(channel);
			}
		}

		self.add_node(node_id).lead(channel);
		self.catalog.set_leaders(db, name, channel, vec![node_id])?;

		Ok(())
	}

	fn partition_for(
		&self,
		entry: &CollectionEntry,
		values: &HashMap<i64, FieldValue>,
		partition: Option<&str>,
	) -> Result<i64> {
		if let Some(key_field) = entry.info.schema.partition_key_field() {
			let key = values.get(&key_field.field_id).ok_or_else(|| {
				Error::fixture(format!("row is missing partition key {}.", key_field.name))
			})?;
			let ids = hash_partition_keys(std::slice::from_ref(key), &entry.partitions)?;

			return ids
				.first()
				.copied()
				.ok_or_else(|| Error::fixture("partition key hashed to no partition."));
		}

		match partition {
			Some(name) => entry
				.partitions
				.iter()
				.find(|partition| partition.name == name)
				.map(|partition| partition.partition_id)
				.ok_or_else(|| Error::fixture(format!("partition {name} not found."))),
			None => entry
				.partitions
				.first()
				.map(|partition| partition.partition_id)
				.ok_or_else(|| Error::fixture("collection has no partitions.")),
		}
	}
}

/// Hands out clients for the cluster's nodes.
#[derive(Clone)]
pub struct NodeConnector {
	nodes: Arc<DashMap<i64, Arc<MemoryNode>>>,
}

impl ShardConnector for NodeConnector {
	fn connect(&self, node_id: i64) -> vqp_search::Result<Arc<dyn ShardClient>> {
		let node = self.nodes.get(&node_id).map(|node| node.clone()).ok_or_else(|| {
			vqp_search::Error::Rpc { node_id, message: "node is not reachable.".to_string() }
		})?;

		Ok(node)
	}
}

fn primary_key(
	schema: &vqp_domain::CollectionSchema,
	values: &HashMap<i64, FieldValue>,
) -> Result<PrimaryKey> {
	let field = schema
		.primary_field()
		.ok_or_else(|| Error::fixture(format!("collection {} has no primary key.", schema.name)))?;

	match values.get(&field.field_id) {
		Some(FieldValue::Int(value)) => Ok(PrimaryKey::Int(*value)),
		Some(FieldValue::Str(value)) => Ok(PrimaryKey::Str(value.clone())),
		_ => Err(Error::fixture(format!("row has no usable primary key {}.", field.name))),
	}
}

fn channel_for(pk: &PrimaryKey, leaders: &[ShardLeaders]) -> String {
	let slot = match pk {
		PrimaryKey::Int(value) => value.unsigned_abs(),
		PrimaryKey::Str(value) => value.bytes().map(u64::from).sum(),
	};

	leaders[(slot % leaders.len() as u64) as usize].channel.clone()
}
