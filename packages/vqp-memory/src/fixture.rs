//! JSON description of a cluster: nodes, collections, channel placement and rows.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use vqp_domain::{CollectionSchema, ConsistencyLevel, DEFAULT_DB_NAME, FieldValue};

use crate::{Error, Result};

fn default_db() -> String {
	DEFAULT_DB_NAME.to_string()
}

fn default_num_partitions() -> usize {
	4
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFixture {
	#[serde(default)]
	pub nodes: Vec<i64>,
	#[serde(default)]
	pub collections: Vec<CollectionFixture>,
}
impl ClusterFixture {
	pub fn from_json(raw: &str) -> Result<Self> {
		Ok(serde_json::from_str(raw)?)
	}

	pub fn load(path: &Path) -> Result<Self> {
		let raw = fs::read_to_string(path)
			.map_err(|source| Error::ReadFixture { path: path.to_path_buf(), source })?;

		Self::from_json(&raw)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionFixture {
	#[serde(default = "default_db")]
	pub db_name: String,
	pub name: String,
	pub collection_id: i64,
	pub schema: CollectionSchema,
	#[serde(default)]
	pub consistency_level: ConsistencyLevel,
	#[serde(default)]
	pub ttl_seconds: Option<u64>,
	#[serde(default)]
	pub partition_key_isolation: bool,
	/// Named partitions; empty means a single `_default` partition. Ignored in partition-key
	/// mode, where `num_partitions` hash buckets are created instead.
	#[serde(default)]
	pub partitions: Vec<String>,
	#[serde(default = "default_num_partitions")]
	pub num_partitions: usize,
	pub channels: Vec<ChannelFixture>,
	#[serde(default)]
	pub rows: Vec<RowFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFixture {
	pub name: String,
	pub leader: i64,
	/// Nodes holding a copy of the channel that can be promoted to leader.
	#[serde(default)]
	pub replicas: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowFixture {
	/// Defaults to a channel chosen from the primary key.
	#[serde(default)]
	pub channel: Option<String>,
	/// Defaults to the first partition; ignored in partition-key mode.
	#[serde(default)]
	pub partition: Option<String>,
	#[serde(default)]
	pub growing: bool,
	/// Values by field name.
	pub values: BTreeMap<String, FieldValue>,
}
