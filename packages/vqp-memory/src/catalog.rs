//! Collection metadata with a shard-leader cache in front of the authoritative routing table.

use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
};

use dashmap::DashMap;
use parking_lot::RwLock;

use vqp_search::{BoxFuture, CollectionInfo, Error, MetaCache, PartitionInfo, Result, ShardLeaders};

type CollectionKey = (String, String);

#[derive(Debug, Clone)]
pub struct CollectionEntry {
	pub info: CollectionInfo,
	/// Ordered; in partition-key mode these are the hash buckets.
	pub partitions: Vec<PartitionInfo>,
	pub leaders: Vec<ShardLeaders>,
}

#[derive(Default)]
pub struct MemoryCatalog {
	collections: RwLock<HashMap<CollectionKey, CollectionEntry>>,
	leader_cache: DashMap<CollectionKey, Arc<Vec<ShardLeaders>>>,
	deprecations: AtomicUsize,
	leader_lookups: AtomicUsize,
}
impl MemoryCatalog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, db: &str, name: &str, entry: CollectionEntry) {
		let key = (db.to_string(), name.to_string());

		self.leader_cache.remove(&key);
		self.collections.write().insert(key, entry);
	}

	/// Changes the authoritative leaders of one channel. Cached routing is left untouched, the
	/// way a leadership change looks to a front end that has not noticed it yet.
	pub fn set_leaders(&self, db: &str, name: &str, channel: &str, node_ids: Vec<i64>) -> Result<()> {
		let mut collections = self.collections.write();
		let entry = collections
			.get_mut(&(db.to_string(), name.to_string()))
			.ok_or_else(|| Error::not_found(format!("collection {name} not found in {db}.")))?;

		match entry.leaders.iter_mut().find(|leaders| leaders.channel == channel) {
			Some(leaders) => leaders.node_ids = node_ids,
			None => entry.leaders.push(ShardLeaders { channel: channel.to_string(), node_ids }),
		}

		Ok(())
	}

	pub fn entry(&self, db: &str, name: &str) -> Option<CollectionEntry> {
		self.collections.read().get(&(db.to_string(), name.to_string())).cloned()
	}

	pub fn deprecations(&self) -> usize {
		self.deprecations.load(Ordering::SeqCst)
	}

	/// Times the authoritative routing table was consulted because the cache missed.
	pub fn leader_lookups(&self) -> usize {
		self.leader_lookups.load(Ordering::SeqCst)
	}

	fn lookup(&self, db: &str, name: &str) -> Result<CollectionEntry> {
		self.entry(db, name)
			.ok_or_else(|| Error::not_found(format!("collection {name} not found in database {db}.")))
	}
}

impl MetaCache for MemoryCatalog {
	fn collection_info<'a>(
		&'a self,
		db: &'a str,
		collection: &'a str,
	) -> BoxFuture<'a, Result<CollectionInfo>> {
		Box::pin(async move { self.lookup(db, collection).map(|entry| entry.info) })
	}

	fn partitions<'a>(
		&'a self,
		db: &'a str,
		collection: &'a str,
	) -> BoxFuture<'a, Result<Vec<PartitionInfo>>> {
		Box::pin(async move { self.lookup(db, collection).map(|entry| entry.partitions) })
	}

	fn shard_leaders<'a>(
		&'a self,
		db: &'a str,
		collection: &'a str,
		collection_id: i64,
	) -> BoxFuture<'a, Result<Vec<ShardLeaders>>> {
		Box::pin(async move {
			let key = (db.to_string(), collection.to_string());

			if let Some(cached) = self.leader_cache.get(&key) {
				return Ok(cached.as_ref().clone());
			}

			let entry = self.lookup(db, collection)?;

			if entry.info.collection_id != collection_id {
				return Err(Error::not_found(format!(
					"collection {collection} was recreated: id {} no longer matches {collection_id}.",
					entry.info.collection_id
				)));
			}

			self.leader_lookups.fetch_add(1, Ordering::SeqCst);
			self.leader_cache.insert(key, Arc::new(entry.leaders.clone()));

			Ok(entry.leaders)
		})
	}

	fn deprecate_shard_cache(&self, db: &str, collection: &str) {
		self.deprecations.fetch_add(1, Ordering::SeqCst);
		self.leader_cache.remove(&(db.to_string(), collection.to_string()));

		tracing::debug!(db, collection, "Shard leader cache deprecated.");
	}
}

#[cfg(test)]
mod tests {
	use vqp_domain::{CollectionSchema, ConsistencyLevel};

	use super::*;

	fn entry() -> CollectionEntry {
		CollectionEntry {
			info: CollectionInfo {
				collection_id: 7,
				schema: Arc::new(CollectionSchema {
					name: "docs".to_string(),
					fields: Vec::new(),
					functions: Vec::new(),
					enable_dynamic_field: false,
				}),
				consistency_level: ConsistencyLevel::Bounded,
				ttl: None,
				update_timestamp: 0,
				partition_key_isolation: false,
			},
			partitions: vec![PartitionInfo { name: "_default".to_string(), partition_id: 1 }],
			leaders: vec![ShardLeaders { channel: "dml-0".to_string(), node_ids: vec![1] }],
		}
	}

	#[tokio::test]
	async fn cached_leaders_survive_until_deprecated() {
		let catalog = MemoryCatalog::new();

		catalog.register("default", "docs", entry());

		let first = catalog.shard_leaders("default", "docs", 7).await.expect("lookup failed");

		catalog.set_leaders("default", "docs", "dml-0", vec![2]).expect("set leaders failed");

		let cached = catalog.shard_leaders("default", "docs", 7).await.expect("lookup failed");

		assert_eq!(first, cached);
		assert_eq!(catalog.leader_lookups(), 1);

		catalog.deprecate_shard_cache("default", "docs");

		let fresh = catalog.shard_leaders("default", "docs", 7).await.expect("lookup failed");

		assert_eq!(fresh[0].node_ids, vec![2]);
		assert_eq!(catalog.deprecations(), 1);
		assert_eq!(catalog.leader_lookups(), 2);
	}

	#[tokio::test]
	async fn unknown_collection_is_not_found() {
		let catalog = MemoryCatalog::new();
		let err = catalog.collection_info("default", "missing").await.expect_err("expected error");

		assert_eq!(err.status(), vqp_search::StatusCode::NotFound);
	}
}
