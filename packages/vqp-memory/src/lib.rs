//! In-process implementations of every search collaborator: a metadata catalog with a
//! shard-leader cache, a monotonic timestamp oracle, a JSON filter compiler and brute-force
//! shard nodes, wired together by [`MemoryCluster`].

pub mod catalog;
pub mod cluster;
pub mod compiler;
pub mod error;
pub mod fixture;
pub mod node;
pub mod tso;

pub use catalog::{CollectionEntry, MemoryCatalog};
pub use cluster::MemoryCluster;
pub use compiler::JsonPlanCompiler;
pub use error::{Error, Result};
pub use fixture::{ChannelFixture, ClusterFixture, CollectionFixture, RowFixture};
pub use node::{MemoryNode, StoredRow};
pub use tso::MonotonicTso;
