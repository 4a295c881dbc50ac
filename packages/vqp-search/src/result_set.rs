//! Unordered partial-result collection shared by concurrent shard workers.
//!
//! Workers append, the reducer takes everything once the scatter phase has returned. At most
//! one result per channel is kept so a retried delivery cannot double count a shard.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::request::{ShardQueryResult, ShardSearchResult};

pub trait ChannelScoped {
	fn channel(&self) -> &str;
}
impl ChannelScoped for ShardSearchResult {
	fn channel(&self) -> &str {
		&self.channel
	}
}
impl ChannelScoped for ShardQueryResult {
	fn channel(&self) -> &str {
		&self.channel
	}
}

#[derive(Debug)]
pub struct ResultSet<T> {
	inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
	items: Vec<T>,
	channels: HashSet<String>,
	duplicates: usize,
}

impl<T> ResultSet<T>
where
	T: ChannelScoped,
{
	pub fn new() -> Self {
		Self { inner: Mutex::new(Inner { items: Vec::new(), channels: HashSet::new(), duplicates: 0 }) }
	}

	/// Returns false when a result for the same channel is already present.
	pub fn insert(&self, item: T) -> bool {
		let mut inner = self.inner.lock();

		if !inner.channels.insert(item.channel().to_string()) {
			inner.duplicates += 1;

			return false;
		}

		inner.items.push(item);

		true
	}

	pub fn len(&self) -> usize {
		self.inner.lock().items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn duplicates(&self) -> usize {
		self.inner.lock().duplicates
	}

	/// Removes every collected result, ordered by channel.
	pub fn take_sorted(&self) -> Vec<T> {
		let mut inner = self.inner.lock();
		let mut items = std::mem::take(&mut inner.items);

		inner.channels.clear();
		items.sort_by(|lhs, rhs| lhs.channel().cmp(rhs.channel()));

		items
	}
}

impl<T> Default for ResultSet<T>
where
	T: ChannelScoped,
{
	fn default() -> Self {
		Self::new()
	}
}
