//! Guarantee-timestamp resolution and TTL cutoff.

use std::time::Duration;

use vqp_domain::{ConsistencyLevel, Timestamp, tso};

use crate::{Error, Result};

/// Legacy guarantee sentinel meaning "strong".
const LEGACY_STRONG_TS: Timestamp = 0;
/// Legacy guarantee sentinel meaning "bounded".
const LEGACY_BOUNDED_TS: Timestamp = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyInput {
	pub use_default: bool,
	pub requested: ConsistencyLevel,
	pub guarantee_ts: Timestamp,
	pub begin_ts: Timestamp,
	pub graceful_time_ms: u64,
	pub collection_level: ConsistencyLevel,
	pub update_ts: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedConsistency {
	pub level: ConsistencyLevel,
	pub guarantee_ts: Timestamp,
}

/// Whether a task may be stamped from the local clock. `collection_level` is `None` when the
/// collection could not be looked up.
pub fn can_skip_alloc_timestamp(
	use_default: bool,
	requested: ConsistencyLevel,
	guarantee_ts: Timestamp,
	collection_level: Option<ConsistencyLevel>,
) -> bool {
	let level = if use_default {
		match collection_level {
			Some(level) => level,
			None => return false,
		}
	} else {
		if requested == ConsistencyLevel::Strong && guarantee_ts > 0 {
			return true;
		}

		requested
	};

	level != ConsistencyLevel::Strong
}

fn bounded(begin_ts: Timestamp, graceful_time_ms: u64) -> Timestamp {
	let graceful = i64::try_from(graceful_time_ms).unwrap_or(i64::MAX);

	tso::add_physical_ms(begin_ts, -graceful).unwrap_or(tso::MIN_TIMESTAMP).max(tso::MIN_TIMESTAMP)
}

pub fn guarantee_from_level(
	guarantee_ts: Timestamp,
	begin_ts: Timestamp,
	level: ConsistencyLevel,
	graceful_time_ms: u64,
) -> Timestamp {
	match level {
		ConsistencyLevel::Strong => begin_ts,
		ConsistencyLevel::Bounded => bounded(begin_ts, graceful_time_ms),
		ConsistencyLevel::Eventually => tso::MIN_TIMESTAMP,
		ConsistencyLevel::Session | ConsistencyLevel::Customized => guarantee_ts,
	}
}

/// Interprets a guarantee timestamp sent with an explicit strong level by older clients.
pub fn legacy_guarantee(guarantee_ts: Timestamp, begin_ts: Timestamp, graceful_time_ms: u64) -> Timestamp {
	match guarantee_ts {
		LEGACY_STRONG_TS => begin_ts,
		LEGACY_BOUNDED_TS => bounded(begin_ts, graceful_time_ms),
		ts => ts,
	}
}

/// Resolves the level and guarantee timestamp, then raises the guarantee to the collection's
/// last DDL so no read observes an older schema.
pub fn resolve(input: ConsistencyInput) -> ResolvedConsistency {
	let (level, guarantee_ts) = if input.use_default {
		let level = input.collection_level;

		(level, guarantee_from_level(input.guarantee_ts, input.begin_ts, level, input.graceful_time_ms))
	} else if input.requested == ConsistencyLevel::Strong && input.guarantee_ts > 0 {
		(
			input.requested,
			legacy_guarantee(input.guarantee_ts, input.begin_ts, input.graceful_time_ms),
		)
	} else {
		(
			input.requested,
			guarantee_from_level(
				input.guarantee_ts,
				input.begin_ts,
				input.requested,
				input.graceful_time_ms,
			),
		)
	};

	ResolvedConsistency { level, guarantee_ts: guarantee_ts.max(input.update_ts) }
}

/// Rows older than the returned timestamp are expired. Fails when the cutoff cannot be
/// represented below `begin_ts`.
pub fn ttl_cutoff(begin_ts: Timestamp, ttl: Option<Duration>) -> Result<Option<Timestamp>> {
	let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) else {
		return Ok(None);
	};
	let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
	let expire_ms = tso::physical_ms(begin_ts).checked_sub(ttl_ms).ok_or_else(|| {
		Error::internal(format!("ttl timestamp overflow: ttl {ttl_ms} ms exceeds begin timestamp {begin_ts}."))
	})?;
	let cutoff = tso::compose(expire_ms, 0);

	if cutoff > begin_ts {
		return Err(Error::internal(format!(
			"ttl timestamp overflow: cutoff {cutoff} is after begin timestamp {begin_ts}."
		)));
	}

	Ok(Some(cutoff))
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	const BEGIN: Timestamp = 1_700_000_000_000 << tso::LOGICAL_BITS;

	fn input(use_default: bool, requested: ConsistencyLevel, guarantee_ts: Timestamp) -> ConsistencyInput {
		ConsistencyInput {
			use_default,
			requested,
			guarantee_ts,
			begin_ts: BEGIN,
			graceful_time_ms: 5_000,
			collection_level: ConsistencyLevel::Bounded,
			update_ts: 0,
		}
	}

	#[test]
	fn default_consistency_follows_collection_level() {
		let resolved = resolve(input(true, ConsistencyLevel::Strong, 0));

		assert_eq!(resolved.level, ConsistencyLevel::Bounded);
		assert_eq!(tso::physical_ms(resolved.guarantee_ts), tso::physical_ms(BEGIN) - 5_000);
	}

	#[test]
	fn legacy_strong_with_explicit_ts_is_honored() {
		assert_eq!(resolve(input(false, ConsistencyLevel::Strong, 42)).guarantee_ts, 42);
		assert_eq!(
			tso::physical_ms(resolve(input(false, ConsistencyLevel::Strong, 2)).guarantee_ts),
			tso::physical_ms(BEGIN) - 5_000
		);
		assert_eq!(resolve(input(false, ConsistencyLevel::Strong, 0)).guarantee_ts, BEGIN);
	}

	#[test]
	fn eventual_never_blocks_and_session_keeps_caller_ts() {
		assert_eq!(
			resolve(input(false, ConsistencyLevel::Eventually, 0)).guarantee_ts,
			tso::MIN_TIMESTAMP
		);
		assert_eq!(resolve(input(false, ConsistencyLevel::Session, 77)).guarantee_ts, 77);
	}

	#[test]
	fn schema_update_raises_guarantee() {
		let mut raised = input(false, ConsistencyLevel::Eventually, 0);

		raised.update_ts = BEGIN + 10;

		assert_eq!(resolve(raised).guarantee_ts, BEGIN + 10);
	}

	#[test]
	fn skip_allocation_rules() {
		assert!(can_skip_alloc_timestamp(false, ConsistencyLevel::Strong, 5, None));
		assert!(!can_skip_alloc_timestamp(false, ConsistencyLevel::Strong, 0, None));
		assert!(can_skip_alloc_timestamp(false, ConsistencyLevel::Bounded, 0, None));
		assert!(!can_skip_alloc_timestamp(true, ConsistencyLevel::Bounded, 0, None));
		assert!(!can_skip_alloc_timestamp(true, ConsistencyLevel::Eventually, 0, Some(ConsistencyLevel::Strong)));
		assert!(can_skip_alloc_timestamp(true, ConsistencyLevel::Strong, 0, Some(ConsistencyLevel::Session)));
	}

	#[test]
	fn ttl_cutoff_subtracts_physical_time() {
		let cutoff = ttl_cutoff(BEGIN, Some(Duration::from_secs(60)))
			.expect("cutoff failed")
			.expect("cutoff missing");

		assert_eq!(tso::physical_ms(cutoff), tso::physical_ms(BEGIN) - 60_000);
		assert_eq!(tso::logical(cutoff), 0);
		assert_eq!(ttl_cutoff(BEGIN, None).expect("cutoff failed"), None);
	}

	#[test]
	fn ttl_longer_than_clock_overflows() {
		let err = ttl_cutoff(tso::compose(1_000, 0), Some(Duration::from_secs(3_600)))
			.expect_err("Expected overflow.");

		assert!(matches!(err, Error::Internal { .. }));
		assert!(err.to_string().contains("overflow"));
	}

	fn level() -> impl Strategy<Value = ConsistencyLevel> {
		prop_oneof![
			Just(ConsistencyLevel::Strong),
			Just(ConsistencyLevel::Session),
			Just(ConsistencyLevel::Bounded),
			Just(ConsistencyLevel::Eventually),
			Just(ConsistencyLevel::Customized),
		]
	}

	proptest! {
		#[test]
		fn guarantee_is_never_below_schema_update(
			use_default in any::<bool>(),
			requested in level(),
			collection_level in level(),
			guarantee_ts in 0_u64..(1 << 50),
			update_ts in 0_u64..(1 << 50),
			graceful_time_ms in 0_u64..100_000,
		) {
			let resolved = resolve(ConsistencyInput {
				use_default,
				requested,
				guarantee_ts,
				begin_ts: BEGIN,
				graceful_time_ms,
				collection_level,
				update_ts,
			});
			let unraised = resolve(ConsistencyInput {
				use_default,
				requested,
				guarantee_ts,
				begin_ts: BEGIN,
				graceful_time_ms,
				collection_level,
				update_ts: 0,
			});

			prop_assert!(resolved.guarantee_ts >= update_ts);
			prop_assert!(resolved.guarantee_ts >= unraised.guarantee_ts);
			prop_assert_eq!(resolved.guarantee_ts, unraised.guarantee_ts.max(update_ts));
		}
	}
}
