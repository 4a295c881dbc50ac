//! Hybrid logical timestamps: physical milliseconds in the high bits, an 18-bit logical
//! counter in the low bits.

use time::OffsetDateTime;

pub type Timestamp = u64;

pub const LOGICAL_BITS: u32 = 18;
pub const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;
/// Smallest non-zero timestamp; reads guaranteed at this point never wait.
pub const MIN_TIMESTAMP: Timestamp = 1;

pub fn compose(physical_ms: u64, logical: u64) -> Timestamp {
	(physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK)
}

pub fn physical_ms(ts: Timestamp) -> u64 {
	ts >> LOGICAL_BITS
}

pub fn logical(ts: Timestamp) -> u64 {
	ts & LOGICAL_MASK
}

pub fn compose_from_time(at: OffsetDateTime) -> Timestamp {
	let millis = at.unix_timestamp_nanos() / 1_000_000;

	compose(u64::try_from(millis).unwrap_or(0), 0)
}

pub fn now() -> Timestamp {
	compose_from_time(OffsetDateTime::now_utc())
}

/// Shifts the physical part by `delta_ms`, keeping the logical part. `None` when the physical
/// clock would leave the representable range.
pub fn add_physical_ms(ts: Timestamp, delta_ms: i64) -> Option<Timestamp> {
	let physical = physical_ms(ts);
	let shifted = if delta_ms >= 0 {
		physical.checked_add(delta_ms.unsigned_abs())?
	} else {
		physical.checked_sub(delta_ms.unsigned_abs())?
	};

	if shifted > (u64::MAX >> LOGICAL_BITS) {
		return None;
	}

	Some(compose(shifted, logical(ts)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn compose_round_trips_parts() {
		let ts = compose(1_700_000_000_000, 42);

		assert_eq!(physical_ms(ts), 1_700_000_000_000);
		assert_eq!(logical(ts), 42);
	}

	#[test]
	fn add_physical_detects_underflow() {
		let ts = compose(10, 3);

		assert_eq!(add_physical_ms(ts, -4), Some(compose(6, 3)));
		assert_eq!(add_physical_ms(ts, -11), None);
	}

	#[test]
	fn now_is_after_2020() {
		assert!(physical_ms(now()) > 1_577_836_800_000);
	}
}
