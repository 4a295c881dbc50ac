//! Partition routing from filter expressions.

use std::collections::BTreeSet;

use vqp_domain::{
	FieldValue,
	plan::{CompareOp, Expr},
};

use crate::{Error, PartitionInfo, Result};

/// Partition-key values a filter restricts rows to. Empty means "any partition".
pub fn partition_keys(expr: &Expr) -> Vec<FieldValue> {
	collect_keys(expr).unwrap_or_default()
}

fn collect_keys(expr: &Expr) -> Option<Vec<FieldValue>> {
	match expr {
		Expr::Compare { column, op: CompareOp::Eq, value } if column.is_partition_key =>
			Some(vec![value.clone()]),
		Expr::Term { column, values } if column.is_partition_key => Some(values.clone()),
		Expr::And(lhs, rhs) => match (collect_keys(lhs), collect_keys(rhs)) {
			(Some(mut lhs), Some(rhs)) => {
				lhs.extend(rhs);

				Some(lhs)
			},
			(Some(keys), None) | (None, Some(keys)) => Some(keys),
			(None, None) => None,
		},
		Expr::Or(lhs, rhs) => {
			let mut keys = collect_keys(lhs)?;

			keys.extend(collect_keys(rhs)?);

			Some(keys)
		},
		_ => None,
	}
}

/// Checks that `expr` pins exactly one partition-key value through a single equality.
pub fn validate_partition_key_isolation(expr: Option<&Expr>) -> Result<()> {
	let pinned = match expr {
		Some(expr) => isolation_predicates(expr)?,
		None => false,
	};

	if !pinned {
		return Err(Error::invalid(
			"partition key isolation requires an equality filter on the partition key.",
		));
	}

	Ok(())
}

/// Returns whether `expr` contains a partition-key predicate, rejecting shapes that could
/// span more than one key.
fn isolation_predicates(expr: &Expr) -> Result<bool> {
	match expr {
		Expr::AlwaysTrue => Ok(false),
		Expr::Compare { column, op, .. } if column.is_partition_key => match op {
			CompareOp::Eq => Ok(true),
			op => Err(Error::invalid(format!(
				"partition key isolation does not support the {} operator on the partition key.",
				op.as_str()
			))),
		},
		Expr::Compare { .. } => Ok(false),
		Expr::Term { column, .. } if column.is_partition_key => Err(Error::invalid(
			"partition key isolation does not support IN on the partition key.",
		)),
		Expr::Term { .. } => Ok(false),
		Expr::And(lhs, rhs) => {
			let lhs = isolation_predicates(lhs)?;
			let rhs = isolation_predicates(rhs)?;

			if lhs && rhs {
				return Err(Error::invalid(
					"partition key isolation does not support multiple partition key predicates.",
				));
			}

			Ok(lhs || rhs)
		},
		Expr::Or(lhs, rhs) => {
			if isolation_predicates(lhs)? || isolation_predicates(rhs)? {
				return Err(Error::invalid(
					"partition key isolation does not support OR on the partition key.",
				));
			}

			Ok(false)
		},
		Expr::Not(inner) => {
			if isolation_predicates(inner)? {
				return Err(Error::invalid(
					"partition key isolation does not support NOT on the partition key.",
				));
			}

			Ok(false)
		},
	}
}

/// Hashes partition-key values onto the ordered bucket list, returning sorted unique ids.
pub fn hash_partition_keys(keys: &[FieldValue], partitions: &[PartitionInfo]) -> Result<Vec<i64>> {
	if partitions.is_empty() {
		return Err(Error::internal("partition key collection has no partitions."));
	}

	let mut ids = BTreeSet::new();

	for key in keys {
		let bytes = key.key_bytes().ok_or_else(|| {
			Error::invalid(format!("partition key value {key:?} must be an integer or a string."))
		})?;
		let hash = blake3::hash(&bytes);
		let mut prefix = [0_u8; 8];

		prefix.copy_from_slice(&hash.as_bytes()[..8]);

		let bucket = (u64::from_le_bytes(prefix) % partitions.len() as u64) as usize;

		ids.insert(partitions[bucket].partition_id);
	}

	Ok(ids.into_iter().collect())
}

/// Resolves caller-supplied partition names to ids.
pub fn resolve_partition_names(names: &[String], partitions: &[PartitionInfo]) -> Result<Vec<i64>> {
	let mut ids = BTreeSet::new();

	for name in names {
		let partition = partitions
			.iter()
			.find(|partition| &partition.name == name)
			.ok_or_else(|| Error::not_found(format!("partition {name} not found.")))?;

		ids.insert(partition.partition_id);
	}

	Ok(ids.into_iter().collect())
}
