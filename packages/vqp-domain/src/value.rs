use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

use crate::schema::DataType;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
	Int(i64),
	Str(String),
}
impl PrimaryKey {
	pub fn to_field_value(&self) -> FieldValue {
		match self {
			Self::Int(value) => FieldValue::Int(*value),
			Self::Str(value) => FieldValue::Str(value.clone()),
		}
	}
}

impl fmt::Display for PrimaryKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Int(value) => write!(f, "{value}"),
			Self::Str(value) => f.write_str(value),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Str(String),
	Json(serde_json::Value),
	FloatVector(Vec<f32>),
	BinaryVector(Vec<u8>),
	SparseVector(Vec<(u32, f32)>),
}
impl FieldValue {
	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Self::Int(value) => Some(*value as f64),
			Self::Float(value) => Some(*value),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::Str(value) => Some(value.as_str()),
			_ => None,
		}
	}

	/// Ordering between scalar values of compatible kinds; integers and floats compare
	/// numerically.
	pub fn compare(&self, other: &Self) -> Option<Ordering> {
		match (self, other) {
			(Self::Bool(lhs), Self::Bool(rhs)) => Some(lhs.cmp(rhs)),
			(Self::Int(lhs), Self::Int(rhs)) => Some(lhs.cmp(rhs)),
			(Self::Str(lhs), Self::Str(rhs)) => Some(lhs.cmp(rhs)),
			(lhs, rhs) => lhs.as_f64()?.partial_cmp(&rhs.as_f64()?),
		}
	}

	pub fn group_key(&self) -> Option<GroupKey> {
		match self {
			Self::Null => Some(GroupKey::Null),
			Self::Bool(value) => Some(GroupKey::Bool(*value)),
			Self::Int(value) => Some(GroupKey::Int(*value)),
			Self::Str(value) => Some(GroupKey::Str(value.clone())),
			_ => None,
		}
	}

	/// Stable byte encoding used for partition-key hashing.
	pub fn key_bytes(&self) -> Option<Vec<u8>> {
		match self {
			Self::Int(value) => Some(value.to_le_bytes().to_vec()),
			Self::Str(value) => Some(value.as_bytes().to_vec()),
			_ => None,
		}
	}

	/// Number of explicitly stored entries of a sparse vector.
	pub fn sparse_nnz(&self) -> Option<usize> {
		match self {
			Self::SparseVector(entries) => Some(entries.len()),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupKey {
	Null,
	Bool(bool),
	Int(i64),
	Str(String),
}

/// One column of values, row-aligned with the ids it was produced for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldData {
	pub field_id: i64,
	pub field_name: String,
	pub data_type: DataType,
	#[serde(default)]
	pub is_dynamic: bool,
	pub values: Vec<FieldValue>,
}
impl FieldData {
	pub fn empty_like(&self) -> Self {
		Self {
			field_id: self.field_id,
			field_name: self.field_name.clone(),
			data_type: self.data_type,
			is_dynamic: self.is_dynamic,
			values: Vec::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.values.len()
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	/// Copies the values at `rows`, in that order.
	pub fn select(&self, rows: &[usize]) -> Self {
		let mut out = self.empty_like();

		out.values = rows
			.iter()
			.map(|row| self.values.get(*row).cloned().unwrap_or(FieldValue::Null))
			.collect();

		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn numeric_values_compare_across_kinds() {
		assert_eq!(FieldValue::Int(3).compare(&FieldValue::Float(2.5)), Some(Ordering::Greater));
		assert_eq!(
			FieldValue::Str("a".to_string()).compare(&FieldValue::Str("b".to_string())),
			Some(Ordering::Less)
		);
		assert_eq!(FieldValue::Str("a".to_string()).compare(&FieldValue::Int(1)), None);
	}

	#[test]
	fn untagged_primary_keys_deserialize_naturally() {
		let ids: Vec<PrimaryKey> =
			serde_json::from_str(r#"[7, "doc-1"]"#).expect("Failed to parse ids.");

		assert_eq!(ids, vec![PrimaryKey::Int(7), PrimaryKey::Str("doc-1".to_string())]);
	}

	#[test]
	fn select_pads_missing_rows_with_null() {
		let column = FieldData {
			field_id: 1,
			field_name: "n".to_string(),
			data_type: DataType::Int64,
			is_dynamic: false,
			values: vec![FieldValue::Int(10), FieldValue::Int(20)],
		};
		let picked = column.select(&[1, 5]);

		assert_eq!(picked.values, vec![FieldValue::Int(20), FieldValue::Null]);
	}
}
