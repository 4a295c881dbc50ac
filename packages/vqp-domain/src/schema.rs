use serde::{Deserialize, Serialize};

/// Database a request addresses when it names none.
pub const DEFAULT_DB_NAME: &str = "default";

/// Name of the hidden JSON column that stores dynamic fields.
pub const DYNAMIC_FIELD_NAME: &str = "$meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
	Bool,
	Int8,
	Int16,
	Int32,
	Int64,
	Float,
	Double,
	VarChar,
	Json,
	Array,
	FloatVector,
	BinaryVector,
	Float16Vector,
	BFloat16Vector,
	SparseFloatVector,
}
impl DataType {
	pub fn is_vector(self) -> bool {
		matches!(
			self,
			Self::FloatVector
				| Self::BinaryVector
				| Self::Float16Vector
				| Self::BFloat16Vector
				| Self::SparseFloatVector
		)
	}

	pub fn is_integer(self) -> bool {
		matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
	}

	pub fn is_numeric(self) -> bool {
		self.is_integer() || matches!(self, Self::Float | Self::Double)
	}

	/// Partition-key types a materialized view can be built over.
	pub fn supports_materialized_view(self) -> bool {
		matches!(self, Self::Int64 | Self::VarChar)
	}

	/// Types a search can group results by.
	pub fn supports_group_by(self) -> bool {
		matches!(self, Self::Bool | Self::VarChar) || self.is_integer()
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
	pub field_id: i64,
	pub name: String,
	pub data_type: DataType,
	#[serde(default)]
	pub is_primary_key: bool,
	#[serde(default)]
	pub is_partition_key: bool,
	#[serde(default)]
	pub is_dynamic: bool,
	#[serde(default)]
	pub dim: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
	/// Lexical scoring; evaluated inside shards, never by the front end.
	Bm25,
	TextEmbedding,
	Rerank,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
	pub name: String,
	pub kind: FunctionKind,
	pub input_field_names: Vec<String>,
	pub output_field_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
	pub name: String,
	pub fields: Vec<FieldSchema>,
	#[serde(default)]
	pub functions: Vec<FunctionSchema>,
	#[serde(default)]
	pub enable_dynamic_field: bool,
}
impl CollectionSchema {
	pub fn field_by_name(&self, name: &str) -> Option<&FieldSchema> {
		self.fields.iter().find(|field| field.name == name)
	}

	pub fn field_by_id(&self, field_id: i64) -> Option<&FieldSchema> {
		self.fields.iter().find(|field| field.field_id == field_id)
	}

	pub fn primary_field(&self) -> Option<&FieldSchema> {
		self.fields.iter().find(|field| field.is_primary_key)
	}

	pub fn partition_key_field(&self) -> Option<&FieldSchema> {
		self.fields.iter().find(|field| field.is_partition_key)
	}

	pub fn dynamic_field(&self) -> Option<&FieldSchema> {
		self.fields.iter().find(|field| field.is_dynamic)
	}

	pub fn vector_fields(&self) -> Vec<&FieldSchema> {
		self.fields.iter().filter(|field| field.data_type.is_vector()).collect()
	}

	/// True when `field_name` is produced by a schema function rather than written by users.
	pub fn is_function_output(&self, field_name: &str) -> bool {
		self.functions
			.iter()
			.any(|function| function.output_field_names.iter().any(|name| name == field_name))
	}

	/// True when any non-BM25 function feeds one of `field_ids`; those need the front end to
	/// run the function before fan-out.
	pub fn has_non_bm25_functions(&self, field_ids: &[i64]) -> bool {
		self.functions.iter().filter(|function| function.kind != FunctionKind::Bm25).any(
			|function| {
				function.output_field_names.iter().any(|name| {
					self.field_by_name(name)
						.map(|field| field_ids.contains(&field.field_id))
						.unwrap_or(false)
				})
			},
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn field(field_id: i64, name: &str, data_type: DataType) -> FieldSchema {
		FieldSchema {
			field_id,
			name: name.to_string(),
			data_type,
			is_primary_key: false,
			is_partition_key: false,
			is_dynamic: false,
			dim: None,
		}
	}

	#[test]
	fn detects_udf_backed_vector_fields() {
		let schema = CollectionSchema {
			name: "docs".to_string(),
			fields: vec![
				field(100, "id", DataType::Int64),
				field(101, "text", DataType::VarChar),
				field(102, "dense", DataType::FloatVector),
				field(103, "sparse", DataType::SparseFloatVector),
			],
			functions: vec![
				FunctionSchema {
					name: "bm25".to_string(),
					kind: FunctionKind::Bm25,
					input_field_names: vec!["text".to_string()],
					output_field_names: vec!["sparse".to_string()],
				},
				FunctionSchema {
					name: "embed".to_string(),
					kind: FunctionKind::TextEmbedding,
					input_field_names: vec!["text".to_string()],
					output_field_names: vec!["dense".to_string()],
				},
			],
			enable_dynamic_field: false,
		};

		assert!(schema.has_non_bm25_functions(&[102]));
		assert!(!schema.has_non_bm25_functions(&[103]));
		assert!(schema.is_function_output("sparse"));
		assert_eq!(schema.vector_fields().len(), 2);
	}
}
