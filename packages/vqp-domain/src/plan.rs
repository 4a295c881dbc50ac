//! Compiled search plans as produced by the plan compiler and shipped to shards.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{metric::MetricType, schema::DataType, value::{FieldValue, PrimaryKey}};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
	pub field_id: i64,
	pub data_type: DataType,
	#[serde(default)]
	pub is_partition_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
}
impl CompareOp {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Eq => "==",
			Self::Ne => "!=",
			Self::Lt => "<",
			Self::Le => "<=",
			Self::Gt => ">",
			Self::Ge => ">=",
		}
	}

	fn accepts(self, ordering: Ordering) -> bool {
		match self {
			Self::Eq => ordering == Ordering::Equal,
			Self::Ne => ordering != Ordering::Equal,
			Self::Lt => ordering == Ordering::Less,
			Self::Le => ordering != Ordering::Greater,
			Self::Gt => ordering == Ordering::Greater,
			Self::Ge => ordering != Ordering::Less,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
	AlwaysTrue,
	Compare { column: Column, op: CompareOp, value: FieldValue },
	Term { column: Column, values: Vec<FieldValue> },
	And(Box<Expr>, Box<Expr>),
	Or(Box<Expr>, Box<Expr>),
	Not(Box<Expr>),
}
impl Expr {
	/// Evaluates the predicate against one row; `lookup` resolves a field id to the row's value.
	pub fn matches<'a, F>(&self, lookup: &F) -> bool
	where
		F: Fn(i64) -> Option<&'a FieldValue>,
	{
		match self {
			Self::AlwaysTrue => true,
			Self::Compare { column, op, value } => lookup(column.field_id)
				.and_then(|actual| actual.compare(value))
				.map(|ordering| op.accepts(ordering))
				.unwrap_or(false),
			Self::Term { column, values } => lookup(column.field_id)
				.map(|actual| {
					values.iter().any(|value| actual.compare(value) == Some(Ordering::Equal))
				})
				.unwrap_or(false),
			Self::And(lhs, rhs) => lhs.matches(lookup) && rhs.matches(lookup),
			Self::Or(lhs, rhs) => lhs.matches(lookup) || rhs.matches(lookup),
			Self::Not(inner) => !inner.matches(lookup),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorInfo {
	pub token: String,
	pub batch_size: i64,
	/// Score of the last row returned by the previous page, in user-facing orientation.
	pub last_bound: Option<f32>,
	/// Primary key of that row. Rows scoring exactly `last_bound` are kept only past it.
	#[serde(default)]
	pub last_pk: Option<PrimaryKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
	/// Rows requested from each shard, i.e. `limit + offset`.
	pub topk: i64,
	pub metric_type: Option<MetricType>,
	pub query_field_id: i64,
	/// Index-specific parameters, JSON encoded.
	pub search_params: String,
	pub round_decimal: i64,
	pub group_by_field_id: Option<i64>,
	pub group_size: i64,
	#[serde(default)]
	pub materialized_view_involved: bool,
	#[serde(default)]
	pub hints: Option<String>,
	#[serde(default)]
	pub iterator: Option<IteratorInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
	pub expr: Option<Expr>,
	pub query_info: QueryInfo,
	#[serde(default)]
	pub output_field_ids: Vec<i64>,
	#[serde(default)]
	pub dynamic_fields: Vec<String>,
}
impl PlanNode {
	pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
		serde_json::to_vec(self)
	}

	pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
		serde_json::from_slice(bytes)
	}
}
