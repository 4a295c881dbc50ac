//! A small JSON filter language compiled into plan expressions.
//!
//! A filter is a JSON object. Each key is a field name or one of `$and`, `$or`, `$not`; all
//! keys of one object must hold. A field maps to a literal (equality) or to an object with a
//! single operator among `==`, `!=`, `<`, `<=`, `>`, `>=` and `in`. A string literal of the form
//! `{name}` is replaced by the template value `name`.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use vqp_domain::{
	CollectionSchema, DataType, FieldSchema, FieldValue,
	plan::{Column, CompareOp, Expr, PlanNode},
};
use vqp_search::{CompileInput, Error, PlanCompiler, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPlanCompiler;

impl PlanCompiler for JsonPlanCompiler {
	fn compile(&self, input: CompileInput<'_>) -> Result<PlanNode> {
		let anns = input.schema.field_by_name(input.anns_field).ok_or_else(|| {
			Error::invalid(format!("anns field {} not found in schema.", input.anns_field))
		})?;

		if !anns.data_type.is_vector() {
			return Err(Error::invalid(format!("field {} is not a vector field.", anns.name)));
		}

		let expr = if input.dsl.trim().is_empty() {
			None
		} else {
			let filter: Value = serde_json::from_str(input.dsl)
				.map_err(|err| Error::invalid(format!("filter is not valid JSON: {err}.")))?;

			Some(Compiler { schema: input.schema, templates: input.template_values }.expr(&filter)?)
		};

		Ok(PlanNode {
			expr,
			query_info: input.query_info,
			output_field_ids: Vec::new(),
			dynamic_fields: Vec::new(),
		})
	}
}

struct Compiler<'a> {
	schema: &'a CollectionSchema,
	templates: &'a BTreeMap<String, FieldValue>,
}
impl Compiler<'_> {
	fn expr(&self, filter: &Value) -> Result<Expr> {
		let object = filter
			.as_object()
			.ok_or_else(|| Error::invalid("filter must be a JSON object."))?;
		let mut terms = Vec::with_capacity(object.len());

		for (key, value) in object {
			terms.push(match key.as_str() {
				"$and" => self.all(value)?,
				"$or" => self.any(value)?,
				"$not" => Expr::Not(Box::new(self.expr(value)?)),
				field => self.field_predicate(field, value)?,
			});
		}

		Ok(terms
			.into_iter()
			.reduce(|lhs, rhs| Expr::And(Box::new(lhs), Box::new(rhs)))
			.unwrap_or(Expr::AlwaysTrue))
	}

	fn all(&self, value: &Value) -> Result<Expr> {
		self.list(value, "$and")?
			.into_iter()
			.reduce(|lhs, rhs| Expr::And(Box::new(lhs), Box::new(rhs)))
			.ok_or_else(|| Error::invalid("$and needs at least one filter."))
	}

	fn any(&self, value: &Value) -> Result<Expr> {
		self.list(value, "$or")?
			.into_iter()
			.reduce(|lhs, rhs| Expr::Or(Box::new(lhs), Box::new(rhs)))
			.ok_or_else(|| Error::invalid("$or needs at least one filter."))
	}

	fn list(&self, value: &Value, op: &str) -> Result<Vec<Expr>> {
		value
			.as_array()
			.ok_or_else(|| Error::invalid(format!("{op} expects an array of filters.")))?
			.iter()
			.map(|filter| self.expr(filter))
			.collect()
	}

	fn field_predicate(&self, name: &str, value: &Value) -> Result<Expr> {
		let field = self
			.schema
			.field_by_name(name)
			.ok_or_else(|| Error::invalid(format!("field {name} not exist.")))?;

		if field.data_type.is_vector() {
			return Err(Error::invalid(format!("vector field {name} cannot be filtered.")));
		}

		let column = Column {
			field_id: field.field_id,
			data_type: field.data_type,
			is_partition_key: field.is_partition_key,
		};

		match value {
			Value::Object(ops) => self.operator(field, column, ops),
			literal =>
				Ok(Expr::Compare { column, op: CompareOp::Eq, value: self.literal(field, literal)? }),
		}
	}

	fn operator(&self, field: &FieldSchema, column: Column, ops: &Map<String, Value>) -> Result<Expr> {
		let mut entries = ops.iter();
		let (Some((op, operand)), None) = (entries.next(), entries.next()) else {
			return Err(Error::invalid(format!(
				"filter on {} must name exactly one operator.",
				field.name
			)));
		};
		let op = match op.as_str() {
			"in" => {
				let values = operand
					.as_array()
					.ok_or_else(|| Error::invalid("in expects an array of values."))?
					.iter()
					.map(|value| self.literal(field, value))
					.collect::<Result<Vec<_>>>()?;

				return Ok(Expr::Term { column, values });
			},
			"==" => CompareOp::Eq,
			"!=" => CompareOp::Ne,
			"<" => CompareOp::Lt,
			"<=" => CompareOp::Le,
			">" => CompareOp::Gt,
			">=" => CompareOp::Ge,
			other => return Err(Error::invalid(format!("unsupported operator {other}."))),
		};

		Ok(Expr::Compare { column, op, value: self.literal(field, operand)? })
	}

	fn literal(&self, field: &FieldSchema, value: &Value) -> Result<FieldValue> {
		if let Some(raw) = value.as_str()
			&& let Some(name) = raw.strip_prefix('{').and_then(|rest| rest.strip_suffix('}'))
		{
			return self
				.templates
				.get(name)
				.cloned()
				.ok_or_else(|| Error::invalid(format!("template value {name} not provided.")));
		}

		let converted = match field.data_type {
			DataType::Bool => value.as_bool().map(FieldValue::Bool),
			data_type if data_type.is_integer() => value.as_i64().map(FieldValue::Int),
			DataType::Float | DataType::Double => value.as_f64().map(FieldValue::Float),
			DataType::VarChar => value.as_str().map(|raw| FieldValue::Str(raw.to_string())),
			DataType::Json => Some(FieldValue::Json(value.clone())),
			_ => None,
		};

		converted.ok_or_else(|| {
			Error::invalid(format!(
				"value {value} does not match the type of field {} ({:?}).",
				field.name, field.data_type
			))
		})
	}
}

#[cfg(test)]
mod tests {
	use vqp_domain::plan::QueryInfo;

	use super::*;

	fn field(field_id: i64, name: &str, data_type: DataType) -> FieldSchema {
		FieldSchema {
			field_id,
			name: name.to_string(),
			data_type,
			is_primary_key: field_id == 100,
			is_partition_key: name == "tenant",
			is_dynamic: false,
			dim: None,
		}
	}

	fn schema() -> CollectionSchema {
		CollectionSchema {
			name: "docs".to_string(),
			fields: vec![
				field(100, "id", DataType::Int64),
				field(101, "tenant", DataType::VarChar),
				field(102, "price", DataType::Double),
				field(103, "embedding", DataType::FloatVector),
			],
			functions: Vec::new(),
			enable_dynamic_field: false,
		}
	}

	fn query_info() -> QueryInfo {
		QueryInfo {
			topk: 10,
			metric_type: None,
			query_field_id: 103,
			search_params: "{}".to_string(),
			round_decimal: -1,
			group_by_field_id: None,
			group_size: 1,
			materialized_view_involved: false,
			hints: None,
			iterator: None,
		}
	}

	fn compile(dsl: &str, templates: &BTreeMap<String, FieldValue>) -> Result<PlanNode> {
		let schema = schema();

		JsonPlanCompiler.compile(CompileInput {
			schema: &schema,
			dsl,
			anns_field: "embedding",
			query_info: query_info(),
			template_values: templates,
		})
	}

	#[test]
	fn compiles_nested_filters_with_templates() {
		let templates = BTreeMap::from([("tenant".to_string(), FieldValue::Str("acme".to_string()))]);
		let plan = compile(
			r#"{"tenant": "{tenant}", "$or": [{"price": {"<": 10}}, {"id": {"in": [1, 2]}}]}"#,
			&templates,
		)
		.expect("compile failed");
		let expr = plan.expr.expect("expected a filter");
		let row = [
			(101, FieldValue::Str("acme".to_string())),
			(102, FieldValue::Float(25.0)),
			(100, FieldValue::Int(2)),
		];

		assert!(expr.matches(&|id| row.iter().find(|(f, _)| *f == id).map(|(_, v)| v)));
	}

	#[test]
	fn empty_filter_has_no_expression() {
		let plan = compile("  ", &BTreeMap::new()).expect("compile failed");

		assert!(plan.expr.is_none());
		assert_eq!(plan.query_info.topk, 10);
	}

	#[test]
	fn unknown_fields_and_bad_literals_are_rejected() {
		assert!(compile(r#"{"missing": 1}"#, &BTreeMap::new()).is_err());
		assert!(compile(r#"{"price": {"<": "cheap"}}"#, &BTreeMap::new()).is_err());
		assert!(compile(r#"{"price": {"<": 1, ">": 0}}"#, &BTreeMap::new()).is_err());
	}
}
