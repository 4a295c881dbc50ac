//! Output-field translation.

use vqp_domain::{CollectionSchema, FieldSchema, schema::DYNAMIC_FIELD_NAME};

use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslatedOutput {
	/// Physical fields to project, primary key excluded.
	pub translated: Vec<String>,
	/// Names echoed back to the caller, in request order.
	pub user_output_fields: Vec<String>,
	/// Keys of the dynamic field the caller asked for by name.
	pub user_dynamic_fields: Vec<String>,
	pub pk_requested_explicitly: bool,
}
impl TranslatedOutput {
	fn push(&mut self, physical: &str, user: &str) {
		if !self.translated.iter().any(|name| name == physical) {
			self.translated.push(physical.to_string());
		}
		if !self.user_output_fields.iter().any(|name| name == user) {
			self.user_output_fields.push(user.to_string());
		}
	}
}

pub fn translate_output_fields(
	fields: &[String],
	schema: &CollectionSchema,
) -> Result<TranslatedOutput> {
	let mut out = TranslatedOutput::default();

	for name in fields.iter().map(|name| name.trim()).filter(|name| !name.is_empty()) {
		if name == "*" {
			for field in &schema.fields {
				if field.is_primary_key || schema.is_function_output(&field.name) {
					continue;
				}

				out.push(&field.name, &field.name);
			}

			continue;
		}

		match schema.field_by_name(name) {
			Some(field) if field.is_primary_key => out.pk_requested_explicitly = true,
			Some(field) if schema.is_function_output(&field.name) => {
				return Err(Error::invalid(format!(
					"not allowed to retrieve raw data of function output field {name}."
				)));
			},
			Some(field) => out.push(&field.name, &field.name),
			None if schema.enable_dynamic_field && schema.dynamic_field().is_some() => {
				if !out.user_dynamic_fields.iter().any(|key| key == name) {
					out.user_dynamic_fields.push(name.to_string());
				}

				out.push(DYNAMIC_FIELD_NAME, name);
			},
			None => return Err(Error::invalid(format!("field {name} not exist."))),
		}
	}

	Ok(out)
}

pub fn output_field_ids(schema: &CollectionSchema, translated: &[String]) -> Result<Vec<i64>> {
	translated
		.iter()
		.map(|name| {
			schema
				.field_by_name(name)
				.map(|field| field.field_id)
				.ok_or_else(|| Error::invalid(format!("field {name} not exist.")))
		})
		.collect()
}

pub fn vector_output_fields<'a>(
	schema: &'a CollectionSchema,
	translated: &[String],
) -> Vec<&'a FieldSchema> {
	translated
		.iter()
		.filter_map(|name| schema.field_by_name(name))
		.filter(|field| field.data_type.is_vector())
		.collect()
}
