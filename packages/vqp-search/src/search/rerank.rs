//! Rank fusion for hybrid search and score rewriting rerankers.
//!
//! A [`FunctionScore`] is resolved once at composition time, either from an explicit
//! client-supplied function or synthesized from the legacy `strategy`/`params` search
//! parameters. All legs share it read-only.

use std::{
	collections::{BTreeMap, HashMap},
	f32::consts::PI,
};

use serde_json::Value;

use vqp_domain::{CollectionSchema, FieldData, FieldValue, MetricType, PrimaryKey};

use crate::{
	Error, Result,
	search::{
		FunctionScoreSpec,
		params::{self, PARAMS_KEY, RANK_STRATEGY_KEY, SearchParams},
		reduce::{Reduced, cmp_f32_desc},
	},
};

pub const DEFAULT_RRF_K: f32 = 60.0;
const MAX_RRF_K: f32 = 16_384.0;
const RERANKER_KEY: &str = "reranker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionSource {
	Explicit,
	Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayFunction {
	Gauss,
	Exp,
	Linear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decay {
	pub function: DecayFunction,
	pub origin: f64,
	pub scale: f64,
	pub offset: f64,
	pub decay: f64,
	pub norm_score: bool,
}
impl Decay {
	fn factor(&self, value: f64) -> f64 {
		let distance = ((value - self.origin).abs() - self.offset).max(0.0);

		match self.function {
			DecayFunction::Gauss => (self.decay.ln() * distance * distance / (self.scale * self.scale)).exp(),
			DecayFunction::Exp => (self.decay.ln() * distance / self.scale).exp(),
			DecayFunction::Linear => {
				let span = self.scale / (1.0 - self.decay);

				((span - distance) / span).max(0.0)
			},
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reranker {
	Rrf { k: f32 },
	Weighted { weights: Vec<f32>, norm_score: bool },
	Decay(Decay),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionScore {
	source: FusionSource,
	name: String,
	reranker: Reranker,
	/// Extra per-row inputs as (field id, field name).
	inputs: Vec<(i64, String)>,
}
impl FunctionScore {
	pub fn explicit(schema: &CollectionSchema, spec: &FunctionScoreSpec) -> Result<Self> {
		let [function] = spec.functions.as_slice() else {
			return Err(Error::invalid(format!(
				"exactly one rerank function is supported, got {}.",
				spec.functions.len()
			)));
		};
		let kind = function
			.params
			.get(RERANKER_KEY)
			.and_then(Value::as_str)
			.ok_or_else(|| Error::invalid(format!("rerank function {} has no {RERANKER_KEY}.", function.name)))?;
		let mut inputs = Vec::new();

		for name in &function.input_field_names {
			let field = schema.field_by_name(name).ok_or_else(|| {
				Error::invalid(format!("rerank input field {name} not found in schema."))
			})?;

			inputs.push((field.field_id, field.name.clone()));
		}

		let reranker = match kind.to_ascii_lowercase().as_str() {
			"rrf" => rrf(&function.params)?,
			"weighted" => weighted(&function.params)?,
			"decay" => {
				let [(field_id, _)] = inputs.as_slice() else {
					return Err(Error::invalid("decay rerank needs exactly one input field."));
				};
				let numeric = schema
					.field_by_id(*field_id)
					.map(|field| field.data_type.is_numeric())
					.unwrap_or(false);

				if !numeric {
					return Err(Error::invalid("decay rerank input field must be numeric."));
				}

				decay(&function.params)?
			},
			other => return Err(Error::invalid(format!("unsupported reranker {other}."))),
		};

		if !matches!(reranker, Reranker::Decay(_)) && !inputs.is_empty() {
			return Err(Error::invalid(format!("reranker {kind} does not take input fields.")));
		}

		Ok(Self { source: FusionSource::Explicit, name: function.name.clone(), reranker, inputs })
	}

	/// Synthesizes a fusion function from the hybrid-search `strategy` and `params` keys.
	pub fn legacy(params: &SearchParams) -> Result<Self> {
		let strategy = params::get(params, RANK_STRATEGY_KEY).unwrap_or("rrf").to_ascii_lowercase();
		let raw = params::get(params, PARAMS_KEY).unwrap_or("{}");
		let decoded: BTreeMap<String, Value> = serde_json::from_str(raw)
			.map_err(|err| Error::invalid(format!("rank params are not a JSON object: {err}.")))?;
		let reranker = match strategy.as_str() {
			"rrf" => rrf(&decoded)?,
			"weighted" => weighted(&decoded)?,
			other => return Err(Error::invalid(format!("unsupported rank strategy {other}."))),
		};

		Ok(Self { source: FusionSource::Legacy, name: strategy, reranker, inputs: Vec::new() })
	}

	pub fn source(&self) -> FusionSource {
		self.source
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn reranker(&self) -> &Reranker {
		&self.reranker
	}

	pub fn input_field_names(&self) -> Vec<&str> {
		self.inputs.iter().map(|(_, name)| name.as_str()).collect()
	}

	pub fn input_field_ids(&self) -> Vec<i64> {
		self.inputs.iter().map(|(field_id, _)| *field_id).collect()
	}

	pub fn supports_group_by(&self) -> bool {
		!matches!(self.reranker, Reranker::Decay(_))
	}

	pub fn check_leg_count(&self, legs: usize) -> Result<()> {
		match &self.reranker {
			Reranker::Weighted { weights, .. } if weights.len() != legs => Err(Error::invalid(
				format!("the number of weights ({}) must match the number of searches ({legs}).", weights.len()),
			)),
			_ => Ok(()),
		}
	}

	/// Fuses legs into one ranking per query: larger is better, ties by primary key.
	pub fn fuse(&self, legs: &[Reduced], inputs: &InputValues) -> Result<Vec<Vec<(PrimaryKey, f32)>>> {
		self.check_leg_count(legs.len())?;

		let nq = legs.first().map(Reduced::nq).unwrap_or(0);

		if legs.iter().any(|leg| leg.nq() != nq) {
			return Err(Error::internal("fused legs disagree on the number of queries."));
		}

		let mut out = Vec::with_capacity(nq);

		for query in 0..nq {
			let mut scores: HashMap<&PrimaryKey, f32> = HashMap::new();

			for (leg_idx, leg) in legs.iter().enumerate() {
				for (rank, row) in leg.query_rows(query).enumerate() {
					let pk = &leg.ids[row];
					let score = leg.scores[row];

					match &self.reranker {
						Reranker::Rrf { k } => {
							*scores.entry(pk).or_insert(0.0) += 1.0 / (k + rank as f32 + 1.0);
						},
						Reranker::Weighted { weights, norm_score } => {
							let score = if *norm_score { normalize(score, leg.metric_type) } else { score };

							*scores.entry(pk).or_insert(0.0) += weights[leg_idx] * score;
						},
						Reranker::Decay(decay) => {
							let base = if decay.norm_score { normalize(score, leg.metric_type) } else { score };
							let entry = scores.entry(pk).or_insert(f32::NEG_INFINITY);

							*entry = entry.max(base);
						},
					}
				}
			}

			let mut fused = Vec::with_capacity(scores.len());

			for (pk, score) in scores {
				let score = match (&self.reranker, self.inputs.first()) {
					(Reranker::Decay(decay), Some((field_id, name))) => {
						let value = inputs.get(*field_id, pk).ok_or_else(|| {
							Error::internal(format!("decay input {name} missing for primary key {pk}."))
						})?;
						let value = value.as_f64().ok_or_else(|| {
							Error::invalid(format!("decay input {name} is not numeric for primary key {pk}."))
						})?;

						(f64::from(score) * decay.factor(value)) as f32
					},
					_ => score,
				};

				fused.push((pk.clone(), score));
			}

			fused.sort_by(|lhs, rhs| cmp_f32_desc(lhs.1, rhs.1).then_with(|| lhs.0.cmp(&rhs.0)));
			out.push(fused);
		}

		Ok(out)
	}
}

/// Per-row values of extra rerank inputs keyed by field id and primary key.
#[derive(Debug, Clone, Default)]
pub struct InputValues {
	values: HashMap<i64, HashMap<PrimaryKey, FieldValue>>,
}
impl InputValues {
	pub fn from_columns(ids: &[PrimaryKey], columns: &[FieldData], wanted: &[i64]) -> Self {
		let mut values = HashMap::new();

		for column in columns.iter().filter(|column| wanted.contains(&column.field_id)) {
			let by_pk: HashMap<_, _> =
				ids.iter().cloned().zip(column.values.iter().cloned()).collect();

			values.insert(column.field_id, by_pk);
		}

		Self { values }
	}

	pub fn get(&self, field_id: i64, pk: &PrimaryKey) -> Option<&FieldValue> {
		self.values.get(&field_id)?.get(pk)
	}
}

/// Maps a larger-is-better shard score into [0, 1].
fn normalize(score: f32, metric_type: Option<MetricType>) -> f32 {
	match metric_type {
		Some(MetricType::Ip) => 0.5 + score.atan() / PI,
		Some(MetricType::Cosine) => (1.0 + score) * 0.5,
		Some(MetricType::Bm25) => 2.0 * score.atan() / PI,
		Some(MetricType::L2 | MetricType::Hamming | MetricType::Jaccard) =>
			1.0 - 2.0 * (-score).atan() / PI,
		None => score,
	}
}

fn number(params: &BTreeMap<String, Value>, key: &str) -> Result<Option<f64>> {
	match params.get(key) {
		None => Ok(None),
		Some(value) => value
			.as_f64()
			.or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
			.map(Some)
			.ok_or_else(|| Error::invalid(format!("rerank parameter {key} must be a number."))),
	}
}

fn flag(params: &BTreeMap<String, Value>, key: &str) -> Result<bool> {
	match params.get(key) {
		None => Ok(false),
		Some(Value::Bool(value)) => Ok(*value),
		Some(Value::String(raw)) => raw
			.parse()
			.map_err(|_| Error::invalid(format!("rerank parameter {key} must be a boolean."))),
		Some(_) => Err(Error::invalid(format!("rerank parameter {key} must be a boolean."))),
	}
}

fn rrf(params: &BTreeMap<String, Value>) -> Result<Reranker> {
	let k = number(params, "k")?.map(|k| k as f32).unwrap_or(DEFAULT_RRF_K);

	if !(k > 0.0 && k < MAX_RRF_K) {
		return Err(Error::invalid(format!("rrf k must be in (0, {MAX_RRF_K}), got {k}.")));
	}

	Ok(Reranker::Rrf { k })
}

fn weighted(params: &BTreeMap<String, Value>) -> Result<Reranker> {
	let raw = params
		.get("weights")
		.and_then(Value::as_array)
		.ok_or_else(|| Error::invalid("weighted rerank requires a weights array."))?;
	let mut weights = Vec::with_capacity(raw.len());

	for weight in raw {
		let weight = weight
			.as_f64()
			.ok_or_else(|| Error::invalid("weighted rerank weights must be numbers."))?;

		if !(0.0..=1.0).contains(&weight) {
			return Err(Error::invalid(format!("rank weight must be in [0, 1], got {weight}.")));
		}

		weights.push(weight as f32);
	}

	Ok(Reranker::Weighted { weights, norm_score: flag(params, "norm_score")? })
}

fn decay(params: &BTreeMap<String, Value>) -> Result<Reranker> {
	let function = match params.get("function").and_then(Value::as_str) {
		Some("gauss") => DecayFunction::Gauss,
		Some("exp") => DecayFunction::Exp,
		Some("linear") => DecayFunction::Linear,
		other => return Err(Error::invalid(format!("unsupported decay function {other:?}."))),
	};
	let origin =
		number(params, "origin")?.ok_or_else(|| Error::invalid("decay rerank requires origin."))?;
	let scale =
		number(params, "scale")?.ok_or_else(|| Error::invalid("decay rerank requires scale."))?;
	let offset = number(params, "offset")?.unwrap_or(0.0);
	let decay = number(params, "decay")?.unwrap_or(0.5);

	if scale <= 0.0 {
		return Err(Error::invalid(format!("decay scale must be positive, got {scale}.")));
	}
	if offset < 0.0 {
		return Err(Error::invalid(format!("decay offset must not be negative, got {offset}.")));
	}
	if !(decay > 0.0 && decay < 1.0) {
		return Err(Error::invalid(format!("decay must be in (0, 1), got {decay}.")));
	}

	Ok(Reranker::Decay(Decay {
		function,
		origin,
		scale,
		offset,
		decay,
		norm_score: flag(params, "norm_score")?,
	}))
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use vqp_domain::{DataType, FieldSchema};

	use super::*;
	use crate::search::RerankFunctionSpec;

	fn schema() -> CollectionSchema {
		let field = |field_id, name: &str, data_type| FieldSchema {
			field_id,
			name: name.to_string(),
			data_type,
			is_primary_key: field_id == 100,
			is_partition_key: false,
			is_dynamic: false,
			dim: None,
		};

		CollectionSchema {
			name: "docs".to_string(),
			fields: vec![
				field(100, "id", DataType::Int64),
				field(101, "year", DataType::Int64),
				field(102, "title", DataType::VarChar),
			],
			functions: Vec::new(),
			enable_dynamic_field: false,
		}
	}

	fn leg(ids: &[i64], scores: &[f32]) -> Reduced {
		Reduced {
			metric_type: Some(MetricType::Ip),
			topks: vec![ids.len() as i64],
			ids: ids.iter().map(|id| PrimaryKey::Int(*id)).collect(),
			scores: scores.to_vec(),
			group_by_values: Vec::new(),
			fields_data: Vec::new(),
		}
	}

	fn spec(params: Value, inputs: &[&str]) -> FunctionScoreSpec {
		let params = params
			.as_object()
			.map(|map| map.clone().into_iter().collect())
			.unwrap_or_default();

		FunctionScoreSpec {
			functions: vec![RerankFunctionSpec {
				name: "ranker".to_string(),
				input_field_names: inputs.iter().map(|name| name.to_string()).collect(),
				params,
			}],
		}
	}

	#[test]
	fn rrf_rewards_agreement_and_breaks_ties_by_id() {
		let score = FunctionScore::legacy(&SearchParams::new()).expect("legacy rrf failed");
		let fused = score
			.fuse(
				&[leg(&[1, 2, 3], &[0.9, 0.8, 0.7]), leg(&[3, 2, 4], &[0.9, 0.8, 0.7])],
				&InputValues::default(),
			)
			.expect("fuse failed");
		let order: Vec<_> = fused[0].iter().map(|(pk, _)| pk.clone()).collect();

		assert_eq!(score.source(), FusionSource::Legacy);
		assert_eq!(order, [3, 2, 1, 4].map(PrimaryKey::Int).to_vec());

		let tied = score
			.fuse(&[leg(&[2, 1], &[0.9, 0.8]), leg(&[1, 2], &[0.9, 0.8])], &InputValues::default())
			.expect("fuse failed");

		assert_eq!(tied[0][0].1, tied[0][1].1);
		assert_eq!(tied[0][0].0, PrimaryKey::Int(1));
	}

	#[test]
	fn weighted_requires_one_weight_per_leg() {
		let mut params = SearchParams::new();

		params.insert("strategy".to_string(), "weighted".to_string());
		params.insert("params".to_string(), r#"{"weights": [0.2, 0.8]}"#.to_string());

		let score = FunctionScore::legacy(&params).expect("legacy weighted failed");

		assert!(score.check_leg_count(2).is_ok());
		assert!(matches!(score.check_leg_count(3), Err(Error::InvalidRequest { .. })));

		let fused = score
			.fuse(&[leg(&[1, 2], &[1.0, 0.5]), leg(&[2, 1], &[1.0, 0.0])], &InputValues::default())
			.expect("fuse failed");

		assert_eq!(fused[0][0], (PrimaryKey::Int(2), 0.2 * 0.5 + 0.8));
	}

	#[test]
	fn weights_outside_unit_interval_are_rejected() {
		let err = FunctionScore::explicit(&schema(), &spec(json!({"reranker": "weighted", "weights": [1.5]}), &[]))
			.expect_err("Expected weight rejection.");

		assert!(matches!(err, Error::InvalidRequest { .. }));
	}

	#[test]
	fn rrf_k_bounds() {
		assert!(FunctionScore::explicit(&schema(), &spec(json!({"reranker": "rrf", "k": 0}), &[])).is_err());
		assert!(FunctionScore::explicit(&schema(), &spec(json!({"reranker": "rrf", "k": 20000}), &[])).is_err());

		let score = FunctionScore::explicit(&schema(), &spec(json!({"reranker": "rrf", "k": 10}), &[]))
			.expect("rrf failed");

		assert_eq!(score.reranker(), &Reranker::Rrf { k: 10.0 });
		assert!(score.supports_group_by());
	}

	#[test]
	fn decay_declares_input_and_rescales_scores() {
		let score = FunctionScore::explicit(
			&schema(),
			&spec(
				json!({"reranker": "decay", "function": "linear", "origin": 2020, "scale": 10, "decay": 0.5}),
				&["year"],
			),
		)
		.expect("decay failed");

		assert_eq!(score.input_field_names(), vec!["year"]);
		assert!(!score.supports_group_by());

		let ids = [PrimaryKey::Int(1), PrimaryKey::Int(2)];
		let years = FieldData {
			field_id: 101,
			field_name: "year".to_string(),
			data_type: DataType::Int64,
			is_dynamic: false,
			values: vec![FieldValue::Int(2000), FieldValue::Int(2020)],
		};
		let inputs = InputValues::from_columns(&ids, &[years], &score.input_field_ids());
		let fused = score.fuse(&[leg(&[1, 2], &[1.0, 0.6])], &inputs).expect("fuse failed");

		assert_eq!(fused[0][0], (PrimaryKey::Int(2), 0.6));
		assert_eq!(fused[0][1], (PrimaryKey::Int(1), 0.0));
	}

	#[test]
	fn decay_rejects_text_inputs() {
		let err = FunctionScore::explicit(
			&schema(),
			&spec(json!({"reranker": "decay", "function": "gauss", "origin": 0, "scale": 1}), &["title"]),
		)
		.expect_err("Expected numeric rejection.");

		assert!(err.to_string().contains("numeric"));
	}

	#[test]
	fn normalization_keeps_order() {
		assert!(normalize(-1.0, Some(MetricType::L2)) > normalize(-4.0, Some(MetricType::L2)));
		assert!(normalize(3.0, Some(MetricType::Ip)) > normalize(1.0, Some(MetricType::Ip)));
		assert_eq!(normalize(1.0, Some(MetricType::Cosine)), 1.0);
	}
}
