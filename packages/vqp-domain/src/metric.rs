use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
	L2,
	Ip,
	Cosine,
	Hamming,
	Jaccard,
	Bm25,
}
impl MetricType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::L2 => "L2",
			Self::Ip => "IP",
			Self::Cosine => "COSINE",
			Self::Hamming => "HAMMING",
			Self::Jaccard => "JACCARD",
			Self::Bm25 => "BM25",
		}
	}

	/// True when a larger raw score means a closer match.
	pub fn positively_related(self) -> bool {
		matches!(self, Self::Ip | Self::Cosine | Self::Bm25)
	}
}

impl fmt::Display for MetricType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MetricType {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw.trim().to_ascii_uppercase().as_str() {
			"L2" => Ok(Self::L2),
			"IP" => Ok(Self::Ip),
			"COSINE" => Ok(Self::Cosine),
			"HAMMING" => Ok(Self::Hamming),
			"JACCARD" => Ok(Self::Jaccard),
			"BM25" => Ok(Self::Bm25),
			other => Err(format!("unsupported metric type {other:?}")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_case_insensitively() {
		assert_eq!("cosine".parse::<MetricType>(), Ok(MetricType::Cosine));
		assert_eq!(" l2 ".parse::<MetricType>(), Ok(MetricType::L2));
		assert!("dot".parse::<MetricType>().is_err());
	}

	#[test]
	fn similarity_metrics_are_positively_related() {
		assert!(MetricType::Ip.positively_related());
		assert!(MetricType::Bm25.positively_related());
		assert!(!MetricType::L2.positively_related());
		assert!(!MetricType::Hamming.positively_related());
	}
}
