use serde::{Deserialize, Serialize};

/// Read consistency requested by a caller or configured on a collection.
///
/// `Strong` is the zero value on the wire, which is what the legacy guarantee-timestamp rule
/// keys on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
	#[default]
	Strong,
	Session,
	Bounded,
	Eventually,
	Customized,
}
impl ConsistencyLevel {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Strong => "strong",
			Self::Session => "session",
			Self::Bounded => "bounded",
			Self::Eventually => "eventually",
			Self::Customized => "customized",
		}
	}
}
