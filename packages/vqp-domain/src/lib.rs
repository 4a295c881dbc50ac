pub mod consistency;
pub mod metric;
pub mod plan;
pub mod schema;
pub mod tso;
pub mod value;

pub use consistency::ConsistencyLevel;
pub use metric::MetricType;
pub use schema::{
	CollectionSchema, DEFAULT_DB_NAME, DataType, FieldSchema, FunctionKind, FunctionSchema,
};
pub use tso::Timestamp;
pub use value::{FieldData, FieldValue, PrimaryKey};
