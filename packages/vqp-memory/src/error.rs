pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Failed to read fixture at {}: {source}", path.display())]
	ReadFixture { path: std::path::PathBuf, source: std::io::Error },
	#[error("Failed to parse fixture: {0}")]
	ParseFixture(#[from] serde_json::Error),
	#[error("Invalid fixture: {message}")]
	Fixture { message: String },
	#[error(transparent)]
	Search(#[from] vqp_search::Error),
}
impl Error {
	pub(crate) fn fixture(message: impl Into<String>) -> Self {
		Self::Fixture { message: message.into() }
	}
}
