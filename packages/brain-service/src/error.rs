pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Unknown user: {user_id}.")]
	UnknownUser { user_id: uuid::Uuid },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Retrieval was cancelled.")]
	Cancelled,
	#[error("{stage} timed out after {timeout_ms} ms.")]
	Timeout { stage: &'static str, timeout_ms: u64 },
	#[error("Embedding mismatch: {message}")]
	EmbeddingMismatch { message: String },
	#[error("Invalid structured output: {message}")]
	StructuredOutput { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
	#[error("Qdrant error: {message}")]
	Qdrant { message: String },
}
impl Error {
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}
}

impl From<brain_providers::Error> for Error {
	fn from(err: brain_providers::Error) -> Self {
		Self::Provider { message: err.to_string() }
	}
}

impl From<brain_storage::Error> for Error {
	fn from(err: brain_storage::Error) -> Self {
		match err {
			brain_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			brain_storage::Error::InvalidArgument(message) => Self::InvalidRequest { message },
			brain_storage::Error::NotFound(message) => Self::NotFound { message },
			brain_storage::Error::Qdrant(inner) => Self::Qdrant { message: inner.to_string() },
		}
	}
}

impl From<brain_config::Error> for Error {
	fn from(err: brain_config::Error) -> Self {
		Self::InvalidRequest { message: err.to_string() }
	}
}
