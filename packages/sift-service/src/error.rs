use crate::retrieval::PortReport;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("No retriever available: {}", describe_failures(.failures))]
	NoRetrieverAvailable { failures: Vec<PortReport> },
	#[error("Request cancelled.")]
	Cancelled,
	#[error("Generation error: {message}")]
	Generation { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
	#[error("Qdrant error: {message}")]
	Qdrant { message: String },
}
impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}

impl From<sift_storage::Error> for Error {
	fn from(err: sift_storage::Error) -> Self {
		match err {
			sift_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			sift_storage::Error::InvalidArgument(message) => Self::InvalidRequest { message },
			sift_storage::Error::Qdrant(inner) => Self::Qdrant { message: inner.to_string() },
		}
	}
}

impl From<sift_providers::Error> for Error {
	fn from(err: sift_providers::Error) -> Self {
		Self::Provider { message: err.to_string() }
	}
}

fn describe_failures(failures: &[PortReport]) -> String {
	if failures.is_empty() {
		return "no ports configured".to_string();
	}

	failures
		.iter()
		.map(|report| match report.reason.as_deref() {
			Some(reason) =>
				format!("{} {} ({reason})", report.port.as_str(), report.status.as_str()),
			None => format!("{} {}", report.port.as_str(), report.status.as_str()),
		})
		.collect::<Vec<_>>()
		.join("; ")
}
