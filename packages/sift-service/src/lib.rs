pub mod answer;
pub mod cache;
pub mod progress;
pub mod retrieval;
pub mod retrievers;
pub mod time_serde;

mod error;

pub use answer::{
	AnswerPayload, AnswerRequest, AnswerResponse, Capabilities, Diagnostics, SearchRequest,
	SearchResponse, SiftService, SourceRef,
};
pub use cache::{CacheOutcome, CacheProvenance, CacheStats, CacheTier};
pub use error::{Error, Result};
pub use progress::{ChannelProgress, ProgressEvent, ProgressSink};
pub use retrieval::{
	Candidate, DominantPort, EnrichmentFlag, EnrichmentStage, FusedResult, FusionAlgorithm,
	PortLabel, PortReport, PortStatus, RetrievalFilters, RetrievalOutcome, RetrievalQuery,
	Strategy,
};

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One retrieval strategy. Results are best first; failure is an `Err`, never an empty list.
pub trait RetrieverPort
where
	Self: Send + Sync,
{
	fn search<'a>(
		&'a self,
		query: &'a RetrievalQuery,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<Candidate>>>;
}

pub trait TagSource
where
	Self: Send + Sync,
{
	/// Tags for every listed document in one round trip.
	fn tags<'a>(
		&'a self,
		tenant_id: &'a str,
		doc_ids: &'a [Uuid],
	) -> BoxFuture<'a, Result<HashMap<Uuid, Vec<String>>>>;
}

pub trait Reranker
where
	Self: Send + Sync,
{
	/// One score per document, aligned with `docs`.
	fn rerank<'a>(&'a self, query: &'a str, docs: &'a [String]) -> BoxFuture<'a, Result<Vec<f32>>>;
}

pub trait Personalizer
where
	Self: Send + Sync,
{
	/// Returns the same results in the caller's preferred order.
	fn personalize<'a>(
		&'a self,
		query: &'a RetrievalQuery,
		results: Vec<FusedResult>,
	) -> BoxFuture<'a, Result<Vec<FusedResult>>>;
}

pub trait AnswerGenerator
where
	Self: Send + Sync,
{
	fn generate<'a>(
		&'a self,
		question: &'a str,
		context: &'a [FusedResult],
	) -> BoxFuture<'a, Result<AnswerPayload>>;
}

/// A stored cache entry as the store sees it. `entry` is opaque to the store.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheRecord {
	pub fingerprint: String,
	pub scope_key: String,
	pub created_at: OffsetDateTime,
	pub expires_at: OffsetDateTime,
	pub entry: Value,
}

pub trait CacheStore
where
	Self: Send + Sync,
{
	/// Whether `scan` is implemented. Checked once at startup.
	fn supports_scan(&self) -> bool;

	/// The live record for `fingerprint`, if any.
	fn get<'a>(
		&'a self,
		fingerprint: &'a str,
		now: OffsetDateTime,
	) -> BoxFuture<'a, Result<Option<CacheRecord>>>;

	/// Replaces any record stored under the same fingerprint.
	fn put<'a>(&'a self, record: CacheRecord) -> BoxFuture<'a, Result<()>>;

	fn remove<'a>(&'a self, fingerprint: &'a str) -> BoxFuture<'a, Result<bool>>;

	/// Live records sharing `scope_key`, newest first. `Ok(None)` when the store cannot scan.
	fn scan<'a>(
		&'a self,
		scope_key: &'a str,
		now: OffsetDateTime,
		limit: Option<usize>,
	) -> BoxFuture<'a, Result<Option<Vec<CacheRecord>>>>;

	fn purge_expired<'a>(&'a self, now: OffsetDateTime) -> BoxFuture<'a, Result<u64>>;
}

/// Everything the service talks to, injected once at construction.
#[derive(Clone)]
pub struct Ports {
	pub dense: Option<Arc<dyn RetrieverPort>>,
	pub sparse: Option<Arc<dyn RetrieverPort>>,
	pub tags: Option<Arc<dyn TagSource>>,
	pub reranker: Option<Arc<dyn Reranker>>,
	pub personalizer: Option<Arc<dyn Personalizer>>,
	pub generator: Arc<dyn AnswerGenerator>,
	pub cache_store: Option<Arc<dyn CacheStore>>,
}
impl Ports {
	pub fn new(generator: Arc<dyn AnswerGenerator>) -> Self {
		Self {
			dense: None,
			sparse: None,
			tags: None,
			reranker: None,
			personalizer: None,
			generator,
			cache_store: None,
		}
	}
}
