use std::{
	collections::BTreeMap,
	time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sift_config::Config;
use sift_domain::normalize;

use crate::{
	Error, Ports, Result,
	cache::{AnswerCache, CacheHit, CacheKey, CacheOutcome, CacheProvenance, CacheScope, CacheStats},
	progress::{ProgressEvent, ProgressSink},
	retrieval::{
		DominantPort, EnrichmentFlag, FusedResult, FusionAlgorithm, PortLabel, PortReport,
		RetrievalFilters, RetrievalOutcome, RetrievalQuery, Strategy,
		engine::FusionEngine,
		enrich::{self, EnrichmentStages},
	},
};

pub const DEFAULT_PROMPT_TEMPLATE_ID: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
	pub segment_id: Uuid,
	pub doc_id: Uuid,
}

/// What the generation step produces and the cache stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
	pub answer: String,
	#[serde(default)]
	pub provenance: Vec<SourceRef>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AnswerRequest {
	pub tenant_id: String,
	pub caller_id: String,
	pub question: String,
	#[serde(default)]
	pub limit: Option<u32>,
	#[serde(default)]
	pub strategy: Option<Strategy>,
	#[serde(default)]
	pub algorithm: Option<FusionAlgorithm>,
	#[serde(default)]
	pub filters: RetrievalFilters,
	#[serde(default)]
	pub prompt_template_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SearchRequest {
	pub tenant_id: String,
	pub caller_id: String,
	pub query: String,
	#[serde(default)]
	pub limit: Option<u32>,
	#[serde(default)]
	pub strategy: Option<Strategy>,
	#[serde(default)]
	pub algorithm: Option<FusionAlgorithm>,
	#[serde(default)]
	pub filters: RetrievalFilters,
}

#[derive(Clone, Debug, Serialize)]
pub struct AnswerResponse {
	pub answer: String,
	pub provenance: Vec<SourceRef>,
	/// Empty when the answer came from the cache.
	pub results: Vec<FusedResult>,
	pub cache_provenance: Option<CacheProvenance>,
	pub diagnostics: Diagnostics,
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchResponse {
	pub results: Vec<FusedResult>,
	pub diagnostics: Diagnostics,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Diagnostics {
	pub ports_queried: Vec<PortLabel>,
	pub ports_succeeded: Vec<PortLabel>,
	pub dominant_port: DominantPort,
	pub fusion_algorithm: Option<FusionAlgorithm>,
	pub fused_count: usize,
	/// `None` when the cache was not consulted.
	pub cache_outcome: Option<CacheOutcome>,
	pub latency_per_port: BTreeMap<PortLabel, u64>,
	pub port_reports: Vec<PortReport>,
	pub single_source: bool,
	pub enrichment_flags: Vec<EnrichmentFlag>,
	pub cache_similarity: Option<f32>,
	pub total_latency_ms: u64,
}
impl Diagnostics {
	fn from_outcome(outcome: &RetrievalOutcome, cache_outcome: Option<CacheOutcome>) -> Self {
		Self {
			ports_queried: outcome.ports_queried.clone(),
			ports_succeeded: outcome.ports_succeeded.clone(),
			dominant_port: outcome.dominant_port,
			fusion_algorithm: Some(outcome.algorithm),
			fused_count: outcome.results.len(),
			cache_outcome,
			latency_per_port: outcome
				.port_reports
				.iter()
				.map(|report| (report.port, report.latency_ms))
				.collect(),
			port_reports: outcome.port_reports.clone(),
			single_source: outcome.single_source,
			enrichment_flags: outcome.enrichment_flags.clone(),
			cache_similarity: None,
			total_latency_ms: 0,
		}
	}

	fn from_cache_hit(hit: &CacheHit) -> Self {
		Self {
			ports_queried: Vec::new(),
			ports_succeeded: Vec::new(),
			dominant_port: DominantPort::None,
			fusion_algorithm: None,
			fused_count: 0,
			cache_outcome: Some(hit.outcome),
			latency_per_port: BTreeMap::new(),
			port_reports: Vec::new(),
			single_source: false,
			enrichment_flags: Vec::new(),
			cache_similarity: Some(hit.similarity),
			total_latency_ms: 0,
		}
	}
}

/// What was wired in at construction. Requests consult this instead of probing ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Capabilities {
	pub dense: bool,
	pub sparse: bool,
	pub tags: bool,
	pub reranker: bool,
	pub personalizer: bool,
	pub cache: bool,
	pub near_duplicate: bool,
}

pub struct SiftService {
	cfg: Config,
	engine: FusionEngine,
	ports: Ports,
	cache: Option<AnswerCache>,
	capabilities: Capabilities,
	default_strategy: Strategy,
	default_algorithm: FusionAlgorithm,
}
impl SiftService {
	pub fn new(cfg: Config, ports: Ports) -> Result<Self> {
		let default_strategy = cfg.retrieval.default_strategy.parse()?;
		let default_algorithm = cfg.retrieval.fusion.algorithm.parse()?;
		let engine = FusionEngine::new(&cfg.retrieval, ports.dense.clone(), ports.sparse.clone());
		let cache = match (&ports.cache_store, cfg.cache.enabled) {
			(Some(store), true) => Some(AnswerCache::new(cfg.cache.clone(), store.clone())),
			_ => None,
		};
		let capabilities = Capabilities {
			dense: engine.has_port(PortLabel::Dense),
			sparse: engine.has_port(PortLabel::Sparse),
			tags: ports.tags.is_some() && cfg.enrichment.tags_enabled,
			reranker: ports.reranker.is_some() && cfg.enrichment.rerank_enabled,
			personalizer: ports.personalizer.is_some() && cfg.enrichment.personalize_enabled,
			cache: cache.is_some(),
			near_duplicate: cache.as_ref().is_some_and(AnswerCache::near_duplicate_enabled),
		};

		tracing::info!(
			dense = capabilities.dense,
			sparse = capabilities.sparse,
			tags = capabilities.tags,
			reranker = capabilities.reranker,
			personalizer = capabilities.personalizer,
			cache = capabilities.cache,
			near_duplicate = capabilities.near_duplicate,
			"Service capabilities."
		);

		Ok(Self { cfg, engine, ports, cache, capabilities, default_strategy, default_algorithm })
	}

	pub fn config(&self) -> &Config {
		&self.cfg
	}

	pub fn capabilities(&self) -> Capabilities {
		self.capabilities
	}

	pub fn cache_stats(&self) -> Option<CacheStats> {
		self.cache.as_ref().map(AnswerCache::stats)
	}

	/// Cache fingerprint the request would be stored under.
	pub fn fingerprint(&self, req: &AnswerRequest) -> Result<String> {
		let query = self.build_query(
			&req.tenant_id,
			&req.question,
			req.limit,
			req.strategy,
			req.algorithm,
			req.filters.clone(),
		)?;

		Ok(CacheKey::new(&query.text, &self.cache_scope(req, &query))?.fingerprint)
	}

	pub async fn invalidate(&self, fingerprint: &str) -> Result<bool> {
		match &self.cache {
			Some(cache) => cache.invalidate(fingerprint).await,
			None => Ok(false),
		}
	}

	pub async fn purge_expired(&self) -> Result<u64> {
		match &self.cache {
			Some(cache) => cache.purge_expired(OffsetDateTime::now_utc()).await,
			None => Ok(0),
		}
	}

	/// Answers from the cache when possible, otherwise retrieves, enriches, generates and
	/// caches the result.
	///
	/// Nothing is cached when the request is cancelled or generation fails.
	pub async fn answer(
		&self,
		req: AnswerRequest,
		cancel: &CancellationToken,
		progress: Option<&dyn ProgressSink>,
	) -> Result<AnswerResponse> {
		let started = Instant::now();
		let query = self.build_query(
			&req.tenant_id,
			&req.question,
			req.limit,
			req.strategy,
			req.algorithm,
			req.filters.clone(),
		)?;

		if cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		let cache_key = match &self.cache {
			Some(_) => Some(CacheKey::new(&query.text, &self.cache_scope(&req, &query))?),
			None => None,
		};

		if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
			let hit = cache.lookup(key, OffsetDateTime::now_utc()).await;

			emit(
				progress,
				ProgressEvent::CacheChecked {
					outcome: hit.as_ref().map_or(CacheOutcome::Miss, |hit| hit.outcome),
					similarity: hit.as_ref().map(|hit| hit.similarity),
				},
			);

			if let Some(hit) = hit {
				let mut diagnostics = Diagnostics::from_cache_hit(&hit);

				diagnostics.total_latency_ms = elapsed_ms(started);

				tracing::info!(
					cache_outcome = hit.outcome.as_str(),
					similarity = hit.similarity,
					latency_ms = diagnostics.total_latency_ms,
					"Answer served from cache."
				);
				emit(progress, ProgressEvent::Completed { cache_outcome: Some(hit.outcome) });

				return Ok(AnswerResponse {
					answer: hit.entry.payload.answer,
					provenance: hit.entry.payload.provenance,
					results: Vec::new(),
					cache_provenance: hit.entry.provenance,
					diagnostics,
				});
			}
		}

		let outcome = self.retrieve_and_enrich(&query, cancel, progress).await?;

		emit(progress, ProgressEvent::Generating { context_len: outcome.results.len() });

		let payload = self.generate(req.question.trim(), &outcome.results, cancel).await?;
		let cache_outcome = cache_key.as_ref().map(|_| CacheOutcome::Miss);

		if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
			cache.store(key, &payload, OffsetDateTime::now_utc()).await;
		}

		let mut diagnostics = Diagnostics::from_outcome(&outcome, cache_outcome);

		diagnostics.total_latency_ms = elapsed_ms(started);

		tracing::info!(
			strategy = query.strategy.as_str(),
			algorithm = outcome.algorithm.as_str(),
			dominant_port = outcome.dominant_port.as_str(),
			fused_count = outcome.results.len(),
			single_source = outcome.single_source,
			latency_ms = diagnostics.total_latency_ms,
			"Answer generated."
		);
		emit(progress, ProgressEvent::Completed { cache_outcome });

		Ok(AnswerResponse {
			answer: payload.answer,
			provenance: payload.provenance,
			results: outcome.results,
			cache_provenance: None,
			diagnostics,
		})
	}

	/// Retrieval and enrichment only. The cache is neither read nor written.
	pub async fn search(
		&self,
		req: SearchRequest,
		cancel: &CancellationToken,
		progress: Option<&dyn ProgressSink>,
	) -> Result<SearchResponse> {
		let started = Instant::now();
		let query = self.build_query(
			&req.tenant_id,
			&req.query,
			req.limit,
			req.strategy,
			req.algorithm,
			req.filters,
		)?;

		if cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		let outcome = self.retrieve_and_enrich(&query, cancel, progress).await?;
		let mut diagnostics = Diagnostics::from_outcome(&outcome, None);

		diagnostics.total_latency_ms = elapsed_ms(started);

		emit(progress, ProgressEvent::Completed { cache_outcome: None });

		Ok(SearchResponse { results: outcome.results, diagnostics })
	}

	fn build_query(
		&self,
		tenant_id: &str,
		raw: &str,
		limit: Option<u32>,
		strategy: Option<Strategy>,
		algorithm: Option<FusionAlgorithm>,
		filters: RetrievalFilters,
	) -> Result<RetrievalQuery> {
		if normalize::is_blank(tenant_id) {
			return Err(Error::InvalidRequest { message: "tenant_id must be non-empty.".to_string() });
		}
		if normalize::is_blank(raw) {
			return Err(Error::InvalidRequest { message: "Question must be non-empty.".to_string() });
		}

		let limit = limit.unwrap_or(self.cfg.retrieval.default_limit);

		if limit == 0 || limit > self.cfg.retrieval.max_limit {
			return Err(Error::InvalidRequest {
				message: format!(
					"limit must be between 1 and {}, got {limit}.",
					self.cfg.retrieval.max_limit
				),
			});
		}
		if let (Some(after), Some(before)) = (filters.updated_after, filters.updated_before)
			&& after > before
		{
			return Err(Error::InvalidRequest {
				message: "updated_after must not be later than updated_before.".to_string(),
			});
		}

		Ok(RetrievalQuery {
			text: normalize::normalize_query(raw),
			tenant_id: tenant_id.trim().to_string(),
			filters,
			limit,
			strategy: strategy.unwrap_or(self.default_strategy),
			algorithm: algorithm.unwrap_or(self.default_algorithm),
		})
	}

	fn cache_scope(&self, req: &AnswerRequest, query: &RetrievalQuery) -> CacheScope {
		CacheScope {
			search_type: query.strategy,
			algorithm: query.algorithm,
			filters: query.filters.clone(),
			prompt_template_id: req
				.prompt_template_id
				.as_deref()
				.map(str::trim)
				.filter(|id| !id.is_empty())
				.unwrap_or(DEFAULT_PROMPT_TEMPLATE_ID)
				.to_string(),
			result_limit: query.limit,
			caller_identity: format!("{}/{}", query.tenant_id, req.caller_id.trim()),
		}
	}

	async fn retrieve_and_enrich(
		&self,
		query: &RetrievalQuery,
		cancel: &CancellationToken,
		progress: Option<&dyn ProgressSink>,
	) -> Result<RetrievalOutcome> {
		let mut outcome = self.engine.retrieve(query, cancel, progress).await?;
		let stages = EnrichmentStages {
			tags: self.ports.tags.as_deref().filter(|_| self.capabilities.tags),
			reranker: self.ports.reranker.as_deref().filter(|_| self.capabilities.reranker),
			personalizer: self
				.ports
				.personalizer
				.as_deref()
				.filter(|_| self.capabilities.personalizer),
			snippet_chars: self.cfg.enrichment.snippet_chars as usize,
			step_timeout: Duration::from_millis(self.cfg.retrieval.port_timeout_ms),
		};
		let fused = std::mem::take(&mut outcome.results);
		let (results, flags) = tokio::select! {
			biased;

			_ = cancel.cancelled() => return Err(Error::Cancelled),
			enriched = enrich::enrich(query, fused, &stages) => enriched,
		};

		emit(progress, ProgressEvent::Enriched { flags: flags.clone() });

		outcome.results = results;
		outcome.enrichment_flags = flags;

		Ok(outcome)
	}

	async fn generate(
		&self,
		question: &str,
		context: &[FusedResult],
		cancel: &CancellationToken,
	) -> Result<AnswerPayload> {
		let limit = Duration::from_millis(self.cfg.retrieval.generation_timeout_ms);
		let result = tokio::select! {
			biased;

			_ = cancel.cancelled() => return Err(Error::Cancelled),
			result = tokio::time::timeout(limit, self.ports.generator.generate(question, context)) =>
				result,
		};

		match result {
			Ok(Ok(payload)) => Ok(payload),
			Ok(Err(err @ Error::Generation { .. })) => Err(err),
			Ok(Err(err)) => {
				tracing::warn!(error = %err, "Answer generation failed.");

				Err(Error::Generation { message: err.to_string() })
			},
			Err(_) => {
				tracing::warn!(timeout_ms = limit.as_millis() as u64, "Answer generation timed out.");

				Err(Error::Generation {
					message: format!("Timed out after {} ms.", limit.as_millis()),
				})
			},
		}
	}
}

fn emit(progress: Option<&dyn ProgressSink>, event: ProgressEvent) {
	if let Some(sink) = progress {
		sink.emit(event);
	}
}

fn elapsed_ms(started: Instant) -> u64 {
	started.elapsed().as_millis() as u64
}
