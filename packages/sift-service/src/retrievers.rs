//! Reference adapters wiring the service ports to Qdrant, Postgres and the HTTP providers.

use std::{collections::HashMap, sync::Arc};

use qdrant_client::qdrant::ScoredPoint;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use sift_config::Config;
use sift_storage::{
	db::Db,
	qdrant::{self, QdrantStore, SegmentFilter},
	tags,
};

use crate::{
	AnswerGenerator, AnswerPayload, BoxFuture, CacheStore, Error, Ports, Reranker, Result,
	RetrieverPort, SourceRef, TagSource,
	cache::{MemoryCacheStore, PgCacheStore},
	retrieval::{Candidate, FusedResult, PortLabel, RetrievalQuery},
};

const GENERATION_SYSTEM_PROMPT: &str = "\
Answer the question using only the context segments below. Each segment starts with its id in \
square brackets. Reply with a JSON object {\"answer\": string, \"citations\": [segment ids]}. \
If the context does not contain the answer, say so in the answer and cite nothing.";

/// Connects every configured collaborator and returns the ports for `SiftService::new`.
pub async fn connect(cfg: &Config) -> Result<Ports> {
	let db = Db::connect(&cfg.storage.postgres).await?;

	db.ensure_schema().await?;

	let store = Arc::new(QdrantStore::new(&cfg.storage.qdrant)?);
	let cache_store: Arc<dyn CacheStore> = match cfg.cache.backend.as_str() {
		"memory" => Arc::new(MemoryCacheStore::new()),
		_ => Arc::new(PgCacheStore::new(db.pool.clone())),
	};
	let mut ports = Ports::new(Arc::new(HttpAnswerGenerator::new(cfg.providers.generation.clone())));

	ports.dense = Some(Arc::new(QdrantDenseRetriever::new(
		store.clone(),
		cfg.providers.embedding.clone(),
	)));
	ports.sparse = Some(Arc::new(QdrantSparseRetriever::new(store)));
	ports.tags = Some(Arc::new(PgTagSource::new(db.pool.clone())));
	ports.reranker = Some(Arc::new(HttpReranker::new(cfg.providers.rerank.clone())));
	ports.cache_store = Some(cache_store);

	Ok(ports)
}

/// Embeds the query and searches the dense named vector. Cosine scores are clamped to `[0, 1]`.
pub struct QdrantDenseRetriever {
	store: Arc<QdrantStore>,
	embedding: sift_config::EmbeddingProviderConfig,
}
impl QdrantDenseRetriever {
	pub fn new(store: Arc<QdrantStore>, embedding: sift_config::EmbeddingProviderConfig) -> Self {
		Self { store, embedding }
	}
}
impl RetrieverPort for QdrantDenseRetriever {
	fn search<'a>(
		&'a self,
		query: &'a RetrievalQuery,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<Candidate>>> {
		Box::pin(async move {
			let vectors =
				sift_providers::embedding::embed(&self.embedding, &[query.text.clone()]).await?;
			let vector = vectors.into_iter().next().ok_or_else(|| Error::Provider {
				message: "Embedding provider returned no vectors.".to_string(),
			})?;
			let points = self
				.store
				.dense_search(vector, &segment_filter(query).to_filter(), u64::from(limit))
				.await?;

			Ok(candidates_from_points(points, PortLabel::Dense, |score| score.clamp(0.0, 1.0)))
		})
	}
}

/// Server-side BM25 over the sparse named vector. Scores are divided by the best score of the
/// list so they land in `[0, 1]`.
pub struct QdrantSparseRetriever {
	store: Arc<QdrantStore>,
}
impl QdrantSparseRetriever {
	pub fn new(store: Arc<QdrantStore>) -> Self {
		Self { store }
	}
}
impl RetrieverPort for QdrantSparseRetriever {
	fn search<'a>(
		&'a self,
		query: &'a RetrievalQuery,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<Candidate>>> {
		Box::pin(async move {
			let points = self
				.store
				.bm25_search(&query.text, &segment_filter(query).to_filter(), u64::from(limit))
				.await?;
			let max = points.iter().map(|point| point.score).fold(0.0_f32, f32::max);

			Ok(candidates_from_points(points, PortLabel::Sparse, |score| {
				if max > 0.0 { (score / max).clamp(0.0, 1.0) } else { 0.0 }
			}))
		})
	}
}

pub struct PgTagSource {
	pool: PgPool,
}
impl PgTagSource {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}
impl TagSource for PgTagSource {
	fn tags<'a>(
		&'a self,
		tenant_id: &'a str,
		doc_ids: &'a [Uuid],
	) -> BoxFuture<'a, Result<HashMap<Uuid, Vec<String>>>> {
		Box::pin(async move { Ok(tags::tags_for_documents(&self.pool, tenant_id, doc_ids).await?) })
	}
}

pub struct HttpReranker {
	cfg: sift_config::ProviderConfig,
}
impl HttpReranker {
	pub fn new(cfg: sift_config::ProviderConfig) -> Self {
		Self { cfg }
	}
}
impl Reranker for HttpReranker {
	fn rerank<'a>(&'a self, query: &'a str, docs: &'a [String]) -> BoxFuture<'a, Result<Vec<f32>>> {
		Box::pin(async move { Ok(sift_providers::rerank::rerank(&self.cfg, query, docs).await?) })
	}
}

/// Chat-completion answer generation. Cited ids are resolved against the context; when the
/// model cites nothing recognizable the whole context is returned as provenance.
pub struct HttpAnswerGenerator {
	cfg: sift_config::LlmProviderConfig,
}
impl HttpAnswerGenerator {
	pub fn new(cfg: sift_config::LlmProviderConfig) -> Self {
		Self { cfg }
	}
}
impl AnswerGenerator for HttpAnswerGenerator {
	fn generate<'a>(
		&'a self,
		question: &'a str,
		context: &'a [FusedResult],
	) -> BoxFuture<'a, Result<AnswerPayload>> {
		Box::pin(async move {
			let messages = build_messages(question, context);
			let generated = sift_providers::generation::generate(&self.cfg, &messages)
				.await
				.map_err(|err| Error::Generation { message: err.to_string() })?;

			Ok(AnswerPayload {
				answer: generated.answer,
				provenance: resolve_citations(&generated.citations, context),
			})
		})
	}
}

fn segment_filter(query: &RetrievalQuery) -> SegmentFilter {
	SegmentFilter {
		tenant_id: query.tenant_id.clone(),
		tags: query.filters.tags.clone(),
		doc_types: query.filters.doc_types.clone(),
		updated_after: query.filters.updated_after,
		updated_before: query.filters.updated_before,
	}
}

fn candidates_from_points(
	points: Vec<ScoredPoint>,
	port: PortLabel,
	normalize: impl Fn(f32) -> f32,
) -> Vec<Candidate> {
	let mut out = Vec::with_capacity(points.len());

	for point in points {
		let segment_id = point
			.id
			.as_ref()
			.and_then(qdrant::point_id_to_uuid)
			.or_else(|| qdrant::payload_uuid(&point.payload, "segment_id"));
		let doc_id = qdrant::payload_uuid(&point.payload, "doc_id");
		let (Some(segment_id), Some(doc_id)) = (segment_id, doc_id) else {
			tracing::warn!(port = port.as_str(), "Skipping point without segment or document id.");

			continue;
		};
		let text = qdrant::payload_str(&point.payload, "text").unwrap_or_default().to_string();

		out.push(Candidate {
			segment_id,
			doc_id,
			text,
			score: normalize(point.score),
			port,
			rank: out.len() as u32 + 1,
		});
	}

	out
}

fn build_messages(question: &str, context: &[FusedResult]) -> Vec<Value> {
	let mut user = format!("Question: {question}\n\nContext:\n");

	for result in context {
		let body = result.snippet.as_deref().unwrap_or(&result.text);

		user.push_str(&format!("[{}] {body}\n", result.segment_id));
	}

	vec![
		serde_json::json!({ "role": "system", "content": GENERATION_SYSTEM_PROMPT }),
		serde_json::json!({ "role": "user", "content": user }),
	]
}

fn resolve_citations(citations: &[String], context: &[FusedResult]) -> Vec<SourceRef> {
	let cited: Vec<SourceRef> = context
		.iter()
		.filter(|result| {
			citations.iter().any(|raw| {
				Uuid::parse_str(raw.trim().trim_matches(['[', ']']))
					.is_ok_and(|id| id == result.segment_id || id == result.doc_id)
			})
		})
		.map(|result| SourceRef { segment_id: result.segment_id, doc_id: result.doc_id })
		.collect();

	if !cited.is_empty() {
		return cited;
	}

	context
		.iter()
		.map(|result| SourceRef { segment_id: result.segment_id, doc_id: result.doc_id })
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn result(segment: u128, doc: u128) -> FusedResult {
		FusedResult {
			segment_id: Uuid::from_u128(segment),
			doc_id: Uuid::from_u128(doc),
			text: format!("segment {segment}"),
			combined_score: 0.5,
			rank: 1,
			ports: vec![PortLabel::Dense],
			dense: None,
			sparse: None,
			snippet: None,
			tags: Vec::new(),
			rerank_score: None,
		}
	}

	#[test]
	fn citations_resolve_by_segment_or_document() {
		let context = vec![result(1, 10), result(2, 20), result(3, 30)];
		let citations = vec![
			format!("[{}]", Uuid::from_u128(2)),
			Uuid::from_u128(30).to_string(),
			"not-an-id".to_string(),
		];
		let refs = resolve_citations(&citations, &context);

		assert_eq!(
			refs.iter().map(|r| r.segment_id).collect::<Vec<_>>(),
			vec![Uuid::from_u128(2), Uuid::from_u128(3)]
		);
	}

	#[test]
	fn uncited_answers_fall_back_to_whole_context() {
		let context = vec![result(1, 10), result(2, 20)];

		assert_eq!(resolve_citations(&[], &context).len(), 2);
	}

	#[test]
	fn messages_label_segments_and_prefer_snippets() {
		let mut with_snippet = result(1, 10);

		with_snippet.snippet = Some("short".to_string());

		let messages = build_messages("why?", &[with_snippet, result(2, 20)]);
		let user = messages[1]["content"].as_str().expect("user content");

		assert!(user.starts_with("Question: why?"));
		assert!(user.contains(&format!("[{}] short", Uuid::from_u128(1))));
		assert!(user.contains(&format!("[{}] segment 2", Uuid::from_u128(2))));
	}
}
