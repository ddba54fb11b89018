use std::{collections::HashSet, time::Duration};

use uuid::Uuid;

use sift_domain::{snippet, tokens::TokenSet};

use super::{
	EnrichmentFlag, EnrichmentStage, FusedResult, RetrievalQuery, cmp_f32_desc, reassign_ranks,
};
use crate::{Personalizer, Reranker, TagSource};

/// The optional collaborators of the enrichment stage. Every step is fail-open.
pub struct EnrichmentStages<'a> {
	pub tags: Option<&'a dyn TagSource>,
	pub reranker: Option<&'a dyn Reranker>,
	pub personalizer: Option<&'a dyn Personalizer>,
	pub snippet_chars: usize,
	pub step_timeout: Duration,
}

/// Attaches tags and snippets, then applies the reranker and personalizer if present.
///
/// A failing step leaves the list as it was before that step and records a flag.
pub async fn enrich(
	query: &RetrievalQuery,
	mut results: Vec<FusedResult>,
	stages: &EnrichmentStages<'_>,
) -> (Vec<FusedResult>, Vec<EnrichmentFlag>) {
	let mut flags = Vec::new();

	if results.is_empty() {
		return (results, flags);
	}
	if let Some(source) = stages.tags
		&& let Err(reason) = attach_tags(source, query, &mut results, stages.step_timeout).await
	{
		flags.push(flag(EnrichmentStage::Tags, reason));
	}

	let terms = TokenSet::from_normalized(&query.text).into_inner();

	for result in &mut results {
		result.snippet = Some(snippet::extract_snippet(&result.text, &terms, stages.snippet_chars));
	}

	if let Some(reranker) = stages.reranker {
		match rerank(reranker, query, &results, stages.step_timeout).await {
			Ok(reranked) => results = reranked,
			Err(reason) => flags.push(flag(EnrichmentStage::Rerank, reason)),
		}
	}
	if let Some(personalizer) = stages.personalizer {
		match personalize(personalizer, query, &results, stages.step_timeout).await {
			Ok(personalized) => results = personalized,
			Err(reason) => flags.push(flag(EnrichmentStage::Personalize, reason)),
		}
	}

	(results, flags)
}

fn flag(stage: EnrichmentStage, reason: String) -> EnrichmentFlag {
	tracing::warn!(stage = ?stage, reason = %reason, "Enrichment step failed. Keeping prior order.");

	EnrichmentFlag { stage, reason }
}

fn timed_out(step_timeout: Duration) -> String {
	format!("timed out after {} ms", step_timeout.as_millis())
}

async fn attach_tags(
	source: &dyn TagSource,
	query: &RetrievalQuery,
	results: &mut [FusedResult],
	step_timeout: Duration,
) -> Result<(), String> {
	let mut seen = HashSet::new();
	let doc_ids: Vec<Uuid> =
		results.iter().map(|result| result.doc_id).filter(|doc_id| seen.insert(*doc_id)).collect();
	let tags = match tokio::time::timeout(step_timeout, source.tags(&query.tenant_id, &doc_ids))
		.await
	{
		Ok(Ok(tags)) => tags,
		Ok(Err(err)) => return Err(err.to_string()),
		Err(_) => return Err(timed_out(step_timeout)),
	};

	for result in results {
		if let Some(found) = tags.get(&result.doc_id) {
			result.tags = found.clone();
		}
	}

	Ok(())
}

/// Orders by rerank score, ties keeping the fused order. The rerank score becomes the combined
/// score so the list stays monotonic.
async fn rerank(
	reranker: &dyn Reranker,
	query: &RetrievalQuery,
	results: &[FusedResult],
	step_timeout: Duration,
) -> Result<Vec<FusedResult>, String> {
	let docs: Vec<String> = results.iter().map(|result| result.text.clone()).collect();
	let scores = match tokio::time::timeout(step_timeout, reranker.rerank(&query.text, &docs)).await
	{
		Ok(Ok(scores)) => scores,
		Ok(Err(err)) => return Err(err.to_string()),
		Err(_) => return Err(timed_out(step_timeout)),
	};

	if scores.len() != results.len() {
		return Err(format!(
			"reranker returned {} scores for {} results",
			scores.len(),
			results.len()
		));
	}
	if scores.iter().any(|score| !score.is_finite()) {
		return Err("reranker returned a non-finite score".to_string());
	}

	let mut reranked: Vec<FusedResult> = results
		.iter()
		.cloned()
		.zip(scores)
		.map(|(mut result, score)| {
			result.rerank_score = Some(score);
			result.combined_score = score;

			result
		})
		.collect();

	reranked.sort_by(|a, b| {
		cmp_f32_desc(a.combined_score, b.combined_score).then_with(|| a.rank.cmp(&b.rank))
	});
	reassign_ranks(&mut reranked);

	Ok(reranked)
}

async fn personalize(
	personalizer: &dyn Personalizer,
	query: &RetrievalQuery,
	results: &[FusedResult],
	step_timeout: Duration,
) -> Result<Vec<FusedResult>, String> {
	let mut personalized = match tokio::time::timeout(
		step_timeout,
		personalizer.personalize(query, results.to_vec()),
	)
	.await
	{
		Ok(Ok(personalized)) => personalized,
		Ok(Err(err)) => return Err(err.to_string()),
		Err(_) => return Err(timed_out(step_timeout)),
	};
	let before: HashSet<Uuid> = results.iter().map(|result| result.segment_id).collect();
	let after: HashSet<Uuid> = personalized.iter().map(|result| result.segment_id).collect();

	if personalized.len() != results.len() || before != after {
		return Err("personalizer changed the result set".to_string());
	}

	reassign_ranks(&mut personalized);

	Ok(personalized)
}
