use std::{
	collections::{BTreeMap, HashSet},
	fs,
	path::{Path, PathBuf},
	time::Instant,
};

use clap::{Parser, ValueEnum};
use color_eyre::eyre;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sift_service::{
	AnswerRequest, CacheOutcome, CacheStats, Diagnostics, DominantPort, FusionAlgorithm,
	RetrievalFilters, SearchRequest, SiftService, Strategy,
};

const DEFAULT_CALLER_ID: &str = "sift-eval";

#[derive(Debug, Parser)]
#[command(
	version = sift_cli::VERSION,
	rename_all = "kebab",
	styles = sift_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	#[arg(long, short = 'd', value_name = "FILE")]
	pub dataset: PathBuf,
	/// `search` scores retrieval only; `answer` goes through the cache and generation.
	#[arg(long, value_enum, default_value_t = Mode::Search)]
	pub mode: Mode,
	#[arg(long, value_name = "N")]
	pub limit: Option<u32>,
	#[arg(long, value_name = "NAME")]
	pub strategy: Option<String>,
	#[arg(long, value_name = "NAME")]
	pub algorithm: Option<String>,
	#[arg(long, value_name = "N", default_value_t = 1)]
	pub runs_per_query: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
	Search,
	Answer,
}

#[derive(Debug, Deserialize)]
struct EvalDataset {
	name: Option<String>,
	#[serde(default)]
	defaults: EvalDefaults,
	queries: Vec<EvalQuery>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct EvalDefaults {
	tenant_id: Option<String>,
	caller_id: Option<String>,
	limit: Option<u32>,
	strategy: Option<Strategy>,
	algorithm: Option<FusionAlgorithm>,
}

#[derive(Debug, Deserialize)]
struct EvalQuery {
	id: Option<String>,
	query: String,
	tenant_id: Option<String>,
	caller_id: Option<String>,
	limit: Option<u32>,
	strategy: Option<Strategy>,
	#[serde(default)]
	filters: RetrievalFilters,
	#[serde(default)]
	expected_segment_ids: Vec<Uuid>,
}

#[derive(Debug)]
struct MergedQuery {
	id: String,
	query: String,
	tenant_id: String,
	caller_id: String,
	limit: Option<u32>,
	strategy: Option<Strategy>,
	algorithm: Option<FusionAlgorithm>,
	filters: RetrievalFilters,
	expected_segment_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct EvalOutput {
	dataset: EvalDatasetInfo,
	settings: EvalSettings,
	summary: EvalSummary,
	queries: Vec<QueryReport>,
}

#[derive(Debug, Serialize)]
struct EvalDatasetInfo {
	name: String,
	query_count: usize,
}

#[derive(Debug, Serialize)]
struct EvalSettings {
	config_path: String,
	mode: Mode,
	limit: u32,
	runs_per_query: u32,
}

#[derive(Debug, Serialize)]
struct EvalSummary {
	avg_recall_at_k: f64,
	avg_precision_at_k: f64,
	mean_rr: f64,
	mean_ndcg: f64,
	latency_ms_p50: f64,
	latency_ms_p95: f64,
	dominant_ports: BTreeMap<&'static str, usize>,
	cache_outcomes: BTreeMap<&'static str, usize>,
	single_source_count: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	stability: Option<StabilitySummary>,
	#[serde(skip_serializing_if = "Option::is_none")]
	cache: Option<CacheStats>,
}

#[derive(Debug, Serialize)]
struct StabilitySummary {
	runs_per_query: u32,
	avg_positional_churn_at_k: f64,
	avg_set_churn_at_k: f64,
}

#[derive(Debug, Serialize)]
struct QueryReport {
	id: String,
	query: String,
	expected_count: usize,
	retrieved_count: usize,
	relevant_count: usize,
	recall_at_k: f64,
	precision_at_k: f64,
	rr: f64,
	ndcg: f64,
	latency_ms: f64,
	dominant_port: DominantPort,
	single_source: bool,
	/// One entry per run. Empty in search mode.
	cache_outcomes: Vec<CacheOutcome>,
	enrichment_flags: usize,
	expected_segment_ids: Vec<Uuid>,
	retrieved_segment_ids: Vec<Uuid>,
	#[serde(skip_serializing_if = "Option::is_none")]
	stability: Option<QueryStability>,
}

#[derive(Clone, Copy, Debug, Serialize)]
struct QueryStability {
	runs_per_query: u32,
	positional_churn_at_k: f64,
	set_churn_at_k: f64,
}

struct Metrics {
	recall_at_k: f64,
	precision_at_k: f64,
	rr: f64,
	ndcg: f64,
	relevant_count: usize,
}

struct RunResult {
	retrieved: Vec<Uuid>,
	diagnostics: Diagnostics,
	latency_ms: f64,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let cfg = sift_config::load(&args.config)?;
	let filter = EnvFilter::new(cfg.service.log_level.clone());

	tracing_subscriber::fmt().with_env_filter(filter).init();

	let dataset = load_dataset(&args.dataset)?;
	let ports = sift_service::retrievers::connect(&cfg).await?;
	let service = SiftService::new(cfg, ports)?;
	let output = evaluate(&service, &args, &dataset).await?;
	let json = serde_json::to_string_pretty(&output)?;

	println!("{json}");

	Ok(())
}

fn load_dataset(path: &Path) -> color_eyre::Result<EvalDataset> {
	let raw = fs::read_to_string(path)?;
	let dataset: EvalDataset = serde_json::from_str(&raw)?;

	if dataset.queries.is_empty() {
		return Err(eyre::eyre!("Dataset must include at least one query."));
	}

	Ok(dataset)
}

async fn evaluate(
	service: &SiftService,
	args: &Args,
	dataset: &EvalDataset,
) -> color_eyre::Result<EvalOutput> {
	let runs_per_query = args.runs_per_query.max(1);
	let cancel = CancellationToken::new();
	let mut reports = Vec::with_capacity(dataset.queries.len());
	let mut latencies_ms = Vec::with_capacity(dataset.queries.len());

	for (index, query) in dataset.queries.iter().enumerate() {
		let merged = merge_query(&dataset.defaults, query, args, index)?;
		let expected: HashSet<Uuid> = merged.expected_segment_ids.iter().copied().collect();
		let mut runs = Vec::with_capacity(runs_per_query as usize);

		for _ in 0..runs_per_query {
			runs.push(run_once(service, args.mode, &merged, &cancel).await?);
		}

		let first = &runs[0];
		let metrics = compute_metrics(&first.retrieved, &expected);
		let latency_ms = runs.iter().map(|run| run.latency_ms).sum::<f64>() / runs.len() as f64;
		let k = merged.limit.unwrap_or(service.config().retrieval.default_limit).max(1) as usize;
		let stability = query_stability(&runs, k, runs_per_query);

		tracing::info!(
			id = merged.id.as_str(),
			dominant_port = first.diagnostics.dominant_port.as_str(),
			latency_ms,
			recall_at_k = metrics.recall_at_k,
			"Evaluated query."
		);

		reports.push(QueryReport {
			id: merged.id,
			query: merged.query,
			expected_count: expected.len(),
			retrieved_count: first.retrieved.len(),
			relevant_count: metrics.relevant_count,
			recall_at_k: metrics.recall_at_k,
			precision_at_k: metrics.precision_at_k,
			rr: metrics.rr,
			ndcg: metrics.ndcg,
			latency_ms,
			dominant_port: first.diagnostics.dominant_port,
			single_source: first.diagnostics.single_source,
			cache_outcomes: runs.iter().filter_map(|run| run.diagnostics.cache_outcome).collect(),
			enrichment_flags: first.diagnostics.enrichment_flags.len(),
			expected_segment_ids: merged.expected_segment_ids,
			retrieved_segment_ids: first.retrieved.clone(),
			stability,
		});

		latencies_ms.push(latency_ms);
	}

	let mut summary = summarize(&reports, &latencies_ms, runs_per_query);

	summary.cache = service.cache_stats().filter(|_| args.mode == Mode::Answer);

	Ok(EvalOutput {
		dataset: EvalDatasetInfo {
			name: dataset.name.clone().unwrap_or_else(|| "eval".to_string()),
			query_count: reports.len(),
		},
		settings: EvalSettings {
			config_path: args.config.display().to_string(),
			mode: args.mode,
			limit: args
				.limit
				.or(dataset.defaults.limit)
				.unwrap_or(service.config().retrieval.default_limit),
			runs_per_query,
		},
		summary,
		queries: reports,
	})
}

fn merge_query(
	defaults: &EvalDefaults,
	query: &EvalQuery,
	args: &Args,
	index: usize,
) -> color_eyre::Result<MergedQuery> {
	let tenant_id = query
		.tenant_id
		.clone()
		.or_else(|| defaults.tenant_id.clone())
		.ok_or_else(|| eyre::eyre!("Query {index} has no tenant_id and no default is set."))?;
	let strategy = match &args.strategy {
		Some(raw) => Some(raw.parse::<Strategy>()?),
		None => query.strategy.or(defaults.strategy),
	};
	let algorithm = match &args.algorithm {
		Some(raw) => Some(raw.parse::<FusionAlgorithm>()?),
		None => defaults.algorithm,
	};

	Ok(MergedQuery {
		id: query.id.clone().unwrap_or_else(|| format!("q{}", index + 1)),
		query: query.query.clone(),
		tenant_id,
		caller_id: query
			.caller_id
			.clone()
			.or_else(|| defaults.caller_id.clone())
			.unwrap_or_else(|| DEFAULT_CALLER_ID.to_string()),
		limit: args.limit.or(query.limit).or(defaults.limit),
		strategy,
		algorithm,
		filters: query.filters.clone(),
		expected_segment_ids: query.expected_segment_ids.clone(),
	})
}

async fn run_once(
	service: &SiftService,
	mode: Mode,
	query: &MergedQuery,
	cancel: &CancellationToken,
) -> color_eyre::Result<RunResult> {
	let start = Instant::now();
	let (retrieved, diagnostics) = match mode {
		Mode::Search => {
			let response = service
				.search(
					SearchRequest {
						tenant_id: query.tenant_id.clone(),
						caller_id: query.caller_id.clone(),
						query: query.query.clone(),
						limit: query.limit,
						strategy: query.strategy,
						algorithm: query.algorithm,
						filters: query.filters.clone(),
					},
					cancel,
					None,
				)
				.await?;

			(unique_ids(response.results.iter().map(|result| result.segment_id)), response.diagnostics)
		},
		Mode::Answer => {
			let response = service
				.answer(
					AnswerRequest {
						tenant_id: query.tenant_id.clone(),
						caller_id: query.caller_id.clone(),
						question: query.query.clone(),
						limit: query.limit,
						strategy: query.strategy,
						algorithm: query.algorithm,
						filters: query.filters.clone(),
						prompt_template_id: None,
					},
					cancel,
					None,
				)
				.await?;
			// Cache hits carry no results; the cited segments stand in for them.
			let retrieved = if response.results.is_empty() {
				unique_ids(response.provenance.iter().map(|source| source.segment_id))
			} else {
				unique_ids(response.results.iter().map(|result| result.segment_id))
			};

			(retrieved, response.diagnostics)
		},
	};

	Ok(RunResult { retrieved, diagnostics, latency_ms: start.elapsed().as_secs_f64() * 1_000.0 })
}

fn query_stability(runs: &[RunResult], k: usize, runs_per_query: u32) -> Option<QueryStability> {
	let (baseline, rest) = runs.split_first()?;

	if rest.is_empty() {
		return None;
	}

	let mut positional = 0.0_f64;
	let mut set = 0.0_f64;

	for run in rest {
		let (positional_churn, set_churn) =
			churn_against_baseline_at_k(&baseline.retrieved, &run.retrieved, k);

		positional += positional_churn;
		set += set_churn;
	}

	Some(QueryStability {
		runs_per_query,
		positional_churn_at_k: positional / rest.len() as f64,
		set_churn_at_k: set / rest.len() as f64,
	})
}

fn churn_against_baseline_at_k(baseline: &[Uuid], other: &[Uuid], k: usize) -> (f64, f64) {
	let k = k.max(1);
	let positional_diff = (0..k).filter(|idx| baseline.get(*idx) != other.get(*idx)).count();
	let base_set: HashSet<Uuid> = baseline.iter().take(k).copied().collect();
	let other_set: HashSet<Uuid> = other.iter().take(k).copied().collect();
	let union = base_set.union(&other_set).count();
	let overlap = base_set.intersection(&other_set).count();
	let set_churn = if union == 0 { 0.0 } else { 1.0 - overlap as f64 / union as f64 };

	(positional_diff as f64 / k as f64, set_churn)
}

fn unique_ids<I>(iter: I) -> Vec<Uuid>
where
	I: Iterator<Item = Uuid>,
{
	let mut seen = HashSet::new();

	iter.filter(|id| seen.insert(*id)).collect()
}

fn compute_metrics(retrieved: &[Uuid], expected: &HashSet<Uuid>) -> Metrics {
	let mut relevant_count = 0_usize;
	let mut dcg = 0.0_f64;
	let mut first_hit = None;

	for (idx, id) in retrieved.iter().enumerate() {
		if !expected.contains(id) {
			continue;
		}

		let rank = idx + 1;

		relevant_count += 1;
		dcg += 1.0 / (rank as f64 + 1.0).log2();
		if first_hit.is_none() {
			first_hit = Some(rank);
		}
	}

	let idcg: f64 = (1..=expected.len().min(retrieved.len()))
		.map(|rank| 1.0 / (rank as f64 + 1.0).log2())
		.sum();

	Metrics {
		recall_at_k: if expected.is_empty() {
			0.0
		} else {
			relevant_count as f64 / expected.len() as f64
		},
		precision_at_k: if retrieved.is_empty() {
			0.0
		} else {
			relevant_count as f64 / retrieved.len() as f64
		},
		rr: first_hit.map_or(0.0, |rank| 1.0 / rank as f64),
		ndcg: if idcg > 0.0 { dcg / idcg } else { 0.0 },
		relevant_count,
	}
}

fn summarize(reports: &[QueryReport], latencies_ms: &[f64], runs_per_query: u32) -> EvalSummary {
	let count = reports.len().max(1) as f64;
	let mut sorted = latencies_ms.to_vec();
	let mut dominant_ports = BTreeMap::new();
	let mut cache_outcomes = BTreeMap::new();

	sorted.sort_by(f64::total_cmp);

	for report in reports {
		*dominant_ports.entry(report.dominant_port.as_str()).or_insert(0) += 1;

		for outcome in &report.cache_outcomes {
			*cache_outcomes.entry(outcome.as_str()).or_insert(0) += 1;
		}
	}

	let stabilities: Vec<QueryStability> = reports.iter().filter_map(|r| r.stability).collect();
	let stability = (!stabilities.is_empty()).then(|| {
		let n = stabilities.len() as f64;

		StabilitySummary {
			runs_per_query,
			avg_positional_churn_at_k: stabilities.iter().map(|s| s.positional_churn_at_k).sum::<f64>()
				/ n,
			avg_set_churn_at_k: stabilities.iter().map(|s| s.set_churn_at_k).sum::<f64>() / n,
		}
	});

	EvalSummary {
		avg_recall_at_k: reports.iter().map(|r| r.recall_at_k).sum::<f64>() / count,
		avg_precision_at_k: reports.iter().map(|r| r.precision_at_k).sum::<f64>() / count,
		mean_rr: reports.iter().map(|r| r.rr).sum::<f64>() / count,
		mean_ndcg: reports.iter().map(|r| r.ndcg).sum::<f64>() / count,
		latency_ms_p50: percentile(&sorted, 0.50),
		latency_ms_p95: percentile(&sorted, 0.95),
		dominant_ports,
		cache_outcomes,
		single_source_count: reports.iter().filter(|r| r.single_source).count(),
		stability,
		cache: None,
	}
}

fn percentile(values: &[f64], percentile: f64) -> f64 {
	if values.is_empty() {
		return 0.0;
	}

	let pos = percentile.clamp(0.0, 1.0) * (values.len() as f64 - 1.0);
	let lower = pos.floor() as usize;
	let upper = pos.ceil() as usize;
	let weight = pos - lower as f64;

	values[lower] * (1.0 - weight) + values[upper] * weight
}
