use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use super::{
	Candidate, PortLabel, PortReport, PortStatus, RetrievalOutcome, RetrievalQuery, attribution,
	fusion::{self, FusionParams, PortList},
};
use crate::{
	Error, Result, RetrieverPort,
	progress::{ProgressEvent, ProgressSink},
};

struct PortRun {
	report: PortReport,
	candidates: Option<Vec<Candidate>>,
}

/// Fans a query out to the configured ports and fuses whatever comes back in time.
pub struct FusionEngine {
	dense: Option<Arc<dyn RetrieverPort>>,
	sparse: Option<Arc<dyn RetrieverPort>>,
	params: FusionParams,
	overfetch_multiplier: u32,
	port_timeout: Duration,
	attribution_window: usize,
}
impl FusionEngine {
	/// Ports switched off in `cfg` are dropped here and report as disabled.
	pub fn new(
		cfg: &sift_config::Retrieval,
		dense: Option<Arc<dyn RetrieverPort>>,
		sparse: Option<Arc<dyn RetrieverPort>>,
	) -> Self {
		Self {
			dense: dense.filter(|_| cfg.dense_enabled),
			sparse: sparse.filter(|_| cfg.sparse_enabled),
			params: FusionParams::from_config(&cfg.fusion),
			overfetch_multiplier: cfg.overfetch_multiplier.max(1),
			port_timeout: Duration::from_millis(cfg.port_timeout_ms),
			attribution_window: cfg.fusion.attribution_window as usize,
		}
	}

	pub fn has_port(&self, port: PortLabel) -> bool {
		self.port(port).is_some()
	}

	fn port(&self, port: PortLabel) -> Option<&Arc<dyn RetrieverPort>> {
		match port {
			PortLabel::Dense => self.dense.as_ref(),
			PortLabel::Sparse => self.sparse.as_ref(),
		}
	}

	/// Runs every port the strategy asks for concurrently, each under the port timeout.
	///
	/// Cancellation drops both in-flight calls and returns `Error::Cancelled`. Only when no
	/// queried port answers does this fail with `Error::NoRetrieverAvailable`.
	pub async fn retrieve(
		&self,
		query: &RetrievalQuery,
		cancel: &CancellationToken,
		progress: Option<&dyn ProgressSink>,
	) -> Result<RetrievalOutcome> {
		let fetch_limit = query.limit.saturating_mul(self.overfetch_multiplier);
		let mut reports = Vec::with_capacity(2);
		let mut ports_queried = Vec::with_capacity(2);

		for port in PortLabel::ALL {
			if !query.strategy.wants(port) {
				continue;
			}

			if self.has_port(port) {
				ports_queried.push(port);
			} else {
				reports.push(PortReport {
					port,
					status: PortStatus::Disabled,
					latency_ms: 0,
					returned: 0,
					reason: None,
				});
			}
		}

		if ports_queried.is_empty() {
			return Err(Error::NoRetrieverAvailable { failures: reports });
		}

		let dense = self.port(PortLabel::Dense).filter(|_| query.strategy.wants(PortLabel::Dense));
		let sparse =
			self.port(PortLabel::Sparse).filter(|_| query.strategy.wants(PortLabel::Sparse));
		let (dense_run, sparse_run) = tokio::select! {
			biased;

			_ = cancel.cancelled() => {
				tracing::info!(strategy = query.strategy.as_str(), "Retrieval cancelled.");

				return Err(Error::Cancelled);
			},
			runs = async {
				tokio::join!(
					self.run_port(dense, PortLabel::Dense, query, fetch_limit),
					self.run_port(sparse, PortLabel::Sparse, query, fetch_limit),
				)
			} => runs,
		};
		let mut lists = Vec::with_capacity(2);

		for run in [dense_run, sparse_run].into_iter().flatten() {
			if let Some(sink) = progress {
				sink.emit(ProgressEvent::PortFinished { report: run.report.clone() });
			}
			if let Some(candidates) = run.candidates {
				lists.push(PortList { port: run.report.port, candidates });
			}

			reports.push(run.report);
		}

		reports.sort_by_key(|report| report.port);

		if lists.is_empty() {
			return Err(Error::NoRetrieverAvailable { failures: reports });
		}

		let ports_succeeded: Vec<PortLabel> = lists.iter().map(|list| list.port).collect();
		let single_source = lists.len() == 1;
		let results = fusion::fuse(lists, query.algorithm, &self.params, query.limit as usize);
		let window = self.attribution_window.min(query.limit as usize);
		let dominant_port = attribution::dominant_port(&results, window);

		tracing::debug!(
			algorithm = query.algorithm.as_str(),
			fused_count = results.len(),
			single_source,
			dominant_port = dominant_port.as_str(),
			"Retrieval fused."
		);

		if let Some(sink) = progress {
			sink.emit(ProgressEvent::Fused {
				fused_count: results.len(),
				algorithm: query.algorithm,
				single_source,
			});
		}

		Ok(RetrievalOutcome {
			query: query.clone(),
			results,
			ports_queried,
			ports_succeeded,
			port_reports: reports,
			algorithm: query.algorithm,
			single_source,
			dominant_port,
			enrichment_flags: Vec::new(),
		})
	}

	async fn run_port(
		&self,
		port: Option<&Arc<dyn RetrieverPort>>,
		label: PortLabel,
		query: &RetrievalQuery,
		limit: u32,
	) -> Option<PortRun> {
		let port = port?;
		let started = Instant::now();
		let result = tokio::time::timeout(self.port_timeout, port.search(query, limit)).await;
		let latency_ms = started.elapsed().as_millis() as u64;
		let (status, reason, candidates) = match result {
			Ok(Ok(mut candidates)) => {
				for candidate in &mut candidates {
					candidate.port = label;
				}

				(PortStatus::Ok, None, Some(candidates))
			},
			Ok(Err(err)) => {
				tracing::warn!(
					port = label.as_str(),
					latency_ms,
					error = %err,
					"Retrieval port failed."
				);

				(PortStatus::Failed, Some(err.to_string()), None)
			},
			Err(_) => {
				tracing::warn!(port = label.as_str(), latency_ms, "Retrieval port timed out.");

				(
					PortStatus::TimedOut,
					Some(format!("no response within {} ms", self.port_timeout.as_millis())),
					None,
				)
			},
		};
		let returned = candidates.as_ref().map_or(0, Vec::len);

		Some(PortRun {
			report: PortReport { port: label, status, latency_ms, returned, reason },
			candidates,
		})
	}
}
