use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
	cache::CacheOutcome,
	retrieval::{EnrichmentFlag, FusionAlgorithm, PortReport},
};

/// Stage milestones of one request, emitted in order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
	CacheChecked { outcome: CacheOutcome, similarity: Option<f32> },
	PortFinished { report: PortReport },
	Fused { fused_count: usize, algorithm: FusionAlgorithm, single_source: bool },
	Enriched { flags: Vec<EnrichmentFlag> },
	Generating { context_len: usize },
	Completed { cache_outcome: Option<CacheOutcome> },
}

/// Receives progress events. Implementations must not block the request.
pub trait ProgressSink
where
	Self: Send + Sync,
{
	fn emit(&self, event: ProgressEvent);
}

/// Forwards events into a bounded channel. Events are dropped when the receiver lags or
/// has gone away.
pub struct ChannelProgress {
	tx: mpsc::Sender<ProgressEvent>,
}
impl ChannelProgress {
	pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));

		(Self { tx }, rx)
	}
}
impl ProgressSink for ChannelProgress {
	fn emit(&self, event: ProgressEvent) {
		match self.tx.try_send(event) {
			Ok(()) => {},
			Err(TrySendError::Full(event)) => {
				tracing::debug!(?event, "Progress channel full. Dropping event.");
			},
			Err(TrySendError::Closed(_)) => {},
		}
	}
}
