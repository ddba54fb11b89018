pub mod attribution;
pub mod engine;
pub mod enrich;
pub mod fusion;

use std::{cmp::Ordering, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortLabel {
	Dense,
	Sparse,
}
impl PortLabel {
	pub const ALL: [Self; 2] = [Self::Dense, Self::Sparse];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Dense => "dense",
			Self::Sparse => "sparse",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
	Dense,
	Sparse,
	Hybrid,
}
impl Strategy {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Dense => "dense",
			Self::Sparse => "sparse",
			Self::Hybrid => "hybrid",
		}
	}

	pub fn wants(self, port: PortLabel) -> bool {
		match self {
			Self::Hybrid => true,
			Self::Dense => port == PortLabel::Dense,
			Self::Sparse => port == PortLabel::Sparse,
		}
	}
}
impl FromStr for Strategy {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"dense" => Ok(Self::Dense),
			"sparse" => Ok(Self::Sparse),
			"hybrid" => Ok(Self::Hybrid),
			other => Err(Error::InvalidRequest { message: format!("Unknown strategy {other:?}.") }),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionAlgorithm {
	Rrf,
	Weighted,
}
impl FusionAlgorithm {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Rrf => "rrf",
			Self::Weighted => "weighted",
		}
	}
}
impl FromStr for FusionAlgorithm {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"rrf" => Ok(Self::Rrf),
			"weighted" => Ok(Self::Weighted),
			other => Err(Error::InvalidRequest {
				message: format!("Unknown fusion algorithm {other:?}."),
			}),
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalFilters {
	#[serde(default)]
	pub tags: Vec<String>,
	#[serde(default)]
	pub doc_types: Vec<String>,
	#[serde(default, with = "crate::time_serde::option")]
	pub updated_after: Option<OffsetDateTime>,
	#[serde(default, with = "crate::time_serde::option")]
	pub updated_before: Option<OffsetDateTime>,
}

/// One retrieval request as the ports see it. `text` is already normalized.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetrievalQuery {
	pub text: String,
	pub tenant_id: String,
	pub filters: RetrievalFilters,
	pub limit: u32,
	pub strategy: Strategy,
	pub algorithm: FusionAlgorithm,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
	pub segment_id: Uuid,
	pub doc_id: Uuid,
	pub text: String,
	/// Only comparable with other scores from the same port.
	pub score: f32,
	pub port: PortLabel,
	/// 1-based position in the port's own result list.
	pub rank: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortHit {
	pub rank: u32,
	pub score: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
	pub segment_id: Uuid,
	pub doc_id: Uuid,
	pub text: String,
	pub combined_score: f32,
	pub rank: u32,
	/// Sorted, so `[dense, sparse]` for segments both ports matched.
	pub ports: Vec<PortLabel>,
	pub dense: Option<PortHit>,
	pub sparse: Option<PortHit>,
	pub snippet: Option<String>,
	pub tags: Vec<String>,
	pub rerank_score: Option<f32>,
}
impl FusedResult {
	pub fn hit(&self, port: PortLabel) -> Option<PortHit> {
		match port {
			PortLabel::Dense => self.dense,
			PortLabel::Sparse => self.sparse,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
	Ok,
	Failed,
	TimedOut,
	Disabled,
}
impl PortStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Ok => "ok",
			Self::Failed => "failed",
			Self::TimedOut => "timed_out",
			Self::Disabled => "disabled",
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortReport {
	pub port: PortLabel,
	pub status: PortStatus,
	pub latency_ms: u64,
	pub returned: usize,
	pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DominantPort {
	Dense,
	Sparse,
	Hybrid,
	Equal,
	None,
}
impl DominantPort {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Dense => "dense",
			Self::Sparse => "sparse",
			Self::Hybrid => "hybrid",
			Self::Equal => "equal",
			Self::None => "none",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStage {
	Tags,
	Rerank,
	Personalize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentFlag {
	pub stage: EnrichmentStage,
	pub reason: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct RetrievalOutcome {
	pub query: RetrievalQuery,
	pub results: Vec<FusedResult>,
	pub ports_queried: Vec<PortLabel>,
	/// Ports that answered, even with an empty list.
	pub ports_succeeded: Vec<PortLabel>,
	pub port_reports: Vec<PortReport>,
	pub algorithm: FusionAlgorithm,
	pub single_source: bool,
	pub dominant_port: DominantPort,
	pub enrichment_flags: Vec<EnrichmentFlag>,
}

/// Descending order that sorts NaN last.
pub fn cmp_f32_desc(a: f32, b: f32) -> Ordering {
	match (a.is_nan(), b.is_nan()) {
		(true, true) => Ordering::Equal,
		(true, false) => Ordering::Greater,
		(false, true) => Ordering::Less,
		(false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
	}
}

/// Ascending order where an absent rank sorts after every present one.
pub fn rank_asc(left: Option<u32>, right: Option<u32>) -> Ordering {
	left.unwrap_or(u32::MAX).cmp(&right.unwrap_or(u32::MAX))
}

/// Rewrites ranks as 1-based positions and caps each score at its predecessor, so scores never
/// rise further down the list.
pub fn reassign_ranks(results: &mut [FusedResult]) {
	let mut ceiling = f32::INFINITY;

	for (idx, result) in results.iter_mut().enumerate() {
		if result.combined_score.is_nan() {
			result.combined_score = 0.0;
		}

		result.combined_score = result.combined_score.min(ceiling);
		result.rank = idx as u32 + 1;
		ceiling = result.combined_score;
	}
}
