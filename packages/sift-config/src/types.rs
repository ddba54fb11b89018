use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	#[serde(default)]
	pub retrieval: Retrieval,
	#[serde(default)]
	pub enrichment: Enrichment,
	#[serde(default)]
	pub cache: Cache,
}

#[derive(Debug, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
	pub qdrant: Qdrant,
}

#[derive(Debug, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Deserialize)]
pub struct Qdrant {
	pub url: String,
	pub collection: String,
	pub vector_dim: u32,
}

#[derive(Debug, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub rerank: ProviderConfig,
	pub generation: LlmProviderConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub timeout_ms: u64,
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Retrieval {
	pub default_limit: u32,
	pub max_limit: u32,
	/// Each port is asked for `overfetch_multiplier * limit` candidates before fusion.
	pub overfetch_multiplier: u32,
	pub port_timeout_ms: u64,
	pub generation_timeout_ms: u64,
	/// One of "dense", "sparse", or "hybrid".
	pub default_strategy: String,
	pub dense_enabled: bool,
	pub sparse_enabled: bool,
	pub fusion: Fusion,
}
impl Default for Retrieval {
	fn default() -> Self {
		Self {
			default_limit: 10,
			max_limit: 100,
			overfetch_multiplier: 2,
			port_timeout_ms: 3_000,
			generation_timeout_ms: 30_000,
			default_strategy: "hybrid".to_string(),
			dense_enabled: true,
			sparse_enabled: true,
			fusion: Fusion::default(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Fusion {
	/// One of "rrf" or "weighted".
	pub algorithm: String,
	pub rrf_k: f32,
	pub dense_weight: f32,
	pub sparse_weight: f32,
	pub attribution_window: u32,
}
impl Default for Fusion {
	fn default() -> Self {
		Self {
			algorithm: "rrf".to_string(),
			rrf_k: 60.0,
			dense_weight: 0.5,
			sparse_weight: 0.5,
			attribution_window: 5,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Enrichment {
	pub snippet_chars: u32,
	pub tags_enabled: bool,
	pub rerank_enabled: bool,
	pub personalize_enabled: bool,
}
impl Default for Enrichment {
	fn default() -> Self {
		Self {
			snippet_chars: 240,
			tags_enabled: true,
			rerank_enabled: false,
			personalize_enabled: false,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Cache {
	pub enabled: bool,
	/// One of "memory" or "postgres".
	pub backend: String,
	pub near_duplicate_enabled: bool,
	pub exact_ttl_secs: i64,
	pub near_duplicate_ttl_secs: i64,
	/// Similarity at or above which a near-duplicate is promoted to the exact tier.
	pub high_threshold: f32,
	/// Similarity at or above which a near-duplicate is served at all.
	pub mid_threshold: f32,
	pub max_payload_bytes: Option<u64>,
	/// Upper bound on entries inspected by one near-duplicate scan. Zero disables the bound.
	pub max_scan_entries: u32,
}
impl Default for Cache {
	fn default() -> Self {
		Self {
			enabled: true,
			backend: "postgres".to_string(),
			near_duplicate_enabled: true,
			exact_ttl_secs: 86_400,
			near_duplicate_ttl_secs: 3_600,
			high_threshold: 0.95,
			mid_threshold: 0.80,
			max_payload_bytes: Some(262_144),
			max_scan_entries: 50_000,
		}
	}
}
