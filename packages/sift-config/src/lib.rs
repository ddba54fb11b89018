mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Cache, Config, EmbeddingProviderConfig, Enrichment, Fusion, LlmProviderConfig, Postgres,
	ProviderConfig, Providers, Qdrant, Retrieval, Service, Storage,
};

use std::{fs, path::Path};

const WEIGHT_SUM_TOLERANCE: f32 = 1e-4;

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	parse(&raw).map_err(|err| match err {
		Error::ParseConfig { source, .. } => Error::ParseConfig { path: path.to_path_buf(), source },
		other => other,
	})
}

pub fn parse(raw: &str) -> Result<Config> {
	let mut cfg: Config = toml::from_str(raw)
		.map_err(|err| Error::ParseConfig { path: Default::default(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.log_level.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.log_level must be non-empty.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions != cfg.storage.qdrant.vector_dim {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must match storage.qdrant.vector_dim."
				.to_string(),
		});
	}

	for (label, key) in [
		("embedding", &cfg.providers.embedding.api_key),
		("rerank", &cfg.providers.rerank.api_key),
		("generation", &cfg.providers.generation.api_key),
	] {
		if key.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("Provider {label} api_key must be non-empty."),
			});
		}
	}

	validate_retrieval(&cfg.retrieval)?;
	validate_enrichment(&cfg.enrichment)?;
	validate_cache(&cfg.cache)?;

	Ok(())
}

fn validate_retrieval(retrieval: &Retrieval) -> Result<()> {
	if retrieval.default_limit == 0 {
		return Err(Error::Validation {
			message: "retrieval.default_limit must be greater than zero.".to_string(),
		});
	}
	if retrieval.max_limit < retrieval.default_limit {
		return Err(Error::Validation {
			message: "retrieval.max_limit must be at least retrieval.default_limit.".to_string(),
		});
	}
	if retrieval.overfetch_multiplier == 0 {
		return Err(Error::Validation {
			message: "retrieval.overfetch_multiplier must be greater than zero.".to_string(),
		});
	}
	if retrieval.port_timeout_ms == 0 {
		return Err(Error::Validation {
			message: "retrieval.port_timeout_ms must be greater than zero.".to_string(),
		});
	}
	if retrieval.generation_timeout_ms == 0 {
		return Err(Error::Validation {
			message: "retrieval.generation_timeout_ms must be greater than zero.".to_string(),
		});
	}
	if !matches!(retrieval.default_strategy.as_str(), "dense" | "sparse" | "hybrid") {
		return Err(Error::Validation {
			message: "retrieval.default_strategy must be one of dense, sparse, or hybrid."
				.to_string(),
		});
	}
	if !retrieval.dense_enabled && !retrieval.sparse_enabled {
		return Err(Error::Validation {
			message: "At least one of retrieval.dense_enabled or retrieval.sparse_enabled must be true."
				.to_string(),
		});
	}

	let fusion = &retrieval.fusion;

	if !matches!(fusion.algorithm.as_str(), "rrf" | "weighted") {
		return Err(Error::Validation {
			message: "retrieval.fusion.algorithm must be one of rrf or weighted.".to_string(),
		});
	}
	if !fusion.rrf_k.is_finite() || fusion.rrf_k < 0.0 {
		return Err(Error::Validation {
			message: "retrieval.fusion.rrf_k must be a finite number, zero or greater.".to_string(),
		});
	}

	for (label, weight) in [
		("retrieval.fusion.dense_weight", fusion.dense_weight),
		("retrieval.fusion.sparse_weight", fusion.sparse_weight),
	] {
		if !weight.is_finite() {
			return Err(Error::Validation { message: format!("{label} must be a finite number.") });
		}
		if !(0.0..=1.0).contains(&weight) {
			return Err(Error::Validation {
				message: format!("{label} must be in the range 0.0-1.0."),
			});
		}
	}

	if ((fusion.dense_weight + fusion.sparse_weight) - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
		return Err(Error::Validation {
			message: "retrieval.fusion.dense_weight and retrieval.fusion.sparse_weight must sum to 1.0."
				.to_string(),
		});
	}
	if fusion.attribution_window == 0 {
		return Err(Error::Validation {
			message: "retrieval.fusion.attribution_window must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn validate_enrichment(enrichment: &Enrichment) -> Result<()> {
	if enrichment.snippet_chars == 0 {
		return Err(Error::Validation {
			message: "enrichment.snippet_chars must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn validate_cache(cache: &Cache) -> Result<()> {
	if !matches!(cache.backend.as_str(), "memory" | "postgres") {
		return Err(Error::Validation {
			message: "cache.backend must be one of memory or postgres.".to_string(),
		});
	}
	if cache.exact_ttl_secs <= 0 {
		return Err(Error::Validation {
			message: "cache.exact_ttl_secs must be greater than zero.".to_string(),
		});
	}
	if cache.near_duplicate_ttl_secs <= 0 {
		return Err(Error::Validation {
			message: "cache.near_duplicate_ttl_secs must be greater than zero.".to_string(),
		});
	}
	if cache.near_duplicate_ttl_secs > cache.exact_ttl_secs {
		return Err(Error::Validation {
			message: "cache.near_duplicate_ttl_secs must not exceed cache.exact_ttl_secs."
				.to_string(),
		});
	}

	for (label, threshold) in
		[("cache.high_threshold", cache.high_threshold), ("cache.mid_threshold", cache.mid_threshold)]
	{
		if !threshold.is_finite() {
			return Err(Error::Validation { message: format!("{label} must be a finite number.") });
		}
		if !(0.0..=1.0).contains(&threshold) || threshold == 0.0 {
			return Err(Error::Validation {
				message: format!("{label} must be in the range (0.0, 1.0]."),
			});
		}
	}

	if cache.mid_threshold > cache.high_threshold {
		return Err(Error::Validation {
			message: "cache.mid_threshold must not exceed cache.high_threshold.".to_string(),
		});
	}

	if let Some(max) = cache.max_payload_bytes
		&& max == 0
	{
		return Err(Error::Validation {
			message: "cache.max_payload_bytes must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	cfg.retrieval.default_strategy = cfg.retrieval.default_strategy.trim().to_lowercase();
	cfg.retrieval.fusion.algorithm = cfg.retrieval.fusion.algorithm.trim().to_lowercase();
	cfg.cache.backend = cfg.cache.backend.trim().to_lowercase();
}
