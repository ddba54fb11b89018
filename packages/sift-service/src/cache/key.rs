use std::collections::BTreeMap;

use serde_json::Value;

use super::CacheScope;
use crate::{Error, Result, retrieval::RetrievalFilters};

/// Bumped whenever the stored entry layout or key derivation changes.
pub const CACHE_SCHEMA_VERSION: u32 = 2;

/// Exact cache key of a normalized question within its scope.
pub fn fingerprint(normalized_question: &str, scope: &CacheScope) -> Result<String> {
	let mut payload = scope_payload(scope)?;

	payload.insert("question", Value::from(normalized_question));

	hash_payload(&payload)
}

/// Key shared by every question asked within the same scope. Near-duplicate matching only
/// compares entries with equal scope keys.
pub fn scope_key(scope: &CacheScope) -> Result<String> {
	hash_payload(&scope_payload(scope)?)
}

pub fn cache_key_prefix(key: &str) -> &str {
	&key[..key.len().min(12)]
}

fn scope_payload(scope: &CacheScope) -> Result<BTreeMap<&'static str, Value>> {
	Ok(BTreeMap::from([
		("search_type", Value::from(scope.search_type.as_str())),
		("algorithm", Value::from(scope.algorithm.as_str())),
		("filters", filters_payload(&scope.filters)?),
		("prompt_template_id", Value::from(scope.prompt_template_id.as_str())),
		("result_limit", Value::from(scope.result_limit)),
		("caller_identity", Value::from(scope.caller_identity.as_str())),
		("schema_version", Value::from(CACHE_SCHEMA_VERSION)),
	]))
}

/// Filters with tag and doc type lists sorted and de-duplicated, so equivalent requests
/// share a key. Dates encode as RFC 3339.
fn filters_payload(filters: &RetrievalFilters) -> Result<Value> {
	let mut canonical = filters.clone();

	for list in [&mut canonical.tags, &mut canonical.doc_types] {
		list.sort();
		list.dedup();
	}

	serde_json::to_value(&canonical).map_err(|err| Error::Storage {
		message: format!("Failed to encode cache key filters: {err}"),
	})
}

// BTreeMap keys serialize in sorted order, which makes the encoding canonical.
fn hash_payload(payload: &BTreeMap<&'static str, Value>) -> Result<String> {
	let raw = serde_json::to_vec(payload).map_err(|err| Error::Storage {
		message: format!("Failed to encode cache key payload: {err}"),
	})?;

	Ok(blake3::hash(&raw).to_hex().to_string())
}

#[cfg(test)]
mod tests {
	use time::macros::datetime;

	use super::*;
	use crate::retrieval::{FusionAlgorithm, Strategy};

	fn scope() -> CacheScope {
		CacheScope {
			search_type: Strategy::Hybrid,
			algorithm: FusionAlgorithm::Rrf,
			filters: RetrievalFilters::default(),
			prompt_template_id: "qa-v1".to_string(),
			result_limit: 10,
			caller_identity: "acme/alice".to_string(),
		}
	}

	#[test]
	fn fingerprint_is_stable() {
		let a = fingerprint("how do i configure backups", &scope()).expect("key");
		let b = fingerprint("how do i configure backups", &scope()).expect("key");

		assert_eq!(a, b);
		assert_eq!(a.len(), 64);
	}

	#[test]
	fn every_scope_field_changes_the_fingerprint() {
		let base = fingerprint("q", &scope()).expect("key");
		let variants = [
			CacheScope { search_type: Strategy::Dense, ..scope() },
			CacheScope { algorithm: FusionAlgorithm::Weighted, ..scope() },
			CacheScope {
				filters: RetrievalFilters { tags: vec!["finance".to_string()], ..Default::default() },
				..scope()
			},
			CacheScope {
				filters: RetrievalFilters { doc_types: vec!["pdf".to_string()], ..Default::default() },
				..scope()
			},
			CacheScope {
				filters: RetrievalFilters {
					updated_after: Some(datetime!(2026-01-01 0:00 UTC)),
					..Default::default()
				},
				..scope()
			},
			CacheScope {
				filters: RetrievalFilters {
					updated_before: Some(datetime!(2026-01-01 0:00 UTC)),
					..Default::default()
				},
				..scope()
			},
			CacheScope { prompt_template_id: "qa-v2".to_string(), ..scope() },
			CacheScope { result_limit: 11, ..scope() },
			CacheScope { caller_identity: "acme/bob".to_string(), ..scope() },
		];

		for variant in variants {
			assert_ne!(fingerprint("q", &variant).expect("key"), base, "{variant:?}");
		}
	}

	#[test]
	fn filter_lists_are_order_and_duplicate_insensitive() {
		let filtered = |tags: &[&str], doc_types: &[&str]| CacheScope {
			filters: RetrievalFilters {
				tags: tags.iter().map(|tag| tag.to_string()).collect(),
				doc_types: doc_types.iter().map(|doc_type| doc_type.to_string()).collect(),
				..Default::default()
			},
			..scope()
		};

		assert_eq!(
			fingerprint("q", &filtered(&["ops", "finance"], &["pdf", "md"])).expect("key"),
			fingerprint("q", &filtered(&["finance", "ops", "finance"], &["md", "pdf"])).expect("key")
		);
		assert_eq!(
			scope_key(&filtered(&["b", "a"], &[])).expect("key"),
			scope_key(&filtered(&["a", "b", "b"], &[])).expect("key")
		);
	}

	#[test]
	fn scope_key_ignores_the_question() {
		let scope = scope();

		assert_ne!(
			fingerprint("first question", &scope).expect("key"),
			fingerprint("second question", &scope).expect("key")
		);
		assert_eq!(scope_key(&scope).expect("key"), scope_key(&scope).expect("key"));
		assert_ne!(scope_key(&scope).expect("key"), fingerprint("", &scope).expect("key"));
	}

	#[test]
	fn prefix_is_bounded() {
		assert_eq!(cache_key_prefix("abcdef0123456789"), "abcdef012345");
		assert_eq!(cache_key_prefix("abc"), "abc");
	}
}
