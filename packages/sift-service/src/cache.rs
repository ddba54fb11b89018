pub mod key;
pub mod pg;
pub mod store;

pub use pg::PgCacheStore;
pub use store::MemoryCacheStore;

use std::sync::{
	Arc,
	atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use sift_domain::tokens::TokenSet;

use crate::{
	AnswerPayload, CacheRecord, CacheStore, Result,
	retrieval::{FusionAlgorithm, RetrievalFilters, Strategy},
	time_serde,
};
use key::CACHE_SCHEMA_VERSION;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
	Exact,
	NearDuplicate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
	HitExact,
	HitNearDuplicate,
	Miss,
}
impl CacheOutcome {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::HitExact => "hit_exact",
			Self::HitNearDuplicate => "hit_near_duplicate",
			Self::Miss => "miss",
		}
	}
}

/// Where a reused answer came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheProvenance {
	pub matched_question: String,
	pub matched_fingerprint: String,
	pub similarity: f32,
	/// Similarity cleared the high threshold, so the answer is treated as exact.
	pub confirmed: bool,
}

/// Request dimensions that must match for an answer to be reusable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheScope {
	pub search_type: Strategy,
	pub algorithm: FusionAlgorithm,
	pub filters: RetrievalFilters,
	pub prompt_template_id: String,
	pub result_limit: u32,
	pub caller_identity: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheKey {
	pub fingerprint: String,
	pub scope_key: String,
	pub question: String,
	pub tokens: TokenSet,
}
impl CacheKey {
	/// `normalized_question` must already be normalized.
	pub fn new(normalized_question: &str, scope: &CacheScope) -> Result<Self> {
		Ok(Self {
			fingerprint: key::fingerprint(normalized_question, scope)?,
			scope_key: key::scope_key(scope)?,
			question: normalized_question.to_string(),
			tokens: TokenSet::from_normalized(normalized_question),
		})
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
	pub schema_version: u32,
	pub fingerprint: String,
	pub scope_key: String,
	pub question: String,
	pub tokens: TokenSet,
	pub payload: AnswerPayload,
	pub tier: CacheTier,
	pub ttl_secs: i64,
	#[serde(with = "time_serde")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time_serde")]
	pub expires_at: OffsetDateTime,
	#[serde(default)]
	pub provenance: Option<CacheProvenance>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheHit {
	pub entry: CacheEntry,
	pub outcome: CacheOutcome,
	pub similarity: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
	pub hit_exact: u64,
	pub hit_near_duplicate: u64,
	pub miss: u64,
	pub writes: u64,
	pub skipped_oversize: u64,
	pub evicted_malformed: u64,
	pub store_errors: u64,
}

#[derive(Default)]
struct CacheCounters {
	hit_exact: AtomicU64,
	hit_near_duplicate: AtomicU64,
	miss: AtomicU64,
	writes: AtomicU64,
	skipped_oversize: AtomicU64,
	evicted_malformed: AtomicU64,
	store_errors: AtomicU64,
}
impl CacheCounters {
	fn bump(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	fn snapshot(&self) -> CacheStats {
		CacheStats {
			hit_exact: self.hit_exact.load(Ordering::Relaxed),
			hit_near_duplicate: self.hit_near_duplicate.load(Ordering::Relaxed),
			miss: self.miss.load(Ordering::Relaxed),
			writes: self.writes.load(Ordering::Relaxed),
			skipped_oversize: self.skipped_oversize.load(Ordering::Relaxed),
			evicted_malformed: self.evicted_malformed.load(Ordering::Relaxed),
			store_errors: self.store_errors.load(Ordering::Relaxed),
		}
	}
}

/// Two-tier answer cache. Store failures never fail a request: reads degrade to a miss and
/// writes are skipped.
pub struct AnswerCache {
	cfg: sift_config::Cache,
	store: Arc<dyn CacheStore>,
	near_duplicate: bool,
	counters: CacheCounters,
}
impl AnswerCache {
	pub fn new(cfg: sift_config::Cache, store: Arc<dyn CacheStore>) -> Self {
		let near_duplicate = cfg.near_duplicate_enabled && store.supports_scan();

		if cfg.near_duplicate_enabled && !near_duplicate {
			tracing::warn!("Cache store cannot scan. Near-duplicate matching is disabled.");
		}

		Self { cfg, store, near_duplicate, counters: CacheCounters::default() }
	}

	pub fn near_duplicate_enabled(&self) -> bool {
		self.near_duplicate
	}

	pub fn stats(&self) -> CacheStats {
		self.counters.snapshot()
	}

	/// Exact match first, then the most similar live entry in the same scope.
	pub async fn lookup(&self, key: &CacheKey, now: OffsetDateTime) -> Option<CacheHit> {
		let hit = match self.lookup_exact(key, now).await {
			Ok(Some(hit)) => Some(hit),
			Ok(None) if self.near_duplicate =>
				match self.lookup_near_duplicate(key, now).await {
					Ok(hit) => hit,
					Err(err) => {
						self.store_failed("scan", &key.fingerprint, &err);

						None
					},
				},
			Ok(None) => None,
			Err(err) => {
				self.store_failed("read", &key.fingerprint, &err);

				None
			},
		};

		match hit.as_ref().map(|hit| hit.outcome) {
			Some(CacheOutcome::HitExact) => CacheCounters::bump(&self.counters.hit_exact),
			Some(CacheOutcome::HitNearDuplicate) =>
				CacheCounters::bump(&self.counters.hit_near_duplicate),
			_ => CacheCounters::bump(&self.counters.miss),
		}

		hit
	}

	/// Stores a freshly generated answer in the exact tier. Returns whether it was written.
	pub async fn store(&self, key: &CacheKey, payload: &AnswerPayload, now: OffsetDateTime) -> bool {
		let ttl_secs = self.ttl_secs(CacheTier::Exact);
		let entry = CacheEntry {
			schema_version: CACHE_SCHEMA_VERSION,
			fingerprint: key.fingerprint.clone(),
			scope_key: key.scope_key.clone(),
			question: key.question.clone(),
			tokens: key.tokens.clone(),
			payload: payload.clone(),
			tier: CacheTier::Exact,
			ttl_secs,
			created_at: now,
			expires_at: now + Duration::seconds(ttl_secs),
			provenance: None,
		};

		self.write(&entry).await
	}

	pub async fn invalidate(&self, fingerprint: &str) -> Result<bool> {
		self.store.remove(fingerprint).await
	}

	pub async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64> {
		let purged = self.store.purge_expired(now).await?;

		if purged > 0 {
			tracing::info!(purged, "Purged expired cache entries.");
		}

		Ok(purged)
	}

	async fn lookup_exact(&self, key: &CacheKey, now: OffsetDateTime) -> Result<Option<CacheHit>> {
		let Some(record) = self.store.get(&key.fingerprint, now).await? else {
			return Ok(None);
		};
		let mut entry = match decode_entry(&record) {
			Ok(entry) if entry.fingerprint == key.fingerprint => entry,
			Ok(_) => {
				self.evict(&record.fingerprint, "fingerprint mismatch").await;

				return Ok(None);
			},
			Err(reason) => {
				self.evict(&record.fingerprint, &reason).await;

				return Ok(None);
			},
		};

		// Asked again verbatim, so the entry moves to the exact tier whatever it was stored as.
		entry.tier = CacheTier::Exact;
		entry.ttl_secs = self.ttl_secs(CacheTier::Exact);
		entry.expires_at = now + Duration::seconds(entry.ttl_secs);

		self.write(&entry).await;

		tracing::debug!(
			cache_key_prefix = key::cache_key_prefix(&key.fingerprint),
			hit = true,
			"Cache exact hit."
		);

		Ok(Some(CacheHit { entry, outcome: CacheOutcome::HitExact, similarity: 1.0 }))
	}

	async fn lookup_near_duplicate(
		&self,
		key: &CacheKey,
		now: OffsetDateTime,
	) -> Result<Option<CacheHit>> {
		let limit = (self.cfg.max_scan_entries > 0).then_some(self.cfg.max_scan_entries as usize);
		let Some(records) = self.store.scan(&key.scope_key, now, limit).await? else {
			return Ok(None);
		};
		let mut best: Option<(f32, CacheEntry)> = None;

		for record in records {
			if record.fingerprint == key.fingerprint || record.scope_key != key.scope_key {
				continue;
			}

			let candidate = match decode_entry(&record) {
				Ok(entry) => entry,
				Err(reason) => {
					self.evict(&record.fingerprint, &reason).await;

					continue;
				},
			};

			// Only answers generated for their own question can be matched; a derived entry
			// would chain reuse away from the question the answer was written for.
			if candidate.scope_key != key.scope_key || candidate.provenance.is_some() {
				continue;
			}

			let similarity = key.tokens.jaccard(&candidate.tokens);

			if similarity < self.cfg.mid_threshold {
				continue;
			}
			if best.as_ref().is_none_or(|(best_similarity, best_entry)| {
				outranks(similarity, &candidate, *best_similarity, best_entry)
			}) {
				best = Some((similarity, candidate));
			}
		}

		let Some((similarity, matched)) = best else {
			return Ok(None);
		};
		let confirmed = similarity >= self.cfg.high_threshold;
		let tier = if confirmed { CacheTier::Exact } else { CacheTier::NearDuplicate };
		let ttl_secs = self.ttl_secs(tier);
		let entry = CacheEntry {
			schema_version: CACHE_SCHEMA_VERSION,
			fingerprint: key.fingerprint.clone(),
			scope_key: key.scope_key.clone(),
			question: key.question.clone(),
			tokens: key.tokens.clone(),
			payload: matched.payload.clone(),
			tier,
			ttl_secs,
			created_at: now,
			expires_at: now + Duration::seconds(ttl_secs),
			provenance: Some(CacheProvenance {
				matched_question: matched.question,
				matched_fingerprint: matched.fingerprint,
				similarity,
				confirmed,
			}),
		};

		self.write(&entry).await;

		let outcome = if confirmed { CacheOutcome::HitExact } else { CacheOutcome::HitNearDuplicate };

		tracing::info!(
			cache_key_prefix = key::cache_key_prefix(&key.fingerprint),
			similarity,
			outcome = outcome.as_str(),
			"Cache near-duplicate match."
		);

		Ok(Some(CacheHit { entry, outcome, similarity }))
	}

	async fn write(&self, entry: &CacheEntry) -> bool {
		let prefix = key::cache_key_prefix(&entry.fingerprint);
		let value = match serde_json::to_value(entry) {
			Ok(value) => value,
			Err(err) => {
				tracing::warn!(cache_key_prefix = prefix, error = %err, "Cache entry encode failed.");

				return false;
			},
		};

		if let Some(max) = self.cfg.max_payload_bytes {
			let size = serde_json::to_vec(&value).map(|raw| raw.len() as u64).unwrap_or(u64::MAX);

			if size > max {
				tracing::debug!(cache_key_prefix = prefix, size, max, "Cache entry too large. Skipping write.");
				CacheCounters::bump(&self.counters.skipped_oversize);

				return false;
			}
		}

		let record = CacheRecord {
			fingerprint: entry.fingerprint.clone(),
			scope_key: entry.scope_key.clone(),
			created_at: entry.created_at,
			expires_at: entry.expires_at,
			entry: value,
		};

		match self.store.put(record).await {
			Ok(()) => {
				CacheCounters::bump(&self.counters.writes);

				true
			},
			Err(err) => {
				self.store_failed("write", &entry.fingerprint, &err);

				false
			},
		}
	}

	async fn evict(&self, fingerprint: &str, reason: &str) {
		let prefix = key::cache_key_prefix(fingerprint);

		tracing::warn!(cache_key_prefix = prefix, reason, "Malformed cache entry. Evicting.");
		CacheCounters::bump(&self.counters.evicted_malformed);

		if let Err(err) = self.store.remove(fingerprint).await {
			self.store_failed("evict", fingerprint, &err);
		}
	}

	fn store_failed(&self, op: &str, fingerprint: &str, err: &crate::Error) {
		tracing::warn!(
			op,
			cache_key_prefix = key::cache_key_prefix(fingerprint),
			error = %err,
			"Cache store failed. Continuing without cache."
		);
		CacheCounters::bump(&self.counters.store_errors);
	}

	fn ttl_secs(&self, tier: CacheTier) -> i64 {
		match tier {
			CacheTier::Exact => self.cfg.exact_ttl_secs,
			CacheTier::NearDuplicate => self.cfg.near_duplicate_ttl_secs,
		}
	}
}

fn decode_entry(record: &CacheRecord) -> Result<CacheEntry, String> {
	let entry: CacheEntry =
		serde_json::from_value(record.entry.clone()).map_err(|err| err.to_string())?;

	if entry.schema_version != CACHE_SCHEMA_VERSION {
		return Err(format!("schema version {}", entry.schema_version));
	}

	Ok(entry)
}

// Higher similarity wins, then the newer entry, then the smaller fingerprint.
fn outranks(similarity: f32, entry: &CacheEntry, best_similarity: f32, best: &CacheEntry) -> bool {
	similarity
		.total_cmp(&best_similarity)
		.then_with(|| entry.created_at.cmp(&best.created_at))
		.then_with(|| best.fingerprint.cmp(&entry.fingerprint))
		.is_gt()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{BoxFuture, answer::SourceRef};

	fn cfg() -> sift_config::Cache {
		sift_config::Cache {
			enabled: true,
			backend: "memory".to_string(),
			near_duplicate_enabled: true,
			exact_ttl_secs: 86_400,
			near_duplicate_ttl_secs: 3_600,
			high_threshold: 0.95,
			mid_threshold: 0.80,
			max_payload_bytes: None,
			max_scan_entries: 0,
		}
	}

	fn scope() -> CacheScope {
		CacheScope {
			search_type: Strategy::Hybrid,
			algorithm: FusionAlgorithm::Rrf,
			filters: RetrievalFilters::default(),
			prompt_template_id: "qa-v1".to_string(),
			result_limit: 5,
			caller_identity: "acme/alice".to_string(),
		}
	}

	fn key(question: &str) -> CacheKey {
		CacheKey::new(&sift_domain::normalize::normalize_query(question), &scope()).expect("key")
	}

	fn payload(answer: &str) -> AnswerPayload {
		AnswerPayload {
			answer: answer.to_string(),
			provenance: vec![SourceRef { segment_id: uuid::Uuid::nil(), doc_id: uuid::Uuid::nil() }],
		}
	}

	fn words(count: usize) -> Vec<String> {
		(0..count).map(|idx| format!("word{idx}")).collect()
	}

	#[tokio::test]
	async fn exact_round_trip() {
		let cache = AnswerCache::new(cfg(), Arc::new(MemoryCacheStore::new()));
		let now = OffsetDateTime::now_utc();
		let key = key("How do I rotate keys?");

		assert!(cache.lookup(&key, now).await.is_none());
		assert!(cache.store(&key, &payload("Use the rotate command."), now).await);

		let hit = cache.lookup(&key, now).await.expect("hit");

		assert_eq!(hit.outcome, CacheOutcome::HitExact);
		assert_eq!(hit.entry.tier, CacheTier::Exact);
		assert_eq!(hit.entry.ttl_secs, 86_400);
		assert!(hit.entry.provenance.is_none());
		assert_eq!(hit.entry.payload, payload("Use the rotate command."));
		assert_eq!(cache.stats().hit_exact, 1);
		assert_eq!(cache.stats().miss, 1);
	}

	#[tokio::test]
	async fn mid_similarity_hits_near_duplicate_tier() {
		let store = Arc::new(MemoryCacheStore::new());
		let cache = AnswerCache::new(cfg(), store.clone());
		let now = OffsetDateTime::now_utc();
		let shared = words(17);
		let cached = format!("{} extra1 extra2", shared.join(" "));
		let incoming = format!("{} other1", shared.join(" "));

		cache.store(&key(&cached), &payload("cached"), now).await;

		let hit = cache.lookup(&key(&incoming), now).await.expect("near hit");
		let provenance = hit.entry.provenance.clone().expect("provenance");

		assert_eq!(hit.outcome, CacheOutcome::HitNearDuplicate);
		assert!((hit.similarity - 0.85).abs() < 1e-6);
		assert_eq!(hit.entry.tier, CacheTier::NearDuplicate);
		assert_eq!(hit.entry.ttl_secs, 3_600);
		assert_eq!(provenance.matched_question, key(&cached).question);
		assert!(!provenance.confirmed);
		assert_eq!(store.len(), 2);
	}

	#[tokio::test]
	async fn repeated_near_duplicate_is_promoted_to_exact_tier() {
		let cache = AnswerCache::new(cfg(), Arc::new(MemoryCacheStore::new()));
		let now = OffsetDateTime::now_utc();
		let shared = words(17).join(" ");
		let incoming = key(&format!("{shared} other1"));

		cache.store(&key(&format!("{shared} extra1 extra2")), &payload("cached"), now).await;

		let first = cache.lookup(&incoming, now).await.expect("near hit");
		let again = cache.lookup(&incoming, now).await.expect("exact hit");

		assert_eq!(first.outcome, CacheOutcome::HitNearDuplicate);
		assert_eq!(again.outcome, CacheOutcome::HitExact);
		assert_eq!(again.entry.tier, CacheTier::Exact);
		assert_eq!(again.entry.ttl_secs, 86_400);
		assert_eq!(again.entry.provenance, first.entry.provenance);
	}

	#[tokio::test]
	async fn derived_entries_are_never_matched_again() {
		let cache = AnswerCache::new(cfg(), Arc::new(MemoryCacheStore::new()));
		let now = OffsetDateTime::now_utc();
		let shared = words(17).join(" ");
		let original = key(&format!("{shared} x1 x2"));

		cache.store(&original, &payload("original"), now).await;

		let derived = cache.lookup(&key(&format!("{shared} y1")), now).await.expect("near hit");

		assert_eq!(derived.outcome, CacheOutcome::HitNearDuplicate);

		// 0.90 against the derived question, 17/22 against the original.
		assert!(cache.lookup(&key(&format!("{shared} y1 z1 z2")), now).await.is_none());

		// 18/19 against the derived question, 0.90 against the original.
		let hit = cache.lookup(&key(&format!("{shared} x1 y1")), now).await.expect("near hit");
		let provenance = hit.entry.provenance.expect("provenance");

		assert_eq!(provenance.matched_question, original.question);
		assert_eq!(provenance.matched_fingerprint, original.fingerprint);
		assert!((provenance.similarity - 0.90).abs() < 1e-6);
	}

	#[tokio::test]
	async fn below_mid_threshold_misses() {
		let cache = AnswerCache::new(cfg(), Arc::new(MemoryCacheStore::new()));
		let now = OffsetDateTime::now_utc();

		cache.store(&key("alpha beta gamma delta"), &payload("a"), now).await;

		assert!(cache.lookup(&key("alpha beta epsilon zeta"), now).await.is_none());
	}

	#[tokio::test]
	async fn best_similarity_then_newest_wins() {
		let cache = AnswerCache::new(cfg(), Arc::new(MemoryCacheStore::new()));
		let now = OffsetDateTime::now_utc();
		let shared = words(17).join(" ");

		cache.store(&key(&format!("{shared} old1 old2")), &payload("older"), now - Duration::seconds(60)).await;
		cache.store(&key(&format!("{shared} new1 new2")), &payload("newer"), now).await;
		cache.store(&key(&format!("{shared} far1 far2 far3 far4")), &payload("far"), now).await;

		let hit = cache.lookup(&key(&format!("{shared} q1")), now).await.expect("hit");

		assert_eq!(hit.entry.payload.answer, "newer");
	}

	#[tokio::test]
	async fn malformed_entry_is_evicted() {
		let store = Arc::new(MemoryCacheStore::new());
		let cache = AnswerCache::new(cfg(), store.clone());
		let now = OffsetDateTime::now_utc();
		let key = key("what is the retention policy");

		store
			.put(CacheRecord {
				fingerprint: key.fingerprint.clone(),
				scope_key: key.scope_key.clone(),
				created_at: now,
				expires_at: now + Duration::seconds(60),
				entry: serde_json::json!({ "garbage": true }),
			})
			.await
			.expect("put");

		assert!(cache.lookup(&key, now).await.is_none());
		assert!(store.is_empty());
		assert_eq!(cache.stats().evicted_malformed, 1);
		assert_eq!(cache.stats().miss, 1);
	}

	#[tokio::test]
	async fn oversize_payload_is_not_stored() {
		let store = Arc::new(MemoryCacheStore::new());
		let cache = AnswerCache::new(
			sift_config::Cache { max_payload_bytes: Some(64), ..cfg() },
			store.clone(),
		);

		assert!(!cache.store(&key("q"), &payload(&"x".repeat(512)), OffsetDateTime::now_utc()).await);
		assert!(store.is_empty());
		assert_eq!(cache.stats().skipped_oversize, 1);
	}

	struct BrokenStore;
	impl CacheStore for BrokenStore {
		fn supports_scan(&self) -> bool {
			false
		}

		fn get<'a>(
			&'a self,
			_: &'a str,
			_: OffsetDateTime,
		) -> BoxFuture<'a, Result<Option<CacheRecord>>> {
			Box::pin(async { Err(crate::Error::Storage { message: "down".to_string() }) })
		}

		fn put<'a>(&'a self, _: CacheRecord) -> BoxFuture<'a, Result<()>> {
			Box::pin(async { Err(crate::Error::Storage { message: "down".to_string() }) })
		}

		fn remove<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<bool>> {
			Box::pin(async { Ok(false) })
		}

		fn scan<'a>(
			&'a self,
			_: &'a str,
			_: OffsetDateTime,
			_: Option<usize>,
		) -> BoxFuture<'a, Result<Option<Vec<CacheRecord>>>> {
			Box::pin(async { Ok(None) })
		}

		fn purge_expired<'a>(&'a self, _: OffsetDateTime) -> BoxFuture<'a, Result<u64>> {
			Box::pin(async { Ok(0) })
		}
	}

	#[tokio::test]
	async fn store_failures_degrade_to_miss() {
		let cache = AnswerCache::new(cfg(), Arc::new(BrokenStore));
		let now = OffsetDateTime::now_utc();
		let key = key("anything");

		assert!(!cache.near_duplicate_enabled());
		assert!(cache.lookup(&key, now).await.is_none());
		assert!(!cache.store(&key, &payload("a"), now).await);
		assert_eq!(cache.stats().store_errors, 2);
	}
}
