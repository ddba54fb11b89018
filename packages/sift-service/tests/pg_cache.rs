use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use sift_config::Postgres;
use sift_service::{
	AnswerPayload, CacheOutcome, CacheStore, FusionAlgorithm, RetrievalFilters, SourceRef, Strategy,
	cache::{AnswerCache, CacheKey, CacheScope, PgCacheStore},
};
use sift_storage::db::Db;
use sift_testkit::TestDatabase;

fn scope() -> CacheScope {
	CacheScope {
		search_type: Strategy::Hybrid,
		algorithm: FusionAlgorithm::Rrf,
		filters: RetrievalFilters::default(),
		prompt_template_id: "default".to_string(),
		result_limit: 5,
		caller_identity: "acme/alice".to_string(),
	}
}

fn key(question: &str) -> CacheKey {
	CacheKey::new(&sift_domain::normalize::normalize_query(question), &scope()).expect("key")
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set SIFT_PG_DSN to run."]
async fn pg_cache_store_serves_exact_and_near_duplicate_hits() {
	let Some(base_dsn) = sift_testkit::env_dsn() else {
		eprintln!("Skipping pg_cache_store_serves_exact_and_near_duplicate_hits; set SIFT_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let db = Db::connect(&Postgres { dsn: test_db.dsn().to_string(), pool_max_conns: 2 })
		.await
		.expect("Failed to connect to Postgres.");

	db.ensure_schema().await.expect("Failed to ensure schema.");

	let store = Arc::new(PgCacheStore::new(db.pool.clone()));
	let cache = AnswerCache::new(
		sift_config::Cache { backend: "postgres".to_string(), ..sift_config::Cache::default() },
		store.clone(),
	);
	let now = OffsetDateTime::now_utc();
	let payload = AnswerPayload {
		answer: "Enable nightly snapshots in the backup panel.".to_string(),
		provenance: vec![SourceRef { segment_id: Uuid::new_v4(), doc_id: Uuid::new_v4() }],
	};

	assert!(cache.near_duplicate_enabled());
	assert!(cache.store(&key("How do I configure backups?"), &payload, now).await);

	let exact = cache.lookup(&key("How do I configure backups?"), now).await.expect("exact hit");

	assert_eq!(exact.outcome, CacheOutcome::HitExact);
	assert_eq!(exact.entry.payload, payload);

	let promoted = cache.lookup(&key("how do i configure backups"), now).await.expect("promoted hit");

	assert_eq!(promoted.outcome, CacheOutcome::HitExact);
	assert!(promoted.entry.provenance.expect("provenance").confirmed);
	assert!(store.get(&key("how do i configure backups").fingerprint, now).await.expect("get").is_some());
	assert!(cache.invalidate(&key("how do i configure backups").fingerprint).await.expect("invalidate"));
	assert_eq!(cache.purge_expired(now + time::Duration::days(2)).await.expect("purge"), 1);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
