use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use sift_config::Postgres;
use sift_storage::{cache, db::Db, models::NewAnswerCache, tags};
use sift_testkit::TestDatabase;

async fn bootstrap(test_db: &TestDatabase) -> Db {
	let cfg = Postgres { dsn: test_db.dsn().to_string(), pool_max_conns: 1 };
	let db = Db::connect(&cfg).await.expect("Failed to connect to Postgres.");

	db.ensure_schema().await.expect("Failed to ensure schema.");

	db
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set SIFT_PG_DSN to run."]
async fn answer_cache_round_trip_and_expiry() {
	let Some(base_dsn) = sift_testkit::env_dsn() else {
		eprintln!("Skipping answer_cache_round_trip_and_expiry; set SIFT_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let db = bootstrap(&test_db).await;
	let now = OffsetDateTime::now_utc();
	let entry = serde_json::json!({ "answer": "Use nightly snapshots." });

	cache::upsert(
		&db.pool,
		&NewAnswerCache {
			cache_key: "live",
			scope_key: "scope",
			entry: &entry,
			created_at: now,
			expires_at: now + Duration::hours(1),
		},
	)
	.await
	.expect("Failed to upsert live entry.");
	cache::upsert(
		&db.pool,
		&NewAnswerCache {
			cache_key: "stale",
			scope_key: "scope",
			entry: &entry,
			created_at: now - Duration::hours(2),
			expires_at: now - Duration::hours(1),
		},
	)
	.await
	.expect("Failed to upsert stale entry.");

	let row = cache::fetch(&db.pool, "live", now)
		.await
		.expect("Failed to fetch entry.")
		.expect("Expected live entry.");

	assert_eq!(row.entry, entry);
	assert_eq!(row.hit_count, 1);
	assert!(cache::fetch(&db.pool, "stale", now).await.expect("Failed to fetch.").is_none());

	let scanned = cache::scan_scope(&db.pool, "scope", now, None).await.expect("Failed to scan.");

	assert_eq!(scanned.len(), 1);
	assert_eq!(cache::purge_expired(&db.pool, now).await.expect("Failed to purge."), 1);
	assert!(cache::delete(&db.pool, "live").await.expect("Failed to delete."));
	assert!(!cache::delete(&db.pool, "live").await.expect("Failed to delete."));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set SIFT_PG_DSN to run."]
async fn tags_are_loaded_in_one_batch() {
	let Some(base_dsn) = sift_testkit::env_dsn() else {
		eprintln!("Skipping tags_are_loaded_in_one_batch; set SIFT_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let db = bootstrap(&test_db).await;
	let (doc_a, doc_b, doc_c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

	for (doc_id, tag) in [(doc_a, "ops"), (doc_a, "backup"), (doc_b, "security")] {
		tags::insert_tag(&db.pool, "acme", doc_id, tag).await.expect("Failed to insert tag.");
	}

	tags::insert_tag(&db.pool, "other", doc_c, "ops").await.expect("Failed to insert tag.");

	let found = tags::tags_for_documents(&db.pool, "acme", &[doc_a, doc_b, doc_c])
		.await
		.expect("Failed to load tags.");

	assert_eq!(found.get(&doc_a), Some(&vec!["backup".to_string(), "ops".to_string()]));
	assert_eq!(found.get(&doc_b), Some(&vec!["security".to_string()]));
	assert!(!found.contains_key(&doc_c));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
