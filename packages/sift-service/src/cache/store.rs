use std::{
	collections::HashMap,
	sync::{
		RwLock, RwLockReadGuard, RwLockWriteGuard,
		atomic::{AtomicU64, Ordering},
	},
};

use time::OffsetDateTime;

use crate::{BoxFuture, CacheRecord, CacheStore, Result};

/// Every this many writes, expired records are swept out of the map.
pub const PURGE_EVERY_WRITES: u64 = 64;

/// In-process cache store. Reads share the lock; each write replaces one record atomically.
///
/// Expired records are dropped when read and swept periodically on write, so the map does
/// not grow without bound when nobody calls `purge_expired`.
#[derive(Default)]
pub struct MemoryCacheStore {
	records: RwLock<HashMap<String, CacheRecord>>,
	writes: AtomicU64,
}
impl MemoryCacheStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of stored records, expired ones included.
	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.read().is_empty()
	}

	fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheRecord>> {
		self.records.read().unwrap_or_else(|err| err.into_inner())
	}

	fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheRecord>> {
		self.records.write().unwrap_or_else(|err| err.into_inner())
	}
}
impl CacheStore for MemoryCacheStore {
	fn supports_scan(&self) -> bool {
		true
	}

	fn get<'a>(
		&'a self,
		fingerprint: &'a str,
		now: OffsetDateTime,
	) -> BoxFuture<'a, Result<Option<CacheRecord>>> {
		let (record, expired) = match self.read().get(fingerprint) {
			Some(record) if record.expires_at > now => (Some(record.clone()), false),
			Some(_) => (None, true),
			None => (None, false),
		};

		if expired {
			let mut records = self.write();

			// Another writer may have refreshed it in between.
			if records.get(fingerprint).is_some_and(|record| record.expires_at <= now) {
				records.remove(fingerprint);
			}
		}

		Box::pin(async move { Ok(record) })
	}

	fn put<'a>(&'a self, record: CacheRecord) -> BoxFuture<'a, Result<()>> {
		let mut records = self.write();

		records.insert(record.fingerprint.clone(), record);

		if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY_WRITES == 0 {
			let now = OffsetDateTime::now_utc();
			let before = records.len();

			records.retain(|_, record| record.expires_at > now);

			let swept = before - records.len();

			if swept > 0 {
				tracing::debug!(swept, "Swept expired in-memory cache records.");
			}
		}

		drop(records);

		Box::pin(async { Ok(()) })
	}

	fn remove<'a>(&'a self, fingerprint: &'a str) -> BoxFuture<'a, Result<bool>> {
		let removed = self.write().remove(fingerprint).is_some();

		Box::pin(async move { Ok(removed) })
	}

	fn scan<'a>(
		&'a self,
		scope_key: &'a str,
		now: OffsetDateTime,
		limit: Option<usize>,
	) -> BoxFuture<'a, Result<Option<Vec<CacheRecord>>>> {
		let mut records: Vec<CacheRecord> = self
			.read()
			.values()
			.filter(|record| record.scope_key == scope_key && record.expires_at > now)
			.cloned()
			.collect();

		records.sort_by(|a, b| {
			b.created_at.cmp(&a.created_at).then_with(|| a.fingerprint.cmp(&b.fingerprint))
		});

		if let Some(limit) = limit {
			records.truncate(limit);
		}

		Box::pin(async move { Ok(Some(records)) })
	}

	fn purge_expired<'a>(&'a self, now: OffsetDateTime) -> BoxFuture<'a, Result<u64>> {
		let mut records = self.write();
		let before = records.len();

		records.retain(|_, record| record.expires_at > now);

		let purged = (before - records.len()) as u64;

		drop(records);

		Box::pin(async move { Ok(purged) })
	}
}

#[cfg(test)]
mod tests {
	use time::Duration;

	use super::*;

	fn record(fingerprint: &str, scope_key: &str, age_secs: i64, ttl_secs: i64) -> CacheRecord {
		let now = OffsetDateTime::now_utc();
		let created_at = now - Duration::seconds(age_secs);

		CacheRecord {
			fingerprint: fingerprint.to_string(),
			scope_key: scope_key.to_string(),
			created_at,
			expires_at: created_at + Duration::seconds(ttl_secs),
			entry: serde_json::json!({}),
		}
	}

	#[tokio::test]
	async fn expired_records_are_invisible_and_purged() {
		let store = MemoryCacheStore::new();
		let now = OffsetDateTime::now_utc();

		store.put(record("live", "s", 10, 3_600)).await.expect("put");
		store.put(record("stale", "s", 7_200, 60)).await.expect("put");

		store.put(record("stale-unread", "s", 7_200, 60)).await.expect("put");

		assert!(store.get("live", now).await.expect("get").is_some());
		assert!(store.get("stale", now).await.expect("get").is_none());
		// The read already dropped "stale"; only the unread one is left to purge.
		assert_eq!(store.len(), 2);
		assert_eq!(store.purge_expired(now).await.expect("purge"), 1);
		assert_eq!(store.len(), 1);
	}

	#[tokio::test]
	async fn expired_records_are_swept_on_write_without_purge() {
		let store = MemoryCacheStore::new();

		for idx in 0..PURGE_EVERY_WRITES - 1 {
			store.put(record(&format!("stale-{idx}"), "s", 7_200, 60)).await.expect("put");
		}

		assert_eq!(store.len() as u64, PURGE_EVERY_WRITES - 1);

		store.put(record("live", "s", 0, 3_600)).await.expect("put");

		assert_eq!(store.len(), 1);
		assert!(store.get("live", OffsetDateTime::now_utc()).await.expect("get").is_some());
	}

	#[tokio::test]
	async fn scan_is_scoped_newest_first_and_bounded() {
		let store = MemoryCacheStore::new();
		let now = OffsetDateTime::now_utc();

		store.put(record("old", "s", 300, 3_600)).await.expect("put");
		store.put(record("new", "s", 5, 3_600)).await.expect("put");
		store.put(record("other", "t", 1, 3_600)).await.expect("put");

		let all = store.scan("s", now, None).await.expect("scan").expect("supported");
		let bounded = store.scan("s", now, Some(1)).await.expect("scan").expect("supported");

		assert_eq!(all.iter().map(|r| r.fingerprint.as_str()).collect::<Vec<_>>(), vec!["new", "old"]);
		assert_eq!(bounded.len(), 1);
		assert_eq!(bounded[0].fingerprint, "new");
	}

	#[tokio::test]
	async fn last_writer_wins() {
		let store = MemoryCacheStore::new();
		let now = OffsetDateTime::now_utc();
		let mut second = record("k", "s", 0, 3_600);

		second.entry = serde_json::json!({ "answer": "second" });

		store.put(record("k", "s", 0, 3_600)).await.expect("put");
		store.put(second.clone()).await.expect("put");

		assert_eq!(store.get("k", now).await.expect("get"), Some(second));
		assert!(store.remove("k").await.expect("remove"));
		assert!(!store.remove("k").await.expect("remove"));
	}
}
