use sqlx::PgPool;
use time::OffsetDateTime;

use sift_storage::{
	cache,
	models::{AnswerCacheRow, NewAnswerCache},
};

use crate::{BoxFuture, CacheRecord, CacheStore, Result};

/// Cache store over the `answer_cache` table.
pub struct PgCacheStore {
	pool: PgPool,
}
impl PgCacheStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}
impl CacheStore for PgCacheStore {
	fn supports_scan(&self) -> bool {
		true
	}

	fn get<'a>(
		&'a self,
		fingerprint: &'a str,
		now: OffsetDateTime,
	) -> BoxFuture<'a, Result<Option<CacheRecord>>> {
		Box::pin(async move {
			let row = cache::fetch(&self.pool, fingerprint, now).await?;

			Ok(row.map(record_from_row))
		})
	}

	fn put<'a>(&'a self, record: CacheRecord) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			cache::upsert(
				&self.pool,
				&NewAnswerCache {
					cache_key: &record.fingerprint,
					scope_key: &record.scope_key,
					entry: &record.entry,
					created_at: record.created_at,
					expires_at: record.expires_at,
				},
			)
			.await?;

			Ok(())
		})
	}

	fn remove<'a>(&'a self, fingerprint: &'a str) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move { Ok(cache::delete(&self.pool, fingerprint).await?) })
	}

	fn scan<'a>(
		&'a self,
		scope_key: &'a str,
		now: OffsetDateTime,
		limit: Option<usize>,
	) -> BoxFuture<'a, Result<Option<Vec<CacheRecord>>>> {
		Box::pin(async move {
			let limit = limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX));
			let rows = cache::scan_scope(&self.pool, scope_key, now, limit).await?;

			Ok(Some(rows.into_iter().map(record_from_row).collect()))
		})
	}

	fn purge_expired<'a>(&'a self, now: OffsetDateTime) -> BoxFuture<'a, Result<u64>> {
		Box::pin(async move { Ok(cache::purge_expired(&self.pool, now).await?) })
	}
}

fn record_from_row(row: AnswerCacheRow) -> CacheRecord {
	CacheRecord {
		fingerprint: row.cache_key,
		scope_key: row.scope_key,
		created_at: row.created_at,
		expires_at: row.expires_at,
		entry: row.entry,
	}
}
