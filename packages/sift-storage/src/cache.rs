use sqlx::PgExecutor;
use time::OffsetDateTime;

use crate::{
	Result,
	models::{AnswerCacheRow, NewAnswerCache},
};

/// Returns the live row for `cache_key` and records the access.
pub async fn fetch(
	executor: impl PgExecutor<'_>,
	cache_key: &str,
	now: OffsetDateTime,
) -> Result<Option<AnswerCacheRow>> {
	let row = sqlx::query_as::<_, AnswerCacheRow>(
		"\
UPDATE answer_cache
SET last_accessed_at = $2, hit_count = hit_count + 1
WHERE cache_key = $1 AND expires_at > $2
RETURNING cache_key, scope_key, entry, created_at, expires_at, last_accessed_at, hit_count",
	)
	.bind(cache_key)
	.bind(now)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

/// Inserts or replaces the entry for `cache_key`. Concurrent writers for one key resolve to the
/// last statement applied.
pub async fn upsert(executor: impl PgExecutor<'_>, row: &NewAnswerCache<'_>) -> Result<()> {
	sqlx::query(
		"\
INSERT INTO answer_cache (
	cache_key,
	scope_key,
	entry,
	created_at,
	expires_at,
	last_accessed_at,
	hit_count
)
VALUES ($1, $2, $3, $4, $5, $4, 0)
ON CONFLICT (cache_key) DO UPDATE
SET
	scope_key = EXCLUDED.scope_key,
	entry = EXCLUDED.entry,
	created_at = EXCLUDED.created_at,
	expires_at = EXCLUDED.expires_at,
	last_accessed_at = EXCLUDED.last_accessed_at",
	)
	.bind(row.cache_key)
	.bind(row.scope_key)
	.bind(row.entry)
	.bind(row.created_at)
	.bind(row.expires_at)
	.execute(executor)
	.await?;

	Ok(())
}

pub async fn delete(executor: impl PgExecutor<'_>, cache_key: &str) -> Result<bool> {
	let res = sqlx::query("DELETE FROM answer_cache WHERE cache_key = $1")
		.bind(cache_key)
		.execute(executor)
		.await?;

	Ok(res.rows_affected() > 0)
}

/// Live rows sharing `scope_key`, newest first. `limit` of `None` reads every live row.
pub async fn scan_scope(
	executor: impl PgExecutor<'_>,
	scope_key: &str,
	now: OffsetDateTime,
	limit: Option<i64>,
) -> Result<Vec<AnswerCacheRow>> {
	let rows = sqlx::query_as::<_, AnswerCacheRow>(
		"\
SELECT cache_key, scope_key, entry, created_at, expires_at, last_accessed_at, hit_count
FROM answer_cache
WHERE scope_key = $1 AND expires_at > $2
ORDER BY created_at DESC, cache_key ASC
LIMIT $3",
	)
	.bind(scope_key)
	.bind(now)
	.bind(limit)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

pub async fn purge_expired(executor: impl PgExecutor<'_>, now: OffsetDateTime) -> Result<u64> {
	let res = sqlx::query("DELETE FROM answer_cache WHERE expires_at <= $1")
		.bind(now)
		.execute(executor)
		.await?;

	Ok(res.rows_affected())
}
