use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct AnswerCacheRow {
	pub cache_key: String,
	pub scope_key: String,
	pub entry: Value,
	pub created_at: OffsetDateTime,
	pub expires_at: OffsetDateTime,
	pub last_accessed_at: OffsetDateTime,
	pub hit_count: i64,
}

#[derive(Debug)]
pub struct NewAnswerCache<'a> {
	pub cache_key: &'a str,
	pub scope_key: &'a str,
	pub entry: &'a Value,
	pub created_at: OffsetDateTime,
	pub expires_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
pub struct DocumentTag {
	pub doc_id: Uuid,
	pub tag: String,
}
