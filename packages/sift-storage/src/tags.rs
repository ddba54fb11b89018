use std::collections::HashMap;

use sqlx::PgExecutor;
use uuid::Uuid;

use crate::{Result, models::DocumentTag};

/// Tags for every document in `doc_ids`, in one round trip. Documents without tags are absent
/// from the map.
pub async fn tags_for_documents(
	executor: impl PgExecutor<'_>,
	tenant_id: &str,
	doc_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<String>>> {
	if doc_ids.is_empty() {
		return Ok(HashMap::new());
	}

	let rows = sqlx::query_as::<_, DocumentTag>(
		"\
SELECT doc_id, tag
FROM document_tags
WHERE tenant_id = $1 AND doc_id = ANY($2)
ORDER BY doc_id, tag",
	)
	.bind(tenant_id)
	.bind(doc_ids)
	.fetch_all(executor)
	.await?;
	let mut out: HashMap<Uuid, Vec<String>> = HashMap::new();

	for row in rows {
		out.entry(row.doc_id).or_default().push(row.tag);
	}

	Ok(out)
}

pub async fn insert_tag(
	executor: impl PgExecutor<'_>,
	tenant_id: &str,
	doc_id: Uuid,
	tag: &str,
) -> Result<()> {
	sqlx::query(
		"\
INSERT INTO document_tags (tenant_id, doc_id, tag)
VALUES ($1, $2, $3)
ON CONFLICT DO NOTHING",
	)
	.bind(tenant_id)
	.bind(doc_id)
	.bind(tag)
	.execute(executor)
	.await?;

	Ok(())
}
