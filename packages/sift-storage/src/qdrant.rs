pub const DENSE_VECTOR_NAME: &str = "dense";
pub const BM25_VECTOR_NAME: &str = "bm25";
pub const BM25_MODEL: &str = "qdrant/bm25";

use std::collections::HashMap;

use qdrant_client::qdrant::{
	Condition, DatetimeRange, Document, Filter, PointId, Query, QueryPointsBuilder, ScoredPoint,
	Timestamp, Value, point_id::PointIdOptions, value::Kind,
};
use time::OffsetDateTime;

use crate::Result;

/// Payload conditions applied to both dense and BM25 queries.
#[derive(Clone, Debug, Default)]
pub struct SegmentFilter {
	pub tenant_id: String,
	/// A segment passes when it carries any of these tags.
	pub tags: Vec<String>,
	/// A segment passes when its `doc_type` is any of these.
	pub doc_types: Vec<String>,
	pub updated_after: Option<OffsetDateTime>,
	pub updated_before: Option<OffsetDateTime>,
}
impl SegmentFilter {
	pub fn to_filter(&self) -> Filter {
		let mut must = vec![Condition::matches("tenant_id", self.tenant_id.clone())];

		if !self.tags.is_empty() {
			must.push(Condition::matches("tags", self.tags.clone()));
		}
		if !self.doc_types.is_empty() {
			must.push(Condition::matches("doc_type", self.doc_types.clone()));
		}
		if let Some(range) =
			updated_at_range(self.updated_after.as_ref(), self.updated_before.as_ref())
		{
			must.push(range);
		}

		Filter { must, should: Vec::new(), must_not: Vec::new(), min_should: None }
	}
}

pub struct QdrantStore {
	pub client: qdrant_client::Qdrant,
	pub collection: String,
	pub vector_dim: u32,
}
impl QdrantStore {
	pub fn new(cfg: &sift_config::Qdrant) -> Result<Self> {
		let client = qdrant_client::Qdrant::from_url(&cfg.url).build()?;

		Ok(Self { client, collection: cfg.collection.clone(), vector_dim: cfg.vector_dim })
	}

	/// Nearest neighbours on the dense named vector, best first.
	pub async fn dense_search(
		&self,
		vector: Vec<f32>,
		filter: &Filter,
		limit: u64,
	) -> Result<Vec<ScoredPoint>> {
		if vector.len() != self.vector_dim as usize {
			return Err(crate::Error::InvalidArgument(format!(
				"Query vector has {} dimensions; collection expects {}.",
				vector.len(),
				self.vector_dim
			)));
		}

		let search = QueryPointsBuilder::new(self.collection.clone())
			.query(Query::new_nearest(vector))
			.using(DENSE_VECTOR_NAME)
			.filter(filter.clone())
			.limit(limit)
			.with_payload(true);
		let response = self.client.query(search).await?;

		Ok(response.result)
	}

	/// BM25 relevance on the sparse named vector, scored server side.
	pub async fn bm25_search(
		&self,
		text: &str,
		filter: &Filter,
		limit: u64,
	) -> Result<Vec<ScoredPoint>> {
		let search = QueryPointsBuilder::new(self.collection.clone())
			.query(Query::new_nearest(Document::new(text.to_string(), BM25_MODEL)))
			.using(BM25_VECTOR_NAME)
			.filter(filter.clone())
			.limit(limit)
			.with_payload(true);
		let response = self.client.query(search).await?;

		Ok(response.result)
	}
}

pub fn point_id_to_uuid(point_id: &PointId) -> Option<uuid::Uuid> {
	match &point_id.point_id_options {
		Some(PointIdOptions::Uuid(id)) => uuid::Uuid::parse_str(id).ok(),
		_ => None,
	}
}

pub fn payload_uuid(payload: &HashMap<String, Value>, key: &str) -> Option<uuid::Uuid> {
	payload_str(payload, key).and_then(|text| uuid::Uuid::parse_str(text).ok())
}

pub fn payload_str<'a>(payload: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
	match &payload.get(key)?.kind {
		Some(Kind::StringValue(text)) => Some(text.as_str()),
		_ => None,
	}
}

fn updated_at_range(
	updated_after: Option<&OffsetDateTime>,
	updated_before: Option<&OffsetDateTime>,
) -> Option<Condition> {
	let gte = updated_after.map(to_timestamp);
	let lt = updated_before.map(to_timestamp);

	if gte.is_none() && lt.is_none() {
		return None;
	}

	Some(Condition::datetime_range("updated_at", DatetimeRange { lt, gt: None, gte, lte: None }))
}

fn to_timestamp(at: &OffsetDateTime) -> Timestamp {
	Timestamp { seconds: at.unix_timestamp(), nanos: at.nanosecond() as i32 }
}
