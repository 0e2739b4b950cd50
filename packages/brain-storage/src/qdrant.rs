pub const DENSE_VECTOR_NAME: &str = "dense";
pub const BM25_VECTOR_NAME: &str = "bm25";
pub const BM25_MODEL: &str = "qdrant/bm25";

use std::collections::HashMap;

use qdrant_client::qdrant::{
	Condition, Document, Filter, Query, QueryPointsBuilder, ScoredPoint, Value, value::Kind,
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::Result;

/// One chunk point as stored in the collection payload.
#[derive(Debug, Clone)]
pub struct ChunkHit {
	pub note_id: Uuid,
	pub chunk_index: i32,
	pub text: String,
	pub title: String,
	pub tags: Vec<String>,
	pub updated_at: Option<OffsetDateTime>,
	pub score: f32,
}

pub struct QdrantStore {
	pub client: qdrant_client::Qdrant,
	pub collection: String,
	pub vector_dim: u32,
}
impl QdrantStore {
	pub fn new(cfg: &brain_config::Qdrant) -> Result<Self> {
		let client = qdrant_client::Qdrant::from_url(&cfg.url).build()?;

		Ok(Self { client, collection: cfg.collection.clone(), vector_dim: cfg.vector_dim })
	}

	pub async fn search_dense(
		&self,
		vector: &[f32],
		user_id: Uuid,
		limit: u32,
		threshold: f32,
	) -> Result<Vec<ChunkHit>> {
		let search = QueryPointsBuilder::new(self.collection.clone())
			.query(Query::new_nearest(vector.to_vec()))
			.using(DENSE_VECTOR_NAME)
			.filter(user_filter(user_id))
			.score_threshold(threshold)
			.with_payload(true)
			.limit(limit as u64);
		let response = self.client.query(search).await?;

		Ok(collect_hits(&response.result))
	}

	pub async fn search_bm25(
		&self,
		text: &str,
		user_id: Uuid,
		limit: u32,
	) -> Result<Vec<ChunkHit>> {
		let search = QueryPointsBuilder::new(self.collection.clone())
			.query(Query::new_nearest(Document::new(text.to_string(), BM25_MODEL)))
			.using(BM25_VECTOR_NAME)
			.filter(user_filter(user_id))
			.with_payload(true)
			.limit(limit as u64);
		let response = self.client.query(search).await?;

		Ok(collect_hits(&response.result))
	}
}

fn user_filter(user_id: Uuid) -> Filter {
	Filter::must([Condition::matches("user_id", user_id.to_string())])
}

fn collect_hits(points: &[ScoredPoint]) -> Vec<ChunkHit> {
	let mut hits = Vec::with_capacity(points.len());

	for point in points {
		let payload = &point.payload;
		let (Some(note_id), Some(chunk_index), Some(text)) = (
			payload_uuid(payload, "note_id"),
			payload_i32(payload, "chunk_index"),
			payload_string(payload, "text"),
		) else {
			tracing::warn!(point_id = ?point.id, "Chunk point is missing required payload fields.");

			continue;
		};

		hits.push(ChunkHit {
			note_id,
			chunk_index,
			text,
			title: payload_string(payload, "title").unwrap_or_default(),
			tags: payload_strings(payload, "tags"),
			updated_at: payload_rfc3339(payload, "updated_at"),
			score: point.score,
		});
	}

	hits
}

fn payload_uuid(payload: &HashMap<String, Value>, key: &str) -> Option<Uuid> {
	let value = payload.get(key)?;

	match &value.kind {
		Some(Kind::StringValue(text)) => Uuid::parse_str(text).ok(),
		_ => None,
	}
}

fn payload_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
	let value = payload.get(key)?;

	match &value.kind {
		Some(Kind::StringValue(text)) => Some(text.to_string()),
		_ => None,
	}
}

fn payload_strings(payload: &HashMap<String, Value>, key: &str) -> Vec<String> {
	let Some(value) = payload.get(key) else {
		return Vec::new();
	};

	match &value.kind {
		Some(Kind::ListValue(list)) => list
			.values
			.iter()
			.filter_map(|item| match &item.kind {
				Some(Kind::StringValue(text)) => Some(text.to_string()),
				_ => None,
			})
			.collect(),
		Some(Kind::StringValue(text)) => vec![text.to_string()],
		_ => Vec::new(),
	}
}

fn payload_rfc3339(payload: &HashMap<String, Value>, key: &str) -> Option<OffsetDateTime> {
	let text = payload_string(payload, key)?;

	OffsetDateTime::parse(text.as_str(), &Rfc3339).ok()
}

fn payload_i32(payload: &HashMap<String, Value>, key: &str) -> Option<i32> {
	let value = payload.get(key)?;

	match &value.kind {
		Some(Kind::IntegerValue(value)) => i32::try_from(*value).ok(),
		Some(Kind::DoubleValue(value)) =>
			if value.fract() == 0.0 {
				i32::try_from(*value as i64).ok()
			} else {
				None
			},
		_ => None,
	}
}
