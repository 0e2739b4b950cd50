use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueryLogRow {
	pub log_id: Uuid,
	pub user_id: Uuid,
	pub conversation_id: Option<Uuid>,
	pub query: String,
	pub created_at: OffsetDateTime,
	pub embedding_ms: i64,
	pub expansion_ms: i64,
	pub retrieval_ms: i64,
	pub rerank_ms: i64,
	pub total_ms: i64,
	pub retrieved_count: i32,
	pub final_count: i32,
	pub unscored_count: i32,
	pub top_cosine: Option<f32>,
	pub avg_cosine: Option<f32>,
	pub top_rerank: Option<f32>,
	pub avg_rerank: Option<f32>,
	pub embedding_cache_hit: bool,
	pub features: Value,
	pub degradations: Value,
	pub feedback_positive: Option<bool>,
	pub feedback_category: Option<String>,
	pub feedback_comment: Option<String>,
	pub feedback_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct FeedbackRow {
	pub positive: bool,
	pub category: Option<String>,
	pub comment: Option<String>,
	pub at: OffsetDateTime,
}
