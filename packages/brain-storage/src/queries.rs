use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	Error, Result,
	db::Db,
	models::{FeedbackRow, QueryLogRow},
};

pub async fn insert_query_log(db: &Db, log: &QueryLogRow) -> Result<()> {
	sqlx::query(
		"\
INSERT INTO rag_query_logs (
	log_id,
	user_id,
	conversation_id,
	query,
	created_at,
	embedding_ms,
	expansion_ms,
	retrieval_ms,
	rerank_ms,
	total_ms,
	retrieved_count,
	final_count,
	unscored_count,
	top_cosine,
	avg_cosine,
	top_rerank,
	avg_rerank,
	embedding_cache_hit,
	features,
	degradations,
	feedback_positive,
	feedback_category,
	feedback_comment,
	feedback_at
)
VALUES (
	$1,
	$2,
	$3,
	$4,
	$5,
	$6,
	$7,
	$8,
	$9,
	$10,
	$11,
	$12,
	$13,
	$14,
	$15,
	$16,
	$17,
	$18,
	$19,
	$20,
	$21,
	$22,
	$23,
	$24
)
ON CONFLICT (log_id) DO NOTHING",
	)
	.bind(log.log_id)
	.bind(log.user_id)
	.bind(log.conversation_id)
	.bind(log.query.as_str())
	.bind(log.created_at)
	.bind(log.embedding_ms)
	.bind(log.expansion_ms)
	.bind(log.retrieval_ms)
	.bind(log.rerank_ms)
	.bind(log.total_ms)
	.bind(log.retrieved_count)
	.bind(log.final_count)
	.bind(log.unscored_count)
	.bind(log.top_cosine)
	.bind(log.avg_cosine)
	.bind(log.top_rerank)
	.bind(log.avg_rerank)
	.bind(log.embedding_cache_hit)
	.bind(&log.features)
	.bind(&log.degradations)
	.bind(log.feedback_positive)
	.bind(log.feedback_category.as_deref())
	.bind(log.feedback_comment.as_deref())
	.bind(log.feedback_at)
	.execute(&db.pool)
	.await?;

	Ok(())
}

pub async fn attach_feedback(db: &Db, log_id: Uuid, feedback: &FeedbackRow) -> Result<()> {
	let result = sqlx::query(
		"\
UPDATE rag_query_logs
SET feedback_positive = $2,
	feedback_category = $3,
	feedback_comment = $4,
	feedback_at = $5
WHERE log_id = $1",
	)
	.bind(log_id)
	.bind(feedback.positive)
	.bind(feedback.category.as_deref())
	.bind(feedback.comment.as_deref())
	.bind(feedback.at)
	.execute(&db.pool)
	.await?;

	if result.rows_affected() == 0 {
		return Err(Error::NotFound(format!("query log {log_id}")));
	}

	Ok(())
}

pub async fn list_query_logs_since(db: &Db, since: OffsetDateTime) -> Result<Vec<QueryLogRow>> {
	let rows = sqlx::query_as::<_, QueryLogRow>(
		"\
SELECT *
FROM rag_query_logs
WHERE created_at >= $1
ORDER BY created_at ASC, log_id ASC",
	)
	.bind(since)
	.fetch_all(&db.pool)
	.await?;

	Ok(rows)
}
