use time::OffsetDateTime;
use uuid::Uuid;

use brain_storage::{
	db::Db,
	models::{FeedbackRow, QueryLogRow},
	qdrant::{ChunkHit, QdrantStore},
	queries,
};

use crate::{
	BoxFuture, Error, LexicalIndex, QueryLogStore, Result, VectorIndex,
	model::{
		Degradation, EmbeddingVector, FeatureFlags, Feedback, FeedbackCategory, IndexHit,
		QueryLog, ScoreStats, StageTimings,
	},
};

impl VectorIndex for QdrantStore {
	fn search<'a>(
		&'a self,
		vector: &'a EmbeddingVector,
		user_id: Uuid,
		top_k: u32,
		threshold: f32,
	) -> BoxFuture<'a, Result<Vec<IndexHit>>> {
		Box::pin(async move {
			if vector.dimensions() != self.vector_dim as usize {
				return Err(Error::EmbeddingMismatch {
					message: format!(
						"Query vector has {} dimensions; the collection expects {}.",
						vector.dimensions(),
						self.vector_dim
					),
				});
			}

			let hits = self.search_dense(vector.values(), user_id, top_k, threshold).await?;

			Ok(hits.into_iter().map(index_hit).collect())
		})
	}
}

impl LexicalIndex for QdrantStore {
	fn search<'a>(
		&'a self,
		text: &'a str,
		user_id: Uuid,
		top_k: u32,
	) -> BoxFuture<'a, Result<Vec<IndexHit>>> {
		Box::pin(async move {
			let hits = self.search_bm25(text, user_id, top_k).await?;

			Ok(hits.into_iter().map(index_hit).collect())
		})
	}
}

impl QueryLogStore for Db {
	fn append<'a>(&'a self, log: &'a QueryLog) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let row = to_row(log)?;

			queries::insert_query_log(self, &row).await?;

			Ok(())
		})
	}

	fn attach_feedback<'a>(
		&'a self,
		log_id: Uuid,
		feedback: &'a Feedback,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let row = FeedbackRow {
				positive: feedback.positive,
				category: feedback.category.map(|category| category.as_str().to_string()),
				comment: feedback.comment.clone(),
				at: feedback.submitted_at,
			};

			queries::attach_feedback(self, log_id, &row).await?;

			Ok(())
		})
	}

	fn list_since<'a>(&'a self, since: OffsetDateTime) -> BoxFuture<'a, Result<Vec<QueryLog>>> {
		Box::pin(async move {
			let rows = queries::list_query_logs_since(self, since).await?;

			rows.into_iter().map(from_row).collect()
		})
	}
}

fn index_hit(hit: ChunkHit) -> IndexHit {
	IndexHit {
		note_id: hit.note_id,
		chunk_index: hit.chunk_index,
		text: hit.text,
		title: hit.title,
		tags: hit.tags,
		updated_at: hit.updated_at,
		score: hit.score,
	}
}

fn to_row(log: &QueryLog) -> Result<QueryLogRow> {
	let features = serde_json::to_value(log.features)
		.map_err(|err| Error::Storage { message: format!("Failed to encode features: {err}") })?;
	let degradations = serde_json::to_value(&log.degradations).map_err(|err| Error::Storage {
		message: format!("Failed to encode degradations: {err}"),
	})?;
	let feedback = log.feedback.as_ref();

	Ok(QueryLogRow {
		log_id: log.log_id,
		user_id: log.user_id,
		conversation_id: log.conversation_id,
		query: log.query.clone(),
		created_at: log.created_at,
		embedding_ms: to_i64(log.timings.embedding_ms),
		expansion_ms: to_i64(log.timings.expansion_ms),
		retrieval_ms: to_i64(log.timings.retrieval_ms),
		rerank_ms: to_i64(log.timings.rerank_ms),
		total_ms: to_i64(log.timings.total_ms),
		retrieved_count: to_i32(log.retrieved_count),
		final_count: to_i32(log.final_count),
		unscored_count: to_i32(log.unscored_count),
		top_cosine: log.scores.top_cosine,
		avg_cosine: log.scores.avg_cosine,
		top_rerank: log.scores.top_rerank,
		avg_rerank: log.scores.avg_rerank,
		embedding_cache_hit: log.embedding_cache_hit,
		features,
		degradations,
		feedback_positive: feedback.map(|feedback| feedback.positive),
		feedback_category: feedback
			.and_then(|feedback| feedback.category)
			.map(|category| category.as_str().to_string()),
		feedback_comment: feedback.and_then(|feedback| feedback.comment.clone()),
		feedback_at: feedback.map(|feedback| feedback.submitted_at),
	})
}

fn from_row(row: QueryLogRow) -> Result<QueryLog> {
	let features: FeatureFlags = serde_json::from_value(row.features).map_err(|err| {
		Error::Storage { message: format!("Invalid features value for {}: {err}", row.log_id) }
	})?;
	let degradations: Vec<Degradation> =
		serde_json::from_value(row.degradations).map_err(|err| Error::Storage {
			message: format!("Invalid degradations value for {}: {err}", row.log_id),
		})?;
	let feedback = match (row.feedback_positive, row.feedback_at) {
		(Some(positive), Some(submitted_at)) => Some(Feedback {
			positive,
			category: row.feedback_category.as_deref().map(FeedbackCategory::parse),
			comment: row.feedback_comment,
			submitted_at,
		}),
		_ => None,
	};

	Ok(QueryLog {
		log_id: row.log_id,
		user_id: row.user_id,
		conversation_id: row.conversation_id,
		query: row.query,
		created_at: row.created_at,
		timings: StageTimings {
			embedding_ms: row.embedding_ms.max(0) as u64,
			expansion_ms: row.expansion_ms.max(0) as u64,
			retrieval_ms: row.retrieval_ms.max(0) as u64,
			rerank_ms: row.rerank_ms.max(0) as u64,
			total_ms: row.total_ms.max(0) as u64,
		},
		retrieved_count: row.retrieved_count.max(0) as u32,
		final_count: row.final_count.max(0) as u32,
		unscored_count: row.unscored_count.max(0) as u32,
		scores: ScoreStats {
			top_cosine: row.top_cosine,
			avg_cosine: row.avg_cosine,
			top_rerank: row.top_rerank,
			avg_rerank: row.avg_rerank,
		},
		embedding_cache_hit: row.embedding_cache_hit,
		features,
		degradations,
		feedback,
	})
}

fn to_i64(value: u64) -> i64 {
	i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_i32(value: u32) -> i32 {
	i32::try_from(value).unwrap_or(i32::MAX)
}
