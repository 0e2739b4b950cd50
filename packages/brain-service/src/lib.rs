pub mod analytics;
pub mod cache;
pub mod cancel;
pub mod context;
pub mod expansion;
pub mod index;
pub mod metrics;
pub mod model;
pub mod rag;
pub mod rerank;
pub mod retrieval;
pub mod structured;

mod error;

pub use analytics::{AnalyticsRecorder, FeedbackCorrelation};
pub use cache::EmbeddingCache;
pub use cancel::CancellationToken;
pub use error::{Error, Result};
pub use metrics::TracingMetrics;
pub use model::{
	Candidate, Citation, Degradation, EmbeddingVector, FeatureFlags, Feedback, FeedbackCategory,
	IndexHit, QueryLog, RagContext, RagOptions,
};
pub use rag::{FeedbackRequest, RetrieveRequest};

use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use brain_config::{Config, EmbeddingProviderConfig, LlmProviderConfig};
use brain_providers::{StructuredRequest, embedding, llm};
use brain_storage::{db::Db, qdrant::QdrantStore};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>>;
}

pub trait LlmProvider
where
	Self: Send + Sync,
{
	fn generate_structured<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		request: &'a StructuredRequest,
	) -> BoxFuture<'a, Result<Value>>;
}

pub trait VectorIndex
where
	Self: Send + Sync,
{
	fn search<'a>(
		&'a self,
		vector: &'a EmbeddingVector,
		user_id: Uuid,
		top_k: u32,
		threshold: f32,
	) -> BoxFuture<'a, Result<Vec<IndexHit>>>;
}

pub trait LexicalIndex
where
	Self: Send + Sync,
{
	fn search<'a>(
		&'a self,
		text: &'a str,
		user_id: Uuid,
		top_k: u32,
	) -> BoxFuture<'a, Result<Vec<IndexHit>>>;
}

pub trait QueryLogStore
where
	Self: Send + Sync,
{
	fn append<'a>(&'a self, log: &'a QueryLog) -> BoxFuture<'a, Result<()>>;

	/// Fails with [`Error::NotFound`] when no log has `log_id`.
	fn attach_feedback<'a>(
		&'a self,
		log_id: Uuid,
		feedback: &'a Feedback,
	) -> BoxFuture<'a, Result<()>>;

	fn list_since<'a>(&'a self, since: OffsetDateTime) -> BoxFuture<'a, Result<Vec<QueryLog>>>;
}

pub trait UserDirectory
where
	Self: Send + Sync,
{
	fn user_exists<'a>(&'a self, user_id: Uuid) -> BoxFuture<'a, Result<bool>>;
}

pub trait MetricsSink
where
	Self: Send + Sync,
{
	fn increment(&self, name: &str, by: u64);

	fn observe_ms(&self, name: &str, ms: u64);
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub llm: Arc<dyn LlmProvider>,
}
impl Default for Providers {
	fn default() -> Self {
		Self { embedding: Arc::new(DefaultProviders), llm: Arc::new(DefaultProviders) }
	}
}

/// Everything outside the process the pipeline reads from or writes to.
#[derive(Clone)]
pub struct Backends {
	pub vector: Arc<dyn VectorIndex>,
	pub lexical: Option<Arc<dyn LexicalIndex>>,
	pub logs: Arc<dyn QueryLogStore>,
	pub users: Option<Arc<dyn UserDirectory>>,
	pub metrics: Arc<dyn MetricsSink>,
}

pub struct RagService {
	pub cfg: Config,
	pub providers: Providers,
	pub backends: Backends,
	pub cache: EmbeddingCache,
	pub recorder: AnalyticsRecorder,
}
impl RagService {
	pub fn new(cfg: Config, providers: Providers, backends: Backends) -> Self {
		let cache = EmbeddingCache::new(&cfg.cache, backends.metrics.clone());
		let recorder = AnalyticsRecorder::new(backends.logs.clone(), cfg.analytics.enabled);

		Self { cfg, providers, backends, cache, recorder }
	}

	/// Wires the service to Postgres, Qdrant, and the configured vendor adapters.
	pub async fn connect(cfg: Config) -> Result<Self> {
		let db = Db::connect(&cfg.storage.postgres).await?;

		db.ensure_schema().await?;

		let qdrant = Arc::new(QdrantStore::new(&cfg.storage.qdrant)?);
		let lexical: Option<Arc<dyn LexicalIndex>> =
			cfg.storage.qdrant.lexical_enabled.then(|| qdrant.clone() as Arc<dyn LexicalIndex>);
		let backends = Backends {
			vector: qdrant,
			lexical,
			logs: Arc::new(db),
			users: None,
			metrics: Arc::new(TracingMetrics),
		};

		Ok(Self::new(cfg, Providers::default(), backends))
	}
}

struct DefaultProviders;
impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
		Box::pin(async move { Ok(embedding::embed(cfg, texts).await?) })
	}
}
impl LlmProvider for DefaultProviders {
	fn generate_structured<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		request: &'a StructuredRequest,
	) -> BoxFuture<'a, Result<Value>> {
		Box::pin(async move { Ok(llm::generate_structured(cfg, request).await?) })
	}
}
