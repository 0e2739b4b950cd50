use std::sync::Arc;

use uuid::Uuid;

use brain_config::Config;
use brain_service::{Backends, Providers, RagService};

use crate::fakes::{
	FakeEmbedding, MemoryLexicalIndex, MemoryQueryLogStore, MemoryVectorIndex, NoteChunk,
	RecordingMetrics, ScriptedLlm, StaticUserDirectory,
};

/// One set of fakes wired into a [`RagService`], with handles kept for assertions.
pub struct Harness {
	pub embedding: Arc<FakeEmbedding>,
	pub llm: Arc<ScriptedLlm>,
	pub vector: Arc<MemoryVectorIndex>,
	pub lexical: Arc<MemoryLexicalIndex>,
	pub logs: Arc<MemoryQueryLogStore>,
	pub users: Option<Arc<StaticUserDirectory>>,
	pub metrics: Arc<RecordingMetrics>,
	pub lexical_enabled: bool,
}
impl Harness {
	pub fn new(dimensions: usize, llm: ScriptedLlm) -> Self {
		Self {
			embedding: Arc::new(FakeEmbedding::new(dimensions)),
			llm: Arc::new(llm),
			vector: Arc::new(MemoryVectorIndex::default()),
			lexical: Arc::new(MemoryLexicalIndex::default()),
			logs: Arc::new(MemoryQueryLogStore::default()),
			users: None,
			metrics: Arc::new(RecordingMetrics::default()),
			lexical_enabled: true,
		}
	}

	pub fn with_users(mut self, users: impl IntoIterator<Item = Uuid>) -> Self {
		self.users = Some(Arc::new(StaticUserDirectory::new(users)));

		self
	}

	pub fn without_lexical(mut self) -> Self {
		self.lexical_enabled = false;

		self
	}

	/// Stores a chunk in both indexes under `user_id`.
	pub fn add_chunk(&self, user_id: Uuid, chunk: NoteChunk, vector: Vec<f32>) {
		self.lexical.insert(user_id, chunk.clone());
		self.vector.insert(user_id, chunk, vector);
	}

	pub fn service(&self, cfg: Config) -> RagService {
		let providers = Providers { embedding: self.embedding.clone(), llm: self.llm.clone() };
		let backends = Backends {
			vector: self.vector.clone(),
			lexical: self
				.lexical_enabled
				.then(|| self.lexical.clone() as Arc<dyn brain_service::LexicalIndex>),
			logs: self.logs.clone(),
			users: self.users.clone().map(|users| users as Arc<dyn brain_service::UserDirectory>),
			metrics: self.metrics.clone(),
		};

		RagService::new(cfg, providers, backends)
	}
}
