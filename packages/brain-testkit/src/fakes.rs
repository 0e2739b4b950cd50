//! In-memory stand-ins for every collaborator the retrieval service talks to.

use std::{
	collections::{HashMap, HashSet, hash_map::DefaultHasher},
	hash::{Hash, Hasher},
	sync::{
		Mutex, RwLock,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	time::Duration,
};

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Notify;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use brain_config::{EmbeddingProviderConfig, LlmProviderConfig};
use brain_providers::StructuredRequest;
use brain_service::{
	BoxFuture, EmbeddingProvider, EmbeddingVector, Error, Feedback, IndexHit, LexicalIndex,
	LlmProvider, MetricsSink, QueryLog, QueryLogStore, Result, UserDirectory, VectorIndex,
};

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

type Handler = Box<dyn Fn(&StructuredRequest) -> Result<Value> + Send + Sync>;

/// A chunk of a note as the indexes store it.
#[derive(Debug, Clone)]
pub struct NoteChunk {
	pub note_id: Uuid,
	pub chunk_index: i32,
	pub title: String,
	pub text: String,
	pub tags: Vec<String>,
	pub updated_at: Option<OffsetDateTime>,
}
impl NoteChunk {
	pub fn new(note_id: Uuid, chunk_index: i32, title: &str, text: &str) -> Self {
		Self {
			note_id,
			chunk_index,
			title: title.to_string(),
			text: text.to_string(),
			tags: Vec::new(),
			updated_at: None,
		}
	}

	pub fn with_tags(mut self, tags: &[&str]) -> Self {
		self.tags = tags.iter().map(|tag| tag.to_string()).collect();

		self
	}

	pub fn updated_at(mut self, at: OffsetDateTime) -> Self {
		self.updated_at = Some(at);

		self
	}

	fn hit(&self, score: f32) -> IndexHit {
		IndexHit {
			note_id: self.note_id,
			chunk_index: self.chunk_index,
			text: self.text.clone(),
			title: self.title.clone(),
			tags: self.tags.clone(),
			updated_at: self.updated_at,
			score,
		}
	}
}

/// Embeds text deterministically. Texts registered with [`FakeEmbedding::set_vector`] get that
/// exact vector; everything else gets a hashed bag-of-words vector.
pub struct FakeEmbedding {
	dimensions: usize,
	vectors: Mutex<HashMap<String, Vec<f32>>>,
	calls: AtomicUsize,
	texts_embedded: AtomicUsize,
	failing: AtomicBool,
	delay: Mutex<Option<Duration>>,
}
impl FakeEmbedding {
	pub fn new(dimensions: usize) -> Self {
		Self {
			dimensions,
			vectors: Mutex::new(HashMap::new()),
			calls: AtomicUsize::new(0),
			texts_embedded: AtomicUsize::new(0),
			failing: AtomicBool::new(false),
			delay: Mutex::new(None),
		}
	}

	pub fn set_vector(&self, text: &str, vector: Vec<f32>) {
		lock(&self.vectors).insert(text.trim().to_lowercase(), vector);
	}

	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn set_delay(&self, delay: Option<Duration>) {
		*lock(&self.delay) = delay;
	}

	/// Number of provider calls, each of which may carry several texts.
	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn texts_embedded(&self) -> usize {
		self.texts_embedded.load(Ordering::SeqCst)
	}

	pub fn vector_for(&self, text: &str) -> Vec<f32> {
		let key = text.trim().to_lowercase();

		if let Some(vector) = lock(&self.vectors).get(&key) {
			return vector.clone();
		}

		hashed_vector(&key, self.dimensions)
	}
}
impl EmbeddingProvider for FakeEmbedding {
	fn embed<'a>(
		&'a self,
		_cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
		Box::pin(async move {
			let delay = *lock(&self.delay);

			if let Some(delay) = delay {
				tokio::time::sleep(delay).await;
			}

			self.calls.fetch_add(1, Ordering::SeqCst);

			if self.failing.load(Ordering::SeqCst) {
				return Err(Error::Provider { message: "Embedding backend is down.".to_string() });
			}

			self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);

			Ok(texts.iter().map(|text| self.vector_for(text)).collect())
		})
	}
}

/// Answers structured-output requests through a caller-supplied handler.
pub struct ScriptedLlm {
	handler: Handler,
	calls: Mutex<HashMap<String, usize>>,
	delay: Mutex<Option<Duration>>,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
}
impl ScriptedLlm {
	pub fn new<F>(handler: F) -> Self
	where
		F: Fn(&StructuredRequest) -> Result<Value> + Send + Sync + 'static,
	{
		Self {
			handler: Box::new(handler),
			calls: Mutex::new(HashMap::new()),
			delay: Mutex::new(None),
			in_flight: AtomicUsize::new(0),
			max_in_flight: AtomicUsize::new(0),
		}
	}

	/// Fails every request.
	pub fn unavailable() -> Self {
		Self::new(|request| {
			Err(Error::Provider { message: format!("No script for {}.", request.name) })
		})
	}

	/// Judges relevance by the first keyword found in the prompt. Prompts matching no keyword
	/// fail, which leaves the candidate unscored. Other request kinds fail too.
	pub fn judging(rules: &[(&str, f32)]) -> Self {
		let rules: Vec<(String, f32)> =
			rules.iter().map(|(keyword, score)| (keyword.to_lowercase(), *score)).collect();

		Self::new(move |request| {
			if request.name != "relevance_judgment" {
				return Err(Error::Provider { message: format!("No script for {}.", request.name) });
			}

			let prompt = request.user.to_lowercase();

			rules
				.iter()
				.find(|(keyword, _)| prompt.contains(keyword.as_str()))
				.map(|(keyword, score)| {
					let reasoning = format!("Mentions {keyword}.");

					serde_json::json!({ "score": score, "reasoning": reasoning })
				})
				.ok_or_else(|| Error::Provider { message: "Judge timed out.".to_string() })
		})
	}

	pub fn set_delay(&self, delay: Option<Duration>) {
		*lock(&self.delay) = delay;
	}

	pub fn calls(&self, name: &str) -> usize {
		lock(&self.calls).get(name).copied().unwrap_or(0)
	}

	/// Highest number of requests that were in flight at the same time.
	pub fn max_in_flight(&self) -> usize {
		self.max_in_flight.load(Ordering::SeqCst)
	}
}
impl LlmProvider for ScriptedLlm {
	fn generate_structured<'a>(
		&'a self,
		_cfg: &'a LlmProviderConfig,
		request: &'a StructuredRequest,
	) -> BoxFuture<'a, Result<Value>> {
		Box::pin(async move {
			*lock(&self.calls).entry(request.name.clone()).or_insert(0) += 1;

			let _in_flight = InFlight::enter(&self.in_flight, &self.max_in_flight);
			let delay = *lock(&self.delay);

			if let Some(delay) = delay {
				tokio::time::sleep(delay).await;
			}

			(self.handler)(request)
		})
	}
}

/// Counts a request as in flight until dropped, so timed-out and cancelled calls are released too.
struct InFlight<'a> {
	current: &'a AtomicUsize,
}
impl<'a> InFlight<'a> {
	fn enter(current: &'a AtomicUsize, max: &AtomicUsize) -> Self {
		let now = current.fetch_add(1, Ordering::SeqCst) + 1;

		max.fetch_max(now, Ordering::SeqCst);

		Self { current }
	}
}
impl Drop for InFlight<'_> {
	fn drop(&mut self) {
		self.current.fetch_sub(1, Ordering::SeqCst);
	}
}

struct StoredChunk {
	user_id: Uuid,
	chunk: NoteChunk,
	vector: Vec<f32>,
}

/// Exact cosine search over stored chunks, scoped to one user.
#[derive(Default)]
pub struct MemoryVectorIndex {
	chunks: RwLock<Vec<StoredChunk>>,
	failing: AtomicBool,
	failing_searches: Mutex<HashSet<usize>>,
	delay: Mutex<Option<Duration>>,
	searches: AtomicUsize,
}
impl MemoryVectorIndex {
	pub fn insert(&self, user_id: Uuid, chunk: NoteChunk, vector: Vec<f32>) {
		write(&self.chunks).push(StoredChunk { user_id, chunk, vector });
	}

	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	/// Fails only the `number`-th search (1-based, counted in call order).
	pub fn fail_search(&self, number: usize) {
		lock(&self.failing_searches).insert(number);
	}

	pub fn set_delay(&self, delay: Option<Duration>) {
		*lock(&self.delay) = delay;
	}

	pub fn searches(&self) -> usize {
		self.searches.load(Ordering::SeqCst)
	}
}
impl VectorIndex for MemoryVectorIndex {
	fn search<'a>(
		&'a self,
		vector: &'a EmbeddingVector,
		user_id: Uuid,
		top_k: u32,
		threshold: f32,
	) -> BoxFuture<'a, Result<Vec<IndexHit>>> {
		Box::pin(async move {
			let number = self.searches.fetch_add(1, Ordering::SeqCst) + 1;
			let delay = *lock(&self.delay);

			if let Some(delay) = delay {
				tokio::time::sleep(delay).await;
			}

			let failing = self.failing.load(Ordering::SeqCst)
				|| lock(&self.failing_searches).contains(&number);

			if failing {
				return Err(Error::Qdrant { message: "Vector index is unreachable.".to_string() });
			}

			let chunks = read(&self.chunks);
			let mut hits = Vec::new();

			for stored in chunks.iter().filter(|stored| stored.user_id == user_id) {
				if stored.vector.len() != vector.dimensions() {
					return Err(Error::EmbeddingMismatch {
						message: format!(
							"Query vector has {} dimensions; the index holds {}.",
							vector.dimensions(),
							stored.vector.len()
						),
					});
				}

				let score = cosine(vector.values(), &stored.vector);

				if score >= threshold {
					hits.push(stored.chunk.hit(score));
				}
			}

			hits.sort_by(|a, b| b.score.total_cmp(&a.score));
			hits.truncate(top_k as usize);

			Ok(hits)
		})
	}
}

struct LexicalDoc {
	user_id: Uuid,
	chunk: NoteChunk,
	terms: HashMap<String, usize>,
	length: usize,
}

/// Okapi BM25 over chunk text with Unicode word segmentation. Scores are raw and unbounded.
#[derive(Default)]
pub struct MemoryLexicalIndex {
	docs: RwLock<Vec<LexicalDoc>>,
	failing: AtomicBool,
	delay: Mutex<Option<Duration>>,
	searches: AtomicUsize,
}
impl MemoryLexicalIndex {
	pub fn insert(&self, user_id: Uuid, chunk: NoteChunk) {
		let tokens = tokenize(&chunk.text);
		let length = tokens.len();
		let mut terms = HashMap::new();

		for token in tokens {
			*terms.entry(token).or_insert(0) += 1;
		}

		write(&self.docs).push(LexicalDoc { user_id, chunk, terms, length });
	}

	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn set_delay(&self, delay: Option<Duration>) {
		*lock(&self.delay) = delay;
	}

	pub fn searches(&self) -> usize {
		self.searches.load(Ordering::SeqCst)
	}
}
impl LexicalIndex for MemoryLexicalIndex {
	fn search<'a>(
		&'a self,
		text: &'a str,
		user_id: Uuid,
		top_k: u32,
	) -> BoxFuture<'a, Result<Vec<IndexHit>>> {
		Box::pin(async move {
			self.searches.fetch_add(1, Ordering::SeqCst);

			let delay = *lock(&self.delay);

			if let Some(delay) = delay {
				tokio::time::sleep(delay).await;
			}
			if self.failing.load(Ordering::SeqCst) {
				return Err(Error::Qdrant { message: "Lexical index is unreachable.".to_string() });
			}

			let docs = read(&self.docs);
			let user_docs: Vec<&LexicalDoc> =
				docs.iter().filter(|doc| doc.user_id == user_id).collect();

			if user_docs.is_empty() {
				return Ok(Vec::new());
			}

			let doc_count = user_docs.len() as f32;
			let avg_len =
				user_docs.iter().map(|doc| doc.length).sum::<usize>() as f32 / doc_count;
			let query_terms: HashSet<String> = tokenize(text).into_iter().collect();
			let mut hits = Vec::new();

			for doc in &user_docs {
				let mut score = 0.0;

				for term in &query_terms {
					let Some(tf) = doc.terms.get(term) else {
						continue;
					};
					let containing =
						user_docs.iter().filter(|other| other.terms.contains_key(term)).count();
					let idf = ((doc_count - containing as f32 + 0.5) / (containing as f32 + 0.5)
						+ 1.0)
						.ln();
					let tf = *tf as f32;
					let norm = 1.0 - BM25_B + BM25_B * doc.length as f32 / avg_len.max(1.0);

					score += idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
				}

				if score > 0.0 {
					hits.push(doc.chunk.hit(score));
				}
			}

			hits.sort_by(|a, b| b.score.total_cmp(&a.score));
			hits.truncate(top_k as usize);

			Ok(hits)
		})
	}
}

/// Keeps query logs in memory and lets tests wait for the background append.
#[derive(Default)]
pub struct MemoryQueryLogStore {
	logs: Mutex<Vec<QueryLog>>,
	appended: Notify,
	failing: AtomicBool,
	append_delay: Mutex<Option<Duration>>,
}
impl MemoryQueryLogStore {
	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn set_append_delay(&self, delay: Option<Duration>) {
		*lock(&self.append_delay) = delay;
	}

	pub fn logs(&self) -> Vec<QueryLog> {
		lock(&self.logs).clone()
	}

	/// Waits until at least `len` logs exist or `timeout` passes, then returns what is there.
	pub async fn wait_for_len(&self, len: usize, timeout: Duration) -> Vec<QueryLog> {
		let deadline = tokio::time::Instant::now() + timeout;

		loop {
			let appended = self.appended.notified();
			let logs = self.logs();

			if logs.len() >= len {
				return logs;
			}
			if tokio::time::timeout_at(deadline, appended).await.is_err() {
				return self.logs();
			}
		}
	}
}
impl QueryLogStore for MemoryQueryLogStore {
	fn append<'a>(&'a self, log: &'a QueryLog) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let delay = *lock(&self.append_delay);

			if let Some(delay) = delay {
				tokio::time::sleep(delay).await;
			}
			if self.failing.load(Ordering::SeqCst) {
				return Err(Error::Storage { message: "Log store is read-only.".to_string() });
			}

			lock(&self.logs).push(log.clone());
			self.appended.notify_waiters();

			Ok(())
		})
	}

	fn attach_feedback<'a>(
		&'a self,
		log_id: Uuid,
		feedback: &'a Feedback,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let mut logs = lock(&self.logs);
			let Some(log) = logs.iter_mut().find(|log| log.log_id == log_id) else {
				return Err(Error::NotFound { message: format!("Query log {log_id} not found.") });
			};

			log.feedback = Some(feedback.clone());

			Ok(())
		})
	}

	fn list_since<'a>(&'a self, since: OffsetDateTime) -> BoxFuture<'a, Result<Vec<QueryLog>>> {
		Box::pin(async move {
			let mut logs: Vec<QueryLog> =
				lock(&self.logs).iter().filter(|log| log.created_at >= since).cloned().collect();

			logs.sort_by_key(|log| log.created_at);

			Ok(logs)
		})
	}
}

pub struct StaticUserDirectory {
	users: HashSet<Uuid>,
	failing: AtomicBool,
}
impl StaticUserDirectory {
	pub fn new(users: impl IntoIterator<Item = Uuid>) -> Self {
		Self { users: users.into_iter().collect(), failing: AtomicBool::new(false) }
	}

	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}
}
impl UserDirectory for StaticUserDirectory {
	fn user_exists<'a>(&'a self, user_id: Uuid) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move {
			if self.failing.load(Ordering::SeqCst) {
				return Err(Error::Storage { message: "User directory is down.".to_string() });
			}

			Ok(self.users.contains(&user_id))
		})
	}
}

#[derive(Default)]
pub struct RecordingMetrics {
	counters: Mutex<HashMap<String, u64>>,
	timings: Mutex<Vec<(String, u64)>>,
}
impl RecordingMetrics {
	pub fn count(&self, name: &str) -> u64 {
		lock(&self.counters).get(name).copied().unwrap_or(0)
	}

	pub fn observed(&self, name: &str) -> bool {
		lock(&self.timings).iter().any(|(observed, _)| observed == name)
	}
}
impl MetricsSink for RecordingMetrics {
	fn increment(&self, name: &str, by: u64) {
		*lock(&self.counters).entry(name.to_string()).or_insert(0) += by;
	}

	fn observe_ms(&self, name: &str, ms: u64) {
		lock(&self.timings).push((name.to_string(), ms));
	}
}

/// Unit-length vector at `cosine` from `[1, 0, 0, ...]`, so a query embedded as the first axis
/// scores exactly `cosine` against it.
pub fn vector_at_cosine(cosine: f32, dimensions: usize) -> Vec<f32> {
	let mut vector = vec![0.0; dimensions.max(2)];

	vector[0] = cosine;
	vector[1] = (1.0 - cosine * cosine).max(0.0).sqrt();

	vector
}

pub fn axis(dimensions: usize) -> Vec<f32> {
	let mut vector = vec![0.0; dimensions];

	if let Some(first) = vector.first_mut() {
		*first = 1.0;
	}

	vector
}

fn tokenize(text: &str) -> Vec<String> {
	text.unicode_words().map(str::to_lowercase).collect()
}

fn hashed_vector(text: &str, dimensions: usize) -> Vec<f32> {
	let mut vector = vec![0.0_f32; dimensions];

	if dimensions == 0 {
		return vector;
	}

	for word in text.unicode_words() {
		let mut hasher = DefaultHasher::new();

		word.hash(&mut hasher);

		vector[(hasher.finish() % dimensions as u64) as usize] += 1.0;
	}

	let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();

	if norm == 0.0 {
		vector[0] = 1.0;

		return vector;
	}

	vector.iter().map(|value| value / norm).collect()
}

fn cosine(left: &[f32], right: &[f32]) -> f32 {
	let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
	let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
	let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();

	if left_norm == 0.0 || right_norm == 0.0 {
		return 0.0;
	}

	dot / (left_norm * right_norm)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|err| err.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
	lock.read().unwrap_or_else(|err| err.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
	lock.write().unwrap_or_else(|err| err.into_inner())
}
