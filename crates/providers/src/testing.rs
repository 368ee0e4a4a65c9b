//! Deterministic doubles for the provider seams, shared by tests across the
//! workspace and usable as an offline default wiring.

use async_trait::async_trait;
use murmur_core::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::{cosine_similarity, EmbeddingProvider, LanguageModel, LlmRequest, VectorHit, VectorStore};

/// A language model that replays a queue of canned responses, then falls back
/// to a fixed default. Records every prompt it sees.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    default_response: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(default_response: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: default_response.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: &str) {
        self.responses
            .lock()
            .expect("scripted model poisoned")
            .push_back(response.to_string());
    }

    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("scripted model poisoned").clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        self.prompts
            .lock()
            .expect("scripted model poisoned")
            .push(request.prompt.clone());
        let next = self
            .responses
            .lock()
            .expect("scripted model poisoned")
            .pop_front();
        Ok(next.unwrap_or_else(|| self.default_response.clone()))
    }
}

/// A language model that always fails, for exercising failure semantics.
pub struct FailingModel;

#[async_trait]
impl LanguageModel for FailingModel {
    async fn complete(&self, _request: &LlmRequest) -> Result<String> {
        Err(Error::Provider("scripted failure".to_string()))
    }
}

/// Bag-of-words hashing embedder: identical texts embed identically, texts
/// sharing words land close in cosine space. Deterministic, no I/O.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dims];
        for word in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let h = hasher.finish();
            vector[(h as usize) % self.dims] += 1.0;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// In-memory cosine index keyed by collection.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: Mutex<HashMap<String, HashMap<String, Vec<f32>>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .expect("vector store poisoned")
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, collection: &str, id: &str, embedding: &[f32]) -> Result<()> {
        self.collections
            .lock()
            .expect("vector store poisoned")
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), embedding.to_vec());
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<()> {
        if let Some(items) = self
            .collections
            .lock()
            .expect("vector store poisoned")
            .get_mut(collection)
        {
            items.remove(id);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<VectorHit>> {
        let collections = self.collections.lock().expect("vector store poisoned");
        let mut hits: Vec<VectorHit> = collections
            .get(collection)
            .map(|items| {
                items
                    .iter()
                    .map(|(id, emb)| VectorHit {
                        id: id.clone(),
                        score: cosine_similarity(query, emb),
                    })
                    .filter(|hit| hit.score >= min_score)
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}
