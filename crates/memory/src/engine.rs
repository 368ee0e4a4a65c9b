use chrono::Utc;
use murmur_core::{MemoryConfig, Paths, Result};
use murmur_providers::{cosine_similarity, EmbeddingProvider, LanguageModel, LlmRequest, VectorStore};
use murmur_storage::{GraphStore, Journal};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::long_term::LongTermLayer;
use crate::models::{
    BlockMessage, JudgeDecision, MemoryStats, MemoryTier, RetrievedMemory, ShortTermMemory,
};
use crate::ops::parse_judge;
use crate::perceptual::{PerceptualLayer, PerceptualSnapshot};
use crate::retrieval::{is_causal_query, score_memory, RetrievalWeights};
use crate::short_term::ShortTermLayer;

const PROMOTION_QUEUE_CAP: usize = 256;
const PROMOTION_RETRY_CAP: u32 = 3;
const RETRIEVAL_LIMIT: usize = 10;
const SHORT_TERM_SEARCH_K: usize = 5;
const NIGHTLY_SECS: u64 = 86_400;
const DISCOVERY_SECS: u64 = 7_200;
const REINDEX_SECS: u64 = 300;

const JUDGE_PROMPT: &str = "Decide whether the retrieved memories below are enough to answer \
the query.\nReply with JSON: {\"sufficient\": true|false, \"reasoning\": \"...\", \
\"additional_queries\": []}.\n\n";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PromotionItem {
    memory: ShortTermMemory,
    retries: u32,
}

struct Journals {
    perceptual: Journal,
    short_term: Journal,
    promotion: Journal,
}

/// The tiered memory engine: perceptual buffer → structured short-term →
/// graph long-term, with LLM-decided promotion and hybrid retrieval.
pub struct MemoryEngine {
    cfg: MemoryConfig,
    perceptual: Mutex<PerceptualLayer>,
    short_term: Mutex<ShortTermLayer>,
    long_term: LongTermLayer,
    promotion_queue: Mutex<VecDeque<PromotionItem>>,
    journals: Journals,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LanguageModel>,
    weights: RetrievalWeights,
}

impl MemoryEngine {
    pub fn new(
        cfg: MemoryConfig,
        paths: &Paths,
        graph: GraphStore,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn LanguageModel>,
    ) -> Arc<Self> {
        let perceptual = PerceptualLayer::new(&cfg, embedder.clone(), vectors.clone());
        let short_term = ShortTermLayer::new(
            &cfg,
            &cfg.judge_model_name,
            embedder.clone(),
            vectors.clone(),
            llm.clone(),
        );
        let long_term = LongTermLayer::new(
            &cfg,
            &cfg.judge_model_name,
            graph,
            embedder.clone(),
            vectors,
            llm.clone(),
        );
        let journals = Journals {
            perceptual: Journal::new(paths.perceptual_journal()),
            short_term: Journal::new(paths.short_term_journal()),
            promotion: Journal::new(paths.promotion_queue_journal()),
        };

        let engine = Arc::new(Self {
            cfg,
            perceptual: Mutex::new(perceptual),
            short_term: Mutex::new(short_term),
            long_term,
            promotion_queue: Mutex::new(VecDeque::new()),
            journals,
            embedder,
            llm,
            weights: RetrievalWeights::default(),
        });
        engine
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enable
    }

    /// Replay the staging journals written by a previous run.
    pub async fn replay_journals(&self) -> Result<()> {
        if let Some(snapshot) = self.journals.perceptual.load::<PerceptualSnapshot>()? {
            let blocks = snapshot.blocks.len();
            self.perceptual.lock().await.restore(snapshot);
            info!(blocks, "Perceptual journal replayed");
        }
        if let Some(memories) = self.journals.short_term.load::<Vec<ShortTermMemory>>()? {
            let count = memories.len();
            self.short_term.lock().await.restore(memories);
            info!(memories = count, "Short-term journal replayed");
        }
        if let Some(items) = self.journals.promotion.load::<Vec<PromotionItem>>()? {
            let count = items.len();
            *self.promotion_queue.lock().await = items.into_iter().collect();
            info!(items = count, "Promotion queue journal replayed");
        }
        // Journal snapshots carry no embeddings; rebuild them now.
        self.reindex().await?;
        Ok(())
    }

    /// Feed one chat message into the perceptual layer. A closed block is
    /// immediately recalled against the heap, activations bubble blocks up
    /// into short-term extraction, and transfer candidates queue for the
    /// consolidator.
    pub async fn record_message(&self, message: BlockMessage) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let closed = self.perceptual.lock().await.add_message(message).await?;
        let Some(block) = closed else {
            return Ok(());
        };

        let activated = {
            let mut perceptual = self.perceptual.lock().await;
            perceptual.recall(&block.combined_text).await?;
            perceptual.take_activated()
        };
        if !activated.is_empty() {
            let mut short_term = self.short_term.lock().await;
            for block in &activated {
                short_term.ingest_block(block).await?;
            }
        }
        self.enqueue_transfers().await;
        self.persist_staging().await;
        Ok(())
    }

    /// Move over-threshold short-term memories into the bounded promotion
    /// queue, shedding the least important items when full.
    async fn enqueue_transfers(&self) {
        let candidates = self.short_term.lock().await.take_transfer_candidates();
        if candidates.is_empty() {
            return;
        }
        let mut shed: Vec<String> = Vec::new();
        {
            let mut queue = self.promotion_queue.lock().await;
            for memory in candidates {
                queue.push_back(PromotionItem { memory, retries: 0 });
            }
            while queue.len() > PROMOTION_QUEUE_CAP {
                let min_index = queue
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        a.memory
                            .importance
                            .partial_cmp(&b.memory.importance)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i);
                if let Some(index) = min_index {
                    if let Some(item) = queue.remove(index) {
                        warn!(memory = %item.memory.id, "Promotion queue full, shedding low-importance item");
                        shed.push(item.memory.id);
                    }
                } else {
                    break;
                }
            }
        }
        if !shed.is_empty() {
            self.short_term.lock().await.release_promotion(&shed);
        }
    }

    /// Drain one consolidation batch. A failed batch goes back on the queue
    /// with bumped retry counters; items over the cap are dropped with an
    /// error log and released for normal eviction.
    pub async fn drain_promotions(&self) -> Result<usize> {
        // Sweep for memories that crossed the threshold between block
        // closes (merges, decay) so nothing waits longer than one interval.
        self.enqueue_transfers().await;
        let batch: Vec<PromotionItem> = {
            let mut queue = self.promotion_queue.lock().await;
            let take = queue.len().min(self.cfg.long_term_batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let memories: Vec<ShortTermMemory> = batch.iter().map(|i| i.memory.clone()).collect();
        let ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();

        match self.long_term.consolidate(&memories).await {
            Ok(applied) => {
                self.short_term.lock().await.complete_transfer(&ids).await?;
                self.persist_staging().await;
                debug!(batch = ids.len(), applied, "Promotion batch consolidated");
                Ok(ids.len())
            }
            Err(e) => {
                warn!(error = %e, batch = ids.len(), "Consolidation failed, requeueing batch");
                let mut dropped: Vec<String> = Vec::new();
                {
                    let mut queue = self.promotion_queue.lock().await;
                    for mut item in batch {
                        item.retries += 1;
                        if item.retries >= PROMOTION_RETRY_CAP {
                            error!(
                                memory = %item.memory.id,
                                retries = item.retries,
                                "Dropping memory from promotion after repeated failures"
                            );
                            dropped.push(item.memory.id);
                        } else {
                            queue.push_back(item);
                        }
                    }
                }
                if !dropped.is_empty() {
                    self.short_term.lock().await.release_promotion(&dropped);
                }
                self.persist_staging().await;
                Ok(0)
            }
        }
    }

    /// Unified retrieval: staging layers first, the judge decides whether
    /// to expand into the graph, and everything is scored on one scale.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedMemory>> {
        if !self.enabled() {
            return Ok(Vec::new());
        }
        let mut results: Vec<RetrievedMemory> = Vec::new();
        let now_ms = Utc::now().timestamp_millis();

        let perceptual_hits = {
            let mut perceptual = self.perceptual.lock().await;
            let hits = perceptual.recall(query).await?;
            // Recall during retrieval can itself activate blocks.
            let activated = perceptual.take_activated();
            drop(perceptual);
            if !activated.is_empty() {
                let mut short_term = self.short_term.lock().await;
                for block in &activated {
                    short_term.ingest_block(block).await?;
                }
            }
            hits
        };
        for (block, semantic) in &perceptual_hits {
            let age_days = ((now_ms - block.created_at_ms).max(0) as f32) / 86_400_000.0;
            results.push(RetrievedMemory {
                id: block.id.clone(),
                tier: MemoryTier::Perceptual,
                content: block.combined_text.clone(),
                score: score_memory(
                    &self.weights,
                    *semantic,
                    0.5,
                    1,
                    age_days,
                    block.activation_count as i64,
                ),
                graph_distance: 1,
            });
        }

        let short_hits = self.short_term.lock().await.search(query, SHORT_TERM_SEARCH_K).await?;
        for (memory, semantic) in &short_hits {
            let age_days = ((now_ms - memory.created_at_ms).max(0) as f32) / 86_400_000.0;
            results.push(RetrievedMemory {
                id: memory.id.clone(),
                tier: MemoryTier::ShortTerm,
                content: memory.content_text(),
                score: score_memory(
                    &self.weights,
                    *semantic,
                    memory.importance,
                    1,
                    age_days,
                    memory.activation_count as i64,
                ),
                graph_distance: 1,
            });
        }

        let expand = if self.cfg.enable_judge_retrieval {
            let decision = self.judge(query, &results).await;
            debug!(sufficient = decision.sufficient, "Judge decision");
            !decision.sufficient
        } else {
            // Judge disabled: always take the expansion branch.
            true
        };

        if expand {
            self.expand_into_graph(query, now_ms, &mut results).await?;
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(RETRIEVAL_LIMIT);
        Ok(results)
    }

    async fn judge(&self, query: &str, hits: &[RetrievedMemory]) -> JudgeDecision {
        let mut prompt = String::from(JUDGE_PROMPT);
        prompt.push_str(&format!("Query: {}\n\nRetrieved:\n", query));
        if hits.is_empty() {
            prompt.push_str("(nothing)\n");
        }
        for hit in hits {
            prompt.push_str(&format!("- {}\n", hit.content));
        }
        let request = LlmRequest::new(&self.cfg.judge_model_name, &prompt)
            .with_temperature(self.cfg.judge_temperature);
        match self.llm.complete(&request).await {
            Ok(raw) => parse_judge(&raw),
            Err(e) => {
                warn!(error = %e, "Judge call failed, expanding by default");
                JudgeDecision::insufficient("judge call failed")
            }
        }
    }

    async fn expand_into_graph(
        &self,
        query: &str,
        now_ms: i64,
        results: &mut Vec<RetrievedMemory>,
    ) -> Result<()> {
        let query_embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Query embedding failed, skipping graph expansion");
                return Ok(());
            }
        };
        let causal = is_causal_query(query);
        let depth = if causal { 2 } else { 1 };

        let entries = self.long_term.entry_nodes(&query_embedding, 5).await?;
        let expanded = self.long_term.expand(&entries, depth, causal)?;
        let accessed: Vec<String> = expanded.iter().map(|(m, _)| m.id.clone()).collect();
        self.long_term.record_access(&accessed).await?;

        for (memory, distance) in expanded {
            let content = self.long_term.describe(&memory);
            let semantic = match self.embedder.embed(&content).await {
                Ok(embedding) => cosine_similarity(&query_embedding, &embedding),
                Err(_) => 0.0,
            };
            let age_days =
                ((now_ms - memory.created_at.timestamp_millis()).max(0) as f32) / 86_400_000.0;
            results.push(RetrievedMemory {
                id: memory.id.clone(),
                tier: MemoryTier::LongTerm,
                content,
                score: score_memory(
                    &self.weights,
                    semantic,
                    memory.effective_importance(),
                    distance,
                    age_days,
                    memory.access_count,
                ),
                graph_distance: distance,
            });
        }
        Ok(())
    }

    /// Background maintenance until shutdown: promotion draining, decay
    /// passes, relation discovery and embedding reindex.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.enabled() {
            return;
        }
        info!("Memory engine maintenance started");
        let mut transfer = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.long_term_auto_transfer_interval.max(1),
        ));
        let mut decay = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.short_term_decay_interval_secs.max(1),
        ));
        let mut nightly = tokio::time::interval(std::time::Duration::from_secs(NIGHTLY_SECS));
        let mut discovery = tokio::time::interval(std::time::Duration::from_secs(DISCOVERY_SECS));
        let mut reindex = tokio::time::interval(std::time::Duration::from_secs(REINDEX_SECS));
        // The first tick of every interval fires immediately; skip it.
        transfer.tick().await;
        decay.tick().await;
        nightly.tick().await;
        discovery.tick().await;
        reindex.tick().await;

        loop {
            tokio::select! {
                _ = transfer.tick() => {
                    if let Err(e) = self.drain_promotions().await {
                        error!(error = %e, "Promotion drain failed");
                    }
                }
                _ = decay.tick() => {
                    let cutoff = Utc::now().timestamp_millis()
                        - (self.cfg.short_term_decay_interval_secs as i64) * 1000;
                    let decayed = self.short_term.lock().await.apply_decay(cutoff);
                    debug!(decayed, "Short-term decay pass");
                }
                _ = nightly.tick() => {
                    if let Err(e) = self.long_term.nightly_decay() {
                        error!(error = %e, "Long-term decay failed");
                    }
                }
                _ = discovery.tick() => {
                    if let Err(e) = self.long_term.discover_relations(chrono::Duration::hours(6)).await {
                        error!(error = %e, "Relation discovery failed");
                    }
                }
                _ = reindex.tick() => {
                    if let Err(e) = self.reindex().await {
                        error!(error = %e, "Reindex pass failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Memory engine flushing staging journals");
                    self.flush().await;
                    break;
                }
            }
        }
    }

    /// Retry missing embeddings across all tiers.
    pub async fn reindex(&self) -> Result<usize> {
        let mut fixed = self.perceptual.lock().await.reindex().await?;
        fixed += self.short_term.lock().await.reindex().await?;
        fixed += self.long_term.reindex().await?;
        if fixed > 0 {
            info!(fixed, "Reindexed missing embeddings");
        }
        Ok(fixed)
    }

    /// Write the staging journals; failures are logged, never fatal.
    async fn persist_staging(&self) {
        let snapshot = self.perceptual.lock().await.snapshot();
        if let Err(e) = self.journals.perceptual.save(&snapshot) {
            warn!(error = %e, "Perceptual journal write failed");
        }
        let memories = self.short_term.lock().await.snapshot();
        if let Err(e) = self.journals.short_term.save(&memories) {
            warn!(error = %e, "Short-term journal write failed");
        }
        let queue: Vec<PromotionItem> = self.promotion_queue.lock().await.iter().cloned().collect();
        if let Err(e) = self.journals.promotion.save(&queue) {
            warn!(error = %e, "Promotion queue journal write failed");
        }
    }

    pub async fn flush(&self) {
        self.persist_staging().await;
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        let perceptual = self.perceptual.lock().await;
        let (graph_nodes, graph_edges, long_term_memories) = self.long_term.graph().counts()?;
        Ok(MemoryStats {
            perceptual_blocks: perceptual.block_count(),
            perceptual_pending: perceptual.pending_count(),
            perceptual_activated: perceptual.activated_count(),
            short_term_memories: self.short_term.lock().await.len(),
            promotion_queue: self.promotion_queue.lock().await.len(),
            graph_nodes,
            graph_edges,
            long_term_memories,
        })
    }
}
