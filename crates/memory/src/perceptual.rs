use murmur_core::{MemoryConfig, Result};
use murmur_providers::{EmbeddingProvider, VectorStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{BlockMessage, MemoryBlock, PERCEPTUAL_COLLECTION};

/// Global FIFO heap of message blocks, newest first.
///
/// Not internally synchronized: the engine owns it behind a lock.
pub struct PerceptualLayer {
    max_blocks: usize,
    block_size: usize,
    top_k: usize,
    similarity_threshold: f32,
    activation_threshold: u32,
    blocks: VecDeque<MemoryBlock>,
    /// Per-stream open buffers; a block only ever aggregates messages from
    /// one stream.
    pending: HashMap<String, Vec<BlockMessage>>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
}

/// Journal snapshot of the layer's state (embeddings live in the vector
/// store and are rebuilt by the reindex pass).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerceptualSnapshot {
    pub blocks: Vec<MemoryBlock>,
    pub pending: HashMap<String, Vec<BlockMessage>>,
}

impl PerceptualLayer {
    pub fn new(
        cfg: &MemoryConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            max_blocks: cfg.perceptual_max_blocks,
            block_size: cfg.perceptual_block_size,
            top_k: cfg.perceptual_topk,
            similarity_threshold: cfg.perceptual_similarity_threshold,
            activation_threshold: cfg.activation_threshold,
            blocks: VecDeque::new(),
            pending: HashMap::new(),
            embedder,
            vectors,
        }
    }

    /// Append a message to its stream's open block. Closes the block at
    /// exactly `block_size` messages; message K+1 opens a new block.
    pub async fn add_message(&mut self, message: BlockMessage) -> Result<Option<MemoryBlock>> {
        let stream = message.stream_key.clone();
        let buffer = self.pending.entry(stream.clone()).or_default();
        buffer.push(message);
        if buffer.len() < self.block_size {
            return Ok(None);
        }
        let messages: Vec<BlockMessage> = buffer.drain(..self.block_size).collect();
        let block = self.close_block(&stream, messages).await?;
        Ok(Some(block))
    }

    async fn close_block(
        &mut self,
        stream: &str,
        messages: Vec<BlockMessage>,
    ) -> Result<MemoryBlock> {
        let mut block = MemoryBlock::new(stream, messages);

        // An embedding failure leaves the block un-retrievable until the
        // reindex pass catches it; the block itself still enters the heap.
        match self.embedder.embed(&block.combined_text).await {
            Ok(embedding) => {
                self.vectors
                    .upsert(PERCEPTUAL_COLLECTION, &block.id, &embedding)
                    .await?;
                block.has_embedding = true;
            }
            Err(e) => {
                warn!(block = %block.id, error = %e, "Block embedding failed, leaving for reindex");
            }
        }

        self.blocks.push_front(block.clone());
        while self.blocks.len() > self.max_blocks {
            if let Some(evicted) = self.blocks.pop_back() {
                debug!(block = %evicted.id, "FIFO eviction from perceptual heap");
                self.vectors
                    .remove(PERCEPTUAL_COLLECTION, &evicted.id)
                    .await?;
            }
        }
        info!(
            block = %block.id,
            stream,
            heap = self.blocks.len(),
            "Perceptual block closed"
        );
        Ok(block)
    }

    /// Top-K recall above the similarity threshold, best first. Every hit's
    /// activation count is incremented; hits crossing the activation
    /// threshold are flagged for promotion.
    pub async fn recall(&mut self, query_text: &str) -> Result<Vec<(MemoryBlock, f32)>> {
        let embedding = match self.embedder.embed(query_text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Query embedding failed, perceptual recall empty");
                return Ok(Vec::new());
            }
        };
        let hits = self
            .vectors
            .search(
                PERCEPTUAL_COLLECTION,
                &embedding,
                self.top_k,
                self.similarity_threshold,
            )
            .await?;

        let mut recalled = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(block) = self.blocks.iter_mut().find(|b| b.id == hit.id) {
                block.activation_count += 1;
                if block.activation_count >= self.activation_threshold && !block.promoted {
                    info!(
                        block = %block.id,
                        activation = block.activation_count,
                        "Perceptual block activated"
                    );
                }
                recalled.push((block.clone(), hit.score));
            }
        }
        Ok(recalled)
    }

    /// Blocks whose activation crossed the threshold and are not yet
    /// scheduled. Marks them scheduled; they stay in the heap until FIFO
    /// eviction.
    pub fn take_activated(&mut self) -> Vec<MemoryBlock> {
        let threshold = self.activation_threshold;
        let mut activated = Vec::new();
        for block in self.blocks.iter_mut() {
            if block.activation_count >= threshold && !block.promoted {
                block.promoted = true;
                activated.push(block.clone());
            }
        }
        activated
    }

    /// Retry embeddings for blocks that missed theirs.
    pub async fn reindex(&mut self) -> Result<usize> {
        let mut fixed = 0;
        for block in self.blocks.iter_mut().filter(|b| !b.has_embedding) {
            match self.embedder.embed(&block.combined_text).await {
                Ok(embedding) => {
                    self.vectors
                        .upsert(PERCEPTUAL_COLLECTION, &block.id, &embedding)
                        .await?;
                    block.has_embedding = true;
                    fixed += 1;
                }
                Err(e) => {
                    debug!(block = %block.id, error = %e, "Reindex attempt failed");
                }
            }
        }
        Ok(fixed)
    }

    pub fn snapshot(&self) -> PerceptualSnapshot {
        PerceptualSnapshot {
            blocks: self.blocks.iter().cloned().collect(),
            pending: self.pending.clone(),
        }
    }

    /// Restore from a journal snapshot; embeddings rebuild via `reindex`.
    pub fn restore(&mut self, snapshot: PerceptualSnapshot) {
        self.blocks = snapshot.blocks.into_iter().collect();
        for block in self.blocks.iter_mut() {
            block.has_embedding = false;
        }
        self.pending = snapshot.pending;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }

    pub fn activated_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.activation_count >= self.activation_threshold)
            .count()
    }

    pub fn get_block(&self, id: &str) -> Option<&MemoryBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }
}
