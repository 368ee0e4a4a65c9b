use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub three_tier_memory: MemoryConfig,
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub dependency_management: DependencyConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Over-capacity enqueues wait until the queue drains.
    Block,
    /// Over-capacity enqueues are dropped and counted.
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_overflow_policy")]
    pub overflow_policy: OverflowPolicy,
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_overflow_policy() -> OverflowPolicy {
    OverflowPolicy::Block
}

fn default_api_timeout_secs() -> u64 {
    10
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow_policy: default_overflow_policy(),
            api_timeout_secs: default_api_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_perceptual_max_blocks")]
    pub perceptual_max_blocks: usize,
    #[serde(default = "default_perceptual_block_size")]
    pub perceptual_block_size: usize,
    #[serde(default = "default_perceptual_similarity_threshold")]
    pub perceptual_similarity_threshold: f32,
    #[serde(default = "default_perceptual_topk")]
    pub perceptual_topk: usize,
    #[serde(default = "default_short_term_max_memories")]
    pub short_term_max_memories: usize,
    #[serde(default = "default_short_term_transfer_threshold")]
    pub short_term_transfer_threshold: f32,
    #[serde(default = "default_short_term_decay_factor")]
    pub short_term_decay_factor: f32,
    #[serde(default = "default_short_term_decay_interval_secs")]
    pub short_term_decay_interval_secs: u64,
    #[serde(default = "default_activation_threshold")]
    pub activation_threshold: u32,
    #[serde(default = "default_long_term_batch_size")]
    pub long_term_batch_size: usize,
    #[serde(default = "default_long_term_decay_factor")]
    pub long_term_decay_factor: f32,
    #[serde(default = "default_long_term_auto_transfer_interval")]
    pub long_term_auto_transfer_interval: u64,
    #[serde(default = "default_judge_model_name")]
    pub judge_model_name: String,
    #[serde(default = "default_judge_temperature")]
    pub judge_temperature: f32,
    #[serde(default = "default_true")]
    pub enable_judge_retrieval: bool,
}

fn default_true() -> bool {
    true
}

fn default_perceptual_max_blocks() -> usize {
    50
}

fn default_perceptual_block_size() -> usize {
    5
}

fn default_perceptual_similarity_threshold() -> f32 {
    0.55
}

fn default_perceptual_topk() -> usize {
    3
}

fn default_short_term_max_memories() -> usize {
    100
}

fn default_short_term_transfer_threshold() -> f32 {
    0.6
}

fn default_short_term_decay_factor() -> f32 {
    0.98
}

fn default_short_term_decay_interval_secs() -> u64 {
    300
}

fn default_activation_threshold() -> u32 {
    3
}

fn default_long_term_batch_size() -> usize {
    10
}

fn default_long_term_decay_factor() -> f32 {
    0.95
}

fn default_long_term_auto_transfer_interval() -> u64 {
    600
}

fn default_judge_model_name() -> String {
    "judge-mini".to_string()
}

fn default_judge_temperature() -> f32 {
    0.2
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            perceptual_max_blocks: default_perceptual_max_blocks(),
            perceptual_block_size: default_perceptual_block_size(),
            perceptual_similarity_threshold: default_perceptual_similarity_threshold(),
            perceptual_topk: default_perceptual_topk(),
            short_term_max_memories: default_short_term_max_memories(),
            short_term_transfer_threshold: default_short_term_transfer_threshold(),
            short_term_decay_factor: default_short_term_decay_factor(),
            short_term_decay_interval_secs: default_short_term_decay_interval_secs(),
            activation_threshold: default_activation_threshold(),
            long_term_batch_size: default_long_term_batch_size(),
            long_term_decay_factor: default_long_term_decay_factor(),
            long_term_auto_transfer_interval: default_long_term_auto_transfer_interval(),
            judge_model_name: default_judge_model_name(),
            judge_temperature: default_judge_temperature(),
            enable_judge_retrieval: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PermissionConfig {
    /// `[[platform, user_id], ...]` — users who bypass every permission check.
    #[serde(default)]
    pub master_users: Vec<(String, String)>,
}

impl PermissionConfig {
    pub fn is_master(&self, platform: &str, user_id: &str) -> bool {
        self.master_users
            .iter()
            .any(|(p, u)| p == platform && u == user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    #[serde(default)]
    pub auto_install: bool,
    #[serde(default = "default_auto_install_timeout")]
    pub auto_install_timeout: u64,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub proxy_url: String,
    /// Package names permitted for automatic installation. Empty means all.
    #[serde(default)]
    pub allowed_auto_install: Vec<String>,
}

fn default_auto_install_timeout() -> u64 {
    300
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            auto_install: false,
            auto_install_timeout: default_auto_install_timeout(),
            use_proxy: false,
            proxy_url: String::new(),
            allowed_auto_install: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default = "default_reply_model")]
    pub model_name: String,
    #[serde(default = "default_reply_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    /// Group messages scoring below this interest value are ignored.
    #[serde(default = "default_interest_threshold")]
    pub interest_threshold: f32,
}

fn default_reply_model() -> String {
    "chat-main".to_string()
}

fn default_reply_temperature() -> f32 {
    0.7
}

fn default_max_context_messages() -> usize {
    20
}

fn default_interest_threshold() -> f32 {
    0.3
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            model_name: default_reply_model(),
            temperature: default_reply_temperature(),
            max_context_messages: default_max_context_messages(),
            interest_threshold: default_interest_threshold(),
        }
    }
}
